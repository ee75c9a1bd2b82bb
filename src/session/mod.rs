//! Session engine interface
//!
//! The engine resolves links, fetches metadata, decodes and produces PCM.
//! The daemon talks to it through two seams:
//!
//! - [`SessionEngine`], the control surface. Only the coordination thread
//!   calls it.
//! - [`SessionObserver`], callbacks the engine raises from its own threads.
//!   Implementations must never block and never call back into the control
//!   surface.

pub mod simulated;

use std::fmt;
use std::time::Duration;

use crate::audio::AudioFrame;
use crate::error::SessionError;

pub use simulated::SimulatedEngine;

/// Account credentials passed to [`SessionEngine::login`]
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Owned reference to a resolved track.
///
/// Not `Clone`: [`SessionEngine::release`] consumes it, so each handle is
/// released exactly once.
#[derive(Debug, PartialEq, Eq)]
pub struct TrackHandle {
    id: u64,
    link: String,
}

impl TrackHandle {
    pub fn new(id: u64, link: impl Into<String>) -> Self {
        Self {
            id,
            link: link.into(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Link the handle was resolved from
    pub fn link(&self) -> &str {
        &self.link
    }
}

/// Playability of a resolved track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackStatus {
    /// Metadata is available, the track can be loaded
    Ready,
    /// Metadata is still being fetched; `on_metadata_ready` follows
    Loading,
    /// The track can never be played
    Failed,
}

/// When the engine wants `process_pending_events` called again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextPoll {
    /// More work is ready right now
    Immediately,
    /// Nothing ready; poll again after this long even without a notification
    After(Duration),
    /// Nothing scheduled; wait for `on_attention_needed`
    OnNotify,
}

/// Control surface of the session engine
pub trait SessionEngine: Send {
    /// Start logging in. The result arrives through `on_login_result`.
    fn login(&mut self, credentials: &Credentials) -> Result<(), SessionError>;

    /// Resolve a link to a track handle
    fn resolve_track(&mut self, link: &str) -> Result<TrackHandle, SessionError>;

    fn track_status(&self, track: &TrackHandle) -> TrackStatus;

    /// Display name, once metadata is available
    fn track_name(&self, track: &TrackHandle) -> Option<String>;

    /// Prepare the player for `track`; it must be [`TrackStatus::Ready`]
    fn load(&mut self, track: &TrackHandle) -> Result<(), SessionError>;

    /// Start or pause delivery of the loaded track
    fn play(&mut self, play: bool);

    /// Tear down the player pipeline
    fn unload(&mut self);

    /// Drop a track handle
    fn release(&mut self, track: TrackHandle);

    /// Run one batch of internal work
    fn process_pending_events(&mut self) -> NextPoll;

    /// Release all global engine resources
    fn shutdown(&mut self);
}

/// Callbacks raised on engine-owned threads
pub trait SessionObserver: Send + Sync {
    /// The engine has work for `process_pending_events`
    fn on_attention_needed(&self);

    /// Decoded audio. Returns the number of frames accepted; zero means the
    /// engine must redeliver later.
    fn on_audio_frame(&self, frame: AudioFrame) -> usize;

    /// The loaded track played to its end. `track_id` is the id of the
    /// [`TrackHandle`] it was loaded from, so a late end for a track that has
    /// since been replaced can be told apart.
    fn on_track_ended(&self, track_id: u64);

    /// Metadata for some resolved track became available
    fn on_metadata_ready(&self);

    /// Another client took over playback on this account
    fn on_playback_preempted(&self);

    fn on_login_result(&self, result: Result<(), SessionError>);

    fn on_log_message(&self, message: &str) {
        tracing::debug!("{}", message.trim_end());
    }
}
