//! Coordination loop
//!
//! The single owner of playback state and the only caller of the session
//! engine's control surface. Other threads never touch that state; they
//! raise events through a [`Notifier`], which sets a flag in a shared inbox
//! under one mutex and wakes the loop through a condition variable.
//!
//! Each iteration takes the whole inbox at once and handles it in a fixed
//! order:
//!
//! 1. login failure or interrupt (ends the loop)
//! 2. end of track
//! 3. playback preempted by another client
//! 4. the pending command
//! 5. metadata ready
//! 6. drain the engine's internal work
//!
//! Events raised while an iteration runs are picked up by the next one.

pub mod hooks;
pub mod signals;

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::audio::SharedRelayQueue;
use crate::constants::MAX_DRAIN_ROUNDS;
use crate::error::{Result, SessionError};
use crate::network::CommandServer;
use crate::protocol::{Command, CommandKind};
use crate::session::{NextPoll, SessionEngine, TrackHandle, TrackStatus};

pub use hooks::SessionHooks;
pub use signals::SignalRelay;

/// Events raised since the loop last looked
#[derive(Debug, Default)]
struct Inbox {
    notify_pending: bool,
    /// Handle id of the track the engine reported as finished
    playback_ended: Option<u64>,
    playback_preempted: bool,
    metadata_ready: bool,
    interrupted: bool,
    login_failure: Option<SessionError>,
    /// Single slot: a newer command replaces one not yet dispatched
    pending_command: Option<Command>,
}

impl Inbox {
    fn is_raised(&self) -> bool {
        self.notify_pending
            || self.playback_ended.is_some()
            || self.playback_preempted
            || self.metadata_ready
            || self.interrupted
            || self.login_failure.is_some()
            || self.pending_command.is_some()
    }
}

struct Shared {
    inbox: Mutex<Inbox>,
    wakeup: Condvar,
    superseded_commands: AtomicU64,
}

/// Cloneable handle for raising events from any thread.
///
/// Every method only takes the inbox lock for the duration of a flag update
/// and never waits, so it is safe to call from real-time callback threads.
#[derive(Clone)]
pub struct Notifier {
    shared: Arc<Shared>,
}

impl Notifier {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                inbox: Mutex::new(Inbox::default()),
                wakeup: Condvar::new(),
                superseded_commands: AtomicU64::new(0),
            }),
        }
    }

    fn raise(&self, update: impl FnOnce(&mut Inbox)) {
        let mut inbox = self.shared.inbox.lock();
        update(&mut inbox);
        self.shared.wakeup.notify_one();
    }

    /// The engine asks to be polled
    pub fn notify(&self) {
        self.raise(|inbox| inbox.notify_pending = true);
    }

    /// The track loaded from handle `track_id` reached its end
    pub fn playback_ended(&self, track_id: u64) {
        self.raise(|inbox| inbox.playback_ended = Some(track_id));
    }

    pub fn playback_preempted(&self) {
        self.raise(|inbox| inbox.playback_preempted = true);
    }

    pub fn metadata_ready(&self) {
        self.raise(|inbox| inbox.metadata_ready = true);
    }

    /// Request shutdown
    pub fn interrupt(&self) {
        self.raise(|inbox| inbox.interrupted = true);
    }

    pub fn login_failed(&self, error: SessionError) {
        self.raise(|inbox| inbox.login_failure = Some(error));
    }

    /// Hand a parsed client command to the loop.
    ///
    /// If an earlier command has not been dispatched yet it is dropped.
    pub fn submit(&self, command: Command) {
        self.raise(|inbox| {
            if let Some(previous) = inbox.pending_command.replace(command) {
                self.shared.superseded_commands.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Command {:?} superseded before dispatch", previous);
            }
        });
    }

    /// Commands dropped because a newer one arrived first
    pub fn superseded_commands(&self) -> u64 {
        self.shared.superseded_commands.load(Ordering::Relaxed)
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Track slots owned by the loop
#[derive(Debug, Default)]
pub struct PlaybackSession {
    current_track: Option<TrackHandle>,
    /// Resolved but waiting for metadata
    queued_track: Option<TrackHandle>,
}

impl PlaybackSession {
    pub fn current(&self) -> Option<&TrackHandle> {
        self.current_track.as_ref()
    }

    pub fn queued(&self) -> Option<&TrackHandle> {
        self.queued_track.as_ref()
    }
}

/// What the caller of [`CoordinationLoop::iterate`] should do next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    /// Interrupt received
    Shutdown,
    /// Login failed; nothing can be played
    LoginFailed(SessionError),
}

/// The main loop
pub struct CoordinationLoop<E: SessionEngine> {
    shared: Arc<Shared>,
    engine: E,
    relay: SharedRelayQueue,
    session: PlaybackSession,
    server: Option<CommandServer>,
    /// Re-poll deadline requested by the engine
    timer: Option<Instant>,
}

impl<E: SessionEngine> CoordinationLoop<E> {
    pub fn new(notifier: &Notifier, engine: E, relay: SharedRelayQueue) -> Self {
        Self {
            shared: notifier.shared.clone(),
            engine,
            relay,
            session: PlaybackSession::default(),
            server: None,
            timer: None,
        }
    }

    /// Server to stop as part of shutdown
    pub fn attach_server(&mut self, server: CommandServer) {
        self.server = Some(server);
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn session(&self) -> &PlaybackSession {
        &self.session
    }

    /// Whether the engine asked for a timed re-poll
    pub fn timer_armed(&self) -> bool {
        self.timer.is_some()
    }

    /// Run until interrupted, then shut down.
    ///
    /// Shutdown stops playback, stops the attached server (blocking until
    /// its threads exit) and releases the engine.
    pub fn run(&mut self) -> Result<()> {
        tracing::info!("Coordination loop started");

        let outcome = loop {
            match self.iterate() {
                LoopControl::Continue => {}
                LoopControl::Shutdown => break Ok(()),
                LoopControl::LoginFailed(e) => break Err(e.into()),
            }
        };

        self.shutdown();
        outcome
    }

    /// Wait for events and handle one batch of them
    pub fn iterate(&mut self) -> LoopControl {
        let events = self.wait_for_events();

        if let Some(error) = events.login_failure {
            tracing::error!("{}", error);
            return LoopControl::LoginFailed(error);
        }

        if events.interrupted {
            tracing::info!("Interrupted, shutting down");
            return LoopControl::Shutdown;
        }

        if let Some(track_id) = events.playback_ended {
            self.track_ended(track_id);
        }

        if events.playback_preempted {
            tracing::warn!("Playback was taken over by another client");
            self.stop_playback();
        }

        if let Some(command) = events.pending_command {
            self.dispatch(command);
        }

        if events.metadata_ready {
            self.metadata_updated();
        }

        self.drain_engine();
        LoopControl::Continue
    }

    fn wait_for_events(&mut self) -> Inbox {
        let mut inbox = self.shared.inbox.lock();

        match self.timer {
            None => {
                while !inbox.is_raised() {
                    self.shared.wakeup.wait(&mut inbox);
                }
            }
            Some(deadline) => {
                while !inbox.is_raised() {
                    // Expiry counts as a notification
                    if self.shared.wakeup.wait_until(&mut inbox, deadline).timed_out() {
                        break;
                    }
                }
            }
        }

        std::mem::take(&mut *inbox)
    }

    fn drain_engine(&mut self) {
        self.timer = None;

        for _ in 0..MAX_DRAIN_ROUNDS {
            match self.engine.process_pending_events() {
                NextPoll::Immediately => {}
                // A zero delay would only expire straight away
                NextPoll::After(delay) if delay.is_zero() => {}
                NextPoll::After(delay) => {
                    self.timer = Some(Instant::now() + delay);
                    return;
                }
                NextPoll::OnNotify => return,
            }
        }

        tracing::debug!("Engine still busy after {} rounds", MAX_DRAIN_ROUNDS);
        self.timer = Some(Instant::now());
    }

    fn dispatch(&mut self, command: Command) {
        match command.kind {
            CommandKind::PlayTrack => {
                let link = command.link().unwrap_or_default();
                self.play_link(link);
            }
        }
    }

    fn play_link(&mut self, link: &str) {
        let track = match self.engine.resolve_track(link) {
            Ok(track) => track,
            Err(e) => {
                tracing::warn!("Failed trying to play {:?}: {}", link, e);
                return;
            }
        };

        self.stop_playback();
        tracing::info!("Loading {:?}...", link);

        match self.engine.track_status(&track) {
            TrackStatus::Ready => self.start(track),
            TrackStatus::Loading => {
                tracing::info!("Loading metadata for {:?}...", link);
                self.session.queued_track = Some(track);
            }
            TrackStatus::Failed => {
                tracing::warn!("Failed trying to play {:?}", link);
                self.engine.release(track);
            }
        }
    }

    fn start(&mut self, track: TrackHandle) {
        let name = self
            .engine
            .track_name(&track)
            .unwrap_or_else(|| track.link().to_string());

        if let Err(e) = self.engine.load(&track) {
            tracing::warn!("Failed trying to play {:?}: {}", name, e);
            self.engine.release(track);
            return;
        }

        self.engine.play(true);
        tracing::info!("Now playing {:?}...", name);
        self.session.current_track = Some(track);
    }

    fn metadata_updated(&mut self) {
        let Some(track) = self.session.queued_track.take() else {
            return;
        };

        match self.engine.track_status(&track) {
            TrackStatus::Ready => {
                tracing::debug!("Metadata updated, starting playback");
                self.start(track);
            }
            TrackStatus::Loading => self.session.queued_track = Some(track),
            TrackStatus::Failed => {
                tracing::warn!("Failed trying to play {:?}", track.link());
                self.engine.release(track);
            }
        }
    }

    fn track_ended(&mut self, track_id: u64) {
        if self.session.current().map(TrackHandle::id) != Some(track_id) {
            tracing::debug!("Ignoring end of track {}, no longer current", track_id);
            return;
        }
        let Some(track) = self.session.current_track.take() else {
            return;
        };

        let name = self
            .engine
            .track_name(&track)
            .unwrap_or_else(|| track.link().to_string());
        tracing::info!("{:?} ended", name);

        self.engine.unload();
        self.engine.release(track);
    }

    /// Flush relayed audio and drop both track slots
    fn stop_playback(&mut self) {
        let dropped = self.relay.flush();
        if dropped > 0 {
            tracing::debug!("Flushed {} queued audio frame(s)", dropped);
        }

        if let Some(track) = self.session.current_track.take() {
            self.engine.unload();
            self.engine.release(track);
        }
        if let Some(track) = self.session.queued_track.take() {
            self.engine.release(track);
        }
    }

    fn shutdown(&mut self) {
        self.stop_playback();

        if let Some(mut server) = self.server.take() {
            server.stop();
        }

        self.engine.shutdown();
        tracing::info!("Coordination loop stopped");
    }
}
