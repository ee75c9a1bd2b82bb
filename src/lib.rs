//! # spotd
//!
//! Playback-control daemon. Clients send `PLAY <link>` over a line-based TCP
//! protocol; a session engine resolves and decodes the track, and its PCM
//! output is relayed through a bounded queue to an audio sink.
//!
//! ## Architecture Overview
//!
//! ```text
//!  TCP clients
//!      │  "PLAY <link>\n"
//!      ▼
//! ┌──────────────────────────────┐
//! │ CommandServer (network)      │  acceptor thread + one thread per
//! │  parse → Command             │  connection, all woken by one
//! └──────────────┬───────────────┘  shutdown signal
//!                │ Notifier::submit
//!                ▼
//! ┌──────────────────────────────┐   ◄── SignalRelay (SIGINT/SIGTERM)
//! │ CoordinationLoop             │   ◄── SessionHooks (attention, end of
//! │  inbox: mutex + condvar      │        track, metadata, preemption,
//! │  owns current/queued track   │        login result)
//! └──────────────┬───────────────┘
//!                │ resolve / load / play / unload / release
//!                ▼
//! ┌──────────────────────────────┐
//! │ SessionEngine                │  engine threads deliver PCM
//! └──────────────┬───────────────┘
//!                │ SessionHooks::on_audio_frame
//!                ▼
//! ┌──────────────────────────────┐
//! │ AudioRelayQueue (audio)      │  put never waits; take blocks
//! └──────────────┬───────────────┘
//!                ▼
//!        SinkWorker → AudioSink
//! ```

pub mod audio;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod network;
pub mod protocol;
pub mod session;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Version reported in the connection greeting
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");

    /// Default TCP port for the command server
    pub const DEFAULT_PORT: u16 = 8888;

    /// Default listen backlog
    pub const DEFAULT_BACKLOG: i32 = 8;

    /// Longest client line handed to the parser in one piece
    pub const MAX_LINE_LENGTH: usize = 2000;

    /// Sample rate of the simulated engine's output
    pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

    /// Channel count of the simulated engine's output
    pub const DEFAULT_CHANNELS: u16 = 2;

    /// Engine polls per loop iteration before the loop re-checks its inbox
    pub const MAX_DRAIN_ROUNDS: usize = 64;
}
