//! Session engine callbacks
//!
//! Control events go to the coordination loop's inbox and audio goes to the
//! relay queue. Nothing here calls into the engine.

use crate::audio::{AudioFrame, SharedRelayQueue};
use crate::coordinator::Notifier;
use crate::error::SessionError;
use crate::session::SessionObserver;

/// Observer wiring an engine to the daemon
pub struct SessionHooks {
    notifier: Notifier,
    relay: SharedRelayQueue,
}

impl SessionHooks {
    pub fn new(notifier: Notifier, relay: SharedRelayQueue) -> Self {
        Self { notifier, relay }
    }
}

impl SessionObserver for SessionHooks {
    fn on_attention_needed(&self) {
        self.notifier.notify();
    }

    fn on_audio_frame(&self, frame: AudioFrame) -> usize {
        // Zero-length delivery marks a discontinuity
        if frame.is_empty() {
            return 0;
        }

        let frames = frame.frame_count();
        if self.relay.put(frame) {
            frames
        } else {
            tracing::trace!("Relay full, deferring {} frame(s)", frames);
            0
        }
    }

    fn on_track_ended(&self, track_id: u64) {
        self.notifier.playback_ended(track_id);
    }

    fn on_metadata_ready(&self) {
        self.notifier.metadata_ready();
    }

    fn on_playback_preempted(&self) {
        self.notifier.playback_preempted();
    }

    fn on_login_result(&self, result: Result<(), SessionError>) {
        match result {
            Ok(()) => tracing::info!("Login succeeded"),
            Err(e) => self.notifier.login_failed(e),
        }
    }

    fn on_log_message(&self, message: &str) {
        tracing::debug!(target: "spotd::engine", "{}", message.trim_end());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::create_shared_queue;
    use crate::coordinator::{CoordinationLoop, LoopControl};
    use crate::session::{Credentials, NextPoll, SessionEngine, TrackHandle, TrackStatus};

    struct IdleEngine;

    impl SessionEngine for IdleEngine {
        fn login(&mut self, _: &Credentials) -> Result<(), SessionError> {
            Ok(())
        }
        fn resolve_track(&mut self, link: &str) -> Result<TrackHandle, SessionError> {
            Err(SessionError::InvalidLink(link.to_string()))
        }
        fn track_status(&self, _: &TrackHandle) -> TrackStatus {
            TrackStatus::Failed
        }
        fn track_name(&self, _: &TrackHandle) -> Option<String> {
            None
        }
        fn load(&mut self, _: &TrackHandle) -> Result<(), SessionError> {
            Ok(())
        }
        fn play(&mut self, _: bool) {}
        fn unload(&mut self) {}
        fn release(&mut self, _: TrackHandle) {}
        fn process_pending_events(&mut self) -> NextPoll {
            NextPoll::OnNotify
        }
        fn shutdown(&mut self) {}
    }

    #[test]
    fn test_audio_goes_to_relay() {
        let relay = create_shared_queue();
        let hooks = SessionHooks::new(Notifier::new(), relay.clone());

        assert_eq!(hooks.on_audio_frame(AudioFrame::new(2, 44100, vec![1; 200])), 100);
        assert_eq!(hooks.on_audio_frame(AudioFrame::new(2, 44100, Vec::new())), 0);
        assert_eq!(relay.len(), 1);
        assert_eq!(relay.pending_frame_count(), 100);
    }

    #[test]
    fn test_backpressure_reports_zero() {
        let relay = create_shared_queue();
        let hooks = SessionHooks::new(Notifier::new(), relay.clone());

        assert_eq!(hooks.on_audio_frame(AudioFrame::new(1, 100, vec![0; 101])), 101);
        assert_eq!(hooks.on_audio_frame(AudioFrame::new(1, 100, vec![0; 10])), 0);
        assert_eq!(relay.len(), 1);
    }

    #[test]
    fn test_login_failure_reaches_loop() {
        let notifier = Notifier::new();
        let relay = create_shared_queue();
        let hooks = SessionHooks::new(notifier.clone(), relay.clone());
        let mut coordinator = CoordinationLoop::new(&notifier, IdleEngine, relay);

        hooks.on_login_result(Ok(()));
        hooks.on_login_result(Err(SessionError::LoginFailed("denied".into())));

        assert_eq!(
            coordinator.iterate(),
            LoopControl::LoginFailed(SessionError::LoginFailed("denied".into()))
        );
    }
}
