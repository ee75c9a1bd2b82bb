//! Simulated session engine
//!
//! Stands in for a vendor SDK. Links look like `spotify:track:<id>`; a
//! track's metadata becomes available `metadata_delay_ms` after it is first
//! resolved, and ids starting with `unavailable` fail at that point. While
//! playing, a worker thread delivers a sine tone in 10 ms chunks, running a
//! little ahead of real time and retrying chunks the observer rejects.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::AudioFrame;
use crate::config::EngineConfig;
use crate::error::SessionError;
use crate::session::{
    Credentials, NextPoll, SessionEngine, SessionObserver, TrackHandle, TrackStatus,
};

const LINK_PREFIX: &str = "spotify:track:";
const UNAVAILABLE_PREFIX: &str = "unavailable";

/// Delivery granularity: 10 ms of audio per chunk
const CHUNKS_PER_SECOND: u32 = 100;

/// How far delivery may run ahead of the playback clock
const DELIVERY_LEAD: Duration = Duration::from_millis(250);

const IDLE_TICK: Duration = Duration::from_millis(100);
const AMPLITUDE: f64 = 0.25;

/// Extract the track id from a `spotify:track:<id>` link
pub fn parse_track_link(link: &str) -> Option<&str> {
    let id = link.strip_prefix(LINK_PREFIX)?;
    let valid = !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    valid.then_some(id)
}

#[derive(Debug, Clone)]
struct CatalogEntry {
    status: TrackStatus,
    name: String,
}

type Catalog = Arc<Mutex<HashMap<String, CatalogEntry>>>;

enum Request {
    Login(Result<(), SessionError>),
    FetchMetadata { track_id: String, ready_at: Instant },
    Load { handle_id: u64, track_id: String },
    Play(bool),
    Unload,
    Shutdown,
}

/// Simulated engine handle, owned by the coordination thread
pub struct SimulatedEngine {
    catalog: Catalog,
    requests: Sender<Request>,
    worker: Option<JoinHandle<()>>,
    pending_events: Arc<AtomicUsize>,
    metadata_delay: Duration,
    idle_poll: Duration,
    next_handle: u64,
    live_handles: HashMap<u64, String>,
    loaded: Option<u64>,
}

impl SimulatedEngine {
    pub fn new(
        config: EngineConfig,
        observer: Arc<dyn SessionObserver>,
    ) -> Result<Self, SessionError> {
        if config.sample_rate == 0 || config.channels == 0 {
            return Err(SessionError::CreateFailed(
                "sample_rate and channels must be non-zero".to_string(),
            ));
        }

        let catalog: Catalog = Arc::new(Mutex::new(HashMap::new()));
        let pending_events = Arc::new(AtomicUsize::new(0));
        let (requests, request_rx) = unbounded();

        let worker = Worker {
            sample_rate: config.sample_rate,
            channels: config.channels,
            tone_hz: config.tone_hz as f64,
            track_frames: (config.track_duration_secs.max(0.0) as f64
                * config.sample_rate as f64) as u64,
            observer,
            catalog: catalog.clone(),
            pending_events: pending_events.clone(),
            metadata_queue: Vec::new(),
            player: None,
        };

        let handle = thread::Builder::new()
            .name("spotd-engine".into())
            .spawn(move || worker.run(request_rx))
            .map_err(|e| SessionError::ThreadSpawn(e.to_string()))?;

        Ok(Self {
            catalog,
            requests,
            worker: Some(handle),
            pending_events,
            metadata_delay: Duration::from_millis(config.metadata_delay_ms),
            idle_poll: Duration::from_millis(config.idle_poll_ms),
            next_handle: 1,
            live_handles: HashMap::new(),
            loaded: None,
        })
    }

    /// Track handles resolved and not yet released
    pub fn outstanding_handles(&self) -> usize {
        self.live_handles.len()
    }

    /// Id of the handle currently loaded into the player
    pub fn loaded_handle(&self) -> Option<u64> {
        self.loaded
    }

    fn send(&self, request: Request) {
        if self.requests.send(request).is_err() {
            tracing::warn!("Session worker is not running");
        }
    }

    fn entry(&self, track: &TrackHandle) -> Option<CatalogEntry> {
        let id = parse_track_link(track.link())?;
        self.catalog.lock().get(id).cloned()
    }
}

impl SessionEngine for SimulatedEngine {
    fn login(&mut self, credentials: &Credentials) -> Result<(), SessionError> {
        let result = if credentials.username.is_empty() || credentials.password.is_empty() {
            Err(SessionError::LoginFailed("missing username or password".to_string()))
        } else {
            Ok(())
        };
        tracing::debug!("Logging in as {}", credentials.username);
        self.send(Request::Login(result));
        Ok(())
    }

    fn resolve_track(&mut self, link: &str) -> Result<TrackHandle, SessionError> {
        let track_id = parse_track_link(link)
            .ok_or_else(|| SessionError::InvalidLink(link.to_string()))?
            .to_string();

        let first_seen = {
            let mut catalog = self.catalog.lock();
            if catalog.contains_key(&track_id) {
                false
            } else {
                catalog.insert(
                    track_id.clone(),
                    CatalogEntry {
                        status: TrackStatus::Loading,
                        name: format!("Simulated track {}", track_id),
                    },
                );
                true
            }
        };

        if first_seen {
            self.send(Request::FetchMetadata {
                track_id: track_id.clone(),
                ready_at: Instant::now() + self.metadata_delay,
            });
        }

        let id = self.next_handle;
        self.next_handle += 1;
        self.live_handles.insert(id, track_id);
        Ok(TrackHandle::new(id, link))
    }

    fn track_status(&self, track: &TrackHandle) -> TrackStatus {
        self.entry(track).map_or(TrackStatus::Failed, |e| e.status)
    }

    fn track_name(&self, track: &TrackHandle) -> Option<String> {
        self.entry(track)
            .filter(|e| e.status == TrackStatus::Ready)
            .map(|e| e.name)
    }

    fn load(&mut self, track: &TrackHandle) -> Result<(), SessionError> {
        if self.track_status(track) != TrackStatus::Ready {
            return Err(SessionError::LoadFailed(format!("{} is not ready", track.link())));
        }
        let Some(track_id) = self.live_handles.get(&track.id()).cloned() else {
            return Err(SessionError::LoadFailed(format!("{} was released", track.link())));
        };

        self.send(Request::Load {
            handle_id: track.id(),
            track_id,
        });
        self.loaded = Some(track.id());
        Ok(())
    }

    fn play(&mut self, play: bool) {
        self.send(Request::Play(play));
    }

    fn unload(&mut self) {
        self.send(Request::Unload);
        self.loaded = None;
    }

    fn release(&mut self, track: TrackHandle) {
        if self.live_handles.remove(&track.id()).is_none() {
            tracing::warn!("Released unknown track handle {}", track.id());
        }
    }

    fn process_pending_events(&mut self) -> NextPoll {
        let taken = self
            .pending_events
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));

        match taken {
            Ok(before) if before > 1 => NextPoll::Immediately,
            _ => NextPoll::After(self.idle_poll),
        }
    }

    fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.send(Request::Shutdown);
        if worker.join().is_err() {
            tracing::error!("Session worker panicked");
        }
        tracing::debug!("Session released");
    }
}

impl Drop for SimulatedEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Player {
    handle_id: u64,
    position: u64,
    total: u64,
    playing: bool,
    clock_base: Instant,
}

/// State owned by the engine's internal thread
struct Worker {
    sample_rate: u32,
    channels: u16,
    tone_hz: f64,
    track_frames: u64,
    observer: Arc<dyn SessionObserver>,
    catalog: Catalog,
    pending_events: Arc<AtomicUsize>,
    metadata_queue: Vec<(Instant, String)>,
    player: Option<Player>,
}

impl Worker {
    fn run(mut self, requests: Receiver<Request>) {
        loop {
            match requests.recv_timeout(self.next_wakeup()) {
                Ok(Request::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(request) => self.handle(request),
                Err(RecvTimeoutError::Timeout) => {}
            }

            self.complete_metadata();
            self.deliver_audio();
        }
    }

    fn next_wakeup(&self) -> Duration {
        let mut wait = match &self.player {
            Some(p) if p.playing => Duration::from_secs(1) / CHUNKS_PER_SECOND,
            _ => IDLE_TICK,
        };

        let now = Instant::now();
        if let Some(earliest) = self.metadata_queue.iter().map(|(at, _)| *at).min() {
            wait = wait.min(earliest.saturating_duration_since(now));
        }
        wait
    }

    fn raise_attention(&self) {
        self.pending_events.fetch_add(1, Ordering::SeqCst);
        self.observer.on_attention_needed();
    }

    fn handle(&mut self, request: Request) {
        match request {
            Request::Login(result) => {
                if result.is_ok() {
                    self.observer.on_log_message("Logged in");
                }
                self.observer.on_login_result(result);
                self.raise_attention();
            }
            Request::FetchMetadata { track_id, ready_at } => {
                self.metadata_queue.push((ready_at, track_id));
            }
            Request::Load { handle_id, track_id } => {
                self.observer
                    .on_log_message(&format!("Player loaded {}", track_id));
                self.player = Some(Player {
                    handle_id,
                    position: 0,
                    total: self.track_frames,
                    playing: false,
                    clock_base: Instant::now(),
                });
            }
            Request::Play(play) => {
                let rate = self.sample_rate as f64;
                if let Some(player) = self.player.as_mut() {
                    if play && !player.playing {
                        let played = Duration::from_secs_f64(player.position as f64 / rate);
                        player.clock_base = Instant::now() - played;
                    }
                    player.playing = play;
                }
            }
            Request::Unload => self.player = None,
            Request::Shutdown => {}
        }
    }

    fn complete_metadata(&mut self) {
        if self.metadata_queue.is_empty() {
            return;
        }

        let now = Instant::now();
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.metadata_queue)
            .into_iter()
            .partition(|(at, _)| *at <= now);
        self.metadata_queue = waiting;

        if due.is_empty() {
            return;
        }

        {
            let mut catalog = self.catalog.lock();
            for (_, track_id) in &due {
                if let Some(entry) = catalog.get_mut(track_id) {
                    entry.status = if track_id.starts_with(UNAVAILABLE_PREFIX) {
                        TrackStatus::Failed
                    } else {
                        TrackStatus::Ready
                    };
                }
            }
        }

        self.observer.on_log_message("Metadata updated");
        self.observer.on_metadata_ready();
        self.raise_attention();
    }

    fn deliver_audio(&mut self) {
        let (rate, channels, tone_hz) = (self.sample_rate, self.channels, self.tone_hz);
        let chunk = (rate / CHUNKS_PER_SECOND).max(1) as u64;

        let Some(player) = self.player.as_mut() else {
            return;
        };
        if !player.playing {
            return;
        }

        let horizon = player.clock_base.elapsed() + DELIVERY_LEAD;
        while player.position < player.total {
            let delivered = Duration::from_secs_f64(player.position as f64 / rate as f64);
            if delivered >= horizon {
                break;
            }

            let frames = chunk.min(player.total - player.position);
            let accepted = self
                .observer
                .on_audio_frame(tone(rate, channels, tone_hz, player.position, frames));
            if accepted == 0 {
                // Relay is full; the same chunk is regenerated next tick
                break;
            }
            player.position += accepted as u64;
        }

        if player.position >= player.total {
            player.playing = false;
            self.observer.on_track_ended(player.handle_id);
            self.raise_attention();
        }
    }
}

/// `frames` frames of a sine tone starting at absolute frame `start`
fn tone(rate: u32, channels: u16, hz: f64, start: u64, frames: u64) -> AudioFrame {
    let mut samples = Vec::with_capacity(frames as usize * channels as usize);
    for i in 0..frames {
        let t = (start + i) as f64 / rate as f64;
        let value = ((t * hz * 2.0 * PI).sin() * AMPLITUDE * i16::MAX as f64) as i16;
        samples.extend(std::iter::repeat(value).take(channels as usize));
    }
    AudioFrame::new(channels, rate, samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{bounded, Sender};

    #[derive(Debug, PartialEq)]
    enum Seen {
        Attention,
        Frame(usize),
        Ended(u64),
        Metadata,
        Login(bool),
    }

    struct Recorder {
        events: Sender<Seen>,
        accept: bool,
    }

    impl SessionObserver for Recorder {
        fn on_attention_needed(&self) {
            let _ = self.events.try_send(Seen::Attention);
        }
        fn on_audio_frame(&self, frame: AudioFrame) -> usize {
            let _ = self.events.try_send(Seen::Frame(frame.frame_count()));
            if self.accept {
                frame.frame_count()
            } else {
                0
            }
        }
        fn on_track_ended(&self, track_id: u64) {
            let _ = self.events.try_send(Seen::Ended(track_id));
        }
        fn on_metadata_ready(&self) {
            let _ = self.events.try_send(Seen::Metadata);
        }
        fn on_playback_preempted(&self) {}
        fn on_login_result(&self, result: Result<(), SessionError>) {
            let _ = self.events.try_send(Seen::Login(result.is_ok()));
        }
    }

    fn engine(config: EngineConfig, accept: bool) -> (SimulatedEngine, Receiver<Seen>) {
        let (tx, rx) = bounded(100_000);
        let recorder = Arc::new(Recorder { events: tx, accept });
        (SimulatedEngine::new(config, recorder).unwrap(), rx)
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            metadata_delay_ms: 10,
            track_duration_secs: 0.05,
            sample_rate: 8000,
            channels: 2,
            ..Default::default()
        }
    }

    fn wait_for(rx: &Receiver<Seen>, wanted: Seen) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while let Ok(seen) = rx.recv_deadline(deadline) {
            if seen == wanted {
                return true;
            }
        }
        false
    }

    #[test]
    fn test_parse_track_link() {
        assert_eq!(parse_track_link("spotify:track:abc123"), Some("abc123"));
        assert_eq!(parse_track_link("spotify:track:"), None);
        assert_eq!(parse_track_link("spotify:album:abc"), None);
        assert_eq!(parse_track_link("spotify:track:a b"), None);
    }

    #[test]
    fn test_invalid_link() {
        let (mut engine, _rx) = engine(fast_config(), true);
        assert_eq!(
            engine.resolve_track("nonsense"),
            Err(SessionError::InvalidLink("nonsense".to_string()))
        );
        assert_eq!(engine.outstanding_handles(), 0);
    }

    #[test]
    fn test_metadata_then_playback_to_end() {
        let (mut engine, rx) = engine(fast_config(), true);

        let track = engine.resolve_track("spotify:track:abc").unwrap();
        assert_eq!(engine.track_status(&track), TrackStatus::Loading);
        assert!(engine.track_name(&track).is_none());
        assert!(engine.load(&track).is_err());

        assert!(wait_for(&rx, Seen::Metadata));
        assert_eq!(engine.track_status(&track), TrackStatus::Ready);
        assert_eq!(engine.track_name(&track).as_deref(), Some("Simulated track abc"));

        engine.load(&track).unwrap();
        assert_eq!(engine.loaded_handle(), Some(track.id()));
        engine.play(true);

        assert!(wait_for(&rx, Seen::Frame(80)));
        assert!(wait_for(&rx, Seen::Ended(track.id())));

        engine.unload();
        engine.release(track);
        assert_eq!(engine.outstanding_handles(), 0);
        engine.shutdown();
    }

    #[test]
    fn test_unavailable_track_fails() {
        let (mut engine, rx) = engine(fast_config(), true);
        let track = engine.resolve_track("spotify:track:unavailable1").unwrap();
        assert!(wait_for(&rx, Seen::Metadata));
        assert_eq!(engine.track_status(&track), TrackStatus::Failed);
        engine.release(track);
    }

    #[test]
    fn test_rejected_frames_hold_position() {
        let (mut engine, rx) = engine(fast_config(), false);
        let track = engine.resolve_track("spotify:track:abc").unwrap();
        assert!(wait_for(&rx, Seen::Metadata));

        engine.load(&track).unwrap();
        engine.play(true);

        // The first chunk keeps being offered and the track never ends
        assert!(wait_for(&rx, Seen::Frame(80)));
        assert!(wait_for(&rx, Seen::Frame(80)));
        thread::sleep(Duration::from_millis(100));
        assert!(!rx.try_iter().any(|s| matches!(s, Seen::Ended(_))));

        engine.release(track);
    }

    #[test]
    fn test_login_and_pending_events() {
        let (mut engine, rx) = engine(fast_config(), true);

        engine.login(&Credentials::new("user", "")).unwrap();
        assert!(wait_for(&rx, Seen::Login(false)));

        engine.login(&Credentials::new("user", "secret")).unwrap();
        assert!(wait_for(&rx, Seen::Login(true)));
        assert!(wait_for(&rx, Seen::Attention));

        // Two attentions raised: drain them, then fall back to the idle poll
        assert_eq!(engine.process_pending_events(), NextPoll::Immediately);
        assert_eq!(
            engine.process_pending_events(),
            NextPoll::After(Duration::from_millis(1000))
        );
        assert_eq!(
            engine.process_pending_events(),
            NextPoll::After(Duration::from_millis(1000))
        );
    }

    #[test]
    fn test_tone_shape() {
        let frame = tone(8000, 2, 440.0, 0, 80);
        assert_eq!(frame.frame_count(), 80);
        assert_eq!(frame.channels(), 2);
        assert_eq!(frame.samples()[0], 0);
        assert_eq!(frame.samples()[2], frame.samples()[3]);
    }
}
