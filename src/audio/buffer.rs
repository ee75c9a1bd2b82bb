//! Relay queue for decoded audio frames
//!
//! The session engine delivers PCM from its own real-time thread and must
//! never be stalled by a slow consumer, so `put` refuses frames instead of
//! waiting once about one second of audio is already buffered. The consumer
//! side blocks in `take` until a frame is available.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One delivery of interleaved 16-bit PCM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    channels: u16,
    sample_rate: u32,
    frame_count: usize,
    samples: Vec<i16>,
}

impl AudioFrame {
    /// Build a frame from interleaved samples.
    ///
    /// `frame_count` is derived from the sample count, so a trailing partial
    /// frame (fewer samples than `channels`) is dropped.
    pub fn new(channels: u16, sample_rate: u32, mut samples: Vec<i16>) -> Self {
        let width = channels.max(1) as usize;
        let frame_count = samples.len() / width;
        samples.truncate(frame_count * width);
        Self {
            channels,
            sample_rate,
            frame_count,
            samples,
        }
    }

    /// Copy a frame out of a borrowed delivery buffer
    pub fn from_slice(channels: u16, sample_rate: u32, samples: &[i16]) -> Self {
        Self::new(channels, sample_rate, samples.to_vec())
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Number of frames (samples per channel)
    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Interleaved samples, `frame_count * channels` long
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn is_empty(&self) -> bool {
        self.frame_count == 0
    }

    /// Playback duration of this frame
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.frame_count as u64 * 1_000_000 / self.sample_rate as u64)
    }
}

struct RelayState {
    frames: VecDeque<AudioFrame>,
    /// Sum of `frame_count` over `frames`
    pending_frames: usize,
}

/// Bounded FIFO between the session engine and the audio sink
pub struct AudioRelayQueue {
    state: Mutex<RelayState>,
    available: Condvar,
    overflow_count: AtomicUsize,
}

impl AudioRelayQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RelayState {
                frames: VecDeque::new(),
                pending_frames: 0,
            }),
            available: Condvar::new(),
            overflow_count: AtomicUsize::new(0),
        }
    }

    /// Enqueue a frame without waiting.
    ///
    /// Returns false, and drops nothing into the queue, when more than one
    /// second of audio (measured in the incoming frame's sample rate) is
    /// already pending. The caller keeps responsibility for redelivering.
    pub fn put(&self, frame: AudioFrame) -> bool {
        let mut state = self.state.lock();

        if state.pending_frames > frame.sample_rate as usize {
            drop(state);
            self.overflow_count.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        state.pending_frames += frame.frame_count;
        state.frames.push_back(frame);
        self.available.notify_one();
        true
    }

    /// Block until a frame is available and dequeue it
    pub fn take(&self) -> AudioFrame {
        let mut state = self.state.lock();
        loop {
            if let Some(frame) = Self::pop(&mut state) {
                return frame;
            }
            self.available.wait(&mut state);
        }
    }

    /// Like `take`, but gives up after `timeout`
    pub fn take_timeout(&self, timeout: Duration) -> Option<AudioFrame> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(frame) = Self::pop(&mut state) {
                return Some(frame);
            }
            if self.available.wait_until(&mut state, deadline).timed_out() {
                return Self::pop(&mut state);
            }
        }
    }

    /// Dequeue a frame if one is present
    pub fn try_take(&self) -> Option<AudioFrame> {
        Self::pop(&mut self.state.lock())
    }

    fn pop(state: &mut RelayState) -> Option<AudioFrame> {
        let frame = state.frames.pop_front()?;
        state.pending_frames -= frame.frame_count;
        Some(frame)
    }

    /// Discard everything queued. Returns the number of frames dropped.
    pub fn flush(&self) -> usize {
        let mut state = self.state.lock();
        let dropped = state.frames.len();
        state.frames.clear();
        state.pending_frames = 0;
        dropped
    }

    /// Number of queued deliveries
    pub fn len(&self) -> usize {
        self.state.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().frames.is_empty()
    }

    /// Sum of `frame_count` over all queued deliveries
    pub fn pending_frame_count(&self) -> usize {
        self.state.lock().pending_frames
    }

    /// Number of `put` calls rejected for backpressure
    pub fn overflow_count(&self) -> usize {
        self.overflow_count.load(Ordering::Relaxed)
    }
}

impl Default for AudioRelayQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe handle to a relay queue
pub type SharedRelayQueue = Arc<AudioRelayQueue>;

/// Create a new shared relay queue
pub fn create_shared_queue() -> SharedRelayQueue {
    Arc::new(AudioRelayQueue::new())
}
