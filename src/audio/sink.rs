//! Consumer side of the relay queue
//!
//! A dedicated thread drains the relay queue into an [`AudioSink`]. The sink
//! is constructed on that thread because output streams are not always
//! `Send`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::buffer::{AudioFrame, SharedRelayQueue};
use crate::error::AudioError;

/// How long the worker waits on an empty queue before rechecking `running`
const IDLE_WAIT: Duration = Duration::from_millis(100);

/// Destination for relayed audio
pub trait AudioSink {
    fn write(&mut self, frame: &AudioFrame) -> Result<(), AudioError>;
}

/// Sink that discards everything it is given
#[derive(Debug, Default)]
pub struct NullSink;

impl AudioSink for NullSink {
    fn write(&mut self, _frame: &AudioFrame) -> Result<(), AudioError> {
        Ok(())
    }
}

/// Counters shared between the worker thread and its owner
#[derive(Debug, Default)]
struct SinkCounters {
    frames: AtomicU64,
    deliveries: AtomicU64,
    errors: AtomicU64,
}

/// Sink statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkStats {
    pub deliveries: u64,
    pub frames: u64,
    pub errors: u64,
}

/// Thread draining a relay queue into a sink
pub struct SinkWorker {
    running: Arc<AtomicBool>,
    counters: Arc<SinkCounters>,
    thread_handle: Option<JoinHandle<()>>,
}

impl SinkWorker {
    /// Spawn the worker. `make_sink` runs on the new thread.
    pub fn start<F, S>(queue: SharedRelayQueue, make_sink: F) -> Result<Self, AudioError>
    where
        F: FnOnce() -> Result<S, AudioError> + Send + 'static,
        S: AudioSink,
    {
        let running = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(SinkCounters::default());

        let running_for_loop = running.clone();
        let counters_for_loop = counters.clone();

        let handle = thread::Builder::new()
            .name("spotd-sink".into())
            .spawn(move || {
                let mut sink = match make_sink() {
                    Ok(sink) => sink,
                    Err(e) => {
                        tracing::error!("Failed to open audio output: {}", e);
                        return;
                    }
                };

                while running_for_loop.load(Ordering::Relaxed) {
                    let Some(frame) = queue.take_timeout(IDLE_WAIT) else {
                        continue;
                    };

                    counters_for_loop.deliveries.fetch_add(1, Ordering::Relaxed);
                    counters_for_loop
                        .frames
                        .fetch_add(frame.frame_count() as u64, Ordering::Relaxed);

                    if let Err(e) = sink.write(&frame) {
                        counters_for_loop.errors.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!("Audio output error: {}", e);
                    }
                }
            })
            .map_err(AudioError::ThreadSpawn)?;

        Ok(Self {
            running,
            counters,
            thread_handle: Some(handle),
        })
    }

    /// Stop the worker and wait for it to exit
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> SinkStats {
        SinkStats {
            deliveries: self.counters.deliveries.load(Ordering::Relaxed),
            frames: self.counters.frames.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
        }
    }
}

impl Drop for SinkWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
