//! Interrupt delivery
//!
//! A dedicated thread blocks on signal-hook's iterator and turns SIGINT and
//! SIGTERM into [`Notifier::interrupt`], so no lock is ever taken inside an
//! asynchronous signal handler.

use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};
use std::io;
use std::thread::{self, JoinHandle};

use crate::coordinator::Notifier;

/// Signals treated as a shutdown request
pub const SHUTDOWN_SIGNALS: [i32; 2] = [SIGINT, SIGTERM];

/// Thread relaying shutdown signals to the coordination loop
pub struct SignalRelay {
    handle: Handle,
    thread_handle: Option<JoinHandle<()>>,
}

impl SignalRelay {
    pub fn start(notifier: Notifier) -> io::Result<Self> {
        let mut signals = Signals::new(SHUTDOWN_SIGNALS)?;
        let handle = signals.handle();

        let thread_handle = thread::Builder::new()
            .name("spotd-signals".into())
            .spawn(move || {
                for signal in signals.forever() {
                    tracing::info!("Received signal {}, shutting down", signal);
                    notifier.interrupt();
                }
            })?;

        Ok(Self {
            handle,
            thread_handle: Some(thread_handle),
        })
    }

    /// Stop listening and join the relay thread
    pub fn stop(&mut self) {
        self.handle.close();

        if let Some(thread_handle) = self.thread_handle.take() {
            let _ = thread_handle.join();
        }
    }
}

impl Drop for SignalRelay {
    fn drop(&mut self) {
        self.stop();
    }
}
