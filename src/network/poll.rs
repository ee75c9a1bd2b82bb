//! Cancellable readiness polling
//!
//! Every blocking loop in the command server waits on two descriptors at
//! once: the socket it serves and the read end of a private socket pair.
//! Writing a single byte to the pair wakes every waiter immediately. The
//! byte is never read back, so the pair stays readable and any later poll
//! also returns at once.

use std::io::{self, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};

/// Outcome of [`wait_readable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The watched descriptor is readable, hung up or in error
    Ready,
    /// Shutdown was requested
    Shutdown,
}

/// One-shot shutdown notification shared by all server threads
#[derive(Debug)]
pub struct ShutdownSignal {
    reader: UnixStream,
    writer: UnixStream,
    raised: AtomicBool,
}

impl ShutdownSignal {
    pub fn new() -> io::Result<Self> {
        let (reader, writer) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;

        Ok(Self {
            reader,
            writer,
            raised: AtomicBool::new(false),
        })
    }

    /// Wake every thread polling on this signal. Only the first call writes.
    pub fn trigger(&self) -> io::Result<()> {
        if self.raised.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        (&self.writer).write_all(&[1])
    }

    pub fn is_triggered(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }
}

impl AsRawFd for ShutdownSignal {
    fn as_raw_fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }
}

/// Block until `fd` becomes readable or `shutdown` fires.
///
/// Shutdown wins when both are ready in the same wakeup.
pub fn wait_readable(fd: RawFd, shutdown: &ShutdownSignal) -> io::Result<Readiness> {
    let mut fds = [
        libc::pollfd {
            fd: shutdown.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        },
        libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        },
    ];

    loop {
        // SAFETY: `fds` is a valid array of initialized pollfd structs that
        // outlives the call, and its length is passed alongside it.
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };

        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }

        if fds[0].revents != 0 {
            return Ok(Readiness::Shutdown);
        }
        if fds[1].revents != 0 {
            return Ok(Readiness::Ready);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_trigger_wakes_waiter() {
        let signal = Arc::new(ShutdownSignal::new().unwrap());
        let (idle, _peer) = UnixStream::pair().unwrap();

        let s = signal.clone();
        let waiter = thread::spawn(move || wait_readable(idle.as_raw_fd(), &s).unwrap());

        thread::sleep(Duration::from_millis(30));
        let started = Instant::now();
        signal.trigger().unwrap();

        assert_eq!(waiter.join().unwrap(), Readiness::Shutdown);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(signal.is_triggered());
    }

    #[test]
    fn test_signal_stays_raised() {
        let signal = ShutdownSignal::new().unwrap();
        let (idle, _peer) = UnixStream::pair().unwrap();

        signal.trigger().unwrap();
        signal.trigger().unwrap();

        for _ in 0..3 {
            assert_eq!(wait_readable(idle.as_raw_fd(), &signal).unwrap(), Readiness::Shutdown);
        }
    }

    #[test]
    fn test_data_is_ready() {
        let signal = ShutdownSignal::new().unwrap();
        let (local, mut peer) = UnixStream::pair().unwrap();

        peer.write_all(b"x").unwrap();
        assert_eq!(wait_readable(local.as_raw_fd(), &signal).unwrap(), Readiness::Ready);
    }

    #[test]
    fn test_hangup_is_ready() {
        let signal = ShutdownSignal::new().unwrap();
        let (local, peer) = UnixStream::pair().unwrap();

        drop(peer);
        assert_eq!(wait_readable(local.as_raw_fd(), &signal).unwrap(), Readiness::Ready);
    }
}
