//! TCP command server
//!
//! One acceptor thread plus one detached thread per client connection. All
//! of them poll their socket together with a shared [`ShutdownSignal`], so
//! `stop` wakes every thread at once and then waits until the acceptor and
//! each connection handler have exited. A handler stuck writing a reply to a
//! client that stopped reading is released by shutting its socket down.

use parking_lot::{Condvar, Mutex};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::network::poll::{wait_readable, Readiness, ShutdownSignal};
use crate::protocol::{greeting, parse_line, reply_for, Command, LineBuffer};

/// Size of a single socket read
const READ_BUFFER_SIZE: usize = 2000;

/// A client that stops reading cannot hold a handler forever
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Backoff after a failed accept (for example when out of descriptors)
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Receives every successfully parsed command, from any handler thread
pub type CommandSink = Arc<dyn Fn(Command) + Send + Sync>;

/// Open connections, tracked so shutdown can close them and wait for their
/// handlers. Each entry is a second handle on the handler's socket.
#[derive(Default)]
struct ConnectionRegistry {
    open: Mutex<HashMap<u64, TcpStream>>,
    closed: Condvar,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    fn register(self: &Arc<Self>, stream: TcpStream) -> ConnectionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.open.lock().insert(id, stream);
        ConnectionGuard {
            registry: self.clone(),
            id,
        }
    }

    /// Shut down every registered socket, unblocking reads and writes
    fn close_all(&self) {
        for (id, stream) in self.open.lock().iter() {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                tracing::debug!("Shutdown of connection {} failed: {}", id, e);
            }
        }
    }

    fn deregister(&self, id: u64) {
        let mut open = self.open.lock();
        open.remove(&id);
        if open.is_empty() {
            self.closed.notify_all();
        }
    }

    fn wait_empty(&self) {
        let mut open = self.open.lock();
        while !open.is_empty() {
            self.closed.wait(&mut open);
        }
    }

    fn len(&self) -> usize {
        self.open.lock().len()
    }
}

/// Removes its connection from the registry when the handler ends
struct ConnectionGuard {
    registry: Arc<ConnectionRegistry>,
    id: u64,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.deregister(self.id);
    }
}

/// Running command server
pub struct CommandServer {
    local_addr: SocketAddr,
    shutdown: Arc<ShutdownSignal>,
    connections: Arc<ConnectionRegistry>,
    acceptor: Option<JoinHandle<()>>,
}

impl CommandServer {
    /// Bind the listening socket and spawn the acceptor thread.
    ///
    /// Returns once the socket is bound; `sink` is then called once per
    /// parsed command.
    pub fn start<F>(config: &ServerConfig, sink: F) -> Result<Self, ServerError>
    where
        F: Fn(Command) + Send + Sync + 'static,
    {
        let addr = resolve_addr(&config.bind_address, config.port)?;
        let listener = bind_listener(addr, config.backlog)?;
        let local_addr = listener.local_addr()?;
        tracing::info!("Command server bound to {}", local_addr);

        let shutdown = Arc::new(ShutdownSignal::new()?);
        let connections = Arc::new(ConnectionRegistry::default());
        let sink: CommandSink = Arc::new(sink);

        let acceptor = {
            let shutdown = shutdown.clone();
            let connections = connections.clone();
            let max_line_length = config.max_line_length;
            thread::Builder::new()
                .name("spotd-acceptor".into())
                .spawn(move || accept_loop(listener, shutdown, connections, sink, max_line_length))
                .map_err(ServerError::ThreadSpawn)?
        };

        Ok(Self {
            local_addr,
            shutdown,
            connections,
            acceptor: Some(acceptor),
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of connection handlers still running
    pub fn live_connections(&self) -> usize {
        self.connections.len()
    }

    /// Shut down and block until every server thread has exited.
    ///
    /// Afterwards the listening socket is closed and no handler remains.
    /// Calling it again is a no-op.
    pub fn stop(&mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        let Some(acceptor) = self.acceptor.take() else {
            return;
        };

        tracing::info!("Stopping command server");
        if let Err(e) = self.shutdown.trigger() {
            tracing::error!("Failed to signal server shutdown: {}", e);
        }

        if acceptor.join().is_err() {
            tracing::error!("Acceptor thread panicked");
        }

        // No registration can happen once the acceptor is gone
        self.connections.close_all();
        self.connections.wait_empty();
        tracing::info!("Command server stopped");
    }
}

impl Drop for CommandServer {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

fn resolve_addr(host: &str, port: u16) -> Result<SocketAddr, ServerError> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| ServerError::InvalidAddress(format!("{}:{}: {}", host, port, e)))?
        .next()
        .ok_or_else(|| ServerError::InvalidAddress(format!("{}:{}", host, port)))
}

fn bind_listener(addr: SocketAddr, backlog: i32) -> Result<TcpListener, ServerError> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;

    socket
        .bind(&addr.into())
        .map_err(|source| ServerError::BindFailed { addr, source })?;
    socket
        .listen(backlog)
        .map_err(|source| ServerError::BindFailed { addr, source })?;

    let listener: TcpListener = socket.into();
    // Readiness is polled first; a connection reset in between must not block accept
    listener.set_nonblocking(true)?;
    Ok(listener)
}

fn accept_loop(
    listener: TcpListener,
    shutdown: Arc<ShutdownSignal>,
    connections: Arc<ConnectionRegistry>,
    sink: CommandSink,
    max_line_length: usize,
) {
    tracing::info!("Waiting for incoming connections...");

    loop {
        match wait_readable(listener.as_raw_fd(), &shutdown) {
            Ok(Readiness::Ready) => {}
            Ok(Readiness::Shutdown) => break,
            Err(e) => {
                tracing::error!("Poll on listening socket failed: {}", e);
                break;
            }
        }

        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!("accept failed: {}", e);
                thread::sleep(ACCEPT_ERROR_BACKOFF);
                continue;
            }
        };

        tracing::info!("Connection accepted from {}", peer);

        let handle = match stream.try_clone() {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!("Dropping connection from {}: {}", peer, e);
                continue;
            }
        };

        // Registered before the thread exists so shutdown cannot miss it
        let guard = connections.register(handle);
        let shutdown = shutdown.clone();
        let sink = sink.clone();

        let spawned = thread::Builder::new()
            .name(format!("spotd-conn-{}", guard.id))
            .spawn(move || {
                let _guard = guard;
                handle_connection(stream, peer, &shutdown, &sink, max_line_length);
            });

        // On failure the closure, and with it the guard, is dropped
        if let Err(e) = spawned {
            tracing::error!("could not create thread for {}: {}", peer, e);
        }
    }

    drop(listener);
    tracing::debug!("Listener closed with {} connection(s) open", connections.len());
}

fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    shutdown: &ShutdownSignal,
    sink: &CommandSink,
    max_line_length: usize,
) {
    if let Err(e) = prepare_stream(&stream) {
        tracing::warn!("Failed to configure connection from {}: {}", peer, e);
        return;
    }

    if let Err(e) = stream.write_all(greeting().as_bytes()) {
        tracing::warn!("Failed to greet {}: {}", peer, e);
        return;
    }

    let mut lines = LineBuffer::new(max_line_length);
    let mut buf = [0u8; READ_BUFFER_SIZE];

    loop {
        match wait_readable(stream.as_raw_fd(), shutdown) {
            Ok(Readiness::Ready) => {}
            Ok(Readiness::Shutdown) => {
                tracing::debug!("Closing connection from {} for shutdown", peer);
                return;
            }
            Err(e) => {
                tracing::warn!("Poll on connection from {} failed: {}", peer, e);
                return;
            }
        }

        let read = match stream.read(&mut buf) {
            Ok(0) => {
                tracing::info!("Client {} disconnected", peer);
                return;
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => {
                tracing::warn!("recv from {} failed: {}", peer, e);
                return;
            }
        };

        for line in lines.push(&buf[..read]) {
            if shutdown.is_triggered() {
                tracing::debug!("Closing connection from {} for shutdown", peer);
                return;
            }

            let command = parse_line(&line);
            let reply = reply_for(command.as_ref());

            match command {
                Some(command) => {
                    tracing::info!("Command received from {}: {:?}", peer, command);
                    sink(command);
                }
                None => tracing::debug!("Invalid command from {}: {:?}", peer, line.trim_end()),
            }

            if let Err(e) = stream.write_all(reply.as_bytes()) {
                tracing::warn!("Failed to reply to {}: {}", peer, e);
                return;
            }
        }
    }
}

fn prepare_stream(stream: &TcpStream) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
    stream.set_nodelay(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A connected (server side, client side) pair on loopback
    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (server, client)
    }

    #[test]
    fn test_registry_wait_empty() {
        let registry = Arc::new(ConnectionRegistry::default());
        let (first, _first_peer) = socket_pair();
        let (second, _second_peer) = socket_pair();

        let a = registry.register(first);
        let b = registry.register(second);
        assert_ne!(a.id, b.id);
        assert_eq!(registry.len(), 2);

        let waiter = {
            let registry = registry.clone();
            thread::spawn(move || registry.wait_empty())
        };

        drop(a);
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        drop(b);
        waiter.join().unwrap();
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_close_all_unblocks_reader() {
        let registry = Arc::new(ConnectionRegistry::default());
        let (mut server, mut client) = socket_pair();
        let _guard = registry.register(server.try_clone().unwrap());

        let reader = thread::spawn(move || {
            let mut buf = [0u8; 16];
            server.read(&mut buf)
        });

        thread::sleep(Duration::from_millis(20));
        registry.close_all();

        assert_eq!(reader.join().unwrap().unwrap(), 0);
        let mut buf = [0u8; 16];
        assert!(matches!(client.read(&mut buf), Ok(0) | Err(_)));
    }

    #[test]
    fn test_resolve_addr() {
        let addr = resolve_addr("127.0.0.1", 8888).unwrap();
        assert_eq!(addr, "127.0.0.1:8888".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_bind_conflict() {
        let first = bind_listener("127.0.0.1:0".parse().unwrap(), 8).unwrap();
        let taken = first.local_addr().unwrap();

        let err = bind_listener(taken, 8).unwrap_err();
        assert!(matches!(err, ServerError::BindFailed { addr, .. } if addr == taken));
    }
}
