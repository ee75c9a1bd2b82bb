//! TCP command transport

pub mod poll;
pub mod server;

pub use poll::{wait_readable, Readiness, ShutdownSignal};
pub use server::{CommandServer, CommandSink};
