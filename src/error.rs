//! Server error type

use std::fmt::Display;
use std::io;

/// Failures surfaced while constructing or driving a server.
#[derive(Debug)]
pub enum Error {
    /// A listen spec could not be bound.
    Bind {
        /// The textual form of the spec that failed.
        spec: String,
        /// The underlying socket error.
        source: io::Error,
    },
    /// A bound socket could not be put into the listening state.
    Listen(io::Error),
    /// An adopted socket belongs to an address family the server cannot host.
    UnsupportedFamily(i32),
    /// Listen spec string did not parse.
    InvalidListen(String),
    /// Server was constructed with no listen specs and no sockets.
    NoListeners,
    /// The task dispatcher is shutting down and accepts no new work.
    DispatcherShutDown,
    /// Reactor setup failed (poll or waker creation).
    Reactor(io::Error),
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Bind { spec, source } => write!(f, "could not bind {spec}: {source}"),
            Error::Listen(err) => write!(f, "listen failed: {err}"),
            Error::UnsupportedFamily(family) => {
                write!(f, "unsupported socket family: {family}")
            }
            Error::InvalidListen(spec) => write!(f, "invalid listen spec: {spec}"),
            Error::NoListeners => f.write_str("no listening sockets were provided"),
            Error::DispatcherShutDown => f.write_str("task dispatcher is shutting down"),
            Error::Reactor(err) => write!(f, "reactor setup failed: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Bind { source, .. } => Some(source),
            Error::Listen(err) | Error::Reactor(err) => Some(err),
            _ => None,
        }
    }
}

/// Result whose Err variant is [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
