//! Listener strategies and connection streams
//!
//! The address-family variants (TCP, UNIX, VSOCK) are expressed as one
//! acceptor over a small strategy capability rather than a type hierarchy:
//! [`Listen`] covers bind/accept/cleanup and whether accepted sockets take
//! socket options, [`Conduit`] is the non-blocking byte stream a channel
//! drives. Both are object safe so one reactor map can host every family.

use std::fmt;
use std::fmt::Display;
use std::io::{Read, Write};
use std::net::SocketAddr;

use mio::{Interest, Registry, Token};

use crate::adjustments::SocketOption;

pub mod tcp;
pub mod unix;
#[cfg(target_os = "linux")]
pub mod vsock;

/// Peer address of an accepted connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAddr {
    /// TCP peer.
    Inet(SocketAddr),
    /// UNIX domain peer; reported as `localhost` like the inet loopback.
    Unix,
    /// VSOCK peer.
    Vsock {
        /// Peer context id.
        cid: u32,
        /// Peer port.
        port: u32,
    },
}

impl Display for PeerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerAddr::Inet(addr) => addr.fmt(f),
            PeerAddr::Unix => f.write_str("localhost"),
            PeerAddr::Vsock { cid, port } => write!(f, "{cid}:{port}"),
        }
    }
}

impl PeerAddr {
    /// Host portion, as handed to the application.
    pub fn host(&self) -> String {
        match self {
            PeerAddr::Inet(addr) => addr.ip().to_string(),
            PeerAddr::Unix => "localhost".to_owned(),
            PeerAddr::Vsock { cid, .. } => cid.to_string(),
        }
    }
}

/// A non-blocking accepted stream owned by one channel.
///
/// Reads and writes follow non-blocking semantics: `WouldBlock` means retry
/// on the next readiness event.
pub trait Conduit: Read + Write + Send + fmt::Debug {
    /// Registers the stream with the reactor.
    fn register(&mut self, registry: &Registry, token: Token, interest: Interest)
        -> std::io::Result<()>;
    /// Updates the stream's interest set.
    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> std::io::Result<()>;
    /// Removes the stream from the reactor.
    fn deregister(&mut self, registry: &Registry) -> std::io::Result<()>;
    /// Raw descriptor, used for socket options and zero-copy emission.
    #[cfg(unix)]
    fn raw_fd(&self) -> std::os::fd::RawFd;
}

/// A bound, listening socket of one address family.
pub trait Listen: Send + fmt::Debug {
    /// Accepts one pending connection, already switched to non-blocking,
    /// with its peer address adapted to [`PeerAddr`].
    fn accept(&mut self) -> std::io::Result<(Box<dyn Conduit>, PeerAddr)>;
    /// Registers the listening socket for accept readiness.
    fn register(&mut self, registry: &Registry, token: Token) -> std::io::Result<()>;
    /// Removes the listening socket from the reactor.
    fn deregister(&mut self, registry: &Registry) -> std::io::Result<()>;
    /// Whether accepted sockets take the configured socket options.
    fn applies_socket_options(&self) -> bool {
        false
    }
    /// Releases bound resources the listener created (e.g. a socket path).
    fn cleanup(&mut self) {}
    /// Human-readable bound address, resolved after bind.
    fn effective_addr(&self) -> String;
}

/// Applies raw `setsockopt` triples to an accepted socket.
#[cfg(unix)]
pub(crate) fn apply_socket_options(
    fd: std::os::fd::RawFd,
    options: &[SocketOption],
) -> std::io::Result<()> {
    for &(level, name, value) in options {
        let rc = unsafe {
            libc::setsockopt(
                fd,
                level,
                name,
                &value as *const i32 as *const libc::c_void,
                std::mem::size_of::<i32>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}
