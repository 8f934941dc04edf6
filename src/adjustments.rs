//! Immutable server configuration

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::Error;

/// A raw `setsockopt` triple of (level, name, value), applied to every
/// accepted TCP socket.
pub type SocketOption = (i32, i32, i32);

/// Configuration snapshot consumed by the server core.
///
/// Created once at server construction and never mutated afterwards; every
/// component holds it behind an `Arc`.
#[derive(Debug, Clone)]
pub struct Adjustments {
    /// Maximum number of live channels per reactor map. Accepting pauses
    /// while the map is over this limit; the listen backlog absorbs bursts.
    pub connection_limit: usize,
    /// Interval between maintenance sweeps.
    pub cleanup_interval: Duration,
    /// Idle threshold after which a channel with no running task is closed.
    pub channel_timeout: Duration,
    /// Worker thread count of the task dispatcher.
    pub threads: usize,
    /// Listen backlog depth.
    pub backlog: i32,
    /// Options applied to accepted sockets on families that take them.
    pub socket_options: Vec<SocketOption>,
    /// Server token emitted in the `Server` response header.
    pub ident: String,
    /// Host name reported to the application.
    pub server_name: String,
    /// URL scheme reported to the application.
    pub url_scheme: String,
    /// Upper bound on one reactor poll; bounds maintenance latency.
    pub loop_timeout: Duration,
    /// Reads pause once this many unparsed inbound bytes are buffered.
    pub inbuf_overflow: usize,
    /// Pending output above this size forces a full drain on the next write.
    pub outbuf_overflow: usize,
    /// Workers block in `write_soon` while pending output exceeds this.
    pub outbuf_high_watermark: usize,
    /// Maximum bytes received per read event.
    pub recv_bytes: usize,
    /// Maximum bytes sent per write event (unless a full drain is forced).
    pub send_bytes: usize,
    /// Include panic payloads in 500 bodies.
    pub expose_tracebacks: bool,
    /// Log peer-reset socket errors.
    pub log_socket_errors: bool,
}

impl Default for Adjustments {
    fn default() -> Self {
        Adjustments {
            connection_limit: 100,
            cleanup_interval: Duration::from_secs(30),
            channel_timeout: Duration::from_secs(120),
            threads: 4,
            backlog: 1024,
            socket_options: default_socket_options(),
            ident: "tjener".to_owned(),
            server_name: "localhost".to_owned(),
            url_scheme: "http".to_owned(),
            loop_timeout: Duration::from_secs(1),
            inbuf_overflow: 512 * 1024,
            outbuf_overflow: 1024 * 1024,
            outbuf_high_watermark: 16 * 1024 * 1024,
            recv_bytes: 8192,
            send_bytes: 18000,
            expose_tracebacks: false,
            log_socket_errors: true,
        }
    }
}

#[cfg(unix)]
fn default_socket_options() -> Vec<SocketOption> {
    vec![(libc::IPPROTO_TCP, libc::TCP_NODELAY, 1)]
}

#[cfg(not(unix))]
fn default_socket_options() -> Vec<SocketOption> {
    Vec::new()
}

/// One address a server should listen on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenSpec {
    /// TCP `host:port`. The host may be a name, an IPv4 literal, or a
    /// bracketed IPv6 literal; port 0 asks the kernel for a free port.
    Tcp {
        /// Host name or IP literal.
        host: String,
        /// TCP port.
        port: u16,
    },
    /// UNIX domain socket path with optional octal permission bits.
    Unix {
        /// Filesystem path of the socket.
        path: PathBuf,
        /// Permission bits applied after bind, e.g. `0o600`.
        mode: Option<u32>,
    },
    /// VSOCK `cid:port` (Linux only).
    Vsock {
        /// Context id.
        cid: u32,
        /// VSOCK port.
        port: u32,
    },
}

impl ListenSpec {
    /// Parses a space-separated list of listen specs.
    pub fn parse_list(listen: &str) -> Result<Vec<ListenSpec>, Error> {
        let specs = listen
            .split_whitespace()
            .map(str::parse)
            .collect::<Result<Vec<_>, _>>()?;
        if specs.is_empty() {
            return Err(Error::NoListeners);
        }
        Ok(specs)
    }
}

impl FromStr for ListenSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let invalid = || Error::InvalidListen(s.to_owned());

        if let Some(rest) = s.strip_prefix("unix:") {
            if rest.is_empty() {
                return Err(invalid());
            }
            // a trailing :NNN that parses as octal is the permission mode
            let (path, mode) = match rest.rsplit_once(':') {
                Some((path, perm)) if !path.is_empty() => {
                    match u32::from_str_radix(perm, 8) {
                        Ok(mode) => (path, Some(mode)),
                        Err(_) => (rest, None),
                    }
                }
                _ => (rest, None),
            };
            return Ok(ListenSpec::Unix {
                path: PathBuf::from(path),
                mode,
            });
        }

        if let Some(rest) = s.strip_prefix("vsock:") {
            let (cid, port) = rest.split_once(':').ok_or_else(invalid)?;
            return Ok(ListenSpec::Vsock {
                cid: cid.parse().map_err(|_| invalid())?,
                port: port.parse().map_err(|_| invalid())?,
            });
        }

        // bracketed IPv6 literal
        if let Some(rest) = s.strip_prefix('[') {
            let (host, port) = rest.split_once("]:").ok_or_else(invalid)?;
            return Ok(ListenSpec::Tcp {
                host: host.to_owned(),
                port: port.parse().map_err(|_| invalid())?,
            });
        }

        let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
        let host = if host.is_empty() { "0.0.0.0" } else { host };
        Ok(ListenSpec::Tcp {
            host: host.to_owned(),
            port: port.parse().map_err(|_| invalid())?,
        })
    }
}
