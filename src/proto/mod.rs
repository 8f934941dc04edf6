//! HTTP/1.x protocol collaborators
//!
//! The connection engine treats parsing and response encoding as external
//! collaborators with narrow interfaces: an incremental "feed bytes, report
//! done or error" request parser and a head encoder that injects the
//! ambient `Date`/`Server`/`Connection` headers.

use std::fmt::Display;

pub mod request;
pub mod response;

/// Inbound protocol version of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    /// HTTP/1.0
    H1_0,
    /// HTTP/1.1
    H1_1,
}

impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::H1_0 => "HTTP/1.0",
            Self::H1_1 => "HTTP/1.1",
        })
    }
}
