//! Application contract
//!
//! The server hosts one callable application: request metadata in, status
//! line plus headers plus a body out. The contract is synchronous; the
//! application runs on a dispatcher worker thread, never on the reactor.

use std::fmt;
use std::fs::File;

use bytes::Bytes;

use crate::net::PeerAddr;
use crate::proto::Version;

/// A response header name/value pair.
pub type Header = (String, String);

/// Request metadata handed to the application.
#[derive(Debug)]
pub struct Environ {
    /// Request method, uppercased by the client.
    pub method: String,
    /// Request path, excluding the query string.
    pub path: String,
    /// Query string without the leading `?`; empty when absent.
    pub query: String,
    /// Protocol version the request arrived with.
    pub version: Version,
    /// Request headers in arrival order.
    pub headers: Vec<Header>,
    /// Peer address of the connection.
    pub remote_addr: PeerAddr,
    /// URL scheme from the server adjustments.
    pub url_scheme: String,
    /// Server name from the server adjustments.
    pub server_name: String,
    /// Buffered request body.
    pub body: Bytes,
}

impl Environ {
    /// Returns the first header with the given name, compared
    /// case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The zero-copy file body capability.
    ///
    /// When the returned body reaches a plain stream socket the server emits
    /// it with `sendfile` where the OS supports that, and falls back to
    /// `block_size`d read/write otherwise.
    pub fn file_wrapper(&self, file: File, block_size: usize) -> Body {
        Body::File(FileWrapper::new(file, block_size))
    }
}

/// Status and headers committed by the application before the body.
#[derive(Debug, Default)]
pub struct StartResponse {
    head: Option<ResponseHead>,
}

/// The committed response head.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    /// Numeric response status.
    pub status: u16,
    /// Response headers as provided by the application.
    pub headers: Vec<Header>,
}

impl StartResponse {
    /// Commits the response status and headers. Must be called exactly once,
    /// before any body bytes are produced; calling it again replaces the
    /// uncommitted head.
    pub fn start(&mut self, status: u16, headers: Vec<Header>) {
        self.head = Some(ResponseHead { status, headers });
    }

    pub(crate) fn take(&mut self) -> Option<ResponseHead> {
        self.head.take()
    }
}

/// Response body returned by the application.
pub enum Body {
    /// No body bytes.
    Empty,
    /// A single byte chunk.
    Full(Bytes),
    /// A fixed sequence of byte chunks.
    Chunks(Vec<Bytes>),
    /// A lazily produced sequence of byte chunks.
    Stream(Box<dyn Iterator<Item = Bytes> + Send>),
    /// A file served through the zero-copy path.
    File(FileWrapper),
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => f.write_str("Body::Empty"),
            Body::Full(b) => write!(f, "Body::Full({} bytes)", b.len()),
            Body::Chunks(c) => write!(f, "Body::Chunks({} chunks)", c.len()),
            Body::Stream(_) => f.write_str("Body::Stream"),
            Body::File(w) => write!(f, "Body::File(block_size={})", w.block_size),
        }
    }
}

/// A file handed back by the application for zero-copy emission.
#[derive(Debug)]
pub struct FileWrapper {
    pub(crate) file: File,
    pub(crate) block_size: usize,
}

impl FileWrapper {
    /// Wraps an open file; `block_size` bounds each fallback read.
    pub fn new(file: File, block_size: usize) -> FileWrapper {
        FileWrapper { file, block_size }
    }
}

/// The hosted application.
///
/// Implementations must be thread-safe: requests from different connections
/// are serviced in parallel on dispatcher workers. Within one connection,
/// requests are serviced strictly in arrival order.
pub trait Application: Send + Sync + 'static {
    /// Services one request.
    fn call(&self, environ: &Environ, start_response: &mut StartResponse) -> Body;
}

impl<F> Application for F
where
    F: Fn(&Environ, &mut StartResponse) -> Body + Send + Sync + 'static,
{
    fn call(&self, environ: &Environ, start_response: &mut StartResponse) -> Body {
        self(environ, start_response)
    }
}
