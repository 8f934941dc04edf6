//! Response head encoding and error responses
//!
//! Emits the status line and header block, injecting `Date` and `Server`
//! when the application did not provide them. No body byte ever precedes
//! the complete header block of its response.

use std::time::SystemTime;

use bytes::{BufMut, Bytes, BytesMut};

use super::Version;
use crate::app::Header;

/// Reason phrase for the statuses the server itself emits, plus the common
/// application ones.
pub fn reason(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

/// Framing decisions the encoder stamps onto the header block.
#[derive(Debug, Clone, Copy)]
pub struct Framing {
    /// `Content-Length` to declare, when the body size is known up front.
    pub content_length: Option<u64>,
    /// The connection closes after this response.
    pub close: bool,
}

/// Encodes the status line and header block for one response.
///
/// Application-supplied `Content-Length`, `Date`, and `Server` headers are
/// passed through; missing ones are injected. A `Connection` header is
/// emitted whenever the decision differs from the version's default.
pub fn encode_head(
    version: Version,
    status: u16,
    headers: &[Header],
    ident: &str,
    framing: Framing,
) -> Bytes {
    let mut buf = BytesMut::with_capacity(256);
    buf.put_slice(format!("{version} {status} {}\r\n", reason(status)).as_bytes());

    let mut saw_date = false;
    let mut saw_server = false;
    let mut saw_length = false;

    for (name, value) in headers {
        if name.eq_ignore_ascii_case("Date") {
            saw_date = true;
        } else if name.eq_ignore_ascii_case("Server") {
            saw_server = true;
        } else if name.eq_ignore_ascii_case("Content-Length") {
            saw_length = true;
        } else if name.eq_ignore_ascii_case("Connection") {
            // the channel owns connection persistence
            continue;
        }
        buf.put_slice(name.as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }

    if !saw_date {
        buf.put_slice(b"Date: ");
        buf.put_slice(httpdate::fmt_http_date(SystemTime::now()).as_bytes());
        buf.put_slice(b"\r\n");
    }
    if !saw_server {
        buf.put_slice(b"Server: ");
        buf.put_slice(ident.as_bytes());
        buf.put_slice(b"\r\n");
    }
    if !saw_length {
        if let Some(length) = framing.content_length {
            buf.put_slice(format!("Content-Length: {length}\r\n").as_bytes());
        }
    }

    match (framing.close, version) {
        (true, Version::H1_1) => buf.put_slice(b"Connection: close\r\n"),
        (false, Version::H1_0) => buf.put_slice(b"Connection: Keep-Alive\r\n"),
        _ => {}
    }

    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// The interim response for `Expect: 100-continue`.
pub fn continue_response() -> Bytes {
    Bytes::from_static(b"HTTP/1.1 100 Continue\r\n\r\n")
}

/// A complete minimal error response (head plus plain-text body).
///
/// `detail` is appended to the body only when the caller decided to expose
/// it (`expose_tracebacks` for application failures).
pub fn error_response(status: u16, ident: &str, detail: Option<&str>) -> Bytes {
    let phrase = reason(status);
    let mut body = String::with_capacity(64);
    body.push_str(phrase);
    body.push_str("\r\n");
    if let Some(detail) = detail {
        body.push_str("\r\n");
        body.push_str(detail);
        body.push_str("\r\n");
    }

    let head = encode_head(
        Version::H1_1,
        status,
        &[(
            "Content-Type".to_owned(),
            "text/plain; charset=utf-8".to_owned(),
        )],
        ident,
        Framing {
            content_length: Some(body.len() as u64),
            close: true,
        },
    );

    let mut buf = BytesMut::with_capacity(head.len() + body.len());
    buf.put_slice(&head);
    buf.put_slice(body.as_bytes());
    buf.freeze()
}
