//! Incremental request parsing
//!
//! [`RequestParser`] wraps the ecosystem head parser in a resumable state
//! machine: the channel feeds it whatever bytes arrived, and it reports
//! either "need more", a completed [`Request`], or a [`ParseError`] carrying
//! the response status to emit. Bodies are framed by `Content-Length` or
//! chunked transfer coding and buffered before the request is queued.

use std::fmt::Display;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use super::Version;

const MAX_HEADERS: usize = 100;

/// Upper bound on a buffered request body.
const MAX_BODY: u64 = 1024 * 1024 * 1024;

/// Parse failure, carrying the status of the error response it maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Malformed request line, header, or body framing.
    BadRequest(&'static str),
    /// The header block exceeded the configured bound.
    HeaderFieldsTooLarge,
    /// The declared body exceeds what the server will buffer.
    BodyTooLarge,
    /// A transfer coding other than `chunked` was requested.
    UnsupportedTransferCoding,
    /// An HTTP version other than 1.0 or 1.1 was requested.
    UnsupportedVersion,
}

impl ParseError {
    /// Response status for this failure.
    pub fn status(&self) -> u16 {
        match self {
            ParseError::BadRequest(_) => 400,
            ParseError::HeaderFieldsTooLarge => 431,
            ParseError::BodyTooLarge => 413,
            ParseError::UnsupportedTransferCoding => 501,
            ParseError::UnsupportedVersion => 505,
        }
    }
}

impl Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::BadRequest(detail) => write!(f, "bad request: {detail}"),
            ParseError::HeaderFieldsTooLarge => f.write_str("request header fields too large"),
            ParseError::BodyTooLarge => f.write_str("request body too large"),
            ParseError::UnsupportedTransferCoding => f.write_str("unsupported transfer coding"),
            ParseError::UnsupportedVersion => f.write_str("unsupported HTTP version"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Parsed request line and headers, shared between the channel's queue and
/// the worker servicing the request.
#[derive(Debug)]
pub struct RequestHead {
    /// Request method as sent.
    pub method: String,
    /// Request path without the query string.
    pub path: String,
    /// Query string without the leading `?`.
    pub query: String,
    /// Protocol version.
    pub version: Version,
    /// Headers in arrival order.
    pub headers: Vec<(String, String)>,
    /// The request bears `Expect: 100-continue`.
    pub expect_continue: bool,
    /// The connection may be reused after this request.
    pub keep_alive: bool,
}

impl RequestHead {
    /// First header with the given name, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A completed (or failed) request awaiting service.
#[derive(Debug, Clone)]
pub struct Request {
    /// Shared request head.
    pub head: Arc<RequestHead>,
    /// Buffered request body.
    pub body: Bytes,
    /// Set when parsing failed; the service emits the matching error
    /// response and closes the connection.
    pub error: Option<ParseError>,
}

impl Request {
    pub(crate) fn failed(error: ParseError) -> Request {
        Request {
            head: Arc::new(RequestHead {
                method: String::new(),
                path: String::new(),
                query: String::new(),
                version: Version::H1_0,
                headers: Vec::new(),
                expect_continue: false,
                keep_alive: false,
            }),
            body: Bytes::new(),
            error: Some(error),
        }
    }
}

#[derive(Debug)]
enum State {
    Head,
    Body(BodyFraming),
}

#[derive(Debug)]
enum BodyFraming {
    Length(u64),
    Chunked(ChunkState),
}

#[derive(Debug)]
enum ChunkState {
    Size,
    Data(u64),
    DataCrlf,
    Trailer,
}

/// Resumable request parser; one per channel, reset after each request.
#[derive(Debug)]
pub struct RequestParser {
    max_head: usize,
    state: State,
    head: Option<RequestHead>,
    body: BytesMut,
}

impl RequestParser {
    /// Creates a parser whose header block is bounded by `max_head` bytes.
    pub fn new(max_head: usize) -> RequestParser {
        RequestParser {
            max_head,
            state: State::Head,
            head: None,
            body: BytesMut::new(),
        }
    }

    /// True once the header block is parsed but the body is still arriving.
    pub fn awaiting_body(&self) -> bool {
        matches!(self.state, State::Body(_))
    }

    /// True when the in-progress request asked for `100 Continue`.
    pub fn expect_continue(&self) -> bool {
        self.head.as_ref().map_or(false, |h| h.expect_continue)
    }

    /// Consumes bytes from `inbuf` and returns a request once one
    /// completes. Call repeatedly until it returns `Ok(None)` to drain
    /// pipelined requests from a single read.
    pub fn feed(&mut self, inbuf: &mut BytesMut) -> Result<Option<Request>, ParseError> {
        if let State::Head = self.state {
            if inbuf.is_empty() {
                return Ok(None);
            }
            match self.parse_head(inbuf)? {
                HeadProgress::Partial => return Ok(None),
                HeadProgress::Complete => {}
            }
        }

        let done = match &mut self.state {
            State::Head => unreachable!("head parse left no body framing"),
            State::Body(BodyFraming::Length(remaining)) => {
                if *remaining > 0 {
                    let take = (*remaining).min(inbuf.len() as u64) as usize;
                    self.body.extend_from_slice(&inbuf.split_to(take));
                    *remaining -= take as u64;
                }
                *remaining == 0
            }
            State::Body(BodyFraming::Chunked(_)) => self.parse_chunked(inbuf)?,
        };

        if done {
            Ok(Some(self.finish()))
        } else {
            Ok(None)
        }
    }

    fn parse_head(&mut self, inbuf: &mut BytesMut) -> Result<HeadProgress, ParseError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);

        let status = match req.parse(inbuf) {
            Ok(status) => status,
            Err(httparse::Error::TooManyHeaders) => return Err(ParseError::HeaderFieldsTooLarge),
            Err(httparse::Error::Version) => return Err(ParseError::UnsupportedVersion),
            Err(_) => return Err(ParseError::BadRequest("malformed request head")),
        };

        let head_len = match status {
            httparse::Status::Partial => {
                if inbuf.len() >= self.max_head {
                    return Err(ParseError::HeaderFieldsTooLarge);
                }
                return Ok(HeadProgress::Partial);
            }
            httparse::Status::Complete(n) => {
                if n > self.max_head {
                    return Err(ParseError::HeaderFieldsTooLarge);
                }
                n
            }
        };

        let version = match req.version {
            Some(0) => Version::H1_0,
            Some(1) => Version::H1_1,
            _ => return Err(ParseError::UnsupportedVersion),
        };

        let target = req.path.ok_or(ParseError::BadRequest("missing target"))?;
        let (path, query) = match target.split_once('?') {
            Some((p, q)) => (p.to_owned(), q.to_owned()),
            None => (target.to_owned(), String::new()),
        };

        let mut parsed_headers = Vec::with_capacity(req.headers.len());
        for h in req.headers.iter() {
            let value = std::str::from_utf8(h.value)
                .map_err(|_| ParseError::BadRequest("non-ascii header value"))?;
            parsed_headers.push((h.name.to_owned(), value.trim().to_owned()));
        }

        let expect_continue = header_value(&parsed_headers, "Expect")
            .map_or(false, |v| v.eq_ignore_ascii_case("100-continue"));

        let mut keep_alive = version == Version::H1_1;
        if let Some(connection) = header_value(&parsed_headers, "Connection") {
            if contains_token(connection, "close") {
                keep_alive = false;
            } else if contains_token(connection, "keep-alive") && version == Version::H1_0 {
                keep_alive = true;
            }
        }

        let head = RequestHead {
            method: req.method.unwrap_or("GET").to_owned(),
            path,
            query,
            version,
            headers: parsed_headers,
            expect_continue,
            keep_alive,
        };

        let framing = body_framing(&head)?;
        let _ = inbuf.split_to(head_len);
        self.head = Some(head);

        match framing {
            None => {
                // no body; the request is complete as soon as the head is
                self.state = State::Body(BodyFraming::Length(0));
            }
            Some(framing) => self.state = State::Body(framing),
        }
        Ok(HeadProgress::Complete)
    }

    /// Drives the chunked decoder; returns true once the terminal chunk and
    /// trailer section have been consumed.
    fn parse_chunked(&mut self, inbuf: &mut BytesMut) -> Result<bool, ParseError> {
        loop {
            let chunk = match &mut self.state {
                State::Body(BodyFraming::Chunked(chunk)) => chunk,
                _ => unreachable!("parse_chunked outside chunked body"),
            };
            match chunk {
                ChunkState::Size => {
                    let Some(line_end) = find_crlf(inbuf) else {
                        if inbuf.len() > 64 {
                            return Err(ParseError::BadRequest("oversized chunk size line"));
                        }
                        return Ok(false);
                    };
                    let line = inbuf.split_to(line_end + 2);
                    let digits = &line[..line_end];
                    // chunk extensions after ';' are tolerated and ignored
                    let digits = match digits.iter().position(|&b| b == b';') {
                        Some(i) => &digits[..i],
                        None => digits,
                    };
                    let text = std::str::from_utf8(digits)
                        .map_err(|_| ParseError::BadRequest("malformed chunk size"))?;
                    let size = u64::from_str_radix(text.trim(), 16)
                        .map_err(|_| ParseError::BadRequest("malformed chunk size"))?;
                    if self.body.len() as u64 + size > MAX_BODY {
                        return Err(ParseError::BodyTooLarge);
                    }
                    *chunk = if size == 0 {
                        ChunkState::Trailer
                    } else {
                        ChunkState::Data(size)
                    };
                }
                ChunkState::Data(remaining) => {
                    let take = (*remaining).min(inbuf.len() as u64) as usize;
                    self.body.extend_from_slice(&inbuf.split_to(take));
                    *remaining -= take as u64;
                    if *remaining > 0 {
                        return Ok(false);
                    }
                    *chunk = ChunkState::DataCrlf;
                }
                ChunkState::DataCrlf => {
                    if inbuf.len() < 2 {
                        return Ok(false);
                    }
                    if &inbuf[..2] != b"\r\n" {
                        return Err(ParseError::BadRequest("missing chunk delimiter"));
                    }
                    let _ = inbuf.split_to(2);
                    *chunk = ChunkState::Size;
                }
                ChunkState::Trailer => {
                    // the trailer section ends at the first empty line
                    let Some(line_end) = find_crlf(inbuf) else {
                        if inbuf.len() > self.max_head {
                            return Err(ParseError::HeaderFieldsTooLarge);
                        }
                        return Ok(false);
                    };
                    let _ = inbuf.split_to(line_end + 2);
                    if line_end == 0 {
                        return Ok(true);
                    }
                }
            }
        }
    }

    fn finish(&mut self) -> Request {
        let head = self.head.take().expect("finish without parsed head");
        let body = self.body.split().freeze();
        self.state = State::Head;
        Request {
            head: Arc::new(head),
            body,
            error: None,
        }
    }
}

enum HeadProgress {
    Partial,
    Complete,
}

fn body_framing(head: &RequestHead) -> Result<Option<BodyFraming>, ParseError> {
    if let Some(te) = head.header("Transfer-Encoding") {
        if head.version == Version::H1_0 {
            return Err(ParseError::BadRequest("transfer coding on HTTP/1.0"));
        }
        let last = te.rsplit(',').next().map(str::trim).unwrap_or("");
        if !last.eq_ignore_ascii_case("chunked") {
            return Err(ParseError::UnsupportedTransferCoding);
        }
        return Ok(Some(BodyFraming::Chunked(ChunkState::Size)));
    }

    match head.header("Content-Length") {
        None => Ok(None),
        Some(value) => {
            let length: u64 = value
                .trim()
                .parse()
                .map_err(|_| ParseError::BadRequest("malformed content-length"))?;
            if length > MAX_BODY {
                return Err(ParseError::BodyTooLarge);
            }
            if length == 0 {
                Ok(None)
            } else {
                Ok(Some(BodyFraming::Length(length)))
            }
        }
    }
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn contains_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod test {
    use super::{ParseError, RequestParser};
    use crate::proto::Version;
    use bytes::BytesMut;

    fn parser() -> RequestParser {
        RequestParser::new(8192)
    }

    #[test]
    fn parses_bodyless_get() {
        let mut p = parser();
        let mut buf = BytesMut::from(&b"GET /hello?x=1 HTTP/1.1\r\nHost: a\r\n\r\n"[..]);
        let req = p.feed(&mut buf).unwrap().unwrap();
        assert_eq!("GET", req.head.method);
        assert_eq!("/hello", req.head.path);
        assert_eq!("x=1", req.head.query);
        assert_eq!(Version::H1_1, req.head.version);
        assert!(req.head.keep_alive);
        assert!(req.body.is_empty());
        assert!(buf.is_empty());
    }

    #[test]
    fn resumes_across_split_feeds() {
        let mut p = parser();
        let mut buf = BytesMut::from(&b"POST /in HTTP/1.1\r\nContent-Le"[..]);
        assert!(p.feed(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"ngth: 5\r\n\r\nhel");
        assert!(p.feed(&mut buf).unwrap().is_none());
        assert!(p.awaiting_body());
        buf.extend_from_slice(b"lo");
        let req = p.feed(&mut buf).unwrap().unwrap();
        assert_eq!(&b"hello"[..], &req.body[..]);
    }

    #[test]
    fn drains_pipelined_requests_from_one_buffer() {
        let mut p = parser();
        let mut buf =
            BytesMut::from(&b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n"[..]);
        let first = p.feed(&mut buf).unwrap().unwrap();
        let second = p.feed(&mut buf).unwrap().unwrap();
        assert_eq!("/a", first.head.path);
        assert_eq!("/b", second.head.path);
        assert!(p.feed(&mut buf).unwrap().is_none());
    }

    #[test]
    fn decodes_chunked_body_with_extension_and_trailer() {
        let mut p = parser();
        let mut buf = BytesMut::from(
            &b"PUT /c HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
               4;ext=1\r\nwiki\r\n5\r\npedia\r\n0\r\nX-Trail: 1\r\n\r\n"[..],
        );
        let req = p.feed(&mut buf).unwrap().unwrap();
        assert_eq!(&b"wikipedia"[..], &req.body[..]);
    }

    #[test]
    fn chunked_resumes_mid_chunk() {
        let mut p = parser();
        let mut buf = BytesMut::from(
            &b"PUT /c HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n6\r\nabc"[..],
        );
        assert!(p.feed(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"def\r\n0\r\n\r\n");
        let req = p.feed(&mut buf).unwrap().unwrap();
        assert_eq!(&b"abcdef"[..], &req.body[..]);
    }

    #[test]
    fn detects_expect_continue_while_awaiting_body() {
        let mut p = parser();
        let mut buf = BytesMut::from(
            &b"POST /u HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 3\r\n\r\n"[..],
        );
        assert!(p.feed(&mut buf).unwrap().is_none());
        assert!(p.awaiting_body());
        assert!(p.expect_continue());
    }

    #[test]
    fn http10_defaults_to_close() {
        let mut p = parser();
        let mut buf = BytesMut::from(&b"GET / HTTP/1.0\r\n\r\n"[..]);
        let req = p.feed(&mut buf).unwrap().unwrap();
        assert!(!req.head.keep_alive);
    }

    #[test]
    fn http10_keep_alive_token_enables_reuse() {
        let mut p = parser();
        let mut buf =
            BytesMut::from(&b"GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n"[..]);
        let req = p.feed(&mut buf).unwrap().unwrap();
        assert!(req.head.keep_alive);
    }

    #[test]
    fn connection_close_disables_reuse() {
        let mut p = parser();
        let mut buf =
            BytesMut::from(&b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n"[..]);
        let req = p.feed(&mut buf).unwrap().unwrap();
        assert!(!req.head.keep_alive);
    }

    #[test]
    fn garbage_is_a_bad_request() {
        let mut p = parser();
        let mut buf = BytesMut::from(&b"\x00\x01\x02 nonsense\r\n\r\n"[..]);
        match p.feed(&mut buf) {
            Err(ParseError::BadRequest(_)) => {}
            other => panic!("expected bad request, got {other:?}"),
        }
    }

    #[test]
    fn oversized_head_is_rejected() {
        let mut p = RequestParser::new(64);
        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\nX-Filler: "[..]);
        buf.extend_from_slice(&[b'a'; 128]);
        assert_eq!(
            Err(ParseError::HeaderFieldsTooLarge),
            p.feed(&mut buf).map(|_| ())
        );
    }

    #[test]
    fn malformed_content_length_is_rejected() {
        let mut p = parser();
        let mut buf =
            BytesMut::from(&b"POST / HTTP/1.1\r\nContent-Length: nope\r\n\r\n"[..]);
        assert!(matches!(
            p.feed(&mut buf),
            Err(ParseError::BadRequest(_))
        ));
    }

    #[test]
    fn non_chunked_transfer_coding_is_unsupported() {
        let mut p = parser();
        let mut buf =
            BytesMut::from(&b"POST / HTTP/1.1\r\nTransfer-Encoding: gzip\r\n\r\n"[..]);
        assert_eq!(
            Err(ParseError::UnsupportedTransferCoding),
            p.feed(&mut buf).map(|_| ())
        );
    }
}
