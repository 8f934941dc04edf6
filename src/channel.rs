//! Per-connection channel
//!
//! A channel owns one accepted socket and the state machine between its two
//! halves: the reactor half parses inbound bytes into requests and drains
//! the output buffer to the socket; the shared half is what dispatcher
//! workers touch — the request FIFO under `task_lock` and the output chunk
//! list under `outbuf_lock`, with a condition variable providing
//! high-watermark backpressure for fast producers.
//!
//! Parallelism is across channels, never within one: at most one service
//! task per channel is in flight, so response order on the wire equals the
//! order requests completed parsing.

use std::collections::VecDeque;
use std::fmt;
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use crossbeam_channel::Sender;
use mio::{Interest, Registry, Token};
use tracing::{debug, error, warn};

use crate::adjustments::Adjustments;
use crate::app::Application;
use crate::net::{Conduit, PeerAddr};
use crate::proto::request::{Request, RequestParser};
use crate::proto::response;
use crate::task::{ServiceTask, ThreadedTaskDispatcher};
use crate::trigger::Trigger;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One chunk of pending output: bytes, or a file region emitted through the
/// zero-copy path.
pub(crate) enum OutChunk {
    /// Raw bytes, headers or body.
    Data(Bytes),
    /// A region of an open file.
    FileRegion(FileRegion),
}

impl OutChunk {
    fn len(&self) -> usize {
        match self {
            OutChunk::Data(bytes) => bytes.len(),
            OutChunk::FileRegion(region) => region.remaining as usize,
        }
    }
}

impl fmt::Debug for OutChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutChunk::Data(bytes) => write!(f, "Data({} bytes)", bytes.len()),
            OutChunk::FileRegion(region) => {
                write!(f, "FileRegion({} bytes left)", region.remaining)
            }
        }
    }
}

/// A bounded region of a file scheduled for emission.
#[derive(Debug)]
pub(crate) struct FileRegion {
    pub(crate) file: File,
    pub(crate) offset: u64,
    pub(crate) remaining: u64,
    pub(crate) block_size: usize,
}

#[derive(Debug, Default)]
struct OutBuf {
    chunks: VecDeque<OutChunk>,
    total_len: usize,
    close_when_flushed: bool,
    force_flush: bool,
}

#[derive(Debug, Default)]
struct ServiceState {
    requests: VecDeque<Request>,
    running_tasks: bool,
}

/// The half of a channel that dispatcher workers share with the reactor.
pub struct ChannelShared {
    token: Token,
    peer: PeerAddr,
    adj: Arc<Adjustments>,
    app: Arc<dyn Application>,
    dispatcher: Arc<ThreadedTaskDispatcher>,
    trigger: Arc<Trigger>,
    flush_tx: Sender<Token>,
    outbuf: Mutex<OutBuf>,
    drained: Condvar,
    state: Mutex<ServiceState>,
    will_close: AtomicBool,
}

impl fmt::Debug for ChannelShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelShared")
            .field("token", &self.token)
            .field("peer", &self.peer)
            .field("will_close", &self.will_close.load(Ordering::Relaxed))
            .finish()
    }
}

impl ChannelShared {
    /// Monotonic close flag; once observed true it never resets.
    pub fn will_close(&self) -> bool {
        self.will_close.load(Ordering::Acquire)
    }

    pub(crate) fn peer(&self) -> &PeerAddr {
        &self.peer
    }

    pub(crate) fn adjustments(&self) -> &Adjustments {
        &self.adj
    }

    pub(crate) fn application(&self) -> &Arc<dyn Application> {
        &self.app
    }

    pub(crate) fn dispatcher(&self) -> &Arc<ThreadedTaskDispatcher> {
        &self.dispatcher
    }

    /// Appends one chunk of output and wakes the reactor to drain it.
    ///
    /// Called from worker threads. Blocks while the pending output exceeds
    /// the high watermark, releasing the lock so the reactor can drain in
    /// parallel. Returns false once the channel is closing: the producer
    /// should abandon the response.
    pub(crate) fn write_soon(&self, chunk: OutChunk) -> bool {
        if self.will_close() {
            return false;
        }

        let mut outbuf = lock(&self.outbuf);
        outbuf.total_len += chunk.len();
        outbuf.chunks.push_back(chunk);
        if outbuf.total_len > self.adj.outbuf_overflow {
            outbuf.force_flush = true;
        }
        self.wake_reactor();

        while outbuf.total_len > self.adj.outbuf_high_watermark && !self.will_close() {
            outbuf = self
                .drained
                .wait(outbuf)
                .unwrap_or_else(PoisonError::into_inner);
        }
        !self.will_close()
    }

    /// `write_soon` for plain bytes.
    pub(crate) fn write_data(&self, bytes: Bytes) -> bool {
        if bytes.is_empty() {
            return !self.will_close();
        }
        self.write_soon(OutChunk::Data(bytes))
    }

    /// Emits a canned error response and closes once it is flushed. Usable
    /// from both halves; the request queue is abandoned.
    pub(crate) fn emit_error_and_close(&self, status: u16, detail: Option<&str>) {
        let payload = response::error_response(status, &self.adj.ident, detail);
        {
            let mut state = lock(&self.state);
            state.requests.clear();
            state.running_tasks = false;
        }
        {
            let mut outbuf = lock(&self.outbuf);
            outbuf.total_len += payload.len();
            outbuf.chunks.push_back(OutChunk::Data(payload));
            outbuf.close_when_flushed = true;
        }
        self.wake_reactor();
    }

    /// Clones the request at the head of the queue, if any.
    pub(crate) fn head_request(&self) -> Option<Request> {
        lock(&self.state).requests.front().cloned()
    }

    /// Pops the serviced head request. Returns true when more requests are
    /// queued and a follow-up task should be submitted; otherwise clears
    /// `running_tasks`.
    pub(crate) fn request_done(&self, close_when_done: bool) -> bool {
        let more = {
            let mut state = lock(&self.state);
            state.requests.pop_front();
            if close_when_done {
                // nothing after this response can be answered
                state.requests.clear();
            }
            if state.requests.is_empty() {
                state.running_tasks = false;
                false
            } else {
                true
            }
        };
        if close_when_done {
            lock(&self.outbuf).close_when_flushed = true;
        }
        self.wake_reactor();
        more
    }

    /// Abandons queued requests; used on cancellation and close.
    pub(crate) fn abort_service(&self) {
        let mut state = lock(&self.state);
        state.requests.clear();
        state.running_tasks = false;
    }

    /// True while a service task owns this channel's queue.
    pub(crate) fn running_tasks(&self) -> bool {
        lock(&self.state).running_tasks
    }

    fn has_queued_requests(&self) -> bool {
        !lock(&self.state).requests.is_empty()
    }

    fn pending_output(&self) -> usize {
        lock(&self.outbuf).total_len
    }

    /// Queues a token for the reactor and pulls the trigger.
    fn wake_reactor(&self) {
        let _ = self.flush_tx.send(self.token);
        self.trigger.pull();
    }

    fn close(&self) {
        self.will_close.store(true, Ordering::Release);
        // release any producer stuck on the watermark
        self.drained.notify_all();
    }
}

/// The reactor half of a connection. All methods run on the reactor thread.
pub struct Channel {
    conduit: Box<dyn Conduit>,
    acceptor: usize,
    shared: Arc<ChannelShared>,
    parser: RequestParser,
    inbuf: BytesMut,
    scratch: Vec<u8>,
    sent_continue: bool,
    last_activity: Instant,
    registered: Option<Interest>,
    rearm_write: bool,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("shared", &self.shared)
            .field("acceptor", &self.acceptor)
            .field("inbuf", &self.inbuf.len())
            .field("registered", &self.registered)
            .finish()
    }
}

impl Channel {
    /// Builds a channel for a freshly accepted conduit.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        conduit: Box<dyn Conduit>,
        peer: PeerAddr,
        acceptor: usize,
        token: Token,
        adj: Arc<Adjustments>,
        app: Arc<dyn Application>,
        dispatcher: Arc<ThreadedTaskDispatcher>,
        trigger: Arc<Trigger>,
        flush_tx: Sender<Token>,
    ) -> Channel {
        let max_head = adj.inbuf_overflow;
        let scratch = vec![0u8; adj.recv_bytes];
        let shared = Arc::new(ChannelShared {
            token,
            peer,
            adj,
            app,
            dispatcher,
            trigger,
            flush_tx,
            outbuf: Mutex::new(OutBuf::default()),
            drained: Condvar::new(),
            state: Mutex::new(ServiceState::default()),
            will_close: AtomicBool::new(false),
        });
        Channel {
            conduit,
            acceptor,
            shared,
            parser: RequestParser::new(max_head),
            inbuf: BytesMut::new(),
            scratch,
            sent_continue: false,
            last_activity: Instant::now(),
            registered: None,
            rearm_write: false,
        }
    }

    pub(crate) fn shared(&self) -> &Arc<ChannelShared> {
        &self.shared
    }

    pub(crate) fn acceptor(&self) -> usize {
        self.acceptor
    }

    pub(crate) fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub(crate) fn running_tasks(&self) -> bool {
        self.shared.running_tasks()
    }

    pub(crate) fn will_close(&self) -> bool {
        self.shared.will_close()
    }

    /// Marks the channel for closing; the reactor reaps it on the next pass.
    pub(crate) fn mark_will_close(&self) {
        self.shared.close();
    }

    /// New bytes are welcome while the channel is open, no completed request
    /// is waiting for service, and the unparsed backlog is under the
    /// overflow bound. Pausing while a request is queued is what keeps a
    /// slow application from pulling unbounded read-ahead into memory.
    pub(crate) fn wants_read(&self) -> bool {
        !self.will_close()
            && !self.shared.has_queued_requests()
            && self.inbuf.len() < self.shared.adj.inbuf_overflow
    }

    /// Write readiness matters only while output is pending.
    pub(crate) fn wants_write(&self) -> bool {
        self.shared.pending_output() > 0
    }

    fn desired_interest(&self) -> Option<Interest> {
        match (self.wants_read(), self.wants_write()) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    /// Brings the mio registration in line with the channel's state.
    ///
    /// Re-registration also rearms edge-triggered readiness, which is what
    /// lets a paused channel pick up bytes that were already buffered in the
    /// kernel, and a budget-capped writer continue on the next poll.
    pub(crate) fn sync_interest(&mut self, registry: &Registry) {
        let desired = self.desired_interest();
        let result = match (self.registered, desired) {
            (None, None) => Ok(()),
            (None, Some(interest)) => self.conduit.register(registry, self.shared.token, interest),
            (Some(_), None) => {
                let res = self.conduit.deregister(registry);
                self.registered = None;
                res
            }
            (Some(current), Some(interest)) => {
                let writable_rearm = self.rearm_write && interest.is_writable();
                if current != interest || writable_rearm {
                    self.conduit
                        .reregister(registry, self.shared.token, interest)
                } else {
                    Ok(())
                }
            }
        };
        self.rearm_write = false;
        if let Some(interest) = desired {
            if result.is_ok() {
                self.registered = Some(interest);
            }
        }
        if let Err(err) = result {
            error!(target: "tjener.channel", error = %err, "interest registration failed");
            self.shared.close();
        }
    }

    /// Receives from the socket and drives the parser. Runs to `WouldBlock`
    /// unless flow control pauses reads first.
    pub(crate) fn handle_read(&mut self) {
        loop {
            if !self.wants_read() {
                return;
            }
            match self.conduit.read(&mut self.scratch) {
                Ok(0) => {
                    self.shared.close();
                    return;
                }
                Ok(n) => {
                    self.last_activity = Instant::now();
                    self.inbuf.extend_from_slice(&self.scratch[..n]);
                    self.received();
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if is_peer_reset(&err) => {
                    if self.shared.adj.log_socket_errors {
                        debug!(target: "tjener.channel", peer = %self.shared.peer, error = %err, "peer reset");
                    }
                    self.shared.close();
                    return;
                }
                Err(err) => {
                    error!(target: "tjener.channel", peer = %self.shared.peer, error = %err, "read failed");
                    self.shared.close();
                    return;
                }
            }
        }
    }

    /// Drains completed requests out of the parser and submits service work.
    fn received(&mut self) {
        loop {
            match self.parser.feed(&mut self.inbuf) {
                Ok(Some(request)) => self.queue_request(request),
                Ok(None) => break,
                Err(err) => {
                    warn!(target: "tjener.channel", peer = %self.shared.peer, error = %err, "request parse failed");
                    self.inbuf.clear();
                    self.queue_request(Request::failed(err));
                    break;
                }
            }
        }

        if self.parser.awaiting_body() && self.parser.expect_continue() && !self.sent_continue {
            self.sent_continue = true;
            let mut outbuf = lock(&self.shared.outbuf);
            let interim = response::continue_response();
            outbuf.total_len += interim.len();
            outbuf.chunks.push_back(OutChunk::Data(interim));
        }
    }

    fn queue_request(&mut self, request: Request) {
        self.sent_continue = false;
        let submit = {
            let mut state = lock(&self.shared.state);
            state.requests.push_back(request);
            if state.running_tasks {
                false
            } else {
                state.running_tasks = true;
                true
            }
        };
        if submit {
            let task = Box::new(ServiceTask::new(Arc::clone(&self.shared)));
            if self.shared.dispatcher.add_task(task).is_err() {
                // shutting down; tell the peer and get off the wire
                self.shared.emit_error_and_close(503, None);
            }
        }
    }

    /// Sends from the head of the output buffer, up to `send_bytes` unless a
    /// forced flush is pending, removing fully drained chunks.
    pub(crate) fn handle_write(&mut self) {
        let adj = Arc::clone(&self.shared.adj);
        let shared = Arc::clone(&self.shared);
        let mut outbuf = lock(&shared.outbuf);

        let budget = if outbuf.force_flush {
            usize::MAX
        } else {
            adj.send_bytes
        };
        let mut sent = 0usize;

        while sent < budget {
            let Some(chunk) = outbuf.chunks.front_mut() else {
                outbuf.force_flush = false;
                break;
            };
            let step = match chunk {
                OutChunk::Data(bytes) => {
                    let take = bytes.len().min(budget - sent);
                    match self.conduit.write(&bytes[..take]) {
                        Ok(0) if take > 0 => Err(std::io::Error::from(ErrorKind::WriteZero)),
                        Ok(n) => {
                            let _ = bytes.split_to(n);
                            Ok(n)
                        }
                        Err(err) => Err(err),
                    }
                }
                OutChunk::FileRegion(region) => {
                    write_file_region(self.conduit.as_mut(), region, budget - sent)
                }
            };
            match step {
                Ok(0) => {
                    // a file region ended short of its declared length; the
                    // promised byte count cannot be met, so give up the
                    // connection after what is already queued
                    let dropped = chunk.len();
                    debug_assert!(outbuf.total_len >= dropped);
                    outbuf.total_len -= dropped;
                    outbuf.chunks.pop_front();
                    outbuf.close_when_flushed = true;
                }
                Ok(n) => {
                    debug_assert!(outbuf.total_len >= n);
                    outbuf.total_len -= n;
                    sent += n;
                    if outbuf.chunks.front().map_or(false, |c| c.len() == 0) {
                        outbuf.chunks.pop_front();
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    if is_peer_reset(&err) {
                        if adj.log_socket_errors {
                            debug!(target: "tjener.channel", peer = %shared.peer, error = %err, "peer reset on write");
                        }
                    } else {
                        error!(target: "tjener.channel", peer = %shared.peer, error = %err, "write failed");
                    }
                    shared.close();
                    break;
                }
            }
        }

        if sent > 0 {
            self.last_activity = Instant::now();
        }
        // budget exhausted with bytes left: rearm so the next poll returns
        self.rearm_write = sent >= budget && !outbuf.chunks.is_empty();

        if outbuf.total_len <= adj.outbuf_high_watermark {
            shared.drained.notify_all();
        }
        if outbuf.close_when_flushed && outbuf.chunks.is_empty() {
            drop(outbuf);
            shared.close();
        }
    }

    /// Removes the channel from the reactor and releases the socket. After
    /// this no further callbacks run; workers observing the shared half see
    /// `will_close` and abandon their response.
    pub(crate) fn handle_close(mut self, registry: &Registry) {
        self.shared.close();
        self.shared.abort_service();
        if self.registered.take().is_some() {
            let _ = self.conduit.deregister(registry);
        }
        // socket closes when the conduit drops
    }
}

fn is_peer_reset(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::BrokenPipe
            | ErrorKind::TimedOut
            | ErrorKind::WriteZero
    )
}

/// Emits up to `budget` bytes of a file region: `sendfile` on Linux when
/// the conduit exposes a descriptor, block-sized read/write otherwise.
/// `Ok(0)` means the file ended before the region was satisfied.
fn write_file_region(
    conduit: &mut dyn Conduit,
    region: &mut FileRegion,
    budget: usize,
) -> std::io::Result<usize> {
    if region.remaining == 0 {
        return Ok(0);
    }

    #[cfg(target_os = "linux")]
    {
        match sendfile(conduit, region, budget) {
            Ok(n) => return Ok(n),
            Err(err)
                if matches!(
                    err.raw_os_error(),
                    Some(libc::EINVAL) | Some(libc::ENOSYS) | Some(libc::EBADF)
                ) =>
            {
                // not a plain stream socket; fall through to read/write
            }
            Err(err) => return Err(err),
        }
    }

    let take = region
        .remaining
        .min(region.block_size as u64)
        .min(budget as u64) as usize;
    let mut buf = vec![0u8; take];
    let read = read_region(&region.file, &mut buf, region.offset)?;
    if read == 0 {
        return Ok(0);
    }
    let written = conduit.write(&buf[..read])?;
    region.offset += written as u64;
    region.remaining -= written as u64;
    Ok(written)
}

#[cfg(target_os = "linux")]
fn sendfile(
    conduit: &mut dyn Conduit,
    region: &mut FileRegion,
    budget: usize,
) -> std::io::Result<usize> {
    use std::os::fd::AsRawFd;

    let count = region.remaining.min(budget as u64) as usize;
    let mut offset = region.offset as libc::off_t;
    let rc = unsafe {
        libc::sendfile(
            conduit.raw_fd(),
            region.file.as_raw_fd(),
            &mut offset,
            count,
        )
    };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let sent = rc as u64;
    region.offset += sent;
    region.remaining -= sent;
    Ok(sent as usize)
}

#[cfg(unix)]
fn read_region(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(not(unix))]
fn read_region(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    use std::io::{Seek, SeekFrom};
    let mut file = file;
    file.seek(SeekFrom::Start(offset))?;
    file.read(buf)
}


#[cfg(test)]
mod test {
    use super::testing::TestConduit;
    use super::{Channel, ChannelShared, FileRegion, OutChunk};
    use crate::adjustments::Adjustments;
    use crate::app::{Application, Body, Environ, StartResponse};
    use crate::net::{Conduit, PeerAddr};
    use crate::task::ThreadedTaskDispatcher;
    use crate::trigger::Trigger;
    use bytes::Bytes;
    use mio::{Interest, Poll, Registry, Token};
    use std::io::{Read, Write};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Condvar, Mutex};
    use std::thread;
    use std::time::Duration;

    struct Fixture {
        channel: Channel,
        shared: Arc<ChannelShared>,
        written: Arc<Mutex<Vec<u8>>>,
        // keeps the trigger's poll registration alive
        _poll: Poll,
    }

    fn fixture(input: &[u8], app: Arc<dyn Application>, adj: Adjustments) -> Fixture {
        let poll = Poll::new().unwrap();
        let trigger = Arc::new(Trigger::new(poll.registry()).unwrap());
        let dispatcher = Arc::new(ThreadedTaskDispatcher::new(1));
        let (flush_tx, _flush_rx) = crossbeam_channel::unbounded();
        let (conduit, written) = TestConduit::new(input);
        let channel = Channel::new(
            Box::new(conduit),
            PeerAddr::Unix,
            0,
            Token(0),
            Arc::new(adj),
            app,
            dispatcher,
            trigger,
            flush_tx,
        );
        let shared = Arc::clone(channel.shared());
        Fixture {
            channel,
            shared,
            written,
            _poll: poll,
        }
    }

    fn echo_path_app() -> Arc<dyn Application> {
        Arc::new(|env: &Environ, sr: &mut StartResponse| {
            sr.start(
                200,
                vec![("Content-Type".to_owned(), "text/plain".to_owned())],
            );
            Body::Full(Bytes::from(env.path.clone()))
        })
    }

    fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("condition not reached in time");
    }

    fn drain_until_idle(fx: &mut Fixture) {
        for _ in 0..500 {
            fx.channel.handle_write();
            let idle = !fx.shared.running_tasks()
                && fx.shared.head_request().is_none()
                && fx.shared.pending_output() == 0;
            if idle {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("channel never went idle");
    }

    #[test]
    fn write_soon_round_trip_preserves_order_and_bytes() {
        let mut fx = fixture(b"", echo_path_app(), Adjustments::default());

        let chunks: Vec<Bytes> = (0..64)
            .map(|i| Bytes::from(format!("chunk-{i:03}|")))
            .collect();
        let expected: Vec<u8> = chunks.iter().flat_map(|c| c.to_vec()).collect();

        let shared = Arc::clone(&fx.shared);
        let producer = {
            let chunks = chunks.clone();
            thread::spawn(move || {
                for chunk in chunks {
                    assert!(shared.write_data(chunk));
                }
            })
        };

        producer.join().unwrap();
        while fx.shared.pending_output() > 0 {
            fx.channel.handle_write();
        }
        assert_eq!(expected, *fx.written.lock().unwrap());
    }

    #[test]
    fn send_bytes_caps_one_write_pass() {
        let adj = Adjustments {
            send_bytes: 8,
            ..Adjustments::default()
        };
        let mut fx = fixture(b"", echo_path_app(), adj);
        assert!(fx.shared.write_data(Bytes::from_static(b"0123456789abcdef")));

        fx.channel.handle_write();
        assert_eq!(8, fx.written.lock().unwrap().len());
        fx.channel.handle_write();
        assert_eq!(16, fx.written.lock().unwrap().len());
    }

    #[test]
    fn pipelined_requests_answered_in_request_order() {
        let mut fx = fixture(
            b"GET /first HTTP/1.1\r\nHost: t\r\n\r\nGET /second HTTP/1.1\r\nHost: t\r\n\r\n",
            echo_path_app(),
            Adjustments::default(),
        );

        fx.channel.handle_read();
        drain_until_idle(&mut fx);

        let written = fx.written.lock().unwrap();
        let text = String::from_utf8_lossy(&written);
        let first = text.find("/first").expect("first response missing");
        let second = text.find("/second").expect("second response missing");
        assert!(first < second);
        assert_eq!(2, text.matches("HTTP/1.1 200 OK").count());
        assert!(!fx.channel.will_close());
    }

    #[test]
    fn reads_pause_while_a_request_waits_for_service() {
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let app_gate = gate.clone();
        let app: Arc<dyn Application> = Arc::new(move |_env: &Environ, sr: &mut StartResponse| {
            let (lock, cv) = &*app_gate;
            let mut open = lock.lock().unwrap();
            while !*open {
                open = cv.wait(open).unwrap();
            }
            sr.start(204, vec![]);
            Body::Empty
        });

        let mut fx = fixture(
            b"GET /slow HTTP/1.1\r\n\r\nGET /next HTTP/1.1\r\n\r\n",
            app,
            Adjustments::default(),
        );
        assert!(fx.channel.wants_read());
        fx.channel.handle_read();
        // both requests parsed and queued; reads must stay paused
        assert!(!fx.channel.wants_read());

        let (lock, cv) = &*gate;
        *lock.lock().unwrap() = true;
        cv.notify_all();

        drain_until_idle(&mut fx);
        assert!(fx.channel.wants_read());
    }

    #[test]
    fn expect_continue_gets_an_interim_response() {
        let mut fx = fixture(
            b"POST /upload HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 5\r\n\r\n",
            echo_path_app(),
            Adjustments::default(),
        );

        fx.channel.handle_read();
        assert!(fx.channel.wants_write());
        fx.channel.handle_write();
        let written = fx.written.lock().unwrap().clone();
        assert!(written.starts_with(b"HTTP/1.1 100 Continue\r\n\r\n"));
    }

    #[test]
    fn parse_failure_produces_400_and_closes() {
        let mut fx = fixture(
            b"\x01\x02garbage\r\n\r\n",
            echo_path_app(),
            Adjustments::default(),
        );

        fx.channel.handle_read();
        drain_until_idle(&mut fx);
        fx.channel.handle_write();

        let written = fx.written.lock().unwrap();
        let text = String::from_utf8_lossy(&written);
        assert!(text.starts_with("HTTP/1.1 400 Bad Request"));
        drop(written);
        assert!(fx.channel.will_close());
    }

    #[test]
    fn application_panic_produces_500() {
        let app: Arc<dyn Application> = Arc::new(|_env: &Environ, _sr: &mut StartResponse| {
            panic!("exploded");
        });
        let mut fx = fixture(b"GET / HTTP/1.1\r\n\r\n", app, Adjustments::default());

        fx.channel.handle_read();
        drain_until_idle(&mut fx);
        fx.channel.handle_write();

        let written = fx.written.lock().unwrap();
        let text = String::from_utf8_lossy(&written);
        assert!(text.starts_with("HTTP/1.1 500 Internal Server Error"));
        // tracebacks stay hidden unless opted in
        assert!(!text.contains("exploded"));
    }

    #[test]
    fn panic_detail_exposed_when_configured() {
        let app: Arc<dyn Application> = Arc::new(|_env: &Environ, _sr: &mut StartResponse| {
            panic!("exploded");
        });
        let adj = Adjustments {
            expose_tracebacks: true,
            ..Adjustments::default()
        };
        let mut fx = fixture(b"GET / HTTP/1.1\r\n\r\n", app, adj);

        fx.channel.handle_read();
        drain_until_idle(&mut fx);
        fx.channel.handle_write();

        let written = fx.written.lock().unwrap();
        assert!(String::from_utf8_lossy(&written).contains("exploded"));
    }

    #[test]
    fn writers_block_above_high_watermark_until_drained() {
        let adj = Adjustments {
            outbuf_high_watermark: 8,
            ..Adjustments::default()
        };
        let mut fx = fixture(b"", echo_path_app(), adj);

        let progressed = Arc::new(AtomicBool::new(false));
        let shared = Arc::clone(&fx.shared);
        let flag = progressed.clone();
        let producer = thread::spawn(move || {
            assert!(shared.write_data(Bytes::from_static(b"0123456789abcdef")));
            flag.store(true, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(100));
        assert!(!progressed.load(Ordering::SeqCst));

        while fx.shared.pending_output() > 0 {
            fx.channel.handle_write();
        }
        wait_for(|| progressed.load(Ordering::SeqCst));
        producer.join().unwrap();
        assert_eq!(16, fx.written.lock().unwrap().len());
    }

    #[test]
    fn file_region_drains_through_fallback_path() {
        let mut path = std::env::temp_dir();
        path.push(format!("tjener-region-{}", std::process::id()));
        std::fs::write(&path, b"the quick brown fox").unwrap();

        let mut fx = fixture(b"", echo_path_app(), Adjustments::default());
        let file = std::fs::File::open(&path).unwrap();
        assert!(fx.shared.write_soon(OutChunk::FileRegion(FileRegion {
            file,
            offset: 0,
            remaining: 19,
            block_size: 4,
        })));

        while fx.shared.pending_output() > 0 {
            fx.channel.handle_write();
        }
        assert_eq!(b"the quick brown fox".to_vec(), *fx.written.lock().unwrap());
        assert!(!fx.channel.will_close());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn short_file_closes_after_truncated_region() {
        let mut path = std::env::temp_dir();
        path.push(format!("tjener-short-{}", std::process::id()));
        std::fs::write(&path, b"tiny").unwrap();

        let mut fx = fixture(b"", echo_path_app(), Adjustments::default());
        let file = std::fs::File::open(&path).unwrap();
        // region promises more bytes than the file holds
        assert!(fx.shared.write_soon(OutChunk::FileRegion(FileRegion {
            file,
            offset: 0,
            remaining: 64,
            block_size: 16,
        })));

        for _ in 0..10 {
            fx.channel.handle_write();
        }
        assert_eq!(b"tiny".to_vec(), *fx.written.lock().unwrap());
        assert!(fx.channel.will_close());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn peer_close_on_read_marks_will_close() {
        // Ok(0) from the socket means the peer hung up
        #[derive(Debug)]
        struct Eof;
        impl Read for Eof {
            fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
                Ok(0)
            }
        }
        impl Write for Eof {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }
        impl Conduit for Eof {
            fn register(
                &mut self,
                _r: &Registry,
                _t: Token,
                _i: Interest,
            ) -> std::io::Result<()> {
                Ok(())
            }
            fn reregister(
                &mut self,
                _r: &Registry,
                _t: Token,
                _i: Interest,
            ) -> std::io::Result<()> {
                Ok(())
            }
            fn deregister(&mut self, _r: &Registry) -> std::io::Result<()> {
                Ok(())
            }
            #[cfg(unix)]
            fn raw_fd(&self) -> std::os::fd::RawFd {
                -1
            }
        }

        let poll = Poll::new().unwrap();
        let trigger = Arc::new(Trigger::new(poll.registry()).unwrap());
        let dispatcher = Arc::new(ThreadedTaskDispatcher::new(1));
        let (flush_tx, _rx) = crossbeam_channel::unbounded();
        let mut channel = Channel::new(
            Box::new(Eof),
            PeerAddr::Unix,
            0,
            Token(0),
            Arc::new(Adjustments::default()),
            echo_path_app(),
            dispatcher,
            trigger,
            flush_tx,
        );

        assert!(!channel.will_close());
        channel.handle_read();
        assert!(channel.will_close());
    }
}
