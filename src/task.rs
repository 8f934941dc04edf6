//! Task dispatch
//!
//! A fixed pool of worker threads drains an unbounded FIFO queue of tasks.
//! The queue never pushes back on producers — backpressure happens upstream
//! through the connection limit — and submission fails only once shutdown
//! has begun. Service failures are confined to the request that caused
//! them: a panicking application never takes a worker down.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, error, warn};

use crate::app::{Body, Environ, StartResponse};
use crate::channel::{ChannelShared, FileRegion, OutChunk};
use crate::error::Error;
use crate::proto::request::Request;
use crate::proto::response::{self, Framing};

/// A unit of work bound to one channel.
pub trait Task: Send {
    /// Runs the work on a dispatcher worker.
    fn service(&mut self);
    /// Called instead of `service` when the dispatcher discards queued work
    /// during shutdown.
    fn cancel(&mut self);
}

enum Job {
    Run(Box<dyn Task>),
    Stop,
}

/// Fixed-size worker pool with an unbounded FIFO queue.
pub struct ThreadedTaskDispatcher {
    tx: Sender<Job>,
    rx: Receiver<Job>,
    threads: usize,
    stopping: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for ThreadedTaskDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadedTaskDispatcher")
            .field("threads", &self.threads)
            .field("stopping", &self.stopping.load(Ordering::Relaxed))
            .field("queued", &self.rx.len())
            .finish()
    }
}

impl ThreadedTaskDispatcher {
    /// Starts `threads` workers.
    pub fn new(threads: usize) -> ThreadedTaskDispatcher {
        let threads = threads.max(1);
        let (tx, rx) = unbounded();
        let workers = (0..threads)
            .map(|index| {
                let rx = rx.clone();
                thread::Builder::new()
                    .name(format!("tjener-worker-{index}"))
                    .spawn(move || worker_main(rx, index))
                    .expect("spawning dispatcher worker")
            })
            .collect();
        ThreadedTaskDispatcher {
            tx,
            rx,
            threads,
            stopping: AtomicBool::new(false),
            workers: Mutex::new(workers),
        }
    }

    /// Enqueues a task. Never blocks; fails only while shutting down.
    pub fn add_task(&self, task: Box<dyn Task>) -> Result<(), Error> {
        if self.stopping.load(Ordering::Acquire) {
            return Err(Error::DispatcherShutDown);
        }
        self.tx
            .send(Job::Run(task))
            .map_err(|_| Error::DispatcherShutDown)
    }

    /// Stops accepting tasks, optionally cancels the queued ones, and joins
    /// workers until `timeout`. Returns whether every worker finished.
    pub fn shutdown(&self, cancel_pending: bool, timeout: Duration) -> bool {
        if !self.stopping.swap(true, Ordering::AcqRel) {
            for _ in 0..self.threads {
                let _ = self.tx.send(Job::Stop);
            }
        }

        if cancel_pending {
            let mut cancelled = 0usize;
            let mut stops = 0usize;
            while let Ok(job) = self.rx.try_recv() {
                match job {
                    Job::Run(mut task) => {
                        task.cancel();
                        cancelled += 1;
                    }
                    Job::Stop => stops += 1,
                }
            }
            // stop markers consumed while draining still have to reach the
            // workers
            for _ in 0..stops {
                let _ = self.tx.send(Job::Stop);
            }
            if cancelled > 0 {
                debug!(target: "tjener.task", cancelled, "cancelled queued tasks");
            }
        }

        let deadline = Instant::now() + timeout;
        let mut workers = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let handles = std::mem::take(&mut *workers);
        drop(workers);

        let mut joined = true;
        for handle in handles {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                joined = false;
            }
        }
        if !joined {
            warn!(target: "tjener.task", "worker threads still running after shutdown timeout");
        }
        joined
    }
}

fn worker_main(rx: Receiver<Job>, index: usize) {
    while let Ok(job) = rx.recv() {
        match job {
            Job::Stop => break,
            Job::Run(mut task) => {
                if catch_unwind(AssertUnwindSafe(|| task.service())).is_err() {
                    error!(target: "tjener.task", worker = index, "task panicked outside request handling");
                }
            }
        }
    }
    debug!(target: "tjener.task", worker = index, "worker exiting");
}

/// Services the head request of one channel's queue.
///
/// The channel guarantees at most one of these is live per connection, so
/// within a connection responses are produced strictly in request order.
/// When more requests remain after the head completes, the task resubmits
/// itself rather than looping, letting channels share the pool fairly.
pub(crate) struct ServiceTask {
    shared: Arc<ChannelShared>,
}

impl ServiceTask {
    pub(crate) fn new(shared: Arc<ChannelShared>) -> ServiceTask {
        ServiceTask { shared }
    }
}

impl Task for ServiceTask {
    fn service(&mut self) {
        if self.shared.will_close() {
            self.shared.abort_service();
            return;
        }
        let Some(request) = self.shared.head_request() else {
            self.shared.abort_service();
            return;
        };

        let close_when_done = service_request(&self.shared, &request);

        if self.shared.request_done(close_when_done) {
            let follow_up = Box::new(ServiceTask::new(Arc::clone(&self.shared)));
            if self.shared.dispatcher().add_task(follow_up).is_err() {
                self.shared.emit_error_and_close(503, None);
            }
        }
    }

    fn cancel(&mut self) {
        self.shared.abort_service();
    }
}

/// Runs the application for one request and queues the response. Returns
/// whether the connection must close once the response is flushed.
fn service_request(shared: &ChannelShared, request: &Request) -> bool {
    let adj = shared.adjustments();

    if let Some(parse_error) = request.error {
        let detail = parse_error.to_string();
        shared.write_data(response::error_response(
            parse_error.status(),
            &adj.ident,
            Some(&detail),
        ));
        return true;
    }

    let head = &request.head;
    let environ = Environ {
        method: head.method.clone(),
        path: head.path.clone(),
        query: head.query.clone(),
        version: head.version,
        headers: head.headers.clone(),
        remote_addr: shared.peer().clone(),
        url_scheme: adj.url_scheme.clone(),
        server_name: adj.server_name.clone(),
        body: request.body.clone(),
    };

    let app = Arc::clone(shared.application());
    let mut start_response = StartResponse::default();
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        app.call(&environ, &mut start_response)
    }));

    let body = match outcome {
        Ok(body) => body,
        Err(payload) => {
            let detail = panic_message(&payload);
            error!(target: "tjener.task", peer = %shared.peer(), %detail, "application panicked");
            let exposed = adj.expose_tracebacks.then_some(detail.as_str());
            shared.write_data(response::error_response(500, &adj.ident, exposed));
            return true;
        }
    };

    let Some(response_head) = start_response.take() else {
        error!(target: "tjener.task", peer = %shared.peer(), "application finished without starting a response");
        shared.write_data(response::error_response(500, &adj.ident, None));
        return true;
    };

    let declared_length = response_head
        .headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("Content-Length"))
        .and_then(|(_, v)| v.trim().parse::<u64>().ok());

    let measured_length = match &body {
        Body::Empty => Some(0),
        Body::Full(bytes) => Some(bytes.len() as u64),
        Body::Chunks(chunks) => Some(chunks.iter().map(|c| c.len() as u64).sum()),
        Body::Stream(_) => None,
        Body::File(wrapper) => wrapper.file.metadata().map(|m| m.len()).ok(),
    };
    let content_length = declared_length.or(measured_length);

    // without a length the only delimiter left is the connection itself
    let close = !head.keep_alive || content_length.is_none();

    let head_bytes = response::encode_head(
        head.version,
        response_head.status,
        &response_head.headers,
        &adj.ident,
        Framing {
            content_length,
            close,
        },
    );
    if !shared.write_data(head_bytes) {
        return true;
    }

    if head.method.eq_ignore_ascii_case("HEAD") {
        return close;
    }

    match body {
        Body::Empty => {}
        Body::Full(bytes) => {
            if !shared.write_data(bytes) {
                return true;
            }
        }
        Body::Chunks(chunks) => {
            for chunk in chunks {
                if !shared.write_data(chunk) {
                    return true;
                }
            }
        }
        Body::Stream(iter) => {
            let streamed = catch_unwind(AssertUnwindSafe(|| {
                for chunk in iter {
                    if !shared.write_data(chunk) {
                        return false;
                    }
                }
                true
            }));
            match streamed {
                Ok(true) => {}
                Ok(false) => return true,
                Err(payload) => {
                    // headers are committed; nothing to do but hang up
                    error!(
                        target: "tjener.task",
                        peer = %shared.peer(),
                        detail = %panic_message(&payload),
                        "application body iterator panicked"
                    );
                    return true;
                }
            }
        }
        Body::File(wrapper) => {
            // the declared length is trusted: a longer declaration truncates
            // at end of file, a shorter one stops the region early
            let remaining = content_length.unwrap_or(0);
            if remaining > 0 {
                let region = FileRegion {
                    file: wrapper.file,
                    offset: 0,
                    remaining,
                    block_size: wrapper.block_size.max(1),
                };
                if !shared.write_soon(OutChunk::FileRegion(region)) {
                    return true;
                }
            }
        }
    }

    close
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}
