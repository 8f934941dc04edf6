//! Server construction and per-socket acceptors
//!
//! One [`Acceptor`] wraps each listening socket: it accepts until the
//! socket would block, applies accepted-socket options where the family
//! takes them, enforces the connection limit by pausing its own readiness
//! registration, and periodically sweeps its channels for idle zombies.
//! [`Server`] is the façade over however many acceptors were configured —
//! they share a single reactor map, task dispatcher, and trigger.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use mio::{Registry, Token};
use slab::Slab;
use socket2::Socket;
use tracing::{error, info, warn};

use crate::adjustments::{Adjustments, ListenSpec};
use crate::app::Application;
use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::net::tcp::TcpListen;
use crate::net::unix::UnixListen;
#[cfg(target_os = "linux")]
use crate::net::vsock::VsockListen;
use crate::net::{Conduit, Listen, PeerAddr};
use crate::reactor::Reactor;
use crate::task::ThreadedTaskDispatcher;
use crate::trigger::Trigger;

/// Acceptor tokens count down from the top of the token space; channel
/// tokens are slab keys counting up from zero.
pub(crate) fn acceptor_token(index: usize) -> Token {
    Token(usize::MAX - 1 - index)
}

pub(crate) fn acceptor_index(token: Token) -> usize {
    usize::MAX - 1 - token.0
}

/// Outcome of a single accept attempt.
pub(crate) enum Accepted {
    /// A connection was accepted.
    Conn(Box<dyn Conduit>, PeerAddr),
    /// Nothing more to accept this round; the acceptor stays open.
    Stop,
    /// The listening socket is broken; shut this acceptor down.
    Fatal,
}

/// One listening socket registered in the reactor.
pub(crate) struct Acceptor {
    listener: Box<dyn Listen>,
    adj: Arc<Adjustments>,
    index: usize,
    accepting: bool,
    open: bool,
    in_connection_overflow: bool,
    next_channel_cleanup: Instant,
    registered: bool,
}

impl fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acceptor")
            .field("index", &self.index)
            .field("addr", &self.listener.effective_addr())
            .field("accepting", &self.accepting)
            .field("overflow", &self.in_connection_overflow)
            .finish()
    }
}

impl Acceptor {
    pub(crate) fn new(listener: Box<dyn Listen>, adj: Arc<Adjustments>, index: usize) -> Acceptor {
        let next_channel_cleanup = Instant::now() + adj.cleanup_interval;
        Acceptor {
            listener,
            adj,
            index,
            accepting: true,
            open: true,
            in_connection_overflow: false,
            next_channel_cleanup,
            registered: false,
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open
    }

    pub(crate) fn in_connection_overflow(&self) -> bool {
        self.in_connection_overflow
    }

    pub(crate) fn effective_addr(&self) -> String {
        self.listener.effective_addr()
    }

    /// Accepts one pending connection, mapping errors to the accept policy:
    /// transient exhaustion keeps the acceptor alive, a broken descriptor
    /// shuts it down.
    pub(crate) fn accept_one(&mut self) -> Accepted {
        match self.listener.accept() {
            Ok((conduit, peer)) => {
                if self.listener.applies_socket_options() {
                    #[cfg(unix)]
                    if let Err(err) =
                        crate::net::apply_socket_options(conduit.raw_fd(), &self.adj.socket_options)
                    {
                        warn!(target: "tjener.server", error = %err, "could not apply socket options");
                    }
                }
                Accepted::Conn(conduit, peer)
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Accepted::Stop,
            Err(err) if is_fatal_accept(&err) => {
                error!(
                    target: "tjener.server",
                    addr = %self.listener.effective_addr(),
                    error = %err,
                    "listening socket is broken; shutting acceptor down"
                );
                self.open = false;
                Accepted::Fatal
            }
            Err(err) => {
                // resource exhaustion or an aborted handshake; stay alive
                warn!(
                    target: "tjener.server",
                    addr = %self.listener.effective_addr(),
                    error = %err,
                    "accept failed"
                );
                Accepted::Stop
            }
        }
    }

    /// Registers or pauses accept readiness based on the connection limit,
    /// flipping the overflow flag on transitions.
    pub(crate) fn sync_accept_interest(&mut self, registry: &Registry, channel_count: usize) {
        let over = channel_count > self.adj.connection_limit;
        if over && !self.in_connection_overflow {
            warn!(
                target: "tjener.server",
                channels = channel_count,
                limit = self.adj.connection_limit,
                "connection limit exceeded; pausing accepts"
            );
            self.in_connection_overflow = true;
        } else if !over && self.in_connection_overflow {
            info!(target: "tjener.server", "connection limit cleared; resuming accepts");
            self.in_connection_overflow = false;
        }

        let desired = self.open && self.accepting && !self.in_connection_overflow;
        if desired && !self.registered {
            match self.listener.register(registry, acceptor_token(self.index)) {
                Ok(()) => self.registered = true,
                Err(err) => {
                    error!(target: "tjener.server", error = %err, "listener registration failed");
                    self.open = false;
                }
            }
        } else if !desired && self.registered {
            let _ = self.listener.deregister(registry);
            self.registered = false;
        }
    }

    /// Sweeps this acceptor's channels, marking those idle past the timeout
    /// with no running task. Returns without work until the next deadline.
    pub(crate) fn maintenance(&mut self, now: Instant, channels: &mut Slab<Channel>) {
        if now < self.next_channel_cleanup {
            return;
        }
        self.next_channel_cleanup = now + self.adj.cleanup_interval;

        let cutoff = now.checked_sub(self.adj.channel_timeout);
        let Some(cutoff) = cutoff else { return };

        let mut reaped = 0usize;
        for (_, channel) in channels.iter_mut() {
            if channel.acceptor() != self.index {
                continue;
            }
            if channel.last_activity() < cutoff && !channel.running_tasks() {
                channel.mark_will_close();
                reaped += 1;
            }
        }
        if reaped > 0 {
            info!(target: "tjener.server", reaped, "closed idle channels");
        }
    }

    /// Idempotent close: deregisters and releases bound resources.
    pub(crate) fn close(&mut self, registry: &Registry) {
        if self.registered {
            let _ = self.listener.deregister(registry);
            self.registered = false;
        }
        if self.open || self.accepting {
            self.accepting = false;
            self.open = false;
        }
        self.listener.cleanup();
    }
}

fn is_fatal_accept(err: &std::io::Error) -> bool {
    #[cfg(unix)]
    {
        matches!(err.raw_os_error(), Some(libc::EBADF) | Some(libc::EINVAL))
    }
    #[cfg(not(unix))]
    {
        err.kind() == std::io::ErrorKind::InvalidInput
    }
}

/// Cloneable handle that interrupts a running server from another thread.
#[derive(Debug, Clone)]
pub struct Handle {
    stop: Arc<AtomicBool>,
    trigger: Arc<Trigger>,
}

impl Handle {
    pub(crate) fn new(stop: Arc<AtomicBool>, trigger: Arc<Trigger>) -> Handle {
        Handle { stop, trigger }
    }

    /// Asks the reactor to exit its loop; `run` then shuts the dispatcher
    /// down and closes every channel before returning.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        self.trigger.pull();
    }

    /// Wakes the reactor without stopping it.
    pub fn pull_trigger(&self) {
        self.trigger.pull();
    }
}

/// The HTTP server: one reactor thread multiplexing every listening socket
/// and channel, and a worker pool servicing requests.
///
/// Several listen addresses (or adopted sockets) share one reactor map,
/// dispatcher, and trigger behind this façade.
pub struct Server {
    reactor: Reactor,
    handle: Handle,
    effective: Vec<String>,
    closed: bool,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("listen", &self.effective)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Server {
    /// Binds every spec in the space-separated `listen` string and builds
    /// the server around them.
    pub fn create<A: Application>(app: A, adj: Adjustments, listen: &str) -> Result<Server> {
        let specs = ListenSpec::parse_list(listen)?;
        Self::with_specs(app, adj, specs)
    }

    /// Builds the server from already-parsed listen specs.
    pub fn with_specs<A: Application>(
        app: A,
        adj: Adjustments,
        specs: Vec<ListenSpec>,
    ) -> Result<Server> {
        if specs.is_empty() {
            return Err(Error::NoListeners);
        }
        let adj = Arc::new(adj);
        let listeners = specs
            .iter()
            .map(|spec| bind_spec(spec, &adj))
            .collect::<Result<Vec<_>>>()?;
        Self::assemble(Arc::new(app), adj, listeners)
    }

    /// Adopts a sequence of already-bound sockets. Only `listen` is called
    /// on each; they are never re-bound.
    pub fn from_sockets<A: Application>(
        app: A,
        adj: Adjustments,
        sockets: Vec<Socket>,
    ) -> Result<Server> {
        if sockets.is_empty() {
            return Err(Error::NoListeners);
        }
        let adj = Arc::new(adj);
        let listeners = sockets
            .into_iter()
            .map(|socket| adopt_socket(socket, &adj))
            .collect::<Result<Vec<_>>>()?;
        Self::assemble(Arc::new(app), adj, listeners)
    }

    fn assemble(
        app: Arc<dyn Application>,
        adj: Arc<Adjustments>,
        listeners: Vec<Box<dyn Listen>>,
    ) -> Result<Server> {
        let dispatcher = Arc::new(ThreadedTaskDispatcher::new(adj.threads));
        let reactor = Reactor::new(Arc::clone(&adj), app, dispatcher, listeners)?;
        let effective = reactor.effective_listen();
        for addr in &effective {
            info!(target: "tjener.server", %addr, "listening");
        }
        let handle = Handle::new(Arc::new(AtomicBool::new(false)), reactor.trigger());
        Ok(Server {
            reactor,
            handle,
            effective,
            closed: false,
        })
    }

    /// Bound addresses, with kernel-assigned ports resolved. Ordered like
    /// the listen specs.
    pub fn effective_listen(&self) -> &[String] {
        &self.effective
    }

    /// A handle for stopping the server from another thread.
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Drives the reactor until interrupted, then shuts the dispatcher down
    /// and closes every channel.
    pub fn run(&mut self) {
        self.reactor.run(&self.handle.stop);
    }

    /// Idempotent teardown of every owned resource: channels, worker
    /// threads, listening sockets, and bound paths.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.reactor.close_all();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.close();
    }
}

fn bind_spec(spec: &ListenSpec, adj: &Adjustments) -> Result<Box<dyn Listen>> {
    match spec {
        ListenSpec::Tcp { host, port } => TcpListen::bind(host, *port, adj.backlog)
            .map(|l| Box::new(l) as Box<dyn Listen>)
            .map_err(|source| Error::Bind {
                spec: format!("{host}:{port}"),
                source,
            }),
        ListenSpec::Unix { path, mode } => UnixListen::bind(path.clone(), *mode)
            .map(|l| Box::new(l) as Box<dyn Listen>)
            .map_err(|source| Error::Bind {
                spec: path.display().to_string(),
                source,
            }),
        #[cfg(target_os = "linux")]
        ListenSpec::Vsock { cid, port } => VsockListen::bind(*cid, *port, adj.backlog)
            .map(|l| Box::new(l) as Box<dyn Listen>)
            .map_err(|source| Error::Bind {
                spec: format!("vsock:{cid}:{port}"),
                source,
            }),
        #[cfg(not(target_os = "linux"))]
        ListenSpec::Vsock { .. } => Err(Error::UnsupportedFamily(-1)),
    }
}

fn adopt_socket(socket: Socket, adj: &Adjustments) -> Result<Box<dyn Listen>> {
    let family = socket
        .local_addr()
        .map(|addr| addr.family() as i32)
        .map_err(Error::Listen)?;

    #[cfg(unix)]
    {
        if family == libc::AF_INET || family == libc::AF_INET6 {
            return TcpListen::adopt(socket, adj.backlog)
                .map(|l| Box::new(l) as Box<dyn Listen>)
                .map_err(Error::Listen);
        }
        if family == libc::AF_UNIX {
            return UnixListen::adopt(socket, adj.backlog)
                .map(|l| Box::new(l) as Box<dyn Listen>)
                .map_err(Error::Listen);
        }
        #[cfg(target_os = "linux")]
        if family == libc::AF_VSOCK {
            return VsockListen::adopt(socket, adj.backlog)
                .map(|l| Box::new(l) as Box<dyn Listen>)
                .map_err(Error::Listen);
        }
    }

    Err(Error::UnsupportedFamily(family))
}

#[cfg(test)]
mod test {
    use super::{Accepted, Acceptor, acceptor_index, acceptor_token};
    use crate::adjustments::Adjustments;
    use crate::channel::testing::TestConduit;
    use crate::channel::Channel;
    use crate::net::{Conduit, Listen, PeerAddr};
    use crate::task::ThreadedTaskDispatcher;
    use crate::trigger::Trigger;
    use mio::{Poll, Registry, Token};
    use slab::Slab;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[derive(Debug)]
    struct ScriptedListen {
        results: VecDeque<io::Result<PeerAddr>>,
        applies_options: bool,
        cleaned: bool,
    }

    impl ScriptedListen {
        fn new(results: Vec<io::Result<PeerAddr>>, applies_options: bool) -> ScriptedListen {
            ScriptedListen {
                results: results.into_iter().collect(),
                applies_options,
                cleaned: false,
            }
        }
    }

    impl Listen for ScriptedListen {
        fn accept(&mut self) -> io::Result<(Box<dyn Conduit>, PeerAddr)> {
            match self.results.pop_front() {
                Some(Ok(peer)) => {
                    let (conduit, _) = TestConduit::new(b"");
                    Ok((Box::new(conduit), peer))
                }
                Some(Err(err)) => Err(err),
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }

        fn register(&mut self, _registry: &Registry, _token: Token) -> io::Result<()> {
            Ok(())
        }

        fn deregister(&mut self, _registry: &Registry) -> io::Result<()> {
            Ok(())
        }

        fn applies_socket_options(&self) -> bool {
            self.applies_options
        }

        fn cleanup(&mut self) {
            self.cleaned = true;
        }

        fn effective_addr(&self) -> String {
            "scripted".to_owned()
        }
    }

    fn acceptor(results: Vec<io::Result<PeerAddr>>) -> Acceptor {
        let adj = Arc::new(Adjustments {
            socket_options: Vec::new(),
            ..Adjustments::default()
        });
        Acceptor::new(Box::new(ScriptedListen::new(results, false)), adj, 0)
    }

    fn os_err(code: i32) -> io::Error {
        io::Error::from_raw_os_error(code)
    }

    #[test]
    fn acceptor_tokens_round_trip() {
        assert_eq!(0, acceptor_index(acceptor_token(0)));
        assert_eq!(7, acceptor_index(acceptor_token(7)));
    }

    #[test]
    fn accept_would_block_is_a_quiet_stop() {
        let mut acc = acceptor(vec![Err(io::ErrorKind::WouldBlock.into())]);
        assert!(matches!(acc.accept_one(), Accepted::Stop));
        assert!(acc.is_open());
    }

    #[test]
    fn accept_econnaborted_keeps_the_acceptor() {
        let mut acc = acceptor(vec![Err(os_err(libc::ECONNABORTED))]);
        assert!(matches!(acc.accept_one(), Accepted::Stop));
        assert!(acc.is_open());
    }

    #[test]
    fn accept_emfile_keeps_the_acceptor() {
        let mut acc = acceptor(vec![Err(os_err(libc::EMFILE))]);
        assert!(matches!(acc.accept_one(), Accepted::Stop));
        assert!(acc.is_open());
    }

    #[test]
    fn accept_ebadf_is_fatal() {
        let mut acc = acceptor(vec![Err(os_err(libc::EBADF))]);
        assert!(matches!(acc.accept_one(), Accepted::Fatal));
        assert!(!acc.is_open());
    }

    #[test]
    fn unix_accept_skips_socket_options_and_reports_localhost() {
        let mut acc = acceptor(vec![Ok(PeerAddr::Unix)]);
        match acc.accept_one() {
            Accepted::Conn(_, peer) => assert_eq!(PeerAddr::Unix, peer),
            _ => panic!("expected a connection"),
        }
        assert!(acc.is_open());
    }

    #[test]
    fn overflow_flag_toggles_with_channel_count() {
        let poll = Poll::new().unwrap();
        let adj = Arc::new(Adjustments {
            connection_limit: 1,
            ..Adjustments::default()
        });
        let mut acc = Acceptor::new(
            Box::new(ScriptedListen::new(vec![], false)),
            adj,
            0,
        );

        acc.sync_accept_interest(poll.registry(), 0);
        assert!(!acc.in_connection_overflow());

        acc.sync_accept_interest(poll.registry(), 2);
        assert!(acc.in_connection_overflow());

        acc.sync_accept_interest(poll.registry(), 1);
        assert!(!acc.in_connection_overflow());
    }

    #[test]
    fn maintenance_reaps_idle_channels_without_running_tasks() {
        use crate::app::{Body, Environ, StartResponse};

        let poll = Poll::new().unwrap();
        let trigger = Arc::new(Trigger::new(poll.registry()).unwrap());
        let dispatcher = Arc::new(ThreadedTaskDispatcher::new(1));
        let (flush_tx, _flush_rx) = crossbeam_channel::unbounded();
        let adj = Arc::new(Adjustments::default());
        let app: Arc<dyn crate::app::Application> =
            Arc::new(|_: &Environ, sr: &mut StartResponse| {
                sr.start(204, vec![]);
                Body::Empty
            });

        let mut channels = Slab::new();
        let (conduit, _) = TestConduit::new(b"");
        let mut zombie = Channel::new(
            Box::new(conduit),
            PeerAddr::Unix,
            0,
            Token(0),
            Arc::clone(&adj),
            app,
            dispatcher,
            trigger,
            flush_tx,
        );
        let Some(long_ago) = Instant::now().checked_sub(Duration::from_secs(10_000)) else {
            // machine uptime too short to backdate; nothing to assert
            return;
        };
        zombie.set_last_activity(long_ago);
        let key = channels.insert(zombie);

        let mut acc = acceptor(vec![]);
        // force the deadline into the past so the sweep runs now
        acc.next_channel_cleanup = Instant::now();
        acc.maintenance(Instant::now(), &mut channels);

        assert!(channels.get(key).unwrap().will_close());
    }

    #[test]
    fn maintenance_spares_channels_with_recent_activity() {
        use crate::app::{Body, Environ, StartResponse};

        let poll = Poll::new().unwrap();
        let trigger = Arc::new(Trigger::new(poll.registry()).unwrap());
        let dispatcher = Arc::new(ThreadedTaskDispatcher::new(1));
        let (flush_tx, _flush_rx) = crossbeam_channel::unbounded();
        let adj = Arc::new(Adjustments::default());
        let app: Arc<dyn crate::app::Application> =
            Arc::new(|_: &Environ, sr: &mut StartResponse| {
                sr.start(204, vec![]);
                Body::Empty
            });

        let mut channels = Slab::new();
        let (conduit, _) = TestConduit::new(b"");
        let fresh = Channel::new(
            Box::new(conduit),
            PeerAddr::Unix,
            0,
            Token(0),
            adj,
            app,
            dispatcher,
            trigger,
            flush_tx,
        );
        let key = channels.insert(fresh);

        let mut acc = acceptor(vec![]);
        acc.next_channel_cleanup = Instant::now();
        acc.maintenance(Instant::now(), &mut channels);

        assert!(!channels.get(key).unwrap().will_close());
    }

    #[test]
    fn close_is_idempotent_and_cleans_up() {
        let poll = Poll::new().unwrap();
        let mut acc = acceptor(vec![]);
        acc.close(poll.registry());
        assert!(!acc.is_open());
        acc.close(poll.registry());
        assert!(!acc.is_open());
    }
}
