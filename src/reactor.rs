//! Reactor event loop
//!
//! A single thread multiplexes every listening socket, every channel, and
//! the cross-thread trigger over one poll instance. mio readiness is
//! edge-oriented, so the loop re-derives each handle's desired interest
//! from its state before sleeping and re-registers on change; that is the
//! level-triggered `readable()`/`writable()` contract re-expressed.
//!
//! The reactor thread is the only thread that touches sockets. Worker
//! threads reach it exclusively through the flush queue plus trigger.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use mio::{Events, Poll, Token};
use slab::Slab;
use tracing::{debug, error, info};

use crate::adjustments::Adjustments;
use crate::app::Application;
use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::net::{Conduit, Listen, PeerAddr};
use crate::server::{acceptor_index, Accepted, Acceptor};
use crate::task::ThreadedTaskDispatcher;
use crate::trigger::{Trigger, TRIGGER_TOKEN};

const EVENT_CAPACITY: usize = 1024;
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// The shared descriptor map and its driving loop.
pub(crate) struct Reactor {
    poll: Poll,
    channels: Slab<Channel>,
    acceptors: Vec<Acceptor>,
    trigger: Arc<Trigger>,
    flush_tx: Sender<Token>,
    flush_rx: Receiver<Token>,
    adj: Arc<Adjustments>,
    app: Arc<dyn Application>,
    dispatcher: Arc<ThreadedTaskDispatcher>,
    torn_down: bool,
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("channels", &self.channels.len())
            .field("acceptors", &self.acceptors.len())
            .finish()
    }
}

impl Reactor {
    pub(crate) fn new(
        adj: Arc<Adjustments>,
        app: Arc<dyn Application>,
        dispatcher: Arc<ThreadedTaskDispatcher>,
        listeners: Vec<Box<dyn Listen>>,
    ) -> Result<Reactor> {
        let poll = Poll::new().map_err(Error::Reactor)?;
        let trigger = Arc::new(Trigger::new(poll.registry()).map_err(Error::Reactor)?);
        let (flush_tx, flush_rx) = unbounded();
        let acceptors = listeners
            .into_iter()
            .enumerate()
            .map(|(index, listener)| Acceptor::new(listener, Arc::clone(&adj), index))
            .collect();

        let mut reactor = Reactor {
            poll,
            channels: Slab::new(),
            acceptors,
            trigger,
            flush_tx,
            flush_rx,
            adj,
            app,
            dispatcher,
            torn_down: false,
        };
        // initial registration; later passes only track state changes
        reactor.sync_interests();
        Ok(reactor)
    }

    pub(crate) fn trigger(&self) -> Arc<Trigger> {
        Arc::clone(&self.trigger)
    }

    pub(crate) fn effective_listen(&self) -> Vec<String> {
        self.acceptors
            .iter()
            .map(Acceptor::effective_addr)
            .collect()
    }

    /// Drives the loop until `stop` is set or the poll is interrupted. On
    /// exit the dispatcher is shut down and every channel is closed.
    pub(crate) fn run(&mut self, stop: &AtomicBool) {
        let mut events = Events::with_capacity(EVENT_CAPACITY);

        while !stop.load(Ordering::Acquire) {
            self.sync_interests();

            match self.poll.poll(&mut events, Some(self.adj.loop_timeout)) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {
                    info!(target: "tjener.reactor", "poll interrupted; exiting");
                    break;
                }
                Err(err) => {
                    error!(target: "tjener.reactor", error = %err, "poll failed; exiting");
                    break;
                }
            }

            for event in events.iter() {
                let token = event.token();
                if token == TRIGGER_TOKEN {
                    self.trigger.drain();
                } else if acceptor_index(token) < self.acceptors.len() {
                    self.accept_ready(acceptor_index(token));
                } else {
                    let readable =
                        event.is_readable() || event.is_read_closed() || event.is_error();
                    let writable = event.is_writable() || event.is_write_closed();
                    self.channel_event(token.0, readable, writable);
                }
            }

            self.drain_flush_queue();
            self.maintenance();
            self.reap();
        }

        self.teardown();
    }

    /// Accepts until the socket would block or the map hits the limit.
    fn accept_ready(&mut self, index: usize) {
        loop {
            if self.channels.len() > self.adj.connection_limit {
                // leave the rest in the backlog; sync pass pauses accepts
                break;
            }
            match self.acceptors[index].accept_one() {
                Accepted::Conn(conduit, peer) => self.install_channel(conduit, peer, index),
                Accepted::Stop => break,
                Accepted::Fatal => {
                    self.acceptors[index].close(self.poll.registry());
                    break;
                }
            }
        }
    }

    fn install_channel(&mut self, conduit: Box<dyn Conduit>, peer: PeerAddr, acceptor: usize) {
        let entry = self.channels.vacant_entry();
        let token = Token(entry.key());
        let channel = Channel::new(
            conduit,
            peer.clone(),
            acceptor,
            token,
            Arc::clone(&self.adj),
            Arc::clone(&self.app),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.trigger),
            self.flush_tx.clone(),
        );
        let channel = entry.insert(channel);
        channel.sync_interest(self.poll.registry());
        debug!(target: "tjener.reactor", %peer, ?token, "connection accepted");
    }

    fn channel_event(&mut self, key: usize, readable: bool, writable: bool) {
        let Some(channel) = self.channels.get_mut(key) else {
            return;
        };
        if readable {
            channel.handle_read();
        }
        if writable {
            channel.handle_write();
        }
    }

    /// Flushes the channels worker threads asked to be drained.
    fn drain_flush_queue(&mut self) {
        while let Ok(token) = self.flush_rx.try_recv() {
            if let Some(channel) = self.channels.get_mut(token.0) {
                channel.handle_write();
            }
        }
    }

    fn maintenance(&mut self) {
        let now = Instant::now();
        for acceptor in &mut self.acceptors {
            acceptor.maintenance(now, &mut self.channels);
        }
    }

    /// Removes channels whose close flag is up; their sockets drop here, on
    /// the reactor thread, and nothing calls back into them afterwards.
    fn reap(&mut self) {
        let closing: Vec<usize> = self
            .channels
            .iter()
            .filter(|(_, channel)| channel.will_close())
            .map(|(key, _)| key)
            .collect();
        for key in closing {
            let channel = self.channels.remove(key);
            channel.handle_close(self.poll.registry());
            debug!(target: "tjener.reactor", key, "channel closed");
        }
    }

    fn sync_interests(&mut self) {
        let registry = self.poll.registry();
        let channel_count = self.channels.len();
        for acceptor in &mut self.acceptors {
            acceptor.sync_accept_interest(registry, channel_count);
        }
        for (_, channel) in self.channels.iter_mut() {
            channel.sync_interest(registry);
        }
    }

    /// Exit path shared by `run` and `close_all`: unblock and join workers,
    /// then release every channel. Runs at most once.
    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        info!(target: "tjener.reactor", channels = self.channels.len(), "shutting down");
        for (_, channel) in self.channels.iter_mut() {
            // wakes any worker parked on the watermark
            channel.mark_will_close();
        }
        self.dispatcher.shutdown(true, SHUTDOWN_JOIN_TIMEOUT);

        let keys: Vec<usize> = self.channels.iter().map(|(key, _)| key).collect();
        for key in keys {
            let channel = self.channels.remove(key);
            channel.handle_close(self.poll.registry());
        }
    }

    /// Full teardown including the listening sockets. Idempotent.
    pub(crate) fn close_all(&mut self) {
        self.teardown();
        for acceptor in &mut self.acceptors {
            acceptor.close(self.poll.registry());
        }
    }
}
