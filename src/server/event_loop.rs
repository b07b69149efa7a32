use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, info, trace, warn};

use crate::error::ConnectionError;
use crate::http::connection::{Connection, ConnectionLimits, Disposition};
use crate::http::parser::{ParseCounter, ParseLimits, RequestParser};
use crate::server::dispatch::{Dispatcher, LoopMessage};
use crate::server::monitor::{ConnectionId, IdleTimeoutMonitor};

pub(crate) const LISTENER: Token = Token(0);
pub(crate) const WAKER: Token = Token(1);
const FIRST_CONNECTION: u64 = 2;

/// Per-connection settings applied at accept time.
#[derive(Debug, Clone, Copy)]
pub struct LoopSettings {
    pub idle_timeout: Duration,
    pub parse_limits: ParseLimits,
    pub connection_limits: ConnectionLimits,
}

/// The single thread that owns every connection.
///
/// Readiness comes from `poll`; handler results and idle notices arrive on
/// `inbox` and are picked up after each poll wake.
pub struct EventLoop {
    poll: Poll,
    listener: TcpListener,
    connections: HashMap<ConnectionId, Connection<TcpStream>>,
    inbox: UnboundedReceiver<LoopMessage>,
    dispatcher: Dispatcher,
    monitor: IdleTimeoutMonitor,
    settings: LoopSettings,
    parses: ParseCounter,
    active: Arc<AtomicUsize>,
    /// Connections that stopped on their read budget.
    ready: VecDeque<ConnectionId>,
    queued: HashSet<ConnectionId>,
    next_id: u64,
}

fn token_for(id: ConnectionId) -> Token {
    Token(id.0 as usize)
}

impl EventLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        poll: Poll,
        mut listener: TcpListener,
        inbox: UnboundedReceiver<LoopMessage>,
        dispatcher: Dispatcher,
        monitor: IdleTimeoutMonitor,
        settings: LoopSettings,
        parses: ParseCounter,
        active: Arc<AtomicUsize>,
    ) -> io::Result<Self> {
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        Ok(Self {
            poll,
            listener,
            connections: HashMap::new(),
            inbox,
            dispatcher,
            monitor,
            settings,
            parses,
            active,
            ready: VecDeque::new(),
            queued: HashSet::new(),
            next_id: FIRST_CONNECTION,
        })
    }

    /// Runs until a [`LoopMessage::Shutdown`] arrives.
    pub fn run(mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(1024);

        loop {
            let timeout = if self.ready.is_empty() {
                None
            } else {
                Some(Duration::ZERO)
            };

            if let Err(err) = self.poll.poll(&mut events, timeout) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                self.close_all();
                return Err(err);
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept(),
                    WAKER => {}
                    token => {
                        let readable = event.is_readable() || event.is_read_closed() || event.is_error();
                        self.on_ready(ConnectionId(token.0 as u64), readable, event.is_writable());
                    }
                }
            }

            self.run_ready();

            if !self.process_inbox() {
                break;
            }
        }

        info!(connections = self.connections.len(), "Event loop shutting down");
        self.close_all();
        Ok(())
    }

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    let id = ConnectionId(self.next_id);
                    self.next_id += 1;

                    let idle = self.monitor.register(id, self.settings.idle_timeout);
                    let registered = self.poll.registry().register(
                        &mut stream,
                        token_for(id),
                        Interest::READABLE | Interest::WRITABLE,
                    );
                    if let Err(err) = registered {
                        warn!(%peer, error = %err, "Failed to register connection");
                        continue;
                    }
                    if let Err(err) = stream.set_nodelay(true) {
                        trace!(conn = %id, error = %err, "set_nodelay failed");
                    }

                    let parser = RequestParser::with_limits(self.settings.parse_limits)
                        .with_observer(self.parses.observer());
                    let conn = Connection::new(stream, parser, idle, self.settings.connection_limits);
                    self.connections.insert(id, conn);
                    self.active.store(self.connections.len(), Ordering::Release);

                    debug!(conn = %id, %peer, "Accepted connection");
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(error = %err, "Accept failed");
                    break;
                }
            }
        }
    }

    fn on_ready(&mut self, id: ConnectionId, readable: bool, writable: bool) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };

        let mut disposition = Disposition::Continue;
        if writable {
            disposition = conn.on_writable();
        }
        if readable && matches!(disposition, Disposition::Continue) {
            disposition = conn.on_readable();
        }

        self.settle(id, disposition);
    }

    fn run_ready(&mut self) {
        for _ in 0..self.ready.len() {
            let Some(id) = self.ready.pop_front() else {
                break;
            };
            self.queued.remove(&id);
            if let Some(conn) = self.connections.get_mut(&id) {
                let disposition = conn.on_readable();
                self.settle(id, disposition);
            }
        }
    }

    /// Returns `false` once shutdown was requested.
    fn process_inbox(&mut self) -> bool {
        loop {
            match self.inbox.try_recv() {
                Ok(LoopMessage::Completed { id, outcome }) => {
                    let Some(conn) = self.connections.get_mut(&id) else {
                        trace!(conn = %id, "Dropping result for closed connection");
                        continue;
                    };
                    let disposition = conn.on_handler_complete(outcome);
                    self.settle(id, disposition);
                }
                Ok(LoopMessage::IdleExpired(id)) => self.on_idle_expired(id),
                Ok(LoopMessage::Shutdown) => return false,
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn on_idle_expired(&mut self, id: ConnectionId) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };

        // Bytes may have moved since the sweep looked.
        if !conn.is_idle_expired() {
            conn.idle().clear_pending();
            return;
        }

        let reason = conn.on_idle_timeout();
        debug!(conn = %id, reason = %reason, "Closing idle connection");
        self.remove(id);
    }

    fn settle(&mut self, id: ConnectionId, disposition: Disposition) {
        match disposition {
            Disposition::Continue => {
                let Some(conn) = self.connections.get_mut(&id) else {
                    return;
                };
                if let Some(request) = conn.take_request() {
                    self.dispatcher.dispatch(id, request);
                }
                if conn.needs_another_turn() && self.queued.insert(id) {
                    self.ready.push_back(id);
                }
            }
            Disposition::Close => {
                debug!(conn = %id, "Connection closed");
                self.remove(id);
            }
            Disposition::Error(err) => {
                log_error(id, &err);
                self.remove(id);
            }
        }
    }

    fn remove(&mut self, id: ConnectionId) {
        if let Some(mut conn) = self.connections.remove(&id) {
            if let Err(err) = self.poll.registry().deregister(conn.source_mut()) {
                trace!(conn = %id, error = %err, "Deregister failed");
            }
            conn.close();
        }
        self.active.store(self.connections.len(), Ordering::Release);
    }

    fn close_all(&mut self) {
        self.dispatcher.close();
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            self.remove(id);
        }
        self.ready.clear();
        self.queued.clear();
        if let Err(err) = self.poll.registry().deregister(&mut self.listener) {
            trace!(error = %err, "Deregister listener failed");
        }
    }
}

fn log_error(id: ConnectionId, err: &ConnectionError) {
    match err {
        ConnectionError::Protocol(_) => debug!(conn = %id, error = %err, "Rejected request"),
        ConnectionError::Transport(_) => debug!(conn = %id, error = %err, "Connection failed"),
        _ => warn!(conn = %id, error = %err, "Connection aborted"),
    }
}
