use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::Context;
use mio::net::TcpListener;
use mio::{Poll, Waker};
use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::config::Config;
use crate::http::handler::Handler;
use crate::http::parser::ParseCounter;
use crate::server::clock::{Clock, MonotonicClock};
use crate::server::dispatch::{Dispatcher, LoopMessage, LoopNotifier};
use crate::server::event_loop::{EventLoop, LoopSettings, WAKER};
use crate::server::monitor::{IdleTimeoutMonitor, spawn_sweeper};

/// A bound listener with its loop, ready to start.
pub struct Server {
    event_loop: EventLoop,
    local_addr: SocketAddr,
    notifier: LoopNotifier,
    monitor: IdleTimeoutMonitor,
    runtime: Handle,
    idle_timeout: Duration,
    sweep_interval: Duration,
    parses: ParseCounter,
    active: Arc<AtomicUsize>,
}

impl Server {
    /// Binds `cfg.listen_addr`. Handlers and the idle sweeper run on `runtime`.
    pub fn bind<H: Handler>(cfg: &Config, handler: H, runtime: Handle) -> io::Result<Self> {
        Self::with_clock(cfg, handler, runtime, Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock<H: Handler>(
        cfg: &Config,
        handler: H,
        runtime: Handle,
        clock: Arc<dyn Clock>,
    ) -> io::Result<Self> {
        let addr = cfg
            .listen_addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("no address for {}", cfg.listen_addr),
                )
            })?;

        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;

        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let notifier = LoopNotifier::new(tx, waker);

        let monitor = IdleTimeoutMonitor::with_clock(clock);
        let parses = ParseCounter::new();
        let active = Arc::new(AtomicUsize::new(0));

        let dispatcher = Dispatcher::new(
            runtime.clone(),
            Arc::new(handler),
            cfg.worker_threads,
            notifier.clone(),
        );
        let settings = LoopSettings {
            idle_timeout: cfg.idle_timeout(),
            parse_limits: cfg.parse_limits(),
            connection_limits: cfg.connection_limits(),
        };
        let event_loop = EventLoop::new(
            poll,
            listener,
            rx,
            dispatcher,
            monitor.clone(),
            settings,
            parses.clone(),
            Arc::clone(&active),
        )?;

        Ok(Self {
            event_loop,
            local_addr,
            notifier,
            monitor,
            runtime,
            idle_timeout: cfg.idle_timeout(),
            sweep_interval: cfg.sweep_interval(),
            parses,
            active,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Spawns the event loop thread and, unless idle reclamation is off, the
    /// sweeper.
    pub fn start(self) -> io::Result<ServerHandle> {
        let Server {
            event_loop,
            local_addr,
            notifier,
            monitor,
            runtime,
            idle_timeout,
            sweep_interval,
            parses,
            active,
        } = self;

        let sweeper = if idle_timeout.is_zero() {
            debug!("Idle timeout disabled");
            None
        } else {
            Some(spawn_sweeper(
                monitor.clone(),
                sweep_interval,
                notifier.clone(),
                &runtime,
            ))
        };

        let thread = thread::Builder::new()
            .name("idlegate-loop".to_string())
            .spawn(move || event_loop.run())?;

        info!(
            addr = %local_addr,
            idle_timeout_ms = idle_timeout.as_millis() as u64,
            sweep_interval_ms = sweep_interval.as_millis() as u64,
            "Listening"
        );

        Ok(ServerHandle {
            local_addr,
            notifier,
            monitor,
            parses,
            active,
            thread: Some(thread),
            sweeper,
        })
    }

    /// Serves on the calling thread until shut down from elsewhere.
    pub fn run(self) -> io::Result<()> {
        self.start()?.join()
    }
}

/// Control over a running server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    notifier: LoopNotifier,
    monitor: IdleTimeoutMonitor,
    parses: ParseCounter,
    active: Arc<AtomicUsize>,
    thread: Option<thread::JoinHandle<io::Result<()>>>,
    sweeper: Option<tokio::task::JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Asks the loop to close every connection and stop.
    pub fn shutdown(&self) {
        self.notifier.send(LoopMessage::Shutdown);
    }

    /// Waits for the loop thread to exit.
    pub fn join(mut self) -> io::Result<()> {
        let result = match self.thread.take() {
            Some(thread) => thread
                .join()
                .unwrap_or_else(|_| Err(io::Error::other("event loop panicked"))),
            None => Ok(()),
        };
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
        result
    }

    /// Total `feed` calls across all parsers.
    pub fn parse_count(&self) -> u64 {
        self.parses.get()
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Connections still known to the idle registry.
    pub fn tracked_connections(&self) -> usize {
        self.monitor.len()
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.shutdown();
        }
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

/// Binds and starts a server on the current tokio runtime.
pub fn start<H: Handler>(cfg: &Config, handler: H) -> anyhow::Result<ServerHandle> {
    let server = Server::bind(cfg, handler, Handle::current())
        .with_context(|| format!("Failed to bind {}", cfg.listen_addr))?;
    let handle = server.start().context("Failed to start event loop")?;
    Ok(handle)
}
