//! Idle-timeout bookkeeping shared between the event loop and the sweeper.
//!
//! The registry maps each live [`ConnectionId`] to an [`IdleEntry`] of
//! atomics. The event loop owns one [`IdleHandle`] per connection and records
//! activity through it; a periodic [`IdleTimeoutMonitor::sweep`] reads the
//! same entries and reports expired ones to an [`IdleSink`]. The sweep never
//! closes anything itself: the loop re-checks and closes on its own thread.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::server::clock::{Clock, MonotonicClock};

/// Floor for the sweep period.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// Identifies one accepted connection for its whole life. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Receives expiry notices from a sweep.
pub trait IdleSink: Send + Sync {
    /// Returns `false` if the notice could not be delivered.
    fn idle_expired(&self, id: ConnectionId) -> bool;

    /// A closed sink stops the periodic sweeper.
    fn is_closed(&self) -> bool {
        false
    }
}

impl<F> IdleSink for F
where
    F: Fn(ConnectionId) -> bool + Send + Sync,
{
    fn idle_expired(&self, id: ConnectionId) -> bool {
        self(id)
    }
}

#[derive(Debug)]
struct IdleEntry {
    id: ConnectionId,
    timeout_us: u64,
    last_activity_us: AtomicU64,
    /// Handler running.
    busy: AtomicBool,
    /// Reported to the sink, not yet resolved by the loop.
    pending: AtomicBool,
    closed: AtomicBool,
}

impl IdleEntry {
    fn idle_for(&self, now_us: u64) -> u64 {
        now_us.saturating_sub(self.last_activity_us.load(Ordering::Acquire))
    }

    fn is_expired(&self, now_us: u64) -> bool {
        self.timeout_us > 0
            && !self.busy.load(Ordering::Acquire)
            && self.idle_for(now_us) > self.timeout_us
    }
}

#[derive(Debug)]
struct Shared {
    entries: RwLock<HashMap<ConnectionId, Arc<IdleEntry>>>,
    clock: Arc<dyn Clock>,
}

impl Shared {
    fn now_us(&self) -> u64 {
        self.clock.now().as_micros() as u64
    }

    fn remove(&self, entry: &Arc<IdleEntry>) -> bool {
        entry.closed.store(true, Ordering::Release);
        let mut entries = self.entries.write();
        match entries.get(&entry.id) {
            Some(current) if Arc::ptr_eq(current, entry) => {
                entries.remove(&entry.id);
                true
            }
            _ => false,
        }
    }
}

/// Outcome of one sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    /// Entries found closed while the sweep ran.
    pub skipped: usize,
    pub expired: Vec<ConnectionId>,
}

#[derive(Debug, Clone)]
pub struct IdleTimeoutMonitor {
    shared: Arc<Shared>,
}

impl Default for IdleTimeoutMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl IdleTimeoutMonitor {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            shared: Arc::new(Shared {
                entries: RwLock::new(HashMap::new()),
                clock,
            }),
        }
    }

    /// Starts tracking `id`, active as of now. A zero timeout never expires.
    pub fn register(&self, id: ConnectionId, idle_timeout: Duration) -> IdleHandle {
        let entry = Arc::new(IdleEntry {
            id,
            timeout_us: idle_timeout.as_micros() as u64,
            last_activity_us: AtomicU64::new(self.shared.now_us()),
            busy: AtomicBool::new(false),
            pending: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        if let Some(replaced) = self.shared.entries.write().insert(id, Arc::clone(&entry)) {
            replaced.closed.store(true, Ordering::Release);
        }

        IdleHandle {
            entry,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Removes `id`. Returns whether it was registered.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        let removed = self.shared.entries.write().remove(&id);
        match removed {
            Some(entry) => {
                entry.closed.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.shared.entries.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.shared.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Examines every registered connection once and reports the ones idle
    /// past their timeout.
    ///
    /// The registry lock is only held to take a snapshot.
    pub fn sweep(&self, sink: &dyn IdleSink) -> SweepReport {
        let snapshot: Vec<Arc<IdleEntry>> = self.shared.entries.read().values().cloned().collect();
        let now = self.shared.now_us();
        let mut report = SweepReport::default();

        for entry in snapshot {
            if entry.closed.load(Ordering::Acquire) {
                report.skipped += 1;
                continue;
            }
            report.examined += 1;

            if !entry.is_expired(now) {
                continue;
            }

            // Already reported; the loop has not resolved it yet.
            if entry.pending.swap(true, Ordering::AcqRel) {
                continue;
            }

            if sink.idle_expired(entry.id) {
                tracing::trace!(
                    conn = %entry.id,
                    idle_ms = entry.idle_for(now) / 1000,
                    "Connection idle past timeout"
                );
                report.expired.push(entry.id);
            } else {
                entry.pending.store(false, Ordering::Release);
            }
        }

        report
    }
}

/// The event loop's grip on one registry entry.
///
/// Dropping the handle unregisters the connection.
#[derive(Debug)]
pub struct IdleHandle {
    entry: Arc<IdleEntry>,
    shared: Arc<Shared>,
}

impl IdleHandle {
    pub fn id(&self) -> ConnectionId {
        self.entry.id
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_micros(self.entry.timeout_us)
    }

    /// Records that bytes moved.
    pub fn touch(&self) {
        self.entry
            .last_activity_us
            .store(self.shared.now_us(), Ordering::Release);
    }

    pub fn idle_for(&self) -> Duration {
        Duration::from_micros(self.entry.idle_for(self.shared.now_us()))
    }

    /// Exempts the connection from expiry while a handler runs.
    pub fn set_busy(&self, busy: bool) {
        self.entry.busy.store(busy, Ordering::Release);
    }

    pub fn is_busy(&self) -> bool {
        self.entry.busy.load(Ordering::Acquire)
    }

    /// Re-evaluates expiry against the current time.
    pub fn is_expired(&self) -> bool {
        self.entry.is_expired(self.shared.now_us())
    }

    /// Lets a later sweep report this connection again.
    pub fn clear_pending(&self) {
        self.entry.pending.store(false, Ordering::Release);
    }

    pub fn is_registered(&self) -> bool {
        !self.entry.closed.load(Ordering::Acquire)
    }

    pub fn unregister(&self) -> bool {
        self.shared.remove(&self.entry)
    }
}

impl Drop for IdleHandle {
    fn drop(&mut self) {
        self.shared.remove(&self.entry);
    }
}

/// Half the idle timeout, so a connection is reclaimed at most 1.5x its
/// timeout after going quiet.
pub fn sweep_interval_for(idle_timeout: Duration) -> Duration {
    (idle_timeout / 2).max(MIN_SWEEP_INTERVAL)
}

/// Runs [`IdleTimeoutMonitor::sweep`] every `every` on `runtime` until the
/// sink closes.
pub fn spawn_sweeper<S>(
    monitor: IdleTimeoutMonitor,
    every: Duration,
    sink: S,
    runtime: &Handle,
) -> JoinHandle<()>
where
    S: IdleSink + 'static,
{
    runtime.spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if sink.is_closed() {
                tracing::debug!("Event loop gone, stopping idle sweeper");
                break;
            }
            monitor.sweep(&sink);
        }
    })
}
