//! Gates exports on the replica's high-availability lease.
//!
//! When several replicas scrape the same targets, only the current lease holder may write. The
//! lease is expressed as a time range: samples with timestamps inside the range are exported,
//! everything else is dropped. This prevents duplicate writes while leadership moves between
//! replicas.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

/// Callback invoked when the replica gains or loses leadership.
pub type LeaderChangeCallback = Box<dyn Fn() + Send + Sync>;

/// The time range this replica is authoritative for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeaseRange {
    /// Start of the range, inclusive.
    pub start: DateTime<Utc>,
    /// End of the range, inclusive.
    pub end: DateTime<Utc>,
}

impl LeaseRange {
    /// Creates a range from its inclusive bounds.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// A range covering all representable timestamps.
    pub fn unbounded() -> Self {
        Self::new(DateTime::<Utc>::MIN_UTC, DateTime::<Utc>::MAX_UTC)
    }

    /// Returns `true` if the millisecond timestamp lies within the range.
    pub fn contains(&self, timestamp_ms: i64) -> bool {
        self.start.timestamp_millis() <= timestamp_ms && timestamp_ms <= self.end.timestamp_millis()
    }
}

/// Leadership of this replica.
pub trait Lease: Send + Sync {
    /// Returns the range this replica may currently write, or `None` if it is not authoritative.
    fn range(&self) -> Option<LeaseRange>;

    /// Registers a callback invoked on every leadership change.
    fn on_leader_change(&self, callback: LeaderChangeCallback);
}

/// A lease that is always held, used when high availability is not configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysLease;

impl Lease for AlwaysLease {
    fn range(&self) -> Option<LeaseRange> {
        Some(LeaseRange::unbounded())
    }

    fn on_leader_change(&self, _callback: LeaderChangeCallback) {
        // Leadership never changes.
    }
}

/// A lease whose range is set explicitly, for example by an external election loop.
///
/// Switching between holding and not holding the lease counts as a leadership change.
#[derive(Default)]
pub struct ManualLease {
    range: RwLock<Option<LeaseRange>>,
    callbacks: Mutex<Vec<Arc<dyn Fn() + Send + Sync>>>,
}

impl ManualLease {
    /// Creates a lease that starts out with the given range.
    pub fn new(range: Option<LeaseRange>) -> Self {
        Self {
            range: RwLock::new(range),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Updates the leased range.
    pub fn set_range(&self, range: Option<LeaseRange>) {
        let changed = {
            let mut current = self.range.write();
            let changed = current.is_some() != range.is_some();
            *current = range;
            changed
        };

        if changed {
            tally_log::info!(leader = range.is_some(), "lease leadership changed");
            // Callbacks may register further callbacks.
            let callbacks = self.callbacks.lock().clone();
            for callback in callbacks {
                callback();
            }
        }
    }
}

impl Lease for ManualLease {
    fn range(&self) -> Option<LeaseRange> {
        *self.range.read()
    }

    fn on_leader_change(&self, callback: LeaderChangeCallback) {
        self.callbacks.lock().push(Arc::from(callback));
    }
}

impl std::fmt::Debug for ManualLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualLease")
            .field("range", &*self.range.read())
            .field("callbacks", &self.callbacks.lock().len())
            .finish()
    }
}
