use hashbrown::HashSet;
use parking_lot::Mutex;

use crate::batch::Batch;
use crate::queue::RingQueue;
use crate::series::HashedSeries;
use crate::statsd::ExporterHistograms;

#[derive(Debug)]
struct Inner {
    queue: RingQueue<HashedSeries>,
    /// Set while a batch containing entries of this shard is in flight.
    pending: bool,
    /// Hashes taken during the current fill. Kept allocated across fills.
    seen: HashSet<u64>,
}

/// Point-in-time state of a [`Shard`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShardState {
    /// Number of queued entries.
    pub queued: usize,
    /// Whether a batch with entries from this shard is in flight.
    pub pending: bool,
}

/// A partition of the series space with at most one batch in flight.
///
/// Entries are routed to shards by their series hash. A shard stops contributing to batches while
/// one of its previous batches is being sent, and never hands out two entries with the same hash
/// in a single fill. Together this guarantees that the same series is never part of two
/// concurrent writes.
#[derive(Debug)]
pub struct Shard {
    inner: Mutex<Inner>,
}

impl Shard {
    /// Creates an idle shard buffering at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: RingQueue::new(capacity),
                pending: false,
                seen: HashSet::new(),
            }),
        }
    }

    /// Queues an entry for sending.
    ///
    /// Returns the entry back if the shard's buffer is full.
    pub fn enqueue(&self, entry: HashedSeries) -> Result<(), HashedSeries> {
        self.inner.lock().queue.add(entry)
    }

    /// Moves queued entries into `batch` and returns how many were taken.
    ///
    /// Takes nothing while the shard is pending. Otherwise takes entries from the head of the
    /// queue until the batch is full or the next entry's series was already taken in this call.
    /// If anything was taken, the shard is registered with the batch and becomes pending until
    /// [`notify_done`](Self::notify_done) is called.
    pub fn fill(&self, index: usize, batch: &mut Batch) -> usize {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if inner.pending {
            return 0;
        }

        let mut taken = 0;
        while !batch.is_full() {
            let Some(entry) = inner.queue.peek() else {
                break;
            };

            if !inner.seen.insert(entry.hash) {
                break;
            }

            if let Some(entry) = inner.queue.remove() {
                batch.add(entry.series);
                taken += 1;
            }
        }

        inner.seen.clear();

        if taken > 0 {
            inner.pending = true;
            batch.add_shard(index);
            tally_statsd::metric!(histogram(ExporterHistograms::ShardFillSize) = taken as u64);
        }

        taken
    }

    /// Releases the shard after the batch it contributed to has completed.
    ///
    /// # Panics
    ///
    /// Panics if the shard is not pending. Every non-zero [`fill`](Self::fill) must be matched by
    /// exactly one call.
    pub fn notify_done(&self) {
        let mut inner = self.inner.lock();
        assert!(inner.pending, "shard released while not pending");
        inner.pending = false;
    }

    /// Returns the current queue length and pending flag.
    pub fn state(&self) -> ShardState {
        let inner = self.inner.lock();
        ShardState {
            queued: inner.queue.len(),
            pending: inner.pending,
        }
    }

    /// Removes all queued entries and returns how many there were.
    pub(crate) fn discard(&self) -> usize {
        let mut inner = self.inner.lock();
        let mut count = 0;
        while inner.queue.remove().is_some() {
            count += 1;
        }
        count
    }
}
