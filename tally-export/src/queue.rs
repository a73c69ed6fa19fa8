/// A fixed-capacity FIFO queue backed by a circular buffer.
///
/// The queue never grows. Once it holds `capacity` entries, [`add`](Self::add) rejects new entries
/// and hands them back to the caller, which is expected to count them as dropped.
///
/// The queue does no locking. The owning [`Shard`](crate::Shard) serializes access.
#[derive(Debug)]
pub struct RingQueue<T> {
    slots: Box<[Option<T>]>,
    head: usize,
    tail: usize,
    len: usize,
}

impl<T> RingQueue<T> {
    /// Creates an empty queue holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: std::iter::repeat_with(|| None).take(capacity).collect(),
            head: 0,
            tail: 0,
            len: 0,
        }
    }

    /// Appends an entry at the tail.
    ///
    /// Returns the entry back if the queue is full. The queue is left unchanged in that case.
    pub fn add(&mut self, entry: T) -> Result<(), T> {
        if self.len == self.slots.len() {
            return Err(entry);
        }

        self.slots[self.tail] = Some(entry);
        self.tail = (self.tail + 1) % self.slots.len();
        self.len += 1;
        Ok(())
    }

    /// Returns the entry at the head without removing it.
    pub fn peek(&self) -> Option<&T> {
        if self.len == 0 {
            return None;
        }
        self.slots[self.head].as_ref()
    }

    /// Removes and returns the entry at the head.
    pub fn remove(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }

        let entry = self.slots[self.head].take();
        self.head = (self.head + 1) % self.slots.len();
        self.len -= 1;
        entry
    }

    /// Returns the number of queued entries.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if no entries are queued.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}
