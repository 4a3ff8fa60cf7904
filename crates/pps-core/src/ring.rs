//! ---
//! pps_section: "02-correlation-core"
//! pps_subsection: "module"
//! pps_type: "source"
//! pps_scope: "code"
//! pps_description: "Fixed-capacity circular sample buffer."
//! pps_version: "v0.1.0"
//! pps_owner: "tbd"
//! ---
//! Fixed-capacity ring used by every stateful stage of the tracker.
//!
//! Storage is allocated once in [`RingBuffer::with_capacity`]; no operation
//! allocates afterwards. A full ring either refuses new values
//! ([`RingBuffer::push`]) or hands back the evicted oldest value
//! ([`RingBuffer::push_overwrite`]) so callers can account for the loss.

/// Circular FIFO over `Copy` samples with explicit read index and length.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    slots: Vec<T>,
    read: usize,
    len: usize,
}

impl<T: Copy + Default> RingBuffer<T> {
    /// Allocate a ring holding at most `capacity` values.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero; capacities come from validated configuration.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        Self {
            slots: vec![T::default(); capacity],
            read: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.slots.len()
    }

    fn slot(&self, offset: usize) -> usize {
        (self.read + offset) % self.slots.len()
    }

    /// Append `value`, refusing it when the ring is full.
    pub fn push(&mut self, value: T) -> Result<(), T> {
        if self.is_full() {
            return Err(value);
        }
        let write = self.slot(self.len);
        self.slots[write] = value;
        self.len += 1;
        Ok(())
    }

    /// Append `value`, evicting and returning the oldest value when full.
    pub fn push_overwrite(&mut self, value: T) -> Option<T> {
        if self.is_full() {
            let evicted = self.slots[self.read];
            self.slots[self.read] = value;
            self.read = self.slot(1);
            Some(evicted)
        } else {
            let write = self.slot(self.len);
            self.slots[write] = value;
            self.len += 1;
            None
        }
    }

    pub fn pop_front(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let value = self.slots[self.read];
        self.read = self.slot(1);
        self.len -= 1;
        Some(value)
    }

    /// Oldest value.
    pub fn front(&self) -> Option<T> {
        self.get(0)
    }

    /// Newest value.
    pub fn back(&self) -> Option<T> {
        self.len.checked_sub(1).and_then(|last| self.get(last))
    }

    /// Value at `index`, counted from the oldest entry.
    pub fn get(&self, index: usize) -> Option<T> {
        (index < self.len).then(|| self.slots[self.slot(index)])
    }

    /// Value `age` steps behind the newest entry (`0` is the newest).
    pub fn newest(&self, age: usize) -> Option<T> {
        self.len
            .checked_sub(age + 1)
            .and_then(|index| self.get(index))
    }

    /// Iterate from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = T> + Clone + '_ {
        (0..self.len).map(move |index| self.slots[self.slot(index)])
    }

    pub fn clear(&mut self) {
        self.read = 0;
        self.len = 0;
    }
}
