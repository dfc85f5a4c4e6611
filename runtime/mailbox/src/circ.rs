//! Circular Queue Arithmetic
//!
//! Head and tail of every mailbox queue are counters in `[0, 2 * size)`.
//! The low bits select the element slot, the bit worth `size` is the wrap
//! bit. Keeping one extra bit lets `head == tail` mean "empty" and
//! `head == tail ^ wrap` mean "full", so all `size` slots are usable.
//!
//! Everything here is a pure function of `(head, tail, size)`. The same
//! arithmetic runs on the host and on the device side of a queue.

/// Largest queue size the 10-bit `*_QUEUE_SIZE` CSRs can describe
pub const MAX_QUEUE_SIZE: u32 = 512;

/// Geometry of one circular queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CircularQueue {
    size: u32,
}

impl CircularQueue {
    /// Describe a queue of `size` elements
    ///
    /// Returns `None` unless `size` is a non-zero power of two no larger
    /// than [`MAX_QUEUE_SIZE`].
    pub const fn new(size: u32) -> Option<Self> {
        if size == 0 || !size.is_power_of_two() || size > MAX_QUEUE_SIZE {
            return None;
        }
        Some(Self { size })
    }

    /// Number of element slots
    pub const fn size(self) -> u32 {
        self.size
    }

    /// The bit toggled every time an index passes the end of the buffer
    pub const fn wrap_bit(self) -> u32 {
        self.size
    }

    const fn counter_mask(self) -> u32 {
        (self.size << 1) - 1
    }

    /// Whether `index` is a legal counter value for this queue
    pub const fn is_valid(self, index: u32) -> bool {
        index & !self.counter_mask() == 0
    }

    /// Slot in the element buffer addressed by `index`
    pub const fn real_index(self, index: u32) -> u32 {
        index & (self.size - 1)
    }

    /// Number of elements between `head` and `tail`
    ///
    /// A distance larger than the queue itself can only come from a
    /// corrupted CSR; it is reported as an empty queue.
    pub const fn count(self, head: u32, tail: u32) -> u32 {
        let count = tail.wrapping_sub(head) & self.counter_mask();
        if count > self.size {
            0
        } else {
            count
        }
    }

    /// Free slots between `tail` and `head`
    pub const fn space(self, head: u32, tail: u32) -> u32 {
        self.size - self.count(head, tail)
    }

    pub const fn is_empty(self, head: u32, tail: u32) -> bool {
        head == tail
    }

    pub const fn is_full(self, head: u32, tail: u32) -> bool {
        tail == head ^ self.wrap_bit()
    }

    /// Advance `index` by `inc` slots
    pub const fn inc(self, index: u32, inc: u32) -> u32 {
        index.wrapping_add(inc) & self.counter_mask()
    }
}
