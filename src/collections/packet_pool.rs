//! Per-track packet memory pool with FIFO discipline.
//!
//! The pool hands out write slots for demuxed payloads and keeps a FIFO
//! record of committed allocation sizes against a byte budget. Payload
//! memory itself is `Bytes`-owned, so a buffer is returned to the allocator
//! when the last clone (pool record, GOP cache entry, in-flight packet)
//! drops.
//!
//! Eviction has exactly one driver per pool. A standalone pool
//! ([`PacketPool::new`]) discards its own head records when a commit pushes
//! past the budget. A pool created with
//! [`PacketPool::with_external_eviction`] belongs to a cache that calls
//! `free_head` as it discards packets; the pool never drops records on its
//! own there, because a self-evicted record would leave the cache freeing
//! the wrong entries from then on.

use bytes::{Bytes, BytesMut};

pub struct PacketPool {
    capacity: usize,
    used: usize,
    /// Committed allocation sizes, oldest first.
    records: std::collections::VecDeque<usize>,
    staging: Option<BytesMut>,
    evict_on_overflow: bool,
    overflow_warned: bool,
}

impl PacketPool {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            used: 0,
            records: std::collections::VecDeque::with_capacity(64),
            staging: None,
            evict_on_overflow: true,
            overflow_warned: false,
        }
    }

    /// Pool whose record lifetimes are owned by an external cache. Records
    /// survive until that cache frees them in FIFO order, even past the
    /// byte budget.
    #[must_use]
    pub fn with_external_eviction(capacity: usize) -> Self {
        Self {
            evict_on_overflow: false,
            ..Self::new(capacity)
        }
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub const fn used(&self) -> usize {
        self.used
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.records.len()
    }

    /// Begin a variable-length write. Discards any unfetched staging.
    pub fn mark(&mut self) {
        self.staging = Some(BytesMut::new());
    }

    /// Grow the in-progress allocation by `n` writable bytes and return the
    /// slot. Call `mark` first.
    pub fn allocate(&mut self, n: usize) -> &mut [u8] {
        let staging = self.staging.get_or_insert_with(BytesMut::new);
        let start = staging.len();
        staging.resize(start + n, 0);
        &mut staging[start..]
    }

    /// Commit the staged write, returning the frozen payload. A standalone
    /// pool discards oldest records to stay inside the budget; an
    /// externally-evicted pool keeps every record and flags the overflow to
    /// its owner instead.
    pub fn fetch(&mut self) -> Bytes {
        let staging = self.staging.take().unwrap_or_default();
        let len = staging.len();
        if self.evict_on_overflow {
            while self.used + len > self.capacity && !self.records.is_empty() {
                self.free_head();
            }
        } else if self.used + len > self.capacity {
            debug_assert!(
                false,
                "pool budget exceeded while eviction is externally driven \
                 (used {} + {} > {})",
                self.used, len, self.capacity
            );
            if !self.overflow_warned {
                self.overflow_warned = true;
                tracing::warn!(
                    used = self.used,
                    incoming = len,
                    capacity = self.capacity,
                    "pool budget exceeded, records held for the owning cache"
                );
            }
        }
        self.used += len;
        self.records.push_back(len);
        staging.freeze()
    }

    /// Release the oldest committed allocation.
    pub fn free_head(&mut self) {
        if let Some(len) = self.records.pop_front() {
            self.used -= len;
        }
    }

    /// Release the most recently committed allocation. Once `free_head` has
    /// consumed every record the tail mark is gone and this is a no-op.
    pub fn free_tail(&mut self) {
        debug_assert!(
            !self.records.is_empty(),
            "free_tail after the head passed the tail mark"
        );
        if let Some(len) = self.records.pop_back() {
            self.used -= len;
        }
    }

    /// Drop every record and any staged write.
    pub fn reset(&mut self) {
        self.records.clear();
        self.used = 0;
        self.staging = None;
        self.overflow_warned = false;
    }
}
