//! Ring-buffer + set hybrid DDQ: O(1) `contains`/`add`, single lock.

use std::collections::HashSet;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Ddq, DdqStats};

struct Inner {
    slots: Vec<Option<String>>,
    set: HashSet<String>,
    cursor: usize,
    count: usize,
}

/// In-process DDQ backed by a fixed-length circular array mirrored by a
/// `HashSet` for O(1) membership (spec.md §4.3, Memory implementation).
pub struct MemoryDdq {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl MemoryDdq {
    /// Allocate a DDQ with room for `capacity` distinct uuids.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "DDQ capacity must be positive");
        Self {
            capacity,
            inner: Mutex::new(Inner {
                slots: vec![None; capacity],
                set: HashSet::with_capacity(capacity),
                cursor: 0,
                count: 0,
            }),
        }
    }
}

#[async_trait]
impl Ddq for MemoryDdq {
    async fn contains(&self, uuid: &str) -> bool {
        self.inner.lock().set.contains(uuid)
    }

    async fn add(&self, uuid: &str) {
        let mut inner = self.inner.lock();
        if inner.set.contains(uuid) {
            return;
        }
        let cursor = inner.cursor;
        if let Some(evicted) = inner.slots[cursor].take() {
            inner.set.remove(&evicted);
        }
        inner.slots[cursor] = Some(uuid.to_string());
        inner.set.insert(uuid.to_string());
        inner.cursor = (cursor + 1) % self.capacity;
        if inner.count < self.capacity {
            inner.count += 1;
        }
    }

    async fn stats(&self) -> DdqStats {
        let inner = self.inner.lock();
        DdqStats {
            size: self.capacity,
            count: inner.count,
            utilization: inner.count as f64 / self.capacity as f64,
        }
    }

    async fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.slots.iter_mut().for_each(|s| *s = None);
        inner.set.clear();
        inner.cursor = 0;
        inner.count = 0;
    }
}
