//! Flat joined-key counter map (spec.md §4.9), simplified from the
//! teacher's metrics-crate aggregation to a dependency-free counter table.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// Join key parts the way spec.md §3 describes composite statistics keys:
/// components joined by `+`.
fn join_key(key_parts: &[&str]) -> String {
    key_parts.join("+")
}

/// Joined-key -> atomic counter registry. Keys are caller-chosen parts,
/// typically `&[message_class, outcome]` or `&[handler_id, outcome]`.
#[derive(Default)]
pub struct Statistics {
    counters: DashMap<String, AtomicU64>,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the counter for `key_parts` by `delta`, creating it at zero
    /// if absent.
    pub fn add(&self, key_parts: &[&str], delta: u64) {
        self.counters
            .entry(join_key(key_parts))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(delta, Ordering::Relaxed);
    }

    /// Increment the counter for `key_parts` by one.
    pub fn incr(&self, key_parts: &[&str]) {
        self.add(key_parts, 1);
    }

    /// Current value for `key_parts`, or zero if never touched.
    pub fn get(&self, key_parts: &[&str]) -> u64 {
        self.counters
            .get(&join_key(key_parts))
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Reset a single key to zero, or every key when `key_parts` is `None`.
    pub fn reset(&self, key_parts: Option<&[&str]>) {
        match key_parts {
            Some(parts) => {
                if let Some(c) = self.counters.get(&join_key(parts)) {
                    c.store(0, Ordering::Relaxed);
                }
            }
            None => self.counters.clear(),
        }
    }

    /// Snapshot of every counter currently tracked.
    pub fn all(&self) -> Vec<(String, u64)> {
        self.counters
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_get_round_trip() {
        let s = Statistics::new();
        s.incr(&["Ping", "routed"]);
        s.incr(&["Ping", "routed"]);
        s.add(&["Ping", "filtered"], 5);
        assert_eq!(s.get(&["Ping", "routed"]), 2);
        assert_eq!(s.get(&["Ping", "filtered"]), 5);
        assert_eq!(s.get(&["missing"]), 0);
    }

    #[test]
    fn keys_join_with_plus() {
        let s = Statistics::new();
        s.incr(&["Ping", "routed"]);
        assert_eq!(s.all(), vec![("Ping+routed".to_string(), 1)]);
    }

    #[test]
    fn reset_single_key() {
        let s = Statistics::new();
        s.incr(&["a"]);
        s.incr(&["b"]);
        s.reset(Some(&["a"]));
        assert_eq!(s.get(&["a"]), 0);
        assert_eq!(s.get(&["b"]), 1);
    }

    #[test]
    fn reset_all_keys() {
        let s = Statistics::new();
        s.incr(&["a"]);
        s.incr(&["b"]);
        s.reset(None);
        assert_eq!(s.get(&["a"]), 0);
        assert_eq!(s.get(&["b"]), 0);
    }
}
