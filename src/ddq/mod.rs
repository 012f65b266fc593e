//! Deduplication Queue: per-(message_class, handler) at-most-once gate.
//!
//! Two implementations share the [`Ddq`] trait: [`memory::MemoryDdq`] (a
//! ring-buffer + set hybrid, always available) and, behind the
//! `external-kv` feature, [`external_kv::ExternalKvDdq`] (Redis-backed, for
//! deployments where handlers run on more than one process).

pub mod memory;

#[cfg(feature = "external-kv")]
pub mod external_kv;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Snapshot of a DDQ's occupancy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DdqStats {
    /// Configured capacity (N).
    pub size: usize,
    /// Number of distinct UUIDs currently tracked (<= size).
    pub count: usize,
    /// `count / size`, in `[0.0, 1.0]`.
    pub utilization: f64,
}

/// Deduplication contract shared by every backend (spec.md §4.3).
#[async_trait]
pub trait Ddq: Send + Sync {
    /// Whether `uuid` has already been seen. Must fail open (return `false`)
    /// on backend error rather than block processing.
    async fn contains(&self, uuid: &str) -> bool;

    /// Mark `uuid` as seen. Idempotent: adding an already-present uuid is a
    /// no-op that does not disturb eviction order.
    async fn add(&self, uuid: &str);

    /// Current occupancy snapshot.
    async fn stats(&self) -> DdqStats;

    /// Forget every tracked uuid.
    async fn clear(&self);
}

/// Configuration for DDQ instances, keyed by capacity and backend choice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DdqConfig {
    /// Ring/set capacity (N). Must be positive.
    pub capacity: usize,
    /// Which backend new DDQ handles default to.
    pub backend: DdqBackend,
    /// TTL, in seconds, refreshed on every `add` for the external-KV backend.
    /// Ignored by the memory backend.
    pub external_ttl_secs: u64,
    /// Connection string for the external-KV backend. Ignored by the memory
    /// backend and when the `external-kv` feature is disabled.
    pub external_kv_url: Option<String>,
}

/// Which concrete [`Ddq`] implementation to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DdqBackend {
    /// In-process ring + set hybrid (default).
    #[default]
    Memory,
    /// Durable external KV store, for multi-process handler fleets.
    ExternalKv,
}

impl Default for DdqConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            backend: DdqBackend::Memory,
            external_ttl_secs: 3_600,
            external_kv_url: None,
        }
    }
}

impl DdqConfig {
    /// Build the configured backend. Panics only on a zero capacity, which
    /// is a construction-time programmer error, not a runtime condition.
    pub fn build(&self) -> std::sync::Arc<dyn Ddq> {
        assert!(self.capacity > 0, "DDQ capacity must be positive");
        match self.backend {
            DdqBackend::Memory => std::sync::Arc::new(memory::MemoryDdq::new(self.capacity)),
            DdqBackend::ExternalKv => {
                #[cfg(feature = "external-kv")]
                {
                    std::sync::Arc::new(external_kv::ExternalKvDdq::new(
                        self.capacity,
                        self.external_ttl_secs,
                        self.external_kv_url.as_deref(),
                    ))
                }
                #[cfg(not(feature = "external-kv"))]
                {
                    tracing::warn!("external-kv feature not enabled, falling back to memory DDQ");
                    std::sync::Arc::new(memory::MemoryDdq::new(self.capacity))
                }
            }
        }
    }
}
