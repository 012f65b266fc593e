//! Process-wide configuration.
//!
//! Mirrors `rustpress_core::config::AppConfig`: plain, `serde`-deserializable
//! structs with documented defaults, loadable via the `config` crate, held
//! read-only after startup behind a process-wide cell that tests can reset.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::ddq::DdqConfig;

/// Backpressure strategy for an async publish queue (stdout/file transport).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueueOverflowStrategy {
    /// Block the publisher until space is available.
    Block,
    /// Drop the message currently being enqueued.
    DropNewest,
    /// Drop the oldest queued message to make room.
    #[default]
    DropOldest,
}

/// Output format for the stdout/file transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// One compact JSON object per line (default).
    #[default]
    Jsonl,
    /// A single JSON array document.
    Json,
    /// Multi-line pretty-printed JSON per record.
    Pretty,
}

/// Circuit-breaker tuning, shared by every named circuit unless overridden.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Failures required within `within_secs` to trip the circuit.
    pub failure_threshold: u32,
    /// Rolling window, in seconds, over which failures are counted.
    pub within_secs: u64,
    /// Seconds to wait in `open` before probing in `half_open`.
    pub reset_after_secs: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            within_secs: 30,
            reset_after_secs: 15,
        }
    }
}

/// Memory transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryTransportConfig {
    pub max_messages: usize,
    pub auto_process: bool,
}

impl Default for MemoryTransportConfig {
    fn default() -> Self {
        Self {
            max_messages: 1000,
            auto_process: true,
        }
    }
}

/// Stdout/file transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StdoutFileConfig {
    pub format: OutputFormat,
    pub file_path: Option<String>,
    pub rotate_size_bytes: Option<u64>,
    pub rotate_count: Option<u32>,
    pub buffer_size: usize,
    pub auto_flush: bool,
    pub is_async: bool,
    pub max_queue: usize,
    pub queue_overflow_strategy: QueueOverflowStrategy,
    pub max_retries: u32,
    pub max_retry_delay_ms: u64,
}

impl Default for StdoutFileConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::Jsonl,
            file_path: None,
            rotate_size_bytes: None,
            rotate_count: None,
            buffer_size: 64 * 1024,
            auto_flush: true,
            is_async: false,
            max_queue: 1024,
            queue_overflow_strategy: QueueOverflowStrategy::DropOldest,
            max_retries: 3,
            max_retry_delay_ms: 30_000,
        }
    }
}

/// Queue-backed broker transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub queue_prefix: String,
    pub exchange_name: String,
    pub consumer_timeout_secs: u64,
    pub max_queue_size: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            queue_prefix: "dispatchbus".to_string(),
            exchange_name: "dispatchbus.broker".to_string(),
            consumer_timeout_secs: 1,
            max_queue_size: 10_000,
        }
    }
}

/// Process-wide defaults: default DLQ path, default serializer name, and
/// component-level configuration tables. Read-heavy after startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub default_dlq_path: String,
    pub default_serializer: String,
    pub circuit: CircuitConfig,
    pub ddq: DdqConfig,
    pub memory_transport: MemoryTransportConfig,
    pub stdout_file: StdoutFileConfig,
    pub broker: BrokerConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            default_dlq_path: "dispatchbus.dlq.jsonl".to_string(),
            default_serializer: "json".to_string(),
            circuit: CircuitConfig::default(),
            ddq: DdqConfig::default(),
            memory_transport: MemoryTransportConfig::default(),
            stdout_file: StdoutFileConfig::default(),
            broker: BrokerConfig::default(),
        }
    }
}

static GLOBAL: Lazy<RwLock<GlobalConfig>> = Lazy::new(|| RwLock::new(GlobalConfig::default()));

/// Read a clone of the current global configuration.
pub fn global() -> GlobalConfig {
    GLOBAL.read().clone()
}

/// Replace the global configuration (e.g. loaded via the `config` crate from
/// file/env at process startup).
pub fn set_global(cfg: GlobalConfig) {
    *GLOBAL.write() = cfg;
}

/// Reset the global configuration to defaults. Tests must be able to do
/// this to avoid cross-test leakage (spec.md §9, "Global configuration").
pub fn reset_global() {
    set_global(GlobalConfig::default());
}

/// Load a `GlobalConfig` by layering a config source (file/env) over
/// defaults, using the `config` crate the way `rustpress_core::AppConfig`
/// does.
pub fn load(source: config::Config) -> crate::error::Result<GlobalConfig> {
    source
        .try_deserialize()
        .map_err(|e| crate::error::Error::Argument(e.to_string()))
}
