//! Publish-only stdout/file transport with configurable output format,
//! optional async queueing with backpressure, retry-with-backoff, and DLQ
//! forwarding on exhaustion (spec.md §4.6 "Stdout/File").

use std::collections::VecDeque;
use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::circuit::CircuitRegistry;
use crate::config::{OutputFormat, QueueOverflowStrategy, StdoutFileConfig};
use crate::dlq::{DeadLetterQueue, DlqEnqueue};
use crate::error::Result;
use crate::filter::Filter;
use crate::header::Header;
use crate::stats::Statistics;

use super::{HandlerId, RouteFn, SubscriptionId, Transport};

/// Output sink: either a file path (opened in append mode) or stdout.
enum Sink {
    Stdout,
    File(Mutex<std::fs::File>),
}

struct QueuedWrite {
    header: Header,
    bytes: Vec<u8>,
}

/// Bounded async publish queue with the three overflow policies spec.md §9
/// names. A plain `mpsc` channel can only reject the newest item on
/// overflow — `DropOldest` needs to evict the queue's front entry, which
/// requires owning the backing buffer on both the push and pop side.
struct AsyncQueue {
    items: Mutex<VecDeque<QueuedWrite>>,
    capacity: usize,
    overflow: QueueOverflowStrategy,
    item_ready: Notify,
    space_available: Notify,
}

impl AsyncQueue {
    fn new(capacity: usize, overflow: QueueOverflowStrategy) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            overflow,
            item_ready: Notify::new(),
            space_available: Notify::new(),
        }
    }

    /// Enqueue `item`, applying the configured overflow policy when full.
    /// `Block` waits for a consumer to make room and returns the time spent
    /// waiting.
    async fn push(&self, item: QueuedWrite) -> std::time::Duration {
        let started = std::time::Instant::now();
        loop {
            {
                let mut items = self.items.lock();
                if items.len() < self.capacity {
                    items.push_back(item);
                    drop(items);
                    self.item_ready.notify_one();
                    return started.elapsed();
                }
                match self.overflow {
                    QueueOverflowStrategy::DropNewest => {
                        drop(items);
                        tracing::warn!("async publish queue full, dropping newest message");
                        return started.elapsed();
                    }
                    QueueOverflowStrategy::DropOldest => {
                        items.pop_front();
                        items.push_back(item);
                        drop(items);
                        tracing::warn!(
                            "async publish queue full, dropped oldest queued message to make room"
                        );
                        self.item_ready.notify_one();
                        return started.elapsed();
                    }
                    QueueOverflowStrategy::Block => {
                        // fall through to wait below
                    }
                }
            }
            // Only reachable for `Block`; `item` was not moved this
            // iteration, so it's retried once a consumer frees space.
            self.space_available.notified().await;
        }
    }

    async fn pop(&self) -> QueuedWrite {
        loop {
            {
                let mut items = self.items.lock();
                if let Some(item) = items.pop_front() {
                    drop(items);
                    self.space_available.notify_one();
                    return item;
                }
            }
            self.item_ready.notified().await;
        }
    }
}

/// Publish-only transport. Subscribe attempts are rejected with a logged
/// warning (spec.md §4.6).
pub struct StdoutFileTransport {
    config: StdoutFileConfig,
    sink: Sink,
    bytes_written: std::sync::atomic::AtomicU64,
    rotation_index: std::sync::atomic::AtomicU32,
    circuits: CircuitRegistry,
    dlq: Option<Arc<DeadLetterQueue>>,
    queue: RwLock<Option<Arc<AsyncQueue>>>,
    stats: Statistics,
}

impl StdoutFileTransport {
    pub fn new(config: StdoutFileConfig, dlq: Option<Arc<DeadLetterQueue>>) -> Result<Arc<Self>> {
        let sink = match &config.file_path {
            Some(path) => Sink::File(Mutex::new(
                std::fs::OpenOptions::new().create(true).append(true).open(path)?,
            )),
            None => Sink::Stdout,
        };
        let transport = Arc::new(Self {
            config,
            sink,
            bytes_written: std::sync::atomic::AtomicU64::new(0),
            rotation_index: std::sync::atomic::AtomicU32::new(0),
            circuits: CircuitRegistry::new(),
            dlq,
            queue: RwLock::new(None),
            stats: Statistics::new(),
        });
        if transport.config.is_async {
            transport.clone().spawn_worker();
        }
        Ok(transport)
    }

    /// Publish statistics for this transport, including the blocked-wait
    /// duration accrued by the `block` queue overflow strategy (spec.md §9).
    pub fn stats(&self) -> &Statistics {
        &self.stats
    }

    fn spawn_worker(self: Arc<Self>) {
        let queue = Arc::new(AsyncQueue::new(
            self.config.max_queue,
            self.config.queue_overflow_strategy,
        ));
        *self.queue.write() = Some(queue.clone());
        tokio::spawn(async move {
            loop {
                let item = queue.pop().await;
                if let Err(e) = self.write_with_retry(&item.header, &item.bytes).await {
                    tracing::error!(error = %e, "stdout/file transport exhausted retries");
                }
            }
        });
    }

    fn format_line(&self, header: &Header, bytes: &[u8]) -> Result<Vec<u8>> {
        let payload: serde_json::Value = serde_json::from_slice(bytes).unwrap_or(serde_json::Value::Null);
        let record = serde_json::json!({
            "header": header,
            "payload": payload,
        });
        let formatted = match self.config.format {
            OutputFormat::Jsonl => format!("{}\n", serde_json::to_string(&record)?),
            OutputFormat::Json => format!("{}\n", serde_json::to_string(&record)?),
            OutputFormat::Pretty => format!("{}\n", serde_json::to_string_pretty(&record)?),
        };
        Ok(formatted.into_bytes())
    }

    fn write_raw(&self, bytes: &[u8]) -> Result<()> {
        match &self.sink {
            Sink::Stdout => {
                std::io::stdout().write_all(bytes)?;
                if self.config.auto_flush {
                    std::io::stdout().flush()?;
                }
            }
            Sink::File(file) => {
                let mut file = file.lock();
                file.write_all(bytes)?;
                if self.config.auto_flush {
                    file.flush()?;
                }
            }
        }
        self.bytes_written
            .fetch_add(bytes.len() as u64, std::sync::atomic::Ordering::Relaxed);
        self.maybe_rotate()?;
        Ok(())
    }

    fn maybe_rotate(&self) -> Result<()> {
        let Sink::File(file) = &self.sink else {
            return Ok(());
        };
        let Some(limit) = self.config.rotate_size_bytes else {
            return Ok(());
        };
        if self.bytes_written.load(std::sync::atomic::Ordering::Relaxed) < limit {
            return Ok(());
        }
        let Some(path) = &self.config.file_path else {
            return Ok(());
        };
        let index = self
            .rotation_index
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            + 1;
        let rotated = format!("{path}.{index}");
        let mut guard = file.lock();
        guard.flush()?;
        drop(guard);
        std::fs::rename(path, &rotated)?;
        *file.lock() = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        self.bytes_written.store(0, std::sync::atomic::Ordering::Relaxed);
        if let Some(max) = self.config.rotate_count {
            if index > max {
                let stale = format!("{path}.{}", index - max);
                if let Err(e) = std::fs::remove_file(&stale) {
                    tracing::debug!(error = %e, file = %stale, "failed to prune rotated file beyond rotate_count");
                }
            }
        }
        Ok(())
    }

    async fn write_with_retry(&self, header: &Header, bytes: &[u8]) -> Result<()> {
        let formatted = self.format_line(header, bytes)?;
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_max_elapsed_time(Some(std::time::Duration::from_millis(
                self.config.max_retry_delay_ms,
            )))
            .build();
        let mut attempts = 0;
        loop {
            match self.write_raw(&formatted) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    attempts += 1;
                    if attempts >= self.config.max_retries {
                        self.forward_to_dlq(header, bytes, &e.to_string());
                        return Err(e);
                    }
                    match backoff.next_backoff() {
                        Some(delay) => tokio::time::sleep(delay).await,
                        None => {
                            self.forward_to_dlq(header, bytes, &e.to_string());
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    fn forward_to_dlq(&self, header: &Header, bytes: &[u8], error: &str) {
        let Some(dlq) = &self.dlq else { return };
        let payload = String::from_utf8_lossy(bytes).to_string();
        if let Err(e) = dlq.enqueue(DlqEnqueue {
            header: header.clone(),
            payload,
            error,
            retry_count: self.config.max_retries,
            transport: "stdout_file",
            stack_trace: None,
        }) {
            tracing::error!(error = %e, "failed to forward exhausted write to DLQ");
        }
    }
}

#[async_trait]
impl Transport for StdoutFileTransport {
    fn name(&self) -> &str {
        "stdout_file"
    }

    fn circuits(&self) -> &CircuitRegistry {
        &self.circuits
    }

    fn set_router(&self, _router: RouteFn) {
        // Publish-only: there is nothing to route to.
    }

    async fn do_publish(&self, message_class: &str, bytes: Vec<u8>) -> Result<()> {
        let header = Header::new(message_class, "unknown", 1);
        if self.config.is_async {
            let queue = self.queue.read().clone();
            if let Some(queue) = queue {
                let item = QueuedWrite { header, bytes };
                let waited = queue.push(item).await;
                if matches!(self.config.queue_overflow_strategy, QueueOverflowStrategy::Block) {
                    self.stats
                        .add(&["stdout_file", "block_wait_ms"], waited.as_millis() as u64);
                }
                return Ok(());
            }
        }
        self.write_with_retry(&header, &bytes).await
    }

    async fn subscribe(
        &self,
        _message_class: &str,
        _handler_id: HandlerId,
        _filter: Filter,
    ) -> Result<SubscriptionId> {
        tracing::warn!("stdout/file transport is publish-only; subscribe rejected");
        Err(crate::error::Error::SubscribeNotSupported)
    }

    async fn unsubscribe(&self, _message_class: &str, _handler_id: &HandlerId) -> Result<()> {
        Err(crate::error::Error::SubscribeNotSupported)
    }

    async fn unsubscribe_all(&self, _message_class: &str) -> Result<()> {
        Err(crate::error::Error::SubscribeNotSupported)
    }

    fn connected(&self) -> bool {
        true
    }

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(path: &std::path::Path) -> StdoutFileConfig {
        StdoutFileConfig {
            format: OutputFormat::Jsonl,
            file_path: Some(path.to_string_lossy().to_string()),
            rotate_size_bytes: None,
            rotate_count: None,
            buffer_size: 4096,
            auto_flush: true,
            is_async: false,
            max_queue: 16,
            queue_overflow_strategy: QueueOverflowStrategy::DropOldest,
            max_retries: 3,
            max_retry_delay_ms: 1000,
        }
    }

    #[tokio::test]
    async fn publish_writes_jsonl_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        let transport = StdoutFileTransport::new(config(&path), None).unwrap();
        transport
            .publish("Ping", serde_json::to_vec(&serde_json::json!({"a":1})).unwrap())
            .await
            .unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.contains("\"a\":1"));
    }

    #[tokio::test]
    async fn block_strategy_records_wait_duration() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        let mut cfg = config(&path);
        cfg.is_async = true;
        cfg.max_queue = 1;
        cfg.queue_overflow_strategy = QueueOverflowStrategy::Block;
        let transport = StdoutFileTransport::new(cfg, None).unwrap();
        for i in 0..3 {
            transport
                .publish("Ping", serde_json::to_vec(&serde_json::json!({"i": i})).unwrap())
                .await
                .unwrap();
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        // Every `Block`-strategy send records its wait, even when it never
        // actually blocks; the key existing confirms the timer fired.
        let keys: Vec<String> = transport.stats().all().into_iter().map(|(k, _)| k).collect();
        assert!(keys.contains(&"stdout_file+block_wait_ms".to_string()));
    }

    #[tokio::test]
    async fn drop_oldest_evicts_oldest_queued_item() {
        let queue = AsyncQueue::new(2, QueueOverflowStrategy::DropOldest);
        for i in 0..3u8 {
            queue
                .push(QueuedWrite {
                    header: Header::new("Ping", "svc-a", 1),
                    bytes: vec![i],
                })
                .await;
        }
        let items = queue.items.lock();
        let bytes: Vec<u8> = items.iter().map(|it| it.bytes[0]).collect();
        assert_eq!(bytes, vec![1, 2]);
    }

    #[tokio::test]
    async fn drop_newest_keeps_oldest_queued_items() {
        let queue = AsyncQueue::new(2, QueueOverflowStrategy::DropNewest);
        for i in 0..3u8 {
            queue
                .push(QueuedWrite {
                    header: Header::new("Ping", "svc-a", 1),
                    bytes: vec![i],
                })
                .await;
        }
        let items = queue.items.lock();
        let bytes: Vec<u8> = items.iter().map(|it| it.bytes[0]).collect();
        assert_eq!(bytes, vec![0, 1]);
    }

    #[tokio::test]
    async fn subscribe_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        let transport = StdoutFileTransport::new(config(&path), None).unwrap();
        let result = transport
            .subscribe("Ping", HandlerId::Named("h".into()), Filter::new())
            .await;
        assert!(matches!(result, Err(crate::error::Error::SubscribeNotSupported)));
    }

    #[tokio::test]
    async fn rotation_creates_new_file_past_size_limit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        let mut cfg = config(&path);
        cfg.rotate_size_bytes = Some(10);
        let transport = StdoutFileTransport::new(cfg, None).unwrap();
        for i in 0..5 {
            transport
                .publish("Ping", serde_json::to_vec(&serde_json::json!({"i": i})).unwrap())
                .await
                .unwrap();
        }
        let rotated = dir.path().join("out.jsonl.1");
        assert!(rotated.exists());
    }
}
