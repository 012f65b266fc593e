//! Dead-Letter Queue: an append-only JSONL file of failed publishes and
//! handler failures (spec.md §4.5, §6 "DLQ file format").
//!
//! Re-targeted from the teacher's Postgres-backed `DeadLetterQueue`
//! (`engine/dlq.rs`, `vqm_messages`/DLQ tables) to a single file per
//! instance: one process-wide lock guards every read and write, matching
//! spec.md §5's "DLQ: one lock per DLQ file path".

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::header::Header;

/// One DLQ record: a failed publish or handler invocation (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqRecord {
    pub timestamp: DateTime<Utc>,
    pub header: Header,
    /// Encoded payload, in `payload_format` (default `"json"`).
    pub payload: String,
    #[serde(default = "default_payload_format")]
    pub payload_format: String,
    pub error: String,
    #[serde(default)]
    pub retry_count: u32,
    pub transport: String,
    #[serde(default)]
    pub stack_trace: Option<String>,
    /// Set while a `replay_one` call has claimed this record and is
    /// awaiting its publish attempt, so a concurrent `replay_one` skips it
    /// and claims the next unclaimed record instead of re-replaying the
    /// same one. Cleared (by removal or re-enqueue) once the outcome is
    /// known; any record found set at `DeadLetterQueue::new` time is from
    /// a replay that never finished (process crash/restart) and is reset.
    #[serde(default)]
    pub in_flight: bool,
}

fn default_payload_format() -> String {
    "json".to_string()
}

/// Fields supplied when enqueuing a new DLQ record (spec.md §4.5 `enqueue`).
pub struct DlqEnqueue<'a> {
    pub header: Header,
    pub payload: String,
    pub error: &'a str,
    pub retry_count: u32,
    pub transport: &'a str,
    pub stack_trace: Option<String>,
}

/// Aggregate DLQ counts (spec.md §4.5 `statistics`).
#[derive(Debug, Clone, Serialize, Default)]
pub struct DlqStatistics {
    pub total: usize,
    pub by_class: std::collections::HashMap<String, usize>,
    pub by_error: std::collections::HashMap<String, usize>,
}

/// Outcome of replaying one record (spec.md §4.5 `replay_one`).
#[derive(Debug, Clone, Serialize)]
pub struct ReplayOutcome {
    pub success: bool,
    pub error: Option<String>,
}

/// Aggregate outcome of `replay_batch`/`replay_all`.
#[derive(Debug, Clone, Serialize, Default)]
pub struct ReplayBatchOutcome {
    pub success_count: usize,
    pub fail_count: usize,
    pub errors: Vec<String>,
}

/// A single append-only JSONL file with one process-wide lock.
pub struct DeadLetterQueue {
    path: PathBuf,
    lock: Mutex<()>,
}

impl DeadLetterQueue {
    /// Open (creating if absent) the DLQ file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        let dlq = Self {
            path,
            lock: Mutex::new(()),
        };
        dlq.clear_stale_in_flight_markers()?;
        Ok(dlq)
    }

    /// Reset `in_flight` on any record left set from a prior process's
    /// interrupted replay — nothing in this process could be holding a
    /// claim on a record at construction time.
    fn clear_stale_in_flight_markers(&self) -> Result<()> {
        let _guard = self.lock.lock();
        let mut records = self.read_all_locked()?;
        let mut changed = false;
        for record in &mut records {
            if record.in_flight {
                record.in_flight = false;
                changed = true;
            }
        }
        if changed {
            self.write_all_locked(&records)?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a new record, flushing for durability (spec.md §4.5 `enqueue`).
    pub fn enqueue(&self, record: DlqEnqueue<'_>) -> Result<DlqRecord> {
        let record = DlqRecord {
            timestamp: Utc::now(),
            header: record.header,
            payload: record.payload,
            payload_format: default_payload_format(),
            error: record.error.to_string(),
            retry_count: record.retry_count,
            transport: record.transport.to_string(),
            stack_trace: record.stack_trace,
            in_flight: false,
        };
        let line = serde_json::to_string(&record).map_err(|e| Error::DlqWrite(e.to_string()))?;

        let _guard = self.lock.lock();
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| Error::DlqWrite(e.to_string()))?;
        writeln!(file, "{line}").map_err(|e| Error::DlqWrite(e.to_string()))?;
        file.sync_data().map_err(|e| Error::DlqWrite(e.to_string()))?;

        tracing::warn!(
            message_class = %record.header.message_class,
            error = %record.error,
            "message moved to dead-letter queue"
        );
        Ok(record)
    }

    /// Read every well-formed line under the lock; malformed lines are
    /// skipped and logged (spec.md §6, "readers must tolerate occasional
    /// malformed lines").
    fn read_all(&self) -> Result<Vec<DlqRecord>> {
        let _guard = self.lock.lock();
        self.read_all_locked()
    }

    fn read_all_locked(&self) -> Result<Vec<DlqRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = std::fs::File::open(&self.path)?;
        let reader = std::io::BufReader::new(file);
        let mut records = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<DlqRecord>(&line) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(line = idx, error = %e, "skipping malformed DLQ line"),
            }
        }
        Ok(records)
    }

    fn write_all_locked(&self, records: &[DlqRecord]) -> Result<()> {
        let tmp_path = self.path.with_extension("tmp");
        {
            let mut tmp = std::fs::File::create(&tmp_path)?;
            for record in records {
                let line =
                    serde_json::to_string(record).map_err(|e| Error::DlqWrite(e.to_string()))?;
                writeln!(tmp, "{line}")?;
            }
            tmp.sync_data()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// Number of records currently in the queue.
    pub fn size(&self) -> Result<usize> {
        Ok(self.read_all()?.len())
    }

    /// The oldest record, without removing it.
    pub fn peek(&self) -> Result<Option<DlqRecord>> {
        Ok(self.read_all()?.into_iter().next())
    }

    /// Remove and return the oldest record.
    pub fn dequeue(&self) -> Result<Option<DlqRecord>> {
        let _guard = self.lock.lock();
        let mut records = self.read_all_locked()?;
        if records.is_empty() {
            return Ok(None);
        }
        let head = records.remove(0);
        self.write_all_locked(&records)?;
        Ok(Some(head))
    }

    /// Truncate the file, discarding every record.
    pub fn clear(&self) -> Result<()> {
        let _guard = self.lock.lock();
        std::fs::File::create(&self.path)?;
        Ok(())
    }

    pub fn filter_by_class(&self, class: &str) -> Result<Vec<DlqRecord>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|r| r.header.message_class == class)
            .collect())
    }

    pub fn filter_by_error_pattern(&self, pattern: &str) -> Result<Vec<DlqRecord>> {
        let re = Regex::new(pattern).map_err(|e| Error::Argument(e.to_string()))?;
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|r| re.is_match(&r.error))
            .collect())
    }

    pub fn export_range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<DlqRecord>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|r| r.timestamp >= from && r.timestamp <= to)
            .collect())
    }

    /// Non-destructive read of up to `limit` oldest records.
    pub fn inspect(&self, limit: usize) -> Result<Vec<DlqRecord>> {
        Ok(self.read_all()?.into_iter().take(limit).collect())
    }

    pub fn statistics(&self) -> Result<DlqStatistics> {
        let records = self.read_all()?;
        let mut stats = DlqStatistics {
            total: records.len(),
            ..Default::default()
        };
        for record in &records {
            *stats
                .by_class
                .entry(record.header.message_class.clone())
                .or_insert(0) += 1;
            *stats.by_error.entry(record.error.clone()).or_insert(0) += 1;
        }
        Ok(stats)
    }

    /// Replay the oldest unclaimed record through `publish_fn`. The record
    /// stays on disk (marked `in_flight`) until the outcome is known —
    /// it is removed only after `publish_fn` resolves, so a crash mid-
    /// replay leaves it durably in the file rather than losing it. The
    /// `in_flight` marker also keeps a concurrent `replay_one` call from
    /// claiming the same record: it skips past any already-claimed head
    /// and picks the next unclaimed one instead, so two callers never
    /// publish the same record twice. A panic inside `publish_fn` leaves
    /// the marker set until the next `DeadLetterQueue::new` (i.e. process
    /// restart) clears it — see `clear_stale_in_flight_markers`. On
    /// success the record is consumed; on failure it is re-appended at
    /// the tail with `retry_count` incremented, so repeated batch replays
    /// make bounded progress instead of blocking on a permanently-broken
    /// head record.
    pub async fn replay_one<F, Fut>(&self, publish_fn: F) -> Result<ReplayOutcome>
    where
        F: FnOnce(Header, String) -> Fut,
        Fut: std::future::Future<Output = std::result::Result<(), String>>,
    {
        let head = {
            let _guard = self.lock.lock();
            let mut records = self.read_all_locked()?;
            let Some(pos) = records.iter().position(|r| !r.in_flight) else {
                return Ok(ReplayOutcome {
                    success: false,
                    error: Some("DLQ has no replayable record".to_string()),
                });
            };
            records[pos].in_flight = true;
            let head = records[pos].clone();
            self.write_all_locked(&records)?;
            head
        };

        match publish_fn(head.header.clone(), head.payload.clone()).await {
            Ok(()) => {
                let _guard = self.lock.lock();
                let mut records = self.read_all_locked()?;
                remove_by_uuid(&mut records, &head.header.uuid);
                self.write_all_locked(&records)?;
                Ok(ReplayOutcome {
                    success: true,
                    error: None,
                })
            }
            Err(error) => {
                {
                    let _guard = self.lock.lock();
                    let mut records = self.read_all_locked()?;
                    remove_by_uuid(&mut records, &head.header.uuid);
                    self.write_all_locked(&records)?;
                }
                self.enqueue(DlqEnqueue {
                    header: head.header,
                    payload: head.payload,
                    error: &error,
                    retry_count: head.retry_count + 1,
                    transport: &head.transport,
                    stack_trace: head.stack_trace,
                })?;
                Ok(ReplayOutcome {
                    success: false,
                    error: Some(error),
                })
            }
        }
    }

    /// Replay up to `n` records (spec.md §4.5 `replay_batch`).
    pub async fn replay_batch<F, Fut>(&self, n: usize, mut publish_fn: F) -> Result<ReplayBatchOutcome>
    where
        F: FnMut(Header, String) -> Fut,
        Fut: std::future::Future<Output = std::result::Result<(), String>>,
    {
        let mut outcome = ReplayBatchOutcome::default();
        for _ in 0..n {
            if self.size()? == 0 {
                break;
            }
            let result = self
                .replay_one(|h, p| publish_fn(h, p))
                .await?;
            if result.success {
                outcome.success_count += 1;
            } else {
                outcome.fail_count += 1;
                if let Some(e) = result.error {
                    outcome.errors.push(e);
                }
                // A failed replay re-appends at the tail; without a bound
                // we'd spin on the same now-rotated-to-head record forever.
                break;
            }
        }
        Ok(outcome)
    }

    /// Replay every record present at call time (spec.md §4.5
    /// `replay_all`).
    pub async fn replay_all<F, Fut>(&self, publish_fn: F) -> Result<ReplayBatchOutcome>
    where
        F: FnMut(Header, String) -> Fut,
        Fut: std::future::Future<Output = std::result::Result<(), String>>,
    {
        let n = self.size()?;
        self.replay_batch(n, publish_fn).await
    }
}

/// Remove the first record matching `uuid`, wherever it currently sits.
/// `replay_one` claims its record, then (after awaiting `publish_fn`, with
/// the lock released) needs to remove that exact record — by then an
/// unrelated `dequeue`/`clear` call may have changed what sits at position
/// 0, so matching by identity avoids dropping or mis-retrying an unrelated
/// record.
fn remove_by_uuid(records: &mut Vec<DlqRecord>, uuid: &str) {
    if let Some(pos) = records.iter().position(|r| r.header.uuid == uuid) {
        records.remove(pos);
    }
}

/// Parse a raw payload string into JSON for inspection helpers. Not used on
/// the hot enqueue/replay path, where the payload stays an opaque string.
pub fn payload_as_json(record: &DlqRecord) -> Result<Value> {
    serde_json::from_str(&record.payload).map_err(Error::Json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn header() -> Header {
        Header::new("Ping", "svc-a", 1)
    }

    #[test]
    fn enqueue_then_size_and_peek() {
        let dir = tempdir().unwrap();
        let dlq = DeadLetterQueue::new(dir.path().join("dlq.jsonl")).unwrap();
        dlq.enqueue(DlqEnqueue {
            header: header(),
            payload: "{}".to_string(),
            error: "boom",
            retry_count: 0,
            transport: "memory",
            stack_trace: None,
        })
        .unwrap();
        assert_eq!(dlq.size().unwrap(), 1);
        let peeked = dlq.peek().unwrap().unwrap();
        assert_eq!(peeked.error, "boom");
        assert_eq!(dlq.size().unwrap(), 1);
    }

    #[test]
    fn dequeue_removes_head_in_fifo_order() {
        let dir = tempdir().unwrap();
        let dlq = DeadLetterQueue::new(dir.path().join("dlq.jsonl")).unwrap();
        for i in 0..3 {
            dlq.enqueue(DlqEnqueue {
                header: header(),
                payload: format!("{{\"i\":{i}}}"),
                error: "boom",
                retry_count: 0,
                transport: "memory",
                stack_trace: None,
            })
            .unwrap();
        }
        let first = dlq.dequeue().unwrap().unwrap();
        assert_eq!(first.payload, "{\"i\":0}");
        assert_eq!(dlq.size().unwrap(), 2);
    }

    #[test]
    fn clear_truncates() {
        let dir = tempdir().unwrap();
        let dlq = DeadLetterQueue::new(dir.path().join("dlq.jsonl")).unwrap();
        dlq.enqueue(DlqEnqueue {
            header: header(),
            payload: "{}".to_string(),
            error: "boom",
            retry_count: 0,
            transport: "memory",
            stack_trace: None,
        })
        .unwrap();
        dlq.clear().unwrap();
        assert_eq!(dlq.size().unwrap(), 0);
    }

    #[test]
    fn filters_and_statistics() {
        let dir = tempdir().unwrap();
        let dlq = DeadLetterQueue::new(dir.path().join("dlq.jsonl")).unwrap();
        let mut h2 = header();
        h2.message_class = "Pong".to_string();
        dlq.enqueue(DlqEnqueue {
            header: header(),
            payload: "{}".to_string(),
            error: "timeout",
            retry_count: 0,
            transport: "memory",
            stack_trace: None,
        })
        .unwrap();
        dlq.enqueue(DlqEnqueue {
            header: h2,
            payload: "{}".to_string(),
            error: "conn refused",
            retry_count: 0,
            transport: "memory",
            stack_trace: None,
        })
        .unwrap();

        assert_eq!(dlq.filter_by_class("Ping").unwrap().len(), 1);
        assert_eq!(dlq.filter_by_error_pattern("conn.*").unwrap().len(), 1);
        let stats = dlq.statistics().unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_class.get("Pong"), Some(&1));
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dlq.jsonl");
        let dlq = DeadLetterQueue::new(&path).unwrap();
        dlq.enqueue(DlqEnqueue {
            header: header(),
            payload: "{}".to_string(),
            error: "boom",
            retry_count: 0,
            transport: "memory",
            stack_trace: None,
        })
        .unwrap();
        {
            let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            writeln!(f, "not json at all").unwrap();
        }
        assert_eq!(dlq.size().unwrap(), 1);
    }

    #[tokio::test]
    async fn replay_one_success_consumes_record() {
        let dir = tempdir().unwrap();
        let dlq = DeadLetterQueue::new(dir.path().join("dlq.jsonl")).unwrap();
        dlq.enqueue(DlqEnqueue {
            header: header(),
            payload: "{}".to_string(),
            error: "boom",
            retry_count: 0,
            transport: "memory",
            stack_trace: None,
        })
        .unwrap();
        let outcome = dlq.replay_one(|_, _| async { Ok(()) }).await.unwrap();
        assert!(outcome.success);
        assert_eq!(dlq.size().unwrap(), 0);
    }

    #[tokio::test]
    async fn replay_one_failure_requeues_at_tail_with_incremented_retry() {
        let dir = tempdir().unwrap();
        let dlq = DeadLetterQueue::new(dir.path().join("dlq.jsonl")).unwrap();
        dlq.enqueue(DlqEnqueue {
            header: header(),
            payload: "{}".to_string(),
            error: "boom",
            retry_count: 0,
            transport: "memory",
            stack_trace: None,
        })
        .unwrap();
        let outcome = dlq
            .replay_one(|_, _| async { Err("still broken".to_string()) })
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(dlq.size().unwrap(), 1);
        let record = dlq.peek().unwrap().unwrap();
        assert_eq!(record.retry_count, 1);
        assert_eq!(record.error, "still broken");
    }

    #[tokio::test]
    async fn replay_one_leaves_record_on_disk_until_outcome_known() {
        let dir = tempdir().unwrap();
        let dlq = std::sync::Arc::new(DeadLetterQueue::new(dir.path().join("dlq.jsonl")).unwrap());
        dlq.enqueue(DlqEnqueue {
            header: header(),
            payload: "{}".to_string(),
            error: "boom",
            retry_count: 0,
            transport: "memory",
            stack_trace: None,
        })
        .unwrap();

        let (resume_tx, resume_rx) = tokio::sync::oneshot::channel::<()>();
        let dlq_task = dlq.clone();
        let handle = tokio::spawn(async move {
            dlq_task
                .replay_one(|_, _| async move {
                    resume_rx.await.ok();
                    Ok(())
                })
                .await
        });

        // Give the spawned replay a chance to read the head and start
        // awaiting publish_fn before we check disk state.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            dlq.size().unwrap(),
            1,
            "record must remain on disk while replay is in flight"
        );

        resume_tx.send(()).unwrap();
        let outcome = handle.await.unwrap().unwrap();
        assert!(outcome.success);
        assert_eq!(dlq.size().unwrap(), 0);
    }

    #[tokio::test]
    async fn replay_one_does_not_misremove_an_unrelated_record_if_head_shifts_meanwhile() {
        let dir = tempdir().unwrap();
        let dlq = std::sync::Arc::new(DeadLetterQueue::new(dir.path().join("dlq.jsonl")).unwrap());
        dlq.enqueue(DlqEnqueue {
            header: header(),
            payload: "{\"i\":0}".to_string(),
            error: "boom",
            retry_count: 0,
            transport: "memory",
            stack_trace: None,
        })
        .unwrap();
        dlq.enqueue(DlqEnqueue {
            header: header(),
            payload: "{\"i\":1}".to_string(),
            error: "boom",
            retry_count: 0,
            transport: "memory",
            stack_trace: None,
        })
        .unwrap();
        let second_uuid = dlq.inspect(10).unwrap()[1].header.uuid.clone();

        let (resume_tx, resume_rx) = tokio::sync::oneshot::channel::<()>();
        let dlq_task = dlq.clone();
        let handle = tokio::spawn(async move {
            // Replays the current head (i=0).
            dlq_task
                .replay_one(|_, _| async move {
                    resume_rx.await.ok();
                    Ok(())
                })
                .await
        });

        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        // While the first replay's publish is in flight, an unrelated
        // dequeue removes i=0 directly, so i=1 becomes the on-disk head —
        // the position replay_one would wrongly target if it removed by
        // index instead of by uuid once publish_fn resolves.
        let dequeued = dlq.dequeue().unwrap().unwrap();
        assert_eq!(dequeued.payload, "{\"i\":0}");

        resume_tx.send(()).unwrap();
        let outcome = handle.await.unwrap().unwrap();
        assert!(outcome.success);

        let remaining = dlq.inspect(10).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].payload, "{\"i\":1}");
        assert_eq!(remaining[0].header.uuid, second_uuid);
    }

    #[tokio::test]
    async fn concurrent_replay_one_calls_never_claim_the_same_record() {
        let dir = tempdir().unwrap();
        let dlq = std::sync::Arc::new(DeadLetterQueue::new(dir.path().join("dlq.jsonl")).unwrap());
        for i in 0..2u8 {
            dlq.enqueue(DlqEnqueue {
                header: header(),
                payload: format!("{{\"i\":{i}}}"),
                error: "boom",
                retry_count: 0,
                transport: "memory",
                stack_trace: None,
            })
            .unwrap();
        }

        let seen = std::sync::Arc::new(Mutex::new(Vec::<String>::new()));
        let mut handles = Vec::new();
        for _ in 0..2 {
            let dlq = dlq.clone();
            let seen = seen.clone();
            handles.push(tokio::spawn(async move {
                dlq.replay_one(|_, payload| {
                    let seen = seen.clone();
                    async move {
                        seen.lock().push(payload);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(())
                    }
                })
                .await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().unwrap().success);
        }

        let mut seen = seen.lock().clone();
        seen.sort();
        assert_eq!(seen, vec!["{\"i\":0}".to_string(), "{\"i\":1}".to_string()]);
        assert_eq!(dlq.size().unwrap(), 0);
    }

    #[tokio::test]
    async fn replay_all_empty_queue_is_noop() {
        let dir = tempdir().unwrap();
        let dlq = DeadLetterQueue::new(dir.path().join("dlq.jsonl")).unwrap();
        let outcome = dlq.replay_all(|_, _| async { Ok(()) }).await.unwrap();
        assert_eq!(outcome.success_count, 0);
        assert_eq!(outcome.fail_count, 0);
    }
}
