//! Result collection
//!
//! Persists every task outcome the moment it is produced: one JSON line per
//! succeeded task in the artifact store, one per failed task in the failure
//! log. Appends are serialized and fsynced so the stores stay readable even
//! if the process dies between two collects.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::pool::{TaskReport, TaskStatus};

const WRITE_ATTEMPTS: u32 = 3;
const WRITE_RETRY_DELAY_MS: u64 = 200;

/// Collection errors. Unlike workflow failures these are run-level: losing
/// the ability to persist results halts further collection.
#[derive(Debug, Error)]
pub enum CollectError {
    #[error("failed to append to {path} after {attempts} attempts: {source}")]
    StoreWrite {
        path: String,
        attempts: u32,
        source: std::io::Error,
    },

    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("collection halted after a previous store failure")]
    Halted,
}

/// One failure log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    pub email: String,
    pub classification: String,
    pub message: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

/// Streams task outcomes into the durable stores as they complete
pub struct ResultCollector {
    artifacts_path: PathBuf,
    failures_path: PathBuf,
    /// Serializes every append across worker slots
    write_lock: tokio::sync::Mutex<()>,
    /// Task ids already collected (at-most-once enforcement)
    collected: Mutex<HashSet<String>>,
    succeeded: AtomicU64,
    failed: AtomicU64,
    halted: AtomicBool,
}

impl ResultCollector {
    pub fn new(artifacts_path: impl Into<PathBuf>, failures_path: impl Into<PathBuf>) -> Self {
        Self {
            artifacts_path: artifacts_path.into(),
            failures_path: failures_path.into(),
            write_lock: tokio::sync::Mutex::new(()),
            collected: Mutex::new(HashSet::new()),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            halted: AtomicBool::new(false),
        }
    }

    /// Succeeded / failed counts collected so far
    pub fn counts(&self) -> (u64, u64) {
        (
            self.succeeded.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
        )
    }

    /// Whether collection has been halted by a store failure
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Relaxed)
    }

    /// Persist one terminal task outcome.
    ///
    /// Safe to call concurrently from every worker slot; at most one record
    /// is ever written per task id.
    pub async fn collect(&self, report: &TaskReport) -> Result<(), CollectError> {
        if self.halted.load(Ordering::Relaxed) {
            return Err(CollectError::Halted);
        }

        {
            let mut collected = self.collected.lock();
            if !collected.insert(report.task_id.clone()) {
                warn!("Task {} already collected, ignoring", report.task_id);
                return Ok(());
            }
        }

        match report.status {
            TaskStatus::Succeeded => {
                let artifact = report.artifact.as_ref().ok_or_else(|| {
                    CollectError::Encode(serde::ser::Error::custom(
                        "succeeded task without artifact",
                    ))
                })?;
                let line = serde_json::to_string(artifact)?;
                self.append_line(&self.artifacts_path, &line).await?;
                self.succeeded.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Collected artifact for {} (task {})",
                    report.email, report.task_id
                );
            }
            TaskStatus::Failed => {
                let failure = report.failure.as_ref();
                let record = FailureRecord {
                    email: report.email.clone(),
                    classification: failure
                        .map(|f| f.classification.clone())
                        .unwrap_or_else(|| "unknown".to_string()),
                    message: failure
                        .map(|f| f.message.clone())
                        .unwrap_or_default(),
                    attempts: report.attempts,
                    failed_at: Utc::now(),
                };
                let line = serde_json::to_string(&record)?;
                self.append_line(&self.failures_path, &line).await?;
                self.failed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Recorded failure for {} (task {}): {}",
                    report.email, report.task_id, record.classification
                );
            }
            TaskStatus::Pending | TaskStatus::Running => {
                warn!(
                    "Task {} collected in non-terminal state {:?}, ignoring",
                    report.task_id, report.status
                );
                // un-claim so a later terminal collect still lands
                self.collected.lock().remove(&report.task_id);
            }
        }

        Ok(())
    }

    /// Append one full line under the write lock, with bounded retries.
    /// The line plus newline goes out in a single write followed by fsync,
    /// so a reader (or a crash) never observes a partial record.
    async fn append_line(&self, path: &Path, line: &str) -> Result<(), CollectError> {
        let _guard = self.write_lock.lock().await;

        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');

        let mut last_err = None;
        for attempt in 1..=WRITE_ATTEMPTS {
            match Self::write_once(path, &buf) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        "Append to {} failed (attempt {}/{}): {}",
                        path.display(),
                        attempt,
                        WRITE_ATTEMPTS,
                        e
                    );
                    last_err = Some(e);
                    if attempt < WRITE_ATTEMPTS {
                        tokio::time::sleep(Duration::from_millis(
                            WRITE_RETRY_DELAY_MS * attempt as u64,
                        ))
                        .await;
                    }
                }
            }
        }

        self.halted.store(true, Ordering::Relaxed);
        error!(
            "Halting collection: durable store {} is not writable",
            path.display()
        );

        Err(CollectError::StoreWrite {
            path: path.display().to_string(),
            attempts: WRITE_ATTEMPTS,
            source: last_err.unwrap_or_else(|| std::io::Error::other("unknown write failure")),
        })
    }

    fn write_once(path: &Path, buf: &[u8]) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        file.write_all(buf)?;
        file.flush()?;
        file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::TaskFailure;
    use crate::workflow::CredentialArtifact;

    fn succeeded_report(task_id: &str, email: &str) -> TaskReport {
        TaskReport {
            task_id: task_id.to_string(),
            email: email.to_string(),
            status: TaskStatus::Succeeded,
            artifact: Some(CredentialArtifact {
                email: email.to_string(),
                project_id: "autoproj-abc123".to_string(),
                api_key: "AIzaTest".to_string(),
                created_at: Utc::now(),
            }),
            failure: None,
            attempts: 1,
            elapsed_ms: 1000,
        }
    }

    fn failed_report(task_id: &str, email: &str, classification: &str) -> TaskReport {
        TaskReport {
            task_id: task_id.to_string(),
            email: email.to_string(),
            status: TaskStatus::Failed,
            artifact: None,
            failure: Some(TaskFailure {
                classification: classification.to_string(),
                message: "boom".to_string(),
            }),
            attempts: 2,
            elapsed_ms: 1000,
        }
    }

    fn collector() -> (tempfile::TempDir, ResultCollector) {
        let dir = tempfile::tempdir().unwrap();
        let collector = ResultCollector::new(
            dir.path().join("credentials.jsonl"),
            dir.path().join("failures.jsonl"),
        );
        (dir, collector)
    }

    #[tokio::test]
    async fn store_is_readable_after_every_collect() {
        let (dir, collector) = collector();
        let artifacts = dir.path().join("credentials.jsonl");

        collector
            .collect(&succeeded_report("task-1", "a@example.com"))
            .await
            .unwrap();

        // fully parseable immediately, not only at batch end
        let content = std::fs::read_to_string(&artifacts).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 1);
        let parsed: CredentialArtifact = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.email, "a@example.com");

        collector
            .collect(&succeeded_report("task-2", "b@example.com"))
            .await
            .unwrap();

        let content = std::fs::read_to_string(&artifacts).unwrap();
        assert_eq!(content.lines().count(), 2);
        for line in content.lines() {
            serde_json::from_str::<CredentialArtifact>(line).unwrap();
        }
        assert_eq!(collector.counts(), (2, 0));
    }

    #[tokio::test]
    async fn failures_go_to_the_failure_log() {
        let (dir, collector) = collector();

        collector
            .collect(&failed_report("task-1", "bad@example.com", "timeout"))
            .await
            .unwrap();

        let content = std::fs::read_to_string(dir.path().join("failures.jsonl")).unwrap();
        let record: FailureRecord = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(record.email, "bad@example.com");
        assert_eq!(record.classification, "timeout");
        assert_eq!(record.attempts, 2);
        assert!(!dir.path().join("credentials.jsonl").exists());
        assert_eq!(collector.counts(), (0, 1));
    }

    #[tokio::test]
    async fn duplicate_collect_writes_one_record() {
        let (dir, collector) = collector();
        let report = succeeded_report("task-1", "a@example.com");

        collector.collect(&report).await.unwrap();
        collector.collect(&report).await.unwrap();

        let content = std::fs::read_to_string(dir.path().join("credentials.jsonl")).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert_eq!(collector.counts(), (1, 0));
    }

    #[tokio::test]
    async fn concurrent_collects_never_interleave() {
        let (dir, collector) = collector();
        let collector = std::sync::Arc::new(collector);

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let collector = collector.clone();
                tokio::spawn(async move {
                    collector
                        .collect(&succeeded_report(
                            &format!("task-{}", i),
                            &format!("user{}@example.com", i),
                        ))
                        .await
                        .unwrap();
                })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }

        let content = std::fs::read_to_string(dir.path().join("credentials.jsonl")).unwrap();
        assert_eq!(content.lines().count(), 16);
        for line in content.lines() {
            serde_json::from_str::<CredentialArtifact>(line).unwrap();
        }
        assert_eq!(collector.counts(), (16, 0));
    }

    #[tokio::test]
    async fn write_failure_halts_further_collection() {
        let dir = tempfile::tempdir().unwrap();
        // a directory where the artifact file should be forces every append
        // to fail
        let blocked = dir.path().join("credentials.jsonl");
        std::fs::create_dir_all(&blocked).unwrap();
        let collector = ResultCollector::new(&blocked, dir.path().join("failures.jsonl"));

        let err = collector
            .collect(&succeeded_report("task-1", "a@example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, CollectError::StoreWrite { .. }));
        assert!(collector.is_halted());

        let err = collector
            .collect(&succeeded_report("task-2", "b@example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, CollectError::Halted));
    }
}
