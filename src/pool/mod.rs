//! Worker pool
//!
//! Bounds the number of concurrently executing provisioning tasks, isolates
//! every task failure at the slot boundary, and guarantees that workspace
//! release and result collection run on every exit path: success, failure,
//! timeout, panic, cancellation.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::accounts::AccountRecord;
use crate::collect::ResultCollector;
use crate::stats::BatchStats;
use crate::workflow::{CredentialArtifact, ProvisionWorkflow, WorkflowError};
use crate::workspace::{Workspace, WorkspaceManager};

/// Task lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Failure detail for one terminal failed task
#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub classification: String,
    pub message: String,
}

/// Terminal outcome of one task
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub task_id: String,
    pub email: String,
    pub status: TaskStatus,
    pub artifact: Option<CredentialArtifact>,
    pub failure: Option<TaskFailure>,
    pub attempts: u32,
    pub elapsed_ms: u64,
}

/// Handle to one submitted task
pub struct TaskHandle {
    pub task_id: String,
    pub email: String,
    handle: JoinHandle<TaskReport>,
}

impl TaskHandle {
    /// Wait for the task to reach a terminal state.
    pub async fn join(self) -> TaskReport {
        match self.handle.await {
            Ok(report) => report,
            Err(e) => {
                error!("Slot task for {} died: {}", self.task_id, e);
                TaskReport {
                    task_id: self.task_id,
                    email: self.email,
                    status: TaskStatus::Failed,
                    artifact: None,
                    failure: Some(TaskFailure {
                        classification: "panic".to_string(),
                        message: e.to_string(),
                    }),
                    attempts: 0,
                    elapsed_ms: 0,
                }
            }
        }
    }
}

/// Pool sizing and per-task execution limits
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum concurrently running tasks
    pub workers: usize,
    /// Per-attempt timeout
    pub task_timeout: Duration,
    /// Additional attempts after the first failure
    pub retry_count: u32,
}

struct PoolInner {
    slots: Arc<Semaphore>,
    config: PoolConfig,
    workspaces: Arc<WorkspaceManager>,
    workflow: Arc<dyn ProvisionWorkflow>,
    collector: Arc<ResultCollector>,
    stats: Arc<BatchStats>,
    cancelled: Arc<AtomicBool>,
    // Sender lives next to the receiver so it cannot drop while slots run
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    task_seq: AtomicU64,
}

/// Fixed-size pool of worker slots.
///
/// Submissions beyond capacity queue on a fair semaphore and begin in
/// submission order as slots free up.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(
        config: PoolConfig,
        workspaces: Arc<WorkspaceManager>,
        workflow: Arc<dyn ProvisionWorkflow>,
        collector: Arc<ResultCollector>,
        stats: Arc<BatchStats>,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let slots = Arc::new(Semaphore::new(config.workers.max(1)));

        Self {
            inner: Arc::new(PoolInner {
                slots,
                config,
                workspaces,
                workflow,
                collector,
                stats,
                cancelled,
                shutdown_tx,
                shutdown_rx,
                task_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Submit one account for processing and return its task handle.
    ///
    /// Returns `None` when the batch has been cancelled: cancelled
    /// submissions never become tasks.
    pub fn submit(&self, account: AccountRecord) -> Option<TaskHandle> {
        if self.inner.cancelled.load(Ordering::Relaxed) {
            return None;
        }

        let seq = self.inner.task_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let task_id = format!("task-{}", seq);
        let email = account.email.clone();

        self.inner.stats.record_submitted();

        let inner = self.inner.clone();
        let slot_task_id = task_id.clone();
        let handle = tokio::spawn(async move { run_slot(inner, account, slot_task_id).await });

        Some(TaskHandle {
            task_id,
            email,
            handle,
        })
    }

    /// Forcibly terminate all currently running attempts. Terminated tasks
    /// are recorded failed/cancelled; release and collection still run.
    pub fn terminate_running(&self) {
        let _ = self.inner.shutdown_tx.send(true);
    }
}

/// One slot's end-to-end processing of one task.
async fn run_slot(inner: Arc<PoolInner>, account: AccountRecord, task_id: String) -> TaskReport {
    // Admission: FIFO on the fair semaphore. The permit is held for the
    // whole task, bounding running tasks to the configured worker count.
    let _permit = match inner.slots.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return unreachable_closed(&inner, &account, &task_id).await,
    };

    let started = Instant::now();
    inner.stats.record_running();

    // A cancel that landed while this task was queued: never start it.
    if inner.cancelled.load(Ordering::Relaxed) {
        info!("Task {} cancelled before start", task_id);
        return finish_failed(
            &inner,
            &account,
            &task_id,
            TaskFailure {
                classification: "cancelled".to_string(),
                message: "batch cancelled before task start".to_string(),
            },
            0,
            started,
        )
        .await;
    }

    info!("Task {} started for {}", task_id, account.email);

    let max_attempts = inner.config.retry_count + 1;
    let mut last_failure = TaskFailure {
        classification: "unknown".to_string(),
        message: "no attempt executed".to_string(),
    };
    let mut attempts = 0u32;

    for attempt in 1..=max_attempts {
        attempts = attempt;

        let workspace = match inner.workspaces.acquire(&task_id) {
            Ok(ws) => ws,
            Err(e) => {
                error!("Task {} could not allocate a workspace: {}", task_id, e);
                last_failure = TaskFailure {
                    classification: "workspace".to_string(),
                    message: e.to_string(),
                };
                break;
            }
        };

        let outcome = run_attempt(&inner, &account, &workspace).await;

        // Release pairs with acquire on every exit path, including timeout
        // and forced termination of the inner workflow task.
        inner.workspaces.release(&workspace, outcome.is_err());

        match outcome {
            Ok(artifact) => {
                info!(
                    "Task {} succeeded for {} (attempt {}/{})",
                    task_id, account.email, attempt, max_attempts
                );
                return finish_succeeded(&inner, &account, &task_id, artifact, attempt, started)
                    .await;
            }
            Err(e) => {
                warn!(
                    "Task {} attempt {}/{} failed for {}: {}",
                    task_id, attempt, max_attempts, account.email, e
                );
                let cancelled = matches!(e, WorkflowError::Cancelled);
                last_failure = TaskFailure {
                    classification: e.classification().to_string(),
                    message: e.to_string(),
                };
                if cancelled {
                    break;
                }
            }
        }
    }

    finish_failed(&inner, &account, &task_id, last_failure, attempts, started).await
}

/// Run one workflow attempt inside its own task so a panic or a forced
/// abort never takes the slot down with it.
async fn run_attempt(
    inner: &Arc<PoolInner>,
    account: &AccountRecord,
    workspace: &Workspace,
) -> Result<CredentialArtifact, WorkflowError> {
    let mut shutdown = inner.shutdown_rx.clone();
    if *shutdown.borrow() {
        return Err(WorkflowError::Cancelled);
    }

    let workflow = inner.workflow.clone();
    let account = account.clone();
    let workspace = workspace.clone();
    let handle = tokio::spawn(async move { workflow.run(&account, &workspace).await });
    let abort = handle.abort_handle();
    let timeout_secs = inner.config.task_timeout.as_secs();

    tokio::select! {
        joined = tokio::time::timeout(inner.config.task_timeout, handle) => {
            match joined {
                Ok(Ok(result)) => result,
                Ok(Err(join_err)) if join_err.is_panic() => Err(WorkflowError::UnexpectedState(
                    format!("workflow panicked: {}", join_err),
                )),
                Ok(Err(_)) => Err(WorkflowError::Cancelled),
                Err(_) => {
                    abort.abort();
                    Err(WorkflowError::Timeout(timeout_secs))
                }
            }
        }
        _ = shutdown.changed() => {
            abort.abort();
            Err(WorkflowError::Cancelled)
        }
    }
}

async fn finish_succeeded(
    inner: &Arc<PoolInner>,
    account: &AccountRecord,
    task_id: &str,
    artifact: CredentialArtifact,
    attempts: u32,
    started: Instant,
) -> TaskReport {
    inner.stats.record_succeeded();
    let report = TaskReport {
        task_id: task_id.to_string(),
        email: account.email.clone(),
        status: TaskStatus::Succeeded,
        artifact: Some(artifact),
        failure: None,
        attempts,
        elapsed_ms: started.elapsed().as_millis() as u64,
    };
    deliver(inner, &report).await;
    report
}

async fn finish_failed(
    inner: &Arc<PoolInner>,
    account: &AccountRecord,
    task_id: &str,
    failure: TaskFailure,
    attempts: u32,
    started: Instant,
) -> TaskReport {
    inner.stats.record_failed();
    let report = TaskReport {
        task_id: task_id.to_string(),
        email: account.email.clone(),
        status: TaskStatus::Failed,
        artifact: None,
        failure: Some(failure),
        attempts,
        elapsed_ms: started.elapsed().as_millis() as u64,
    };
    deliver(inner, &report).await;
    report
}

/// Hand the terminal report to the collector. Collection failures are
/// run-level (the collector halts itself); the slot just records them.
async fn deliver(inner: &Arc<PoolInner>, report: &TaskReport) {
    if let Err(e) = inner.collector.collect(report).await {
        error!("Failed to collect result for {}: {}", report.task_id, e);
    }
}

/// The pool never closes its semaphore; reaching this means a logic bug,
/// but the slot still produces a terminal failed report instead of
/// panicking.
async fn unreachable_closed(
    inner: &Arc<PoolInner>,
    account: &AccountRecord,
    task_id: &str,
) -> TaskReport {
    error!("Task {} admission failed: pool semaphore closed", task_id);
    inner.stats.record_running();
    finish_failed(
        inner,
        account,
        task_id,
        TaskFailure {
            classification: "pool".to_string(),
            message: "worker pool semaphore closed".to_string(),
        },
        0,
        Instant::now(),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicU64 as StdAtomicU64;

    use async_trait::async_trait;

    /// Scriptable workflow stub that tracks concurrency and workspace use.
    struct StubWorkflow {
        delay: Duration,
        fail_emails: HashSet<String>,
        hang_emails: HashSet<String>,
        fail_first_attempt: HashSet<String>,
        attempt_counts: Mutex<std::collections::HashMap<String, u32>>,
        active: StdAtomicU64,
        max_active: StdAtomicU64,
        active_workspaces: Mutex<HashSet<String>>,
        all_workspaces: Mutex<Vec<String>>,
        overlap_detected: AtomicBool,
    }

    impl StubWorkflow {
        fn new(delay_ms: u64) -> Self {
            Self {
                delay: Duration::from_millis(delay_ms),
                fail_emails: HashSet::new(),
                hang_emails: HashSet::new(),
                fail_first_attempt: HashSet::new(),
                attempt_counts: Mutex::new(std::collections::HashMap::new()),
                active: StdAtomicU64::new(0),
                max_active: StdAtomicU64::new(0),
                active_workspaces: Mutex::new(HashSet::new()),
                all_workspaces: Mutex::new(Vec::new()),
                overlap_detected: AtomicBool::new(false),
            }
        }

        fn failing(mut self, email: &str) -> Self {
            self.fail_emails.insert(email.to_string());
            self
        }

        fn hanging(mut self, email: &str) -> Self {
            self.hang_emails.insert(email.to_string());
            self
        }

        fn flaky(mut self, email: &str) -> Self {
            self.fail_first_attempt.insert(email.to_string());
            self
        }
    }

    /// Decrements the active counters even when the attempt is aborted.
    struct ActiveGuard<'a> {
        stub: &'a StubWorkflow,
        workspace_id: String,
    }

    impl Drop for ActiveGuard<'_> {
        fn drop(&mut self) {
            self.stub.active.fetch_sub(1, Ordering::SeqCst);
            self.stub.active_workspaces.lock().remove(&self.workspace_id);
        }
    }

    #[async_trait]
    impl ProvisionWorkflow for StubWorkflow {
        async fn run(
            &self,
            account: &AccountRecord,
            workspace: &Workspace,
        ) -> Result<CredentialArtifact, WorkflowError> {
            let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now_active, Ordering::SeqCst);

            {
                let mut active = self.active_workspaces.lock();
                if !active.insert(workspace.id.clone()) {
                    self.overlap_detected.store(true, Ordering::SeqCst);
                }
            }
            self.all_workspaces.lock().push(workspace.id.clone());
            let _guard = ActiveGuard {
                stub: self,
                workspace_id: workspace.id.clone(),
            };

            if self.hang_emails.contains(&account.email) {
                tokio::time::sleep(Duration::from_secs(600)).await;
            } else {
                tokio::time::sleep(self.delay).await;
            }

            if self.fail_emails.contains(&account.email) {
                return Err(WorkflowError::UnexpectedState("scripted failure".into()));
            }

            if self.fail_first_attempt.contains(&account.email) {
                let mut counts = self.attempt_counts.lock();
                let count = counts.entry(account.email.clone()).or_insert(0);
                *count += 1;
                if *count == 1 {
                    return Err(WorkflowError::ElementNotFound("scripted flake".into()));
                }
            }

            Ok(CredentialArtifact {
                email: account.email.clone(),
                project_id: format!("proj-{}", workspace.id),
                api_key: "AIzaStub".to_string(),
                created_at: chrono::Utc::now(),
            })
        }
    }

    fn account(email: &str) -> AccountRecord {
        AccountRecord {
            email: email.to_string(),
            password: "secret".to_string(),
            recovery_email: None,
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        pool: WorkerPool,
        workspaces: Arc<WorkspaceManager>,
        collector: Arc<ResultCollector>,
        stats: Arc<BatchStats>,
        failures_path: std::path::PathBuf,
        artifacts_path: std::path::PathBuf,
    }

    fn fixture(workflow: Arc<dyn ProvisionWorkflow>, workers: usize, timeout_ms: u64, retries: u32) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let artifacts_path = dir.path().join("credentials.jsonl");
        let failures_path = dir.path().join("failures.jsonl");
        let workspaces = Arc::new(WorkspaceManager::new(dir.path().join("work"), false));
        let collector = Arc::new(ResultCollector::new(&artifacts_path, &failures_path));
        let stats = Arc::new(BatchStats::new());

        let pool = WorkerPool::new(
            PoolConfig {
                workers,
                task_timeout: Duration::from_millis(timeout_ms),
                retry_count: retries,
            },
            workspaces.clone(),
            workflow,
            collector.clone(),
            stats.clone(),
            Arc::new(AtomicBool::new(false)),
        );

        Fixture {
            _dir: dir,
            pool,
            workspaces,
            collector,
            stats,
            failures_path,
            artifacts_path,
        }
    }

    #[tokio::test]
    async fn all_tasks_reach_terminal_state_with_one_failing() {
        let stub = Arc::new(StubWorkflow::new(30).failing("bad@example.com"));
        let fx = fixture(stub.clone(), 2, 5_000, 0);

        let emails = [
            "a@example.com",
            "b@example.com",
            "bad@example.com",
            "c@example.com",
            "d@example.com",
        ];
        let handles: Vec<_> = emails
            .iter()
            .map(|e| fx.pool.submit(account(e)).unwrap())
            .collect();

        let mut succeeded = 0;
        let mut failed = 0;
        for handle in handles {
            let report = handle.join().await;
            match report.status {
                TaskStatus::Succeeded => succeeded += 1,
                TaskStatus::Failed => {
                    failed += 1;
                    assert_eq!(report.email, "bad@example.com");
                }
                other => panic!("non-terminal status: {:?}", other),
            }
        }

        assert_eq!(succeeded, 4);
        assert_eq!(failed, 1);

        let summary = fx.stats.snapshot();
        assert_eq!(summary.total, 5);
        assert_eq!(summary.succeeded, 4);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.pending, 0);
        assert_eq!(summary.running, 0);

        // pool bound respected, no workspace sharing, no reuse
        assert!(stub.max_active.load(Ordering::SeqCst) <= 2);
        assert!(!stub.overlap_detected.load(Ordering::SeqCst));
        let all = stub.all_workspaces.lock();
        let distinct: HashSet<_> = all.iter().collect();
        assert_eq!(distinct.len(), all.len());

        // failure log has exactly one entry, for the failing account
        let failures = std::fs::read_to_string(&fx.failures_path).unwrap();
        let lines: Vec<_> = failures.lines().collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("bad@example.com"));

        let artifacts = std::fs::read_to_string(&fx.artifacts_path).unwrap();
        assert_eq!(artifacts.lines().count(), 4);

        assert_eq!(fx.collector.counts(), (4, 1));
        assert_eq!(fx.workspaces.active_count(), 0);
    }

    #[tokio::test]
    async fn timed_out_task_fails_and_pool_continues() {
        let stub = Arc::new(StubWorkflow::new(20).hanging("slow@example.com"));
        let fx = fixture(stub.clone(), 2, 250, 0);

        let handles: Vec<_> = ["slow@example.com", "a@example.com", "b@example.com"]
            .iter()
            .map(|e| fx.pool.submit(account(e)).unwrap())
            .collect();

        let mut reports = Vec::new();
        for handle in handles {
            reports.push(handle.join().await);
        }

        let slow = reports
            .iter()
            .find(|r| r.email == "slow@example.com")
            .unwrap();
        assert_eq!(slow.status, TaskStatus::Failed);
        assert_eq!(
            slow.failure.as_ref().unwrap().classification,
            "timeout"
        );

        for report in reports.iter().filter(|r| r.email != "slow@example.com") {
            assert_eq!(report.status, TaskStatus::Succeeded);
        }

        // the hung task's workspace was still released
        assert_eq!(fx.workspaces.active_count(), 0);
    }

    #[tokio::test]
    async fn retried_task_succeeds_on_fresh_workspace() {
        let stub = Arc::new(StubWorkflow::new(10).flaky("flaky@example.com"));
        let fx = fixture(stub.clone(), 1, 5_000, 1);

        let report = fx
            .pool
            .submit(account("flaky@example.com"))
            .unwrap()
            .join()
            .await;

        assert_eq!(report.status, TaskStatus::Succeeded);
        assert_eq!(report.attempts, 2);

        // both attempts used distinct workspaces
        let all = stub.all_workspaces.lock();
        assert_eq!(all.len(), 2);
        assert_ne!(all[0], all[1]);
        assert_eq!(fx.workspaces.active_count(), 0);
    }

    #[tokio::test]
    async fn forced_termination_records_cancelled_failure() {
        let stub = Arc::new(StubWorkflow::new(20).hanging("slow@example.com"));
        let fx = fixture(stub.clone(), 1, 60_000, 2);

        let handle = fx.pool.submit(account("slow@example.com")).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        fx.pool.terminate_running();

        let report = handle.join().await;
        assert_eq!(report.status, TaskStatus::Failed);
        assert_eq!(
            report.failure.as_ref().unwrap().classification,
            "cancelled"
        );
        // no retry after a forced cancel
        assert_eq!(report.attempts, 1);
        assert_eq!(fx.workspaces.active_count(), 0);
    }
}
