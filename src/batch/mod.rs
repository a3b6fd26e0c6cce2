//! Batch controller
//!
//! Drives one run end-to-end: load the account queue, push every record
//! through the worker pool, wait for every task to reach a terminal state,
//! then report the summary. Exposes a cancellation hook that stops
//! admission (and optionally terminates running tasks) without ever
//! dropping an already-collected artifact.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use crate::accounts::{self, LoadError};
use crate::cleanup;
use crate::collect::ResultCollector;
use crate::pool::{PoolConfig, WorkerPool};
use crate::stats::{BatchStats, RunSummary};
use crate::workflow::ProvisionWorkflow;
use crate::workspace::WorkspaceManager;
use crate::AppConfig;

/// Run-level errors. Individual task failures are not run-level; they show
/// up in the summary and the failure log instead.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("result collection halted: the durable store stopped accepting writes")]
    CollectionHalted,
}

/// Cancellation hook handed out before the run starts.
#[derive(Clone)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
    pool: Arc<WorkerPool>,
    force_terminate: bool,
}

impl CancelHandle {
    /// Stop admitting new tasks. With `force_terminate_on_cancel` set,
    /// running tasks are aborted as well; otherwise they drain naturally.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::Relaxed) {
            return;
        }
        warn!("Batch cancellation requested");
        if self.force_terminate {
            self.pool.terminate_running();
        }
    }
}

/// Orchestrates one provisioning run
pub struct BatchController {
    config: AppConfig,
    workspaces: Arc<WorkspaceManager>,
    collector: Arc<ResultCollector>,
    stats: Arc<BatchStats>,
    pool: Arc<WorkerPool>,
    cancelled: Arc<AtomicBool>,
}

impl BatchController {
    pub fn new(config: AppConfig, workflow: Arc<dyn ProvisionWorkflow>) -> Self {
        let workspace_root = config
            .workspace_root
            .clone()
            .unwrap_or_else(WorkspaceManager::default_root);
        let workspaces = Arc::new(WorkspaceManager::new(
            workspace_root,
            config.keep_failed_workspaces,
        ));
        let collector = Arc::new(ResultCollector::new(
            &config.artifacts_file,
            &config.failures_file,
        ));
        let stats = Arc::new(BatchStats::new());
        let cancelled = Arc::new(AtomicBool::new(false));

        let pool = Arc::new(WorkerPool::new(
            PoolConfig {
                workers: config.workers,
                task_timeout: Duration::from_secs(config.task_timeout_secs),
                retry_count: config.retry_count,
            },
            workspaces.clone(),
            workflow,
            collector.clone(),
            stats.clone(),
            cancelled.clone(),
        ));

        Self {
            config,
            workspaces,
            collector,
            stats,
            pool,
            cancelled,
        }
    }

    /// Cancellation hook for signal handlers and shutdown paths
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            cancelled: self.cancelled.clone(),
            pool: self.pool.clone(),
            force_terminate: self.config.force_terminate_on_cancel,
        }
    }

    /// Run the whole batch and return the final summary.
    pub async fn run(&self) -> Result<RunSummary, RunError> {
        let accounts = accounts::load_accounts(&self.config.accounts_file)?;
        let total = accounts.len();

        info!(
            "Starting batch: {} accounts, {} workers, timeout {}s, retries {}",
            total, self.config.workers, self.config.task_timeout_secs, self.config.retry_count
        );

        let mut handles = Vec::with_capacity(total);
        let mut skipped = 0usize;

        for account in accounts {
            match self.pool.submit(account) {
                Some(handle) => handles.push(handle),
                None => skipped += 1,
            }
        }

        if skipped > 0 {
            warn!("{} accounts skipped by cancellation, never admitted", skipped);
        }

        for handle in handles {
            let report = handle.join().await;
            info!(
                "Task {} terminal: {:?} for {} ({} attempts, {} ms)",
                report.task_id, report.status, report.email, report.attempts, report.elapsed_ms
            );
        }

        let killed = cleanup::kill_orphan_browsers(&self.workspaces);
        if killed > 0 {
            info!("Cleaned up {} orphaned browser processes", killed);
        }

        if self.collector.is_halted() {
            return Err(RunError::CollectionHalted);
        }

        let summary = self.stats.snapshot();
        info!(
            "Batch complete: {} succeeded, {} failed of {} in {}s",
            summary.succeeded, summary.failed, summary.total, summary.elapsed_secs
        );

        Ok(summary)
    }
}
