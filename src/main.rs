//! gcp-provisioner - batch entry point
//!
//! Usage: `gcp-provisioner [accounts.csv]`
//!
//! Environment variables:
//! - `GCP_PROVISIONER_ACCOUNTS` - Account CSV path (overridden by the CLI arg)
//! - `GCP_PROVISIONER_WORKERS` - Worker slot count override

use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info, warn};

use gcp_provisioner::batch::{BatchController, RunError};
use gcp_provisioner::workflow::BrowserWorkflow;
use gcp_provisioner::AppConfig;

#[tokio::main]
async fn main() -> ExitCode {
    let _guard = gcp_provisioner::init_logging();

    info!("Starting gcp-provisioner");
    if let Some(dir) = gcp_provisioner::log_dir() {
        info!("Log files saved to: {}", dir.display());
    }

    let mut config = AppConfig::load();

    // Accounts file: CLI arg wins over env var over config
    if let Some(path) = std::env::args().nth(1) {
        config.accounts_file = path.into();
    } else if let Ok(path) = std::env::var("GCP_PROVISIONER_ACCOUNTS") {
        if !path.is_empty() {
            config.accounts_file = path.into();
        }
    }

    if let Some(workers) = std::env::var("GCP_PROVISIONER_WORKERS")
        .ok()
        .and_then(|w| w.parse().ok())
    {
        config.workers = workers;
    }

    // No display means headless is the only option
    let has_display = cfg!(target_os = "windows")
        || cfg!(target_os = "macos")
        || std::env::var("DISPLAY").map(|d| !d.is_empty()).unwrap_or(false);
    if !has_display && !config.headless {
        info!("No DISPLAY available - forcing headless mode");
        config.headless = true;
    }

    let workflow = Arc::new(BrowserWorkflow::new(config.browser_config()));
    let controller = BatchController::new(config, workflow);

    // Ctrl-C stops admission; running tasks drain (or abort, per config)
    let cancel = controller.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received - cancelling batch");
            cancel.cancel();
        }
    });

    match controller.run().await {
        Ok(summary) => {
            info!(
                "Run summary: {} succeeded, {} failed of {} in {}s",
                summary.succeeded, summary.failed, summary.total, summary.elapsed_secs
            );
            // Partial failure is not a process-level error
            ExitCode::SUCCESS
        }
        Err(e @ RunError::Load(_)) => {
            error!("Account queue failed to load: {}", e);
            ExitCode::from(1)
        }
        Err(e @ RunError::CollectionHalted) => {
            error!("{}", e);
            ExitCode::from(2)
        }
    }
}
