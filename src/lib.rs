//! gcp-provisioner
//!
//! Batch provisioning of Google Cloud projects across many accounts with
//! multi-profile browser automation: a fixed-size worker pool drives one
//! isolated browser instance per account, streams credential artifacts into
//! a durable store as they appear, and reports a final run summary.

pub mod accounts;
pub mod batch;
pub mod cleanup;
pub mod collect;
pub mod pool;
pub mod stats;
pub mod workflow;
pub mod workspace;

use std::path::PathBuf;

use tracing::{error, info, warn};

use workflow::BrowserWorkflowConfig;

/// Application configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    /// Number of concurrent worker slots
    pub workers: usize,
    /// Per-task attempt timeout in seconds
    pub task_timeout_secs: u64,
    /// Additional attempts after a first failure
    pub retry_count: u32,
    /// Keep the profile directory of failed tasks for inspection
    pub keep_failed_workspaces: bool,
    /// Abort running tasks on cancellation instead of draining them
    pub force_terminate_on_cancel: bool,

    /// Browser configuration
    pub headless: bool,
    pub chrome_path: Option<String>,

    /// Input and output locations
    pub accounts_file: PathBuf,
    pub artifacts_file: PathBuf,
    pub failures_file: PathBuf,
    /// Root for per-task profile directories (system temp dir when unset)
    pub workspace_root: Option<PathBuf>,

    /// API to enable on every created project
    pub target_api: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            task_timeout_secs: 480,
            retry_count: 1,
            keep_failed_workspaces: false,
            force_terminate_on_cancel: false,
            headless: true,
            chrome_path: None,
            accounts_file: PathBuf::from("accounts.csv"),
            artifacts_file: PathBuf::from("output/credentials.jsonl"),
            failures_file: PathBuf::from("output/failures.jsonl"),
            workspace_root: None,
            target_api: "generativelanguage.googleapis.com".to_string(),
        }
    }
}

/// Get log directory path (shared across modules)
pub fn log_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("gcp-provisioner").join("logs"))
}

impl AppConfig {
    /// Get config file path
    fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("gcp-provisioner").join("config.json"))
    }

    /// Load config from file, falling back to defaults
    pub fn load() -> Self {
        if let Some(path) = Self::config_path() {
            if path.exists() {
                match std::fs::read_to_string(&path) {
                    Ok(content) => match serde_json::from_str(&content) {
                        Ok(config) => {
                            info!("Loaded config from {:?}", path);
                            return config;
                        }
                        Err(e) => {
                            warn!("Failed to parse config file: {}", e);
                        }
                    },
                    Err(e) => {
                        warn!("Failed to read config file: {}", e);
                    }
                }
            }
        }
        Self::default()
    }

    /// Save config to file
    pub fn save(&self) {
        if let Some(path) = Self::config_path() {
            if let Some(parent) = path.parent() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    error!("Failed to create config directory: {}", e);
                    return;
                }
            }

            match serde_json::to_string_pretty(self) {
                Ok(content) => {
                    if let Err(e) = std::fs::write(&path, content) {
                        error!("Failed to save config: {}", e);
                    } else {
                        info!("Config saved to {:?}", path);
                    }
                }
                Err(e) => {
                    error!("Failed to serialize config: {}", e);
                }
            }
        }
    }

    /// Browser settings for the per-task workflow instances
    pub fn browser_config(&self) -> BrowserWorkflowConfig {
        BrowserWorkflowConfig {
            chrome_path: self.chrome_path.clone(),
            headless: self.headless,
            target_api: self.target_api.clone(),
            ..BrowserWorkflowConfig::default()
        }
    }
}

/// Initialize logging: console plus a daily-rolling file
pub fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false);

    if let Some(log_dir) = log_dir() {
        let _ = std::fs::create_dir_all(&log_dir);
        let file_appender = tracing_appender::rolling::daily(&log_dir, "gcp-provisioner.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_writer(non_blocking);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();

        None
    }
}
