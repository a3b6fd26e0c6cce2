//! Per-task browser lifecycle
//!
//! Launches one Chromium instance per task, isolated by the task's
//! workspace directory, drives the provisioning flow on it, and tears the
//! process down on every exit path.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use tracing::{debug, info, warn};

use super::{flow, CredentialArtifact, ProvisionWorkflow, WorkflowError};
use crate::accounts::AccountRecord;
use crate::workspace::Workspace;

/// Find Chrome/Chromium executable on the system
fn find_chrome() -> Option<PathBuf> {
    let candidates: Vec<PathBuf> = if cfg!(target_os = "windows") {
        let mut paths = vec![
            PathBuf::from(r"C:\Program Files\Google\Chrome\Application\chrome.exe"),
            PathBuf::from(r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe"),
        ];
        if let Ok(local) = std::env::var("LOCALAPPDATA") {
            paths.push(PathBuf::from(format!(
                r"{}\Google\Chrome\Application\chrome.exe",
                local
            )));
        }
        paths
    } else if cfg!(target_os = "macos") {
        vec![PathBuf::from(
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        )]
    } else {
        vec![
            PathBuf::from("/usr/bin/chromium"),
            PathBuf::from("/usr/bin/chromium-browser"),
            PathBuf::from("/usr/bin/google-chrome"),
            PathBuf::from("/usr/bin/google-chrome-stable"),
        ]
    };

    candidates.into_iter().find(|p| p.exists())
}

/// Configuration for per-task browser instances
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserWorkflowConfig {
    /// Path to Chrome/Chromium executable (auto-detected when unset)
    pub chrome_path: Option<String>,
    /// Run in headless mode
    pub headless: bool,
    /// Window width
    pub window_width: u32,
    /// Window height
    pub window_height: u32,
    /// Per-step element wait in seconds
    pub step_timeout_secs: u64,
    /// API to enable on each created project
    pub target_api: String,
}

impl Default for BrowserWorkflowConfig {
    fn default() -> Self {
        Self {
            chrome_path: None,
            headless: true,
            window_width: 1920,
            window_height: 1080,
            step_timeout_secs: 30,
            target_api: "generativelanguage.googleapis.com".to_string(),
        }
    }
}

/// Browser-driven implementation of the provisioning workflow
pub struct BrowserWorkflow {
    config: BrowserWorkflowConfig,
}

impl BrowserWorkflow {
    pub fn new(config: BrowserWorkflowConfig) -> Self {
        Self { config }
    }

    /// Launch a Chromium instance whose profile lives in `workspace`.
    async fn launch(&self, workspace: &Workspace) -> Result<(Browser, Page), WorkflowError> {
        if self.config.chrome_path.is_none() && find_chrome().is_none() {
            return Err(WorkflowError::Browser(
                "Chrome/Chromium not found on this system".to_string(),
            ));
        }

        let mut builder = BrowserConfig::builder();

        if self.config.headless {
            builder = builder.new_headless_mode();
        } else {
            builder = builder.with_head();
        }

        if let Some(ref path) = self.config.chrome_path {
            builder = builder.chrome_executable(path);
        } else if let Some(chrome_path) = find_chrome() {
            debug!("Auto-detected Chrome at: {}", chrome_path.display());
            builder = builder.chrome_executable(chrome_path);
        }

        builder = builder
            .user_data_dir(&workspace.path)
            .window_size(self.config.window_width, self.config.window_height)
            .args(vec![
                // Anti-automation tells
                "--disable-blink-features=AutomationControlled",
                "--disable-infobars",
                "--no-default-browser-check",
                // No restore-tabs prompt after a killed instance
                "--disable-session-crashed-bubble",
                "--disable-restore-session-state",
                // UI suppression
                "--disable-notifications",
                "--disable-save-password-bubble",
                "--disable-translate",
                // Required when running as root (Docker / VPS)
                "--no-sandbox",
                "--disable-dev-shm-usage",
            ]);

        let browser_config = builder
            .build()
            .map_err(WorkflowError::Browser)?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| WorkflowError::Browser(format!("launch failed: {}", e)))?;

        // Drive CDP events in the background; the loop ends when Chrome
        // disconnects or crashes.
        let workspace_id = workspace.id.clone();
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
            debug!("Browser for workspace {} disconnected", workspace_id);
        });

        tokio::time::sleep(Duration::from_millis(300)).await;

        // Chrome opens with one blank tab; reuse it and drop any extras.
        let page = {
            let mut pages = browser
                .pages()
                .await
                .map_err(|e| WorkflowError::Browser(format!("page listing failed: {}", e)))?;

            let main_page = if !pages.is_empty() {
                pages.remove(0)
            } else {
                browser
                    .new_page("about:blank")
                    .await
                    .map_err(|e| WorkflowError::Browser(format!("page creation failed: {}", e)))?
            };

            for extra_page in pages {
                let _ = extra_page.close().await;
            }

            main_page
        };

        Ok((browser, page))
    }

    /// Tear down a browser instance: graceful close, grace period, then
    /// force kill so no Chrome child processes outlive the task.
    async fn shutdown(mut browser: Browser, workspace: &Workspace) {
        if let Err(e) = browser.close().await {
            warn!(
                "Graceful browser close failed for workspace {}: {}",
                workspace.id, e
            );
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        let _ = browser.kill().await;
        debug!("Browser for workspace {} shut down", workspace.id);
    }
}

#[async_trait]
impl ProvisionWorkflow for BrowserWorkflow {
    async fn run(
        &self,
        account: &AccountRecord,
        workspace: &Workspace,
    ) -> Result<CredentialArtifact, WorkflowError> {
        info!(
            "Starting browser workflow for {} (workspace {})",
            account.email, workspace.id
        );

        let (browser, page) = self.launch(workspace).await?;

        // The browser dies on every exit path, including flow errors.
        let outcome = flow::provision(&page, account, &self.config).await;

        Self::shutdown(browser, workspace).await;

        match &outcome {
            Ok(artifact) => info!(
                "Workflow for {} produced project {}",
                account.email, artifact.project_id
            ),
            Err(e) => warn!("Workflow for {} failed: {}", account.email, e),
        }

        outcome
    }
}
