//! Provisioning workflow contract
//!
//! The orchestration core only knows this interface: a workflow takes one
//! account and one isolated workspace and either produces a credential
//! artifact or fails with a classified error. The browser-driven
//! implementation lives in the submodules and is inherently coupled to the
//! target site's markup.

mod browser;
mod flow;

pub use browser::{BrowserWorkflow, BrowserWorkflowConfig};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::accounts::AccountRecord;
use crate::workspace::Workspace;

/// Credential data extracted for one successfully provisioned account
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialArtifact {
    pub email: String,
    pub project_id: String,
    pub api_key: String,
    pub created_at: DateTime<Utc>,
}

/// Workflow failures, classified for the failure log
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("workflow timed out after {0}s")]
    Timeout(u64),

    #[error("element not found: {0}")]
    ElementNotFound(String),

    #[error("unexpected page state: {0}")]
    UnexpectedState(String),

    #[error("browser error: {0}")]
    Browser(String),

    #[error("workflow cancelled")]
    Cancelled,
}

impl WorkflowError {
    /// Stable classification string recorded in the failure log
    pub fn classification(&self) -> &'static str {
        match self {
            WorkflowError::Timeout(_) => "timeout",
            WorkflowError::ElementNotFound(_) => "element-not-found",
            WorkflowError::UnexpectedState(_) => "unexpected-state",
            WorkflowError::Browser(_) => "browser",
            WorkflowError::Cancelled => "cancelled",
        }
    }
}

/// One provisioning attempt for one account inside its own workspace.
///
/// Implementations may take minutes and are not required to be
/// deterministic; the pool enforces the per-task timeout around them.
#[async_trait]
pub trait ProvisionWorkflow: Send + Sync {
    async fn run(
        &self,
        account: &AccountRecord,
        workspace: &Workspace,
    ) -> Result<CredentialArtifact, WorkflowError>;
}
