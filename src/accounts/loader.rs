//! CSV account list loader
//!
//! Expected columns: email, password, optional recovery email.
//! Malformed rows are skipped with a warning; only a file that yields
//! zero usable rows is fatal.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// One Google account to run through the provisioning workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountRecord {
    pub email: String,
    pub password: String,
    pub recovery_email: Option<String>,
}

/// Errors loading the account list
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("account file not found: {0}")]
    NotFound(String),

    #[error("failed to read account file: {0}")]
    Read(#[from] csv::Error),

    #[error("account file yielded no usable rows")]
    Empty,
}

/// Load accounts from a CSV file, preserving row order.
///
/// A row is usable when it has at least two non-empty fields and the first
/// field contains an `@` (this also drops header rows). Everything else is
/// skipped with a warning.
pub fn load_accounts(path: &Path) -> Result<Vec<AccountRecord>, LoadError> {
    if !path.exists() {
        return Err(LoadError::NotFound(path.display().to_string()));
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let mut accounts = Vec::new();
    let mut skipped = 0usize;

    for (row, result) in reader.records().enumerate() {
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                warn!("Skipping unreadable row {}: {}", row + 1, e);
                skipped += 1;
                continue;
            }
        };

        let email = record.get(0).unwrap_or_default();
        let password = record.get(1).unwrap_or_default();

        if email.is_empty() || password.is_empty() || !email.contains('@') {
            warn!("Skipping malformed row {} (email: '{}')", row + 1, email);
            skipped += 1;
            continue;
        }

        let recovery_email = record
            .get(2)
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());

        accounts.push(AccountRecord {
            email: email.to_string(),
            password: password.to_string(),
            recovery_email,
        });
    }

    if accounts.is_empty() {
        return Err(LoadError::Empty);
    }

    info!(
        "Loaded {} accounts from {} ({} rows skipped)",
        accounts.len(),
        path.display(),
        skipped
    );

    Ok(accounts)
}
