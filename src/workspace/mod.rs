//! Isolated per-task browser workspaces
//!
//! Every task gets a private Chromium profile directory for its entire
//! lifetime. Two concurrently running tasks never share a directory, so
//! browser instances cannot collide on profile locks or cache state.

use std::path::{Path, PathBuf};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Directory name holding all profile dirs under the workspace root.
/// Also the marker the orphan-process cleaner looks for in Chrome
/// command lines.
pub const PROFILE_DIR: &str = "profiles";

const ALLOC_ATTEMPTS: u32 = 3;

/// Workspace allocation errors
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("failed to create workspace directory {path}: {source}")]
    Create {
        path: String,
        source: std::io::Error,
    },

    #[error("could not allocate a unique workspace id after {0} attempts")]
    Exhausted(u32),
}

/// A private, disposable profile directory bound to one task
#[derive(Debug, Clone)]
pub struct Workspace {
    pub id: String,
    pub path: PathBuf,
}

/// Allocates and reclaims per-task workspaces.
///
/// The active registry is the source of truth for which workspace ids are
/// currently claimed; insertion into it is the atomic acquisition step.
pub struct WorkspaceManager {
    root: PathBuf,
    keep_failed: bool,
    active: DashMap<String, PathBuf>,
}

impl WorkspaceManager {
    /// Create a manager rooted at `root` (profile dirs live under
    /// `<root>/profiles/`).
    pub fn new(root: impl Into<PathBuf>, keep_failed: bool) -> Self {
        Self {
            root: root.into(),
            keep_failed,
            active: DashMap::new(),
        }
    }

    /// Default root under the system temp directory, matching where the
    /// browser sessions expect their data dirs.
    pub fn default_root() -> PathBuf {
        std::env::temp_dir().join("gcp-provisioner")
    }

    /// Workspace root path
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of currently acquired workspaces
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Whether a workspace id is currently acquired
    pub fn is_active(&self, id: &str) -> bool {
        self.active.contains_key(id)
    }

    /// Acquire a fresh workspace for `task_id`.
    ///
    /// The returned path is unique among all currently acquired workspaces;
    /// two simultaneous calls never receive the same directory.
    pub fn acquire(&self, task_id: &str) -> Result<Workspace, WorkspaceError> {
        for _ in 0..ALLOC_ATTEMPTS {
            let unique = Uuid::new_v4().to_string();
            let id = format!("{}_{}", &unique[..8], task_id);
            let path = self.root.join(PROFILE_DIR).join(&id);

            // Claim the id before touching the filesystem; the registry
            // entry is what other acquirers race against.
            match self.active.entry(id.clone()) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(slot) => {
                    slot.insert(path.clone());
                }
            }

            if let Err(source) = std::fs::create_dir_all(&path) {
                self.active.remove(&id);
                return Err(WorkspaceError::Create {
                    path: path.display().to_string(),
                    source,
                });
            }

            debug!("Acquired workspace {} at {}", id, path.display());
            return Ok(Workspace { id, path });
        }

        Err(WorkspaceError::Exhausted(ALLOC_ATTEMPTS))
    }

    /// Release a workspace.
    ///
    /// Idempotent, and safe to call on a partially-initialized workspace.
    /// The backing directory is deleted unless the task failed and the
    /// manager is configured to keep failed profiles for inspection.
    pub fn release(&self, workspace: &Workspace, task_failed: bool) {
        if self.active.remove(&workspace.id).is_none() {
            return;
        }

        if task_failed && self.keep_failed {
            debug!(
                "Keeping failed workspace {} at {}",
                workspace.id,
                workspace.path.display()
            );
            return;
        }

        if let Err(e) = std::fs::remove_dir_all(&workspace.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    "Failed to remove workspace {}: {}",
                    workspace.path.display(),
                    e
                );
            }
        }
    }
}
