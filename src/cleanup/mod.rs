//! Orphaned browser process cleanup
//!
//! Detects and kills Chrome/Chromium processes whose profile directory
//! lives under our workspace root but whose workspace is no longer
//! registered. Task handles normally join their browsers; this is the
//! backstop for instances that outlived a killed or crashed task.

use tracing::info;

use crate::workspace::{WorkspaceManager, PROFILE_DIR};

/// Kill browser processes pointing at unregistered workspaces under the
/// manager's root. Returns the number of killed processes.
pub fn kill_orphan_browsers(manager: &WorkspaceManager) -> u32 {
    #[cfg(target_os = "windows")]
    {
        kill_orphans_windows(manager)
    }

    #[cfg(not(target_os = "windows"))]
    {
        kill_orphans_unix(manager)
    }
}

/// Extract the workspace id from a browser command line containing
/// `--user-data-dir=.../profiles/{workspace_id}`.
fn extract_workspace_id(cmdline: &str, root_marker: &str) -> Option<String> {
    let pos = cmdline.find(root_marker)?;
    let after = &cmdline[pos + root_marker.len()..];
    let after = after.trim_start_matches(|c: char| c == '\\' || c == '/');
    let workspace_id: String = after
        .chars()
        .take_while(|c| !c.is_whitespace() && *c != '"' && *c != '\'' && *c != '\\' && *c != '/')
        .collect();
    if workspace_id.is_empty() {
        None
    } else {
        Some(workspace_id)
    }
}

/// The command-line marker for this manager's profile directories
fn root_marker(manager: &WorkspaceManager) -> String {
    manager
        .root()
        .join(PROFILE_DIR)
        .to_string_lossy()
        .to_string()
}

#[cfg(not(target_os = "windows"))]
fn kill_orphans_unix(manager: &WorkspaceManager) -> u32 {
    use std::process::Command;

    let output = match Command::new("ps").args(["aux"]).output() {
        Ok(o) => o,
        Err(_) => return 0,
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let marker = root_marker(manager);
    let mut killed = 0u32;

    for line in stdout.lines() {
        if !line.contains(&marker) || !line.contains("chrom") {
            continue;
        }

        if let Some(workspace_id) = extract_workspace_id(line, &marker) {
            if !manager.is_active(&workspace_id) {
                if let Some(pid) = line
                    .split_whitespace()
                    .nth(1)
                    .and_then(|s| s.parse::<u32>().ok())
                {
                    info!(
                        "Killing orphaned browser PID {} (workspace: {})",
                        pid, workspace_id
                    );
                    let _ = Command::new("kill").args(["-9", &pid.to_string()]).output();
                    killed += 1;
                }
            }
        }
    }

    if killed > 0 {
        info!("Cleaned up {} orphaned browser processes", killed);
    }

    killed
}

#[cfg(target_os = "windows")]
fn kill_orphans_windows(manager: &WorkspaceManager) -> u32 {
    use std::process::Command;
    use tracing::debug;

    let output = match Command::new("wmic")
        .args([
            "process",
            "where",
            "Name='chrome.exe'",
            "get",
            "ProcessId,CommandLine",
            "/FORMAT:CSV",
        ])
        .output()
    {
        Ok(o) => o,
        Err(e) => {
            debug!("Cannot enumerate Chrome processes: {}", e);
            return 0;
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let marker = root_marker(manager);
    let mut killed = 0u32;

    for line in stdout.lines() {
        if !line.contains(&marker) {
            continue;
        }

        if let Some(workspace_id) = extract_workspace_id(line, &marker) {
            if !manager.is_active(&workspace_id) {
                if let Some(pid) = extract_pid_from_csv(line) {
                    info!(
                        "Killing orphaned browser PID {} (workspace: {})",
                        pid, workspace_id
                    );
                    let _ = Command::new("taskkill")
                        .args(["/PID", &pid.to_string(), "/T", "/F"])
                        .output();
                    killed += 1;
                }
            }
        }
    }

    if killed > 0 {
        info!("Cleaned up {} orphaned browser processes", killed);
    }

    killed
}

/// WMIC CSV format: `Node,CommandLine,ProcessId` — the last numeric field
/// is the PID.
#[allow(dead_code)]
fn extract_pid_from_csv(line: &str) -> Option<u32> {
    line.split(',')
        .filter_map(|s| s.trim().parse::<u32>().ok())
        .last()
}
