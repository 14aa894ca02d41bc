use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Out-of-process view of the live session. Every field is null when no
/// session is running.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: Option<String>,
    pub pid: Option<u32>,
    pub started_at: Option<i64>,
    pub initialized: Option<bool>,
    pub thread_id: Option<String>,
    pub active_threads: Option<usize>,
    pub active_turns: Option<usize>,
    pub pending_approvals: Option<usize>,
    pub workspace_root: Option<PathBuf>,
    pub updated_at: i64,
}

impl SessionSnapshot {
    pub fn empty() -> Self {
        Self {
            updated_at: crate::now_ms(),
            ..Self::default()
        }
    }
}

/// Best effort: failures are logged and swallowed.
pub fn write_snapshot(path: &Path, snapshot: &SessionSnapshot) {
    if let Err(err) = try_write_snapshot(path, snapshot) {
        tracing::warn!(
            path = %path.display(),
            error = %err,
            "snapshot: failed to write session status"
        );
    }
}

fn try_write_snapshot(path: &Path, snapshot: &SessionSnapshot) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(snapshot)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    fs::write(path, content)
}

pub fn read_snapshot(path: &Path) -> Option<SessionSnapshot> {
    let raw = fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}
