// Local session discovery
//
// The daemon does not know how assistant processes are launched; it only
// asks a `SessionSource` which sessions are active right now. The default
// source is a directory of small JSON files that sessions (or their launch
// wrappers) drop into `<data_dir>/sessions/`:
//
//   { "sessionId": "s2", "sessionName": "api-refactor",
//     "projectPath": "/home/me/src/api", "pid": 4242,
//     "capabilities": ["rust", "review"] }
//
// A file whose pid is no longer alive is treated as inactive.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::daemon::lifecycle::process_exists;

/// One locally active assistant session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalSession {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_path: Option<String>,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

impl LocalSession {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            session_name: None,
            project_path: None,
            capabilities: BTreeSet::new(),
            pid: None,
        }
    }
}

/// External collaborator: enumerates locally active sessions.
#[async_trait]
pub trait SessionSource: Send + Sync {
    async fn active_sessions(&self) -> Result<Vec<LocalSession>>;
}

/// File-backed session source.
pub struct SessionDirectory {
    dir: PathBuf,
}

impl SessionDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write (or replace) a session file. Used by launch wrappers and tests.
    pub fn announce(&self, session: &LocalSession) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        let path = self.dir.join(format!("{}.json", file_stem(&session.session_id)));
        let json = serde_json::to_string_pretty(session).context("Failed to serialize session")?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }

    /// Remove a session file if present.
    pub fn retire(&self, session_id: &str) -> Result<()> {
        let path = self.dir.join(format!("{}.json", file_stem(session_id)));
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
        }
        Ok(())
    }

    fn scan(&self) -> Result<Vec<LocalSession>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut sessions = Vec::new();
        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to list {}", self.dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let session: LocalSession = match std::fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|raw| serde_json::from_str(&raw).map_err(anyhow::Error::from))
            {
                Ok(session) => session,
                Err(e) => {
                    // Half-written files show up here while a wrapper is writing.
                    tracing::debug!(path = %path.display(), error = %e, "skipping unreadable session file");
                    continue;
                }
            };
            if session.session_id.trim().is_empty() {
                continue;
            }
            if let Some(pid) = session.pid {
                if !process_exists(pid) {
                    tracing::debug!(session_id = %session.session_id, pid, "session process has exited");
                    continue;
                }
            }
            sessions.push(session);
        }
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(sessions)
    }
}

#[async_trait]
impl SessionSource for SessionDirectory {
    async fn active_sessions(&self) -> Result<Vec<LocalSession>> {
        let dir = SessionDirectory::new(self.dir.clone());
        tokio::task::spawn_blocking(move || dir.scan())
            .await
            .context("Session scan task failed")?
    }
}

fn file_stem(session_id: &str) -> String {
    session_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_directory_means_no_sessions() {
        let dir = TempDir::new().unwrap();
        let source = SessionDirectory::new(dir.path().join("sessions"));
        assert!(source.active_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_announce_then_scan() {
        let dir = TempDir::new().unwrap();
        let source = SessionDirectory::new(dir.path());

        let mut session = LocalSession::new("s2");
        session.session_name = Some("api-refactor".to_string());
        session.pid = Some(std::process::id());
        source.announce(&session).unwrap();
        source.announce(&LocalSession::new("s1")).unwrap();

        let sessions = source.active_sessions().await.unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].session_id, "s1");
        assert_eq!(sessions[1].session_name.as_deref(), Some("api-refactor"));
    }

    #[tokio::test]
    async fn test_dead_pid_and_garbage_are_skipped() {
        let dir = TempDir::new().unwrap();
        let source = SessionDirectory::new(dir.path());

        let mut dead = LocalSession::new("dead");
        dead.pid = Some(999_999_999);
        source.announce(&dead).unwrap();
        std::fs::write(dir.path().join("broken.json"), "{ not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        assert!(source.active_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retire_removes_session() {
        let dir = TempDir::new().unwrap();
        let source = SessionDirectory::new(dir.path());
        source.announce(&LocalSession::new("a/b")).unwrap();
        assert_eq!(source.active_sessions().await.unwrap().len(), 1);
        source.retire("a/b").unwrap();
        assert!(source.active_sessions().await.unwrap().is_empty());
    }
}
