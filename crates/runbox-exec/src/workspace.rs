//! Ephemeral per-session workspaces on local storage.
//!
//! Each session owns exactly one directory under the configured root; it is
//! created when the session starts and removed when the session ends. The
//! single source file for the current run lives inside it.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, warn};

use crate::Result;

/// Creates and destroys per-session workspace directories.
#[derive(Debug, Clone)]
pub struct WorkspaceStore {
    root: PathBuf,
}

impl WorkspaceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the workspace directory for a session. Safe to call
    /// concurrently for distinct session ids.
    pub async fn create(&self, session_id: &str) -> Result<PathBuf> {
        let dir = self.root.join(session_id);
        fs::create_dir_all(&dir).await?;
        debug!("created workspace {}", dir.display());
        Ok(dir)
    }

    /// Stage the submitted source inside the workspace, replacing any
    /// previous run's file. The content is written to a temporary name and
    /// renamed over the target, so a process spawning concurrently never
    /// observes a partially-written file, and a previous run still holding
    /// the old inode open keeps reading intact content.
    pub async fn write_source(
        &self,
        workspace: &Path,
        file_name: &str,
        code: &str,
    ) -> Result<PathBuf> {
        let path = workspace.join(file_name);
        let staging = workspace.join(format!(".{file_name}.tmp"));
        fs::write(&staging, code).await?;
        fs::rename(&staging, &path).await?;
        Ok(path)
    }

    /// Remove a session's workspace tree. Best-effort: failures are logged
    /// and never abort teardown, and a missing directory counts as removed.
    pub async fn destroy(&self, workspace: &Path) {
        match fs::remove_dir_all(workspace).await {
            Ok(()) => debug!("removed workspace {}", workspace.display()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!("failed to remove workspace {}: {}", workspace.display(), err),
        }
    }

    /// Remove every session workspace under the root. Used on daemon
    /// shutdown; best-effort like [`destroy`](Self::destroy).
    pub async fn destroy_all(&self) {
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => debug!("removed workspace root {}", self.root.display()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                "failed to remove workspace root {}: {}",
                self.root.display(),
                err
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_destroy() {
        let root = tempfile::tempdir().unwrap();
        let store = WorkspaceStore::new(root.path());

        let workspace = store.create("sess-1").await.unwrap();
        assert!(workspace.is_dir());
        assert_eq!(workspace, root.path().join("sess-1"));

        store.destroy(&workspace).await;
        assert!(!workspace.exists());

        // destroying again is a no-op, not an error
        store.destroy(&workspace).await;
    }

    #[tokio::test]
    async fn test_distinct_sessions_get_independent_directories() {
        let root = tempfile::tempdir().unwrap();
        let store = WorkspaceStore::new(root.path());

        let a = store.create("sess-a").await.unwrap();
        let b = store.create("sess-b").await.unwrap();
        assert_ne!(a, b);

        store.destroy(&a).await;
        assert!(!a.exists());
        assert!(b.is_dir());
    }

    #[tokio::test]
    async fn test_write_source_overwrites_previous_run() {
        let root = tempfile::tempdir().unwrap();
        let store = WorkspaceStore::new(root.path());
        let workspace = store.create("sess-1").await.unwrap();

        let first = store
            .write_source(&workspace, "main.py", "print(1)")
            .await
            .unwrap();
        let second = store
            .write_source(&workspace, "main.py", "print(2)")
            .await
            .unwrap();

        assert_eq!(first, second);
        let content = tokio::fs::read_to_string(&second).await.unwrap();
        assert_eq!(content, "print(2)");

        // no staging leftovers
        let mut entries = tokio::fs::read_dir(&workspace).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name());
        }
        assert_eq!(names, vec![std::ffi::OsString::from("main.py")]);
    }
}
