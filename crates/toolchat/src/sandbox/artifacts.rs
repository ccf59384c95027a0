//! Long-lived storage for files produced by executions.
//!
//! Artifacts live under `<root>/<execution_id>/` and are served to clients
//! at `<url_prefix>/<execution_id>/<file>`. Old execution directories are
//! pruned at startup.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tracing::{debug, info};

/// URL prefix under which the web server exposes the artifact root.
pub const ARTIFACT_URL_PREFIX: &str = "/api/code-output";

/// A stored artifact and the URL a client can fetch it from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactRef {
    pub url: String,
    #[serde(skip)]
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    url_prefix: String,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            url_prefix: ARTIFACT_URL_PREFIX.to_string(),
        }
    }

    pub fn with_url_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.url_prefix = prefix.into().trim_end_matches('/').to_string();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.root).await
    }

    /// Copy `files` into the directory for `execution_id`. Nothing is
    /// created when `files` is empty.
    pub async fn store(&self, execution_id: &str, files: &[PathBuf]) -> io::Result<Vec<ArtifactRef>> {
        if files.is_empty() {
            return Ok(Vec::new());
        }
        let dir = self.root.join(execution_id);
        tokio::fs::create_dir_all(&dir).await?;

        let mut refs = Vec::with_capacity(files.len());
        for file in files {
            let Some(name) = file.file_name() else {
                continue;
            };
            let dest = dir.join(name);
            tokio::fs::copy(file, &dest).await?;
            refs.push(ArtifactRef {
                url: format!(
                    "{}/{}/{}",
                    self.url_prefix,
                    execution_id,
                    name.to_string_lossy()
                ),
                path: dest,
            });
        }
        debug!("Stored {} artifact(s) for execution {execution_id}", refs.len());
        Ok(refs)
    }

    /// Remove execution directories last modified more than `max_age` ago.
    /// Returns the number removed.
    pub async fn prune_older_than(&self, max_age: Duration) -> io::Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let now = SystemTime::now();
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let meta = match entry.metadata().await {
                Ok(meta) if meta.is_dir() => meta,
                _ => continue,
            };
            let age = meta
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            if age >= max_age && tokio::fs::remove_dir_all(entry.path()).await.is_ok() {
                info!("Cleaned up old code output: {}", entry.file_name().to_string_lossy());
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_copies_files_and_builds_urls() {
        let src = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let plot = src.path().join("plot_1.png");
        std::fs::write(&plot, b"\x89PNG").unwrap();

        let store = ArtifactStore::new(root.path());
        let refs = store.store("exec-1", &[plot]).await.unwrap();

        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].url, "/api/code-output/exec-1/plot_1.png");
        assert_eq!(std::fs::read(&refs[0].path).unwrap(), b"\x89PNG");
    }

    #[tokio::test]
    async fn store_nothing_creates_no_directory() {
        let root = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(root.path());
        assert!(store.store("exec-2", &[]).await.unwrap().is_empty());
        assert!(!root.path().join("exec-2").exists());
    }

    #[tokio::test]
    async fn prune_respects_age() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("fresh")).unwrap();
        let store = ArtifactStore::new(root.path());

        assert_eq!(store.prune_older_than(Duration::from_secs(3600)).await.unwrap(), 0);
        assert!(root.path().join("fresh").exists());

        assert_eq!(store.prune_older_than(Duration::ZERO).await.unwrap(), 1);
        assert!(!root.path().join("fresh").exists());
    }

    #[tokio::test]
    async fn prune_missing_root_is_noop() {
        let store = ArtifactStore::new("/nonexistent/toolchat-artifacts");
        assert_eq!(store.prune_older_than(Duration::ZERO).await.unwrap(), 0);
    }
}
