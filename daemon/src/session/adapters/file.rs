use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;
use tracing::{debug, warn};

use crate::session::snapshot::{SnapshotError, SnapshotStore};
use crate::session::store::{FormSession, SessionId};

const FILE_PREFIX: &str = "session-";
const FILE_SUFFIX: &str = ".json";

/// Snapshots as JSON files named `session-<port>-<id>.json`.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
    port: u16,
}

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>, port: u16) -> Self {
        Self {
            dir: dir.into(),
            port,
        }
    }

    pub fn path_for(&self, id: SessionId) -> PathBuf {
        self.dir
            .join(format!("{}{}-{}{}", FILE_PREFIX, self.port, id, FILE_SUFFIX))
    }

    fn own_prefix(&self) -> String {
        format!("{}{}-", FILE_PREFIX, self.port)
    }

    /// Snapshot files in the directory whose names start with `prefix`.
    async fn snapshot_files(&self, prefix: &str) -> Result<Vec<PathBuf>, SnapshotError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(prefix) && name.ends_with(FILE_SUFFIX) {
                files.push(entry.path());
            }
        }
        Ok(files)
    }
}

async fn remove_if_exists(path: &Path) -> Result<bool, SnapshotError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn save(&self, session: &FormSession) -> Result<(), SnapshotError> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(session.id);
        let temp_path = path.with_extension("json.tmp");
        let contents = serde_json::to_vec_pretty(session)?;
        fs::write(&temp_path, contents).await?;
        fs::rename(&temp_path, &path).await?;
        debug!(session = %session.id, path = %path.display(), "Saved session snapshot");
        Ok(())
    }

    async fn load(&self, id: SessionId) -> Result<Option<FormSession>, SnapshotError> {
        let path = self.path_for(id);
        let contents = match fs::read(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let session = serde_json::from_slice(&contents)?;
        debug!(session = %id, path = %path.display(), "Loaded session snapshot");
        Ok(Some(session))
    }

    async fn delete(&self, id: SessionId) -> Result<(), SnapshotError> {
        if remove_if_exists(&self.path_for(id)).await? {
            debug!(session = %id, "Deleted session snapshot");
        }
        Ok(())
    }

    async fn purge_older_than(
        &self,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> Result<usize, SnapshotError> {
        let mut purged = 0;
        for path in self.snapshot_files(FILE_PREFIX).await? {
            let modified = match fs::metadata(&path).await.and_then(|m| m.modified()) {
                Ok(modified) => DateTime::<Utc>::from(modified),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Cannot read snapshot age");
                    continue;
                }
            };
            let stale = now
                .signed_duration_since(modified)
                .to_std()
                .map(|age| age > max_age)
                .unwrap_or(false);
            if stale && remove_if_exists(&path).await? {
                purged += 1;
            }
        }
        if purged > 0 {
            debug!(purged, "Purged stale session snapshots");
        }
        Ok(purged)
    }

    async fn delete_own(&self) -> Result<usize, SnapshotError> {
        let mut deleted = 0;
        for path in self.snapshot_files(&self.own_prefix()).await? {
            if remove_if_exists(&path).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}
