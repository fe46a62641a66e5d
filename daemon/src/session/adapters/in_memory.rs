use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::session::snapshot::{SnapshotError, SnapshotStore};
use crate::session::store::{FormSession, SessionId};

/// In-memory implementation of SnapshotStore, for tests and dry runs
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    /// Saved sessions with the time they were written
    snapshots: Arc<RwLock<HashMap<SessionId, (FormSession, DateTime<Utc>)>>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_error<E: std::fmt::Display>(e: E) -> SnapshotError {
        SnapshotError::Task(format!("Failed to acquire snapshot lock: {}", e))
    }

    /// Ids currently stored, sorted
    pub fn ids(&self) -> Vec<SessionId> {
        let snapshots = match self.snapshots.read() {
            Ok(snapshots) => snapshots,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut ids: Vec<SessionId> = snapshots.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Pretend a snapshot was written at `saved_at`.
    pub fn backdate(&self, id: SessionId, saved_at: DateTime<Utc>) {
        if let Ok(mut snapshots) = self.snapshots.write() {
            if let Some(entry) = snapshots.get_mut(&id) {
                entry.1 = saved_at;
            }
        }
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn save(&self, session: &FormSession) -> Result<(), SnapshotError> {
        let mut snapshots = self.snapshots.write().map_err(Self::lock_error)?;
        snapshots.insert(session.id, (session.clone(), Utc::now()));
        debug!(session = %session.id, "Saved in-memory snapshot");
        Ok(())
    }

    async fn load(&self, id: SessionId) -> Result<Option<FormSession>, SnapshotError> {
        let snapshots = self.snapshots.read().map_err(Self::lock_error)?;
        Ok(snapshots.get(&id).map(|(session, _)| session.clone()))
    }

    async fn delete(&self, id: SessionId) -> Result<(), SnapshotError> {
        let mut snapshots = self.snapshots.write().map_err(Self::lock_error)?;
        snapshots.remove(&id);
        Ok(())
    }

    async fn purge_older_than(
        &self,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> Result<usize, SnapshotError> {
        let mut snapshots = self.snapshots.write().map_err(Self::lock_error)?;
        let before = snapshots.len();
        snapshots.retain(|_, (_, saved_at)| {
            now.signed_duration_since(*saved_at)
                .to_std()
                .map(|age| age <= max_age)
                .unwrap_or(true)
        });
        Ok(before - snapshots.len())
    }

    async fn delete_own(&self) -> Result<usize, SnapshotError> {
        let mut snapshots = self.snapshots.write().map_err(Self::lock_error)?;
        let count = snapshots.len();
        snapshots.clear();
        Ok(count)
    }
}
