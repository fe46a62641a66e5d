use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::session::store::{FormSession, SessionId};

/// Error type for snapshot store operations
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Snapshot serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Snapshot task failed: {0}")]
    Task(String),
}

/// Persistent copies of closed sessions, scoped to one daemon port.
#[async_trait]
pub trait SnapshotStore: Send + Sync + Debug {
    /// Write (or overwrite) the snapshot of a session
    async fn save(&self, session: &FormSession) -> Result<(), SnapshotError>;

    /// Read a snapshot back, `None` when there is none
    async fn load(&self, id: SessionId) -> Result<Option<FormSession>, SnapshotError>;

    /// Delete one snapshot; deleting a missing snapshot is not an error
    async fn delete(&self, id: SessionId) -> Result<(), SnapshotError>;

    /// Delete snapshots of any daemon generation older than `max_age`
    async fn purge_older_than(
        &self,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> Result<usize, SnapshotError>;

    /// Delete every snapshot written by this daemon
    async fn delete_own(&self) -> Result<usize, SnapshotError>;
}

/// Type alias for Arc-wrapped SnapshotStore trait objects
pub type SnapshotStoreRef = Arc<dyn SnapshotStore>;
