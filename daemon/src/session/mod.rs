//! Session management for the form daemon
//!
//! A session is one open form. The `SessionRegistry` owns the live sessions,
//! evicts idle ones and persists editable sessions through a `SnapshotStore`
//! so a later request for the same id can pick up where the user left off.

pub mod adapters;
pub mod registry;
pub mod snapshot;
pub mod store;

pub use adapters::{FileSnapshotStore, InMemorySnapshotStore};
pub use registry::{
    is_unknown_addon, Clock, RegistryConfig, SessionRegistry, SubmissionGuard, SweepReport,
    SystemClock,
};
pub use snapshot::{SnapshotError, SnapshotStore, SnapshotStoreRef};
pub use store::{Environment, FormSession, HostResponse, ResponseSource, SessionId};
