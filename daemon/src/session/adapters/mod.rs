pub mod file;
pub mod in_memory;

pub use file::FileSnapshotStore;
pub use in_memory::InMemorySnapshotStore;
