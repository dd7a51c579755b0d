//! 快照：会话状态的时间点副本，可查询、可恢复到存活的 Agent Loop

pub mod manager;
pub mod store;
pub mod types;

pub use manager::SnapshotManager;
pub use store::SnapshotStore;
pub use types::{RestoreOutcome, Snapshot, SnapshotFilter, SnapshotState, SnapshotTrigger};
