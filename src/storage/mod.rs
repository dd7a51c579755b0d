//! 持久化抽象层
//!
//! 定义会话、Todo List、检查点、快照的统一存储接口，支持内存和 SQLite 两种实现。
//! 约定：方法返回前的写入即视为持久。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::checkpoint::Checkpoint;
use crate::core::state::SessionRecord;
use crate::core::HiveError;
use crate::snapshot::{Snapshot, SnapshotFilter};
use crate::todo::TodoList;

pub mod memory;
#[cfg(feature = "async-sqlite")]
pub mod sqlite;

pub use memory::MemoryStore;
#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteStore;

/// 存储接口：按 session / todo list / checkpoint / snapshot id 读写
#[async_trait]
pub trait Store: Send + Sync {
    async fn save_session(&self, session: &SessionRecord) -> Result<(), HiveError>;

    async fn load_session(&self, session_id: &str) -> Result<Option<SessionRecord>, HiveError>;

    async fn save_todo_list(&self, list: &TodoList) -> Result<(), HiveError>;

    async fn load_todo_list(&self, todo_list_id: &str) -> Result<Option<TodoList>, HiveError>;

    async fn insert_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), HiveError>;

    async fn update_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), HiveError>;

    async fn get_checkpoint(&self, checkpoint_id: &str) -> Result<Option<Checkpoint>, HiveError>;

    /// 按创建时间升序
    async fn list_checkpoints(&self, session_id: &str) -> Result<Vec<Checkpoint>, HiveError>;

    async fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<(), HiveError>;

    async fn get_snapshot(&self, snapshot_id: &str) -> Result<Option<Snapshot>, HiveError>;

    /// 返回是否确实删除
    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<bool, HiveError>;

    /// 按创建时间倒序，应用 filter.limit
    async fn query_snapshots(&self, filter: &SnapshotFilter) -> Result<Vec<Snapshot>, HiveError>;

    async fn delete_snapshots_before(
        &self,
        session_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, HiveError>;
}

/// 创建存储
///
/// backend 为 "sqlite" 且启用了 async-sqlite feature 时使用 SQLite，否则使用内存存储
pub async fn create_store(backend: &str, db_path: Option<&std::path::Path>) -> Arc<dyn Store> {
    #[cfg(feature = "async-sqlite")]
    if backend.eq_ignore_ascii_case("sqlite") {
        let path = db_path.unwrap_or_else(|| std::path::Path::new("hive.db"));
        match SqliteStore::new(path).await {
            Ok(store) => {
                tracing::info!("Using sqlite store: {:?}", path);
                return Arc::new(store);
            }
            Err(e) => {
                tracing::warn!("Failed to open sqlite store, falling back to memory: {}", e);
            }
        }
    }

    #[cfg(not(feature = "async-sqlite"))]
    if backend.eq_ignore_ascii_case("sqlite") {
        tracing::warn!(
            "sqlite store requested ({:?}) but async-sqlite feature not enabled, using memory store",
            db_path
        );
    }

    tracing::info!("Using in-memory store");
    Arc::new(MemoryStore::new())
}
