//! 快照存储：生成 id、写入持久层、按条件查询与按年龄清理
//!
//! 快照一经写入不再修改；只有 delete / cleanup 会删除。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::core::HiveError;
use crate::snapshot::{Snapshot, SnapshotFilter, SnapshotState, SnapshotTrigger};
use crate::storage::Store;

#[derive(Clone)]
pub struct SnapshotStore {
    store: Arc<dyn Store>,
}

impl SnapshotStore {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn capture(
        &self,
        state: SnapshotState,
        trigger: SnapshotTrigger,
        label: Option<String>,
    ) -> Result<Snapshot, HiveError> {
        let snapshot = Snapshot {
            id: format!("snap_{}", uuid::Uuid::new_v4()),
            session_id: state.session.id.clone(),
            trigger,
            label,
            state,
            created_at: Utc::now(),
        };
        self.store.insert_snapshot(&snapshot).await?;
        tracing::info!(
            session_id = %snapshot.session_id,
            snapshot_id = %snapshot.id,
            trigger = %trigger,
            "snapshot created"
        );
        Ok(snapshot)
    }

    pub async fn get_by_id(&self, snapshot_id: &str) -> Result<Snapshot, HiveError> {
        self.store
            .get_snapshot(snapshot_id)
            .await?
            .ok_or_else(|| HiveError::not_found("snapshot", snapshot_id))
    }

    pub async fn delete(&self, snapshot_id: &str) -> Result<(), HiveError> {
        if self.store.delete_snapshot(snapshot_id).await? {
            Ok(())
        } else {
            Err(HiveError::not_found("snapshot", snapshot_id))
        }
    }

    /// 按创建时间倒序
    pub async fn query(&self, filter: &SnapshotFilter) -> Result<Vec<Snapshot>, HiveError> {
        self.store.query_snapshots(filter).await
    }

    /// count 忽略 limit
    pub async fn count(&self, filter: &SnapshotFilter) -> Result<usize, HiveError> {
        let unlimited = SnapshotFilter {
            limit: None,
            ..filter.clone()
        };
        Ok(self.store.query_snapshots(&unlimited).await?.len())
    }

    /// 删除该会话中早于 max_age 的快照，返回删除数量
    pub async fn cleanup(&self, session_id: &str, max_age: Duration) -> Result<usize, HiveError> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| HiveError::Validation(format!("max_age: {e}")))?;
        let cutoff = Utc::now() - max_age;
        let removed = self.store.delete_snapshots_before(session_id, cutoff).await?;
        if removed > 0 {
            tracing::info!(session_id, removed, "snapshots cleaned up");
        }
        Ok(removed)
    }
}
