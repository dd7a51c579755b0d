//! 内存存储：进程内 HashMap，适合测试与单机临时会话

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::checkpoint::Checkpoint;
use crate::core::state::SessionRecord;
use crate::core::HiveError;
use crate::snapshot::{Snapshot, SnapshotFilter};
use crate::storage::Store;
use crate::todo::TodoList;

#[derive(Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<String, SessionRecord>>,
    todo_lists: RwLock<HashMap<String, TodoList>>,
    checkpoints: RwLock<HashMap<String, Checkpoint>>,
    snapshots: RwLock<HashMap<String, Snapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn save_session(&self, session: &SessionRecord) -> Result<(), HiveError> {
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn load_session(&self, session_id: &str) -> Result<Option<SessionRecord>, HiveError> {
        Ok(self.sessions.read().await.get(session_id).cloned())
    }

    async fn save_todo_list(&self, list: &TodoList) -> Result<(), HiveError> {
        self.todo_lists
            .write()
            .await
            .insert(list.id.clone(), list.clone());
        Ok(())
    }

    async fn load_todo_list(&self, todo_list_id: &str) -> Result<Option<TodoList>, HiveError> {
        Ok(self.todo_lists.read().await.get(todo_list_id).cloned())
    }

    async fn insert_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), HiveError> {
        let mut checkpoints = self.checkpoints.write().await;
        if checkpoints.contains_key(&checkpoint.id) {
            return Err(HiveError::Storage(format!(
                "duplicate checkpoint id {}",
                checkpoint.id
            )));
        }
        checkpoints.insert(checkpoint.id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn update_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), HiveError> {
        let mut checkpoints = self.checkpoints.write().await;
        match checkpoints.get_mut(&checkpoint.id) {
            Some(slot) => {
                *slot = checkpoint.clone();
                Ok(())
            }
            None => Err(HiveError::not_found("checkpoint", &checkpoint.id)),
        }
    }

    async fn get_checkpoint(&self, checkpoint_id: &str) -> Result<Option<Checkpoint>, HiveError> {
        Ok(self.checkpoints.read().await.get(checkpoint_id).cloned())
    }

    async fn list_checkpoints(&self, session_id: &str) -> Result<Vec<Checkpoint>, HiveError> {
        let mut list: Vec<Checkpoint> = self
            .checkpoints
            .read()
            .await
            .values()
            .filter(|c| c.session_id == session_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(list)
    }

    async fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<(), HiveError> {
        let mut snapshots = self.snapshots.write().await;
        if snapshots.contains_key(&snapshot.id) {
            return Err(HiveError::Storage(format!(
                "snapshot {} is immutable",
                snapshot.id
            )));
        }
        snapshots.insert(snapshot.id.clone(), snapshot.clone());
        Ok(())
    }

    async fn get_snapshot(&self, snapshot_id: &str) -> Result<Option<Snapshot>, HiveError> {
        Ok(self.snapshots.read().await.get(snapshot_id).cloned())
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<bool, HiveError> {
        Ok(self.snapshots.write().await.remove(snapshot_id).is_some())
    }

    async fn query_snapshots(&self, filter: &SnapshotFilter) -> Result<Vec<Snapshot>, HiveError> {
        let mut found: Vec<Snapshot> = self
            .snapshots
            .read()
            .await
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        if let Some(limit) = filter.limit {
            found.truncate(limit);
        }
        Ok(found)
    }

    async fn delete_snapshots_before(
        &self,
        session_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, HiveError> {
        let mut snapshots = self.snapshots.write().await;
        let before = snapshots.len();
        snapshots.retain(|_, s| !(s.session_id == session_id && s.created_at < cutoff));
        Ok(before - snapshots.len())
    }
}
