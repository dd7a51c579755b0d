//! 快照管理：面向调用方的 create / restore / cleanup / 查询入口
//!
//! 创建与恢复都经由会话的 Agent Loop 完成，保证捕获与替换发生在两条命令之间。

use std::sync::Arc;
use std::time::Duration;

use crate::core::{AgentLoopHandle, HiveError, HiveResult, SessionRegistry};
use crate::snapshot::{RestoreOutcome, Snapshot, SnapshotFilter, SnapshotStore, SnapshotTrigger};

#[derive(Clone)]
pub struct SnapshotManager {
    registry: Arc<SessionRegistry>,
    snapshots: SnapshotStore,
}

impl SnapshotManager {
    pub fn new(registry: Arc<SessionRegistry>, snapshots: SnapshotStore) -> Self {
        Self {
            registry,
            snapshots,
        }
    }

    /// 捕获存活会话的当前状态；会话不存在时返回 NotFound
    pub async fn create_snapshot(
        &self,
        session_id: &str,
        trigger: SnapshotTrigger,
        label: Option<String>,
    ) -> HiveResult<Snapshot> {
        let handle = self
            .registry
            .get(session_id)
            .await
            .ok_or_else(|| HiveError::not_found("session", session_id))?;
        handle.create_snapshot(trigger, label).await
    }

    /// 整体替换会话状态；会话没有存活 loop 时按快照中的配置创建
    pub async fn restore_snapshot(&self, snapshot_id: &str) -> HiveResult<RestoreOutcome> {
        let snapshot = self.snapshots.get_by_id(snapshot_id).await?;
        let handle = self.loop_for(&snapshot).await?;
        handle.restore(snapshot).await
    }

    async fn loop_for(&self, snapshot: &Snapshot) -> HiveResult<AgentLoopHandle> {
        match self.registry.get(&snapshot.session_id).await {
            Some(handle) => Ok(handle),
            None => {
                tracing::info!(
                    session_id = %snapshot.session_id,
                    "no live loop, creating one to restore into"
                );
                self.registry
                    .get_or_create(&snapshot.session_id, snapshot.state.session.config.clone())
                    .await
            }
        }
    }

    pub async fn cleanup(&self, session_id: &str, max_age: Duration) -> HiveResult<usize> {
        self.snapshots.cleanup(session_id, max_age).await
    }

    pub async fn get_by_id(&self, snapshot_id: &str) -> HiveResult<Snapshot> {
        self.snapshots.get_by_id(snapshot_id).await
    }

    pub async fn delete(&self, snapshot_id: &str) -> HiveResult<()> {
        self.snapshots.delete(snapshot_id).await
    }

    pub async fn query(&self, filter: &SnapshotFilter) -> HiveResult<Vec<Snapshot>> {
        self.snapshots.query(filter).await
    }

    pub async fn count(&self, filter: &SnapshotFilter) -> HiveResult<usize> {
        self.snapshots.count(filter).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::agent_loop::{LoopServices, StartOptions};
    use crate::core::{SessionConfig, SessionStatus};
    use crate::llm::MockLlmClient;
    use crate::plan::{LlmGoalOracle, LlmStepExecutor};
    use crate::storage::MemoryStore;

    fn manager() -> (Arc<SessionRegistry>, SnapshotManager) {
        let llm = Arc::new(MockLlmClient::default());
        let services = Arc::new(
            LoopServices::new(
                Arc::new(MemoryStore::new()),
                Arc::new(LlmGoalOracle::new(llm.clone())),
                Arc::new(LlmStepExecutor::new(llm)),
            )
            .with_policy(crate::checkpoint::CheckpointPolicy::new(Vec::<String>::new())),
        );
        let snapshots = services.snapshots.clone();
        let registry = Arc::new(SessionRegistry::new(services, SessionConfig::default()));
        (registry.clone(), SnapshotManager::new(registry, snapshots))
    }

    #[tokio::test]
    async fn test_create_requires_live_session() {
        let (_registry, manager) = manager();
        let err = manager
            .create_snapshot("ghost", SnapshotTrigger::Manual, None)
            .await
            .unwrap_err();
        assert!(matches!(err, HiveError::NotFound { kind: "session", .. }));
    }

    #[tokio::test]
    async fn test_restore_into_deleted_session() {
        let (registry, manager) = manager();
        let handle = registry.get_or_create_default("s1").await.unwrap();
        handle.start("plan a trip", StartOptions::default()).await.unwrap();
        handle.step().await.unwrap();
        let captured = handle.state();

        let snapshot = manager
            .create_snapshot("s1", SnapshotTrigger::Manual, Some("after first".to_string()))
            .await
            .unwrap();
        handle.step().await.unwrap();
        registry.delete("s1").await;

        let outcome = manager.restore_snapshot(&snapshot.id).await.unwrap();
        assert_eq!(outcome.step_index, 1);
        let restored = registry.get("s1").await.unwrap();
        assert_eq!(restored.get_status(), captured.session.view());
        assert_eq!(restored.get_status().status, SessionStatus::Idle);
        assert_eq!(
            restored.get_todo_list().map(|l| l.items),
            captured.todo_list.map(|l| l.items)
        );
        assert_eq!(
            manager
                .count(&SnapshotFilter::for_session("s1"))
                .await
                .unwrap(),
            1
        );
    }
}
