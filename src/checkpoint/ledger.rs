//! 检查点账本
//!
//! 按 session_id 共享的检查点存储视图；写入只经由 Agent Loop（create / resolve），
//! 调用方通过 get_pending_checkpoints 只读查询。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::checkpoint::{Checkpoint, CheckpointOption, CheckpointStatus, CheckpointView, Resolution};
use crate::core::HiveError;
use crate::storage::Store;

#[derive(Clone)]
pub struct CheckpointLedger {
    store: Arc<dyn Store>,
}

impl CheckpointLedger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// 为 Todo 项创建 pending 检查点；同一会话已有未响应检查点时拒绝
    pub async fn create(
        &self,
        session_id: &str,
        todo_item_id: &str,
        reason: impl Into<String>,
        preview: serde_json::Value,
        options: Vec<CheckpointOption>,
        ttl: Option<Duration>,
    ) -> Result<Checkpoint, HiveError> {
        if let Some(existing) = self.pending_for_session(session_id).await? {
            return Err(HiveError::StateConflict {
                op: "create_checkpoint",
                detail: format!(
                    "checkpoint {} is still pending for session {}",
                    existing.id, session_id
                ),
            });
        }

        let created_at = Utc::now();
        let expires_at = match ttl {
            Some(ttl) => {
                let ttl = chrono::Duration::from_std(ttl)
                    .map_err(|e| HiveError::Validation(format!("checkpoint ttl: {e}")))?;
                Some(created_at + ttl)
            }
            None => None,
        };

        let checkpoint = Checkpoint {
            id: format!("ckpt_{}", uuid::Uuid::new_v4()),
            session_id: session_id.to_string(),
            todo_item_id: todo_item_id.to_string(),
            reason: reason.into(),
            preview,
            options,
            status: CheckpointStatus::Pending,
            created_at,
            expires_at,
            resolution: None,
        };
        self.store.insert_checkpoint(&checkpoint).await?;
        tracing::info!(
            session_id,
            checkpoint_id = %checkpoint.id,
            todo_item_id,
            "checkpoint raised"
        );
        Ok(checkpoint)
    }

    /// pending → responded；已响应的检查点不能再次响应
    pub async fn resolve(
        &self,
        checkpoint_id: &str,
        resolution: Resolution,
    ) -> Result<Checkpoint, HiveError> {
        let mut checkpoint = self
            .store
            .get_checkpoint(checkpoint_id)
            .await?
            .ok_or_else(|| HiveError::not_found("checkpoint", checkpoint_id))?;

        if checkpoint.status != CheckpointStatus::Pending {
            return Err(HiveError::StateConflict {
                op: "resolve_checkpoint",
                detail: format!("checkpoint {checkpoint_id} already responded"),
            });
        }

        checkpoint.status = CheckpointStatus::Responded;
        checkpoint.resolution = Some(resolution);
        self.store.update_checkpoint(&checkpoint).await?;
        tracing::info!(
            session_id = %checkpoint.session_id,
            checkpoint_id,
            "checkpoint resolved"
        );
        Ok(checkpoint)
    }

    /// 会话提交失败时撤销 resolve：把检查点写回响应前的 pending 版本
    pub async fn reopen(&self, previous: &Checkpoint) -> Result<(), HiveError> {
        if previous.status != CheckpointStatus::Pending {
            return Err(HiveError::StateConflict {
                op: "reopen_checkpoint",
                detail: format!("checkpoint {} was not pending", previous.id),
            });
        }
        self.store.update_checkpoint(previous).await?;
        tracing::info!(
            session_id = %previous.session_id,
            checkpoint_id = %previous.id,
            "checkpoint reopened"
        );
        Ok(())
    }

    pub async fn get(&self, checkpoint_id: &str) -> Result<CheckpointView, HiveError> {
        self.store
            .get_checkpoint(checkpoint_id)
            .await?
            .map(|c| c.view_at(Utc::now()))
            .ok_or_else(|| HiveError::not_found("checkpoint", checkpoint_id))
    }

    /// 会话的检查点（可按读取时的有效状态过滤），附带 remaining_time
    pub async fn get_pending_checkpoints(
        &self,
        session_id: &str,
        status: Option<CheckpointStatus>,
    ) -> Result<Vec<CheckpointView>, HiveError> {
        self.list_at(session_id, status, Utc::now()).await
    }

    pub async fn list_at(
        &self,
        session_id: &str,
        status: Option<CheckpointStatus>,
        now: DateTime<Utc>,
    ) -> Result<Vec<CheckpointView>, HiveError> {
        let views = self
            .store
            .list_checkpoints(session_id)
            .await?
            .into_iter()
            .map(|c| c.view_at(now))
            .filter(|v| status.map_or(true, |s| v.checkpoint.status == s))
            .collect();
        Ok(views)
    }

    /// 会话当前阻塞中的检查点（存储状态 pending，无论是否已过期）
    pub async fn pending_for_session(
        &self,
        session_id: &str,
    ) -> Result<Option<Checkpoint>, HiveError> {
        Ok(self
            .store
            .list_checkpoints(session_id)
            .await?
            .into_iter()
            .find(Checkpoint::is_blocking))
    }
}
