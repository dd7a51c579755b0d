//! 检查点数据类型
//!
//! 存储中的状态只有 pending / responded；expired 由 `effective_status` 在读取时根据 expires_at 推导。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 检查点状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Pending,
    Responded,
    /// 读取时发现已过 expires_at 且仍未响应
    Expired,
}

/// 提供给用户的选项
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointOption {
    pub id: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl CheckpointOption {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Rejected,
    /// 会话恢复到更早的快照后不再有效，由系统关闭
    Discarded,
}

/// 响应结果：approve 时 message 为反馈，reject 时为拒绝原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub decision: Decision,
    pub message: Option<String>,
    pub responded_at: DateTime<Utc>,
}

impl Resolution {
    pub fn approved(feedback: Option<String>) -> Self {
        Self {
            decision: Decision::Approved,
            message: feedback,
            responded_at: Utc::now(),
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Rejected,
            message: Some(reason.into()),
            responded_at: Utc::now(),
        }
    }

    pub fn discarded(note: impl Into<String>) -> Self {
        Self {
            decision: Decision::Discarded,
            message: Some(note.into()),
            responded_at: Utc::now(),
        }
    }
}

/// 绑定到单个 Todo 项的人工审批关卡
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub session_id: String,
    pub todo_item_id: String,
    pub reason: String,
    /// 待执行动作的描述（不透明 JSON）
    pub preview: serde_json::Value,
    #[serde(default)]
    pub options: Vec<CheckpointOption>,
    pub status: CheckpointStatus,
    pub created_at: DateTime<Utc>,
    /// None 表示永不过期
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resolution: Option<Resolution>,
}

impl Checkpoint {
    /// 存储状态为 pending 且已过期时报告 expired
    pub fn effective_status(&self, now: DateTime<Utc>) -> CheckpointStatus {
        match (self.status, self.expires_at) {
            (CheckpointStatus::Pending, Some(expires_at)) if expires_at <= now => {
                CheckpointStatus::Expired
            }
            (status, _) => status,
        }
    }

    /// max(0, expires_at - now) 毫秒；无过期时间时为 None
    pub fn remaining_time_ms(&self, now: DateTime<Utc>) -> Option<u64> {
        self.expires_at
            .map(|expires_at| (expires_at - now).num_milliseconds().max(0) as u64)
    }

    /// 未响应即阻塞（过期也不会自动放行）
    pub fn is_blocking(&self) -> bool {
        self.status == CheckpointStatus::Pending
    }

    pub fn view_at(&self, now: DateTime<Utc>) -> CheckpointView {
        let mut checkpoint = self.clone();
        checkpoint.status = self.effective_status(now);
        CheckpointView {
            remaining_time: self.remaining_time_ms(now),
            checkpoint,
        }
    }
}

/// 带派生字段的读取视图
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointView {
    #[serde(flatten)]
    pub checkpoint: Checkpoint,
    /// 剩余毫秒数；无过期时间时为 null
    pub remaining_time: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn checkpoint(expires_at: Option<DateTime<Utc>>) -> Checkpoint {
        Checkpoint {
            id: "ckpt_1".to_string(),
            session_id: "s1".to_string(),
            todo_item_id: "item_1".to_string(),
            reason: "needs approval".to_string(),
            preview: serde_json::json!({"content": "pick a dataset"}),
            options: vec![],
            status: CheckpointStatus::Pending,
            created_at: Utc::now(),
            expires_at,
            resolution: None,
        }
    }

    #[test]
    fn test_expired_is_read_derived() {
        let now = Utc::now();
        let cp = checkpoint(Some(now - Duration::seconds(5)));
        let view = cp.view_at(now);
        assert_eq!(view.checkpoint.status, CheckpointStatus::Expired);
        assert_eq!(view.remaining_time, Some(0));
        // 存储状态不变，仍然阻塞
        assert_eq!(cp.status, CheckpointStatus::Pending);
        assert!(cp.is_blocking());
    }

    #[test]
    fn test_remaining_time_counts_down() {
        let now = Utc::now();
        let cp = checkpoint(Some(now + Duration::milliseconds(1500)));
        assert_eq!(cp.remaining_time_ms(now), Some(1500));
        assert_eq!(cp.effective_status(now), CheckpointStatus::Pending);
    }

    #[test]
    fn test_no_expiry_has_null_remaining_time() {
        let cp = checkpoint(None);
        let view = cp.view_at(Utc::now() + Duration::days(365));
        assert_eq!(view.remaining_time, None);
        assert_eq!(view.checkpoint.status, CheckpointStatus::Pending);
    }

    #[test]
    fn test_responded_never_reports_expired() {
        let now = Utc::now();
        let mut cp = checkpoint(Some(now - Duration::seconds(1)));
        cp.status = CheckpointStatus::Responded;
        assert_eq!(cp.effective_status(now), CheckpointStatus::Responded);
        assert!(!cp.is_blocking());
    }

    #[test]
    fn test_view_serializes_flat() {
        let view = checkpoint(None).view_at(Utc::now());
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["todo_item_id"], "item_1");
        assert!(json["remaining_time"].is_null());
    }
}
