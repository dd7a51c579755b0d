//! 会话状态定义：SessionStatus 状态机、会话配置、持久化记录与只读视图
//!
//! Agent Loop 自身字段（status / progress / current_item_id）强类型；
//! 调用方透传的上下文以 `serde_json::Map` 表示。

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 会话状态：封闭枚举，新增状态必须同步更新所有 match
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Running,
    /// 存在 pending 检查点，等待人工审批
    Waiting,
    Paused,
    Completed,
    Failed,
}

impl SessionStatus {
    /// step 仅在 idle / running 下有效
    pub fn can_step(self) -> bool {
        matches!(self, Self::Idle | Self::Running)
    }

    pub fn can_pause(self) -> bool {
        matches!(self, Self::Idle | Self::Running | Self::Waiting)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// 会话级配置（start 时可覆盖）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// 为 true 时 start 成功后自动逐步执行，直到等待审批、暂停或结束
    pub auto_run: bool,
    /// 单步失败后的最大重试次数（不含首次执行）
    pub max_retries: u32,
    /// 重试间隔（毫秒）
    pub step_delay_ms: u64,
    /// 透传给 Oracle / 执行器的上下文
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
}

impl SessionConfig {
    pub fn step_delay(&self) -> Duration {
        Duration::from_millis(self.step_delay_ms)
    }

    pub fn with_auto_run(mut self, auto_run: bool) -> Self {
        self.auto_run = auto_run;
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_run: false,
            max_retries: 2,
            step_delay_ms: 500,
            context: serde_json::Map::new(),
        }
    }
}

/// 会话持久化记录（Agent Loop 独占写入）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub status: SessionStatus,
    pub current_item_id: Option<String>,
    /// 0-100，始终为 ⌊completed / total × 100⌋
    pub progress: u8,
    pub goal: Option<String>,
    pub model_id: Option<String>,
    pub config: SessionConfig,
    pub todo_list_id: Option<String>,
    /// 进入 paused 前的状态，resume 时原样恢复
    pub paused_from: Option<SessionStatus>,
    pub paused_reason: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(id: impl Into<String>, config: SessionConfig) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            status: SessionStatus::Idle,
            current_item_id: None,
            progress: 0,
            goal: None,
            model_id: None,
            config,
            todo_list_id: None,
            paused_from: None,
            paused_reason: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 非自动运行时每步结束回到 idle，自动运行时保持 running
    pub fn working_status(&self) -> SessionStatus {
        if self.config.auto_run {
            SessionStatus::Running
        } else {
            SessionStatus::Idle
        }
    }

    pub fn view(&self) -> StatusView {
        StatusView {
            status: self.status,
            current_item_id: self.current_item_id.clone(),
            progress: self.progress,
        }
    }
}

/// getStatus 的返回值
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusView {
    pub status: SessionStatus,
    pub current_item_id: Option<String>,
    pub progress: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_guards() {
        assert!(SessionStatus::Idle.can_step());
        assert!(SessionStatus::Running.can_step());
        assert!(!SessionStatus::Waiting.can_step());
        assert!(!SessionStatus::Paused.can_step());
        assert!(SessionStatus::Waiting.can_pause());
        assert!(!SessionStatus::Completed.can_pause());
        assert!(SessionStatus::Failed.is_terminal());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&SessionStatus::Waiting).unwrap();
        assert_eq!(json, "\"waiting\"");
        assert_eq!(SessionStatus::Completed.to_string(), "completed");
    }

    #[test]
    fn test_working_status_follows_auto_run() {
        let record = SessionRecord::new("s1", SessionConfig::default());
        assert_eq!(record.working_status(), SessionStatus::Idle);
        let record = SessionRecord::new("s1", SessionConfig::default().with_auto_run(true));
        assert_eq!(record.working_status(), SessionStatus::Running);
    }
}
