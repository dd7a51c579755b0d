//! 快照数据类型

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::state::SessionRecord;
use crate::core::HiveError;
use crate::todo::TodoList;

/// 快照创建原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotTrigger {
    Manual,
    /// 发起检查点之前
    Checkpoint,
    /// 每完成 N 步自动创建
    Auto,
}

impl fmt::Display for SnapshotTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Manual => write!(f, "manual"),
            Self::Checkpoint => write!(f, "checkpoint"),
            Self::Auto => write!(f, "auto"),
        }
    }
}

impl FromStr for SnapshotTrigger {
    type Err = HiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "checkpoint" => Ok(Self::Checkpoint),
            "auto" => Ok(Self::Auto),
            other => Err(HiveError::Validation(format!(
                "unknown snapshot trigger: {other}"
            ))),
        }
    }
}

/// 被捕获的会话完整状态：会话记录（游标、进度、配置、暂停标记）+ Todo List
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotState {
    pub session: SessionRecord,
    pub todo_list: Option<TodoList>,
}

impl SnapshotState {
    /// 游标在计划中的下标；计划已结束时为条目数
    pub fn step_index(&self) -> usize {
        let Some(list) = &self.todo_list else {
            return 0;
        };
        self.session
            .current_item_id
            .as_deref()
            .and_then(|id| list.position_of(id))
            .unwrap_or_else(|| {
                list.first_unsettled()
                    .map(|i| i.position)
                    .unwrap_or(list.len())
            })
    }
}

/// 不可变快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub session_id: String,
    pub trigger: SnapshotTrigger,
    pub label: Option<String>,
    pub state: SnapshotState,
    pub created_at: DateTime<Utc>,
}

/// query / count 过滤条件，未设置的字段不参与过滤
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotFilter {
    pub session_id: Option<String>,
    pub trigger: Option<SnapshotTrigger>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl SnapshotFilter {
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Self::default()
        }
    }

    pub fn with_trigger(mut self, trigger: SnapshotTrigger) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, snapshot: &Snapshot) -> bool {
        self.session_id
            .as_deref()
            .map_or(true, |id| snapshot.session_id == id)
            && self.trigger.map_or(true, |t| snapshot.trigger == t)
            && self.since.map_or(true, |since| snapshot.created_at >= since)
            && self.until.map_or(true, |until| snapshot.created_at < until)
    }
}

/// restoreSnapshot 成功结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreOutcome {
    pub snapshot_id: String,
    pub session_id: String,
    pub restored_at: DateTime<Utc>,
    pub step_index: usize,
}
