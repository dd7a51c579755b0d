//! Todo List 模型
//!
//! 条目按 position 顺序执行；状态沿执行顺序单调：前面仍有 pending 条目时，
//! 后面的条目不能进入 in_progress / completed（被拒绝或恢复时显式跳过的 skipped 除外）。

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::HiveError;
use crate::plan::PlanItem;

/// Todo 项状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
    /// 被检查点拒绝或恢复流程显式跳过
    Skipped,
}

impl TodoStatus {
    /// 已结束（不会再被执行）
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

impl fmt::Display for TodoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// 单个计划步骤
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: String,
    pub content: String,
    pub status: TodoStatus,
    /// 自由分类，检查点策略据此判断是否需要审批（如 "resource_selection"）
    pub category: String,
    pub position: usize,
}

/// 有序计划
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoList {
    pub id: String,
    pub session_id: String,
    pub goal: String,
    pub model_id: String,
    pub items: Vec<TodoItem>,
    /// Oracle 返回的提示信息
    #[serde(default)]
    pub warnings: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TodoList {
    pub fn from_plan(
        session_id: impl Into<String>,
        goal: impl Into<String>,
        model_id: impl Into<String>,
        plan: Vec<PlanItem>,
        warnings: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        let items = plan
            .into_iter()
            .enumerate()
            .map(|(position, p)| TodoItem {
                id: format!("item_{}", uuid::Uuid::new_v4()),
                content: p.content,
                status: TodoStatus::Pending,
                category: p.category,
                position,
            })
            .collect();
        Self {
            id: format!("plan_{}", uuid::Uuid::new_v4()),
            session_id: session_id.into(),
            goal: goal.into(),
            model_id: model_id.into(),
            items,
            warnings,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, item_id: &str) -> Option<&TodoItem> {
        self.items.iter().find(|i| i.id == item_id)
    }

    pub fn position_of(&self, item_id: &str) -> Option<usize> {
        self.items.iter().position(|i| i.id == item_id)
    }

    /// 按执行顺序的第一个 pending 条目
    pub fn next_pending(&self) -> Option<&TodoItem> {
        self.items.iter().find(|i| i.status == TodoStatus::Pending)
    }

    /// 第一个尚未结束的条目（pending / in_progress），用于重建游标
    pub fn first_unsettled(&self) -> Option<&TodoItem> {
        self.items.iter().find(|i| !i.status.is_settled())
    }

    pub fn completed_count(&self) -> usize {
        self.items
            .iter()
            .filter(|i| i.status == TodoStatus::Completed)
            .count()
    }

    /// ⌊completed / total × 100⌋，空计划为 0
    pub fn progress(&self) -> u8 {
        if self.items.is_empty() {
            return 0;
        }
        (self.completed_count() * 100 / self.items.len()) as u8
    }

    /// 所有条目都已 completed / skipped
    pub fn is_finished(&self) -> bool {
        !self.items.is_empty() && self.items.iter().all(|i| i.status.is_settled())
    }

    /// pending → in_progress
    pub fn start_item(&mut self, item_id: &str) -> Result<(), HiveError> {
        let idx = self.ordered_index(item_id, "start_item")?;
        self.transition(idx, "start_item", &[TodoStatus::Pending], TodoStatus::InProgress)
    }

    /// pending / in_progress → completed
    pub fn complete_item(&mut self, item_id: &str) -> Result<(), HiveError> {
        let idx = self.ordered_index(item_id, "complete_item")?;
        self.transition(
            idx,
            "complete_item",
            &[TodoStatus::Pending, TodoStatus::InProgress],
            TodoStatus::Completed,
        )
    }

    /// pending / in_progress → skipped（检查点拒绝或恢复时显式跳过）
    pub fn skip_item(&mut self, item_id: &str) -> Result<(), HiveError> {
        let idx = self.index_of(item_id)?;
        self.transition(
            idx,
            "skip_item",
            &[TodoStatus::Pending, TodoStatus::InProgress],
            TodoStatus::Skipped,
        )
    }

    /// in_progress / skipped → pending（执行失败回滚或拒绝后重试）
    pub fn reset_item(&mut self, item_id: &str) -> Result<(), HiveError> {
        let idx = self.index_of(item_id)?;
        self.transition(
            idx,
            "reset_item",
            &[TodoStatus::InProgress, TodoStatus::Skipped, TodoStatus::Pending],
            TodoStatus::Pending,
        )
    }

    /// 从外部计划重建时，将中断遗留的 in_progress 条目退回 pending；返回回退数量
    pub fn normalize_interrupted(&mut self) -> usize {
        let mut reset = 0;
        for item in &mut self.items {
            if item.status == TodoStatus::InProgress {
                item.status = TodoStatus::Pending;
                reset += 1;
            }
        }
        if reset > 0 {
            self.updated_at = Utc::now();
        }
        reset
    }

    fn index_of(&self, item_id: &str) -> Result<usize, HiveError> {
        self.position_of(item_id)
            .ok_or_else(|| HiveError::not_found("todo item", item_id))
    }

    /// 查找下标并检查单调性：之前不得存在 pending 条目
    fn ordered_index(&self, item_id: &str, op: &'static str) -> Result<usize, HiveError> {
        let idx = self.index_of(item_id)?;
        if let Some(earlier) = self.items[..idx]
            .iter()
            .find(|i| i.status == TodoStatus::Pending)
        {
            return Err(HiveError::StateConflict {
                op,
                detail: format!(
                    "item {} is still pending before {}",
                    earlier.id, item_id
                ),
            });
        }
        Ok(idx)
    }

    fn transition(
        &mut self,
        idx: usize,
        op: &'static str,
        from: &[TodoStatus],
        to: TodoStatus,
    ) -> Result<(), HiveError> {
        let item = &mut self.items[idx];
        if !from.contains(&item.status) {
            return Err(HiveError::StateConflict {
                op,
                detail: format!("item {} is {}", item.id, item.status),
            });
        }
        item.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(n: usize) -> TodoList {
        let items = (0..n)
            .map(|i| PlanItem::new(format!("step {i}"), "general"))
            .collect();
        TodoList::from_plan("s1", "goal", "m1", items, vec![])
    }

    #[test]
    fn test_progress_is_floored() {
        let mut list = plan(3);
        assert_eq!(list.progress(), 0);
        let first = list.items[0].id.clone();
        list.complete_item(&first).unwrap();
        assert_eq!(list.progress(), 33);
        let second = list.items[1].id.clone();
        list.complete_item(&second).unwrap();
        assert_eq!(list.progress(), 66);
        let third = list.items[2].id.clone();
        list.complete_item(&third).unwrap();
        assert_eq!(list.progress(), 100);
        assert!(list.is_finished());
    }

    #[test]
    fn test_empty_plan_progress_is_zero() {
        let list = plan(0);
        assert_eq!(list.progress(), 0);
        assert!(!list.is_finished());
        assert!(list.next_pending().is_none());
    }

    #[test]
    fn test_cannot_start_out_of_order() {
        let mut list = plan(2);
        let second = list.items[1].id.clone();
        let err = list.start_item(&second).unwrap_err();
        assert!(matches!(err, HiveError::StateConflict { .. }));
        assert_eq!(list.items[1].status, TodoStatus::Pending);
    }

    #[test]
    fn test_skipped_items_unblock_later_items() {
        let mut list = plan(2);
        let first = list.items[0].id.clone();
        let second = list.items[1].id.clone();
        list.skip_item(&first).unwrap();
        list.start_item(&second).unwrap();
        list.complete_item(&second).unwrap();
        assert_eq!(list.progress(), 50);
        assert!(list.is_finished());
    }

    #[test]
    fn test_normalize_interrupted_resets_in_progress() {
        let mut list = plan(2);
        let first = list.items[0].id.clone();
        list.start_item(&first).unwrap();
        assert_eq!(list.normalize_interrupted(), 1);
        assert_eq!(list.next_pending().map(|i| i.id.as_str()), Some(first.as_str()));
    }

    #[test]
    fn test_unknown_item_is_not_found() {
        let mut list = plan(1);
        assert!(matches!(
            list.complete_item("nope"),
            Err(HiveError::NotFound { .. })
        ));
    }
}
