//! 检查点触发策略
//!
//! 哪些分类需要审批、默认有效期、拒绝后的下一步，全部显式配置。
//! 过期检查点始终保持阻塞，直到显式 approve / reject。

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointOption;
use crate::config::CheckpointSection;
use crate::todo::TodoItem;

/// 拒绝检查点后的下一步
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectPolicy {
    /// 条目标记 skipped，下一步执行后续 pending 条目
    #[default]
    SkipForward,
    /// 条目退回 pending，下一步重新为同一条目发起审批
    RetryItem,
}

#[derive(Debug, Clone)]
pub struct CheckpointPolicy {
    gated_categories: HashSet<String>,
    pub ttl: Option<Duration>,
    pub reject_policy: RejectPolicy,
    /// 发起检查点前自动创建 trigger=checkpoint 的快照
    pub snapshot_before_checkpoint: bool,
}

impl CheckpointPolicy {
    pub fn new<I, S>(gated_categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            gated_categories: gated_categories.into_iter().map(Into::into).collect(),
            ttl: None,
            reject_policy: RejectPolicy::default(),
            snapshot_before_checkpoint: true,
        }
    }

    pub fn from_config(section: &CheckpointSection) -> Self {
        Self {
            gated_categories: section.gated_categories.iter().cloned().collect(),
            ttl: section.ttl_secs.map(Duration::from_secs),
            reject_policy: section.reject_policy,
            snapshot_before_checkpoint: section.snapshot_before_checkpoint,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_reject_policy(mut self, policy: RejectPolicy) -> Self {
        self.reject_policy = policy;
        self
    }

    pub fn with_snapshot_before_checkpoint(mut self, enabled: bool) -> Self {
        self.snapshot_before_checkpoint = enabled;
        self
    }

    /// 分类比较忽略大小写
    pub fn gates(&self, item: &TodoItem) -> bool {
        let category = item.category.trim().to_lowercase();
        self.gated_categories
            .iter()
            .any(|c| c.trim().to_lowercase() == category)
    }

    pub fn reason_for(&self, item: &TodoItem) -> String {
        format!(
            "Step {} is classified as '{}' and requires approval",
            item.position + 1,
            item.category
        )
    }

    pub fn preview_for(&self, item: &TodoItem, goal: Option<&str>) -> serde_json::Value {
        serde_json::json!({
            "item_id": item.id,
            "position": item.position,
            "content": item.content,
            "category": item.category,
            "goal": goal,
        })
    }

    pub fn options_for(&self, _item: &TodoItem) -> Vec<CheckpointOption> {
        let reject_hint = match self.reject_policy {
            RejectPolicy::SkipForward => "Skip this step and continue with the next one",
            RejectPolicy::RetryItem => "Keep this step pending and ask again on the next step",
        };
        vec![
            CheckpointOption::new("approve", "Approve").with_description("Execute this step"),
            CheckpointOption::new("reject", "Reject").with_description(reject_hint),
        ]
    }
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self::from_config(&CheckpointSection::default())
    }
}
