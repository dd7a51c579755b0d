//! 目标分解 Oracle
//!
//! 给定目标与模型 id 返回有序计划。LlmGoalOracle 调用 LLM，parse_plan 先尝试 JSON，
//! 再退回解析编号列表（`1. [category] content`）。

use std::sync::Arc;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::HiveError;
use crate::llm::{LlmClient, Message};

/// 未标注分类时使用
pub const DEFAULT_CATEGORY: &str = "general";

/// Oracle 产出的单个计划条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanItem {
    pub content: String,
    #[serde(default = "default_category")]
    pub category: String,
}

fn default_category() -> String {
    DEFAULT_CATEGORY.to_string()
}

impl PlanItem {
    pub fn new(content: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            category: category.into(),
        }
    }
}

/// 分解结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decomposition {
    pub items: Vec<PlanItem>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// 目标分解接口；需可安全重试，任何错误都会使 start 失败
#[async_trait]
pub trait GoalOracle: Send + Sync {
    async fn decompose(
        &self,
        goal: &str,
        model_id: &str,
        context: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Decomposition, HiveError>;
}

/// 解析 LLM 输出为计划
pub fn parse_plan(output: &str) -> Result<Decomposition, HiveError> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Err(HiveError::Oracle("empty response".to_string()));
    }

    if let Some(json_str) = extract_json(trimmed) {
        if let Ok(decomposition) = serde_json::from_str::<Decomposition>(json_str) {
            return Ok(clean(decomposition));
        }
        if let Ok(items) = serde_json::from_str::<Vec<PlanItem>>(json_str) {
            return Ok(clean(Decomposition {
                items,
                warnings: Vec::new(),
            }));
        }
    }

    let items: Vec<PlanItem> = trimmed.lines().filter_map(parse_list_line).collect();
    if items.is_empty() {
        return Err(HiveError::Oracle(format!(
            "no plan items found in response: {}",
            preview(trimmed)
        )));
    }
    Ok(Decomposition {
        items,
        warnings: vec!["plan parsed from plain-text list".to_string()],
    })
}

/// ```json ... ``` 代码块，或第一个 [ / { 到最后一个 ] / }
fn extract_json(text: &str) -> Option<&str> {
    if let Some(start) = text.find("```json") {
        let rest = &text[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = text.find(|c: char| c == '[' || c == '{')?;
    let end = text.rfind(|c: char| c == ']' || c == '}')?;
    (end > start).then(|| &text[start..=end])
}

fn list_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(?:\d+[.)]|[-*])\s+(?:\[([A-Za-z0-9_\-]+)\]\s*)?(.+?)\s*$")
            .expect("valid list regex")
    })
}

fn parse_list_line(line: &str) -> Option<PlanItem> {
    let caps = list_line_regex().captures(line)?;
    let content = caps.get(2)?.as_str().to_string();
    let category = caps
        .get(1)
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(default_category);
    Some(PlanItem { content, category })
}

fn clean(mut decomposition: Decomposition) -> Decomposition {
    let before = decomposition.items.len();
    decomposition.items.retain(|i| !i.content.trim().is_empty());
    for item in &mut decomposition.items {
        item.content = item.content.trim().to_string();
        if item.category.trim().is_empty() {
            item.category = default_category();
        }
    }
    if decomposition.items.len() < before {
        decomposition
            .warnings
            .push(format!("{} empty plan items dropped", before - decomposition.items.len()));
    }
    decomposition
}

fn preview(s: &str) -> String {
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s.to_string()
    }
}

const DEFAULT_PLANNER_PROMPT: &str = "You decompose a user's goal into an ordered list of concrete steps. \
Reply with JSON only: {\"items\": [{\"content\": \"...\", \"category\": \"...\"}], \"warnings\": []}. \
Use category \"resource_selection\" for steps that choose datasets, models or other resources, \
otherwise a short snake_case category.";

/// 基于 LLM 的目标分解
pub struct LlmGoalOracle {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
}

impl LlmGoalOracle {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            system_prompt: DEFAULT_PLANNER_PROMPT.to_string(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }
}

#[async_trait]
impl GoalOracle for LlmGoalOracle {
    async fn decompose(
        &self,
        goal: &str,
        model_id: &str,
        context: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Decomposition, HiveError> {
        let mut user = format!("Goal: {goal}");
        if !context.is_empty() {
            user.push_str(&format!(
                "\n\nContext:\n{}",
                serde_json::Value::Object(context.clone())
            ));
        }
        let messages = [Message::system(self.system_prompt.clone()), Message::user(user)];
        let output = self
            .llm
            .complete_with_model(&messages, model_id)
            .await
            .map_err(HiveError::Oracle)?;
        let decomposition = parse_plan(&output)?;
        let (_, _, total_tokens) = self.llm.token_usage();
        tracing::debug!(
            model_id,
            items = decomposition.items.len(),
            total_tokens,
            "goal decomposed"
        );
        Ok(decomposition)
    }
}
