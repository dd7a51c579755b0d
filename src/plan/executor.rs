//! 单步执行器
//!
//! StepExecutor 执行一个 Todo 项并返回成功 / 失败，不直接修改 Todo List，由 Agent Loop 应用结果。
//! execute_with_audit 对每次尝试施加超时，并输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::time::timeout;

use crate::llm::{LlmClient, Message};
use crate::todo::TodoItem;

/// 执行时提供给执行器的会话上下文（只读）
#[derive(Debug, Clone)]
pub struct StepContext {
    pub session_id: String,
    pub goal: Option<String>,
    pub model_id: Option<String>,
    /// 会话 config.context，审批反馈以 checkpoint_feedback 键注入
    pub context: serde_json::Map<String, serde_json::Value>,
    /// 当前尝试次数（从 1 开始）
    pub attempt: u32,
}

/// 执行结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepResult {
    pub success: bool,
    pub error: Option<String>,
    pub output: Option<String>,
}

impl StepResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            error: None,
            output: Some(output.into()),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            output: None,
        }
    }
}

#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, item: &TodoItem, ctx: &StepContext) -> StepResult;
}

/// 在超时内执行一次尝试；超时视为失败。输出 JSON 审计日志
pub(crate) async fn execute_with_audit(
    executor: &dyn StepExecutor,
    item: &TodoItem,
    ctx: &StepContext,
    limit: Duration,
) -> StepResult {
    let start = Instant::now();
    let result = match timeout(limit, executor.execute(item, ctx)).await {
        Ok(result) => result,
        Err(_) => StepResult::failed(format!("step timed out after {}s", limit.as_secs())),
    };

    let audit = serde_json::json!({
        "event": "step_audit",
        "session_id": ctx.session_id,
        "item_id": item.id,
        "category": item.category,
        "attempt": ctx.attempt,
        "ok": result.success,
        "error": result.error,
        "duration_ms": start.elapsed().as_millis() as u64,
    });
    tracing::info!(audit = %audit.to_string(), "step");
    result
}

const DEFAULT_EXECUTOR_PROMPT: &str = "You carry out one step of a larger plan. \
Do the step and reply with a short result. If the step cannot be done, reply with a single line \
starting with FAILED: followed by the reason.";

/// 基于 LLM 的执行器：空回复或以 FAILED: 开头视为失败
pub struct LlmStepExecutor {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
}

impl LlmStepExecutor {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            system_prompt: DEFAULT_EXECUTOR_PROMPT.to_string(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    fn build_messages(&self, item: &TodoItem, ctx: &StepContext) -> Vec<Message> {
        let mut user = String::new();
        if let Some(goal) = &ctx.goal {
            user.push_str(&format!("## Goal\n{goal}\n\n"));
        }
        user.push_str(&format!(
            "## Step {} ({})\n{}\n",
            item.position + 1,
            item.category,
            item.content
        ));
        if !ctx.context.is_empty() {
            user.push_str(&format!(
                "\n## Context\n{}\n",
                serde_json::Value::Object(ctx.context.clone())
            ));
        }
        vec![Message::system(self.system_prompt.clone()), Message::user(user)]
    }
}

#[async_trait]
impl StepExecutor for LlmStepExecutor {
    async fn execute(&self, item: &TodoItem, ctx: &StepContext) -> StepResult {
        let messages = self.build_messages(item, ctx);
        let reply = match &ctx.model_id {
            Some(model) => self.llm.complete_with_model(&messages, model).await,
            None => self.llm.complete(&messages).await,
        };
        let (_, _, total_tokens) = self.llm.token_usage();
        tracing::debug!(item_id = %item.id, attempt = ctx.attempt, total_tokens, "step reply received");
        match reply {
            Ok(text) => {
                let text = text.trim();
                if text.is_empty() {
                    StepResult::failed("empty response")
                } else if let Some(reason) = text.strip_prefix("FAILED:") {
                    StepResult::failed(reason.trim())
                } else {
                    StepResult::ok(text)
                }
            }
            Err(e) => StepResult::failed(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::todo::TodoStatus;

    fn item() -> TodoItem {
        TodoItem {
            id: "item_1".to_string(),
            content: "summarize findings".to_string(),
            status: TodoStatus::InProgress,
            category: "writing".to_string(),
            position: 0,
        }
    }

    fn ctx() -> StepContext {
        StepContext {
            session_id: "s1".to_string(),
            goal: Some("build a report".to_string()),
            model_id: None,
            context: serde_json::Map::new(),
            attempt: 1,
        }
    }

    struct SlowExecutor;

    #[async_trait]
    impl StepExecutor for SlowExecutor {
        async fn execute(&self, _item: &TodoItem, _ctx: &StepContext) -> StepResult {
            tokio::time::sleep(Duration::from_secs(5)).await;
            StepResult::ok("late")
        }
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let result =
            execute_with_audit(&SlowExecutor, &item(), &ctx(), Duration::from_millis(20)).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_llm_executor_succeeds_on_reply() {
        let executor = LlmStepExecutor::new(Arc::new(MockLlmClient::default()));
        let result = executor.execute(&item(), &ctx()).await;
        assert!(result.success);
        assert!(result.output.unwrap().contains("summarize findings"));
    }

    #[tokio::test]
    async fn test_llm_executor_failed_prefix() {
        let llm = Arc::new(MockLlmClient::scripted(vec!["FAILED: no data source".to_string()]));
        let executor = LlmStepExecutor::new(llm);
        let result = executor.execute(&item(), &ctx()).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("no data source"));
    }
}
