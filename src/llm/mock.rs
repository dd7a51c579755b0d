//! Mock LLM 客户端（用于测试与离线运行，无需 API）
//!
//! 有预置回复时按顺序返回；否则对 "Goal:" 开头的请求回一个三步 JSON 计划，其余请求回显最后一条 User 消息。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, Message, Role};

#[derive(Debug, Default)]
pub struct MockLlmClient {
    scripted: Mutex<VecDeque<String>>,
}

impl MockLlmClient {
    /// 依次返回给定回复，用完后回到默认行为
    pub fn scripted(replies: Vec<String>) -> Self {
        Self {
            scripted: Mutex::new(replies.into()),
        }
    }

    fn next_scripted(&self) -> Option<String> {
        self.scripted
            .lock()
            .ok()
            .and_then(|mut queue| queue.pop_front())
    }
}

fn mock_plan(goal: &str) -> String {
    serde_json::json!({
        "items": [
            {"content": format!("Select the resources needed for: {goal}"), "category": "resource_selection"},
            {"content": format!("Carry out: {goal}"), "category": "general"},
            {"content": format!("Summarize the outcome of: {goal}"), "category": "writing"},
        ],
        "warnings": ["plan produced by mock LLM"],
    })
    .to_string()
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        if let Some(reply) = self.next_scripted() {
            return Ok(reply);
        }

        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");

        match last_user.strip_prefix("Goal:") {
            Some(rest) => {
                let goal = rest.lines().next().unwrap_or_default().trim();
                Ok(mock_plan(goal))
            }
            None => Ok(format!("Done (mock): {last_user}")),
        }
    }
}
