//! LLM 层：客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock），供默认 Oracle 与执行器使用

pub mod message;
pub mod mock;
pub mod openai;
pub mod traits;

pub use message::{Message, Role};
pub use mock::MockLlmClient;
pub use openai::{OpenAiClient, TokenUsage, DEEPSEEK_BASE_URL, DEEPSEEK_CHAT};
pub use traits::LlmClient;
