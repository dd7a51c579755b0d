//! Hive - Rust 交互式智能体编排核心
//!
//! 模块划分：
//! - **checkpoint**: 人工审批检查点（账本、策略、惰性过期）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: Agent 主循环（每会话一个 actor）、会话注册表、错误与重试、运行时构建器
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）
//! - **observability**: 日志初始化
//! - **plan**: 目标分解（Oracle）与单步执行器（StepExecutor）
//! - **snapshot**: 会话快照的创建、查询、恢复与清理
//! - **storage**: 持久化抽象（内存 / SQLite）
//! - **todo**: Todo List 计划模型

pub mod checkpoint;
pub mod config;
pub mod core;
pub mod llm;
pub mod observability;
pub mod plan;
pub mod snapshot;
pub mod storage;
pub mod todo;

pub use crate::core::{
    AgentLoopHandle, HiveBuilder, HiveError, HiveRuntime, SessionConfig, SessionRegistry,
    SessionStatus, StatusView,
};
