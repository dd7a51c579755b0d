//! 编排核心错误类型
//!
//! 分为：参数校验、状态冲突、资源不存在、外部协作者失败（Oracle / 执行器）、存储与内部错误。
//! 所有变更型操作返回错误时均不修改会话状态。

use thiserror::Error;

use crate::core::SessionStatus;

/// 编排核心对外暴露的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HiveError {
    /// 缺失或非法的必填参数（如拒绝检查点时 reason 为空）
    #[error("Validation error: {0}")]
    Validation(String),

    /// 当前状态不允许该操作
    #[error("Invalid state for {op}: {detail}")]
    StateConflict { op: &'static str, detail: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// 目标分解失败（start 视为终止性错误，不自动重试）
    #[error("Goal decomposition failed: {0}")]
    Oracle(String),

    #[error("Step execution failed: {0}")]
    Executor(String),

    #[error("Storage error: {0}")]
    Storage(String),

    /// 会话 actor 已退出（被 delete 或进程关闭）
    #[error("Agent loop closed: {0}")]
    LoopClosed(String),
}

impl HiveError {
    pub fn conflict(op: &'static str, status: SessionStatus) -> Self {
        Self::StateConflict {
            op,
            detail: format!("session is {status}"),
        }
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// 外部协作者失败可以重试，其余错误立即失败
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Executor(_))
    }
}

impl From<serde_json::Error> for HiveError {
    fn from(e: serde_json::Error) -> Self {
        Self::Storage(format!("serialization: {e}"))
    }
}

#[cfg(feature = "async-sqlite")]
impl From<sqlx::Error> for HiveError {
    fn from(e: sqlx::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

pub type HiveResult<T> = Result<T, HiveError>;
