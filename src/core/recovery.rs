//! 单步失败恢复策略
//!
//! 根据错误类型与已尝试次数返回 RecoveryAction：在 max_retries 内等待 step_delay 后重试，否则失败。

use std::time::Duration;

use crate::core::{HiveError, SessionConfig};

/// 单步失败后的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 等待给定时长后重试同一 Todo 项
    RetryAfter(Duration),
    /// 终止：会话进入 failed
    Fail(String),
}

#[derive(Debug, Clone)]
pub struct RecoveryEngine {
    max_retries: u32,
    step_delay: Duration,
}

impl RecoveryEngine {
    pub fn new(max_retries: u32, step_delay: Duration) -> Self {
        Self {
            max_retries,
            step_delay,
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.max_retries, config.step_delay())
    }

    /// 最多执行次数（首次 + 重试）
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// `attempt` 为已执行次数（从 1 开始）
    pub fn handle(&self, err: &HiveError, attempt: u32) -> RecoveryAction {
        if !err.is_retryable() {
            return RecoveryAction::Fail(err.to_string());
        }
        if attempt <= self.max_retries {
            RecoveryAction::RetryAfter(self.step_delay)
        } else {
            RecoveryAction::Fail(format!("{err} (after {attempt} attempts)"))
        }
    }
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::from_config(&SessionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovery_retries_within_budget() {
        let engine = RecoveryEngine::new(2, Duration::from_millis(10));
        let err = HiveError::Executor("boom".to_string());
        assert_eq!(
            engine.handle(&err, 1),
            RecoveryAction::RetryAfter(Duration::from_millis(10))
        );
        assert_eq!(
            engine.handle(&err, 2),
            RecoveryAction::RetryAfter(Duration::from_millis(10))
        );
        match engine.handle(&err, 3) {
            RecoveryAction::Fail(msg) => assert!(msg.contains("boom")),
            other => panic!("Expected Fail, got {other:?}"),
        }
    }

    #[test]
    fn test_recovery_zero_retries() {
        let engine = RecoveryEngine::new(0, Duration::ZERO);
        assert_eq!(engine.max_attempts(), 1);
        let err = HiveError::Executor("x".to_string());
        assert!(matches!(engine.handle(&err, 1), RecoveryAction::Fail(_)));
    }

    #[test]
    fn test_recovery_storage_error_not_retried() {
        let engine = RecoveryEngine::new(5, Duration::ZERO);
        let err = HiveError::Storage("disk full".to_string());
        assert!(matches!(engine.handle(&err, 1), RecoveryAction::Fail(_)));
    }
}
