//! 会话监管：生命周期、中断管理
//!
//! 持有 CancellationToken，Registry 删除会话时取消 actor 与进行中的重试等待；
//! pause_requested 在命令入队时立即置位，自动运行模式据此不再发起新的一步。

use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;

/// 会话级生命周期管理：取消令牌与暂停请求
#[derive(Debug)]
pub struct SessionSupervisor {
    /// delete / shutdown 时触发
    cancel_token: CancellationToken,
    pause_requested: AtomicBool,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            pause_requested: AtomicBool::new(false),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    pub fn request_pause(&self) {
        self.pause_requested.store(true, Ordering::SeqCst);
    }

    /// actor 处理完 Pause 命令后清除
    pub fn clear_pause_request(&self) {
        self.pause_requested.store(false, Ordering::SeqCst);
    }

    pub fn pause_requested(&self) -> bool {
        self.pause_requested.load(Ordering::SeqCst)
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
