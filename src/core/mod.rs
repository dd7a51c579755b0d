//! 核心编排层：错误与恢复、会话状态、会话监管、Agent Loop 与会话注册表

pub mod agent_loop;
pub mod builder;
pub mod error;
pub mod recovery;
pub mod registry;
pub mod session_supervisor;
pub mod shutdown;
pub mod state;

pub use agent_loop::{
    AgentLoop, AgentLoopHandle, LoopEvent, LoopServices, LoopState, ResolveOutcome, StartOptions,
    StartOutcome, StepOutcome,
};
pub use builder::{create_hive_builder, create_llm_from_config, HiveBuilder, HiveRuntime};
pub use error::{HiveError, HiveResult};
pub use recovery::{RecoveryAction, RecoveryEngine};
pub use registry::SessionRegistry;
pub use session_supervisor::SessionSupervisor;
pub use shutdown::{ShutdownManager, ShutdownReason};
pub use state::{SessionConfig, SessionStatus, StatusView};
