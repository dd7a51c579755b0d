//! 人工审批检查点：类型、触发策略与账本
//!
//! 过期在读取时惰性计算，不存在后台清扫任务。

pub mod ledger;
pub mod policy;
pub mod types;

pub use ledger::CheckpointLedger;
pub use policy::{CheckpointPolicy, RejectPolicy};
pub use types::{
    Checkpoint, CheckpointOption, CheckpointStatus, CheckpointView, Decision, Resolution,
};
