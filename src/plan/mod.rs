//! 计划层：目标分解 Oracle 与单步执行器（外部协作者接口及基于 LLM 的默认实现）

pub mod executor;
pub mod oracle;

pub use executor::{LlmStepExecutor, StepContext, StepExecutor, StepResult};
pub use oracle::{parse_plan, Decomposition, GoalOracle, LlmGoalOracle, PlanItem};
