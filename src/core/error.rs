//! 错误类型
//!
//! 三层错误：
//! - `WorkError`：单个任务的工作单元失败，在 Worker 边界被转为 Failure 记录，不向上传播
//! - `DispatchError`：一轮分发的结构性不变量被破坏（记录数不符、重复记录），整轮中止
//! - `AgentError`：流水线层错误（规划、LLM、汇总、配置），包含 DispatchError

use thiserror::Error;

use crate::dispatch::TaskId;

/// 工作单元执行失败（超时、输入格式错误、下游故障等）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkError {
    #[error("Work timed out after {0} ms")]
    Timeout(u64),

    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Downstream fault: {0}")]
    Downstream(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("{0}")]
    Other(String),
}

impl From<String> for WorkError {
    fn from(msg: String) -> Self {
        WorkError::Other(msg)
    }
}

impl From<&str> for WorkError {
    fn from(msg: &str) -> Self {
        WorkError::Other(msg.to_string())
    }
}

/// 分发轮次的结构性错误：出现即说明 Dispatcher 有 bug，而不是可恢复的运行时状况
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Record count mismatch: dispatched {expected} tasks, joined {actual} records")]
    RecordCountMismatch { expected: usize, actual: usize },

    #[error("Duplicate record for task {0}")]
    DuplicateRecord(TaskId),

    #[error("Record for unknown task {0}")]
    UnknownTask(TaskId),
}

/// 流水线运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Planning failed: {0}")]
    PlanningFailed(String),

    #[error("JSON parse error: {0}")]
    JsonParseError(String),

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Summary failed: {0}")]
    SummaryFailed(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Dispatch aborted: {0}")]
    Dispatch(#[from] DispatchError),
}

impl From<config::ConfigError> for AgentError {
    fn from(e: config::ConfigError) -> Self {
        AgentError::ConfigError(e.to_string())
    }
}
