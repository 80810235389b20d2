//! 分发引擎类型定义
//!
//! 定义工作描述、广播上下文、隔离任务、结果记录、汇聚状态与分发结果等核心数据类型

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// 任务 ID：描述在本轮中的序号（从 0 开始），是描述与结果记录之间一一对应的键
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct TaskId(pub usize);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 一个独立的工作单元描述（如一条已实例化的查询），创建后不可变
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkDescriptor {
    payload: String,
}

impl WorkDescriptor {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub(crate) fn into_payload(self) -> String {
        self.payload
    }
}

impl From<&str> for WorkDescriptor {
    fn from(payload: &str) -> Self {
        Self::new(payload)
    }
}

impl From<String> for WorkDescriptor {
    fn from(payload: String) -> Self {
        Self::new(payload)
    }
}

/// 广播上下文：一轮分发中所有任务共享的只读字段（标识、开关等）
///
/// 构建完成后只暴露 `&self` 访问器；每个任务拿到的是一份值拷贝。
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BroadcastContext {
    fields: BTreeMap<String, serde_json::Value>,
}

impl BroadcastContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加字段（构建期使用）
    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.fields.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(|v| v.as_str())
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// 隔离任务：一个描述的 payload 加上广播上下文的独立拷贝，由执行它的 Worker 独占
#[derive(Clone, Debug, PartialEq)]
pub struct IsolatedTask {
    pub id: TaskId,
    pub payload: String,
    pub context: BroadcastContext,
}

/// 失败类别
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// 工作单元返回错误
    Work,
    /// 超过单任务超时
    Timeout,
    /// 工作单元 panic 或 Worker 异常终止
    Panicked,
    /// 轮次被取消（未启动，或宽限期内未停止）
    Cancelled,
}

/// 单个任务的终态结果；每个已分发任务恰好一条
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResultRecord {
    Success {
        task_id: TaskId,
        payload: String,
        output: String,
    },
    Failure {
        task_id: TaskId,
        payload: String,
        kind: FailureKind,
        error: String,
        /// 失败计数（本任务一次失败即为 1），汇聚时累加
        error_count: u32,
    },
}

impl ResultRecord {
    pub fn success(task_id: TaskId, payload: impl Into<String>, output: impl Into<String>) -> Self {
        ResultRecord::Success {
            task_id,
            payload: payload.into(),
            output: output.into(),
        }
    }

    pub fn failure(
        task_id: TaskId,
        payload: impl Into<String>,
        kind: FailureKind,
        error: impl Into<String>,
    ) -> Self {
        ResultRecord::Failure {
            task_id,
            payload: payload.into(),
            kind,
            error: error.into(),
            error_count: 1,
        }
    }

    pub fn task_id(&self) -> TaskId {
        match self {
            ResultRecord::Success { task_id, .. } | ResultRecord::Failure { task_id, .. } => *task_id,
        }
    }

    pub fn payload(&self) -> &str {
        match self {
            ResultRecord::Success { payload, .. } | ResultRecord::Failure { payload, .. } => payload,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ResultRecord::Success { .. })
    }

    pub fn error_count(&self) -> u32 {
        match self {
            ResultRecord::Success { .. } => 0,
            ResultRecord::Failure { error_count, .. } => *error_count,
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            ResultRecord::Success { .. } => None,
            ResultRecord::Failure { kind, .. } => Some(*kind),
        }
    }
}

/// 一轮分发所有结果的汇聚；记录按完成顺序排列，顺序不具备语义
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateState {
    records: Vec<ResultRecord>,
    error_count: u32,
}

impl AggregateState {
    pub fn empty() -> Self {
        Self::default()
    }

    /// 单条记录构成的汇聚
    pub fn single(record: ResultRecord) -> Self {
        Self {
            error_count: record.error_count(),
            records: vec![record],
        }
    }

    /// 结合律合并：记录拼接，失败计数相加
    pub fn merge(mut self, other: AggregateState) -> Self {
        self.records.extend(other.records);
        self.error_count += other.error_count;
        self
    }

    pub fn records(&self) -> &[ResultRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<ResultRecord> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn successes(&self) -> impl Iterator<Item = &ResultRecord> {
        self.records.iter().filter(|r| r.is_success())
    }

    pub fn failures(&self) -> impl Iterator<Item = &ResultRecord> {
        self.records.iter().filter(|r| !r.is_success())
    }

    pub fn success_count(&self) -> usize {
        self.successes().count()
    }

    pub fn failure_count(&self) -> usize {
        self.failures().count()
    }

    /// 累计失败计数
    pub fn error_count(&self) -> u32 {
        self.error_count
    }
}

/// 分发结果：零描述时旁路，否则携带完整汇聚
#[derive(Clone, Debug, PartialEq)]
pub enum DispatchOutcome {
    Bypassed,
    Executed(AggregateState),
}

impl DispatchOutcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            DispatchOutcome::Bypassed => OutcomeKind::Bypassed,
            DispatchOutcome::Executed(_) => OutcomeKind::Executed,
        }
    }

    pub fn is_bypassed(&self) -> bool {
        matches!(self, DispatchOutcome::Bypassed)
    }

    /// 取出汇聚（旁路时为空）
    pub fn into_aggregate(self) -> AggregateState {
        match self {
            DispatchOutcome::Bypassed => AggregateState::empty(),
            DispatchOutcome::Executed(aggregate) => aggregate,
        }
    }
}

/// 交给下游的分支标签，用于区分「没做任何工作」与「做了但全部失败」
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Bypassed,
    Executed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_record_counts_once() {
        let record = ResultRecord::failure(TaskId(1), "q2", FailureKind::Work, "boom");
        assert_eq!(record.error_count(), 1);
        assert_eq!(record.failure_kind(), Some(FailureKind::Work));
        assert!(!record.is_success());
    }

    #[test]
    fn test_merge_sums_error_counts() {
        let a = AggregateState::single(ResultRecord::success(TaskId(0), "q1", "ok"));
        let b = AggregateState::single(ResultRecord::failure(TaskId(1), "q2", FailureKind::Timeout, "slow"));
        let c = AggregateState::single(ResultRecord::failure(TaskId(2), "q3", FailureKind::Work, "bad"));

        let left = a.clone().merge(b.clone()).merge(c.clone());
        let right = a.merge(b.merge(c));

        assert_eq!(left, right);
        assert_eq!(left.len(), 3);
        assert_eq!(left.error_count(), 2);
        assert_eq!(left.success_count(), 1);
        assert_eq!(left.failure_count(), 2);
    }

    #[test]
    fn test_bypassed_outcome_has_empty_aggregate() {
        let outcome = DispatchOutcome::Bypassed;
        assert_eq!(outcome.kind(), OutcomeKind::Bypassed);
        assert!(outcome.into_aggregate().is_empty());
    }

    #[test]
    fn test_record_serializes_with_status_tag() {
        let record = ResultRecord::failure(TaskId(0), "q1", FailureKind::Cancelled, "stopped");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "failure");
        assert_eq!(json["kind"], "cancelled");
        assert_eq!(json["task_id"], 0);
    }

    #[test]
    fn test_context_builder() {
        let ctx = BroadcastContext::new()
            .with("session_id", "s-1")
            .with("verbose", true);
        assert_eq!(ctx.len(), 2);
        assert_eq!(ctx.get_str("session_id"), Some("s-1"));
        assert_eq!(ctx.get("verbose"), Some(&serde_json::json!(true)));
    }
}
