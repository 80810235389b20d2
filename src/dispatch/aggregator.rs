//! 结果汇聚
//!
//! 以结合律的拼接规则把一轮的全部终态记录合并为 AggregateState，不做任何过滤。

use std::collections::HashSet;

use crate::core::DispatchError;
use crate::dispatch::types::{AggregateState, ResultRecord};

/// 合并记录；顺序即完成顺序
pub fn aggregate<I>(records: I) -> AggregateState
where
    I: IntoIterator<Item = ResultRecord>,
{
    records
        .into_iter()
        .map(AggregateState::single)
        .fold(AggregateState::empty(), AggregateState::merge)
}

/// 校验汇聚完整性：记录数等于分发数，且每个任务只出现一次
pub fn verify_complete(aggregate: &AggregateState, dispatched: usize) -> Result<(), DispatchError> {
    let mut seen = HashSet::with_capacity(aggregate.len());
    for record in aggregate.records() {
        if !seen.insert(record.task_id()) {
            return Err(DispatchError::DuplicateRecord(record.task_id()));
        }
    }
    if aggregate.len() != dispatched {
        return Err(DispatchError::RecordCountMismatch {
            expected: dispatched,
            actual: aggregate.len(),
        });
    }
    Ok(())
}
