//! 路由：按分发结果选择下一阶段
//!
//! 两个分支都只通向同一个汇总阶段，分支只影响是否执行过任务，不影响后续控制流拓扑。

use serde::Serialize;

use crate::dispatch::types::{AggregateState, DispatchOutcome, OutcomeKind};

/// 下游阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Summarize,
}

/// 路由结果：目标阶段、分支标签与汇聚（旁路时为空）
#[derive(Clone, Debug, PartialEq)]
pub struct NextStage {
    pub stage: Stage,
    pub kind: OutcomeKind,
    pub aggregate: AggregateState,
}

pub fn route(outcome: DispatchOutcome) -> NextStage {
    let kind = outcome.kind();
    NextStage {
        stage: Stage::Summarize,
        kind,
        aggregate: outcome.into_aggregate(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::types::{ResultRecord, TaskId};

    #[test]
    fn test_route_bypassed() {
        let next = route(DispatchOutcome::Bypassed);
        assert_eq!(next.stage, Stage::Summarize);
        assert_eq!(next.kind, OutcomeKind::Bypassed);
        assert!(next.aggregate.is_empty());
    }

    #[test]
    fn test_route_executed() {
        let agg = AggregateState::single(ResultRecord::success(TaskId(0), "q1", "ok"));
        let next = route(DispatchOutcome::Executed(agg.clone()));
        assert_eq!(next.stage, Stage::Summarize);
        assert_eq!(next.kind, OutcomeKind::Executed);
        assert_eq!(next.aggregate, agg);
    }
}
