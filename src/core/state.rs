//! 状态定义：分发轮次的阶段与阶段投影
//!
//! 一轮的状态机：Idle → Planning → {Bypassed | Dispatching} → Joined → Aggregated → Routed → Done。
//! 阶段通过 watch 通道发布，观察者只看到最新阶段。

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;

/// 分发轮次阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RoundPhase {
    Idle,
    /// 外部规划阶段生成工作描述
    Planning,
    /// 零描述，跳过分发
    Bypassed,
    /// 任务已提交，等待全部落定
    Dispatching,
    /// 所有任务已到达终态
    Joined,
    Aggregated,
    Routed,
    Done,
    /// 轮次因结构性错误或规划/汇总失败而中止
    Error,
}

impl RoundPhase {
    /// 是否为终止阶段
    pub fn is_terminal(&self) -> bool {
        matches!(self, RoundPhase::Done | RoundPhase::Error)
    }
}

/// 阶段发布器；未接入观察者时为空操作
#[derive(Clone, Debug, Default)]
pub struct PhaseReporter {
    tx: Option<Arc<watch::Sender<RoundPhase>>>,
}

impl PhaseReporter {
    pub fn new(tx: Arc<watch::Sender<RoundPhase>>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn report(&self, phase: RoundPhase) {
        tracing::debug!(?phase, "round phase");
        if let Some(tx) = &self.tx {
            tx.send_replace(phase);
        }
    }
}
