//! 分发器
//!
//! 一轮分发：零描述时直接旁路；否则为每个描述构建一个隔离任务并并发提交，
//! 经屏障等待全部落定后汇聚，并校验记录与任务一一对应。分发器自身从不执行工作单元。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::core::{DispatchError, PhaseReporter, RoundPhase};
use crate::dispatch::aggregator::{aggregate, verify_complete};
use crate::dispatch::barrier::{deadline_after, Barrier};
use crate::dispatch::executor::WorkerExecutor;
use crate::dispatch::isolator::isolate_all;
use crate::dispatch::types::*;

const NOT_STARTED: &str = "Cancelled before start";

/// 分发器：持有 Worker 执行器、可选并发上限与轮次超时
pub struct Dispatcher {
    executor: WorkerExecutor,
    /// 并发上限；None 表示不限
    limiter: Option<Arc<Semaphore>>,
    max_concurrency: Option<usize>,
    round_timeout: Option<Duration>,
    phases: PhaseReporter,
}

impl Dispatcher {
    pub(crate) fn new(
        executor: WorkerExecutor,
        max_concurrency: Option<usize>,
        round_timeout: Option<Duration>,
        phases: PhaseReporter,
    ) -> Self {
        Self {
            executor,
            limiter: max_concurrency.map(|n| Arc::new(Semaphore::new(n))),
            max_concurrency,
            round_timeout,
            phases,
        }
    }

    pub fn max_concurrency(&self) -> Option<usize> {
        self.max_concurrency
    }

    /// 分发一轮（不可外部取消，仍受轮次超时约束）
    pub async fn dispatch(
        &self,
        descriptors: Vec<WorkDescriptor>,
        context: BroadcastContext,
    ) -> Result<DispatchOutcome, DispatchError> {
        self.dispatch_with_cancel(descriptors, context, CancellationToken::new())
            .await
    }

    /// 分发一轮；`cancel` 触发时广播给所有在途任务，未启动的任务不再运行
    pub async fn dispatch_with_cancel(
        &self,
        descriptors: Vec<WorkDescriptor>,
        context: BroadcastContext,
        cancel: CancellationToken,
    ) -> Result<DispatchOutcome, DispatchError> {
        if descriptors.is_empty() {
            tracing::info!("No work descriptors, bypassing dispatch");
            self.phases.report(RoundPhase::Bypassed);
            return Ok(DispatchOutcome::Bypassed);
        }

        let span = tracing::info_span!("dispatch_round", tasks = descriptors.len());
        self.run_round(descriptors, context, cancel)
            .instrument(span)
            .await
    }

    async fn run_round(
        &self,
        descriptors: Vec<WorkDescriptor>,
        context: BroadcastContext,
        cancel: CancellationToken,
    ) -> Result<DispatchOutcome, DispatchError> {
        self.phases.report(RoundPhase::Dispatching);
        let round_token = cancel.child_token();
        // 超时过大（溢出）时视为不设轮次截止
        let deadline = self.round_timeout.and_then(deadline_after);

        let mut barrier = Barrier::new();
        for task in isolate_all(descriptors, &context) {
            if round_token.is_cancelled() {
                barrier.settle(ResultRecord::failure(
                    task.id,
                    task.payload,
                    FailureKind::Cancelled,
                    NOT_STARTED,
                ));
                continue;
            }

            let id = task.id;
            let payload = task.payload.clone();
            let executor = self.executor.clone();
            let limiter = self.limiter.clone();
            let token = round_token.child_token();
            barrier.spawn(id, payload, run_worker(executor, limiter, task, token));
        }

        let dispatched = barrier.dispatched();
        tracing::info!(dispatched, "Tasks submitted, joining");

        let joined = barrier
            .join(&round_token, deadline, self.executor.cancel_grace())
            .await;
        let records = self.fail_round(joined)?;
        self.phases.report(RoundPhase::Joined);

        let aggregate = aggregate(records);
        self.fail_round(verify_complete(&aggregate, dispatched))?;
        self.phases.report(RoundPhase::Aggregated);

        tracing::info!(
            records = aggregate.len(),
            succeeded = aggregate.success_count(),
            failed = aggregate.failure_count(),
            "Dispatch round joined"
        );

        Ok(DispatchOutcome::Executed(aggregate))
    }

    /// 结构性错误中止本轮并发布 Error 阶段
    fn fail_round<T>(&self, result: Result<T, DispatchError>) -> Result<T, DispatchError> {
        if let Err(e) = &result {
            tracing::error!("Dispatch round aborted: {}", e);
            self.phases.report(RoundPhase::Error);
        }
        result
    }
}

/// 单个 Worker：先取得并发许可（可被取消），再执行任务
async fn run_worker(
    executor: WorkerExecutor,
    limiter: Option<Arc<Semaphore>>,
    task: IsolatedTask,
    token: CancellationToken,
) -> ResultRecord {
    let _permit = match limiter {
        Some(semaphore) => {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    return ResultRecord::failure(task.id, task.payload, FailureKind::Cancelled, NOT_STARTED);
                }
                permit = semaphore.acquire_owned() => match permit {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        return ResultRecord::failure(
                            task.id,
                            task.payload,
                            FailureKind::Work,
                            "Concurrency limiter closed",
                        );
                    }
                },
            }
        }
        None => None,
    };

    if token.is_cancelled() {
        return ResultRecord::failure(task.id, task.payload, FailureKind::Cancelled, NOT_STARTED);
    }

    executor.execute(task, token).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::WorkError;
    use crate::dispatch::{work_fn, DispatcherBuilder};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_empty_descriptors_bypass_without_invoking_work() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let dispatcher = DispatcherBuilder::new(Arc::new(work_fn(move |_t: IsolatedTask| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(String::new())
            }
        })))
        .build()
        .unwrap();

        let outcome = dispatcher.dispatch(Vec::new(), BroadcastContext::new()).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Bypassed);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_pre_cancelled_round_runs_nothing() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let dispatcher = DispatcherBuilder::new(Arc::new(work_fn(move |_t: IsolatedTask| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(String::new())
            }
        })))
        .build()
        .unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let outcome = dispatcher
            .dispatch_with_cancel(vec!["a".into(), "b".into()], BroadcastContext::new(), token)
            .await
            .unwrap();

        let agg = outcome.into_aggregate();
        assert_eq!(agg.len(), 2);
        assert!(agg
            .records()
            .iter()
            .all(|r| r.failure_kind() == Some(FailureKind::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_context_reaches_every_task() {
        let dispatcher = DispatcherBuilder::new(Arc::new(work_fn(|t: IsolatedTask| async move {
            let user = t
                .context
                .get_str("user_id")
                .ok_or_else(|| WorkError::MalformedInput("missing user_id".to_string()))?
                .to_string();
            Ok(format!("{}:{}", user, t.payload))
        })))
        .build()
        .unwrap();

        let ctx = BroadcastContext::new().with("user_id", "u7");
        let outcome = dispatcher
            .dispatch(vec!["x".into(), "y".into()], ctx)
            .await
            .unwrap();
        let agg = outcome.into_aggregate();
        let mut outputs: Vec<String> = agg
            .records()
            .iter()
            .filter_map(|r| match r {
                ResultRecord::Success { output, .. } => Some(output.clone()),
                _ => None,
            })
            .collect();
        outputs.sort();
        assert_eq!(outputs, vec!["u7:x".to_string(), "u7:y".to_string()]);
    }

    #[tokio::test]
    async fn test_oversized_round_timeout_means_no_deadline() {
        let dispatcher = DispatcherBuilder::new(Arc::new(work_fn(|t: IsolatedTask| async move { Ok(t.payload) })))
            .round_timeout(Duration::from_secs(u64::MAX))
            .build()
            .unwrap();
        let agg = dispatcher
            .dispatch(vec!["q1".into()], BroadcastContext::new())
            .await
            .unwrap()
            .into_aggregate();
        assert_eq!(agg.success_count(), 1);
    }

    #[test]
    fn test_structural_error_reports_error_phase() {
        let (tx, rx) = tokio::sync::watch::channel(RoundPhase::Dispatching);
        let dispatcher = DispatcherBuilder::new(Arc::new(work_fn(|t: IsolatedTask| async move { Ok(t.payload) })))
            .phase_sender(Arc::new(tx))
            .build()
            .unwrap();

        let ok: Result<(), DispatchError> = Ok(());
        assert!(dispatcher.fail_round(ok).is_ok());
        assert_eq!(*rx.borrow(), RoundPhase::Dispatching);

        let joined: Result<Vec<ResultRecord>, DispatchError> =
            Err(DispatchError::DuplicateRecord(TaskId(0)));
        assert_eq!(
            dispatcher.fail_round(joined),
            Err(DispatchError::DuplicateRecord(TaskId(0)))
        );
        assert_eq!(*rx.borrow(), RoundPhase::Error);
    }
}
