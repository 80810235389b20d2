//! 汇合屏障
//!
//! 持有本轮所有 Worker 的 JoinSet 与「已提交未落定」表。join 阻塞直到每个任务都产出终态记录：
//! - 轮次超时到达时取消轮次令牌，由 Worker 自行在宽限期内落定
//! - 取消后超过宽限期 + 余量仍未落定的 Worker 被强制中止并不再等待，记录补为 Cancelled
//! - Worker 内逃逸的 panic 在任务边界被捕获，记录为 Panicked
//!
//! join 从不提前返回缺失记录的结果。

use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::core::DispatchError;
use crate::dispatch::executor::panic_message;
use crate::dispatch::types::{FailureKind, ResultRecord, TaskId};

/// 强制中止前在宽限期之外额外等待的时间
const JOIN_SLACK: Duration = Duration::from_millis(100);

/// 未配置或溢出的截止时间用此占位，由分支守卫屏蔽
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365);

/// `now + after`；溢出时视为没有截止时间
pub(crate) fn deadline_after(after: Duration) -> Option<Instant> {
    Instant::now().checked_add(after)
}

/// 一轮分发的汇合点
pub struct Barrier {
    set: JoinSet<ResultRecord>,
    /// 已提交但尚未收到记录的任务：id -> payload
    pending: BTreeMap<TaskId, String>,
    /// 未启动即落定的记录（如提交前已取消）
    settled: Vec<ResultRecord>,
    dispatched: usize,
}

impl Barrier {
    pub fn new() -> Self {
        Self {
            set: JoinSet::new(),
            pending: BTreeMap::new(),
            settled: Vec::new(),
            dispatched: 0,
        }
    }

    /// 提交一个 Worker；Worker 内的 panic 被转为该任务的 Panicked 记录
    pub fn spawn<F>(&mut self, id: TaskId, payload: String, worker: F)
    where
        F: Future<Output = ResultRecord> + Send + 'static,
    {
        let fallback = payload.clone();
        self.pending.insert(id, payload);
        self.dispatched += 1;
        self.set.spawn(AssertUnwindSafe(worker).catch_unwind().map(move |caught| {
            caught.unwrap_or_else(|panic| {
                ResultRecord::failure(
                    id,
                    fallback,
                    FailureKind::Panicked,
                    format!("Worker panicked: {}", panic_message(panic.as_ref())),
                )
            })
        }));
    }

    /// 记录一个无需运行即已落定的任务
    pub fn settle(&mut self, record: ResultRecord) {
        self.dispatched += 1;
        self.settled.push(record);
    }

    /// 本轮已计入的任务数
    pub fn dispatched(&self) -> usize {
        self.dispatched
    }

    /// 等待全部任务落定，返回按完成顺序排列的记录
    pub async fn join(
        mut self,
        cancel: &CancellationToken,
        round_deadline: Option<Instant>,
        cancel_grace: Duration,
    ) -> Result<Vec<ResultRecord>, DispatchError> {
        let mut records = std::mem::take(&mut self.settled);
        let mut cancel_seen = false;
        let mut backstop: Option<Instant> = None;
        let mut aborted = false;
        let far_future = Instant::now() + FAR_FUTURE;
        let deadline = round_deadline.unwrap_or(far_future);

        loop {
            tokio::select! {
                joined = self.set.join_next() => match joined {
                    Some(joined) => self.handle(joined, &mut records)?,
                    None => break,
                },
                _ = sleep_until(deadline), if round_deadline.is_some() && !cancel.is_cancelled() => {
                    tracing::warn!(
                        pending = self.pending.len(),
                        "Round timeout reached, cancelling in-flight tasks"
                    );
                    cancel.cancel();
                }
                _ = cancel.cancelled(), if !cancel_seen => {
                    tracing::info!(pending = self.pending.len(), "Round cancelled, waiting for workers to settle");
                    cancel_seen = true;
                    backstop = cancel_grace.checked_add(JOIN_SLACK).and_then(deadline_after);
                }
                _ = sleep_until(backstop.unwrap_or(far_future)), if backstop.is_some() => {
                    tracing::warn!(
                        pending = self.pending.len(),
                        "Workers did not settle within grace period, aborting"
                    );
                    self.set.abort_all();
                    aborted = true;
                    break;
                }
            }
        }

        if aborted {
            // 已就绪的结果照收，其余 Worker 不再等待（阻塞中的 Worker 随 JoinSet 一起被丢弃）
            while let Some(Some(joined)) = self.set.join_next().now_or_never() {
                self.handle(joined, &mut records)?;
            }
        }

        for (task_id, payload) in std::mem::take(&mut self.pending) {
            let record = if aborted {
                ResultRecord::failure(
                    task_id,
                    payload,
                    FailureKind::Cancelled,
                    "Cancelled: worker aborted after grace period",
                )
            } else {
                ResultRecord::failure(
                    task_id,
                    payload,
                    FailureKind::Panicked,
                    "Worker terminated abnormally",
                )
            };
            records.push(record);
        }

        Ok(records)
    }

    fn handle(
        &mut self,
        joined: Result<ResultRecord, JoinError>,
        records: &mut Vec<ResultRecord>,
    ) -> Result<(), DispatchError> {
        match joined {
            Ok(record) => self.accept(record, records).map_err(|e| {
                tracing::error!("Dispatch invariant violated: {}", e);
                self.set.abort_all();
                e
            }),
            Err(e) => {
                if !e.is_cancelled() {
                    tracing::error!("Worker terminated abnormally: {}", e);
                }
                Ok(())
            }
        }
    }

    fn accept(&mut self, record: ResultRecord, records: &mut Vec<ResultRecord>) -> Result<(), DispatchError> {
        let task_id = record.task_id();
        if self.pending.remove(&task_id).is_some() {
            records.push(record);
            Ok(())
        } else if task_id.0 < self.dispatched {
            Err(DispatchError::DuplicateRecord(task_id))
        } else {
            Err(DispatchError::UnknownTask(task_id))
        }
    }
}

impl Default for Barrier {
    fn default() -> Self {
        Self::new()
    }
}
