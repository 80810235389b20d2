//! Worker 执行器
//!
//! 持有可插拔的工作单元与单任务超时，execute(task) 在任务边界捕获一切失败
//! （返回错误、超时、panic、取消）并转为 Failure 记录；每个任务输出一行结构化审计日志（JSON）。

use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::core::WorkError;
use crate::dispatch::types::{FailureKind, IsolatedTask, ResultRecord};

/// 工作单元 trait：消费一个隔离任务，返回输出或错误
///
/// `cancel` 在轮次被取消时触发，实现方可据此尽快协作退出。
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    async fn run(&self, task: IsolatedTask, cancel: CancellationToken) -> Result<String, WorkError>;
}

/// 闭包形式的工作单元
pub struct FnWork<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

/// 用异步闭包构造工作单元：`work_fn(|task| async move { Ok(task.payload) })`
pub fn work_fn<F, Fut>(f: F) -> FnWork<F, Fut>
where
    F: Fn(IsolatedTask) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, WorkError>> + Send + 'static,
{
    FnWork {
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> UnitOfWork for FnWork<F, Fut>
where
    F: Fn(IsolatedTask) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, WorkError>> + Send + 'static,
{
    async fn run(&self, task: IsolatedTask, _cancel: CancellationToken) -> Result<String, WorkError> {
        (self.f)(task).await
    }
}

/// 工作单元的落定方式
enum Settled {
    Done(Result<String, WorkError>),
    Panicked(String),
    TimedOut(Duration),
    /// 取消后宽限期内仍未结束，结果被放弃
    Abandoned(Duration),
}

/// Worker 执行器：对每个任务施加超时与取消宽限期，并把结果映射为 ResultRecord
#[derive(Clone)]
pub struct WorkerExecutor {
    work: Arc<dyn UnitOfWork>,
    task_timeout: Option<Duration>,
    cancel_grace: Duration,
}

impl WorkerExecutor {
    pub fn new(work: Arc<dyn UnitOfWork>) -> Self {
        Self {
            work,
            task_timeout: None,
            cancel_grace: Duration::from_millis(500),
        }
    }

    pub fn with_task_timeout(mut self, task_timeout: Option<Duration>) -> Self {
        self.task_timeout = task_timeout;
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn cancel_grace(&self) -> Duration {
        self.cancel_grace
    }

    /// 执行一个隔离任务，总是返回终态记录
    pub async fn execute(&self, task: IsolatedTask, cancel: CancellationToken) -> ResultRecord {
        let start = Instant::now();
        let task_id = task.id;
        let payload = task.payload.clone();

        let work = Arc::clone(&self.work);
        let work_cancel = cancel.clone();
        let task_timeout = self.task_timeout;
        let settle = async move {
            let guarded = AssertUnwindSafe(work.run(task, work_cancel)).catch_unwind();
            let caught = match task_timeout {
                Some(limit) => match timeout(limit, guarded).await {
                    Ok(caught) => caught,
                    Err(_) => return Settled::TimedOut(limit),
                },
                None => guarded.await,
            };
            match caught {
                Ok(result) => Settled::Done(result),
                Err(panic) => Settled::Panicked(panic_message(panic.as_ref())),
            }
        };
        tokio::pin!(settle);

        let settled = tokio::select! {
            biased;
            settled = &mut settle => settled,
            _ = cancel.cancelled() => {
                match timeout(self.cancel_grace, &mut settle).await {
                    Ok(settled) => settled,
                    Err(_) => Settled::Abandoned(self.cancel_grace),
                }
            }
        };

        let record = match settled {
            Settled::Done(Ok(output)) => ResultRecord::success(task_id, payload, output),
            Settled::Done(Err(err)) => {
                let kind = match err {
                    WorkError::Timeout(_) => FailureKind::Timeout,
                    WorkError::Cancelled(_) => FailureKind::Cancelled,
                    _ => FailureKind::Work,
                };
                ResultRecord::failure(task_id, payload, kind, err.to_string())
            }
            Settled::Panicked(msg) => ResultRecord::failure(
                task_id,
                payload,
                FailureKind::Panicked,
                format!("Worker panicked: {}", msg),
            ),
            Settled::TimedOut(limit) => ResultRecord::failure(
                task_id,
                payload,
                FailureKind::Timeout,
                format!("Task exceeded timeout of {} ms", limit.as_millis()),
            ),
            Settled::Abandoned(grace) => ResultRecord::failure(
                task_id,
                payload,
                FailureKind::Cancelled,
                format!(
                    "Cancelled: task did not stop within grace period of {} ms",
                    grace.as_millis()
                ),
            ),
        };

        audit(&record, start.elapsed());
        record
    }
}

fn audit(record: &ResultRecord, elapsed: Duration) {
    let audit = serde_json::json!({
        "event": "task_audit",
        "task_id": record.task_id().0,
        "ok": record.is_success(),
        "kind": record.failure_kind(),
        "duration_ms": elapsed.as_millis() as u64,
        "payload_preview": payload_preview(record.payload()),
    });
    if record.is_success() {
        tracing::info!(audit = %audit.to_string(), "task");
    } else {
        tracing::warn!(audit = %audit.to_string(), "task");
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

pub(crate) fn payload_preview(payload: &str) -> String {
    if payload.chars().count() > 200 {
        format!("{}...", payload.chars().take(200).collect::<String>())
    } else {
        payload.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::types::{BroadcastContext, TaskId};

    fn task(payload: &str) -> IsolatedTask {
        IsolatedTask {
            id: TaskId(0),
            payload: payload.to_string(),
            context: BroadcastContext::new(),
        }
    }

    #[tokio::test]
    async fn test_success_is_wrapped_unchanged() {
        let executor = WorkerExecutor::new(Arc::new(work_fn(|t: IsolatedTask| async move {
            Ok(format!("answer:{}", t.payload))
        })));
        let record = executor.execute(task("q1"), CancellationToken::new()).await;
        assert_eq!(record, ResultRecord::success(TaskId(0), "q1", "answer:q1"));
    }

    #[tokio::test]
    async fn test_error_becomes_failure() {
        let executor = WorkerExecutor::new(Arc::new(work_fn(|_t: IsolatedTask| async move {
            Err(WorkError::MalformedInput("bad query".to_string()))
        })));
        let record = executor.execute(task("q1"), CancellationToken::new()).await;
        match record {
            ResultRecord::Failure { kind, error, error_count, .. } => {
                assert_eq!(kind, FailureKind::Work);
                assert!(error.contains("bad query"));
                assert_eq!(error_count, 1);
            }
            _ => panic!("Expected Failure"),
        }
    }

    #[tokio::test]
    async fn test_panic_is_caught() {
        let executor = WorkerExecutor::new(Arc::new(work_fn(|_t: IsolatedTask| async move {
            if true {
                panic!("exploded");
            }
            Ok(String::new())
        })));
        let record = executor.execute(task("q1"), CancellationToken::new()).await;
        assert_eq!(record.failure_kind(), Some(FailureKind::Panicked));
        match record {
            ResultRecord::Failure { error, .. } => assert!(error.contains("exploded")),
            _ => panic!("Expected Failure"),
        }
    }

    #[tokio::test]
    async fn test_task_timeout() {
        let executor = WorkerExecutor::new(Arc::new(work_fn(|_t: IsolatedTask| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("late".to_string())
        })))
        .with_task_timeout(Some(Duration::from_millis(20)));
        let record = executor.execute(task("slow"), CancellationToken::new()).await;
        assert_eq!(record.failure_kind(), Some(FailureKind::Timeout));
    }

    #[tokio::test]
    async fn test_cancel_abandons_after_grace() {
        let executor = WorkerExecutor::new(Arc::new(work_fn(|_t: IsolatedTask| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("late".to_string())
        })))
        .with_cancel_grace(Duration::from_millis(20));

        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let record = executor.execute(task("q2"), token).await;
        assert_eq!(record.failure_kind(), Some(FailureKind::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_cancel_within_grace_keeps_result() {
        let executor = WorkerExecutor::new(Arc::new(work_fn(|_t: IsolatedTask| async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok("finished".to_string())
        })))
        .with_cancel_grace(Duration::from_secs(2));

        let token = CancellationToken::new();
        token.cancel();
        let record = executor.execute(task("q1"), token).await;
        assert_eq!(record, ResultRecord::success(TaskId(0), "q1", "finished"));
    }

    #[test]
    fn test_payload_preview_truncates() {
        let long = "x".repeat(300);
        let preview = payload_preview(&long);
        assert_eq!(preview.chars().count(), 203);
        assert_eq!(payload_preview("short"), "short");
    }
}
