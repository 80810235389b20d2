//! 分发器构建器
//!
//! 提供流畅的 API 来配置并发上限、超时与取消宽限期

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::config::DispatchSection;
use crate::core::{AgentError, PhaseReporter, RoundPhase};
use crate::dispatch::dispatcher::Dispatcher;
use crate::dispatch::executor::{UnitOfWork, WorkerExecutor};

/// 分发器构建器
pub struct DispatcherBuilder {
    work: Arc<dyn UnitOfWork>,
    max_concurrency: Option<usize>,
    task_timeout: Option<Duration>,
    round_timeout: Option<Duration>,
    cancel_grace: Duration,
    phases: PhaseReporter,
}

impl DispatcherBuilder {
    /// 以工作单元创建构建器；默认不限并发、无超时、宽限期 500ms
    pub fn new(work: Arc<dyn UnitOfWork>) -> Self {
        Self {
            work,
            max_concurrency: None,
            task_timeout: None,
            round_timeout: None,
            cancel_grace: Duration::from_millis(500),
            phases: PhaseReporter::disabled(),
        }
    }

    /// 从 [dispatch] 配置段读取全部参数
    pub fn from_config(mut self, section: &DispatchSection) -> Self {
        self.max_concurrency = section.concurrency_limit();
        self.task_timeout = section.task_timeout();
        self.round_timeout = section.round_timeout();
        self.cancel_grace = section.cancel_grace();
        self
    }

    /// 设置并发上限
    pub fn max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }

    /// 设置单任务超时
    pub fn task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = Some(timeout);
        self
    }

    /// 设置整轮超时
    pub fn round_timeout(mut self, timeout: Duration) -> Self {
        self.round_timeout = Some(timeout);
        self
    }

    /// 设置取消宽限期
    pub fn cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    /// 接入阶段观察通道
    pub fn phase_sender(mut self, tx: Arc<watch::Sender<RoundPhase>>) -> Self {
        self.phases = PhaseReporter::new(tx);
        self
    }

    /// 构建分发器
    pub fn build(self) -> Result<Dispatcher, AgentError> {
        if self.max_concurrency == Some(0) {
            return Err(AgentError::InvalidConfiguration(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.task_timeout == Some(Duration::ZERO) {
            return Err(AgentError::InvalidConfiguration(
                "task_timeout must be positive".to_string(),
            ));
        }
        if self.round_timeout == Some(Duration::ZERO) {
            return Err(AgentError::InvalidConfiguration(
                "round_timeout must be positive".to_string(),
            ));
        }

        let executor = WorkerExecutor::new(self.work)
            .with_task_timeout(self.task_timeout)
            .with_cancel_grace(self.cancel_grace);

        Ok(Dispatcher::new(
            executor,
            self.max_concurrency,
            self.round_timeout,
            self.phases,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{work_fn, IsolatedTask};

    fn echo() -> Arc<dyn UnitOfWork> {
        Arc::new(work_fn(|t: IsolatedTask| async move { Ok(t.payload) }))
    }

    #[test]
    fn test_build_default() {
        let dispatcher = DispatcherBuilder::new(echo()).build().unwrap();
        assert_eq!(dispatcher.max_concurrency(), None);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let result = DispatcherBuilder::new(echo()).max_concurrency(0).build();
        assert!(matches!(result, Err(AgentError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let result = DispatcherBuilder::new(echo()).task_timeout(Duration::ZERO).build();
        assert!(matches!(result, Err(AgentError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_from_config() {
        let section = DispatchSection {
            max_concurrency: Some(2),
            task_timeout_secs: Some(5),
            round_timeout_secs: None,
            cancel_grace_ms: 100,
        };
        let dispatcher = DispatcherBuilder::new(echo()).from_config(&section).build().unwrap();
        assert_eq!(dispatcher.max_concurrency(), Some(2));
    }
}
