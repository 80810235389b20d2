//! 流水线：驱动一轮完整的 规划 → 分发 → 路由 → 汇总
//!
//! 每轮生成 round_id 并在 `pipeline_round` span 内运行；阶段变化发布到 watch 通道，
//! 调用方可通过 subscribe 观察。轮次之间不保留任何状态。

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::AppConfig;
use crate::core::{AgentError, PhaseReporter, RoundPhase};
use crate::dispatch::{route, AggregateState, BroadcastContext, Dispatcher, DispatcherBuilder, OutcomeKind};
use crate::llm::{LlmClient, LlmWork};
use crate::planner::{DescriptorSource, LlmPlanner};
use crate::summary::{LlmSummarizer, SummaryStage};

const DEFAULT_WORK_PROMPT: &str = "Answer the following query concisely and factually.";

/// 一轮内 LLM 消耗的 token
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenTotals {
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
}

impl TokenTotals {
    fn from_usage((prompt, completion, total): (u64, u64, u64)) -> Self {
        Self {
            prompt,
            completion,
            total,
        }
    }

    /// 两次累计快照之差
    fn since(self, earlier: TokenTotals) -> Self {
        Self {
            prompt: self.prompt.saturating_sub(earlier.prompt),
            completion: self.completion.saturating_sub(earlier.completion),
            total: self.total.saturating_sub(earlier.total),
        }
    }
}

/// 一轮的完整结果
#[derive(Debug, Clone, Serialize)]
pub struct RoundReport {
    pub round_id: String,
    pub request: String,
    pub kind: OutcomeKind,
    pub aggregate: AggregateState,
    pub summary: String,
    /// 仅在流水线持有 LLM 客户端时统计
    pub tokens: Option<TokenTotals>,
    pub started_at: i64,
    pub completed_at: i64,
}

/// 流水线：描述来源 + 分发器 + 汇总阶段
pub struct Pipeline {
    source: Arc<dyn DescriptorSource>,
    dispatcher: Dispatcher,
    summary: Arc<dyn SummaryStage>,
    phase_tx: Arc<watch::Sender<RoundPhase>>,
    phases: PhaseReporter,
    /// 用于统计 token 的 LLM 客户端
    llm: Option<Arc<dyn LlmClient>>,
}

impl Pipeline {
    /// 用给定组件构建；分发器的阶段发布接入本流水线的观察通道
    pub fn new(
        source: Arc<dyn DescriptorSource>,
        dispatcher: DispatcherBuilder,
        summary: Arc<dyn SummaryStage>,
    ) -> Result<Self, AgentError> {
        let (tx, _rx) = watch::channel(RoundPhase::Idle);
        let phase_tx = Arc::new(tx);
        let dispatcher = dispatcher.phase_sender(Arc::clone(&phase_tx)).build()?;
        Ok(Self {
            source,
            dispatcher,
            summary,
            phases: PhaseReporter::new(Arc::clone(&phase_tx)),
            phase_tx,
            llm: None,
        })
    }

    /// 在 RoundReport 中附带该客户端本轮的 token 消耗
    pub fn with_token_accounting(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// 从配置构建基于 LLM 的流水线：LLM 规划、LLM 工作单元、LLM 汇总
    ///
    /// 提示词可放在 config/prompts/{plan,work,summary}.txt，缺省使用内置提示。
    pub fn from_config(cfg: &AppConfig, llm: Arc<dyn LlmClient>) -> Result<Self, AgentError> {
        let mut planner = LlmPlanner::new(llm.clone(), cfg.planner.max_descriptors);
        if let Some(prompt) = read_prompt("plan") {
            planner = planner.with_system_prompt(prompt);
        }

        let work_prompt = read_prompt("work").unwrap_or_else(|| DEFAULT_WORK_PROMPT.to_string());
        let work = Arc::new(LlmWork::new(llm.clone(), work_prompt));
        let builder = DispatcherBuilder::new(work).from_config(&cfg.dispatch);

        let mut summarizer = LlmSummarizer::new(llm.clone());
        if let Some(prompt) = read_prompt("summary") {
            summarizer = summarizer.with_system_prompt(prompt);
        }

        Ok(Self::new(Arc::new(planner), builder, Arc::new(summarizer))?.with_token_accounting(llm))
    }

    /// 订阅阶段变化
    pub fn subscribe(&self) -> watch::Receiver<RoundPhase> {
        self.phase_tx.subscribe()
    }

    /// 运行一轮
    pub async fn run(
        &self,
        request: &str,
        context: BroadcastContext,
        cancel: CancellationToken,
    ) -> Result<RoundReport, AgentError> {
        let round_id = format!("round_{}", uuid::Uuid::new_v4());
        let span = tracing::info_span!("pipeline_round", round_id = %round_id);
        let result = self
            .run_round(round_id, request, context, cancel)
            .instrument(span)
            .await;
        if let Err(e) = &result {
            tracing::error!("Round failed: {}", e);
            self.phases.report(RoundPhase::Error);
        }
        result
    }

    async fn run_round(
        &self,
        round_id: String,
        request: &str,
        context: BroadcastContext,
        cancel: CancellationToken,
    ) -> Result<RoundReport, AgentError> {
        let started_at = chrono::Utc::now().timestamp_millis();
        let tokens_before = self.token_snapshot();

        self.phases.report(RoundPhase::Planning);
        let descriptors = self.source.plan(request).await?;

        let outcome = self
            .dispatcher
            .dispatch_with_cancel(descriptors, context, cancel)
            .await?;

        let next = route(outcome);
        self.phases.report(RoundPhase::Routed);

        let summary = self.summary.summarize(request, &next).await?;
        self.phases.report(RoundPhase::Done);

        let tokens = self
            .token_snapshot()
            .zip(tokens_before)
            .map(|(after, before)| after.since(before));
        if let Some(t) = tokens {
            tracing::info!(prompt = t.prompt, completion = t.completion, total = t.total, "Round token usage");
        }

        Ok(RoundReport {
            round_id,
            request: request.to_string(),
            kind: next.kind,
            aggregate: next.aggregate,
            summary,
            tokens,
            started_at,
            completed_at: chrono::Utc::now().timestamp_millis(),
        })
    }

    fn token_snapshot(&self) -> Option<TokenTotals> {
        self.llm.as_ref().map(|llm| TokenTotals::from_usage(llm.token_usage()))
    }
}

/// 读取 config/prompts/<name>.txt（也查找上一级目录）
fn read_prompt(name: &str) -> Option<String> {
    [
        format!("config/prompts/{}.txt", name),
        format!("../config/prompts/{}.txt", name),
    ]
    .into_iter()
    .find_map(|p| std::fs::read_to_string(p).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{work_fn, IsolatedTask};
    use crate::llm::MockLlmClient;
    use crate::planner::StaticSource;
    use crate::summary::DigestSummary;

    fn echo_builder() -> DispatcherBuilder {
        DispatcherBuilder::new(Arc::new(work_fn(|t: IsolatedTask| async move { Ok(t.payload) })))
    }

    #[tokio::test]
    async fn test_pipeline_bypass_reaches_summary() {
        let pipeline = Pipeline::new(
            Arc::new(StaticSource::new(Vec::<&str>::new())),
            echo_builder(),
            Arc::new(DigestSummary),
        )
        .unwrap();
        let rx = pipeline.subscribe();

        let report = pipeline
            .run("nothing to do", BroadcastContext::new(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.kind, OutcomeKind::Bypassed);
        assert!(report.aggregate.is_empty());
        assert!(report.summary.starts_with("No sub-queries"));
        assert!(report.round_id.starts_with("round_"));
        assert_eq!(*rx.borrow(), RoundPhase::Done);
    }

    #[tokio::test]
    async fn test_pipeline_from_config_with_mock() {
        let cfg = AppConfig::default();
        let pipeline = Pipeline::from_config(&cfg, Arc::new(MockLlmClient)).unwrap();
        let report = pipeline
            .run("a; b; c", BroadcastContext::new(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.kind, OutcomeKind::Executed);
        assert_eq!(report.aggregate.len(), 3);
        assert_eq!(report.aggregate.success_count(), 3);
        assert!(report.completed_at >= report.started_at);
        assert_eq!(report.tokens, Some(TokenTotals::default()));
    }

    /// 每次调用计 10 + 5 个 token 的 Mock
    struct MeteredLlm {
        calls: std::sync::atomic::AtomicU64,
    }

    #[async_trait::async_trait]
    impl LlmClient for MeteredLlm {
        async fn complete(&self, messages: &[crate::llm::Message]) -> Result<String, crate::llm::LlmError> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            MockLlmClient.complete(messages).await
        }

        fn token_usage(&self) -> (u64, u64, u64) {
            let n = self.calls.load(std::sync::atomic::Ordering::SeqCst);
            (n * 10, n * 5, n * 15)
        }
    }

    #[tokio::test]
    async fn test_report_counts_tokens_of_this_round_only() {
        let llm = Arc::new(MeteredLlm {
            calls: std::sync::atomic::AtomicU64::new(0),
        });
        let pipeline = Pipeline::from_config(&AppConfig::default(), llm).unwrap();

        // 规划 1 次 + 工作 2 次 + 汇总 1 次
        let first = pipeline
            .run("a; b", BroadcastContext::new(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            first.tokens,
            Some(TokenTotals {
                prompt: 40,
                completion: 20,
                total: 60
            })
        );

        let second = pipeline
            .run("c", BroadcastContext::new(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(second.tokens.map(|t| t.total), Some(45));
    }

    #[tokio::test]
    async fn test_without_accounting_tokens_are_absent() {
        let pipeline = Pipeline::new(
            Arc::new(StaticSource::new(["q"])),
            echo_builder(),
            Arc::new(DigestSummary),
        )
        .unwrap();
        let report = pipeline
            .run("r", BroadcastContext::new(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.tokens, None);
    }

    #[tokio::test]
    async fn test_planning_error_marks_round_failed() {
        struct BrokenSource;

        #[async_trait::async_trait]
        impl DescriptorSource for BrokenSource {
            async fn plan(&self, _request: &str) -> Result<Vec<crate::dispatch::WorkDescriptor>, AgentError> {
                Err(AgentError::PlanningFailed("planner offline".to_string()))
            }
        }

        let pipeline = Pipeline::new(Arc::new(BrokenSource), echo_builder(), Arc::new(DigestSummary)).unwrap();
        let rx = pipeline.subscribe();
        let result = pipeline
            .run("x", BroadcastContext::new(), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(AgentError::PlanningFailed(_))));
        assert_eq!(*rx.borrow(), RoundPhase::Error);
    }
}
