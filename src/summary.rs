//! 汇总阶段（路由的唯一下游）
//!
//! 接收 NextStage：分支标签 + 汇聚。旁路时说明没有生成任何子查询，
//! 执行但全部失败时如实列出失败原因，二者不可混淆。

use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;

use crate::core::AgentError;
use crate::dispatch::{NextStage, OutcomeKind, ResultRecord};
use crate::llm::{LlmClient, Message};

const DEFAULT_SUMMARY_PROMPT: &str = "You are given the results of several independent sub-queries for one user request. \
Combine the successful results into a single concise answer. Mention any sub-query that failed and why.";

/// 汇总阶段 trait
#[async_trait]
pub trait SummaryStage: Send + Sync {
    async fn summarize(&self, request: &str, next: &NextStage) -> Result<String, AgentError>;
}

/// 把汇聚渲染成逐条文本（按任务序号排序，便于阅读）
pub fn render_records(next: &NextStage) -> String {
    let mut records: Vec<&ResultRecord> = next.aggregate.records().iter().collect();
    records.sort_by_key(|r| r.task_id());

    let mut out = String::new();
    for record in records {
        match record {
            ResultRecord::Success { task_id, payload, output } => {
                let _ = writeln!(out, "[{}] {} => {}", task_id, payload, output);
            }
            ResultRecord::Failure { task_id, payload, kind, error, .. } => {
                let _ = writeln!(out, "[{}] {} => FAILED ({:?}): {}", task_id, payload, kind, error);
            }
        }
    }
    out
}

/// 确定性文本摘要，不依赖 LLM
#[derive(Debug, Default)]
pub struct DigestSummary;

#[async_trait]
impl SummaryStage for DigestSummary {
    async fn summarize(&self, request: &str, next: &NextStage) -> Result<String, AgentError> {
        let agg = &next.aggregate;
        let header = match next.kind {
            OutcomeKind::Bypassed => {
                return Ok(format!("No sub-queries were produced for: {}", request));
            }
            OutcomeKind::Executed if agg.success_count() == 0 => format!(
                "All {} sub-queries failed for: {}",
                agg.len(),
                request
            ),
            OutcomeKind::Executed => format!(
                "{} of {} sub-queries succeeded for: {}",
                agg.success_count(),
                agg.len(),
                request
            ),
        };
        Ok(format!("{}\n{}", header, render_records(next)).trim_end().to_string())
    }
}

/// LLM 汇总：把成功与失败的记录一起交给模型
pub struct LlmSummarizer {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
}

impl LlmSummarizer {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            system_prompt: DEFAULT_SUMMARY_PROMPT.to_string(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }
}

#[async_trait]
impl SummaryStage for LlmSummarizer {
    async fn summarize(&self, request: &str, next: &NextStage) -> Result<String, AgentError> {
        let body = match next.kind {
            OutcomeKind::Bypassed => format!(
                "Request: {}\n\nNo sub-queries were produced, so no work was done.",
                request
            ),
            OutcomeKind::Executed => format!(
                "Request: {}\n\nResults ({} succeeded, {} failed):\n{}",
                request,
                next.aggregate.success_count(),
                next.aggregate.failure_count(),
                render_records(next)
            ),
        };
        let messages = vec![Message::system(self.system_prompt.clone()), Message::user(body)];
        self.llm
            .complete(&messages)
            .await
            .map_err(|e| AgentError::SummaryFailed(e.to_string()))
    }
}
