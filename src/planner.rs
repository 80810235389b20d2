//! 工作描述来源：规划阶段
//!
//! DescriptorSource 把一次请求拆成若干相互独立的工作描述（可能为零个）。
//! LlmPlanner 让模型输出 JSON 数组；parse_plan_output 从文本中提取并解析。

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::core::AgentError;
use crate::dispatch::WorkDescriptor;
use crate::llm::{LlmClient, Message};

/// 规划提示中的标记，Mock 客户端据此识别规划请求
pub const PLAN_MARKER: &str = "[plan]";

const DEFAULT_PLAN_PROMPT: &str = "Split the user's request into independent sub-queries that can be answered separately. \
Respond with ONLY a JSON array of strings, for example: [\"query one\", \"query two\"]. \
Respond with [] if the request needs no sub-queries.";

/// 工作描述来源 trait
#[async_trait]
pub trait DescriptorSource: Send + Sync {
    async fn plan(&self, request: &str) -> Result<Vec<WorkDescriptor>, AgentError>;
}

/// 固定描述列表
pub struct StaticSource {
    descriptors: Vec<WorkDescriptor>,
}

impl StaticSource {
    pub fn new<I, D>(descriptors: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<WorkDescriptor>,
    {
        Self {
            descriptors: descriptors.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl DescriptorSource for StaticSource {
    async fn plan(&self, _request: &str) -> Result<Vec<WorkDescriptor>, AgentError> {
        Ok(self.descriptors.clone())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PlanShape {
    List(Vec<String>),
    Object { queries: Vec<String> },
}

/// 解析规划输出：JSON 字符串数组，或 `{"queries": [...]}`，可包在 ```json 代码块中；空白项被丢弃
pub fn parse_plan_output(output: &str) -> Result<Vec<String>, AgentError> {
    let trimmed = output.trim();

    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim())
    } else {
        let open = trimmed.find(|c: char| c == '[' || c == '{');
        let close = trimmed.rfind(|c: char| c == ']' || c == '}');
        match (open, close) {
            (Some(start), Some(end)) if end > start => &trimmed[start..=end],
            _ => {
                return Err(AgentError::JsonParseError(format!(
                    "no JSON plan found: {}",
                    trimmed
                )))
            }
        }
    };

    let parsed: PlanShape = serde_json::from_str(json_str)
        .map_err(|e| AgentError::JsonParseError(format!("{}: {}", e, json_str)))?;
    let queries = match parsed {
        PlanShape::List(q) | PlanShape::Object { queries: q } => q,
    };

    Ok(queries
        .into_iter()
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty())
        .collect())
}

/// LLM 规划器：持有 LLM 与规划提示，输出至多 max_descriptors 个描述
pub struct LlmPlanner {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
    max_descriptors: usize,
}

impl LlmPlanner {
    pub fn new(llm: Arc<dyn LlmClient>, max_descriptors: usize) -> Self {
        Self {
            llm,
            system_prompt: format!("{} {}", PLAN_MARKER, DEFAULT_PLAN_PROMPT),
            max_descriptors,
        }
    }

    /// 替换规划提示（自动补上规划标记）
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = format!("{} {}", PLAN_MARKER, prompt.into());
        self
    }
}

#[async_trait]
impl DescriptorSource for LlmPlanner {
    async fn plan(&self, request: &str) -> Result<Vec<WorkDescriptor>, AgentError> {
        let messages = vec![Message::system(self.system_prompt.clone()), Message::user(request)];
        let output = self
            .llm
            .complete(&messages)
            .await
            .map_err(|e| AgentError::LlmError(e.to_string()))?;

        let mut queries = parse_plan_output(&output)?;
        if queries.len() > self.max_descriptors {
            tracing::warn!(
                planned = queries.len(),
                max = self.max_descriptors,
                "Plan exceeds descriptor limit, truncating"
            );
            queries.truncate(self.max_descriptors);
        }
        tracing::info!(descriptors = queries.len(), "Plan ready");

        Ok(queries.into_iter().map(WorkDescriptor::new).collect())
    }
}
