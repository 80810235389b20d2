//! 基于 LLM 的工作单元
//!
//! 每个任务一次模型调用：system 为基础提示 + 渲染后的广播上下文，user 为任务 payload。
//! 轮次取消时放弃调用并返回 Cancelled；LLM 错误转为 Downstream / Timeout。

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::WorkError;
use crate::dispatch::{BroadcastContext, IsolatedTask, UnitOfWork};
use crate::llm::{LlmClient, LlmError, Message};

/// LLM 工作单元：持有客户端与基础 system 提示，可在并发任务间共享
pub struct LlmWork {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
}

impl LlmWork {
    pub fn new(llm: Arc<dyn LlmClient>, system_prompt: impl Into<String>) -> Self {
        Self {
            llm,
            system_prompt: system_prompt.into(),
        }
    }

    fn messages(&self, task: &IsolatedTask) -> Vec<Message> {
        vec![
            Message::system(render_system(&self.system_prompt, &task.context)),
            Message::user(task.payload.clone()),
        ]
    }
}

/// 基础提示后附加上下文字段，每行一个 `key: value`
fn render_system(base: &str, context: &BroadcastContext) -> String {
    if context.is_empty() {
        return base.to_string();
    }
    let mut out = String::from(base);
    out.push_str("\n\nContext:");
    for (key, value) in context.fields() {
        let value = match value.as_str() {
            Some(s) => s.to_string(),
            None => value.to_string(),
        };
        out.push_str(&format!("\n- {}: {}", key, value));
    }
    out
}

#[async_trait]
impl UnitOfWork for LlmWork {
    async fn run(&self, task: IsolatedTask, cancel: CancellationToken) -> Result<String, WorkError> {
        if task.payload.trim().is_empty() {
            return Err(WorkError::MalformedInput("empty query".to_string()));
        }
        let messages = self.messages(&task);

        tokio::select! {
            result = self.llm.complete(&messages) => result.map_err(|e| match e {
                LlmError::Timeout(secs) => WorkError::Timeout(secs * 1000),
                LlmError::InvalidRequest(msg) => WorkError::MalformedInput(msg),
                LlmError::Api(msg) => WorkError::Downstream(msg),
            }),
            _ = cancel.cancelled() => Err(WorkError::Cancelled("LLM call abandoned".to_string())),
        }
    }
}
