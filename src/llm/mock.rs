//! Mock LLM 客户端（用于测试与离线运行，无需 API）
//!
//! 规划提示（system 中含 `PLAN_MARKER`）时，按 `;` 或换行拆分用户请求并输出 JSON 数组，
//! 其余情况回显最后一条 User 消息，便于本地跑通规划 → 分发 → 汇总全流程。

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError, Message, Role};
use crate::planner::PLAN_MARKER;

/// Mock 客户端
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");

        let planning = messages
            .iter()
            .any(|m| m.role == Role::System && m.content.contains(PLAN_MARKER));

        if planning {
            let queries: Vec<&str> = last_user
                .split(|c: char| c == ';' || c == '\n')
                .map(str::trim)
                .filter(|q| !q.is_empty())
                .collect();
            return serde_json::to_string(&queries).map_err(|e| LlmError::Api(e.to_string()));
        }

        Ok(format!("Mock answer: {}", last_user))
    }
}
