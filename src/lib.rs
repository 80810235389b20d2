//! Swarm - 动态分散-汇聚执行引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、轮次阶段、优雅关闭
//! - **dispatch**: 分发器、任务隔离、Worker 执行、屏障汇合、聚合与路由
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）及 LLM 工作单元
//! - **observability**: 日志初始化
//! - **pipeline**: 规划 → 分发 → 路由 → 汇总 的整轮驱动
//! - **planner**: 工作描述来源（固定列表 / LLM 规划）
//! - **summary**: 汇总阶段

pub mod config;
pub mod core;
pub mod dispatch;
pub mod llm;
pub mod observability;
pub mod pipeline;
pub mod planner;
pub mod summary;

pub use dispatch::{
    BroadcastContext, DispatchOutcome, Dispatcher, DispatcherBuilder, ResultRecord, UnitOfWork,
    WorkDescriptor,
};
pub use pipeline::{Pipeline, RoundReport};
