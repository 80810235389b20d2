//! 可观测性：tracing 日志初始化
//!
//! 默认 info，可通过 RUST_LOG 覆盖；每个任务的审计行以 `task_audit` 事件输出。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 初始化全局日志；重复调用时忽略（测试中可能多次初始化）
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        init();
        init();
        tracing::info!("observability initialized");
    }
}
