//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `SWARM__*` 覆盖（双下划线表示嵌套，如 `SWARM__DISPATCH__MAX_CONCURRENCY=4`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub dispatch: DispatchSection,
    #[serde(default)]
    pub planner: PlannerSection,
    #[serde(default)]
    pub llm: LlmSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [dispatch] 段：并发上限、单任务超时、轮次超时、取消宽限期
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchSection {
    /// 最大并发任务数；缺省或 0 表示不限
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    /// 单任务超时（秒）
    #[serde(default)]
    pub task_timeout_secs: Option<u64>,
    /// 整轮超时（秒），到达后按取消处理
    #[serde(default)]
    pub round_timeout_secs: Option<u64>,
    /// 取消后等待运行中任务协作退出的时间（毫秒）
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
}

fn default_cancel_grace_ms() -> u64 {
    500
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            max_concurrency: None,
            task_timeout_secs: None,
            round_timeout_secs: None,
            cancel_grace_ms: default_cancel_grace_ms(),
        }
    }
}

impl DispatchSection {
    /// 0 视为不限
    pub fn concurrency_limit(&self) -> Option<usize> {
        self.max_concurrency.filter(|n| *n > 0)
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_secs.map(Duration::from_secs)
    }

    pub fn round_timeout(&self) -> Option<Duration> {
        self.round_timeout_secs.map(Duration::from_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

/// [planner] 段：单次请求最多拆出的子查询数
#[derive(Debug, Clone, Deserialize)]
pub struct PlannerSection {
    #[serde(default = "default_max_descriptors")]
    pub max_descriptors: usize,
}

fn default_max_descriptors() -> usize {
    8
}

impl Default for PlannerSection {
    fn default() -> Self {
        Self {
            max_descriptors: default_max_descriptors(),
        }
    }
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：deepseek / openai / mock；优先级由 API Key 与 provider 共同决定
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default)]
    pub deepseek: LlmDeepSeekSection,
    #[serde(default)]
    pub openai: LlmOpenAiSection,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

fn default_provider() -> String {
    "deepseek".to_string()
}

fn default_model() -> String {
    crate::llm::DEEPSEEK_CHAT.to_string()
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            deepseek: LlmDeepSeekSection::default(),
            openai: LlmOpenAiSection::default(),
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LlmDeepSeekSection {
    pub model: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LlmOpenAiSection {
    pub model: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    /// 单次请求超时（秒）
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

fn default_request_timeout() -> u64 {
    60
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 SWARM__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 SWARM__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("SWARM")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
