//! Swarm 命令行入口
//!
//! 用法：swarm [--config <path>] [--ctx key=value]... [--json] [请求文本]
//! 未给出请求文本时从 stdin 读取。Ctrl+C 取消当前轮次（运行中任务有宽限期收尾）。

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use swarm::config::{load_config, AppConfig};
use swarm::core::ShutdownManager;
use swarm::llm::create_llm_from_config;
use swarm::{observability, BroadcastContext, Pipeline};

struct CliArgs {
    config: Option<PathBuf>,
    context: BroadcastContext,
    json: bool,
    request: Option<String>,
}

fn parse_args() -> anyhow::Result<CliArgs> {
    let mut args = std::env::args().skip(1);
    let mut cli = CliArgs {
        config: None,
        context: BroadcastContext::new(),
        json: false,
        request: None,
    };
    let mut words = Vec::new();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let path = args.next().context("--config requires a path")?;
                cli.config = Some(PathBuf::from(path));
            }
            "--ctx" => {
                let pair = args.next().context("--ctx requires key=value")?;
                let Some((key, value)) = pair.split_once('=') else {
                    bail!("--ctx expects key=value, got {:?}", pair);
                };
                cli.context = cli.context.with(key.trim(), value.trim());
            }
            "--json" => cli.json = true,
            _ => words.push(arg),
        }
    }

    if !words.is_empty() {
        cli.request = Some(words.join(" "));
    }
    Ok(cli)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let cli = parse_args()?;

    let cfg = match load_config(cli.config.clone()) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            AppConfig::default()
        }
    };

    let request = match cli.request {
        Some(r) => r,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read request from stdin")?;
            buf
        }
    };
    let request = request.trim();
    if request.is_empty() {
        bail!("empty request");
    }

    let llm = create_llm_from_config(&cfg);
    let pipeline = Pipeline::from_config(&cfg, llm).context("Failed to build pipeline")?;

    let shutdown = Arc::new(ShutdownManager::new());
    let mut reasons = shutdown.subscribe();
    shutdown.install_signal_handlers();
    tokio::spawn(async move {
        if let Ok(reason) = reasons.recv().await {
            tracing::warn!(?reason, "Shutdown requested, in-flight tasks get their grace period");
        }
    });

    let mut phases = pipeline.subscribe();
    let watcher = tokio::spawn(async move {
        while phases.changed().await.is_ok() {
            let phase = *phases.borrow_and_update();
            tracing::debug!(?phase, "Round phase");
            if phase.is_terminal() {
                break;
            }
        }
    });

    let report = pipeline
        .run(request, cli.context, shutdown.child_token())
        .await
        .context("Round failed")?;
    watcher.abort();

    if cli.json {
        let json = serde_json::to_string_pretty(&report).context("Failed to serialize report")?;
        println!("{}", json);
    } else {
        println!("{}", report.summary);
    }

    Ok(())
}
