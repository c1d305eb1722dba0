//! # chaser-engine 命令行入口
//!
//! 连接（或启动）浏览器，可选导航到给定 URL，然后把当前浏览器状态以 JSON 打印到标准输出。
//!
//! ## 用法
//! ```text
//! chaser-engine [--config <file>] [--screenshot] [URL]
//! ```
//!
//! ## 环境变量
//! - `CHASER_CDP_ENDPOINT`: 已运行浏览器的端点；未设置时启动本地浏览器
//! - `CHASER_ALLOWED_DOMAINS`: 允许导航的域名（逗号分隔）
//! - `RUST_LOG`: 日志过滤（默认使用配置中的 `log_level`）

use anyhow::{bail, Context};
use chaser_engine::{config::Config, ports::PortPool, BrowserEngine};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Default)]
struct Args {
    config: Option<String>,
    screenshot: bool,
    url: Option<String>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args::default();
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                args.config = Some(iter.next().context("--config needs a file path")?);
            }
            "--screenshot" => args.screenshot = true,
            flag if flag.starts_with('-') => bail!("Unknown option {}", flag),
            url => {
                if args.url.replace(url.to_string()).is_some() {
                    bail!("Only one URL may be given");
                }
            }
        }
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args()?;
    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    info!("chaser-engine v{}", chaser_engine::VERSION);

    let pool = PortPool::from_config(&config);
    let engine = BrowserEngine::start(config, &pool)
        .await
        .context("Failed to start the browser engine")?;

    let result = async {
        if let Some(url) = &args.url {
            let committed = engine
                .navigate(url)
                .await
                .with_context(|| format!("Navigation to {} failed", url))?;
            info!("Navigated to {}", committed);
        }
        let state = engine.get_state(args.screenshot).await?;
        println!("{}", serde_json::to_string_pretty(&state)?);
        anyhow::Ok(())
    }
    .await;

    if let Err(e) = engine.shutdown().await {
        warn!("Shutdown failed: {}", e);
    }
    result
}
