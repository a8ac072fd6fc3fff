use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};

use videocache::config::{self, Bootstrap};
use videocache::{logging, metrics, runtime, Builder};

#[derive(Parser, Debug)]
#[command(name = "videocache", about = "Local caching proxy for progressive media downloads", version)]
struct Cli {
    /// Config file path
    #[arg(short = 'c')]
    config: Option<PathBuf>,

    /// Cache directory, overrides cache.dir
    #[arg(short = 'd', long = "cache-dir")]
    cache_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Remote urls to print proxied urls for
    urls: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut cfg, ignored) = match &cli.config {
        Some(path) => config::load(path)?,
        None => (Bootstrap::default(), Vec::new()),
    };
    if let Some(dir) = cli.cache_dir.clone() {
        cfg.cache.dir = dir;
    }
    if cfg.cache.dir.as_os_str().is_empty() {
        cfg.cache.dir = std::env::temp_dir().join("videocache");
    }

    logging::init(&cfg.logger, cli.verbose)?;
    if !ignored.is_empty() {
        log::warn!("ignoring unknown config fields: {}", ignored.join(", "));
    }
    let info = serde_json::to_string(&runtime::build_info()).context("encode build info")?;
    log::info!("videocache starting {info}");

    let server = Builder::from_bootstrap(&cfg)?.build().await?;
    if !server.is_pinged() {
        log::warn!("proxy is not reachable, urls are passed through unchanged");
    }
    for url in &cli.urls {
        println!("{url} -> {}", server.proxy_url(url));
    }

    wait_for_signal().await;
    server.shutdown();
    print!("{}", metrics::render());
    Ok(())
}

async fn wait_for_signal() {
    let mut sigterm = signal(SignalKind::terminate()).ok();
    let mut sigint = signal(SignalKind::interrupt()).ok();
    tokio::select! {
        _ = async {
            match sigterm.as_mut() {
                Some(sig) => { let _ = sig.recv().await; }
                None => std::future::pending::<()>().await,
            }
        } => log::info!("received SIGTERM"),
        _ = async {
            match sigint.as_mut() {
                Some(sig) => { let _ = sig.recv().await; }
                None => std::future::pending::<()>().await,
            }
        } => log::info!("received SIGINT"),
    }
}
