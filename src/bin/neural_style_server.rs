//! Serves an in-memory neural-style imager.

use anyhow::Context;
use clap::Parser;
use imager::memory::MemoryImager;
use imager::service::ImagerServer;
use imager::{runtime, RpcConfig};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "neural-style-server")]
#[command(about = "In-memory neural-style imager")]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(long, default_value_t = 8081)]
    port: u16,

    /// Directory that receives the images of every job
    #[arg(long)]
    output: Option<PathBuf>,

    /// JSON file holding an array of style image paths
    #[arg(long)]
    styles: Option<PathBuf>,
}

async fn load_styles(imager: &MemoryImager, list: &Path) -> anyhow::Result<usize> {
    let raw = tokio::fs::read(list)
        .await
        .with_context(|| format!("reading {}", list.display()))?;
    let paths: Vec<PathBuf> = serde_json::from_slice(&raw)
        .with_context(|| format!("parsing {}", list.display()))?;

    for path in &paths {
        imager
            .load_style(path)
            .await
            .with_context(|| format!("loading style {}", path.display()))?;
    }
    Ok(paths.len())
}

/// Resolves when `signal` fires. A signal that cannot be installed stops
/// the server too, with a warning.
async fn stop_on(signal: impl Future<Output = io::Result<()>>) {
    if let Err(err) = signal.await {
        warn!("cannot listen for Ctrl-C, stopping: {err}");
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut imager = MemoryImager::new();
    if let Some(output) = &cli.output {
        tokio::fs::create_dir_all(output)
            .await
            .with_context(|| format!("creating {}", output.display()))?;
        imager = imager.with_output_dir(output);
    }
    if let Some(styles) = &cli.styles {
        let count = load_styles(&imager, styles).await?;
        info!("Loaded {count} styles");
    }

    let imager = Arc::new(imager);
    let mut server = ImagerServer::new(imager.clone(), RpcConfig::new(cli.host, cli.port));
    server.register_worker(imager).await;
    let listener = server.bind().await?;
    server
        .run_until(listener, stop_on(tokio::signal::ctrl_c()))
        .await?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    runtime::server_runtime()?.block_on(run(cli))
}
