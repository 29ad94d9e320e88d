//! Submits a neural-style job from the command line.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use imager::service::{ImageFormat, InputImage};
use imager::{ImagerClient, RpcConfig, HOST_ENV, PORT_ENV};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "neural-style-cli")]
#[command(about = "Submit images to a neural-style imager")]
struct Cli {
    /// Imager host; without it IMAGER_HOST and IMAGER_PORT are used
    #[arg(long, global = true)]
    host: Option<String>,

    /// Imager port used with --host
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Give up on the call after this many seconds
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Render a content image in every style the server has loaded
    Create {
        /// Job name
        #[arg(long)]
        name: String,

        /// Content image
        #[arg(long)]
        content_image: PathBuf,
    },
    /// Render a content image in the given style
    CreateFull {
        /// Job name
        #[arg(long)]
        name: String,

        /// Style image; its file stem becomes the style title
        #[arg(long)]
        style_image: PathBuf,

        /// Content image
        #[arg(long)]
        content_image: PathBuf,
    },
}

fn endpoint(cli: &Cli) -> anyhow::Result<RpcConfig> {
    let mut config = match &cli.host {
        Some(host) => RpcConfig::new(host.clone(), cli.port.unwrap_or(8081)),
        None => RpcConfig::from_env()
            .with_context(|| format!("pass --host or set {HOST_ENV} and {PORT_ENV}"))?,
    };
    if let Some(secs) = cli.timeout_secs {
        config = config.with_call_timeout(Duration::from_secs(secs));
    }
    Ok(config)
}

async fn read_image(path: &Path) -> anyhow::Result<Vec<u8>> {
    let image = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    if image.is_empty() {
        bail!("{} is empty", path.display());
    }
    Ok(image)
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let client = ImagerClient::new(endpoint(&cli)?)?;

    let outcome = match &cli.command {
        Command::Create { name, content_image } => {
            let content = read_image(content_image).await?;
            client.create_job(name.as_str(), content).await
        }
        Command::CreateFull {
            name,
            style_image,
            content_image,
        } => {
            let style = InputImage {
                title: file_stem(style_image),
                format: ImageFormat::Jpg,
                image: read_image(style_image).await?,
            };
            let content = InputImage {
                title: name.clone(),
                format: ImageFormat::Jpg,
                image: read_image(content_image).await?,
            };
            client.create_full_job(name.as_str(), style, content).await
        }
    };

    client.shutdown().await;
    outcome?;
    info!("Job submitted");
    Ok(())
}
