use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use nuclio_platform::{
    builder::PrebuiltImageBuilder,
    config::PlatformConfig,
    docker::{ContainerRuntime, DockerRuntime},
    platform::Platform,
    tracing::setup_tracing,
};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = PlatformConfig::load(cli.config.as_deref())?;

    setup_tracing(&config)?;

    let runtime: Arc<dyn ContainerRuntime> = match &config.docker.address {
        Some(address) => Arc::new(DockerRuntime::with_address(address)?),
        None => Arc::new(DockerRuntime::new()?),
    };

    let platform = Platform::new(config, runtime, Arc::new(PrebuiltImageBuilder)).await?;
    tracing::info!("Local platform ready");

    tokio::signal::ctrl_c().await?;
    platform.close().await;
    Ok(())
}
