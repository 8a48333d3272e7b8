//! mcp-relay CLI entry point.

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mcp_relay::infrastructure::config::ConfigLoader;
use mcp_relay::infrastructure::http::serve;

/// HTTP gateway bridging REST requests to MCP server processes over stdio
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path to the MCP server registry file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen host
    #[arg(long)]
    host: Option<String>,

    /// Listen port
    #[arg(long)]
    port: Option<u16>,

    /// Working directory root for cloned/built server sources
    #[arg(long)]
    workdir: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    if let Err(err) = run(cli).await {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = ConfigLoader::load()?;
    // Flags win over the environment.
    if let Some(path) = cli.config {
        config.config_file = path;
    }
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(workdir) = cli.workdir {
        config.workdir = workdir;
    }
    ConfigLoader::validate(&config)?;

    let registry = ConfigLoader::load_registry(&config.config_file)?;
    serve(config, registry).await
}
