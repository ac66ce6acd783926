use anyhow::Result;
use clap::Parser;
use tracing::info;

use shoal::{Config, Proxy};

#[derive(Parser)]
#[command(name = "shoal")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "slot-sharded RESP proxy")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "shoal.toml")]
    config: String,

    /// Override the configured listen address.
    #[arg(short, long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shoal=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(&cli.config).await?;
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
        config.ensure_valid()?;
    }

    info!(version = env!("CARGO_PKG_VERSION"), "shoal starting");
    let proxy = Proxy::new(config);
    proxy.serve().await
}
