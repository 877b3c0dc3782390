use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod addr;
mod app;
mod config;
mod error;
mod monitor;
mod pool;
mod proxy;
mod relay;
mod rules;
mod transport;

#[derive(Parser)]
#[command(name = "thestral")]
#[command(about = "A multi-protocol forwarding proxy", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy daemon.
    Run {
        #[arg(short, long, value_name = "FILE", default_value = "/etc/thestral.toml")]
        /// Path to the configuration file
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    match cli.command {
        Commands::Run { config } => {
            let settings = config::load(&config)?;
            let app = app::App::new(settings)?;

            let ctx = CancellationToken::new();
            let shutdown = ctx.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("shutdown signal received");
                    shutdown.cancel();
                }
            });

            app.run(ctx).await?;
            info!("exiting");
        }
    }

    Ok(())
}
