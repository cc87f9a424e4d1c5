use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use slimclaw::config::Config;
use slimclaw::server::Server;

#[derive(Parser)]
#[command(name = "slimclaw")]
#[command(about = "SlimClaw - LLM inference optimizer and sidecar router")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the sidecar proxy
    Serve {
        /// Configuration file path
        #[arg(short, long, default_value = "slimclaw.toml")]
        config: String,
        /// Bind address
        #[arg(short, long)]
        bind: Option<String>,
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Check configuration and provider credentials
    Check {
        /// Configuration file path
        #[arg(short, long, default_value = "slimclaw.toml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "slimclaw=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment variables
    dotenv::dotenv().ok();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, bind, port } => {
            info!("🚀 Starting SlimClaw v{}", env!("CARGO_PKG_VERSION"));

            // Load configuration
            let mut cfg = Config::load(&config)?;

            // Override with CLI arguments
            if let Some(bind_addr) = bind {
                cfg.proxy.bind = bind_addr;
            }
            if let Some(port_num) = port {
                cfg.proxy.port = port_num;
            }

            // Start server
            let server = Server::new(cfg)?;
            server.start().await?;
        }
        Commands::Check { config } => {
            info!("🔍 Checking SlimClaw configuration...");

            let cfg = Config::load(&config)?;
            info!("✅ Configuration loaded successfully");

            let credentials = slimclaw::providers::CredentialMap::from_config(&cfg.proxy);
            info!(
                "✅ {} provider(s) with resolvable credentials",
                credentials.len()
            );
            info!(
                "mode={} windowing={} routing={} caching={} metrics={}",
                cfg.optimizer.mode.as_str(),
                cfg.windowing.enabled,
                cfg.routing.enabled,
                cfg.caching.enabled,
                cfg.metrics.enabled
            );

            info!("✅ Configuration check complete");
        }
    }

    Ok(())
}
