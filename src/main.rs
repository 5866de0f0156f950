use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dotenvy::dotenv;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use flowlens::bridge::BridgeTiming;
use flowlens::bridge::store::BridgeTokenStore;
use flowlens::config::Config;
use flowlens::server::{self, AppState};

#[derive(Parser)]
#[command(name = "flowlens", about = "Design flow analysis orchestrator")]
enum Cli {
    /// Start the auth-bridge server (default when no subcommand is given)
    #[command(alias = "run")]
    Serve {
        /// Path to flowlens.toml
        #[arg(long, default_value = "flowlens.toml")]
        config: PathBuf,
        /// Override the configured port
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv().ok();

    // Default to Serve when no subcommand is given, but still allow
    // --help and --version to work.
    let args: Vec<String> = std::env::args().collect();
    let cli = if args.len() <= 1 {
        Cli::Serve {
            config: PathBuf::from("flowlens.toml"),
            port: None,
        }
    } else {
        Cli::parse()
    };

    match cli {
        Cli::Serve { config, port } => run_server(&config, port).await,
    }
}

async fn run_server(config_path: &Path, port_override: Option<u16>) -> Result<(), Box<dyn Error>> {
    let config = Config::load_or_default(config_path).context("failed to load configuration")?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("flowlens=info,tower_http=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_tree::HierarchicalLayer::new(2)
                .with_targets(true)
                .with_bracketed_fields(false),
        )
        .init();

    let token_store = Arc::new(BridgeTokenStore::new(BridgeTiming::from(&config.bridge)));

    let app_state = AppState {
        token_store,
        environment: config.server.environment.clone(),
    };
    let app = server::create_app(app_state);

    let port = port_override.unwrap_or(config.server.port);
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(
        environment = %config.server.environment,
        ttl_secs = config.bridge.token_ttl_secs,
        "auth bridge listening on http://{addr}"
    );
    axum::serve(listener, app).await?;

    Ok(())
}
