//! llamagate - local LLM inference gateway
//!
//! Loads the configured GGUF model and serves it over HTTP.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use llamagate::inference::{ChatEngine, EngineConfig, LlamaLoader};
use llamagate::server::{self, ServerState};
use llamagate::storage::catalog::ModelCatalog;
use llamagate::storage::settings::load_settings;

#[derive(Debug, Parser)]
#[command(name = "llamagate", version, about = "Local LLM inference gateway")]
struct Args {
    /// Settings file (defaults to ./appsettings.json, then the config directory)
    #[arg(short, long, env = "LLAMAGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overrides the settings file (e.g. http://0.0.0.0:5000)
    #[arg(short, long, env = "LLAMAGATE_ADDRESS")]
    address: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("llamagate=info".parse()?))
        .init();

    info!("Starting llamagate v{}", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();
    let mut settings = load_settings(args.config.as_deref())?;
    if let Some(address) = args.address {
        settings.address = address;
    }
    let addr = settings.bind_addr()?;

    let catalog = ModelCatalog::new(&settings.models_path)?;
    let engine = ChatEngine::new(
        EngineConfig::from_settings(&settings),
        Arc::new(LlamaLoader::new()?),
    )?;

    if settings.default_model.trim().is_empty() {
        warn!("No default model configured; select one via /api/select-model");
    } else if let Err(e) = engine.initialize().await {
        // Keep serving so another model can still be selected
        error!("Failed to load default model: {}", e);
    }

    server::start_server(addr, ServerState::new(engine, catalog)).await?;
    Ok(())
}
