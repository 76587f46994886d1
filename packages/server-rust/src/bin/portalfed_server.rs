//! portalfed server: loads the orchestrator configuration, probes instance
//! health in the background, and serves the HTTP API until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use portalfed_server::network::{NetworkConfig, NetworkModule};
use portalfed_server::service::{HealthProbeWorker, Orchestrator, OrchestratorConfig};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "portalfed-server",
    version,
    about = "Service provider federation engine"
)]
struct Cli {
    /// Orchestrator configuration (JSON). Defaults apply when omitted.
    #[arg(short, long, env = "PORTALFED_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "PORTALFED_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(short, long, env = "PORTALFED_PORT", default_value_t = 8080)]
    port: u16,

    /// Allowed CORS origin; repeat for several.
    #[arg(long = "cors-origin", default_value = "*")]
    cors_origins: Vec<String>,

    /// Upper bound on one HTTP request.
    #[arg(long, env = "PORTALFED_REQUEST_TIMEOUT_MS", default_value_t = 300_000)]
    request_timeout_ms: u64,

    #[arg(
        long,
        value_enum,
        env = "PORTALFED_LOG_FORMAT",
        default_value = "pretty"
    )]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = match &cli.config {
        Some(path) => OrchestratorConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => OrchestratorConfig::default(),
    };
    let orchestrator = Arc::new(Orchestrator::builder(config).build()?);
    let mut prober = HealthProbeWorker::start(orchestrator.health_monitor());

    let network = NetworkConfig {
        host: cli.host,
        port: cli.port,
        cors_origins: cli.cors_origins,
        request_timeout_ms: cli.request_timeout_ms,
        ..NetworkConfig::default()
    };
    let mut module = NetworkModule::new(network, Arc::clone(&orchestrator));
    let port = module.start().await?;
    info!(port, "portalfed server listening");

    // The server stops on its own once the orchestrator starts draining.
    let server = tokio::spawn(module.serve(std::future::pending()));

    shutdown_signal().await;
    info!("shutdown requested");
    orchestrator.shutdown().await;
    prober.stop().await;
    server.await??;
    Ok(())
}
