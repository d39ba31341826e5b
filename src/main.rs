use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;

use tollgate::config::{LogFormat, LoggingConfig, TollgateConfig};
use tollgate::management::{ManagementServer, ManagementService};
use tollgate::ratelimit::{
    spawn_policy_reloader, AdmissionController, InMemoryStore, PolicyCatalog, RateLimiterEngine,
    StateStore, SystemClock,
};

/// Admission-control and rate-limiting engine.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Cli {
    /// Service configuration file (YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check a policy file and print what it declares
    Validate {
        /// Policy file (YAML or JSON)
        #[arg(short, long)]
        policies: PathBuf,
    },
    /// Serve the management protocol on stdin/stdout
    Serve {
        /// Policy file, overriding `policies.path` from the configuration
        #[arg(short, long)]
        policies: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = TollgateConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    init_tracing(&config.logging);

    match cli.command {
        Command::Validate { policies } => validate(&policies),
        Command::Serve { policies } => serve(config, policies).await,
    }
}

/// Initialize tracing on stderr; stdout carries the management protocol.
fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true);

    match logging.format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Text => subscriber.init(),
    }
}

fn validate(path: &Path) -> anyhow::Result<()> {
    let catalog = PolicyCatalog::from_file(path)
        .with_context(|| format!("Invalid policy file {}", path.display()))?;

    println!("{}: {} policies", path.display(), catalog.len());
    for policy in catalog.iter() {
        println!(
            "  {:<24} {:<12} rate={}/{}s burst={} scope={} path={}",
            policy.name(),
            policy.algorithm(),
            policy.rate(),
            policy.period(),
            policy.burst(),
            policy.scope(),
            policy.path_pattern(),
        );
    }
    Ok(())
}

async fn serve(config: TollgateConfig, policies: Option<PathBuf>) -> anyhow::Result<()> {
    info!("Starting Tollgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let policy_path = policies.or_else(|| config.policies.path.as_ref().map(PathBuf::from));
    let catalog = match &policy_path {
        Some(path) => PolicyCatalog::from_file(path)
            .with_context(|| format!("Invalid policy file {}", path.display()))?,
        None => PolicyCatalog::new(),
    };
    info!(policies = catalog.len(), "Policies loaded");

    let store: Arc<dyn StateStore> = match config.store.max_entries {
        Some(max) => Arc::new(InMemoryStore::with_capacity_limit(max)),
        None => Arc::new(InMemoryStore::new()),
    };
    let engine = Arc::new(
        RateLimiterEngine::with_parts(catalog, store, Arc::new(SystemClock))
            .with_options(config.engine.options()),
    );
    info!(
        unmatched = ?config.engine.unmatched,
        store_failure = ?config.engine.store_failure,
        "Rate limiter engine initialized"
    );

    let reloader = match &policy_path {
        Some(path) if config.policies.reload_interval_secs > 0 => Some(spawn_policy_reloader(
            engine.clone(),
            path.clone(),
            Duration::from_secs(config.policies.reload_interval_secs),
        )),
        _ => None,
    };

    let admission =
        AdmissionController::new(engine, &config.engine.skip_paths, config.engine.store_failure)?;
    let server = ManagementServer::new(Arc::new(ManagementService::new(admission)));

    server.serve_stdio_with_shutdown(shutdown_signal()).await?;

    if let Some(reloader) = reloader {
        reloader.abort();
    }
    info!("Tollgate stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
