use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};
use tradebridge_brokers_common::BrokerRegistry;
use tradebridge_server::{BridgeConfig, BridgeState};

const DEFAULT_CONFIG: &str = "bridge.toml";

#[derive(Parser)]
#[command(name = "tradebridge")]
#[command(about = "Bridge between MetaTrader 5 terminals and broker execution APIs")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Server config file (TOML). Defaults to ./bridge.toml when present.
    #[arg(short, long, env = "TRADEBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Broker credentials file (JSON or TOML)
    #[arg(short, long, env = "TRADEBRIDGE_BROKERS")]
    brokers: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge server
    Serve {
        /// Bind address (e.g. "127.0.0.1")
        #[arg(long)]
        bind: Option<String>,

        /// TCP port
        #[arg(short, long)]
        port: Option<u16>,

        /// Allow binding a non-loopback interface
        #[arg(long)]
        allow_remote: bool,
    },

    /// Validate the server and broker configuration, then exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(brokers) = cli.brokers {
        config.brokers.config_path = brokers;
    }

    match cli.command {
        Commands::Serve {
            bind,
            port,
            allow_remote,
        } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            config.server.allow_remote |= allow_remote;
            config.validate()?;
            serve(config).await
        }
        Commands::CheckConfig => {
            config.validate()?;
            let registry = load_registry(&config.brokers.config_path)?;
            let snapshot = registry.snapshot();
            println!("Listen address: {}", config.server.socket_addr()?);
            println!("Broker file:    {}", config.brokers.config_path.display());
            println!("Brokers:");
            for name in registry.names() {
                if let Some(broker) = snapshot.get(&name) {
                    let mode = if broker.demo { "demo" } else { "live" };
                    let status = if broker.enabled { "enabled" } else { "disabled" };
                    println!("  {:<16} {:<8} {:<4} {}", name, status, mode, broker.api_url);
                }
            }
            println!("Configuration OK ({} enabled)", registry.enabled_count());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<BridgeConfig> {
    match path {
        Some(path) => Ok(BridgeConfig::load(path)?),
        None if Path::new(DEFAULT_CONFIG).exists() => Ok(BridgeConfig::load(Path::new(DEFAULT_CONFIG))?),
        None => {
            tracing::info!("No config file found, using defaults");
            Ok(BridgeConfig::default())
        }
    }
}

fn load_registry(path: &Path) -> Result<BrokerRegistry> {
    BrokerRegistry::from_file(path)
        .with_context(|| format!("loading broker config {}", path.display()))
}

async fn serve(config: BridgeConfig) -> Result<ExitCode> {
    let state = Arc::new(BridgeState::from_config(config)?);
    spawn_reload_handler(Arc::clone(&state))?;

    let report = tradebridge_server::start_server(state, shutdown_signal()).await?;
    if report.clean() {
        tracing::info!("Shutdown complete");
        Ok(ExitCode::SUCCESS)
    } else {
        tracing::warn!(forced = report.forced, "Shutdown forced sessions closed");
        Ok(ExitCode::from(2))
    }
}

/// Reload broker credentials on SIGHUP.
#[cfg(unix)]
fn spawn_reload_handler(state: Arc<BridgeState>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            match state.reload_brokers() {
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Reload failed, keeping current brokers"),
            }
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn spawn_reload_handler(_state: Arc<BridgeState>) -> Result<()> {
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl-C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
