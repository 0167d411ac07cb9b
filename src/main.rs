use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{info, LevelFilter};
use tokio::net::TcpListener;

use ccsdk_gateway::api;
use ccsdk_gateway::db::Database;
use ccsdk_gateway::engine::{CliEngine, CliEngineConfig, EngineAdapter};
use ccsdk_gateway::hub::SessionHub;
use ccsdk_gateway::settings::GatewayConfig;
use ccsdk_gateway::store::SessionStore;

const APP_NAME: &str = "ccsdk-gateway";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.common)?;

    match cli.command {
        Command::Serve(cmd) => async_serve(cli.common, cmd),
    }
}

#[tokio::main]
async fn async_serve(common: CommonOpts, cmd: ServeCommand) -> Result<()> {
    handle_serve(&common, cmd).await
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Session gateway for the code-assistant engine.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON logs
    #[arg(long, global = true)]
    json: bool,
}

impl CommonOpts {
    fn effective_log_level(&self) -> LevelFilter {
        if self.trace || self.verbose >= 3 {
            LevelFilter::Trace
        } else if self.debug || self.verbose >= 1 {
            LevelFilter::Debug
        } else if self.quiet {
            LevelFilter::Error
        } else {
            LevelFilter::Info
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the gateway server
    Serve(ServeCommand),
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Host address to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
    /// Port to listen on (overrides SERVER_PORT)
    #[arg(short, long)]
    port: Option<u16>,
}

fn init_logging(common: &CommonOpts) -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let level = match common.effective_log_level() {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("ccsdk_gateway={level},tower_http={level}")));

    if common.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .ok();
    }

    Ok(())
}

async fn handle_serve(common: &CommonOpts, cmd: ServeCommand) -> Result<()> {
    info!("Starting {} server...", APP_NAME);

    let mut config = GatewayConfig::load(common.config.as_deref())?;
    if let Some(port) = cmd.port {
        config.server_port = port;
    }

    info!("Database path: {}", config.db_path.display());
    let database = Database::new(&config.db_path).await?;
    let store = SessionStore::new(database.pool().clone());

    let config = Arc::new(config);
    let engine: Arc<dyn EngineAdapter> = Arc::new(CliEngine::new(CliEngineConfig {
        binary: config.engine_binary.clone(),
    }));
    info!(
        "Engine: {} (model={}, permission_mode={})",
        config.engine_binary, config.model, config.permission_mode
    );

    let hub = SessionHub::new(store.clone(), Arc::clone(&engine), Arc::clone(&config));
    let state = api::AppState::new(Arc::clone(&hub), store, engine, Arc::clone(&config));
    let app = api::create_router(state);

    let addr: SocketAddr = format!("{}:{}", cmd.host, config.server_port)
        .parse()
        .context("invalid address")?;

    let listener = TcpListener::bind(addr)
        .await
        .context("binding to address")?;

    info!("Listening on http://{}", addr);

    let shutdown_signal = async move {
        let ctrl_c = async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        info!("Shutdown signal received, stopping sessions...");
        hub.shutdown().await;
        info!("Shutdown complete");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("running server")?;

    Ok(())
}
