//! Volume Binder
//!
//! Runs the binder controller against a Kubernetes cluster (or, with
//! `--standalone`, an in-process store) and serves the operator API.

use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use volume_binder::{
    ApiServer, ApiServerConfig, BackendFactory, BinderConfig, Controller, Error, MemoryStores,
    Result, Stores,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Volume Binder - binds storage volumes to claims
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long, env = "VOLUME_BINDER_CONFIG")]
    config: Option<PathBuf>,

    /// Operator API bind address (overrides `server.addr`)
    #[arg(long, env = "API_ADDR")]
    addr: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Run against an in-process store (no Kubernetes)
    #[arg(long, env = "STANDALONE")]
    standalone: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let mut config = match &args.config {
        Some(path) => BinderConfig::load(path)?,
        None => BinderConfig::default(),
    };
    if let Some(addr) = &args.addr {
        config.server.addr = addr.clone();
    }
    config.validate()?;

    info!(
        version = volume_binder::VERSION,
        standalone = args.standalone,
        addr = %config.server.addr,
        "starting volume binder"
    );

    let stores = if args.standalone {
        info!("using in-process object store");
        MemoryStores::new().as_stores()
    } else {
        let client = kube::Client::try_default().await?;
        Stores::kubernetes(client)
    };

    let plugins = BackendFactory::create(&config.plugins)?;
    let controller = Controller::new(stores, plugins, config.controller.clone())?;
    let api = ApiServer::new(ApiServerConfig::try_from(&config.server)?, controller.handle());

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    let api_task = tokio::spawn(api.run(shutdown.clone()));
    let result = controller.run(shutdown.clone()).await;

    // The controller only returns on shutdown or failure; stop the API either way
    shutdown.cancel();
    match api_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "operator API failed"),
        Err(e) => error!(error = %e, "operator API task panicked"),
    }

    info!("volume binder shutdown complete");
    result
}

/// Cancel `shutdown` on SIGINT or SIGTERM
async fn watch_signals(shutdown: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "failed to listen for ctrl-c");
                return;
            }
            info!("received interrupt");
        }
        _ = terminate => info!("received SIGTERM"),
    }
    shutdown.cancel();
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "tower=warn", "tower_http=info"] {
        filter = filter.add_directive(
            directive
                .parse()
                .map_err(|e| Error::Configuration(format!("bad log directive {}: {}", directive, e)))?,
        );
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}
