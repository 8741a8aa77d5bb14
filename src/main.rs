//! Scale agent - simulated downstream clusters for coordinator scale tests

use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use scale_agent::agent::{Collaborators, ScaleAgent};
use scale_agent::config::{default_config_path, AgentConfig, ConfigOverrides};
use scale_agent::telemetry::{init_logging, LoggingConfig};

/// Scale agent - registers fleets of simulated clusters with a coordinator
#[derive(Parser, Debug)]
#[command(name = "scale-agent", version, about, long_about = None)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(long, env = "SCALE_AGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Port for the HTTP control surface
    #[arg(long, env = "SCALE_AGENT_LISTEN_PORT")]
    listen_port: Option<u16>,

    /// Log level used when RUST_LOG is unset
    #[arg(long, env = "SCALE_AGENT_LOG_LEVEL")]
    log_level: Option<String>,

    /// Directory holding the registry snapshot
    #[arg(long, env = "SCALE_AGENT_STATE_DIR")]
    state_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Both reqwest and tungstenite build rustls configs; they need one
    // process-wide provider
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install aws-lc-rs crypto provider: {:?}. \
             Tunnels and coordinator calls cannot use TLS without it.",
            e
        );
        std::process::exit(1);
    }

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(default_config_path);
    let config = AgentConfig::load(
        &config_path,
        ConfigOverrides {
            listen_port: cli.listen_port,
            log_level: cli.log_level,
            state_dir: cli.state_dir,
        },
    )
    .map_err(|e| anyhow::anyhow!("{}", e))?;

    init_logging(LoggingConfig {
        level: config.log_level.clone(),
        format: config.log_format,
    })?;

    tracing::info!(
        config = %config_path.display(),
        coordinator = %config.coordinator_url,
        listen_port = config.listen_port,
        "Starting scale agent"
    );

    let collaborators =
        Collaborators::from_config(&config).map_err(|e| anyhow::anyhow!("{}", e))?;
    let agent = ScaleAgent::new(config, collaborators).map_err(|e| anyhow::anyhow!("{}", e))?;

    match agent.restore().await {
        Ok(restored) => tracing::info!(restored, "Registry restored"),
        Err(e) => tracing::warn!(error = %e, "Starting with an empty registry"),
    }
    if let Err(e) = agent.sweep_orphans().await {
        tracing::warn!(error = %e, "Startup orphan sweep skipped");
    }
    let background = agent.spawn_background();

    let addr = format!("0.0.0.0:{}", agent.config().listen_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", addr, e))?;
    tracing::info!(addr = %addr, "Control surface listening");

    let shutdown = agent.shutdown_token();
    tokio::spawn(watch_signals(shutdown.clone()));

    axum::serve(listener, scale_agent::server::router(agent.clone()))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    agent.shutdown().map_err(|e| anyhow::anyhow!("{}", e))?;
    for handle in background {
        let _ = handle.await;
    }
    tracing::info!("Scale agent stopped");
    Ok(())
}

/// Cancel `shutdown` on SIGINT or SIGTERM
async fn watch_signals(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
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
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
    shutdown.cancel();
}
