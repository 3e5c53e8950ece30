//! portfwd - single-rule TCP port forwarder with an HTTP control plane
//!
//! Listens for control requests and relays TCP connections from a source
//! address to a target address while a forwarding rule is active.

use anyhow::{Context, Result};
use clap::Parser;
use portfwd_api::{ApiServer, ApiServerConfig, DEFAULT_AUTH_SECRET};
use portfwd_core::{ForwardingSession, SessionConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// portfwd - forward a local TCP port to a target address, controlled over HTTP
#[derive(Parser, Debug)]
#[command(name = "portfwd")]
#[command(about = "Forward a TCP port to a target address, controlled over HTTP")]
#[command(version)]
#[command(long_about = r#"
portfwd relays every TCP connection accepted on a source address to a fixed
target address. The forwarding rule is started and stopped through a small
HTTP control API protected by a shared secret.

EXAMPLES:
  # Run the control API on the default address
  portfwd --auth s3cret

  # Forward immediately on boot
  portfwd --auth s3cret --from 0.0.0.0:2222 --to 10.0.0.5:22

  # Drive it over HTTP
  curl 'http://127.0.0.1:8000/ForwardWork?auth=s3cret&status=1&fromAddr=0.0.0.0:2222&toAddr=10.0.0.5:22'
  curl 'http://127.0.0.1:8000/ServerSummary'
  curl 'http://127.0.0.1:8000/ForwardWork?auth=s3cret&status=0'

ENVIRONMENT VARIABLES:
  PORTFWD_REST_API      Control API listen address
  PORTFWD_AUTH          Shared secret for control requests
  PORTFWD_DIAL_TIMEOUT  Seconds to wait when connecting to the target
"#)]
struct Cli {
    /// Listen address for the control API
    #[arg(long = "rest-api", env = "PORTFWD_REST_API", default_value = "0.0.0.0:8000")]
    rest_api: SocketAddr,

    /// Shared secret required by control requests
    #[arg(long, env = "PORTFWD_AUTH", default_value = DEFAULT_AUTH_SECRET, hide_default_value = true)]
    auth: String,

    /// Seconds to wait when connecting to the target
    #[arg(long, env = "PORTFWD_DIAL_TIMEOUT", default_value = "30")]
    dial_timeout: u64,

    /// Start forwarding from this address on boot (requires --to)
    #[arg(long, requires = "to")]
    from: Option<String>,

    /// Target address for --from
    #[arg(long, requires = "from")]
    to: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable verbose logging (same as --log-level debug)
    #[arg(short, long)]
    verbose: bool,
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

fn version_string() -> String {
    format!(
        "{} ({}, built {})",
        env!("GIT_TAG"),
        env!("GIT_HASH"),
        env!("BUILD_TIME")
    )
}

/// Resolve on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
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
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { cli.log_level.as_str() };
    setup_logging(log_level)?;

    let version = version_string();
    info!("portfwd {} starting...", version);

    let session = Arc::new(ForwardingSession::new(SessionConfig {
        dial_timeout: Duration::from_secs(cli.dial_timeout),
        ..SessionConfig::default()
    }));

    if let (Some(from), Some(to)) = (&cli.from, &cli.to) {
        session
            .start(from, to)
            .await
            .with_context(|| format!("Failed to start forwarding {} -> {}", from, to))?;
    }

    let config = ApiServerConfig {
        bind_addr: cli.rest_api,
        auth_secret: cli.auth,
        version,
    };
    info!("restApi: {}", config.bind_addr);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = ApiServer::new(config, session.clone());
    let server_task = tokio::spawn(server.start(async move {
        let _ = shutdown_rx.await;
    }));
    tokio::pin!(server_task);

    tokio::select! {
        _ = shutdown_signal() => {
            info!("Received shutdown signal, stopping forwarding...");
        }
        result = &mut server_task => {
            session.stop().await;
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    error!("Control API error: {:#}", e);
                    Err(e)
                }
                Err(e) => {
                    error!("Control API task panicked: {}", e);
                    Err(e.into())
                }
            };
        }
    }

    // A second signal while draining forces the process down
    tokio::spawn(async {
        shutdown_signal().await;
        warn!("Force shutdown");
        std::process::exit(1);
    });

    session.stop().await;
    let _ = shutdown_tx.send(());
    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Control API stopped with error: {:#}", e),
        Err(e) => warn!("Control API task failed: {}", e),
    }

    info!("portfwd stopped");
    Ok(())
}
