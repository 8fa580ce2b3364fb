//! Sockbridge CLI - relay sockets between TCP, UDP, Unix and TLS endpoints
//!
//! Runs every route from the route file (or one route given on the command
//! line) until SIGINT, SIGTERM or SIGQUIT.

mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use sockbridge_cert::{CertificateAuthority, SecurityPolicy};
use sockbridge_relay::{RouteConfig, Tunnel};
use sockbridge_transport::DialerPool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Sockbridge - relay sockets across transports
#[derive(Parser, Debug)]
#[command(name = "sockbridge")]
#[command(about = "Sockbridge - relay sockets between TCP, UDP, Unix and TLS endpoints")]
#[command(version)]
#[command(args_conflicts_with_subcommands = true)]
#[command(long_about = r#"
Relay connections from an inbound endpoint to an outbound endpoint, for
example to expose a Unix socket service over mutual TLS or to terminate TLS
in front of a plaintext backend.

Endpoints are written as scheme://address with scheme tcp, udp, unix or tls.
A missing scheme means tcp.

EXAMPLES:
  # Run every route in ~/.sockbridge.yaml
  sockbridge

  # Forward a local port to a Unix socket
  sockbridge tcp://127.0.0.1:8080 unix:///run/app.sock

  # Use a persisted CA so "inner" trust survives restarts
  sockbridge gen-ca --cert ca.pem --key ca.key
  sockbridge --ca-cert ca.pem --ca-key ca.key --config routes.yaml

ENVIRONMENT VARIABLES:
  SOCKBRIDGE_CONFIG                 Route file path
  SOCKBRIDGE_LOG_LEVEL              Log filter (e.g. info, sockbridge_relay=debug)
  SOCKBRIDGE_FORCE_VERIFY_INBOUND   Always verify inbound TLS peers
  SOCKBRIDGE_FORCE_VERIFY_OUTBOUND  Always verify outbound TLS peers
  SOCKBRIDGE_FORCE_VERIFY_BOTH      Always verify TLS peers on both sides
  SOCKBRIDGE_CA_CERT                Persisted CA certificate (PEM)
  SOCKBRIDGE_CA_KEY                 Persisted CA private key (PEM)
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log filter, overrides --verbose
    #[arg(long, env = "SOCKBRIDGE_LOG_LEVEL", global = true)]
    log_level: Option<String>,

    /// Route file (default: ~/.sockbridge.yaml, then ./.sockbridge.yaml)
    #[arg(short, long, env = "SOCKBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Verify inbound TLS peers even where a route disables it
    #[arg(long, env = "SOCKBRIDGE_FORCE_VERIFY_INBOUND")]
    force_verify_inbound: bool,

    /// Verify outbound TLS peers even where a route disables it
    #[arg(long, env = "SOCKBRIDGE_FORCE_VERIFY_OUTBOUND")]
    force_verify_outbound: bool,

    /// Verify TLS peers on both sides even where a route disables it
    #[arg(long, env = "SOCKBRIDGE_FORCE_VERIFY_BOTH")]
    force_verify_both: bool,

    /// CA certificate to issue route certificates from
    #[arg(long, env = "SOCKBRIDGE_CA_CERT", requires = "ca_key")]
    ca_cert: Option<PathBuf>,

    /// Private key of --ca-cert
    #[arg(long, env = "SOCKBRIDGE_CA_KEY", requires = "ca_cert")]
    ca_key: Option<PathBuf>,

    /// Inbound endpoint of a single ad-hoc route
    #[arg(requires = "outbound")]
    inbound: Option<String>,

    /// Outbound endpoint of a single ad-hoc route
    outbound: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a CA and write it as PEM files
    GenCa {
        /// Certificate output path
        #[arg(long)]
        cert: PathBuf,

        /// Private key output path
        #[arg(long)]
        key: PathBuf,
    },
}

impl Cli {
    fn security_policy(&self) -> SecurityPolicy {
        SecurityPolicy {
            force_verify_inbound: self.force_verify_inbound,
            force_verify_outbound: self.force_verify_outbound,
            force_verify_both: self.force_verify_both,
        }
    }

    fn routes(&self) -> Result<Vec<RouteConfig>> {
        if let (Some(inbound), Some(outbound)) = (&self.inbound, &self.outbound) {
            return Ok(vec![RouteConfig::new("cli", inbound.as_str(), outbound.as_str())]);
        }

        let path = match &self.config {
            Some(path) => path.clone(),
            None => config::default_config_path().with_context(|| {
                format!(
                    "No route file given and no {} found in the home or working directory",
                    config::DEFAULT_CONFIG_NAME
                )
            })?,
        };

        info!("Using route file {:?}", path);
        config::load_routes(&path)
    }

    fn certificate_authority(&self) -> Result<CertificateAuthority> {
        match (&self.ca_cert, &self.ca_key) {
            (Some(cert), Some(key)) => {
                let ca = CertificateAuthority::load(cert, key)
                    .with_context(|| format!("Failed to load CA from {:?}", cert))?;
                info!("Loaded CA from {:?}", cert);
                Ok(ca)
            }
            (None, None) => {
                CertificateAuthority::generate().context("Failed to generate CA")
            }
            _ => bail!("--ca-cert and --ca-key must be given together"),
        }
    }
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool, log_level: Option<&str>) {
    let default_level = if verbose { "debug" } else { "info" };

    let filter = log_level
        .and_then(|level| EnvFilter::try_new(level).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn gen_ca(cert: &Path, key: &Path) -> Result<()> {
    let ca = CertificateAuthority::generate().context("Failed to generate CA")?;
    ca.save_to_files(cert, key)
        .with_context(|| format!("Failed to write CA to {:?} / {:?}", cert, key))?;
    info!("Wrote CA certificate to {:?} and key to {:?}", cert, key);
    Ok(())
}

/// Resolves on the first SIGINT, SIGTERM or SIGQUIT
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (
            signal(SignalKind::terminate()),
            signal(SignalKind::quit()),
        ) {
            (Ok(mut terminate), Ok(mut quit)) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down..."),
                    _ = terminate.recv() => info!("Received SIGTERM, shutting down..."),
                    _ = quit.recv() => info!("Received SIGQUIT, shutting down..."),
                }
                return;
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!("Failed to install signal handlers: {}, falling back to Ctrl+C", e);
            }
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        return;
    }
    info!("Received Ctrl+C, shutting down...");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(cli.verbose, cli.log_level.as_deref());

    if let Some(Commands::GenCa { cert, key }) = &cli.command {
        return gen_ca(cert, key);
    }

    let routes = cli.routes()?;
    let ca = cli.certificate_authority()?;
    let policy = cli.security_policy();

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        signal_token.cancel();
    });

    let mut handles = Vec::with_capacity(routes.len());
    for route in routes {
        // A broken route is reported and skipped; the others keep running
        let tunnel = match Tunnel::from_route(&route, &ca, &policy) {
            Ok(tunnel) => tunnel,
            Err(e) => {
                error!(route = %route.name, "Route configuration failed: {}", e);
                continue;
            }
        };

        let token = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let name = tunnel.name().to_string();
            let inbound = tunnel.inbound().addr();
            if let Err(e) = tunnel.serve(Arc::new(DialerPool::new()), token).await {
                error!(route = %name, "Route failed: {}", e);
            }
            info!(route = %name, "{} quit", inbound);
        }));
    }

    if handles.is_empty() {
        bail!("No route could be started");
    }

    for result in futures::future::join_all(handles).await {
        if let Err(e) = result {
            error!("Route task panicked: {}", e);
        }
    }

    Ok(())
}
