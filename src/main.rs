//! vrelay - HTTP to vsock relay
//!
//! `vrelay backend` runs inside the enclave and answers enveloped requests;
//! `vrelay gateway` runs on the parent instance and exposes them over HTTP.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use vrelay_backend::{Scheduling, Server};
use vrelay_gateway::{Gateway, Transport};
use vrelay_protocol::Framing;
use vrelay_transport::Endpoint;

#[derive(Parser)]
#[command(name = "vrelay")]
#[command(about = "Relay HTTP requests to an enclave over vsock")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the backend listener (inside the enclave)
    Backend(BackendArgs),

    /// Run the HTTP gateway (on the parent instance)
    Gateway(GatewayArgs),
}

#[derive(Args)]
struct BackendArgs {
    /// Port to listen on (default: 9001)
    #[arg(long)]
    port: Option<u16>,

    /// Use TCP instead of VSOCK
    #[arg(long)]
    tcp: bool,

    /// Address to bind in TCP mode
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Inbound framing: heuristic, close or length_prefixed
    #[arg(long)]
    framing: Option<Framing>,

    /// Handle connections concurrently instead of one at a time
    #[arg(long)]
    concurrent: bool,

    /// Seconds allowed to receive a whole request
    #[arg(long)]
    read_timeout: Option<u64>,

    /// YAML configuration file
    #[arg(short, long, env = "VRELAY_BACKEND_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Args)]
struct GatewayArgs {
    /// HTTP port to listen on (default: 5000)
    #[arg(long)]
    http_port: Option<u16>,

    /// Use TCP instead of VSOCK for the backend connection
    #[arg(long)]
    tcp: bool,

    /// Enclave CID for VSOCK connection
    #[arg(long)]
    enclave_cid: Option<u32>,

    /// Enclave host for TCP connection (default: localhost)
    #[arg(long)]
    enclave_host: Option<String>,

    /// Enclave port (default: 9001)
    #[arg(long)]
    enclave_port: Option<u16>,

    /// Wire framing: heuristic, close or length_prefixed
    #[arg(long)]
    framing: Option<Framing>,

    /// Backend connect and reply timeout in seconds (default: 5)
    #[arg(long)]
    timeout: Option<u64>,

    /// YAML configuration file
    #[arg(short, long, env = "VRELAY_GATEWAY_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Backend(args) => run_backend(args).await,
        Command::Gateway(args) => run_gateway(args).await,
    }
}

async fn run_backend(args: BackendArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => {
            let mut config = vrelay_backend::Config::from_file(path)?;
            config.apply_env_overrides();
            tracing::info!("Loaded config from {}", path.display());
            config
        }
        None => vrelay_backend::Config::load()?,
    };

    if args.tcp {
        let port = args.port.unwrap_or(match &config.listen {
            Endpoint::Tcp { port, .. } => *port,
            Endpoint::Vsock { .. } => vrelay_protocol::DEFAULT_BACKEND_PORT,
        });
        config.listen = Endpoint::tcp(args.host, port);
    } else if let Some(port) = args.port {
        config.set_port(port);
    }
    if let Some(framing) = args.framing {
        config.connection.framing = framing;
    }
    if args.concurrent {
        config.connection.scheduling = Scheduling::Concurrent;
    }
    if let Some(secs) = args.read_timeout {
        config.connection.read_timeout_secs = secs;
    }

    if let Err(e) = config.validate() {
        tracing::error!("{}", e);
        return Err(e.into());
    }

    tracing::info!("Starting vrelay backend");
    tracing::info!("  Listen: {} ({})", config.listen, config.listen.transport());
    tracing::info!("  Framing: {}", config.connection.framing);
    tracing::info!("  Read timeout: {}s", config.connection.read_timeout_secs);

    let server = Arc::new(Server::from_config(&config));

    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping backend...");
        shutdown_server.shutdown();
    });

    // Blocks until shutdown; a failed bind is fatal
    if let Err(e) = server.run().await {
        tracing::error!("{}", e);
        return Err(e.into());
    }

    let stats = server.stats();
    tracing::info!(
        "Backend stopped ({} connections, {} replies, {} fallbacks, {} errors)",
        stats.connections_total.load(Ordering::Relaxed),
        stats.replies_total.load(Ordering::Relaxed),
        stats.fallbacks_total.load(Ordering::Relaxed),
        stats.errors_total.load(Ordering::Relaxed),
    );
    Ok(())
}

async fn run_gateway(args: GatewayArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => {
            let mut config = vrelay_gateway::Config::from_file(path)?;
            config.apply_env_overrides();
            tracing::info!("Loaded config from {}", path.display());
            config
        }
        None => vrelay_gateway::Config::load()?,
    };

    if let Some(port) = args.http_port {
        config.http.bind_addr.set_port(port);
    }
    if args.tcp {
        config.backend.transport = Transport::Tcp;
    }
    if let Some(cid) = args.enclave_cid {
        config.backend.cid = Some(cid);
    }
    if let Some(host) = args.enclave_host {
        config.backend.host = host;
    }
    if let Some(port) = args.enclave_port {
        config.backend.port = port;
    }
    if let Some(framing) = args.framing {
        config.backend.framing = framing;
    }
    if let Some(secs) = args.timeout {
        config.backend.connect_timeout_secs = secs;
        config.backend.read_timeout_secs = secs;
    }

    // Fails before any socket is opened, e.g. VSOCK without a CID
    let gateway = match Gateway::from_config(&config) {
        Ok(gateway) => Arc::new(gateway),
        Err(e) => {
            tracing::error!("{}", e);
            return Err(e.into());
        }
    };

    tracing::info!("Starting vrelay gateway");
    tracing::info!("  HTTP: {}", config.http.bind_addr);
    tracing::info!("  Backend: {}", config.backend.endpoint()?);
    tracing::info!("  Framing: {}", config.backend.framing);

    let shutdown_gateway = gateway.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping gateway...");
        shutdown_gateway.shutdown();
    });

    gateway.run().await?;

    let stats = gateway.router().stats();
    tracing::info!(
        "Gateway stopped ({} requests, {} forwarded, {} rejected, {} backend errors)",
        stats.requests_total.load(Ordering::Relaxed),
        stats.forwarded_total.load(Ordering::Relaxed),
        stats.rejected_total.load(Ordering::Relaxed),
        stats.transport_errors_total.load(Ordering::Relaxed),
    );
    Ok(())
}
