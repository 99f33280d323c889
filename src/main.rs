use std::net::IpAddr;

use anyhow::{Context, Result};
use clap::Parser;
use tcp_port_forwarder::{telemetry, ForwardConfig, Forwarder, DEFAULT_BUFFER_SIZE};
use tracing::info;

/// Forward every TCP connection on a local port to a fixed destination.
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
struct Args {
    /// Local port to listen on
    #[arg(value_parser = clap::value_parser!(u16).range(1..))]
    source_port: u16,

    /// Host name or IP to forward to
    destination_host: String,

    /// Port on the destination host
    #[arg(value_parser = clap::value_parser!(u16).range(1..))]
    destination_port: u16,

    /// Local address to bind the listener on
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Relay buffer size in bytes, per direction
    #[arg(long, default_value_t = DEFAULT_BUFFER_SIZE)]
    buffer_size: usize,

    /// Raise log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    telemetry::init_logging(args.verbose);

    let config = ForwardConfig::new(args.source_port, args.destination_host, args.destination_port)?
        .with_bind_addr(args.bind)
        .with_buffer_size(args.buffer_size)?;

    let forwarder = Forwarder::bind(config)
        .await
        .with_context(|| format!("failed to listen on port {}", args.source_port))?;
    forwarder.start()?;

    shutdown_signal().await?;
    info!("shutting down");

    forwarder.stop();
    forwarder.join().await;

    return Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("waiting for ctrl-c")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")
}
