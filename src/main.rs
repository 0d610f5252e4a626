//! httpsgate - Main entry point
//!
//! Terminates TLS with a fresh self-signed certificate and relays requests
//! for allowed hosts upstream

use anyhow::Result;
use clap::Parser;
use httpsgate::{TerminatorConfig, TlsTerminator, UpstreamForwarder};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, info_span, Level};
use tracing_subscriber::FmtSubscriber;

/// httpsgate - TLS front door for an HTTPS-intercepting proxy
#[derive(Parser, Debug)]
#[command(name = "httpsgate")]
#[command(version)]
#[command(about = "TLS front door for an HTTPS-intercepting proxy")]
struct Args {
    /// Address to accept TLS connections on
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:443")]
    listen_addr: String,

    /// Seconds allowed for a client to finish the TLS handshake
    #[arg(long, env = "HANDSHAKE_TIMEOUT", default_value = "10")]
    handshake_timeout: u64,

    /// Seconds allowed for a client to send request headers
    #[arg(long, env = "HEADER_READ_TIMEOUT", default_value = "30")]
    header_read_timeout: u64,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting httpsgate v{}", env!("CARGO_PKG_VERSION"));

    let forwarder = Arc::new(UpstreamForwarder::new()?);

    let config = TerminatorConfig {
        span: info_span!("httpsgate", listen = %args.listen_addr),
        listen_addr: args.listen_addr,
        handshake_timeout: Duration::from_secs(args.handshake_timeout),
        header_read_timeout: Duration::from_secs(args.header_read_timeout),
        ..TerminatorConfig::default()
    };

    // Certificate or bind failures end the process here
    let terminator = TlsTerminator::bind(config, forwarder).await?;

    info!("httpsgate started successfully");

    terminator.run().await?;

    Ok(())
}
