//! SMS relay daemon: a supervised WebSocket hub plus status page, fed with
//! events from standard input.

use std::net::{IpAddr, UdpSocket};
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use smsrelay_server::{BroadcastHub, LocalAddrResolver, RelayConfig, Supervisor};

/// SMS-to-WebSocket relay.
///
/// Lines read from stdin as `sender:message` are broadcast to every
/// connected WebSocket subscriber. A status page is served one port above
/// the event port.
#[derive(Debug, Parser)]
#[command(name = "smsrelay", version, about)]
struct Cli {
    /// Address to bind both listeners on.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Event port; the status page always serves on the next port up.
    #[arg(short, long, default_value_t = 8060, value_parser = parse_port)]
    port: u16,
}

fn parse_port(raw: &str) -> Result<u16, String> {
    let port: u16 = raw.parse().map_err(|_| format!("invalid port: {raw}"))?;
    if port == 0 || port == u16::MAX {
        return Err("port must be between 1 and 65534 to leave room for the status port".to_string());
    }
    Ok(port)
}

/// Finds the LAN-facing address by opening a UDP socket toward a public
/// address. Nothing is sent; the route lookup alone selects the interface.
struct ProbeResolver;

impl LocalAddrResolver for ProbeResolver {
    fn local_ip(&self) -> Option<IpAddr> {
        let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect("8.8.8.8:80").ok()?;
        socket.local_addr().ok().map(|addr| addr.ip())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = RelayConfig {
        host: cli.host.clone(),
        port: cli.port,
        ..RelayConfig::default()
    };
    let supervisor = Arc::new(Supervisor::new(config, Arc::new(ProbeResolver)));
    supervisor
        .start(cli.port)
        .await
        .context("failed to start server pair")?;
    info!(port = cli.port, status_port = cli.port + 1, "smsrelay ready");

    let feeder = tokio::spawn(feed_from_stdin(supervisor.hub()));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    feeder.abort();
    supervisor.stop().await;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

/// Relay SMS events from stdin, one per line, until the stream ends. Each
/// event is stamped at ingest time in epoch milliseconds.
async fn feed_from_stdin(hub: Arc<BroadcastHub>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let (sender, message) = parse_feed_line(line);
                let _ = hub.ingest(sender, message, Utc::now().timestamp_millis());
            }
            Ok(None) => {
                debug!("stdin closed, event feed ended");
                break;
            }
            Err(err) => {
                warn!(error = %err, "failed to read event line");
                break;
            }
        }
    }
}

/// Split a feed line into sender and message on the first colon. Lines
/// without a separator keep their full text and get a placeholder sender,
/// mirroring events that arrive without an originating address.
fn parse_feed_line(line: &str) -> (&str, &str) {
    match line.split_once(':') {
        Some((sender, message)) => (sender.trim(), message.trim()),
        None => ("Unknown", line),
    }
}
