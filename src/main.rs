//! vpnping: ICMP pings through an OpenVPN tunnel.
//!
//! Establishes the tunnel, then crafts echo requests against the pushed
//! tunnel address and reads the replies back off the data channel.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ovpnclient::packet::{build_echo_request, parse_echo_reply};
use ovpnclient::{Client, DEFAULT_CONFIG_FILE};

#[derive(Parser)]
#[command(name = "vpnping")]
#[command(about = "Ping a host through an OpenVPN tunnel")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Host to ping through the tunnel
    host: Ipv4Addr,

    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: String,

    /// Number of echo requests to send
    #[arg(short = 'n', long, default_value_t = 3)]
    count: u16,

    /// Seconds between echo requests
    #[arg(short, long, default_value_t = 1)]
    interval: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let fallback = if cli.verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true).without_time())
        .try_init()
        .ok();

    let options = ovpnclient::config::io::load_json(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config))?;

    let mut client = Client::new(options)?;
    client.run().await.context("tunnel establishment failed")?;

    let result = tokio::select! {
        r = ping(&mut client, cli.host, cli.count, cli.interval) => r,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            Ok(())
        }
    };
    client.stop();
    result
}

/// Send `count` echo requests and collect replies.
async fn ping(client: &mut Client, host: Ipv4Addr, count: u16, interval: u64) -> Result<()> {
    let tunnel_ip: Ipv4Addr = client
        .tunnel_ip()
        .context("no tunnel ip was pushed")?
        .parse()
        .context("pushed tunnel ip is not IPv4")?;
    let mut inbound = client
        .data_channel()
        .context("data channel already taken")?;

    let ident = (std::process::id() & 0xffff) as u16;
    let started = Instant::now();
    info!("PING {} from {} (id {:#06x})", host, tunnel_ip, ident);

    let mut sent = 0u16;
    let mut received = 0u16;
    let mut next_send = tokio::time::Instant::now();
    let deadline = tokio::time::Instant::now()
        + Duration::from_secs(interval * count as u64 + 5);

    while received < count && tokio::time::Instant::now() < deadline {
        tokio::select! {
            _ = tokio::time::sleep_until(next_send), if sent < count => {
                // Payload carries the send time for RTT measurement.
                let elapsed_micros = started.elapsed().as_micros() as u64;
                let packet = build_echo_request(
                    tunnel_ip,
                    host,
                    ident,
                    sent,
                    64,
                    &elapsed_micros.to_le_bytes(),
                );
                client.send_data(&packet)?;
                sent += 1;
                next_send += Duration::from_secs(interval);
            }
            payload = inbound.recv() => {
                let Some(payload) = payload else { bail!("tunnel closed") };
                if handle_reply(&payload, host, tunnel_ip, ident, started).is_some() {
                    received += 1;
                }
            }
            _ = tokio::time::sleep_until(deadline) => break,
        }
    }

    let loss = if sent == 0 {
        0.0
    } else {
        100.0 * f64::from(sent - received) / f64::from(sent)
    };
    info!(
        "--- {} ping statistics: {} transmitted, {} received, {:.0}% packet loss ---",
        host, sent, received, loss
    );
    if received == 0 {
        bail!("no replies received");
    }
    Ok(())
}

/// Validate one decrypted tunnel payload as our echo reply; returns the RTT.
fn handle_reply(
    payload: &[u8],
    host: Ipv4Addr,
    tunnel_ip: Ipv4Addr,
    ident: u16,
    started: Instant,
) -> Option<Duration> {
    let reply = parse_echo_reply(payload)?;
    if reply.dst != tunnel_ip {
        warn!("icmp reply with wrong dst {}", reply.dst);
        return None;
    }
    if reply.src != host {
        warn!("icmp reply with wrong src {}", reply.src);
        return None;
    }
    if reply.ident != ident {
        warn!("icmp reply with wrong id {:#06x}", reply.ident);
        return None;
    }

    let rtt = reply
        .payload
        .get(..8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_le_bytes)
        .map(|sent_micros| {
            started
                .elapsed()
                .saturating_sub(Duration::from_micros(sent_micros))
        })
        .unwrap_or_default();

    info!(
        "reply from {}: icmp_seq={} ttl={} time={:.1}ms",
        reply.src,
        reply.seq,
        reply.ttl,
        rtt.as_secs_f64() * 1000.0
    );
    Some(rtt)
}
