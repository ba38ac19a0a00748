//! PriFi node binary.
//!
//! Hosts one in-process run (relay, clients, trustees) and logs what comes
//! out of it.
//!
//! # Usage
//!
//! ```bash
//! # Two clients, one trustee, stop after 100 rounds
//! prifi-node --clients 2 --trustees 1 --rounds 100
//!
//! # Measure round trips through the relay
//! prifi-node --clients 3 --trustees 2 --latency-tests --log-level debug
//! ```

use std::time::Duration;

use clap::Parser;
use prifi_node::{NodeConfig, RunArena, RunOutput, SystemEnv};
use prifi_proto::ProtocolParams;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// PriFi anonymity node
#[derive(Parser, Debug)]
#[command(name = "prifi-node")]
#[command(about = "DC-net anonymous communication: relay, clients and trustees in one process")]
#[command(version)]
struct Args {
    /// Number of clients
    #[arg(short, long, default_value = "2")]
    clients: u32,

    /// Number of trustees
    #[arg(short, long, default_value = "1")]
    trustees: u32,

    /// Upstream cell size in bytes
    #[arg(long, default_value = "1000")]
    up_cell_size: u32,

    /// Downstream cell size in bytes
    #[arg(long, default_value = "1000")]
    down_cell_size: u32,

    /// Stop after this many rounds (0 runs until interrupted)
    #[arg(short, long, default_value = "100")]
    rounds: u32,

    /// Buffered rounds per trustee before the relay slows it down
    #[arg(long, default_value = "10")]
    window: u32,

    /// Embed latency probes in idle slots
    #[arg(long)]
    latency_tests: bool,

    /// Milliseconds between trustee ciphers at full rate
    #[arg(long, default_value = "10")]
    full_rate_ms: u64,

    /// Milliseconds between trustee ciphers at half rate
    #[arg(long, default_value = "20")]
    half_rate_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let config = NodeConfig {
        params: ProtocolParams {
            up_cell_size: args.up_cell_size,
            down_cell_size: args.down_cell_size,
            relay_window_size: args.window,
            relay_reporting_limit: args.rounds,
            do_latency_tests: args.latency_tests,
            ..ProtocolParams::new(args.clients, args.trustees)
        },
        full_rate_interval: Duration::from_millis(args.full_rate_ms),
        half_rate_interval: Duration::from_millis(args.half_rate_ms),
    };

    tracing::info!(clients = args.clients, trustees = args.trustees, "PriFi node starting");

    let mut arena = RunArena::new(SystemEnv::new(), config)?;
    let run = arena.start_run()?;
    let handle = arena.run_mut(run)?;

    for client_id in 0..args.clients {
        let greeting = format!("hello from client {client_id}").into_bytes();
        let greeting = greeting.into_iter().take(args.up_cell_size as usize).collect();
        handle.send_upstream(client_id, greeting)?;
    }

    while let Some(output) = handle.next_output().await {
        match output {
            RunOutput::Upstream { round, data } => {
                let end = data.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
                if end > 0 {
                    tracing::info!(round, data = %String::from_utf8_lossy(&data[..end]), "upstream");
                }
            },
            RunOutput::Downstream { client_id, round, data } => {
                tracing::debug!(client_id, round, len = data.len(), "downstream");
            },
            RunOutput::Latency { client_id, millis } => {
                tracing::info!(client_id, millis, "latency");
            },
            RunOutput::Finished { rounds } => {
                tracing::info!(rounds, "reporting limit reached");
                break;
            },
            RunOutput::Halted { peer, error } => {
                tracing::error!(%peer, %error, "run halted");
                break;
            },
        }
    }

    arena.stop_run(run)?;
    Ok(())
}
