//! OCPP RPC Node - central system and scripted charge point
//!
//! Both sides of an OCPP 1.6 connection built on the `ocpp-rpc` correlation
//! core.
//!
//! # Usage
//!
//! ```bash
//! # Central system on the default port
//! ocpp-rpc-node serve
//!
//! # Central system on a custom address
//! ocpp-rpc-node serve --bind 127.0.0.1:9000
//!
//! # Run one scripted charging session as CP001
//! ocpp-rpc-node simulate --url ws://localhost:8081/ocpp --station CP001
//! ```
//!
//! # Demo Scenario
//!
//! 1. Start the central system with `serve`
//! 2. Run `simulate` for one or more station ids
//! 3. Each simulator boots, authorizes, charges and stops
//! 4. The central system log shows state changes and meter values

mod central;
mod handlers;
mod messages;
mod registry;
mod script;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use ocpp_rpc::{CallIdStrategy, SessionConfig, WsConfig};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::handlers::CentralSystem;
use crate::registry::ChargePointRegistry;

/// OCPP-J central system and charge point simulator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Call timeout in seconds
    #[arg(long, default_value = "30", global = true)]
    call_timeout: u64,

    /// WebSocket subprotocol
    #[arg(long, default_value = "ocpp1.6", global = true)]
    subprotocol: String,

    /// Use random UUIDs as call ids instead of a counter
    #[arg(long, global = true)]
    uuid_ids: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the central system
    Serve {
        /// Listen address
        #[arg(short, long, default_value = "0.0.0.0:8081")]
        bind: SocketAddr,
    },

    /// Run one scripted charging session against a central system
    Simulate {
        /// Central system base URL; the station id is appended
        #[arg(long, default_value = "ws://localhost:8081/ocpp")]
        url: String,

        /// Charge point id
        #[arg(short, long, default_value = "CP001")]
        station: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let id_strategy = if args.uuid_ids {
        CallIdStrategy::Uuid
    } else {
        CallIdStrategy::Counter
    };
    let session_config = SessionConfig::default()
        .with_call_timeout(Duration::from_secs(args.call_timeout))
        .with_id_strategy(id_strategy);
    let ws_config = WsConfig::default().with_subprotocol(&args.subprotocol);

    match args.command {
        Command::Serve { bind } => {
            print_banner("Central System", &[
                ("Listen", bind.to_string()),
                ("Protocol", args.subprotocol.clone()),
                ("Timeout", format!("{}s", args.call_timeout)),
            ]);

            let central = Arc::new(CentralSystem::new(Arc::new(ChargePointRegistry::new())));
            central::serve(bind, central, session_config, ws_config).await?;
        }

        Command::Simulate { url, station } => {
            print_banner("Charge Point Simulator", &[
                ("Station", station.clone()),
                ("URL", truncate(&url, 48)),
                ("Protocol", args.subprotocol.clone()),
            ]);

            let summary = script::simulate(&url, &station, session_config, &ws_config).await?;
            info!(
                "Simulation complete: transaction {}, {} Wh over {} steps (heartbeat {}s)",
                summary.transaction_id, summary.energy_wh, summary.steps, summary.heartbeat_interval
            );
        }
    }

    Ok(())
}

fn print_banner(mode: &str, rows: &[(&str, String)]) {
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║  OCPP RPC Node - {:<43} ║", mode);
    println!("╠══════════════════════════════════════════════════════════════╣");
    for (label, value) in rows {
        println!("║  {:<9} {:<49} ║", format!("{}:", label), value);
    }
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
}

/// Truncate string with ellipsis, counting characters rather than bytes
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }

    let keep = max_len.saturating_sub(3);
    let end = s.char_indices().nth(keep).map_or(s.len(), |(i, _)| i);
    format!("{}...", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("ws://localhost:8081/ocpp", 48), "ws://localhost:8081/ocpp");
        assert_eq!(truncate("abcdefghij", 8), "abcde...");
        assert_eq!(truncate("ws://zentrale-süd.example/ocpp", 20), "ws://zentrale-süd...");
        assert_eq!(truncate("ladesäule", 3), "...");
    }
}
