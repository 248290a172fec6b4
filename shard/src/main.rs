use clap::Parser;
use log::{error, info};
use shard::config::WorkerConfig;
use shard::network::ShardNode;
use shard::telemetry::ProcProbe;
use shared::{TokenAuthority, DEFAULT_SHARD_PORT};
use std::time::Duration;

/// Shard worker: executes tasks routed by a realm broker
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Realm host to connect to
    #[arg(short = 'H', long, env = "HOST", default_value = "localhost")]
    host: String,
    /// Realm's shard-facing port
    #[arg(short = 'p', long, env = "REALM_PORT", default_value_t = DEFAULT_SHARD_PORT)]
    realm_port: u16,
    /// Secret shared with the realm
    #[arg(long, env = "REALM_KEY", hide_env_values = true)]
    key: String,
    /// Heartbeat interval in milliseconds
    #[arg(long, default_value = "5000")]
    heartbeat_ms: u64,
    /// Milliseconds allowed for connecting and authenticating
    #[arg(long, default_value = "5000")]
    handshake_timeout_ms: u64,
    /// Address to report to the realm on registration
    #[arg(long, env = "SHARD_IP")]
    ip: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();
    if args.heartbeat_ms == 0 || args.handshake_timeout_ms == 0 {
        return Err("--heartbeat-ms and --handshake-timeout-ms must be greater than zero".into());
    }

    let config = WorkerConfig {
        host: args.host,
        realm_port: args.realm_port,
        heartbeat: Duration::from_millis(args.heartbeat_ms),
        handshake_timeout: Duration::from_millis(args.handshake_timeout_ms),
        advertise_ip: args.ip,
    };
    let authority = TokenAuthority::from_secret(&args.key)?;
    let mut node = ShardNode::new(config, authority, Box::new(ProcProbe::new()));

    tokio::select! {
        result = node.run() => {
            if let Err(e) = &result {
                if e.is_auth_failure() {
                    error!("Shutting down: {}", e);
                }
            }
            result?;
        }
        _ = tokio::signal::ctrl_c() => info!("Shutting down shard"),
    }

    Ok(())
}
