use clap::Parser;
use log::info;
use realm::config::{GatePolicy, RateLimitConfig, RealmConfig, SelectionPolicy};
use realm::network::RealmServer;
use shared::{TokenAuthority, DEFAULT_CLIENT_PORT, DEFAULT_SHARD_PORT};
use std::time::Duration;

/// Realm broker: authenticates shards and routes client tasks to them
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Address to bind both listeners to
    #[clap(short = 'H', long, env = "REALM_HOST", default_value = "0.0.0.0")]
    host: String,
    /// Port shards connect to
    #[clap(long, env = "REALM_SHARD_PORT", default_value_t = DEFAULT_SHARD_PORT)]
    shard_port: u16,
    /// Port clients connect to
    #[clap(long, env = "REALM_CLIENT_PORT", default_value_t = DEFAULT_CLIENT_PORT)]
    client_port: u16,
    /// Secret shared with every shard
    #[clap(long, env = "REALM_KEY", hide_env_values = true)]
    key: String,
    /// Requests per window before a client is limited
    #[clap(long, default_value = "100")]
    max_requests: u32,
    /// Rate-limit window length in milliseconds
    #[clap(long, default_value = "1000")]
    window_ms: u64,
    /// How often the window decays, in milliseconds
    #[clap(long, default_value = "1000")]
    window_tick_ms: u64,
    /// How long a limited client stays limited, in milliseconds
    #[clap(long, default_value = "5000")]
    penalty_ms: u64,
    /// Shard selection policy
    #[clap(long, value_enum, default_value_t = SelectionPolicy::RoundRobin)]
    selection: SelectionPolicy,
    /// Backpressure gate granularity
    #[clap(long, value_enum, default_value_t = GatePolicy::Shared)]
    gate: GatePolicy,
    /// Frames buffered per connection before it counts as congested
    #[clap(long, default_value = "256")]
    outbound_capacity: usize,
    /// Milliseconds a shard has to authenticate after connecting
    #[clap(long, default_value = "5000")]
    handshake_timeout_ms: u64,
}

impl Args {
    fn config(&self) -> Result<RealmConfig, String> {
        let millis = |name: &str, value: u64| {
            if value == 0 {
                Err(format!("--{} must be greater than zero", name))
            } else {
                Ok(Duration::from_millis(value))
            }
        };
        if self.max_requests == 0 {
            return Err("--max-requests must be greater than zero".to_string());
        }

        Ok(RealmConfig {
            host: self.host.clone(),
            shard_port: self.shard_port,
            client_port: self.client_port,
            rate_limit: RateLimitConfig {
                max_requests: self.max_requests,
                window: millis("window-ms", self.window_ms)?,
                window_tick: millis("window-tick-ms", self.window_tick_ms)?,
                penalty: millis("penalty-ms", self.penalty_ms)?,
            },
            selection: self.selection,
            gate: self.gate,
            outbound_capacity: self.outbound_capacity.max(1),
            handshake_timeout: millis("handshake-timeout-ms", self.handshake_timeout_ms)?,
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();
    let config = args.config()?;
    let authority = TokenAuthority::from_secret(&args.key)?;

    let server = RealmServer::bind(config, authority).await?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down realm"),
    }

    Ok(())
}
