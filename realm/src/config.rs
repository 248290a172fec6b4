//! Runtime configuration for the realm broker

use clap::ValueEnum;
use shared::{DEFAULT_CLIENT_PORT, DEFAULT_SHARD_PORT};
use std::time::Duration;

/// How the broker picks a shard for each task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum SelectionPolicy {
    /// Fair rotation over the live registry
    #[default]
    RoundRobin,
    /// Lowest reported CPU load, ties broken by most free memory
    LeastLoaded,
}

/// Granularity of the backpressure gate within one outbound direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum GatePolicy {
    /// One gate and queue per direction. A single congested connection holds
    /// back retries for every connection in that direction.
    #[default]
    Shared,
    /// One gate and queue per target connection
    PerConnection,
}

/// Per-client admission control settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Requests allowed per window; the request that reaches this count is rejected
    pub max_requests: u32,
    /// How long the window counter accumulates before it resets
    pub window: Duration,
    /// How often the window decay runs
    pub window_tick: Duration,
    /// How long a client stays limited after tripping the cap
    pub penalty: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window: Duration::from_millis(1000),
            window_tick: Duration::from_millis(1000),
            penalty: Duration::from_millis(5000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RealmConfig {
    pub host: String,
    pub shard_port: u16,
    pub client_port: u16,
    pub rate_limit: RateLimitConfig,
    pub selection: SelectionPolicy,
    pub gate: GatePolicy,
    /// Frames a connection's transport buffers before it reports full
    pub outbound_capacity: usize,
    /// Deadline for a shard's first packet
    pub handshake_timeout: Duration,
}

impl Default for RealmConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            shard_port: DEFAULT_SHARD_PORT,
            client_port: DEFAULT_CLIENT_PORT,
            rate_limit: RateLimitConfig::default(),
            selection: SelectionPolicy::default(),
            gate: GatePolicy::default(),
            outbound_capacity: 256,
            handshake_timeout: Duration::from_millis(5000),
        }
    }
}

impl RealmConfig {
    pub fn shard_addr(&self) -> String {
        format!("{}:{}", self.host, self.shard_port)
    }

    pub fn client_addr(&self) -> String {
        format!("{}:{}", self.host, self.client_port)
    }
}
