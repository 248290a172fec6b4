//! Shard worker settings

use shared::DEFAULT_SHARD_PORT;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Realm host to dial
    pub host: String,
    /// Realm's shard-facing port
    pub realm_port: u16,
    /// Interval between heartbeats once registered
    pub heartbeat: Duration,
    /// Bound on both the connect and waiting for `AUTH_SUCCESS`
    pub handshake_timeout: Duration,
    /// Address reported to the realm in the first packet
    pub advertise_ip: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            realm_port: DEFAULT_SHARD_PORT,
            heartbeat: Duration::from_millis(5000),
            handshake_timeout: Duration::from_millis(5000),
            advertise_ip: None,
        }
    }
}

impl WorkerConfig {
    pub fn realm_url(&self) -> String {
        format!("ws://{}:{}", self.host, self.realm_port)
    }
}
