//! Wire envelope exchanged between clients, the realm and its shards.
//!
//! Every frame on the wire is a single UTF-8 JSON object. Fields the router
//! does not understand are carried through untouched in [`Packet::extra`] so a
//! client's payload survives the round trip through a shard.

use rand::RngCore;
use serde::de::{DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Borrow;
use std::fmt;
use thiserror::Error;

/// Errors raised while turning frames into packets and back
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("frame is not a text frame")]
    NonTextFrame,
    #[error("invalid packet: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("failed to encode packet: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Routing mode of a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mode {
    /// Shard result travelling back to the client named by `id`
    Proxy,
    /// Client task stamped by the realm on its way to a shard
    DistributedTask,
    #[serde(other)]
    Unknown,
}

/// Packet kind, carried in the `type` field
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Kind {
    Ping,
    AuthSuccess,
    AuthError,
    RateLimited,
    /// Any task-specific kind the router passes through without interpreting
    Task(String),
}

impl Kind {
    pub fn as_str(&self) -> &str {
        match self {
            Kind::Ping => "PING",
            Kind::AuthSuccess => "AUTH_SUCCESS",
            Kind::AuthError => "AUTH_ERROR",
            Kind::RateLimited => "RATE_LIMITED",
            Kind::Task(name) => name,
        }
    }
}

impl From<String> for Kind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "PING" => Kind::Ping,
            "AUTH_SUCCESS" => Kind::AuthSuccess,
            "AUTH_ERROR" => Kind::AuthError,
            "RATE_LIMITED" => Kind::RateLimited,
            _ => Kind::Task(value),
        }
    }
}

impl From<Kind> for String {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Task(name) => name,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host telemetry a shard attaches to its heartbeats
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub free_ram: f64,
    pub cpu_usage: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<Kind>,
    /// Correlation id on task traffic, assigned connection id on `AUTH_SUCCESS`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    // Telemetry is best-effort: a malformed block is dropped, not fatal.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient"
    )]
    pub stats: Option<Stats>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

impl Packet {
    /// Parses one text frame. Anything other than a JSON object is rejected.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::InvalidJson)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    pub fn with_kind(kind: Kind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    /// Reply sent to a shard once its first message authenticates
    pub fn auth_success(conn_id: &ConnId, token: String) -> Self {
        Self {
            token: Some(token),
            kind: Some(Kind::AuthSuccess),
            id: Some(conn_id.to_string()),
            data: Some(Value::from("Shard server has been authenticated")),
            ..Self::default()
        }
    }

    /// Reply sent before closing a connection that failed authentication
    pub fn auth_error(reason: &CloseReason) -> Self {
        Self {
            kind: Some(Kind::AuthError),
            data: Some(Value::from(reason.as_str())),
            ..Self::default()
        }
    }

    pub fn rate_limited() -> Self {
        Self {
            kind: Some(Kind::RateLimited),
            data: Some(Value::from("Too many requests, slow down")),
            ..Self::default()
        }
    }

    pub fn is_kind(&self, kind: &Kind) -> bool {
        self.kind.as_ref() == Some(kind)
    }

    /// Drops the token so it is never relayed past the hop that checked it
    pub fn without_token(mut self) -> Self {
        self.token = None;
        self
    }

    /// Client a reply belongs to. Falls back to `data.id` because shards wrap
    /// the original task, correlation id included, inside `data`.
    pub fn correlation_id(&self) -> Option<&str> {
        self.id
            .as_deref()
            .or_else(|| self.data.as_ref()?.get("id")?.as_str())
    }
}

/// Human-readable reasons attached to every transport-level close
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    InvalidPacket,
    MissingToken,
    InvalidToken,
    NoServers,
    MissingCorrelationId,
    HandshakeTimeout,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::InvalidPacket => "Invalid packet received",
            CloseReason::MissingToken => "No authentication key was provided",
            CloseReason::InvalidToken => "Invalid authentication key",
            CloseReason::NoServers => "No servers available",
            CloseReason::MissingCorrelationId => "No server ID provided",
            CloseReason::HandshakeTimeout => "Handshake timed out",
            CloseReason::Shutdown => "Server shutting down",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broker-assigned connection identifier, hex encoded
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(String);

impl ConnId {
    /// Shard ids use 32 random bytes, client ids 16.
    pub const SHARD_BYTES: usize = 32;
    pub const CLIENT_BYTES: usize = 16;

    pub fn random(bytes: usize) -> Self {
        let mut buf = vec![0u8; bytes];
        rand::thread_rng().fill_bytes(&mut buf);
        Self(buf.iter().map(|b| format!("{:02x}", b)).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ConnId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Borrow<str> for ConnId {
    fn borrow(&self) -> &str {
        &self.0
    }
}
