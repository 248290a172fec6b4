//! # Shard Worker Library
//!
//! A shard dials the realm's shard-facing port, proves it holds the realm
//! secret, and then executes whatever tasks the realm routes to it. It never
//! sees clients directly: every task arrives stamped with the originating
//! client's correlation id, and every result goes back to the realm as a
//! `PROXY` packet carrying that id.
//!
//! ## Session Lifecycle
//!
//! 1. Connect, bounded by the handshake timeout.
//! 2. Send a packet holding only a sealed token (and optionally an advertised
//!    address).
//! 3. Wait for `AUTH_SUCCESS`, again bounded by the handshake timeout, and
//!    remember the id the realm assigned.
//! 4. Serve tasks and send periodic heartbeats with host telemetry.
//!
//! An `AUTH_ERROR`, or any realm message whose token does not open to the
//! secret, ends the session with an error. The binary exits on it rather than
//! retrying with a secret that cannot work.
//!
//! ## Module Organization
//!
//! - `config`: realm address, heartbeat and handshake timing
//! - `worker`: protocol state machine, no I/O
//! - `tasks`: execution by task kind
//! - `telemetry`: host probes feeding heartbeat stats
//! - `network`: WebSocket session driving the worker
//! - `error`: session failure reasons

pub mod config;
pub mod error;
pub mod network;
pub mod tasks;
pub mod telemetry;
pub mod worker;
