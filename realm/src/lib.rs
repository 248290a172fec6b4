//! # Realm Broker Library
//!
//! The realm sits between untrusted clients and a pool of trusted shard
//! workers. Clients never learn which shard served them; shards never talk to
//! clients directly.
//!
//! ## Core Responsibilities
//!
//! ### Shard Membership
//! Shards connect on their own port and prove they share the realm secret by
//! presenting a sealed token on every message. The first authenticated
//! message registers the shard and is answered with `AUTH_SUCCESS` carrying
//! the id the realm assigned to it.
//!
//! ### Task Routing
//! Every client message is admitted by the rate limiter, stamped with a fresh
//! token, `mode: DISTRIBUTED_TASK` and the client's connection id, and handed
//! to the next shard in rotation. Shards answer with `mode: PROXY`; the realm
//! strips the token and forwards the reply to the client named by its
//! correlation id.
//!
//! ### Flow Control
//! Each outbound direction has a backpressure queue. When a connection's send
//! buffer fills, frames park in FIFO order until its writer reports progress.
//!
//! ## Module Organization
//!
//! - `config`: listener addresses and tuning knobs
//! - `admission`: per-client sliding-window rate limiting
//! - `auth`: token checks and reply stamping
//! - `registry`: live shard and client connections, shard selection
//! - `backpressure`: gated FIFO send queues
//! - `transport`: per-connection channels and writer tasks
//! - `router`: the message flow tying the above together
//! - `network`: listeners and per-connection read loops
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use realm::config::RealmConfig;
//! use realm::network::RealmServer;
//! use shared::TokenAuthority;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let authority = TokenAuthority::from_secret("change-me")?;
//!     let server = RealmServer::bind(RealmConfig::default(), authority).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod admission;
pub mod auth;
pub mod backpressure;
pub mod config;
pub mod network;
pub mod registry;
pub mod router;
pub mod transport;
