//! Live connection registries for the realm broker
//!
//! This module tracks both sides of the fabric:
//! - Shards, kept in registration order so the selector can rotate over them
//! - Clients, looked up by id when a shard's reply has to be routed back
//!
//! Each registry exclusively owns the handles of the connections it tracks.
//! Other components only ever borrow a handle or work on a snapshot.

use crate::config::SelectionPolicy;
use crate::transport::ConnectionHandle;
use log::info;
use shared::{ConnId, Stats};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

/// A registered shard connection
#[derive(Debug)]
pub struct ShardEntry {
    pub handle: ConnectionHandle,
    pub addr: SocketAddr,
    /// Most recent telemetry the shard reported, if any
    pub stats: Option<Stats>,
    pub registered_at: Instant,
}

impl ShardEntry {
    pub fn id(&self) -> &ConnId {
        self.handle.id()
    }
}

/// Shards in registration order plus the round-robin cursor
#[derive(Debug, Default)]
pub struct ShardRegistry {
    shards: Vec<ShardEntry>,
    last_chosen: Option<ConnId>,
}

impl ShardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a shard. Returns false if the id is already present.
    pub fn insert(&mut self, handle: ConnectionHandle, addr: SocketAddr) -> bool {
        if self.contains(handle.id()) {
            return false;
        }

        info!("Shard {} registered from {}", handle.id(), addr);
        self.shards.push(ShardEntry {
            handle,
            addr,
            stats: None,
            registered_at: Instant::now(),
        });
        true
    }

    /// Removes a shard, taking it out of the rotation
    pub fn remove(&mut self, id: &ConnId) -> Option<ShardEntry> {
        let index = self.shards.iter().position(|s| s.id() == id)?;
        let entry = self.shards.remove(index);
        info!(
            "Shard {} at {} removed after {:?}",
            id,
            entry.addr,
            entry.registered_at.elapsed()
        );
        Some(entry)
    }

    pub fn contains(&self, id: &ConnId) -> bool {
        self.shards.iter().any(|s| s.id() == id)
    }

    /// Records telemetry from a registered shard. Returns false if unknown.
    pub fn update_stats(&mut self, id: &ConnId, stats: Stats) -> bool {
        match self.shards.iter_mut().find(|s| s.id() == id) {
            Some(entry) => {
                entry.stats = Some(stats);
                true
            }
            None => false,
        }
    }

    /// Picks the shard for the next task and returns its handle
    pub fn select_next(&mut self, policy: SelectionPolicy) -> Option<ConnectionHandle> {
        match policy {
            SelectionPolicy::RoundRobin => self.next_round_robin(),
            SelectionPolicy::LeastLoaded => self.least_loaded().or_else(|| self.next_round_robin()),
        }
    }

    /// Fair rotation over the registry as it stands right now. A departed
    /// shard is simply absent from the order, so the cursor never points at it.
    fn next_round_robin(&mut self) -> Option<ConnectionHandle> {
        let order: Vec<&ConnId> = self.shards.iter().map(ShardEntry::id).collect();
        if order.is_empty() {
            return None;
        }

        let next = match self
            .last_chosen
            .as_ref()
            .and_then(|last| order.iter().position(|id| *id == last))
        {
            Some(last_index) => (last_index + 1) % order.len(),
            None => 0,
        };

        let chosen = self.shards[next].handle.clone();
        self.last_chosen = Some(chosen.id().clone());
        Some(chosen)
    }

    /// Lowest CPU usage wins, most free memory breaks ties. Shards that have
    /// not reported telemetry are not considered.
    fn least_loaded(&mut self) -> Option<ConnectionHandle> {
        let chosen = self
            .shards
            .iter()
            .filter_map(|s| s.stats.map(|stats| (s, stats)))
            .min_by(|(_, a), (_, b)| {
                a.cpu_usage
                    .total_cmp(&b.cpu_usage)
                    .then(b.free_ram.total_cmp(&a.free_ram))
            })
            .map(|(s, _)| s.handle.clone())?;

        self.last_chosen = Some(chosen.id().clone());
        Some(chosen)
    }

    /// Handles keyed by id, for flushing parked frames without holding the lock
    pub fn handles(&self) -> HashMap<ConnId, ConnectionHandle> {
        self.shards
            .iter()
            .map(|s| (s.id().clone(), s.handle.clone()))
            .collect()
    }

    pub fn ids(&self) -> Vec<ConnId> {
        self.shards.iter().map(|s| s.id().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}

/// A connected client
#[derive(Debug)]
pub struct ClientEntry {
    pub handle: ConnectionHandle,
    pub addr: SocketAddr,
}

#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: HashMap<ConnId, ClientEntry>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, handle: ConnectionHandle, addr: SocketAddr) -> bool {
        let id = handle.id().clone();
        if self.clients.contains_key(&id) {
            return false;
        }
        info!("Client {} connected from {}", id, addr);
        self.clients.insert(id, ClientEntry { handle, addr });
        true
    }

    pub fn remove(&mut self, id: &ConnId) -> Option<ClientEntry> {
        let entry = self.clients.remove(id)?;
        info!("Client {} at {} removed", id, entry.addr);
        Some(entry)
    }

    /// Looks up a client by correlation id
    pub fn get(&self, id: &str) -> Option<&ConnectionHandle> {
        self.clients.get(id).map(|c| &c.handle)
    }

    pub fn handles(&self) -> HashMap<ConnId, ConnectionHandle> {
        self.clients
            .iter()
            .map(|(id, c)| (id.clone(), c.handle.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:3000".parse().unwrap()
    }

    fn handle(id: &str) -> (ConnectionHandle, mpsc::Receiver<Message>) {
        ConnectionHandle::channel(ConnId::from(id), 8)
    }

    fn registry(ids: &[&str]) -> (ShardRegistry, Vec<mpsc::Receiver<Message>>) {
        let mut registry = ShardRegistry::new();
        let mut receivers = Vec::new();
        for id in ids {
            let (h, rx) = handle(id);
            assert!(registry.insert(h, test_addr()));
            receivers.push(rx);
        }
        (registry, receivers)
    }

    fn pick(registry: &mut ShardRegistry) -> Option<String> {
        registry
            .select_next(SelectionPolicy::RoundRobin)
            .map(|h| h.id().to_string())
    }

    #[test]
    fn test_empty_registry_selects_nothing() {
        let mut registry = ShardRegistry::new();
        assert!(pick(&mut registry).is_none());
        assert!(registry
            .select_next(SelectionPolicy::LeastLoaded)
            .is_none());
    }

    #[test]
    fn test_round_robin_rotates_in_registration_order() {
        let (mut registry, _rx) = registry(&["a", "b", "c"]);
        let picks: Vec<String> = (0..7).filter_map(|_| pick(&mut registry)).collect();
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c", "a"]);
    }

    #[test]
    fn test_single_shard_is_always_chosen() {
        let (mut registry, _rx) = registry(&["only"]);
        for _ in 0..3 {
            assert_eq!(pick(&mut registry).as_deref(), Some("only"));
        }
    }

    #[test]
    fn test_departed_shard_is_never_selected() {
        let (mut registry, _rx) = registry(&["a", "b", "c"]);
        assert_eq!(pick(&mut registry).as_deref(), Some("a"));

        let removed = registry.remove(&ConnId::from("b")).unwrap();
        assert_eq!(removed.addr, test_addr());
        assert!(removed.registered_at.elapsed() < std::time::Duration::from_secs(60));
        assert_eq!(pick(&mut registry).as_deref(), Some("c"));
        assert_eq!(pick(&mut registry).as_deref(), Some("a"));
        assert_eq!(pick(&mut registry).as_deref(), Some("c"));
    }

    #[test]
    fn test_removing_last_chosen_restarts_rotation() {
        let (mut registry, _rx) = registry(&["a", "b", "c"]);
        pick(&mut registry);
        assert_eq!(pick(&mut registry).as_deref(), Some("b"));

        registry.remove(&ConnId::from("b"));
        assert_eq!(pick(&mut registry).as_deref(), Some("a"));
    }

    #[test]
    fn test_no_repeats_under_churn() {
        let (mut registry, mut receivers) = registry(&["s0", "s1"]);
        let mut previous = pick(&mut registry);

        for round in 0..40 {
            if round % 3 == 0 {
                let (h, rx) = handle(&format!("n{}", round));
                registry.insert(h, test_addr());
                receivers.push(rx);
            }
            if round % 5 == 0 && registry.len() > 2 {
                let victim = registry.ids()[round % registry.len()].clone();
                registry.remove(&victim);
            }

            let current = pick(&mut registry).unwrap();
            assert!(registry.contains(&ConnId::from(current.as_str())));
            if registry.len() >= 2 {
                assert_ne!(Some(&current), previous.as_ref());
            }
            previous = Some(current);
        }
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let (mut registry, _rx) = registry(&["a"]);
        let (dup, _dup_rx) = handle("a");
        assert!(!registry.insert(dup, test_addr()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_least_loaded_prefers_low_cpu_then_free_ram() {
        let (mut registry, _rx) = registry(&["busy", "idle-small", "idle-big", "silent"]);
        registry.update_stats(
            &ConnId::from("busy"),
            Stats {
                free_ram: 9000.0,
                cpu_usage: 90.0,
            },
        );
        registry.update_stats(
            &ConnId::from("idle-small"),
            Stats {
                free_ram: 100.0,
                cpu_usage: 5.0,
            },
        );
        registry.update_stats(
            &ConnId::from("idle-big"),
            Stats {
                free_ram: 4000.0,
                cpu_usage: 5.0,
            },
        );

        let chosen = registry.select_next(SelectionPolicy::LeastLoaded).unwrap();
        assert_eq!(chosen.id().as_str(), "idle-big");
    }

    #[test]
    fn test_least_loaded_without_stats_falls_back_to_round_robin() {
        let (mut registry, _rx) = registry(&["a", "b"]);
        let first = registry.select_next(SelectionPolicy::LeastLoaded).unwrap();
        let second = registry.select_next(SelectionPolicy::LeastLoaded).unwrap();
        assert_eq!(first.id().as_str(), "a");
        assert_eq!(second.id().as_str(), "b");
    }

    #[test]
    fn test_update_stats_unknown_shard() {
        let mut registry = ShardRegistry::new();
        assert!(!registry.update_stats(
            &ConnId::from("ghost"),
            Stats {
                free_ram: 1.0,
                cpu_usage: 1.0
            }
        ));
    }

    #[test]
    fn test_client_registry_lifecycle() {
        let mut clients = ClientRegistry::new();
        let (h, _rx) = handle("client-1");

        assert!(clients.insert(h, test_addr()));
        assert_eq!(clients.len(), 1);
        assert!(clients.get("client-1").is_some());
        assert!(clients.get("client-2").is_none());

        let removed = clients.remove(&ConnId::from("client-1")).unwrap();
        assert_eq!(removed.addr, test_addr());
        assert!(clients.remove(&ConnId::from("client-1")).is_none());
        assert!(clients.is_empty());
    }

    #[test]
    fn test_handle_snapshots() {
        let (registry, _rx) = registry(&["a", "b"]);
        let handles = registry.handles();
        assert_eq!(handles.len(), 2);
        assert!(handles.contains_key(&ConnId::from("a")));

        let mut clients = ClientRegistry::new();
        let (h, _crx) = handle("c");
        clients.insert(h, test_addr());
        assert!(clients.handles().contains_key(&ConnId::from("c")));
    }
}
