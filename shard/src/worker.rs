//! Shard half of the realm protocol, free of any I/O
//!
//! The network layer feeds every decoded realm packet to
//! [`ShardWorker::handle`] and acts on the returned [`WorkerAction`].

use crate::error::ShardError;
use crate::tasks;
use log::info;
use serde_json::Value;
use shared::{CloseReason, ConnId, Kind, Mode, Packet, SealError, Stats, TokenAuthority};

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerAction {
    /// The realm accepted this shard under the given id
    Registered(ConnId),
    /// Send this packet to the realm
    Reply(Packet),
    /// The realm refused our secret; carries its explanation
    Rejected(String),
    /// The realm's message could not be trusted; stop talking to it
    Terminate(CloseReason),
    Ignore,
}

#[derive(Debug)]
pub struct ShardWorker {
    authority: TokenAuthority,
    assigned: Option<ConnId>,
}

impl ShardWorker {
    pub fn new(authority: TokenAuthority) -> Self {
        Self {
            authority,
            assigned: None,
        }
    }

    pub fn assigned_id(&self) -> Option<&ConnId> {
        self.assigned.as_ref()
    }

    pub fn is_registered(&self) -> bool {
        self.assigned.is_some()
    }

    /// First packet on a fresh connection: a sealed token and nothing else
    /// but the optional advertised address
    pub fn hello(&self, ip: Option<&str>) -> Result<Packet, SealError> {
        let mut packet = self.sealed(Packet::default())?;
        if let Some(ip) = ip {
            packet.extra.insert("ip".to_string(), Value::from(ip));
        }
        Ok(packet)
    }

    pub fn heartbeat(&self, stats: Option<Stats>) -> Result<Packet, SealError> {
        self.sealed(Packet {
            stats,
            ..Packet::default()
        })
    }

    pub fn handle(&mut self, packet: Packet) -> Result<WorkerAction, ShardError> {
        // The realm closes right after AUTH_ERROR and does not seal it.
        if packet.is_kind(&Kind::AuthError) {
            let reason = match &packet.data {
                Some(Value::String(reason)) => reason.clone(),
                _ => "no reason given".to_string(),
            };
            return Ok(WorkerAction::Rejected(reason));
        }

        match packet.token.as_deref() {
            None => return Ok(WorkerAction::Terminate(CloseReason::MissingToken)),
            Some(token) if !self.authority.verify(token) => {
                return Ok(WorkerAction::Terminate(CloseReason::InvalidToken))
            }
            Some(_) => {}
        }

        if packet.is_kind(&Kind::AuthSuccess) {
            return Ok(match packet.id {
                Some(id) if !self.is_registered() => {
                    let id = ConnId::from(id);
                    info!("Shard connected to the realm with id {}", id);
                    self.assigned = Some(id.clone());
                    WorkerAction::Registered(id)
                }
                _ => WorkerAction::Ignore,
            });
        }

        if packet.mode != Some(Mode::DistributedTask) {
            return Ok(WorkerAction::Ignore);
        }

        // The realm's token was for its hop; the reply gets a fresh one.
        let task = packet.without_token();
        let Some(payload) = tasks::dispatch(&task)? else {
            return Ok(WorkerAction::Ignore);
        };

        let reply = self.sealed(Packet {
            mode: Some(Mode::Proxy),
            id: task.id,
            data: Some(payload),
            ..Packet::default()
        })?;
        Ok(WorkerAction::Reply(reply))
    }

    fn sealed(&self, mut packet: Packet) -> Result<Packet, SealError> {
        packet.token = Some(self.authority.issue()?);
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_test::assert_ok;

    fn authority(secret: &str) -> TokenAuthority {
        assert_ok!(TokenAuthority::from_secret(secret))
    }

    fn worker() -> ShardWorker {
        ShardWorker::new(authority("shard-secret"))
    }

    fn from_realm(packet: Packet) -> Packet {
        Packet {
            token: Some(assert_ok!(authority("shard-secret").issue())),
            ..packet
        }
    }

    fn registered_worker() -> ShardWorker {
        let mut worker = worker();
        let welcome = from_realm(Packet {
            id: Some("shard-1".to_string()),
            ..Packet::with_kind(Kind::AuthSuccess)
        });
        assert_eq!(
            assert_ok!(worker.handle(welcome)),
            WorkerAction::Registered(ConnId::from("shard-1"))
        );
        worker
    }

    #[test]
    fn test_hello_is_token_only() {
        let worker = worker();
        let hello = assert_ok!(worker.hello(None));
        assert!(authority("shard-secret").verify(hello.token.as_deref().unwrap()));
        assert!(hello.kind.is_none());
        assert!(hello.mode.is_none());
        assert!(hello.extra.is_empty());

        let with_ip = assert_ok!(worker.hello(Some("203.0.113.7")));
        assert_eq!(with_ip.extra.get("ip"), Some(&json!("203.0.113.7")));
    }

    #[test]
    fn test_auth_success_records_id_once() {
        let mut worker = registered_worker();
        assert_eq!(worker.assigned_id(), Some(&ConnId::from("shard-1")));

        let again = from_realm(Packet {
            id: Some("shard-2".to_string()),
            ..Packet::with_kind(Kind::AuthSuccess)
        });
        assert_eq!(assert_ok!(worker.handle(again)), WorkerAction::Ignore);
        assert_eq!(worker.assigned_id(), Some(&ConnId::from("shard-1")));
    }

    #[test]
    fn test_auth_error_rejects() {
        let mut worker = worker();
        let action = assert_ok!(worker.handle(Packet::auth_error(&CloseReason::InvalidToken)));
        assert_eq!(
            action,
            WorkerAction::Rejected("Invalid authentication key".to_string())
        );
        assert!(!worker.is_registered());
    }

    #[test]
    fn test_untrusted_messages_terminate() {
        let mut worker = registered_worker();
        let unsealed = Packet {
            mode: Some(Mode::DistributedTask),
            ..Packet::with_kind(Kind::Ping)
        };
        assert_eq!(
            assert_ok!(worker.handle(unsealed.clone())),
            WorkerAction::Terminate(CloseReason::MissingToken)
        );

        let forged = Packet {
            token: Some(assert_ok!(authority("other").issue())),
            ..unsealed
        };
        assert_eq!(
            assert_ok!(worker.handle(forged)),
            WorkerAction::Terminate(CloseReason::InvalidToken)
        );
    }

    #[test]
    fn test_ping_task_is_proxied_back() {
        let mut worker = registered_worker();
        let task = from_realm(Packet {
            mode: Some(Mode::DistributedTask),
            id: Some("client-a".to_string()),
            data: Some(json!({"n": 1})),
            ..Packet::with_kind(Kind::Ping)
        });
        let inbound_token = task.token.clone();

        let reply = match assert_ok!(worker.handle(task)) {
            WorkerAction::Reply(reply) => reply,
            other => panic!("expected a reply, got {:?}", other),
        };
        assert_eq!(reply.mode, Some(Mode::Proxy));
        assert_eq!(reply.id.as_deref(), Some("client-a"));
        assert_ne!(reply.token, inbound_token);
        assert!(authority("shard-secret").verify(reply.token.as_deref().unwrap()));

        let data = reply.data.unwrap();
        assert_eq!(data["type"], "PING");
        assert_eq!(data["data"]["n"], 1);
        assert!(data.get("token").is_none());
    }

    #[test]
    fn test_unknown_task_is_ignored() {
        let mut worker = registered_worker();
        let task = from_realm(Packet {
            mode: Some(Mode::DistributedTask),
            id: Some("client-a".to_string()),
            ..Packet::with_kind(Kind::Task("RENDER".to_string()))
        });
        assert_eq!(assert_ok!(worker.handle(task)), WorkerAction::Ignore);
    }

    #[test]
    fn test_heartbeat_carries_stats() {
        let worker = registered_worker();
        let stats = Stats {
            free_ram: 2048.0,
            cpu_usage: 0.5,
        };
        let beat = assert_ok!(worker.heartbeat(Some(stats)));
        assert_eq!(beat.stats, Some(stats));
        assert!(beat.token.is_some());
        assert!(assert_ok!(worker.heartbeat(None)).stats.is_none());
    }
}
