//! Authentication gate for realm/shard traffic

use shared::{CloseReason, ConnId, Packet, SealError, TokenAuthority};

/// Result of checking one inbound shard message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    /// Reply `AUTH_ERROR` with this reason, then close with it
    Rejected(CloseReason),
}

#[derive(Debug, Clone)]
pub struct AuthGate {
    authority: TokenAuthority,
}

impl AuthGate {
    pub fn new(authority: TokenAuthority) -> Self {
        Self { authority }
    }

    /// Accepts iff the packet's token opens to the shared secret
    pub fn authenticate(&self, packet: &Packet) -> Verdict {
        match packet.token.as_deref() {
            None => Verdict::Rejected(CloseReason::MissingToken),
            Some(token) if self.authority.verify(token) => Verdict::Accepted,
            Some(_) => Verdict::Rejected(CloseReason::InvalidToken),
        }
    }

    /// `AUTH_SUCCESS` reply naming the id assigned to a newly registered shard
    pub fn welcome(&self, id: &ConnId) -> Result<Packet, SealError> {
        Ok(Packet::auth_success(id, self.authority.issue()?))
    }

    /// Attaches a freshly sealed token to an outbound packet
    pub fn stamp(&self, mut packet: Packet) -> Result<Packet, SealError> {
        packet.token = Some(self.authority.issue()?);
        Ok(packet)
    }
}
