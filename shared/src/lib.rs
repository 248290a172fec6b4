//! Protocol pieces shared by the realm broker and its shard workers: the JSON
//! packet envelope, close reasons, connection ids and the sealed-token
//! capability used to authenticate every realm/shard message.

pub mod packet;
pub mod seal;

pub use packet::{CloseReason, ConnId, Kind, Mode, Packet, ProtocolError, Stats};
pub use seal::{AesSealer, SealError, Sealer, TokenAuthority};

/// Default port the realm accepts shard connections on
pub const DEFAULT_SHARD_PORT: u16 = 3000;
/// Default port the realm accepts client connections on
pub const DEFAULT_CLIENT_PORT: u16 = 3001;
