//! Task execution by kind

use log::{debug, warn};
use serde_json::Value;
use shared::{Kind, Packet, ProtocolError};

/// Runs one task. Returns the reply payload, or `None` for kinds this shard
/// does not serve.
pub fn dispatch(task: &Packet) -> Result<Option<Value>, ProtocolError> {
    let client = task.id.as_deref().unwrap_or("unknown");
    match &task.kind {
        Some(Kind::Ping) => {
            debug!("PING from client {}", client);
            echo(task).map(Some)
        }
        Some(kind) => {
            warn!("Unknown task type {} from client {}", kind, client);
            Ok(None)
        }
        None => {
            warn!("Task without a type from client {}", client);
            Ok(None)
        }
    }
}

/// The whole task travels back as the payload, correlation id included
fn echo(task: &Packet) -> Result<Value, ProtocolError> {
    serde_json::to_value(task).map_err(ProtocolError::Encode)
}
