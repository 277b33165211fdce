//! Error taxonomy for the synchronization core
//!
//! Every failure a connection or a single operation can hit maps onto one
//! variant here. Callers use [`SyncError::is_fatal`] to decide whether the
//! connection has to be torn down or only the offending packet/operation
//! dropped; nothing here is allowed to stop the tick loop itself.

use crate::game::entity::EntityId;
use crate::net::connection::ConnectionId;
use crate::game::Tick;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// Corrupt or truncated wire data; drop the packet
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Incompatible protocol version; fatal to that connection
    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },

    /// Mutation or command referenced a removed or never-existing entity
    #[error("Unknown entity {0}")]
    UnknownEntity(EntityId),

    /// Snapshot tick is not newer than the last applied one
    #[error("Stale snapshot: tick {tick} <= last applied {last_applied}")]
    StaleSnapshot { tick: Tick, last_applied: Tick },

    /// Delta against a baseline this side never applied
    #[error("Missing baseline {baseline} (last applied {last_applied})")]
    MissingBaseline { baseline: Tick, last_applied: Tick },

    /// Peer was silent for longer than the configured interval
    #[error("Connection {0} timed out")]
    ConnectionTimeout(ConnectionId),

    /// Undecodable data on the reliable channel; ordering cannot be repaired
    #[error("Reliable channel corrupted: {0}")]
    ReliableChannel(String),

    /// The other side of an inter-thread queue was dropped
    #[error("Queue closed")]
    QueueClosed,
}

impl SyncError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        SyncError::MalformedFrame(reason.into())
    }

    /// Whether the connection this error arose on must be torn down
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::VersionMismatch { .. }
                | SyncError::ConnectionTimeout(_)
                | SyncError::ReliableChannel(_)
                | SyncError::QueueClosed
        )
    }
}
