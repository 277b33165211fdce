//! Control messages exchanged over the session
//!
//! Snapshot frames that fit a datagram travel raw on the unreliable channel
//! (see [`crate::net::codec`]); everything else is one of the enums below,
//! serialized with bincode.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SyncError;
use crate::game::command::CommandBatch;
use crate::game::constants::net::MAX_RELIABLE_MESSAGE_SIZE;
use crate::game::entity::EntityId;

/// Messages from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Reliable: first message of every connection
    Hello { protocol_version: u32, identity: Uuid },
    /// Unreliable: every command not yet acknowledged by a snapshot
    Commands(CommandBatch),
    /// Reliable: the client is leaving
    Disconnect { reason: String },
}

/// Messages from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Handshake accepted
    Welcome {
        /// Entity the client controls
        entity_id: EntityId,
        /// Server ticks per second
        tick_rate: u32,
        /// Encoded full snapshot (baseline 0)
        snapshot: Vec<u8>,
    },
    /// Handshake refused
    Rejected { reason: String },
    /// The server is closing the connection
    Disconnect { reason: String },
    /// Snapshot frame too large for one datagram, sent on the reliable channel
    Snapshot { frame: Vec<u8> },
}

/// Encode a message using bincode
/// Uses legacy config for fixed-size integers
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, SyncError> {
    bincode::serde::encode_to_vec(message, bincode::config::legacy())
        .map_err(|e| SyncError::malformed(format!("encode error: {}", e)))
}

/// Decode a message using bincode
///
/// Allocation is capped at the largest reliable message, so a forged length
/// prefix cannot make the decoder reserve huge buffers.
pub fn decode<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, SyncError> {
    let config = bincode::config::legacy().with_limit::<MAX_RELIABLE_MESSAGE_SIZE>();
    let (message, consumed) = bincode::serde::decode_from_slice(data, config)
        .map_err(|e| SyncError::malformed(format!("decode error: {}", e)))?;
    if consumed != data.len() {
        return Err(SyncError::malformed(format!(
            "{} trailing bytes after message",
            data.len() - consumed
        )));
    }
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::command::{Command, CommandKind};
    use crate::util::vec3::Vec3;
    use smallvec::smallvec;

    #[test]
    fn test_client_message_hello() {
        let identity = Uuid::new_v4();
        let msg = ClientMessage::Hello {
            protocol_version: 1,
            identity,
        };
        let encoded = encode(&msg).unwrap();
        let decoded: ClientMessage = decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_client_message_commands() {
        let msg = ClientMessage::Commands(smallvec![
            Command {
                sequence: 41,
                tick: 99,
                kind: CommandKind::Move { delta: Vec3::X },
            },
            Command {
                sequence: 42,
                tick: 100,
                kind: CommandKind::Attack { target: 3, damage: 10 },
            },
        ]);
        let encoded = encode(&msg).unwrap();
        match decode::<ClientMessage>(&encoded).unwrap() {
            ClientMessage::Commands(batch) => {
                assert_eq!(batch.len(), 2);
                assert_eq!(batch[1].sequence, 42);
                assert_eq!(batch[1].kind, CommandKind::Attack { target: 3, damage: 10 });
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_server_message_welcome() {
        let msg = ServerMessage::Welcome {
            entity_id: 7,
            tick_rate: 60,
            snapshot: vec![1, 2, 3, 4],
        };
        let encoded = encode(&msg).unwrap();
        let decoded: ServerMessage = decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(
            decode::<ClientMessage>(&[0xff, 0xff, 0xff, 0xff, 0x00]),
            Err(SyncError::MalformedFrame(_))
        ));
        assert!(decode::<ServerMessage>(&[]).is_err());
    }

    #[test]
    fn test_decode_rejects_huge_length_prefix() {
        // Rejected variant (1) with a string length far beyond the limit
        let mut bytes = 1u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&u64::MAX.to_le_bytes());
        assert!(decode::<ServerMessage>(&bytes).is_err());
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut encoded = encode(&ServerMessage::Rejected {
            reason: "full".into(),
        })
        .unwrap();
        encoded.push(0);
        assert!(decode::<ServerMessage>(&encoded).is_err());
    }
}
