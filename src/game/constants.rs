//! Shared protocol and simulation constants
//!
//! Values both the server and the client predictor must agree on live here;
//! anything an operator may want to tune lives in [`crate::config`].

/// Tick timing defaults
pub mod tick {
    /// Default server tick rate in Hz
    pub const DEFAULT_RATE: u32 = 60;
    /// Highest accepted tick rate
    pub const MAX_RATE: u32 = 240;
    /// Default number of ticks of removal history kept for delta baselines
    pub const DEFAULT_HISTORY: u32 = 256;
}

/// Wire protocol constants
pub mod net {
    /// Snapshot frame / handshake protocol version
    pub const PROTOCOL_VERSION: u32 = 1;
    /// Datagram size that fits a conservative path MTU without IP fragmentation
    pub const MTU_DATAGRAM_SIZE: usize = 1200;
    /// Hard limit on any datagram sent or accepted; unreliable frames
    /// between the MTU size and this rely on IP fragmentation
    pub const MAX_DATAGRAM_SIZE: usize = 8192;
    /// Packet header: kind (1) + sequence (2) + ack (2) + ack bits (4)
    pub const PACKET_HEADER_SIZE: usize = 9;
    /// Reliable body header: message id (2) + fragment index (2) + fragment count (2)
    pub const RELIABLE_HEADER_SIZE: usize = 6;
    /// Largest chunk of a reliable message carried by one datagram
    pub const RELIABLE_FRAGMENT_SIZE: usize =
        MTU_DATAGRAM_SIZE - PACKET_HEADER_SIZE - RELIABLE_HEADER_SIZE;
    /// Largest reliable message, after reassembly
    pub const MAX_RELIABLE_MESSAGE_SIZE: usize = 1 << 20;
    /// Fragments needed for the largest reliable message
    pub const MAX_FRAGMENTS: usize = MAX_RELIABLE_MESSAGE_SIZE.div_ceil(RELIABLE_FRAGMENT_SIZE);
    /// Reliable fragments a session queues before the peer is considered stuck
    pub const MAX_RELIABLE_BACKLOG: usize = 16_384;
    /// Number of earlier packets covered by the ack bitmask
    pub const ACK_BITS: u16 = 32;
    /// Sent-packet records kept for ack resolution
    pub const SENT_WINDOW: usize = 256;
    /// Reliable fragments in flight ahead of the oldest unacked one; also
    /// the receiver's out-of-order buffer
    pub const RELIABLE_WINDOW: u16 = 256;
    /// RTT samples averaged per connection
    pub const RTT_SAMPLES: usize = 10;
    /// Default UDP port
    pub const DEFAULT_PORT: u16 = 54777;
    /// Default silence interval before a connection is torn down (ms)
    pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
    /// Commands a client keeps resending until acknowledged
    pub const MAX_UNACKED_COMMANDS: usize = 64;
}

/// Simulation limits shared by the server and the client predictor
pub mod sim {
    /// Largest displacement a single Move command may request
    pub const MAX_MOVE_PER_COMMAND: f32 = 5.0;
    /// Largest speed a SetVelocity command may request (units/second)
    pub const MAX_SPEED: f32 = 50.0;
    /// Largest damage a single Attack command may deal
    pub const MAX_ATTACK_DAMAGE: i32 = 100;
    /// Health given to newly joined player entities
    pub const PLAYER_HEALTH: i32 = 100;
}

/// Entity kind tags
pub mod kind {
    pub const PLAYER: u16 = 1;
    pub const CART: u16 = 2;
    pub const PROJECTILE: u16 = 3;
}
