use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::error::SyncError;
use crate::game::entity::EntityId;
use crate::game::Tick;
use crate::net::protocol::ServerMessage;
use crate::net::queue::{Inbound, LoopQueues, OutboundSnapshot};
use crate::net::sequence::{sequence_greater_than, Sequence};

/// Random non-zero connection identifier
pub type ConnectionId = u64;

/// Pick a random non-zero id for which `in_use` is false
pub fn generate_id(in_use: impl Fn(ConnectionId) -> bool) -> ConnectionId {
    loop {
        let candidate = rand::random::<u64>();
        if candidate != 0 && !in_use(candidate) {
            break candidate;
        }
    }
}

/// Handshake handed from the transport to the tick loop for admission
pub struct PendingHandshake {
    pub id: ConnectionId,
    pub identity: Uuid,
    pub remote_addr: SocketAddr,
    pub queues: LoopQueues,
}

/// Tick-loop view of one client
///
/// Created when the handshake is accepted, dropped on disconnect or
/// timeout. Dropping it closes the queues, which tells the transport to
/// close the session once its last reliable message is delivered.
pub struct Connection {
    pub id: ConnectionId,
    pub identity: Uuid,
    pub remote_addr: SocketAddr,
    /// Entity this client controls
    pub entity: EntityId,
    /// Last tick the client acknowledged; 0 until the first ack
    pub baseline: Tick,
    /// Last command sequence applied for this client
    pub last_applied: Option<Sequence>,
    pub rtt: Option<Duration>,
    queues: LoopQueues,
    /// Reliable messages queued so far, wrapping like the transport's count
    reliable_queued: u32,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub commands_applied: u64,
    pub commands_rejected: u64,
    pub snapshots_sent: u64,
}

impl Connection {
    pub fn new(handshake: PendingHandshake, entity: EntityId, now: Instant) -> Self {
        Self {
            id: handshake.id,
            identity: handshake.identity,
            remote_addr: handshake.remote_addr,
            entity,
            baseline: 0,
            last_applied: None,
            rtt: None,
            queues: handshake.queues,
            reliable_queued: 0,
            created_at: now,
            last_activity: now,
            commands_applied: 0,
            commands_rejected: 0,
            snapshots_sent: 0,
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn idle_time(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Record an acknowledged tick; acks are cumulative so older ones are ignored
    pub fn acknowledge(&mut self, tick: Tick) {
        if tick > self.baseline {
            self.baseline = tick;
        }
    }

    /// Sequence echoed back in snapshots, 0 before anything was applied
    pub fn acked_sequence(&self) -> Sequence {
        self.last_applied.unwrap_or(0)
    }

    /// Whether `sequence` is strictly newer than the last applied command
    pub fn accepts_sequence(&self, sequence: Sequence) -> bool {
        match self.last_applied {
            None => sequence != 0,
            Some(last) => sequence_greater_than(sequence, last),
        }
    }

    pub fn record_applied(&mut self, sequence: Sequence) {
        self.last_applied = Some(sequence);
    }

    /// Everything the transport delivered since the last tick
    pub fn drain_inbound(&self) -> Vec<Inbound> {
        self.queues.inbound.drain()
    }

    /// Transport dropped its end of the inbound queue
    pub fn transport_closed(&self) -> bool {
        self.queues.inbound.is_closed()
    }

    pub fn send_reliable(&mut self, message: ServerMessage) -> Result<(), SyncError> {
        self.queues.reliable.push(message)?;
        self.reliable_queued = self.reliable_queued.wrapping_add(1);
        Ok(())
    }

    /// Queue a snapshot frame; `Ok(true)` when an older one was evicted
    pub fn send_snapshot(&mut self, tick: Tick, frame: Vec<u8>) -> Result<bool, SyncError> {
        let evicted = self.queues.snapshots.push(OutboundSnapshot { tick, frame })?;
        self.snapshots_sent += 1;
        Ok(evicted)
    }

    /// Reliable messages the client has not acknowledged yet, including
    /// those the transport has not picked up
    pub fn reliable_pending(&self) -> usize {
        let (taken, unacked) = self.queues.progress.load();
        self.reliable_queued.wrapping_sub(taken) as usize + unacked as usize
    }
}

/// Connections admitted by the tick loop, iterated in id order
pub struct ConnectionManager {
    connections: BTreeMap<ConnectionId, Connection>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            connections: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, connection: Connection) {
        self.connections.insert(connection.id, connection);
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        self.connections.remove(&id)
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Connection ids in ascending order
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.connections.values_mut()
    }

    /// Oldest non-zero baseline still in use
    pub fn min_baseline(&self) -> Option<Tick> {
        self.connections
            .values()
            .map(|c| c.baseline)
            .filter(|&b| b != 0)
            .min()
    }

    /// Remove and return connections idle for longer than `max_idle`
    pub fn cleanup_stale(&mut self, now: Instant, max_idle: Duration) -> Vec<Connection> {
        let stale: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.idle_time(now) > max_idle)
            .map(|(id, _)| *id)
            .collect();

        stale.into_iter().filter_map(|id| self.remove(id)).collect()
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::queue::{connection_queues, TransportQueues};
    use std::net::{IpAddr, Ipv4Addr};

    fn test_addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 54777)
    }

    fn connection(id: ConnectionId, entity: EntityId, now: Instant) -> (Connection, TransportQueues) {
        let (loop_end, transport_end) = connection_queues(16, 2);
        let handshake = PendingHandshake {
            id,
            identity: Uuid::new_v4(),
            remote_addr: test_addr(),
            queues: loop_end,
        };
        (Connection::new(handshake, entity, now), transport_end)
    }

    #[test]
    fn test_generate_id_is_non_zero_and_free() {
        let taken = [1u64, 2, 3];
        for _ in 0..100 {
            let id = generate_id(|c| taken.contains(&c));
            assert_ne!(id, 0);
            assert!(!taken.contains(&id));
        }
    }

    #[test]
    fn test_acknowledge_is_cumulative() {
        let now = Instant::now();
        let (mut conn, _transport) = connection(1, 1, now);

        conn.acknowledge(10);
        conn.acknowledge(7);
        assert_eq!(conn.baseline, 10);
        conn.acknowledge(12);
        assert_eq!(conn.baseline, 12);
    }

    #[test]
    fn test_sequence_acceptance() {
        let now = Instant::now();
        let (mut conn, _transport) = connection(1, 1, now);

        assert_eq!(conn.acked_sequence(), 0);
        assert!(conn.accepts_sequence(1));
        assert!(!conn.accepts_sequence(0));

        conn.record_applied(5);
        assert!(!conn.accepts_sequence(5));
        assert!(!conn.accepts_sequence(4));
        assert!(conn.accepts_sequence(6));
        assert_eq!(conn.acked_sequence(), 5);

        conn.record_applied(65535);
        assert!(conn.accepts_sequence(1));
    }

    #[test]
    fn test_queues_reach_transport() {
        let now = Instant::now();
        let (mut conn, transport) = connection(1, 1, now);

        transport.inbound.push(Inbound::Acked(3)).unwrap();
        assert_eq!(conn.drain_inbound(), vec![Inbound::Acked(3)]);

        conn.send_reliable(ServerMessage::Rejected { reason: "x".into() })
            .unwrap();
        assert_eq!(conn.reliable_pending(), 1);
        assert_eq!(transport.reliable.drain().len(), 1);

        assert_eq!(conn.send_snapshot(1, vec![1]), Ok(false));
        assert_eq!(conn.send_snapshot(2, vec![2]), Ok(false));
        assert_eq!(conn.send_snapshot(3, vec![3]), Ok(true));
        assert_eq!(conn.snapshots_sent, 3);

        drop(transport);
        assert!(conn.transport_closed());
        assert_eq!(conn.send_snapshot(4, vec![4]), Err(SyncError::QueueClosed));
    }

    #[test]
    fn test_reliable_pending_until_client_acks() {
        let now = Instant::now();
        let (mut conn, transport) = connection(1, 1, now);

        conn.send_reliable(ServerMessage::Rejected { reason: "x".into() })
            .unwrap();
        conn.send_reliable(ServerMessage::Disconnect { reason: "y".into() })
            .unwrap();
        assert_eq!(conn.reliable_pending(), 2);

        // Picked up but not reported yet
        assert_eq!(transport.reliable.drain().len(), 2);
        assert_eq!(conn.reliable_pending(), 2);

        transport.progress.publish(2, 2);
        assert_eq!(conn.reliable_pending(), 2);
        transport.progress.publish(2, 1);
        assert_eq!(conn.reliable_pending(), 1);
        transport.progress.publish(2, 0);
        assert_eq!(conn.reliable_pending(), 0);

        // Counts wrap together
        conn.reliable_queued = u32::MAX;
        transport.progress.publish(u32::MAX - 1, 0);
        assert_eq!(conn.reliable_pending(), 1);
    }

    #[test]
    fn test_manager_orders_by_id() {
        let now = Instant::now();
        let mut manager = ConnectionManager::new();
        let mut transports = Vec::new();
        for id in [30u64, 10, 20] {
            let (conn, transport) = connection(id, id as EntityId, now);
            manager.insert(conn);
            transports.push(transport);
        }

        assert_eq!(manager.ids(), vec![10, 20, 30]);
        assert_eq!(manager.count(), 3);
    }

    #[test]
    fn test_min_baseline_ignores_unacked() {
        let now = Instant::now();
        let mut manager = ConnectionManager::new();
        let (mut a, _ta) = connection(1, 1, now);
        let (b, _tb) = connection(2, 2, now);
        let (mut c, _tc) = connection(3, 3, now);
        a.acknowledge(40);
        c.acknowledge(25);
        manager.insert(a);
        manager.insert(b);
        manager.insert(c);

        assert_eq!(manager.min_baseline(), Some(25));
    }

    #[test]
    fn test_cleanup_stale() {
        let start = Instant::now();
        let mut manager = ConnectionManager::new();
        let (a, _ta) = connection(1, 1, start);
        let (mut b, _tb) = connection(2, 2, start);
        b.touch(start + Duration::from_secs(20));
        manager.insert(a);
        manager.insert(b);

        let removed = manager.cleanup_stale(start + Duration::from_secs(31), Duration::from_secs(30));
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, 1);
        assert_eq!(manager.ids(), vec![2]);
    }
}
