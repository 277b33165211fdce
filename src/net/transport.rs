//! UDP server transport
//!
//! One tokio task owns the socket and every [`Session`]. It performs the
//! handshake, hands admitted connections to the tick loop through the accept
//! queue, and from then on only moves bytes between sessions and the
//! per-connection queues. It never touches the entity store.
//!
//! Snapshot frames that fit a datagram go out unreliably. Larger ones, full
//! snapshots of a big world, go out as fragmented reliable messages, one in
//! flight at a time.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::config::NetConfig;
use crate::error::SyncError;
use crate::game::constants::net::{MAX_DATAGRAM_SIZE, PACKET_HEADER_SIZE, PROTOCOL_VERSION};
use crate::metrics::Metrics;
use crate::net::connection::{generate_id, ConnectionId, PendingHandshake};
use crate::net::protocol::{decode, encode, ClientMessage, ServerMessage};
use crate::net::queue::{connection_queues, Inbound, OutboundSnapshot, QueueSender, TransportQueues};
use crate::net::session::{Channel, Received, Session, SessionConfig};

/// How long a rejected or released peer is kept around so its last
/// reliable messages can be resent
const CLOSE_LINGER: Duration = Duration::from_secs(2);

enum PeerState {
    /// Waiting for Hello
    Handshaking,
    /// Handed to the tick loop
    Admitted(TransportQueues),
    /// Rejected or released by the tick loop; kept until the last reliable
    /// message is acknowledged or the linger ends
    Closing { until: Instant },
}

struct Peer {
    session: Session,
    state: PeerState,
    last_rtt: Option<Duration>,
    /// Reliable messages taken from the loop's queue, wrapping
    reliable_taken: u32,
}

impl Peer {
    fn id(&self) -> ConnectionId {
        self.session.connection()
    }
}

/// What to do with a peer after handling its traffic
enum Verdict {
    Keep,
    Forget,
}

/// Outcome of bridging an admitted peer's queues
#[derive(Debug, PartialEq, Eq)]
enum Pump {
    Open,
    /// The tick loop dropped the connection and everything it queued is
    /// now in the session
    Released,
    TimedOut,
}

pub struct ServerTransport {
    socket: Arc<UdpSocket>,
    config: NetConfig,
    session_config: SessionConfig,
    accept: QueueSender<PendingHandshake>,
    metrics: Arc<Metrics>,
    peers: HashMap<SocketAddr, Peer>,
    flush_interval: Duration,
}

impl ServerTransport {
    /// Bind the UDP socket
    pub async fn bind(
        config: NetConfig,
        accept: QueueSender<PendingHandshake>,
        metrics: Arc<Metrics>,
    ) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(config.socket_addr()).await?;
        info!("UDP transport listening on {}", socket.local_addr()?);

        Ok(Self {
            socket: Arc::new(socket),
            session_config: config.session(),
            flush_interval: config.tick_interval(),
            config,
            accept,
            metrics,
            peers: HashMap::new(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Peers with a live session, admitted or not
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    fn admitted_count(&self) -> usize {
        self.peers
            .values()
            .filter(|p| matches!(p.state, PeerState::Admitted(_)))
            .count()
    }

    /// Run until `shutdown` turns true (or its sender is dropped)
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        // One spare byte so oversized datagrams are detectable
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE + 1];
        let mut flush = tokio::time::interval(self.flush_interval);
        flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buffer) => {
                    match received {
                        Ok((len, addr)) => self.handle_datagram(&buffer[..len], addr, Instant::now()),
                        // ICMP errors from departed peers surface here; the socket is fine
                        Err(e) => debug!("UDP receive error: {}", e),
                    }
                }
                _ = flush.tick() => {
                    self.flush(Instant::now()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        self.shutdown().await;
                        return Ok(());
                    }
                }
            }
        }
    }

    fn handle_datagram(&mut self, datagram: &[u8], addr: SocketAddr, now: Instant) {
        Metrics::incr(&self.metrics.datagrams_received);
        Metrics::add(&self.metrics.bytes_received, datagram.len() as u64);

        let is_new = !self.peers.contains_key(&addr);
        if is_new {
            // Bound half-open sessions so spoofed sources cannot grow the map
            if self.peers.len() >= self.config.max_connections * 2 {
                trace!("Ignoring datagram from {}: too many sessions", addr);
                Metrics::incr(&self.metrics.datagrams_dropped);
                return;
            }
            let id = generate_id(|candidate| self.peers.values().any(|p| p.id() == candidate));
            let session = Session::new(id, self.session_config.clone(), now);
            self.peers.insert(
                addr,
                Peer {
                    session,
                    state: PeerState::Handshaking,
                    last_rtt: None,
                    reliable_taken: 0,
                },
            );
        }

        let admitted = self.admitted_count();
        let Some(peer) = self.peers.get_mut(&addr) else {
            return;
        };

        let verdict = match peer.session.receive(datagram, now) {
            Ok(()) => {
                let received: Vec<Received> = peer.session.poll().collect();
                let mut verdict = Verdict::Keep;
                for message in received {
                    verdict = handle_message(
                        peer,
                        message,
                        addr,
                        admitted,
                        &self.config,
                        &self.accept,
                        &self.metrics,
                        now,
                    );
                    if matches!(verdict, Verdict::Forget) {
                        break;
                    }
                }
                verdict
            }
            Err(e) if e.is_fatal() => {
                warn!("Connection {} from {}: {}", peer.id(), addr, e);
                notify_loop(peer, Inbound::Disconnected(e.to_string()));
                Verdict::Forget
            }
            Err(e) => {
                debug!("Dropping datagram from {}: {}", addr, e);
                Metrics::incr(&self.metrics.datagrams_dropped);
                if is_new {
                    Verdict::Forget
                } else {
                    Verdict::Keep
                }
            }
        };

        if matches!(verdict, Verdict::Forget) {
            self.peers.remove(&addr);
        }
    }

    /// Move queued traffic into sessions and put due datagrams on the wire
    async fn flush(&mut self, now: Instant) {
        let mut outgoing: Vec<(SocketAddr, Vec<u8>)> = Vec::new();
        let mut forget = Vec::new();

        for (&addr, peer) in self.peers.iter_mut() {
            let keep = match peer.state {
                PeerState::Handshaking => !peer.session.is_timed_out(now),
                PeerState::Closing { until } => now < until && peer.session.pending_reliable() > 0,
                PeerState::Admitted(_) => match pump_admitted(peer, &self.metrics, now) {
                    Pump::Open => true,
                    Pump::TimedOut => false,
                    Pump::Released => {
                        debug!("Connection {} released by the tick loop", peer.id());
                        peer.state = PeerState::Closing {
                            until: now + CLOSE_LINGER,
                        };
                        peer.session.pending_reliable() > 0
                    }
                },
            };

            for datagram in peer.session.update(now) {
                outgoing.push((addr, datagram));
            }
            if !keep {
                forget.push(addr);
            }
        }

        for addr in forget {
            if let Some(peer) = self.peers.remove(&addr) {
                debug!("Forgetting session {} ({})", peer.id(), addr);
            }
        }

        self.send_all(outgoing).await;
    }

    async fn send_all(&self, outgoing: Vec<(SocketAddr, Vec<u8>)>) {
        for (addr, datagram) in outgoing {
            match self.socket.send_to(&datagram, addr).await {
                Ok(sent) => {
                    Metrics::incr(&self.metrics.datagrams_sent);
                    Metrics::add(&self.metrics.bytes_sent, sent as u64);
                }
                Err(e) => debug!("Failed to send to {}: {}", addr, e),
            }
        }
    }

    /// Say goodbye to every peer
    async fn shutdown(&mut self) {
        info!("Transport shutting down, disconnecting {} peers", self.peers.len());
        let now = Instant::now();
        let mut outgoing = Vec::new();

        for (&addr, peer) in self.peers.iter_mut() {
            // Whatever the loop still had queued goes out first
            if matches!(peer.state, PeerState::Admitted(_)) {
                pump_admitted(peer, &self.metrics, now);
            }
            queue_message(
                &mut peer.session,
                &ServerMessage::Disconnect {
                    reason: "server shutting down".to_string(),
                },
            );
            notify_loop(peer, Inbound::Disconnected("server shutting down".to_string()));
            for datagram in peer.session.update(now) {
                outgoing.push((addr, datagram));
            }
        }

        self.send_all(outgoing).await;
        self.peers.clear();
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_message(
    peer: &mut Peer,
    message: Received,
    addr: SocketAddr,
    admitted: usize,
    config: &NetConfig,
    accept: &QueueSender<PendingHandshake>,
    metrics: &Metrics,
    now: Instant,
) -> Verdict {
    let decoded: Result<ClientMessage, SyncError> = decode(&message.payload);
    let client_message = match (decoded, message.channel) {
        (Ok(m), _) => m,
        (Err(e), Channel::Reliable) => {
            // Ordering cannot be repaired once a reliable message is lost
            warn!("Connection {}: undecodable reliable message: {}", peer.id(), e);
            notify_loop(
                peer,
                Inbound::Disconnected(SyncError::ReliableChannel(e.to_string()).to_string()),
            );
            return Verdict::Forget;
        }
        (Err(e), Channel::Unreliable) => {
            debug!("Connection {}: dropping unreliable message: {}", peer.id(), e);
            Metrics::incr(&metrics.datagrams_dropped);
            return Verdict::Keep;
        }
    };

    match client_message {
        ClientMessage::Hello { protocol_version, identity }
            if matches!(peer.state, PeerState::Handshaking) =>
        {
            if protocol_version != PROTOCOL_VERSION {
                let error = SyncError::VersionMismatch {
                    expected: PROTOCOL_VERSION,
                    actual: protocol_version,
                };
                reject(peer, addr, error.to_string(), metrics, now);
                return Verdict::Keep;
            }
            if admitted >= config.max_connections {
                reject(peer, addr, "server full".to_string(), metrics, now);
                return Verdict::Keep;
            }

            let (loop_end, transport_end) =
                connection_queues(config.command_queue_capacity, config.snapshot_queue_capacity);
            let handshake = PendingHandshake {
                id: peer.id(),
                identity,
                remote_addr: addr,
                queues: loop_end,
            };
            if accept.push(handshake).is_err() {
                reject(peer, addr, "server is not running".to_string(), metrics, now);
                return Verdict::Keep;
            }
            debug!("Connection {} ({}) handed to the tick loop", peer.id(), addr);
            peer.state = PeerState::Admitted(transport_end);
            Verdict::Keep
        }
        ClientMessage::Hello { .. } => {
            trace!("Connection {}: repeated Hello", peer.id());
            Verdict::Keep
        }
        ClientMessage::Commands(batch) => {
            let PeerState::Admitted(queues) = &peer.state else {
                debug!("Connection {}: commands outside an admitted session", peer.id());
                return Verdict::Keep;
            };
            match queues.inbound.push(Inbound::Commands(batch)) {
                Ok(true) => trace!("Connection {}: inbound queue full, dropped oldest", peer.id()),
                Ok(false) => {}
                Err(_) => return Verdict::Forget,
            }
            Verdict::Keep
        }
        ClientMessage::Disconnect { reason } => {
            info!("Connection {} ({}) disconnected: {}", peer.id(), addr, reason);
            notify_loop(peer, Inbound::Disconnected(reason));
            Verdict::Forget
        }
    }
}

/// Bridge one admitted peer's queues and session
fn pump_admitted(peer: &mut Peer, metrics: &Metrics, now: Instant) -> Pump {
    let PeerState::Admitted(queues) = &peer.state else {
        return Pump::Open;
    };
    let id = peer.session.connection();

    if peer.session.is_timed_out(now) {
        info!("Connection {} timed out after {:?}", id, peer.session.idle_time(now));
        let _ = queues.inbound.push(Inbound::TimedOut);
        return Pump::TimedOut;
    }

    for message in queues.reliable.drain() {
        queue_message(&mut peer.session, &message);
        peer.reliable_taken = peer.reliable_taken.wrapping_add(1);
    }
    for snapshot in queues.snapshots.drain() {
        send_snapshot(&mut peer.session, snapshot, metrics);
    }

    // A reliable snapshot in flight is not something the loop waits for
    let unacked = peer.session.pending_reliable()
        - usize::from(peer.session.reliable_snapshot_in_flight());
    queues.progress.publish(peer.reliable_taken, unacked as u32);

    // Acks are cumulative, the newest one is all the loop needs
    if let Some(acked) = peer.session.take_acked_ticks().into_iter().max() {
        let _ = queues.inbound.push(Inbound::Acked(acked));
    }
    let rtt = peer.session.rtt();
    if rtt.is_some() && rtt != peer.last_rtt {
        peer.last_rtt = rtt;
        if let Some(rtt) = rtt {
            let _ = queues.inbound.push(Inbound::Rtt(rtt));
        }
    }

    if queues.reliable.is_closed() {
        Pump::Released
    } else {
        Pump::Open
    }
}

fn send_snapshot(session: &mut Session, snapshot: OutboundSnapshot, metrics: &Metrics) {
    let id = session.connection();
    let tick = snapshot.tick;

    let sent = if PACKET_HEADER_SIZE + snapshot.frame.len() <= MAX_DATAGRAM_SIZE {
        session.send_tagged(snapshot.frame, tick)
    } else if session.reliable_snapshot_in_flight() {
        // The client catches up from the one already on its way
        debug!("Connection {}: snapshot {} skipped, previous one still in flight", id, tick);
        Metrics::incr(&metrics.snapshots_dropped);
        return;
    } else {
        trace!(
            "Connection {}: snapshot {} of {} bytes sent reliably",
            id,
            tick,
            snapshot.frame.len()
        );
        encode(&ServerMessage::Snapshot {
            frame: snapshot.frame,
        })
        .and_then(|payload| session.send_reliable_tagged(payload, tick))
    };

    if let Err(e) = sent {
        warn!("Connection {}: snapshot {} not sent: {}", id, tick, e);
        Metrics::incr(&metrics.snapshots_dropped);
    }
}

fn queue_message(session: &mut Session, message: &ServerMessage) {
    let sent = encode(message).and_then(|payload| session.send(Channel::Reliable, payload));
    if let Err(e) = sent {
        warn!("Connection {}: reliable message not sent: {}", session.connection(), e);
    }
}

fn reject(peer: &mut Peer, addr: SocketAddr, reason: String, metrics: &Metrics, now: Instant) {
    info!("Rejecting {} ({}): {}", peer.id(), addr, reason);
    Metrics::incr(&metrics.connections_rejected);
    queue_message(&mut peer.session, &ServerMessage::Rejected { reason });
    peer.state = PeerState::Closing {
        until: now + CLOSE_LINGER,
    };
}

fn notify_loop(peer: &Peer, message: Inbound) {
    if let PeerState::Admitted(queues) = &peer.state {
        if queues.inbound.push(message).is_err() {
            debug!("Connection {} already released by the tick loop", peer.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::protocol;
    use crate::net::queue::{lossless, QueueReceiver};
    use uuid::Uuid;

    async fn server(max_connections: usize) -> (ServerTransport, QueueReceiver<PendingHandshake>) {
        let config = NetConfig {
            bind_address: "127.0.0.1".parse().unwrap(),
            port: 0,
            max_connections,
            ..NetConfig::default()
        };
        let (accept, accept_rx) = lossless();
        let transport = ServerTransport::bind(config, accept, Arc::new(Metrics::new()))
            .await
            .unwrap();
        (transport, accept_rx)
    }

    fn client_addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    /// Client session producing the datagrams for one reliable message
    fn client_datagrams(session: &mut Session, message: &ClientMessage, now: Instant) -> Vec<Vec<u8>> {
        session
            .send(Channel::Reliable, protocol::encode(message).unwrap())
            .unwrap();
        session.update(now)
    }

    fn hello(version: u32) -> ClientMessage {
        ClientMessage::Hello {
            protocol_version: version,
            identity: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn test_hello_is_handed_to_tick_loop() {
        let (mut transport, accept_rx) = server(4).await;
        let now = Instant::now();
        let mut client = Session::new(0, SessionConfig::default(), now);

        for datagram in client_datagrams(&mut client, &hello(PROTOCOL_VERSION), now) {
            transport.handle_datagram(&datagram, client_addr(4000), now);
        }

        let handshake = accept_rx.try_pop().expect("handshake not forwarded");
        assert_eq!(handshake.remote_addr, client_addr(4000));
        assert_ne!(handshake.id, 0);
        assert_eq!(transport.admitted_count(), 1);
    }

    #[tokio::test]
    async fn test_version_mismatch_rejected() {
        let (mut transport, accept_rx) = server(4).await;
        let now = Instant::now();
        let mut client = Session::new(0, SessionConfig::default(), now);

        for datagram in client_datagrams(&mut client, &hello(PROTOCOL_VERSION + 1), now) {
            transport.handle_datagram(&datagram, client_addr(4001), now);
        }

        assert!(accept_rx.try_pop().is_none());
        assert_eq!(transport.admitted_count(), 0);
        assert_eq!(transport.peer_count(), 1, "kept around to deliver the rejection");
    }

    #[tokio::test]
    async fn test_server_full_rejected() {
        let (mut transport, accept_rx) = server(1).await;
        let now = Instant::now();

        for port in [4002, 4003] {
            let mut client = Session::new(0, SessionConfig::default(), now);
            for datagram in client_datagrams(&mut client, &hello(PROTOCOL_VERSION), now) {
                transport.handle_datagram(&datagram, client_addr(port), now);
            }
        }

        assert!(accept_rx.try_pop().is_some());
        assert!(accept_rx.try_pop().is_none());
        assert_eq!(transport.admitted_count(), 1);
    }

    #[tokio::test]
    async fn test_garbage_is_dropped() {
        let (mut transport, accept_rx) = server(4).await;
        transport.handle_datagram(&[0xFF; 3], client_addr(4004), Instant::now());

        assert!(accept_rx.try_pop().is_none());
        assert_eq!(transport.peer_count(), 0);
        assert_eq!(
            transport
                .metrics
                .datagrams_dropped
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn test_commands_and_disconnect_reach_loop() {
        let (mut transport, accept_rx) = server(4).await;
        let now = Instant::now();
        let addr = client_addr(4005);
        let mut client = Session::new(0, SessionConfig::default(), now);
        for datagram in client_datagrams(&mut client, &hello(PROTOCOL_VERSION), now) {
            transport.handle_datagram(&datagram, addr, now);
        }
        let handshake = accept_rx.try_pop().unwrap();

        let batch = ClientMessage::Commands(smallvec::smallvec![]);
        client
            .send(Channel::Unreliable, protocol::encode(&batch).unwrap())
            .unwrap();
        for datagram in client.update(now) {
            transport.handle_datagram(&datagram, addr, now);
        }
        assert!(matches!(
            handshake.queues.inbound.drain().as_slice(),
            [Inbound::Commands(_)]
        ));

        let bye = ClientMessage::Disconnect {
            reason: "quit".into(),
        };
        for datagram in client_datagrams(&mut client, &bye, now) {
            transport.handle_datagram(&datagram, addr, now);
        }
        assert_eq!(
            handshake.queues.inbound.drain(),
            vec![Inbound::Disconnected("quit".into())]
        );
        assert_eq!(transport.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let (mut transport, accept_rx) = server(4).await;
        let now = Instant::now();
        let addr = client_addr(4006);
        let mut client = Session::new(0, SessionConfig::default(), now);
        for datagram in client_datagrams(&mut client, &hello(PROTOCOL_VERSION), now) {
            transport.handle_datagram(&datagram, addr, now);
        }
        let handshake = accept_rx.try_pop().unwrap();

        let later = now + transport.session_config.timeout + Duration::from_millis(1);
        transport.flush(later).await;

        assert_eq!(handshake.queues.inbound.drain(), vec![Inbound::TimedOut]);
        assert_eq!(transport.peer_count(), 0);
    }

    /// Every datagram the transport sent to `socket` until it goes quiet
    async fn receive_all(socket: &UdpSocket) -> Vec<Vec<u8>> {
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE + 1];
        let mut datagrams = Vec::new();
        while let Ok(Ok((len, _))) =
            tokio::time::timeout(Duration::from_millis(200), socket.recv_from(&mut buffer)).await
        {
            datagrams.push(buffer[..len].to_vec());
        }
        datagrams
    }

    fn empty_commands() -> Vec<u8> {
        protocol::encode(&ClientMessage::Commands(smallvec::smallvec![])).unwrap()
    }

    #[tokio::test]
    async fn test_released_connection_lingers_until_acknowledged() {
        let (mut transport, accept_rx) = server(4).await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let now = Instant::now();
        let mut client = Session::new(0, SessionConfig::default(), now);
        for datagram in client_datagrams(&mut client, &hello(PROTOCOL_VERSION), now) {
            transport.handle_datagram(&datagram, addr, now);
        }
        let handshake = accept_rx.try_pop().unwrap();

        handshake
            .queues
            .reliable
            .push(ServerMessage::Rejected {
                reason: "server is shutting down".into(),
            })
            .unwrap();
        drop(handshake);

        transport.flush(now).await;
        assert_eq!(transport.peer_count(), 1, "kept until the rejection is acknowledged");

        // Still unacknowledged, so it goes out again
        let later = now + Duration::from_millis(300);
        transport.flush(later).await;
        assert_eq!(transport.peer_count(), 1);

        let datagrams = receive_all(&socket).await;
        assert!(datagrams.len() >= 2, "rejection was not resent");
        for datagram in &datagrams {
            client.receive(datagram, later).unwrap();
        }
        let rejections = client
            .poll()
            .filter(|r| {
                matches!(
                    protocol::decode::<ServerMessage>(&r.payload),
                    Ok(ServerMessage::Rejected { .. })
                )
            })
            .count();
        assert_eq!(rejections, 1);

        // Any packet from the client carries the ack
        client.send(Channel::Unreliable, empty_commands()).unwrap();
        for datagram in client.update(later) {
            transport.handle_datagram(&datagram, addr, later);
        }
        transport.flush(later).await;
        assert_eq!(transport.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_released_connection_forgotten_after_linger() {
        let (mut transport, accept_rx) = server(4).await;
        let now = Instant::now();

        // Nothing left to deliver: forgotten on the next flush
        let mut client = Session::new(0, SessionConfig::default(), now);
        for datagram in client_datagrams(&mut client, &hello(PROTOCOL_VERSION), now) {
            transport.handle_datagram(&datagram, client_addr(4007), now);
        }
        drop(accept_rx.try_pop().unwrap());
        transport.flush(now).await;
        assert_eq!(transport.peer_count(), 0);

        // A client that never acknowledges is dropped once the linger ends
        let mut client = Session::new(0, SessionConfig::default(), now);
        for datagram in client_datagrams(&mut client, &hello(PROTOCOL_VERSION), now) {
            transport.handle_datagram(&datagram, client_addr(4008), now);
        }
        let handshake = accept_rx.try_pop().unwrap();
        handshake
            .queues
            .reliable
            .push(ServerMessage::Disconnect {
                reason: "kicked".into(),
            })
            .unwrap();
        drop(handshake);

        transport.flush(now).await;
        assert_eq!(transport.peer_count(), 1);
        transport.flush(now + CLOSE_LINGER - Duration::from_millis(1)).await;
        assert_eq!(transport.peer_count(), 1);
        transport.flush(now + CLOSE_LINGER).await;
        assert_eq!(transport.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_reliable_progress_reported_to_loop() {
        let (mut transport, accept_rx) = server(4).await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let now = Instant::now();
        let mut client = Session::new(0, SessionConfig::default(), now);
        for datagram in client_datagrams(&mut client, &hello(PROTOCOL_VERSION), now) {
            transport.handle_datagram(&datagram, addr, now);
        }
        let handshake = accept_rx.try_pop().unwrap();

        handshake
            .queues
            .reliable
            .push(ServerMessage::Rejected {
                reason: "kick pending".into(),
            })
            .unwrap();
        transport.flush(now).await;
        assert_eq!(handshake.queues.progress.load(), (1, 1));

        for datagram in receive_all(&socket).await {
            client.receive(&datagram, now).unwrap();
        }
        let later = now + Duration::from_millis(10);
        client.send(Channel::Unreliable, empty_commands()).unwrap();
        for datagram in client.update(later) {
            transport.handle_datagram(&datagram, addr, later);
        }
        transport.flush(later).await;
        assert_eq!(handshake.queues.progress.load(), (1, 0));
    }

    #[tokio::test]
    async fn test_oversized_snapshot_sent_reliably() {
        use crate::game::constants::net::MTU_DATAGRAM_SIZE;

        let (mut transport, accept_rx) = server(4).await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let now = Instant::now();
        let mut client = Session::new(0, SessionConfig::default(), now);
        for datagram in client_datagrams(&mut client, &hello(PROTOCOL_VERSION), now) {
            transport.handle_datagram(&datagram, addr, now);
        }
        let handshake = accept_rx.try_pop().unwrap();

        let frame: Vec<u8> = (0..20_000u32).map(|i| i as u8).collect();
        handshake
            .queues
            .snapshots
            .push(OutboundSnapshot {
                tick: 5,
                frame: frame.clone(),
            })
            .unwrap();
        transport.flush(now).await;

        // A second large frame is skipped while the first is in flight
        handshake
            .queues
            .snapshots
            .push(OutboundSnapshot {
                tick: 6,
                frame: frame.clone(),
            })
            .unwrap();
        transport.flush(now).await;
        assert_eq!(
            transport
                .metrics
                .snapshots_dropped
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
        // Snapshots are not loop messages the drain waits for
        assert_eq!(handshake.queues.progress.load(), (0, 0));

        for datagram in receive_all(&socket).await {
            assert!(datagram.len() <= MTU_DATAGRAM_SIZE);
            client.receive(&datagram, now).unwrap();
        }
        let frames: Vec<Vec<u8>> = client
            .poll()
            .filter_map(|r| match protocol::decode::<ServerMessage>(&r.payload) {
                Ok(ServerMessage::Snapshot { frame }) => Some(frame),
                _ => None,
            })
            .collect();
        assert_eq!(frames, vec![frame]);

        let later = now + Duration::from_millis(10);
        client.send(Channel::Unreliable, empty_commands()).unwrap();
        for datagram in client.update(later) {
            transport.handle_datagram(&datagram, addr, later);
        }
        transport.flush(later).await;
        assert!(handshake.queues.inbound.drain().contains(&Inbound::Acked(5)));
    }
}
