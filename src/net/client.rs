//! UDP client transport
//!
//! [`ClientTransport::connect`] spawns one tokio task that owns the socket
//! and the client's [`Session`]. The game thread talks to it through a
//! [`ClientLink`]: commands and disconnects go in, [`ClientEvent`]s come out.
//!
//! Events derived from reliable messages sit in a queue that never drops, so
//! a burst of snapshots cannot push a Welcome or a rejection out.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::SyncError;
use crate::game::command::CommandBatch;
use crate::game::constants::net::{MAX_DATAGRAM_SIZE, PROTOCOL_VERSION};
use crate::game::entity::EntityId;
use crate::net::protocol::{decode, encode, ClientMessage, ServerMessage};
use crate::net::queue::{drop_oldest, lossless, QueueReceiver, QueueSender};
use crate::net::sequence::Sequence;
use crate::net::session::{Channel, Session, SessionConfig};

/// Snapshot events buffered for the game thread before the oldest is dropped
const SNAPSHOT_EVENT_CAPACITY: usize = 256;
/// Upper bound on waiting for a goodbye to be acknowledged
const DISCONNECT_LINGER: Duration = Duration::from_millis(500);

/// Something the server told us
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Welcome {
        entity_id: EntityId,
        tick_rate: u32,
        /// Encoded full snapshot
        snapshot: Vec<u8>,
    },
    /// Raw snapshot frame with the sequence of the packet that carried it
    Snapshot { sequence: Sequence, frame: Vec<u8> },
    Rejected { reason: String },
    /// The session ended; no further events follow
    Disconnected { reason: String },
}

enum Outgoing {
    Commands(CommandBatch),
    Disconnect(String),
}

/// Task end of the event queues
struct EventSink {
    control: QueueSender<ClientEvent>,
    snapshots: QueueSender<ClientEvent>,
}

impl EventSink {
    fn push(&self, event: ClientEvent) -> Result<(), SyncError> {
        match event {
            ClientEvent::Snapshot { .. } => {
                if self.snapshots.push(event)? {
                    trace!("Snapshot events not consumed, dropped the oldest");
                }
                Ok(())
            }
            _ => self.control.push(event).map(|_| ()),
        }
    }
}

fn event_queues() -> (EventSink, QueueReceiver<ClientEvent>, QueueReceiver<ClientEvent>) {
    let (control_tx, control_rx) = lossless();
    let (snapshots_tx, snapshots_rx) = drop_oldest(SNAPSHOT_EVENT_CAPACITY);
    let sink = EventSink {
        control: control_tx,
        snapshots: snapshots_tx,
    };
    (sink, control_rx, snapshots_rx)
}

/// Game-thread handle to a running client transport
pub struct ClientLink {
    outgoing: mpsc::UnboundedSender<Outgoing>,
    /// Welcome, Rejected and Disconnected
    control: QueueReceiver<ClientEvent>,
    snapshots: QueueReceiver<ClientEvent>,
    local_addr: SocketAddr,
}

impl ClientLink {
    /// Send a batch of commands on the unreliable channel
    pub fn send_commands(&self, batch: CommandBatch) -> Result<(), SyncError> {
        self.outgoing
            .send(Outgoing::Commands(batch))
            .map_err(|_| SyncError::QueueClosed)
    }

    /// Say goodbye; a `Disconnected` event follows
    pub fn disconnect(&self, reason: impl Into<String>) -> Result<(), SyncError> {
        self.outgoing
            .send(Outgoing::Disconnect(reason.into()))
            .map_err(|_| SyncError::QueueClosed)
    }

    /// Every event received since the last call, control events first
    pub fn events(&self) -> Vec<ClientEvent> {
        let mut events = self.control.drain();
        events.extend(self.snapshots.drain());
        events
    }

    /// Next event; a pending control event comes before any snapshot
    pub fn try_event(&self) -> Option<ClientEvent> {
        self.control.try_pop().or_else(|| self.snapshots.try_pop())
    }

    /// The transport task has exited and every event was consumed
    pub fn is_closed(&self) -> bool {
        self.control.is_closed() && self.snapshots.is_closed()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

pub struct ClientTransport;

impl ClientTransport {
    /// Open a session to `server` and send the handshake
    pub async fn connect(
        server: SocketAddr,
        identity: Uuid,
        config: SessionConfig,
    ) -> anyhow::Result<ClientLink> {
        let bind: SocketAddr = if server.is_ipv4() {
            "0.0.0.0:0".parse()?
        } else {
            "[::]:0".parse()?
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(server).await?;
        let local_addr = socket.local_addr()?;

        let flush_interval = config.resend_interval.min(config.heartbeat_interval);
        let mut session = Session::new(0, config, Instant::now());
        let hello = ClientMessage::Hello {
            protocol_version: PROTOCOL_VERSION,
            identity,
        };
        session.send(Channel::Reliable, encode(&hello)?)?;

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (sink, control, snapshots) = event_queues();

        info!("Connecting to {} from {}", server, local_addr);
        tokio::spawn(run(socket, session, outgoing_rx, sink, flush_interval));

        Ok(ClientLink {
            outgoing: outgoing_tx,
            control,
            snapshots,
            local_addr,
        })
    }
}

async fn run(
    socket: UdpSocket,
    mut session: Session,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    events: EventSink,
    flush_interval: Duration,
) {
    let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE + 1];
    let mut flush = tokio::time::interval(flush_interval);
    flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let reason = loop {
        tokio::select! {
            received = socket.recv(&mut buffer) => {
                let datagram = match received {
                    Ok(len) => &buffer[..len],
                    Err(e) => {
                        // Usually ICMP port unreachable before the server is up
                        debug!("UDP receive error: {}", e);
                        continue;
                    }
                };
                match handle_datagram(&mut session, datagram, &events) {
                    Ok(None) => {}
                    Ok(Some(reason)) => break reason,
                    Err(e) => break e.to_string(),
                }
            }
            request = outgoing.recv() => {
                match request {
                    Some(Outgoing::Commands(batch)) => {
                        let sent = encode(&ClientMessage::Commands(batch))
                            .and_then(|payload| session.send(Channel::Unreliable, payload));
                        if let Err(e) = sent {
                            warn!("Commands not sent: {}", e);
                        }
                    }
                    Some(Outgoing::Disconnect(reason)) => {
                        say_goodbye(&socket, &mut session, &reason).await;
                        break reason;
                    }
                    None => {
                        say_goodbye(&socket, &mut session, "client dropped").await;
                        break "client dropped".to_string();
                    }
                }
            }
            _ = flush.tick() => {
                let now = Instant::now();
                if session.is_timed_out(now) {
                    break SyncError::ConnectionTimeout(session.connection()).to_string();
                }
                send_all(&socket, session.update(now)).await;
            }
        }
    };

    info!("Client session ended: {}", reason);
    let _ = events.push(ClientEvent::Disconnected { reason });
}

/// Feed one datagram to the session; `Some(reason)` ends the session
fn handle_datagram(
    session: &mut Session,
    datagram: &[u8],
    events: &EventSink,
) -> Result<Option<String>, SyncError> {
    match session.receive(datagram, Instant::now()) {
        Ok(()) => {}
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => {
            debug!("Dropping datagram: {}", e);
            return Ok(None);
        }
    }

    let received: Vec<_> = session.poll().collect();
    for message in received {
        let event = match message.channel {
            // Snapshot frames travel raw; the predictor decodes them
            Channel::Unreliable => ClientEvent::Snapshot {
                sequence: message.sequence,
                frame: message.payload,
            },
            Channel::Reliable => match decode::<ServerMessage>(&message.payload) {
                Ok(ServerMessage::Welcome {
                    entity_id,
                    tick_rate,
                    snapshot,
                }) => ClientEvent::Welcome {
                    entity_id,
                    tick_rate,
                    snapshot,
                },
                Ok(ServerMessage::Rejected { reason }) => {
                    let _ = events.push(ClientEvent::Rejected {
                        reason: reason.clone(),
                    });
                    return Ok(Some(reason));
                }
                Ok(ServerMessage::Disconnect { reason }) => return Ok(Some(reason)),
                // Too large for a datagram, so it came fragmented
                Ok(ServerMessage::Snapshot { frame }) => ClientEvent::Snapshot {
                    sequence: message.sequence,
                    frame,
                },
                Err(e) => return Err(SyncError::ReliableChannel(e.to_string())),
            },
        };
        if events.push(event).is_err() {
            return Ok(Some("link dropped".to_string()));
        }
    }
    Ok(None)
}

/// Send Disconnect and keep resending until acked or the linger passes
async fn say_goodbye(socket: &UdpSocket, session: &mut Session, reason: &str) {
    let goodbye = ClientMessage::Disconnect {
        reason: reason.to_string(),
    };
    match encode(&goodbye).and_then(|payload| session.send(Channel::Reliable, payload)) {
        Ok(()) => {}
        Err(e) => {
            warn!("Disconnect not sent: {}", e);
            return;
        }
    }

    let deadline = Instant::now() + DISCONNECT_LINGER;
    let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE + 1];
    while Instant::now() < deadline {
        send_all(socket, session.update(Instant::now())).await;
        if session.pending_reliable() == 0 {
            break;
        }
        let wait = tokio::time::timeout(Duration::from_millis(20), socket.recv(&mut buffer)).await;
        if let Ok(Ok(len)) = wait {
            // Only the acks matter now
            let _ = session.receive(&buffer[..len], Instant::now());
        }
    }
}

async fn send_all(socket: &UdpSocket, datagrams: Vec<Vec<u8>>) {
    for datagram in datagrams {
        if let Err(e) = socket.send(&datagram).await {
            debug!("UDP send error: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetConfig;
    use crate::game::command::{Command, CommandKind};
    use crate::game::store::EntityStore;
    use crate::metrics::Metrics;
    use crate::net::codec;
    use crate::net::connection::PendingHandshake;
    use crate::net::queue::{lossless, Inbound};
    use crate::net::transport::ServerTransport;
    use crate::util::vec3::Vec3;
    use smallvec::smallvec;
    use std::sync::Arc;
    use tokio::sync::watch;

    async fn wait_for<T>(mut poll: impl FnMut() -> Option<T>) -> T {
        for _ in 0..200 {
            if let Some(value) = poll() {
                return value;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting");
    }

    async fn start_server() -> (
        SocketAddr,
        crate::net::queue::QueueReceiver<PendingHandshake>,
        watch::Sender<bool>,
    ) {
        let config = NetConfig {
            bind_address: "127.0.0.1".parse().unwrap(),
            port: 0,
            ..NetConfig::default()
        };
        let (accept, accept_rx) = lossless();
        let transport = ServerTransport::bind(config, accept, Arc::new(Metrics::new()))
            .await
            .unwrap();
        let addr = transport.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(transport.run(shutdown_rx));
        (addr, accept_rx, shutdown_tx)
    }

    #[tokio::test]
    async fn test_handshake_commands_and_snapshot() {
        let (addr, accept_rx, _shutdown) = start_server().await;
        let link = ClientTransport::connect(addr, Uuid::new_v4(), SessionConfig::default())
            .await
            .unwrap();

        let handshake = wait_for(|| accept_rx.try_pop()).await;

        let mut store = EntityStore::new();
        store.create([crate::game::entity::Component::Position(Vec3::ZERO)]);
        store.advance_tick();
        let frame = codec::encode(&store.snapshot_since(0));
        handshake
            .queues
            .reliable
            .push(ServerMessage::Welcome {
                entity_id: 1,
                tick_rate: 60,
                snapshot: frame.clone(),
            })
            .unwrap();
        handshake
            .queues
            .snapshots
            .push(crate::net::queue::OutboundSnapshot {
                tick: 1,
                frame: frame.clone(),
            })
            .unwrap();

        let mut seen = Vec::new();
        while seen.len() < 2 {
            seen.push(wait_for(|| link.try_event()).await);
        }
        assert!(seen.iter().any(|e| matches!(e, ClientEvent::Welcome { entity_id: 1, .. })));
        assert!(seen
            .iter()
            .any(|e| matches!(e, ClientEvent::Snapshot { frame: f, .. } if *f == frame)));

        let command = Command {
            sequence: 1,
            tick: 1,
            kind: CommandKind::Move { delta: Vec3::X },
        };
        tokio_test::assert_ok!(link.send_commands(smallvec![command]));

        // Commands carry the ack of the snapshot packet back to the server
        let mut inbound = Vec::new();
        wait_for(|| {
            inbound.extend(handshake.queues.inbound.drain());
            let done = inbound.contains(&Inbound::Commands(smallvec![command]))
                && inbound.contains(&Inbound::Acked(1));
            done.then_some(())
        })
        .await;

        tokio_test::assert_ok!(link.disconnect("done"));
        wait_for(|| {
            inbound.extend(handshake.queues.inbound.drain());
            inbound
                .contains(&Inbound::Disconnected("done".into()))
                .then_some(())
        })
        .await;
        let last = wait_for(|| link.try_event()).await;
        assert_eq!(
            last,
            ClientEvent::Disconnected {
                reason: "done".into()
            }
        );
    }

    #[test]
    fn test_welcome_survives_snapshot_flood() {
        let now = Instant::now();
        let mut server = Session::new(1, SessionConfig::default(), now);
        let mut client = Session::new(0, SessionConfig::default(), now);
        let (sink, control, snapshots) = event_queues();

        let welcome = ServerMessage::Welcome {
            entity_id: 3,
            tick_rate: 60,
            snapshot: Vec::new(),
        };
        server
            .send(Channel::Reliable, encode(&welcome).unwrap())
            .unwrap();
        for round in 0..10u32 {
            for i in 0..50u32 {
                let tick = round * 50 + i;
                server.send_tagged(tick.to_le_bytes().to_vec(), tick).unwrap();
            }
            for datagram in server.update(now) {
                assert_eq!(handle_datagram(&mut client, &datagram, &sink).unwrap(), None);
            }
        }

        let link = ClientLink {
            outgoing: mpsc::unbounded_channel().0,
            control,
            snapshots,
            local_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        };
        assert!(matches!(
            link.try_event(),
            Some(ClientEvent::Welcome { entity_id: 3, .. })
        ));

        let rest = link.events();
        assert_eq!(rest.len(), SNAPSHOT_EVENT_CAPACITY);
        assert_eq!(
            rest.last(),
            Some(&ClientEvent::Snapshot {
                sequence: 501,
                frame: 499u32.to_le_bytes().to_vec(),
            })
        );
    }

    #[test]
    fn test_fragmented_snapshot_becomes_snapshot_event() {
        let now = Instant::now();
        let mut server = Session::new(1, SessionConfig::default(), now);
        let mut client = Session::new(0, SessionConfig::default(), now);
        let (sink, _control, snapshots) = event_queues();

        let frame = vec![9u8; 3 * MAX_DATAGRAM_SIZE];
        let message = ServerMessage::Snapshot {
            frame: frame.clone(),
        };
        server
            .send_reliable_tagged(encode(&message).unwrap(), 12)
            .unwrap();
        for datagram in server.update(now) {
            assert_eq!(handle_datagram(&mut client, &datagram, &sink).unwrap(), None);
        }

        match snapshots.try_pop() {
            Some(ClientEvent::Snapshot { frame: received, .. }) => assert_eq!(received, frame),
            other => panic!("expected Snapshot, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_server_shutdown_disconnects_client() {
        let (addr, accept_rx, shutdown) = start_server().await;
        let link = ClientTransport::connect(addr, Uuid::new_v4(), SessionConfig::default())
            .await
            .unwrap();
        let _handshake = wait_for(|| accept_rx.try_pop()).await;

        shutdown.send(true).unwrap();
        let event = wait_for(|| link.try_event()).await;
        assert_eq!(
            event,
            ClientEvent::Disconnected {
                reason: "server shutting down".into()
            }
        );
    }
}
