//! Authoritative server tick loop
//!
//! Owns the [`EntityStore`] and every admitted [`Connection`]; nothing else
//! writes the world. Each call to [`TickLoop::tick`] runs one step:
//!
//! 1. admit (or, while draining, reject) pending handshakes
//! 2. drain each connection's inbound queue in connection-id order:
//!    acks, disconnects and commands in sequence order
//! 3. apply script commands
//! 4. step the simulation
//! 5. advance the tick
//! 6. diff, encode and queue a snapshot per connection
//! 7. prune removal history no connection can still need
//! 8. publish the render view
//! 9. sweep idle connections
//!
//! No connection's failure stops the loop; it only tears that connection
//! down and reports a [`ServerEvent`].

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::NetConfig;
use crate::error::SyncError;
use crate::game::command::{apply_command, sort_by_sequence, Command};
use crate::game::constants::{kind, net, sim};
use crate::game::entity::{Component, EntityId};
use crate::game::script::{ScriptBridge, ScriptCommand};
use crate::game::simulation::{Kinematics, Simulation};
use crate::game::snapshot::Snapshot;
use crate::game::store::EntityStore;
use crate::game::view::{ViewPublisher, WorldView};
use crate::game::Tick;
use crate::metrics::Metrics;
use crate::net::codec;
use crate::net::connection::{Connection, ConnectionId, ConnectionManager, PendingHandshake};
use crate::net::protocol::ServerMessage;
use crate::net::queue::{drop_oldest, Inbound, QueueReceiver};
use crate::net::sequence::Sequence;
use crate::util::quat::Quat;
use crate::util::vec3::Vec3;

/// Lifecycle of the tick loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Created, not ticking yet
    Idle,
    Running,
    /// Refusing new connections, flushing reliable messages
    Draining,
    Stopped,
}

/// Why a connection was torn down
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The client said goodbye (or its session failed) with this reason
    Requested(String),
    /// Silence exceeded the connection timeout
    TimedOut,
    /// The transport dropped its end of the connection's queues
    TransportClosed,
}

/// Notification for the game layer
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Connected {
        connection: ConnectionId,
        entity: EntityId,
        identity: Uuid,
    },
    Disconnected {
        connection: ConnectionId,
        entity: EntityId,
        reason: DisconnectReason,
    },
    CommandRejected {
        connection: ConnectionId,
        sequence: Sequence,
        error: SyncError,
    },
    ScriptRejected {
        actor: EntityId,
        error: SyncError,
    },
}

pub struct TickLoop {
    state: LoopState,
    store: EntityStore,
    connections: ConnectionManager,
    accept: QueueReceiver<PendingHandshake>,
    scripts: Option<QueueReceiver<ScriptCommand>>,
    simulation: Box<dyn Simulation>,
    publisher: ViewPublisher,
    metrics: Arc<Metrics>,
    tick_rate: u32,
    dt: f32,
    history_ticks: u32,
    connection_timeout: Duration,
    script_capacity: usize,
}

impl TickLoop {
    pub fn new(
        config: &NetConfig,
        accept: QueueReceiver<PendingHandshake>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            state: LoopState::Idle,
            store: EntityStore::new(),
            connections: ConnectionManager::new(),
            accept,
            scripts: None,
            simulation: Box::new(Kinematics),
            publisher: ViewPublisher::new(),
            metrics,
            tick_rate: config.tick_rate,
            dt: config.tick_interval().as_secs_f32(),
            history_ticks: config.history_ticks,
            connection_timeout: config.connection_timeout(),
            script_capacity: config.command_queue_capacity,
        }
    }

    /// Replace the default kinematics step
    pub fn with_simulation(mut self, simulation: impl Simulation + 'static) -> Self {
        self.simulation = Box::new(simulation);
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    /// Direct store access for seeding the world before the loop starts
    pub fn store_mut(&mut self) -> &mut EntityStore {
        &mut self.store
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    /// Read handle for the rendering collaborator
    pub fn view(&self) -> WorldView {
        self.publisher.view()
    }

    /// Attach the scripting host; a later call replaces the previous bridge
    pub fn script_bridge(&mut self) -> ScriptBridge {
        let (sender, receiver) = drop_oldest(self.script_capacity);
        self.scripts = Some(receiver);
        ScriptBridge::new(self.publisher.view(), sender)
    }

    pub fn start(&mut self) {
        if self.state == LoopState::Idle {
            info!("Tick loop running at {} Hz", self.tick_rate);
            self.state = LoopState::Running;
            self.publish_view();
        }
    }

    /// Stop admitting connections; the loop stops once reliable queues are flushed
    pub fn drain(&mut self) {
        if self.state == LoopState::Running {
            info!(
                "Tick loop draining with {} connections",
                self.connections.count()
            );
            self.state = LoopState::Draining;
        }
    }

    pub fn stop(&mut self) {
        if self.state != LoopState::Stopped {
            info!("Tick loop stopped at tick {}", self.store.tick());
            self.state = LoopState::Stopped;
        }
    }

    /// Run one tick; does nothing unless running or draining
    pub fn tick(&mut self, now: Instant) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        if !matches!(self.state, LoopState::Running | LoopState::Draining) {
            return events;
        }
        let started = Instant::now();

        self.accept_handshakes(now, &mut events);
        self.process_inbound(now, &mut events);
        self.apply_script_commands(&mut events);

        let building = self.store.building_tick();
        self.simulation.step(&mut self.store, building, self.dt);
        let tick = self.store.advance_tick();

        self.broadcast_snapshots(tick, &mut events);
        self.prune_history(tick);
        self.publish_view();
        self.sweep_idle(now, &mut events);

        // Stopping waits until every client acknowledged its reliable traffic
        if self.state == LoopState::Draining
            && self.connections.iter().all(|c| c.reliable_pending() == 0)
        {
            self.stop();
        }

        self.metrics
            .connections_active
            .store(self.connections.count() as u64, Ordering::Relaxed);
        self.metrics
            .entity_count
            .store(self.store.len() as u64, Ordering::Relaxed);
        self.metrics.record_tick_time(started.elapsed());

        events
    }

    fn accept_handshakes(&mut self, now: Instant, events: &mut Vec<ServerEvent>) {
        while let Some(handshake) = self.accept.try_pop() {
            if self.state == LoopState::Draining {
                info!("Rejecting connection {} while draining", handshake.id);
                Metrics::incr(&self.metrics.connections_rejected);
                let rejected = ServerMessage::Rejected {
                    reason: "server is shutting down".to_string(),
                };
                if handshake.queues.reliable.push(rejected).is_err() {
                    debug!("Connection {} left before its rejection", handshake.id);
                }
                continue;
            }
            if self.connections.contains(handshake.id) {
                warn!("Duplicate handshake for connection {}", handshake.id);
                continue;
            }

            let id = handshake.id;
            let identity = handshake.identity;
            let entity = self.store.create([
                Component::Kind(kind::PLAYER),
                Component::Position(Vec3::ZERO),
                Component::Orientation(Quat::IDENTITY),
                Component::Velocity(Vec3::ZERO),
                Component::Health(sim::PLAYER_HEALTH),
                Component::Owner(id),
            ]);
            let mut connection = Connection::new(handshake, entity, now);

            let welcome = ServerMessage::Welcome {
                entity_id: entity,
                tick_rate: self.tick_rate,
                snapshot: codec::encode(&self.store.snapshot_since(0)),
            };
            if let Err(e) = connection.send_reliable(welcome) {
                warn!("Connection {} closed during handshake: {}", id, e);
                let _ = self.store.remove(entity);
                continue;
            }

            info!(
                "Connection {} ({}) from {} controls entity {}",
                id, identity, connection.remote_addr, entity
            );
            Metrics::incr(&self.metrics.connections_accepted);
            self.connections.insert(connection);
            events.push(ServerEvent::Connected {
                connection: id,
                entity,
                identity,
            });
        }
    }

    fn process_inbound(&mut self, now: Instant, events: &mut Vec<ServerEvent>) {
        let building = self.store.building_tick();
        let completed = self.store.tick();
        let mut teardown = Vec::new();

        for id in self.connections.ids() {
            let Some(conn) = self.connections.get_mut(id) else {
                continue;
            };
            let inbound = conn.drain_inbound();
            let closed = conn.transport_closed();
            if !inbound.is_empty() {
                conn.touch(now);
            }

            let mut commands: Vec<Command> = Vec::new();
            let mut leaving = None;
            for message in inbound {
                match message {
                    Inbound::Commands(batch) => commands.extend(batch),
                    Inbound::Acked(tick) if tick <= completed => conn.acknowledge(tick),
                    Inbound::Acked(tick) => {
                        debug!("Connection {} acked future tick {}", id, tick);
                    }
                    Inbound::Rtt(rtt) => conn.rtt = Some(rtt),
                    Inbound::Disconnected(reason) => {
                        leaving = Some(DisconnectReason::Requested(reason));
                        break;
                    }
                    Inbound::TimedOut => {
                        leaving = Some(DisconnectReason::TimedOut);
                        break;
                    }
                }
            }

            if let Some(reason) = leaving {
                // Stop dequeuing immediately; remaining commands are discarded
                teardown.push((id, reason));
                continue;
            }

            sort_by_sequence(&mut commands);
            for command in commands {
                if !conn.accepts_sequence(command.sequence) {
                    debug!(
                        "Connection {}: dropping command {} (last applied {:?})",
                        id, command.sequence, conn.last_applied
                    );
                    Metrics::incr(&self.metrics.commands_duplicate);
                    continue;
                }
                conn.record_applied(command.sequence);

                match apply_command(&mut self.store, conn.entity, &command.kind, building) {
                    Ok(()) => {
                        conn.commands_applied += 1;
                        Metrics::incr(&self.metrics.commands_applied);
                    }
                    Err(error) => {
                        debug!(
                            "Connection {}: command {} rejected: {}",
                            id, command.sequence, error
                        );
                        conn.commands_rejected += 1;
                        Metrics::incr(&self.metrics.commands_rejected);
                        events.push(ServerEvent::CommandRejected {
                            connection: id,
                            sequence: command.sequence,
                            error,
                        });
                    }
                }
            }

            if closed {
                teardown.push((id, DisconnectReason::TransportClosed));
            }
        }

        for (id, reason) in teardown {
            self.disconnect(id, reason, events);
        }
    }

    fn apply_script_commands(&mut self, events: &mut Vec<ServerEvent>) {
        let Some(scripts) = &self.scripts else {
            return;
        };
        let building = self.store.building_tick();
        for command in scripts.drain() {
            if let Err(error) = apply_command(&mut self.store, command.actor, &command.kind, building)
            {
                debug!("Script command for entity {} rejected: {}", command.actor, error);
                events.push(ServerEvent::ScriptRejected {
                    actor: command.actor,
                    error,
                });
            }
        }
    }

    fn broadcast_snapshots(&mut self, tick: Tick, events: &mut Vec<ServerEvent>) {
        // Connections sharing a baseline share the diff
        let mut diffs: HashMap<Tick, Snapshot> = HashMap::new();
        let mut closed = Vec::new();

        for conn in self.connections.iter_mut() {
            let snapshot = diffs
                .entry(conn.baseline)
                .or_insert_with(|| self.store.snapshot_since(conn.baseline))
                .clone()
                .with_acked_sequence(conn.acked_sequence());
            let frame = codec::encode(&snapshot);

            // Frames too large for a datagram go out fragmented on the reliable channel
            if frame.len() >= net::MAX_RELIABLE_MESSAGE_SIZE {
                warn!(
                    "Connection {}: snapshot {} of {} bytes exceeds the message limit",
                    conn.id,
                    tick,
                    frame.len()
                );
                Metrics::incr(&self.metrics.snapshots_dropped);
                continue;
            }
            if frame.len() > net::MTU_DATAGRAM_SIZE {
                debug!(
                    "Connection {}: snapshot {} is {} bytes, above the MTU target",
                    conn.id,
                    tick,
                    frame.len()
                );
            }

            let bytes = frame.len() as u64;
            match conn.send_snapshot(tick, frame) {
                Ok(evicted) => {
                    Metrics::incr(&self.metrics.snapshots_sent);
                    Metrics::add(&self.metrics.snapshot_bytes, bytes);
                    if evicted {
                        Metrics::incr(&self.metrics.snapshots_dropped);
                    }
                }
                Err(_) => closed.push(conn.id),
            }
        }

        for id in closed {
            self.disconnect(id, DisconnectReason::TransportClosed, events);
        }
    }

    fn prune_history(&mut self, tick: Tick) {
        let retained = tick.saturating_sub(self.history_ticks);
        let oldest_needed = self.connections.min_baseline().unwrap_or(tick);
        self.store.prune_history(oldest_needed.max(retained));
    }

    fn publish_view(&mut self) {
        self.publisher.publish(self.store.tick(), self.store.states());
    }

    /// Backstop for connections whose transport went quiet without telling us
    fn sweep_idle(&mut self, now: Instant, events: &mut Vec<ServerEvent>) {
        for conn in self.connections.cleanup_stale(now, self.connection_timeout) {
            self.release(conn, DisconnectReason::TimedOut, events);
        }
    }

    fn disconnect(&mut self, id: ConnectionId, reason: DisconnectReason, events: &mut Vec<ServerEvent>) {
        if let Some(conn) = self.connections.remove(id) {
            self.release(conn, reason, events);
        }
    }

    fn release(&mut self, conn: Connection, reason: DisconnectReason, events: &mut Vec<ServerEvent>) {
        match &reason {
            DisconnectReason::Requested(message) => {
                info!("Connection {} disconnected: {}", conn.id, message)
            }
            DisconnectReason::TimedOut => {
                warn!("{}", SyncError::ConnectionTimeout(conn.id));
                Metrics::incr(&self.metrics.connections_timed_out);
            }
            DisconnectReason::TransportClosed => {
                info!("Connection {} closed by transport", conn.id)
            }
        }

        if let Err(e) = self.store.remove(conn.entity) {
            debug!("Connection {} entity already gone: {}", conn.id, e);
        }
        events.push(ServerEvent::Disconnected {
            connection: conn.id,
            entity: conn.entity,
            reason,
        });
        // Dropping the connection closes its queues
    }
}
