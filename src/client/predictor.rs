//! Client-side prediction and reconciliation
//!
//! Local input is applied to a speculative copy of the world right away.
//! When an authoritative snapshot arrives the copy is thrown away, the
//! snapshot is applied to the authoritative store, and every command the
//! server has not applied yet is replayed on a fresh copy.

use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::error::SyncError;
use crate::game::command::{apply_command, next_sequence, Command, CommandBatch, CommandKind};
use crate::game::constants::net::MAX_UNACKED_COMMANDS;
use crate::game::entity::EntityId;
use crate::game::snapshot::Snapshot;
use crate::game::store::EntityStore;
use crate::game::view::{ViewPublisher, WorldView};
use crate::game::Tick;
use crate::net::codec;
use crate::net::sequence::{sequence_greater_than, Sequence};

pub struct ClientPredictor {
    authoritative: EntityStore,
    predicted: EntityStore,
    local_entity: EntityId,
    next_sequence: Sequence,
    /// Issued commands the server has not reported as applied, oldest first
    unacked: VecDeque<Command>,
    last_applied_tick: Option<Tick>,
    publisher: ViewPublisher,
}

impl ClientPredictor {
    /// Predictor for `local_entity` with an empty world
    pub fn new(local_entity: EntityId) -> Self {
        Self {
            authoritative: EntityStore::new(),
            predicted: EntityStore::new(),
            local_entity,
            next_sequence: 1,
            unacked: VecDeque::new(),
            last_applied_tick: None,
            publisher: ViewPublisher::new(),
        }
    }

    /// Predictor seeded with the full snapshot carried by the handshake reply
    pub fn from_welcome(entity_id: EntityId, snapshot: &[u8]) -> Result<Self, SyncError> {
        let mut predictor = Self::new(entity_id);
        predictor.apply_frame(snapshot)?;
        Ok(predictor)
    }

    pub fn local_entity(&self) -> EntityId {
        self.local_entity
    }

    /// Tick of the last authoritative snapshot applied
    pub fn last_applied_tick(&self) -> Option<Tick> {
        self.last_applied_tick
    }

    pub fn authoritative(&self) -> &EntityStore {
        &self.authoritative
    }

    pub fn predicted(&self) -> &EntityStore {
        &self.predicted
    }

    /// Render handle onto the predicted world
    pub fn view(&self) -> WorldView {
        self.publisher.view()
    }

    pub fn unacked_len(&self) -> usize {
        self.unacked.len()
    }

    /// Record local input and apply it to the predicted world at once
    ///
    /// The returned command is also kept in the unacknowledged log, so
    /// [`pending_commands`](Self::pending_commands) resends it until a
    /// snapshot reports it applied.
    pub fn issue(&mut self, kind: CommandKind) -> Command {
        let command = Command {
            sequence: self.next_sequence,
            tick: self.predicted.building_tick(),
            kind,
        };
        self.next_sequence = next_sequence(self.next_sequence);

        if self.unacked.len() >= MAX_UNACKED_COMMANDS {
            if let Some(dropped) = self.unacked.pop_front() {
                warn!(
                    "Unacknowledged command log full, forgetting command {}",
                    dropped.sequence
                );
            }
        }
        self.unacked.push_back(command);

        // The server runs the same rules and will reject it the same way
        if let Err(e) = self.predict(&command) {
            debug!("Predicted command {} rejected: {}", command.sequence, e);
        }
        self.publish();
        command
    }

    /// Every command still waiting for the server, oldest first
    pub fn pending_commands(&self) -> CommandBatch {
        self.unacked.iter().copied().collect()
    }

    /// Decode a snapshot frame and reconcile against it
    pub fn apply_frame(&mut self, frame: &[u8]) -> Result<(), SyncError> {
        let snapshot = codec::decode(frame)?;
        self.apply_snapshot(&snapshot)
    }

    /// Reconcile against an authoritative snapshot
    ///
    /// Snapshots at or before the last applied tick are rejected with
    /// `StaleSnapshot` and leave every store untouched. A delta whose
    /// baseline was never applied here is rejected with `MissingBaseline`.
    pub fn apply_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), SyncError> {
        if let Some(last_applied) = self.last_applied_tick {
            if snapshot.tick <= last_applied {
                debug!(
                    "Discarding stale snapshot {} (applied {})",
                    snapshot.tick, last_applied
                );
                return Err(SyncError::StaleSnapshot {
                    tick: snapshot.tick,
                    last_applied,
                });
            }
        }

        if !snapshot.is_full() {
            // A delta diffed from an older baseline still covers every change
            // after our last tick, a newer one does not
            match self.last_applied_tick {
                Some(last_applied) if snapshot.baseline <= last_applied => {}
                last_applied => {
                    let last_applied = last_applied.unwrap_or(0);
                    debug!(
                        "Snapshot {} needs baseline {}, have {}",
                        snapshot.tick, snapshot.baseline, last_applied
                    );
                    return Err(SyncError::MissingBaseline {
                        baseline: snapshot.baseline,
                        last_applied,
                    });
                }
            }
        }

        self.authoritative.apply_snapshot(snapshot);
        self.last_applied_tick = Some(snapshot.tick);

        if snapshot.acked_sequence != 0 {
            let acked = snapshot.acked_sequence;
            self.unacked
                .retain(|command| sequence_greater_than(command.sequence, acked));
        }

        self.rebuild_prediction();
        Ok(())
    }

    fn rebuild_prediction(&mut self) {
        self.predicted = self.authoritative.clone();
        let replay: Vec<Command> = self.unacked.iter().copied().collect();
        for command in &replay {
            if let Err(e) = self.predict(command) {
                debug!("Replayed command {} rejected: {}", command.sequence, e);
            }
        }
        self.publish();
    }

    fn predict(&mut self, command: &Command) -> Result<(), SyncError> {
        let tick = self.predicted.building_tick();
        apply_command(&mut self.predicted, self.local_entity, &command.kind, tick)
    }

    fn publish(&mut self) {
        self.publisher
            .publish(self.authoritative.tick(), self.predicted.states());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetConfig;
    use crate::game::entity::Component;
    use crate::game::tick_loop::TickLoop;
    use crate::metrics::Metrics;
    use crate::net::connection::PendingHandshake;
    use crate::net::protocol::ServerMessage;
    use crate::net::queue::{connection_queues, lossless, Inbound};
    use crate::util::vec3::Vec3;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use uuid::Uuid;

    fn world_with_player() -> (EntityStore, EntityId) {
        let mut store = EntityStore::new();
        let player = store.create([Component::Position(Vec3::ZERO)]);
        store.advance_tick();
        (store, player)
    }

    #[test]
    fn test_end_to_end_move_reconciles() {
        let (accept, accept_rx) = lossless();
        let mut tick_loop =
            TickLoop::new(&NetConfig::default(), accept_rx, Arc::new(Metrics::new()));
        tick_loop.start();
        let mut now = Instant::now();
        let mut step = |tick_loop: &mut TickLoop| {
            now += Duration::from_millis(16);
            tick_loop.tick(now)
        };

        let (loop_end, transport) = connection_queues(64, 4);
        accept
            .push(PendingHandshake {
                id: 1,
                identity: Uuid::new_v4(),
                remote_addr: "127.0.0.1:9000".parse().unwrap(),
                queues: loop_end,
            })
            .unwrap();
        step(&mut tick_loop);
        let (entity, welcome) = match transport.reliable.try_pop() {
            Some(ServerMessage::Welcome {
                entity_id, snapshot, ..
            }) => (entity_id, snapshot),
            other => panic!("expected Welcome, got {:?}", other),
        };
        let mut client = ClientPredictor::from_welcome(entity, &welcome).unwrap();

        while tick_loop.store().tick() < 10 {
            step(&mut tick_loop);
        }
        let frames = transport.snapshots.drain();
        client.apply_frame(&frames.last().unwrap().frame).unwrap();
        assert_eq!(client.last_applied_tick(), Some(10));

        let command = client.issue(CommandKind::Move { delta: Vec3::X });
        assert_eq!(command.sequence, 1);
        assert_eq!(client.predicted().position(entity), Some(Vec3::X));
        assert_eq!(client.authoritative().position(entity), Some(Vec3::ZERO));

        transport.inbound.push(Inbound::Acked(10)).unwrap();
        transport
            .inbound
            .push(Inbound::Commands(client.pending_commands()))
            .unwrap();
        step(&mut tick_loop);

        let frames = transport.snapshots.drain();
        let snapshot = codec::decode(&frames.last().unwrap().frame).unwrap();
        assert_eq!((snapshot.baseline, snapshot.tick, snapshot.acked_sequence), (10, 11, 1));
        client.apply_snapshot(&snapshot).unwrap();

        assert_eq!(client.unacked_len(), 0);
        assert_eq!(client.authoritative().position(entity), Some(Vec3::X));
        assert_eq!(client.predicted().position(entity), Some(Vec3::X));
        assert_eq!(tick_loop.store().position(entity), Some(Vec3::X));
        assert_eq!(client.view().latest().tick, 11);
    }

    #[test]
    fn test_stale_snapshot_does_not_regress() {
        let (mut server, player) = world_with_player();
        let mut client = ClientPredictor::new(player);
        let old = server.snapshot_since(0);

        server.mutate(player, Component::Position(Vec3::X), 2).unwrap();
        server.advance_tick();
        let newer = server.snapshot_since(0);

        client.apply_snapshot(&newer).unwrap();
        let before = client.authoritative().states();
        let version = client.view().version();

        let result = client.apply_snapshot(&old);
        assert_eq!(
            result,
            Err(SyncError::StaleSnapshot {
                tick: 1,
                last_applied: 2
            })
        );
        assert_eq!(client.authoritative().states(), before);
        assert_eq!(client.view().version(), version);

        // Same tick again is stale too
        assert!(client.apply_snapshot(&newer).is_err());
    }

    #[test]
    fn test_delta_without_baseline_rejected() {
        let (mut server, player) = world_with_player();
        let mut client = ClientPredictor::new(player);

        server.mutate(player, Component::Position(Vec3::X), 2).unwrap();
        server.advance_tick();
        let delta = server.snapshot_since(1);
        assert!(!delta.is_full());

        assert_eq!(
            client.apply_snapshot(&delta),
            Err(SyncError::MissingBaseline {
                baseline: 1,
                last_applied: 0
            })
        );
        assert_eq!(client.last_applied_tick(), None);
    }

    #[test]
    fn test_delta_from_older_baseline_applies() {
        let (mut server, player) = world_with_player();
        let mut client = ClientPredictor::new(player);
        client.apply_snapshot(&server.snapshot_since(0)).unwrap();

        server.mutate(player, Component::Health(40), 2).unwrap();
        server.advance_tick();
        client.apply_snapshot(&server.snapshot_since(1)).unwrap();

        let cart = server.create([Component::Position(Vec3::Y)]);
        server.advance_tick();
        // Diffed from tick 1 although the client already holds tick 2
        client.apply_snapshot(&server.snapshot_since(1)).unwrap();

        assert_eq!(client.authoritative().states(), server.states());
        assert_eq!(client.predicted().position(cart), Some(Vec3::Y));
    }

    #[test]
    fn test_replay_matches_direct_application() {
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..20 {
            let (mut server, player) = world_with_player();
            let target = server.create([Component::Health(100)]);
            server.advance_tick();

            let mut client = ClientPredictor::new(player);
            client.apply_snapshot(&server.snapshot_since(0)).unwrap();

            let issued: Vec<Command> = (0..rng.gen_range(1..12))
                .map(|_| {
                    let kind = match rng.gen_range(0..3) {
                        0 => CommandKind::Move {
                            delta: Vec3::new(rng.gen_range(-2.0..2.0), 0.0, rng.gen_range(-2.0..2.0)),
                        },
                        1 => CommandKind::SetVelocity {
                            velocity: Vec3::new(0.0, rng.gen_range(-5.0..5.0), 0.0),
                        },
                        _ => CommandKind::Attack {
                            target,
                            damage: rng.gen_range(0..30),
                        },
                    };
                    client.issue(kind)
                })
                .collect();

            // The server has applied a prefix of the commands
            let applied = rng.gen_range(0..=issued.len());
            let baseline = server.tick();
            for command in &issued[..applied] {
                let tick = server.building_tick();
                let _ = apply_command(&mut server, player, &command.kind, tick);
            }
            server.advance_tick();
            let acked = if applied == 0 { 0 } else { issued[applied - 1].sequence };
            let snapshot = server.snapshot_since(baseline).with_acked_sequence(acked);
            client.apply_snapshot(&snapshot).unwrap();

            let mut expected = server.clone();
            for command in &issued[applied..] {
                let tick = expected.building_tick();
                let _ = apply_command(&mut expected, player, &command.kind, tick);
            }

            assert_eq!(client.unacked_len(), issued.len() - applied);
            assert_eq!(client.predicted().states(), expected.states());
            assert_eq!(client.authoritative().states(), server.states());
        }
    }

    #[test]
    fn test_unacked_log_is_bounded() {
        let (server, player) = world_with_player();
        let mut client = ClientPredictor::new(player);
        client.apply_snapshot(&server.snapshot_since(0)).unwrap();

        for _ in 0..MAX_UNACKED_COMMANDS + 5 {
            client.issue(CommandKind::Move { delta: Vec3::X });
        }

        let pending = client.pending_commands();
        assert_eq!(pending.len(), MAX_UNACKED_COMMANDS);
        assert_eq!(pending[0].sequence, 6);
    }

    #[test]
    fn test_view_tracks_prediction() {
        let (server, player) = world_with_player();
        let mut client = ClientPredictor::new(player);
        client.apply_snapshot(&server.snapshot_since(0)).unwrap();
        let view = client.view();

        client.issue(CommandKind::Move { delta: Vec3::X });
        let frame = view.latest();
        assert_eq!(frame.tick, 1);
        assert_eq!(frame.get(player).and_then(|e| e.position), Some(Vec3::X));
    }
}
