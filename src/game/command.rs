//! Client commands and the deterministic rules that apply them
//!
//! The server tick loop and the client predictor run the exact same
//! [`apply_command`], so replaying a command locally lands on the value the
//! server will later report.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::SyncError;
use crate::game::constants::sim::{MAX_ATTACK_DAMAGE, MAX_MOVE_PER_COMMAND, MAX_SPEED};
use crate::game::entity::{Component, EntityId};
use crate::game::store::EntityStore;
use crate::game::Tick;
use crate::net::sequence::{sequence_greater_than, Sequence};
use crate::util::quat::Quat;
use crate::util::vec3::Vec3;

/// Input event issued by a client
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Per-connection sequence, starts at 1 and skips 0 on wrap
    pub sequence: Sequence,
    /// Client tick the command was predicted on
    pub tick: Tick,
    pub kind: CommandKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum CommandKind {
    /// Displace the actor by `delta`
    Move { delta: Vec3 },
    SetVelocity { velocity: Vec3 },
    Look { orientation: Quat },
    /// Deal damage to another entity's health
    Attack { target: EntityId, damage: i32 },
}

/// Commands sent together in one datagram
pub type CommandBatch = SmallVec<[Command; 8]>;

/// Next client command sequence after `sequence`; 0 is reserved for "none"
pub fn next_sequence(sequence: Sequence) -> Sequence {
    match sequence.wrapping_add(1) {
        0 => 1,
        next => next,
    }
}

/// Sort a batch by wrapping sequence order
pub fn sort_by_sequence(commands: &mut [Command]) {
    commands.sort_by(|a, b| {
        if a.sequence == b.sequence {
            std::cmp::Ordering::Equal
        } else if sequence_greater_than(a.sequence, b.sequence) {
            std::cmp::Ordering::Greater
        } else {
            std::cmp::Ordering::Less
        }
    });
}

/// Apply one command on behalf of `actor`, stamping writes with `tick`
pub fn apply_command(
    store: &mut EntityStore,
    actor: EntityId,
    kind: &CommandKind,
    tick: Tick,
) -> Result<(), SyncError> {
    if !store.contains(actor) {
        return Err(SyncError::UnknownEntity(actor));
    }

    match *kind {
        CommandKind::Move { delta } => {
            let delta = finite(delta)?.clamp_length(MAX_MOVE_PER_COMMAND);
            let position = store.position(actor).unwrap_or(Vec3::ZERO);
            store.mutate(actor, Component::Position(position + delta), tick)
        }
        CommandKind::SetVelocity { velocity } => {
            let velocity = finite(velocity)?.clamp_length(MAX_SPEED);
            store.mutate(actor, Component::Velocity(velocity), tick)
        }
        CommandKind::Look { orientation } => {
            store.mutate(actor, Component::Orientation(orientation.normalize()), tick)
        }
        CommandKind::Attack { target, damage } => {
            if !store.contains(target) {
                return Err(SyncError::UnknownEntity(target));
            }
            let Some(health) = store.health(target) else {
                // Nothing to damage
                return Ok(());
            };
            let damage = damage.clamp(0, MAX_ATTACK_DAMAGE);
            store.mutate(target, Component::Health((health - damage).max(0)), tick)
        }
    }
}

fn finite(v: Vec3) -> Result<Vec3, SyncError> {
    if v.is_finite() {
        Ok(v)
    } else {
        Err(SyncError::malformed("non-finite vector in command"))
    }
}
