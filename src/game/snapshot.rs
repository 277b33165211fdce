//! Tick-stamped entity deltas relative to a baseline tick

use crate::game::entity::{ComponentList, EntityId, FieldMask};
use crate::game::Tick;
use crate::net::sequence::Sequence;

/// Changed components of one entity
#[derive(Debug, Clone, PartialEq)]
pub struct EntityDelta {
    pub id: EntityId,
    /// Changed components, sorted by field index
    pub components: ComponentList,
}

impl EntityDelta {
    pub fn mask(&self) -> FieldMask {
        let mut mask = FieldMask::EMPTY;
        for component in &self.components {
            mask.insert(component.field());
        }
        mask
    }
}

/// Immutable description of world changes between `baseline` and `tick`
///
/// A snapshot is only meaningful against the baseline it was diffed from.
/// Baseline 0 marks a full snapshot: the receiver replaces its whole world.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub baseline: Tick,
    pub tick: Tick,
    /// Last client command sequence the server applied for the receiver
    pub acked_sequence: Sequence,
    /// Entity records sorted by id
    pub entities: Vec<EntityDelta>,
    /// Removed ids sorted ascending
    pub removed: Vec<EntityId>,
}

impl Snapshot {
    pub fn is_full(&self) -> bool {
        self.baseline == 0
    }

    /// True when there is nothing to apply besides the tick itself
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.removed.is_empty()
    }

    pub fn with_acked_sequence(mut self, sequence: Sequence) -> Self {
        self.acked_sequence = sequence;
        self
    }
}
