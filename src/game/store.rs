//! Authoritative entity store
//!
//! Entities are ids plus components; each component type lives in its own
//! dense column (arena + index map, swap-remove on delete) and every slot
//! carries the tick it last changed. Deltas for a connection are computed
//! by comparing those ticks against the connection's acknowledged baseline.
//!
//! Writes made between two [`EntityStore::advance_tick`] calls belong to the
//! tick being built (`tick() + 1`). The tick loop only diffs after advancing,
//! so a snapshot never observes a half-applied tick.

use std::collections::BTreeMap;

use hashbrown::HashMap;
use tracing::debug;

use crate::error::SyncError;
use crate::game::entity::{
    normalize_components, Component, ComponentList, EntityId, EntityState, Field, NO_ENTITY,
};
use crate::game::snapshot::{EntityDelta, Snapshot};
use crate::game::Tick;
use crate::util::quat::Quat;
use crate::util::vec3::Vec3;

#[derive(Debug, Clone)]
struct Slot<T> {
    entity: EntityId,
    value: T,
    changed: Tick,
}

/// Dense storage for one component type
#[derive(Debug, Clone)]
struct Column<T> {
    slots: Vec<Slot<T>>,
    index: HashMap<EntityId, usize>,
}

impl<T: Copy + PartialEq> Column<T> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            index: HashMap::new(),
        }
    }

    fn get(&self, entity: EntityId) -> Option<(T, Tick)> {
        self.index
            .get(&entity)
            .map(|&i| (self.slots[i].value, self.slots[i].changed))
    }

    /// Store a value; an identical value keeps its old change tick
    fn set(&mut self, entity: EntityId, value: T, tick: Tick) {
        if let Some(&i) = self.index.get(&entity) {
            let slot = &mut self.slots[i];
            if slot.value != value {
                slot.value = value;
                slot.changed = tick;
            }
        } else {
            self.index.insert(entity, self.slots.len());
            self.slots.push(Slot {
                entity,
                value,
                changed: tick,
            });
        }
    }

    fn remove(&mut self, entity: EntityId) {
        if let Some(i) = self.index.remove(&entity) {
            self.slots.swap_remove(i);
            if let Some(moved) = self.slots.get(i) {
                self.index.insert(moved.entity, i);
            }
        }
    }

    fn clear(&mut self) {
        self.slots.clear();
        self.index.clear();
    }

    fn len(&self) -> usize {
        self.slots.len()
    }
}

/// In-memory table of simulated entities, versioned per tick
#[derive(Debug, Clone)]
pub struct EntityStore {
    tick: Tick,
    next_id: EntityId,
    /// Live entity -> tick it was created
    live: BTreeMap<EntityId, Tick>,
    /// Removed entity -> tick it was removed
    tombstones: BTreeMap<EntityId, Tick>,
    /// Baselines below this tick can no longer be diffed against
    history_floor: Tick,
    kinds: Column<u16>,
    positions: Column<Vec3>,
    orientations: Column<Quat>,
    velocities: Column<Vec3>,
    health: Column<i32>,
    owners: Column<u64>,
}

impl EntityStore {
    pub fn new() -> Self {
        Self {
            tick: 0,
            next_id: NO_ENTITY + 1,
            live: BTreeMap::new(),
            tombstones: BTreeMap::new(),
            history_floor: 0,
            kinds: Column::new(),
            positions: Column::new(),
            orientations: Column::new(),
            velocities: Column::new(),
            health: Column::new(),
            owners: Column::new(),
        }
    }

    /// Last completed tick
    #[inline]
    pub fn tick(&self) -> Tick {
        self.tick
    }

    /// Tick that writes made right now are stamped with
    #[inline]
    pub fn building_tick(&self) -> Tick {
        self.tick + 1
    }

    /// Complete the tick being built and return it
    pub fn advance_tick(&mut self) -> Tick {
        self.tick += 1;
        self.tick
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.live.contains_key(&id)
    }

    /// Live ids in ascending order
    pub fn ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.live.keys().copied()
    }

    pub fn history_floor(&self) -> Tick {
        self.history_floor
    }

    /// Create an entity with the given components; ids are never reused
    pub fn create(&mut self, components: impl IntoIterator<Item = Component>) -> EntityId {
        let id = self.next_id;
        self.next_id = self.next_id.saturating_add(1);

        let tick = self.building_tick();
        self.live.insert(id, tick);
        for component in normalize_components(components) {
            self.set_component(id, component, tick);
        }
        id
    }

    /// Set one component of a live entity
    pub fn mutate(&mut self, id: EntityId, value: Component, tick: Tick) -> Result<(), SyncError> {
        if !self.live.contains_key(&id) {
            return Err(SyncError::UnknownEntity(id));
        }
        self.set_component(id, value, tick);
        Ok(())
    }

    pub fn remove(&mut self, id: EntityId) -> Result<(), SyncError> {
        if self.live.remove(&id).is_none() {
            return Err(SyncError::UnknownEntity(id));
        }
        self.remove_components(id);
        self.tombstones.insert(id, self.building_tick());
        Ok(())
    }

    pub fn get(&self, id: EntityId, field: Field) -> Option<Component> {
        self.component_with_tick(id, field).map(|(value, _)| value)
    }

    /// Tick the given component last changed
    pub fn changed_tick(&self, id: EntityId, field: Field) -> Option<Tick> {
        self.component_with_tick(id, field).map(|(_, tick)| tick)
    }

    pub fn position(&self, id: EntityId) -> Option<Vec3> {
        self.positions.get(id).map(|(v, _)| v)
    }

    pub fn health(&self, id: EntityId) -> Option<i32> {
        self.health.get(id).map(|(v, _)| v)
    }

    pub fn state(&self, id: EntityId) -> Option<EntityState> {
        if !self.live.contains_key(&id) {
            return None;
        }
        let mut state = EntityState::new(id);
        for field in Field::ALL {
            if let Some(component) = self.get(id, field) {
                state.set(component);
            }
        }
        Some(state)
    }

    /// Current values of every live entity, ordered by id
    pub fn states(&self) -> Vec<EntityState> {
        self.live.keys().filter_map(|&id| self.state(id)).collect()
    }

    /// Entities that carry a velocity, in storage order
    pub fn velocities(&self) -> impl Iterator<Item = (EntityId, Vec3)> + '_ {
        self.velocities.slots.iter().map(|slot| (slot.entity, slot.value))
    }

    /// Diff the store against a baseline tick
    ///
    /// Returns changed fields of entities that existed at the baseline, every
    /// field of entities created after it, and removal markers for entities
    /// removed after it. A baseline of 0, or one older than the retained
    /// history, produces a full snapshot (baseline 0).
    pub fn snapshot_since(&self, baseline: Tick) -> Snapshot {
        let full = baseline == 0 || baseline < self.history_floor || baseline > self.tick;
        let baseline = if full { 0 } else { baseline };

        let mut entities = Vec::new();
        for (&id, &created) in &self.live {
            let is_new = full || created > baseline;
            let mut components = ComponentList::new();
            for field in Field::ALL {
                if let Some((value, changed)) = self.component_with_tick(id, field) {
                    if is_new || changed > baseline {
                        components.push(value);
                    }
                }
            }
            if is_new || !components.is_empty() {
                entities.push(EntityDelta { id, components });
            }
        }

        let removed = if full {
            Vec::new()
        } else {
            self.tombstones
                .iter()
                .filter(|(_, &removed_at)| removed_at > baseline)
                .map(|(&id, _)| id)
                .collect()
        };

        Snapshot {
            baseline,
            tick: self.tick,
            acked_sequence: 0,
            entities,
            removed,
        }
    }

    /// Install an authoritative snapshot (receiving side)
    ///
    /// Callers are responsible for rejecting stale snapshots first. A full
    /// snapshot replaces the whole world.
    pub fn apply_snapshot(&mut self, snapshot: &Snapshot) {
        if snapshot.is_full() {
            self.clear();
        }

        for delta in &snapshot.entities {
            if !self.live.contains_key(&delta.id) {
                self.live.insert(delta.id, snapshot.tick);
                self.tombstones.remove(&delta.id);
            }
            if delta.id >= self.next_id {
                self.next_id = delta.id.saturating_add(1);
            }
            for &component in &delta.components {
                self.set_component(delta.id, component, snapshot.tick);
            }
        }

        for &id in &snapshot.removed {
            if self.live.remove(&id).is_some() {
                self.remove_components(id);
                self.tombstones.insert(id, snapshot.tick);
            } else {
                debug!("Snapshot {} removes unknown entity {}", snapshot.tick, id);
            }
        }

        self.tick = snapshot.tick;
    }

    /// Forget removal history at or below `floor`
    pub fn prune_history(&mut self, floor: Tick) {
        let floor = floor.min(self.tick);
        if floor <= self.history_floor {
            return;
        }
        self.tombstones.retain(|_, removed_at| *removed_at > floor);
        self.history_floor = floor;
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    /// Total component slots across all columns
    pub fn component_count(&self) -> usize {
        self.kinds.len()
            + self.positions.len()
            + self.orientations.len()
            + self.velocities.len()
            + self.health.len()
            + self.owners.len()
    }

    fn clear(&mut self) {
        self.live.clear();
        self.tombstones.clear();
        self.history_floor = 0;
        self.kinds.clear();
        self.positions.clear();
        self.orientations.clear();
        self.velocities.clear();
        self.health.clear();
        self.owners.clear();
    }

    fn set_component(&mut self, id: EntityId, component: Component, tick: Tick) {
        match component {
            Component::Kind(v) => self.kinds.set(id, v, tick),
            Component::Position(v) => self.positions.set(id, v, tick),
            Component::Orientation(v) => self.orientations.set(id, v, tick),
            Component::Velocity(v) => self.velocities.set(id, v, tick),
            Component::Health(v) => self.health.set(id, v, tick),
            Component::Owner(v) => self.owners.set(id, v, tick),
        }
    }

    fn component_with_tick(&self, id: EntityId, field: Field) -> Option<(Component, Tick)> {
        match field {
            Field::Kind => self.kinds.get(id).map(|(v, t)| (Component::Kind(v), t)),
            Field::Position => self.positions.get(id).map(|(v, t)| (Component::Position(v), t)),
            Field::Orientation => self
                .orientations
                .get(id)
                .map(|(v, t)| (Component::Orientation(v), t)),
            Field::Velocity => self.velocities.get(id).map(|(v, t)| (Component::Velocity(v), t)),
            Field::Health => self.health.get(id).map(|(v, t)| (Component::Health(v), t)),
            Field::Owner => self.owners.get(id).map(|(v, t)| (Component::Owner(v), t)),
        }
    }

    fn remove_components(&mut self, id: EntityId) {
        self.kinds.remove(id);
        self.positions.remove(id);
        self.orientations.remove(id);
        self.velocities.remove(id);
        self.health.remove(id);
        self.owners.remove(id);
    }
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}
