//! Entity identifiers and the component tagged union
//!
//! Components are keyed by a stable field tag whose numeric value doubles as
//! the bit index in a snapshot's changed-field mask and as the encoding
//! order on the wire. New component types must append, never reorder.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::util::quat::Quat;
use crate::util::vec3::Vec3;

/// Unique entity identifier, stable for the entity's lifetime and never reused
pub type EntityId = u32;

/// Reserved "no entity" id
pub const NO_ENTITY: EntityId = 0;

/// Owner tag of server-owned entities
pub const NO_OWNER: u64 = 0;

/// Stable component type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Field {
    Kind = 0,
    Position = 1,
    Orientation = 2,
    Velocity = 3,
    Health = 4,
    Owner = 5,
}

impl Field {
    pub const COUNT: usize = 6;

    /// All fields in wire (index) order
    pub const ALL: [Field; Field::COUNT] = [
        Field::Kind,
        Field::Position,
        Field::Orientation,
        Field::Velocity,
        Field::Health,
        Field::Owner,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    #[inline]
    pub fn bit(self) -> u8 {
        1 << (self as u8)
    }

    pub fn from_index(index: usize) -> Option<Field> {
        Field::ALL.get(index).copied()
    }
}

/// One component value, tagged by its field
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Component {
    /// Entity type tag (see `constants::kind`)
    Kind(u16),
    Position(Vec3),
    Orientation(Quat),
    Velocity(Vec3),
    Health(i32),
    /// Owning connection id, `NO_OWNER` for server-owned
    Owner(u64),
}

impl Component {
    pub fn field(&self) -> Field {
        match self {
            Component::Kind(_) => Field::Kind,
            Component::Position(_) => Field::Position,
            Component::Orientation(_) => Field::Orientation,
            Component::Velocity(_) => Field::Velocity,
            Component::Health(_) => Field::Health,
            Component::Owner(_) => Field::Owner,
        }
    }
}

/// Set of changed fields, one bit per [`Field`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FieldMask(u8);

impl FieldMask {
    pub const EMPTY: FieldMask = FieldMask(0);
    /// Every defined field bit
    pub const ALL: FieldMask = FieldMask((1 << Field::COUNT) - 1);

    pub fn from_bits(bits: u8) -> Option<FieldMask> {
        if bits & !Self::ALL.0 != 0 {
            None
        } else {
            Some(FieldMask(bits))
        }
    }

    #[inline]
    pub fn bits(self) -> u8 {
        self.0
    }

    #[inline]
    pub fn insert(&mut self, field: Field) {
        self.0 |= field.bit();
    }

    #[inline]
    pub fn contains(self, field: Field) -> bool {
        self.0 & field.bit() != 0
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Set fields in index order
    pub fn iter(self) -> impl Iterator<Item = Field> {
        Field::ALL.into_iter().filter(move |f| self.contains(*f))
    }
}

/// Component list of one entity, kept sorted by field index
pub type ComponentList = SmallVec<[Component; Field::COUNT]>;

/// Sort and deduplicate components by field (last write wins)
pub fn normalize_components(components: impl IntoIterator<Item = Component>) -> ComponentList {
    let mut slots: [Option<Component>; Field::COUNT] = [None; Field::COUNT];
    for component in components {
        slots[component.field().index()] = Some(component);
    }
    slots.into_iter().flatten().collect()
}

/// Plain read-only copy of one entity's current component values
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub id: EntityId,
    pub kind: Option<u16>,
    pub position: Option<Vec3>,
    pub orientation: Option<Quat>,
    pub velocity: Option<Vec3>,
    pub health: Option<i32>,
    pub owner: Option<u64>,
}

impl EntityState {
    pub fn new(id: EntityId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn set(&mut self, component: Component) {
        match component {
            Component::Kind(v) => self.kind = Some(v),
            Component::Position(v) => self.position = Some(v),
            Component::Orientation(v) => self.orientation = Some(v),
            Component::Velocity(v) => self.velocity = Some(v),
            Component::Health(v) => self.health = Some(v),
            Component::Owner(v) => self.owner = Some(v),
        }
    }

    pub fn get(&self, field: Field) -> Option<Component> {
        match field {
            Field::Kind => self.kind.map(Component::Kind),
            Field::Position => self.position.map(Component::Position),
            Field::Orientation => self.orientation.map(Component::Orientation),
            Field::Velocity => self.velocity.map(Component::Velocity),
            Field::Health => self.health.map(Component::Health),
            Field::Owner => self.owner.map(Component::Owner),
        }
    }

    /// Present components in field order
    pub fn components(&self) -> ComponentList {
        Field::ALL.into_iter().filter_map(|f| self.get(f)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_bits_follow_index() {
        for (i, field) in Field::ALL.into_iter().enumerate() {
            assert_eq!(field.index(), i);
            assert_eq!(field.bit(), 1 << i);
            assert_eq!(Field::from_index(i), Some(field));
        }
        assert_eq!(Field::from_index(Field::COUNT), None);
    }

    #[test]
    fn test_mask_rejects_unknown_bits() {
        assert_eq!(FieldMask::from_bits(0b0011_1111), Some(FieldMask::ALL));
        assert!(FieldMask::from_bits(0b0100_0000).is_none());
        assert!(FieldMask::from_bits(0b1000_0000).is_none());
    }

    #[test]
    fn test_mask_iterates_in_index_order() {
        let mut mask = FieldMask::EMPTY;
        mask.insert(Field::Health);
        mask.insert(Field::Kind);
        mask.insert(Field::Velocity);

        let fields: Vec<Field> = mask.iter().collect();
        assert_eq!(fields, vec![Field::Kind, Field::Velocity, Field::Health]);
        assert_eq!(mask.len(), 3);
    }

    #[test]
    fn test_normalize_components_sorts_and_dedups() {
        let list = normalize_components([
            Component::Health(10),
            Component::Position(Vec3::ONE),
            Component::Health(20),
        ]);
        assert_eq!(
            list.as_slice(),
            &[Component::Position(Vec3::ONE), Component::Health(20)]
        );
    }

    #[test]
    fn test_entity_state_set_get() {
        let mut state = EntityState::new(3);
        state.set(Component::Owner(42));
        state.set(Component::Kind(2));

        assert_eq!(state.get(Field::Owner), Some(Component::Owner(42)));
        assert_eq!(state.get(Field::Health), None);
        assert_eq!(
            state.components().as_slice(),
            &[Component::Kind(2), Component::Owner(42)]
        );
    }
}
