use crate::game::entity::{Component, EntityId};
use crate::game::store::EntityStore;
use crate::game::Tick;
use crate::util::vec3::Vec3;

/// Server-side world update run once per tick, after commands
pub trait Simulation: Send {
    /// Advance the world by `dt` seconds, stamping writes with `tick`
    fn step(&mut self, store: &mut EntityStore, tick: Tick, dt: f32);
}

/// Integrates velocity into position
#[derive(Debug, Clone, Copy, Default)]
pub struct Kinematics;

impl Simulation for Kinematics {
    fn step(&mut self, store: &mut EntityStore, tick: Tick, dt: f32) {
        let moving: Vec<(EntityId, Vec3)> = store
            .velocities()
            .filter(|(_, velocity)| !velocity.is_zero(f32::EPSILON))
            .collect();

        for (id, velocity) in moving {
            let position = store.position(id).unwrap_or(Vec3::ZERO);
            let next = position + velocity * dt;
            if !next.is_finite() {
                tracing::warn!("Entity {} left the finite range, keeping position", id);
                continue;
            }
            // Ids come from the live velocity column
            let _ = store.mutate(id, Component::Position(next), tick);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::constants::kind;
    use crate::game::entity::Field;

    #[test]
    fn test_integrates_velocity() {
        let mut store = EntityStore::new();
        let cart = store.create([
            Component::Kind(kind::CART),
            Component::Position(Vec3::new(1.0, 0.0, 0.0)),
            Component::Velocity(Vec3::new(2.0, 0.0, -4.0)),
        ]);
        store.advance_tick();

        let tick = store.building_tick();
        Kinematics.step(&mut store, tick, 0.5);

        assert_eq!(store.position(cart), Some(Vec3::new(2.0, 0.0, -2.0)));
        assert_eq!(store.changed_tick(cart, Field::Position), Some(tick));
    }

    #[test]
    fn test_resting_entities_stay_unchanged() {
        let mut store = EntityStore::new();
        let still = store.create([
            Component::Position(Vec3::ZERO),
            Component::Velocity(Vec3::ZERO),
        ]);
        let created = store.building_tick();
        store.advance_tick();

        let tick = store.building_tick();
        Kinematics.step(&mut store, tick, 1.0);

        assert_eq!(store.changed_tick(still, Field::Position), Some(created));
    }

    #[test]
    fn test_velocity_without_position_starts_at_origin() {
        let mut store = EntityStore::new();
        let id = store.create([Component::Velocity(Vec3::X)]);
        store.advance_tick();

        Kinematics.step(&mut store, 2, 1.0);
        assert_eq!(store.position(id), Some(Vec3::X));
    }
}
