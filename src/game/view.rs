//! Read-only world view for renderers and scripts
//!
//! The single writer (tick loop or client predictor) builds a complete
//! [`WorldFrame`] and swaps it in behind a pointer. Readers clone the `Arc`
//! and keep a consistent frame for as long as they like; the lock is only
//! held for the pointer copy, never while a frame is being built or read.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::game::entity::{EntityId, EntityState};
use crate::game::Tick;

/// One complete, immutable copy of the world
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorldFrame {
    pub tick: Tick,
    /// Increments with every publish
    pub version: u64,
    /// Sorted by id
    pub entities: Vec<EntityState>,
}

impl WorldFrame {
    pub fn get(&self, id: EntityId) -> Option<&EntityState> {
        self.entities
            .binary_search_by_key(&id, |e| e.id)
            .ok()
            .map(|i| &self.entities[i])
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

type Slot = Arc<RwLock<Arc<WorldFrame>>>;

/// Writer side of the swap pointer
pub struct ViewPublisher {
    slot: Slot,
    version: u64,
}

impl ViewPublisher {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(RwLock::new(Arc::new(WorldFrame::default()))),
            version: 0,
        }
    }

    /// Swap in a new frame; `entities` must be sorted by id
    pub fn publish(&mut self, tick: Tick, entities: Vec<EntityState>) -> u64 {
        debug_assert!(entities.windows(2).all(|w| w[0].id < w[1].id));
        self.version += 1;
        let frame = Arc::new(WorldFrame {
            tick,
            version: self.version,
            entities,
        });
        *self.slot.write() = frame;
        self.version
    }

    /// New reader handle
    pub fn view(&self) -> WorldView {
        WorldView {
            slot: self.slot.clone(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }
}

impl Default for ViewPublisher {
    fn default() -> Self {
        Self::new()
    }
}

/// Reader side, cheap to clone and hand to other threads
#[derive(Clone)]
pub struct WorldView {
    slot: Slot,
}

impl WorldView {
    /// Most recently published frame
    pub fn latest(&self) -> Arc<WorldFrame> {
        self.slot.read().clone()
    }

    pub fn version(&self) -> u64 {
        self.slot.read().version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::entity::Component;
    use crate::util::vec3::Vec3;

    fn state(id: EntityId, x: f32) -> EntityState {
        let mut state = EntityState::new(id);
        state.set(Component::Position(Vec3::new(x, 0.0, 0.0)));
        state
    }

    #[test]
    fn test_publish_and_read() {
        let mut publisher = ViewPublisher::new();
        let view = publisher.view();
        assert_eq!(view.version(), 0);
        assert!(view.latest().is_empty());

        publisher.publish(3, vec![state(1, 1.0), state(4, 4.0)]);
        let frame = view.latest();
        assert_eq!(frame.tick, 3);
        assert_eq!(frame.version, 1);
        assert_eq!(frame.get(4).and_then(|e| e.position), Some(Vec3::new(4.0, 0.0, 0.0)));
        assert!(frame.get(2).is_none());
    }

    #[test]
    fn test_held_frame_is_not_torn() {
        let mut publisher = ViewPublisher::new();
        let view = publisher.view();

        publisher.publish(1, vec![state(1, 1.0)]);
        let held = view.latest();
        publisher.publish(2, vec![state(1, 2.0), state(2, 2.0)]);

        assert_eq!(held.tick, 1);
        assert_eq!(held.len(), 1);
        assert_eq!(view.latest().tick, 2);
        assert_eq!(view.version(), 2);
    }

    #[test]
    fn test_readers_on_other_threads() {
        let mut publisher = ViewPublisher::new();
        let view = publisher.view();

        let reader = std::thread::spawn(move || {
            let mut last = 0;
            for _ in 0..1000 {
                let frame = view.latest();
                // Every frame is internally consistent: tick == entity count
                assert_eq!(frame.tick as usize, frame.len());
                assert!(frame.version >= last);
                last = frame.version;
            }
        });

        for tick in 1..=200u32 {
            let entities = (1..=tick).map(|id| state(id, tick as f32)).collect();
            publisher.publish(tick, entities);
        }
        reader.join().unwrap();
    }
}
