//! Snapshot wire codec
//!
//! Frame layout (little-endian):
//!
//! ```text
//! [u32 protocol version][u32 baseline tick][u32 snapshot tick]
//! [u16 acked client sequence][u32 entity count]
//! entity count x [u32 id][u8 changed-field mask][values in field order]
//! [u32 removed count] removed count x [u32 id]
//! ```
//!
//! Records are written in ascending id order and values in field-index
//! order, so one logical snapshot always encodes to the same bytes.

use crate::error::SyncError;
use crate::game::constants::net::{MAX_RELIABLE_MESSAGE_SIZE, PROTOCOL_VERSION};
use crate::game::entity::{normalize_components, Component, ComponentList, EntityId, Field, FieldMask};
use crate::game::snapshot::{EntityDelta, Snapshot};
use crate::net::framing::{FrameBuilder, FrameReader};

/// Fixed header: version + baseline + tick + acked seq + entity count
pub const HEADER_SIZE: usize = 4 + 4 + 4 + 2 + 4;

/// Smallest possible entity record: id + mask
const MIN_RECORD_SIZE: usize = 4 + 1;

// ============================================================================
// Encode
// ============================================================================

/// Encode a snapshot into a self-describing frame
pub fn encode(snapshot: &Snapshot) -> Vec<u8> {
    let mut entities: Vec<&EntityDelta> = snapshot.entities.iter().collect();
    entities.sort_by_key(|e| e.id);

    let mut removed = snapshot.removed.clone();
    removed.sort_unstable();
    removed.dedup();

    let mut frame = FrameBuilder::with_capacity(encoded_len(snapshot))
        .write_u32(PROTOCOL_VERSION)
        .write_u32(snapshot.baseline)
        .write_u32(snapshot.tick)
        .write_u16(snapshot.acked_sequence)
        .write_u32(entities.len() as u32);

    for delta in entities {
        let components = normalize_components(delta.components.iter().copied());
        let mut mask = FieldMask::EMPTY;
        for component in &components {
            mask.insert(component.field());
        }

        frame = frame.write_u32(delta.id).write_u8(mask.bits());
        for component in components {
            frame = write_component(frame, component);
        }
    }

    frame = frame.write_u32(removed.len() as u32);
    for id in removed {
        frame = frame.write_u32(id);
    }

    frame.build()
}

/// Upper bound on the encoded size of a snapshot
pub fn encoded_len(snapshot: &Snapshot) -> usize {
    let records: usize = snapshot
        .entities
        .iter()
        .map(|e| {
            MIN_RECORD_SIZE
                + e.components
                    .iter()
                    .map(|c| value_size(c.field()))
                    .sum::<usize>()
        })
        .sum();
    HEADER_SIZE + records + 4 + snapshot.removed.len() * 4
}

fn value_size(field: Field) -> usize {
    match field {
        Field::Kind => 2,
        Field::Position | Field::Velocity => 12,
        Field::Orientation => 16,
        Field::Health => 4,
        Field::Owner => 8,
    }
}

fn write_component(frame: FrameBuilder, component: Component) -> FrameBuilder {
    match component {
        Component::Kind(v) => frame.write_u16(v),
        Component::Position(v) | Component::Velocity(v) => frame.write_vec3(v),
        Component::Orientation(q) => frame.write_quat(q),
        Component::Health(v) => frame.write_i32(v),
        Component::Owner(v) => frame.write_u64(v),
    }
}

// ============================================================================
// Decode
// ============================================================================

/// Decode a frame produced by [`encode`]
pub fn decode(bytes: &[u8]) -> Result<Snapshot, SyncError> {
    let mut reader = FrameReader::new(bytes);

    let version = reader
        .read_u32()
        .ok_or_else(|| SyncError::malformed("truncated header"))?;
    if version != PROTOCOL_VERSION {
        return Err(SyncError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            actual: version,
        });
    }

    // Full snapshots travel as reliable messages, so that is the ceiling
    if bytes.len() > MAX_RELIABLE_MESSAGE_SIZE {
        return Err(SyncError::malformed(format!(
            "frame of {} bytes exceeds limit",
            bytes.len()
        )));
    }

    let (baseline, tick, acked_sequence, count) = match (
        reader.read_u32(),
        reader.read_u32(),
        reader.read_u16(),
        reader.read_u32(),
    ) {
        (Some(b), Some(t), Some(s), Some(c)) => (b, t, s, c as usize),
        _ => return Err(SyncError::malformed("truncated header")),
    };

    if baseline > tick {
        return Err(SyncError::malformed(format!(
            "baseline {} after tick {}",
            baseline, tick
        )));
    }

    if count > reader.remaining_len() / MIN_RECORD_SIZE {
        return Err(SyncError::malformed(format!(
            "entity count {} exceeds frame size",
            count
        )));
    }

    let mut entities = Vec::with_capacity(count);
    let mut previous: Option<EntityId> = None;
    for _ in 0..count {
        let delta = read_record(&mut reader)?;
        if previous.is_some_and(|p| p >= delta.id) {
            return Err(SyncError::malformed(format!(
                "entity {} out of order",
                delta.id
            )));
        }
        previous = Some(delta.id);
        entities.push(delta);
    }

    let removed_count = reader
        .read_u32()
        .ok_or_else(|| SyncError::malformed("truncated removed list"))?
        as usize;
    if removed_count > reader.remaining_len() / 4 {
        return Err(SyncError::malformed(format!(
            "removed count {} exceeds frame size",
            removed_count
        )));
    }

    let mut removed = Vec::with_capacity(removed_count);
    for _ in 0..removed_count {
        let id = reader
            .read_u32()
            .ok_or_else(|| SyncError::malformed("truncated removed list"))?;
        if removed.last().is_some_and(|&last| last >= id) {
            return Err(SyncError::malformed(format!("removed id {} out of order", id)));
        }
        removed.push(id);
    }

    if reader.has_remaining() {
        return Err(SyncError::malformed(format!(
            "{} trailing bytes after removed list",
            reader.remaining_len()
        )));
    }

    Ok(Snapshot {
        baseline,
        tick,
        acked_sequence,
        entities,
        removed,
    })
}

/// Read the snapshot tick without decoding the whole frame
pub fn peek_tick(bytes: &[u8]) -> Option<u32> {
    let mut reader = FrameReader::new(bytes);
    reader.read(8)?;
    reader.read_u32()
}

fn read_record(reader: &mut FrameReader<'_>) -> Result<EntityDelta, SyncError> {
    let truncated = || SyncError::malformed("truncated entity record");

    let id = reader.read_u32().ok_or_else(truncated)?;
    let bits = reader.read_u8().ok_or_else(truncated)?;
    let mask = FieldMask::from_bits(bits).ok_or_else(|| {
        SyncError::malformed(format!("unknown field bits {:#010b} on entity {}", bits, id))
    })?;

    let mut components = ComponentList::new();
    for field in mask.iter() {
        let component = match field {
            Field::Kind => reader.read_u16().map(Component::Kind),
            Field::Position => reader.read_vec3().map(Component::Position),
            Field::Orientation => reader.read_quat().map(Component::Orientation),
            Field::Velocity => reader.read_vec3().map(Component::Velocity),
            Field::Health => reader.read_i32().map(Component::Health),
            Field::Owner => reader.read_u64().map(Component::Owner),
        }
        .ok_or_else(truncated)?;
        components.push(component);
    }

    Ok(EntityDelta { id, components })
}
