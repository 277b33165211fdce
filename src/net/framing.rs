//! Little-endian byte framing for datagrams and snapshot frames
//!
//! `FrameBuilder` appends primitives to a growable buffer; `FrameReader`
//! consumes them again and reports truncation as `None` so callers can map
//! it to their own error.

use crate::error::SyncError;
use crate::game::constants::net::MAX_DATAGRAM_SIZE;
use crate::util::quat::Quat;
use crate::util::vec3::Vec3;

/// Reject payloads that would not fit in one datagram
pub fn validate_datagram_size(data: &[u8]) -> Result<(), SyncError> {
    if data.len() > MAX_DATAGRAM_SIZE {
        Err(SyncError::malformed(format!(
            "{} bytes exceeds datagram limit of {}",
            data.len(),
            MAX_DATAGRAM_SIZE
        )))
    } else {
        Ok(())
    }
}

/// Frame builder for constructing wire data
pub struct FrameBuilder {
    buffer: Vec<u8>,
}

impl FrameBuilder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(256),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    pub fn write(mut self, data: &[u8]) -> Self {
        self.buffer.extend_from_slice(data);
        self
    }

    pub fn write_u8(mut self, value: u8) -> Self {
        self.buffer.push(value);
        self
    }

    pub fn write_u16(mut self, value: u16) -> Self {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_u32(mut self, value: u32) -> Self {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_i32(mut self, value: i32) -> Self {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_u64(mut self, value: u64) -> Self {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_f32(mut self, value: f32) -> Self {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_vec3(self, v: Vec3) -> Self {
        self.write_f32(v.x).write_f32(v.y).write_f32(v.z)
    }

    /// Quaternion as x, y, z, w
    pub fn write_quat(self, q: Quat) -> Self {
        self.write_f32(q.x).write_f32(q.y).write_f32(q.z).write_f32(q.w)
    }

    pub fn build(self) -> Vec<u8> {
        self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Default for FrameBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Frame reader for parsing wire data
pub struct FrameReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> FrameReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    /// Read n bytes
    pub fn read(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.position.checked_add(n)?;
        if end > self.data.len() {
            return None;
        }
        let slice = &self.data[self.position..end];
        self.position = end;
        Some(slice)
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        self.read(1).map(|b| b[0])
    }

    pub fn read_u16(&mut self) -> Option<u16> {
        self.read(2).map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        self.read(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32(&mut self) -> Option<i32> {
        self.read(4)
            .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> Option<u64> {
        self.read(8).map(|b| {
            u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
        })
    }

    pub fn read_f32(&mut self) -> Option<f32> {
        self.read(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_vec3(&mut self) -> Option<Vec3> {
        Some(Vec3::new(self.read_f32()?, self.read_f32()?, self.read_f32()?))
    }

    pub fn read_quat(&mut self) -> Option<Quat> {
        Some(Quat::new(
            self.read_f32()?,
            self.read_f32()?,
            self.read_f32()?,
            self.read_f32()?,
        ))
    }

    /// Remaining unread bytes
    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.position..]
    }

    pub fn remaining_len(&self) -> usize {
        self.data.len() - self.position
    }

    pub fn has_remaining(&self) -> bool {
        self.position < self.data.len()
    }
}
