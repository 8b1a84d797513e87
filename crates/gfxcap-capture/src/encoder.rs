//! Argument serialization into the per-thread parameter buffer.
//!
//! The generated interception shims own the full wire layout of each call's
//! aggregate arguments; the encoder only provides the primitive building
//! blocks. Everything is little-endian to match the block layouts.

use gfxcap_format::HandleId;

/// Owns the thread's primary parameter buffer and appends encoded values to
/// it. One encoder exists per thread and is reset between calls.
#[derive(Debug, Default)]
pub struct ParameterEncoder {
    buffer: Vec<u8>,
}

impl ParameterEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data(&self) -> &[u8] {
        &self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clears the buffer for the next call without releasing its capacity.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    pub fn encode_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn encode_u16(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn encode_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn encode_u64(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn encode_i32(&mut self, value: i32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn encode_i64(&mut self, value: i64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn encode_f32(&mut self, value: f32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn encode_f64(&mut self, value: f64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Sizes are widened to u64 so 32- and 64-bit captures replay alike.
    pub fn encode_size(&mut self, value: usize) {
        self.encode_u64(value as u64);
    }

    pub fn encode_handle_id(&mut self, value: HandleId) {
        self.encode_u64(value);
    }

    /// Raw bytes with no length prefix; the layout is the shim's business.
    pub fn encode_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// A u64 element count followed by the elements.
    pub fn encode_handle_id_array(&mut self, values: &[HandleId]) {
        self.encode_size(values.len());
        for value in values {
            self.encode_u64(*value);
        }
    }

    pub fn encode_u32_array(&mut self, values: &[u32]) {
        self.encode_size(values.len());
        for value in values {
            self.encode_u32(*value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_are_little_endian() {
        let mut encoder = ParameterEncoder::new();
        encoder.encode_u32(0x0403_0201);
        encoder.encode_u64(0x0807_0605_0403_0201);
        assert_eq!(encoder.data()[..4], [1, 2, 3, 4]);
        assert_eq!(encoder.data()[4..], [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn arrays_carry_a_length_prefix() {
        let mut encoder = ParameterEncoder::new();
        encoder.encode_u32_array(&[7, 9]);
        assert_eq!(encoder.len(), 8 + 2 * 4);
        assert_eq!(encoder.data()[..8], 2u64.to_le_bytes());
    }

    #[test]
    fn reset_keeps_capacity() {
        let mut encoder = ParameterEncoder::new();
        encoder.encode_bytes(&[0u8; 1024]);
        let capacity = encoder.buffer.capacity();
        encoder.reset();
        assert!(encoder.is_empty());
        assert_eq!(encoder.buffer.capacity(), capacity);
    }
}
