// src/core/cluster/bitmap.rs

//! A fixed-size bitmap over the 16384 hash slots, used to advertise a
//! node's slot ownership on the wire without allocating per message.

use super::slot::NUM_SLOTS;
use std::fmt;

const WORDS: usize = NUM_SLOTS / 64;
/// Byte length of the bitmap as it appears in a wire header or UPDATE payload.
pub const SLOT_BITMAP_BYTES: usize = NUM_SLOTS / 8;

/// A fixed 2048-byte bitmap, one bit per hash slot.
#[derive(Clone, PartialEq, Eq)]
pub struct SlotBitmap {
    words: [u64; WORDS],
}

impl Default for SlotBitmap {
    fn default() -> Self {
        Self { words: [0; WORDS] }
    }
}

impl SlotBitmap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, slot: u16) -> bool {
        let slot = slot as usize;
        (self.words[slot / 64] >> (slot % 64)) & 1 == 1
    }

    pub fn set(&mut self, slot: u16, value: bool) {
        let slot = slot as usize;
        let mask = 1u64 << (slot % 64);
        if value {
            self.words[slot / 64] |= mask;
        } else {
            self.words[slot / 64] &= !mask;
        }
    }

    pub fn count(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    pub fn iter_slots(&self) -> impl Iterator<Item = u16> + '_ {
        (0..NUM_SLOTS as u16).filter(move |&s| self.get(s))
    }

    /// Parses the fixed 2048-byte wire representation (little-endian words).
    pub fn from_wire(raw: &[u8]) -> Option<Self> {
        if raw.len() != SLOT_BITMAP_BYTES {
            return None;
        }
        let mut words = [0u64; WORDS];
        for (i, word) in words.iter_mut().enumerate() {
            let chunk: [u8; 8] = raw[i * 8..i * 8 + 8].try_into().ok()?;
            *word = u64::from_le_bytes(chunk);
        }
        Some(Self { words })
    }

    /// Serializes to the fixed 2048-byte wire representation.
    pub fn to_wire(&self) -> [u8; SLOT_BITMAP_BYTES] {
        let mut out = [0u8; SLOT_BITMAP_BYTES];
        for (i, word) in self.words.iter().enumerate() {
            out[i * 8..i * 8 + 8].copy_from_slice(&word.to_le_bytes());
        }
        out
    }
}

impl fmt::Debug for SlotBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SlotBitmap({} slots)", self.count())
    }
}
