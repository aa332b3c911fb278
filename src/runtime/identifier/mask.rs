//! Atomic bitmask keyed by identifier index.

use std::sync::atomic::{AtomicU64, Ordering};

use super::Identifier;

const BITS: u32 = u64::BITS;

/// Fixed-capacity set of identifier indices with lock-free set/clear.
///
/// `set` and `clear` report whether *this* call changed the bit, which makes
/// the mask usable as a per-identifier claim: exactly one of any number of
/// racing `set` calls returns `true`.
#[derive(Debug)]
pub struct IdentifierMask {
    words: Box<[AtomicU64]>,
    capacity: u32,
}

impl IdentifierMask {
    /// Create a mask able to hold indices `0..capacity`.
    pub fn new(capacity: u32) -> Self {
        let word_count = capacity.div_ceil(BITS) as usize;
        let words = (0..word_count).map(|_| AtomicU64::new(0)).collect();
        Self { words, capacity }
    }

    /// Number of indices this mask can hold.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    #[inline]
    fn locate(
        &self,
        index: u32,
    ) -> Option<(&AtomicU64, u64)> {
        if index >= self.capacity {
            return None;
        }
        let word = &self.words[(index / BITS) as usize];
        Some((word, 1u64 << (index % BITS)))
    }

    /// Set the bit for `index`. Returns `true` if it was previously clear.
    #[inline]
    pub fn set(
        &self,
        index: u32,
    ) -> bool {
        match self.locate(index) {
            Some((word, bit)) => word.fetch_or(bit, Ordering::AcqRel) & bit == 0,
            None => false,
        }
    }

    /// Clear the bit for `index`. Returns `true` if it was previously set.
    #[inline]
    pub fn clear(
        &self,
        index: u32,
    ) -> bool {
        match self.locate(index) {
            Some((word, bit)) => word.fetch_and(!bit, Ordering::AcqRel) & bit != 0,
            None => false,
        }
    }

    /// Whether the bit for `index` is set.
    #[inline]
    pub fn is_set(
        &self,
        index: u32,
    ) -> bool {
        match self.locate(index) {
            Some((word, bit)) => word.load(Ordering::Acquire) & bit != 0,
            None => false,
        }
    }

    /// Convenience wrapper keyed by a full identifier.
    #[inline]
    pub fn is_set_for(
        &self,
        identifier: Identifier,
    ) -> bool {
        identifier.is_valid() && self.is_set(identifier.index())
    }

    /// Number of set bits. Only a snapshot under concurrent mutation.
    pub fn count(&self) -> usize {
        self.words
            .iter()
            .map(|word| word.load(Ordering::Acquire).count_ones() as usize)
            .sum()
    }

    /// Whether no bit is set.
    pub fn is_empty(&self) -> bool {
        self.words
            .iter()
            .all(|word| word.load(Ordering::Acquire) == 0)
    }

    /// Indices of all set bits, ascending.
    pub fn set_indices(&self) -> Vec<u32> {
        let mut indices = Vec::new();
        for (word_index, word) in self.words.iter().enumerate() {
            let mut value = word.load(Ordering::Acquire);
            while value != 0 {
                let bit = value.trailing_zeros();
                indices.push(word_index as u32 * BITS + bit);
                value &= value - 1;
            }
        }
        indices
    }
}
