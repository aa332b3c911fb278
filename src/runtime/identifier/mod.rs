//! Salted identifiers
//!
//! Stable integer handles for slots that get recycled. Every handle carries
//! the dense slot index plus a salt (generation counter). The salt is bumped
//! each time a slot is returned, so a handle captured before the slot was
//! reused no longer validates against it.
//!
//! # Architecture
//!
//! - [`Identifier`] - index + salt handle
//! - [`IdentifierStorage`] - thread-safe allocator with a free list
//! - [`IdentifierMask`] - atomic bitmask keyed by identifier index

mod mask;
mod storage;

pub use mask::IdentifierMask;
pub use storage::IdentifierStorage;

use std::fmt;

/// A salted handle to a slot in an [`IdentifierStorage`].
///
/// Identifiers are plain values: copying one never keeps a slot alive. Use
/// [`IdentifierStorage::is_valid`] to check whether the slot still belongs
/// to the holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier {
    index: u32,
    salt: u32,
}

impl Identifier {
    /// Sentinel returned when no identifier could be handed out.
    pub const INVALID: Identifier = Identifier {
        index: u32::MAX,
        salt: u32::MAX,
    };

    /// Largest index a storage may hand out.
    pub const MAX_INDEX: u32 = u32::MAX - 1;

    /// Create an identifier from its raw parts.
    ///
    /// # Examples
    ///
    /// ```
    /// use jobgraph::runtime::identifier::Identifier;
    ///
    /// let id = Identifier::new(3, 1);
    /// assert_eq!(id.index(), 3);
    /// assert_eq!(id.salt(), 1);
    /// ```
    #[inline]
    pub const fn new(
        index: u32,
        salt: u32,
    ) -> Self {
        Self { index, salt }
    }

    /// Dense slot index.
    #[inline]
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Generation of the slot at the time this handle was issued.
    #[inline]
    pub const fn salt(&self) -> u32 {
        self.salt
    }

    /// Whether this is anything other than [`Identifier::INVALID`].
    ///
    /// This does not say whether the slot is still live; ask the storage
    /// that issued the handle for that.
    #[inline]
    pub const fn is_valid(&self) -> bool {
        self.index != u32::MAX
    }

    /// Pack into a single `u64` (salt in the high half).
    #[inline]
    pub const fn to_bits(self) -> u64 {
        ((self.salt as u64) << 32) | self.index as u64
    }

    /// Inverse of [`Identifier::to_bits`].
    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        Self {
            index: bits as u32,
            salt: (bits >> 32) as u32,
        }
    }
}

impl Default for Identifier {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Display for Identifier {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        if self.is_valid() {
            write!(f, "Identifier({}#{})", self.index, self.salt)
        } else {
            write!(f, "Identifier(invalid)")
        }
    }
}
