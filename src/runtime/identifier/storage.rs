//! Thread-safe salted identifier allocator.

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use tracing::{trace, warn};

use super::{Identifier, IdentifierMask};

/// Free-list bookkeeping, guarded by the allocation lock.
#[derive(Debug, Default)]
struct FreeList {
    /// Returned slots, reused last-in first-out.
    free: Vec<u32>,
    /// First index never handed out.
    next_unused: u32,
}

/// Allocates and recycles salted [`Identifier`]s from a fixed index space.
///
/// Slot salts live outside the allocation lock so [`is_valid`](Self::is_valid)
/// never blocks. A slot's salt starts at zero and is incremented on every
/// [`release`](Self::release); a slot reused `N` times therefore hands out
/// salt `N`.
#[derive(Debug)]
pub struct IdentifierStorage {
    salts: Box<[AtomicU32]>,
    active: IdentifierMask,
    free_list: Mutex<FreeList>,
}

impl IdentifierStorage {
    /// Create a storage able to hand out `capacity` live identifiers.
    pub fn with_capacity(capacity: u32) -> Self {
        let capacity = capacity.min(Identifier::MAX_INDEX);
        Self {
            salts: (0..capacity).map(|_| AtomicU32::new(0)).collect(),
            active: IdentifierMask::new(capacity),
            free_list: Mutex::new(FreeList::default()),
        }
    }

    /// Maximum number of simultaneously live identifiers.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.salts.len() as u32
    }

    /// Hand out a fresh or recycled identifier.
    ///
    /// Returns [`Identifier::INVALID`] once every slot is live; two logical
    /// resources never share a handle.
    pub fn acquire(&self) -> Identifier {
        let mut list = self.free_list.lock();
        let index = match list.free.pop() {
            Some(index) => index,
            None if list.next_unused < self.capacity() => {
                let index = list.next_unused;
                list.next_unused += 1;
                index
            }
            None => {
                warn!(capacity = self.capacity(), "identifier space exhausted");
                return Identifier::INVALID;
            }
        };

        self.active.set(index);
        let salt = self.salts[index as usize].load(Ordering::Acquire);
        trace!(index, salt, "acquired identifier");
        Identifier::new(index, salt)
    }

    /// Return an identifier to the free list and bump its slot's salt.
    ///
    /// Returns `false` (and changes nothing) for stale, foreign or already
    /// released handles.
    pub fn release(
        &self,
        identifier: Identifier,
    ) -> bool {
        let mut list = self.free_list.lock();
        if !self.is_valid(identifier) {
            return false;
        }

        let index = identifier.index();
        self.active.clear(index);
        self.salts[index as usize].fetch_add(1, Ordering::AcqRel);
        list.free.push(index);
        trace!(index, salt = identifier.salt(), "released identifier");
        true
    }

    /// Whether `identifier` still refers to the live occupant of its slot.
    #[inline]
    pub fn is_valid(
        &self,
        identifier: Identifier,
    ) -> bool {
        if !identifier.is_valid() || identifier.index() >= self.capacity() {
            return false;
        }
        self.active.is_set(identifier.index())
            && self.salts[identifier.index() as usize].load(Ordering::Acquire) == identifier.salt()
    }

    /// Current salt of the slot at `index`.
    pub fn current_salt(
        &self,
        index: u32,
    ) -> Option<u32> {
        self.salts
            .get(index as usize)
            .map(|salt| salt.load(Ordering::Acquire))
    }

    /// Number of live identifiers.
    pub fn active_count(&self) -> usize {
        self.active.count()
    }

    /// Highest index ever handed out plus one.
    pub fn maximum_used_count(&self) -> u32 {
        self.free_list.lock().next_unused
    }
}

impl Default for IdentifierStorage {
    fn default() -> Self {
        Self::with_capacity(u16::MAX as u32)
    }
}
