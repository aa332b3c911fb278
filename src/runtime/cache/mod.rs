//! Load-once resource cache
//!
//! Maps resource [`Guid`]s to salted [`Identifier`]s and guarantees that,
//! however many threads ask for the same resource concurrently, exactly one
//! load is started and every requester is notified exactly once when it
//! completes.
//!
//! # Design
//!
//! - Registration is double-checked under a `parking_lot::RwLock`, so lookups
//!   of known GUIDs never take an exclusive lock.
//! - A per-identifier bit in an [`IdentifierMask`] is the load claim: the
//!   requester whose `set` flips it starts the load; everybody else only
//!   queues a listener.
//! - Listeners are registered under the entry's listener lock and fired
//!   outside of it, so a callback may call back into the cache. Only
//!   [`pending_listener_count`](ResourceCache::pending_listener_count) takes
//!   that lock shared.
//! - A reload holds the claim bit like a first load and resets the status,
//!   so requests made meanwhile wait for the reload's outcome.
//! - The claim bit is only ever set under the entry's listener lock, after
//!   checking the entry is live. Deregistration takes the bit too and
//!   retires the entry as failed under that lock, so a request holding a
//!   stale entry is answered and never claims a recycled slot.
//! - Completion re-checks the claim bit under the payload lock; a second
//!   completion for the same load is rejected rather than firing listeners
//!   twice.

mod guid;
mod loader;

pub use guid::{Guid, GuidParseError};
pub use loader::{LoadRequest, ResourceLoader};

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::runtime::identifier::{Identifier, IdentifierMask, IdentifierStorage};
use crate::runtime::scheduler::Batch;

/// Default number of resources a cache can hold.
pub const DEFAULT_CAPACITY: u32 = 1 << 16;

/// Cache result
pub type CacheResult<T> = Result<T, CacheError>;

/// Cache errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("Unknown or stale identifier {0}")]
    UnknownIdentifier(Identifier),

    #[error("Resource identifier space exhausted ({capacity} entries)")]
    IdentifiersExhausted { capacity: u32 },

    #[error("{0} has no load in progress")]
    LoadNotClaimed(Identifier),

    #[error("{0} is still loading")]
    LoadInProgress(Identifier),
}

/// Load state of a registered resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoadStatus {
    NotLoaded = 0,
    Loaded = 1,
    Failed = 2,
}

impl LoadStatus {
    #[inline]
    fn from_u8(val: u8) -> Self {
        match val {
            1 => LoadStatus::Loaded,
            2 => LoadStatus::Failed,
            _ => LoadStatus::NotLoaded,
        }
    }

    /// Whether a load attempt has concluded, successfully or not.
    #[inline]
    pub fn is_finished(self) -> bool {
        self != LoadStatus::NotLoaded
    }
}

/// What a listener is told when a load concludes.
pub enum LoadOutcome<P> {
    Loaded(Arc<P>),
    Failed,
}

impl<P> LoadOutcome<P> {
    #[inline]
    pub fn is_loaded(&self) -> bool {
        matches!(self, LoadOutcome::Loaded(_))
    }

    #[inline]
    pub fn payload(&self) -> Option<&Arc<P>> {
        match self {
            LoadOutcome::Loaded(payload) => Some(payload),
            LoadOutcome::Failed => None,
        }
    }
}

impl<P> Clone for LoadOutcome<P> {
    fn clone(&self) -> Self {
        match self {
            LoadOutcome::Loaded(payload) => LoadOutcome::Loaded(payload.clone()),
            LoadOutcome::Failed => LoadOutcome::Failed,
        }
    }
}

impl<P> fmt::Debug for LoadOutcome<P> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            LoadOutcome::Loaded(_) => f.write_str("Loaded"),
            LoadOutcome::Failed => f.write_str("Failed"),
        }
    }
}

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1 << 63);

/// Opaque identity of a listener, used to withdraw it before it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Identity chosen by the caller (an object id, an address, ...).
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Fresh identity from a process-wide counter in the upper half of the
    /// `u64` range.
    pub fn unique() -> Self {
        Self(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

type ListenerFn<P> = Box<dyn FnOnce(Identifier, LoadOutcome<P>) + Send>;

struct PendingListener<P> {
    id: ListenerId,
    callback: ListenerFn<P>,
}

// SAFETY: `callback` is an `FnOnce` and is only ever invoked by value after
// being moved out of the list; a shared `&PendingListener` exposes nothing
// but the `Copy` id, so sharing across threads cannot touch the closure.
unsafe impl<P> Sync for PendingListener<P> {}

/// 缓存统计信息
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Requests answered from an already concluded load.
    pub hits: usize,
    /// Loads started.
    pub misses: usize,
    /// Requests that joined a load already in progress.
    pub joined: usize,
    pub loads_completed: usize,
    pub loads_failed: usize,
    pub reloads: usize,
    pub listeners_fired: usize,
}

impl CacheStats {
    /// 命中率（百分比）
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses + self.joined;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

struct CacheEntry<P: Send + Sync + 'static> {
    identifier: Identifier,
    guid: Option<Guid>,
    loader: Arc<dyn ResourceLoader<P>>,
    status: AtomicU8,
    /// Also serialises completion.
    payload: RwLock<Option<Arc<P>>>,
    listeners: RwLock<Vec<PendingListener<P>>>,
}

impl<P: Send + Sync + 'static> CacheEntry<P> {
    #[inline]
    fn status(&self) -> LoadStatus {
        LoadStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn outcome(&self) -> Option<LoadOutcome<P>> {
        match self.status() {
            LoadStatus::NotLoaded => None,
            LoadStatus::Failed => Some(LoadOutcome::Failed),
            LoadStatus::Loaded => Some(
                self.payload
                    .read()
                    .clone()
                    .map_or(LoadOutcome::Failed, LoadOutcome::Loaded),
            ),
        }
    }
}

struct CacheInner<P: Send + Sync + 'static> {
    identifiers: IdentifierStorage,
    lookup: RwLock<HashMap<Guid, Identifier>>,
    entries: RwLock<Vec<Option<Arc<CacheEntry<P>>>>>,
    /// Claim bits of loads in progress.
    loading: IdentifierMask,
    default_loader: Arc<dyn ResourceLoader<P>>,
    stats: Mutex<CacheStats>,
}

/// Thread-safe load-once cache of `P` payloads.
///
/// Cloning yields another handle to the same cache.
pub struct ResourceCache<P: Send + Sync + 'static> {
    inner: Arc<CacheInner<P>>,
}

impl<P: Send + Sync + 'static> Clone for ResourceCache<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P: Send + Sync + 'static> fmt::Debug for ResourceCache<P> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("ResourceCache")
            .field("len", &self.len())
            .field("loading", &self.inner.loading.count())
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl<P: Send + Sync + 'static> ResourceCache<P> {
    /// Create a cache with [`DEFAULT_CAPACITY`] slots. `loader` serves every
    /// GUID registered through [`find_or_register`](Self::find_or_register).
    pub fn new(loader: impl ResourceLoader<P>) -> Self {
        Self::with_capacity(DEFAULT_CAPACITY, loader)
    }

    /// Like [`new`](Self::new), taking the loader as a closure.
    pub fn from_fn<F>(loader: F) -> Self
    where
        F: Fn(LoadRequest<P>) -> Batch + Send + Sync + 'static,
    {
        Self::new(loader)
    }

    pub fn with_capacity(
        capacity: u32,
        loader: impl ResourceLoader<P>,
    ) -> Self {
        let identifiers = IdentifierStorage::with_capacity(capacity);
        let loading = IdentifierMask::new(identifiers.capacity());
        Self {
            inner: Arc::new(CacheInner {
                identifiers,
                lookup: RwLock::new(HashMap::new()),
                entries: RwLock::new(Vec::new()),
                loading,
                default_loader: Arc::new(loader),
                stats: Mutex::new(CacheStats::default()),
            }),
        }
    }

    /// Identifier for `guid`, registering it on first sight.
    pub fn find_or_register(
        &self,
        guid: Guid,
    ) -> CacheResult<Identifier> {
        if let Some(identifier) = self.find_identifier(guid) {
            return Ok(identifier);
        }

        let mut lookup = self.inner.lookup.write();
        if let Some(&identifier) = lookup.get(&guid) {
            return Ok(identifier);
        }
        let identifier = self.register_entry(Some(guid), self.inner.default_loader.clone())?;
        lookup.insert(guid, identifier);
        debug!(%guid, %identifier, "registered resource");
        Ok(identifier)
    }

    /// Identifier for `guid` if it is registered.
    pub fn find_identifier(
        &self,
        guid: Guid,
    ) -> Option<Identifier> {
        self.inner.lookup.read().get(&guid).copied()
    }

    /// Register a resource with no GUID, produced by its own loader.
    pub fn register_procedural(
        &self,
        loader: impl ResourceLoader<P>,
    ) -> CacheResult<Identifier> {
        let identifier = self.register_entry(None, Arc::new(loader))?;
        debug!(%identifier, "registered procedural resource");
        Ok(identifier)
    }

    fn register_entry(
        &self,
        guid: Option<Guid>,
        loader: Arc<dyn ResourceLoader<P>>,
    ) -> CacheResult<Identifier> {
        let identifier = self.inner.identifiers.acquire();
        if !identifier.is_valid() {
            return Err(CacheError::IdentifiersExhausted {
                capacity: self.capacity(),
            });
        }

        let entry = Arc::new(CacheEntry {
            identifier,
            guid,
            loader,
            status: AtomicU8::new(LoadStatus::NotLoaded as u8),
            payload: RwLock::new(None),
            listeners: RwLock::new(Vec::new()),
        });
        let index = identifier.index() as usize;
        let mut entries = self.inner.entries.write();
        if entries.len() <= index {
            entries.resize_with(index + 1, || None);
        }
        entries[index] = Some(entry);
        Ok(identifier)
    }

    fn entry(
        &self,
        identifier: Identifier,
    ) -> CacheResult<Arc<CacheEntry<P>>> {
        self.inner
            .entries
            .read()
            .get(identifier.index() as usize)
            .and_then(Option::as_ref)
            .filter(|entry| entry.identifier == identifier)
            .cloned()
            .ok_or(CacheError::UnknownIdentifier(identifier))
    }

    /// Whether `entry` is still the registered entry for its slot.
    fn is_current(
        &self,
        entry: &Arc<CacheEntry<P>>,
    ) -> bool {
        self.inner
            .entries
            .read()
            .get(entry.identifier.index() as usize)
            .and_then(Option::as_ref)
            .is_some_and(|current| Arc::ptr_eq(current, entry))
    }

    /// Whether `identifier` refers to a currently registered resource.
    pub fn is_valid(
        &self,
        identifier: Identifier,
    ) -> bool {
        self.inner.identifiers.is_valid(identifier) && self.entry(identifier).is_ok()
    }

    pub fn guid_of(
        &self,
        identifier: Identifier,
    ) -> Option<Guid> {
        self.entry(identifier).ok().and_then(|entry| entry.guid)
    }

    /// Ask for a resource and be told, exactly once, how its load concluded.
    ///
    /// - Already concluded: `callback` runs on the calling thread before this
    ///   returns, and the returned batch is invalid.
    /// - Load in progress elsewhere: `callback` is queued and the returned
    ///   batch is invalid.
    /// - Otherwise this call claims the load and returns whatever the loader
    ///   returned. The caller queues it (or adds it to its own batch).
    pub fn try_load<F>(
        &self,
        identifier: Identifier,
        listener: ListenerId,
        callback: F,
    ) -> CacheResult<Batch>
    where
        F: FnOnce(Identifier, LoadOutcome<P>) + Send + 'static,
    {
        let entry = self.entry(identifier)?;
        if let Some(outcome) = entry.outcome() {
            self.inner.stats.lock().hits += 1;
            self.fire(identifier, outcome, callback);
            return Ok(Batch::default());
        }

        let mut callback = Some(callback);
        let claimed = {
            let mut listeners = entry.listeners.write();
            // Completion drains and deregistration retires under this lock,
            // after publishing the status. Claims are only taken under it.
            if entry.status().is_finished() {
                false
            } else {
                if let Some(callback) = callback.take() {
                    listeners.push(PendingListener {
                        id: listener,
                        callback: Box::new(callback),
                    });
                }
                self.inner.loading.set(identifier.index())
            }
        };
        if let Some(callback) = callback {
            self.inner.stats.lock().hits += 1;
            let outcome = entry.outcome().unwrap_or(LoadOutcome::Failed);
            self.fire(identifier, outcome, callback);
            return Ok(Batch::default());
        }
        if !claimed {
            self.inner.stats.lock().joined += 1;
            trace!(%identifier, "joined load in progress");
            return Ok(Batch::default());
        }

        self.inner.stats.lock().misses += 1;
        debug!(%identifier, guid = ?entry.guid, "starting load");
        let request = LoadRequest::new(self.clone(), identifier, entry.guid, false);
        let batch = entry.loader.load(request);
        if !batch.is_valid() && self.is_loading(identifier) {
            trace!(%identifier, "loader returned no batch; completion is owed externally");
        }
        Ok(batch)
    }

    /// Load a resource again, replacing its payload when the load finishes.
    ///
    /// Returns an invalid batch if a load is already in progress. While the
    /// reload runs the status reads [`LoadStatus::NotLoaded`], listeners
    /// registered through [`try_load`](Self::try_load) are told about the
    /// reload's outcome, and [`payload`](Self::payload) keeps returning the
    /// previous payload.
    pub fn try_reload(
        &self,
        identifier: Identifier,
    ) -> CacheResult<Batch> {
        let entry = self.entry(identifier)?;
        {
            let _listeners = entry.listeners.write();
            if !self.is_current(&entry) {
                return Err(CacheError::UnknownIdentifier(identifier));
            }
            if !self.inner.loading.set(identifier.index()) {
                return Ok(Batch::default());
            }
            entry
                .status
                .store(LoadStatus::NotLoaded as u8, Ordering::Release);
        }
        self.inner.stats.lock().reloads += 1;
        debug!(%identifier, "starting reload");
        let request = LoadRequest::new(self.clone(), identifier, entry.guid, true);
        Ok(entry.loader.load(request))
    }

    /// Publish `payload` for a claimed load and notify its listeners.
    pub fn on_loading_finished(
        &self,
        identifier: Identifier,
        payload: P,
    ) -> CacheResult<()> {
        self.complete(identifier, Some(payload))
    }

    /// Conclude a claimed load as failed and notify its listeners.
    ///
    /// A previously loaded payload (from before a reload) stays readable
    /// through [`payload`](Self::payload).
    pub fn on_loading_failed(
        &self,
        identifier: Identifier,
    ) -> CacheResult<()> {
        self.complete(identifier, None)
    }

    fn complete(
        &self,
        identifier: Identifier,
        payload: Option<P>,
    ) -> CacheResult<()> {
        let entry = self.entry(identifier)?;
        let (outcome, drained) = {
            let mut record = entry.payload.write();
            if !self.inner.loading.is_set(identifier.index()) {
                warn!(%identifier, "completion without a claimed load");
                return Err(CacheError::LoadNotClaimed(identifier));
            }

            let outcome = match payload {
                Some(payload) => {
                    let payload = Arc::new(payload);
                    *record = Some(payload.clone());
                    entry
                        .status
                        .store(LoadStatus::Loaded as u8, Ordering::Release);
                    LoadOutcome::Loaded(payload)
                }
                None => {
                    entry
                        .status
                        .store(LoadStatus::Failed as u8, Ordering::Release);
                    LoadOutcome::Failed
                }
            };
            let drained = std::mem::take(&mut *entry.listeners.write());
            self.inner.loading.clear(identifier.index());
            (outcome, drained)
        };

        {
            let mut stats = self.inner.stats.lock();
            if outcome.is_loaded() {
                stats.loads_completed += 1;
            } else {
                stats.loads_failed += 1;
            }
        }
        debug!(%identifier, ?outcome, listeners = drained.len(), "load concluded");
        for listener in drained {
            self.fire(identifier, outcome.clone(), listener.callback);
        }
        Ok(())
    }

    fn fire(
        &self,
        identifier: Identifier,
        outcome: LoadOutcome<P>,
        callback: impl FnOnce(Identifier, LoadOutcome<P>),
    ) {
        self.inner.stats.lock().listeners_fired += 1;
        callback(identifier, outcome);
    }

    /// Withdraw every pending listener registered under `listener`.
    ///
    /// Returns whether anything was removed. Removed callbacks never run.
    pub fn remove_listener(
        &self,
        identifier: Identifier,
        listener: ListenerId,
    ) -> bool {
        let Ok(entry) = self.entry(identifier) else {
            return false;
        };
        let mut listeners = entry.listeners.write();
        let before = listeners.len();
        listeners.retain(|pending| pending.id != listener);
        before != listeners.len()
    }

    pub fn status(
        &self,
        identifier: Identifier,
    ) -> Option<LoadStatus> {
        self.entry(identifier).ok().map(|entry| entry.status())
    }

    /// Whether a load of `identifier` has concluded (loaded or failed).
    pub fn has_finished_loading(
        &self,
        identifier: Identifier,
    ) -> bool {
        self.status(identifier)
            .is_some_and(LoadStatus::is_finished)
    }

    /// Whether a load of `identifier` is claimed and not yet concluded.
    pub fn is_loading(
        &self,
        identifier: Identifier,
    ) -> bool {
        self.inner.loading.is_set_for(identifier) && self.entry(identifier).is_ok()
    }

    /// Latest successfully loaded payload.
    pub fn payload(
        &self,
        identifier: Identifier,
    ) -> Option<Arc<P>> {
        self.entry(identifier)
            .ok()
            .and_then(|entry| entry.payload.read().clone())
    }

    pub fn pending_listener_count(
        &self,
        identifier: Identifier,
    ) -> usize {
        self.entry(identifier)
            .map(|entry| entry.listeners.read().len())
            .unwrap_or(0)
    }

    /// Forget a resource and recycle its identifier.
    ///
    /// Refused while a load is in progress. Handles to the resource become
    /// stale; a later `find_or_register` of the same GUID yields a new one.
    /// Requests that still reach the retired entry are told it failed.
    pub fn deregister(
        &self,
        identifier: Identifier,
    ) -> CacheResult<()> {
        let entry = self.entry(identifier)?;
        let index = identifier.index();
        let leftovers = {
            let mut listeners = entry.listeners.write();
            if !self.is_current(&entry) {
                return Err(CacheError::UnknownIdentifier(identifier));
            }
            if !self.inner.loading.set(index) {
                return Err(CacheError::LoadInProgress(identifier));
            }
            entry
                .status
                .store(LoadStatus::Failed as u8, Ordering::Release);
            {
                let mut lookup = self.inner.lookup.write();
                if let Some(guid) = entry.guid {
                    lookup.remove(&guid);
                }
                self.inner.entries.write()[index as usize] = None;
            }
            // Cleared before the slot can be recycled.
            self.inner.loading.clear(index);
            std::mem::take(&mut *listeners)
        };
        self.inner.identifiers.release(identifier);

        for listener in leftovers {
            self.fire(identifier, LoadOutcome::Failed, listener.callback);
        }
        debug!(%identifier, "deregistered resource");
        Ok(())
    }

    /// Number of registered resources.
    pub fn len(&self) -> usize {
        self.inner.identifiers.active_count()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.inner.identifiers.capacity()
    }

    /// Highest identifier index ever handed out plus one; size dense
    /// side tables with this.
    pub fn maximum_used_identifier_count(&self) -> u32 {
        self.inner.identifiers.maximum_used_count()
    }

    /// Identifiers of every registered resource.
    pub fn identifiers(&self) -> Vec<Identifier> {
        self.inner
            .entries
            .read()
            .iter()
            .flatten()
            .map(|entry| entry.identifier)
            .collect()
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.stats.lock().clone()
    }
}

#[cfg(test)]
mod tests;
