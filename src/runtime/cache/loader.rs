//! Loader seam between the cache and whatever produces payloads.

use std::fmt;

use tracing::warn;

use super::{CacheResult, Guid, ResourceCache};
use crate::runtime::identifier::Identifier;
use crate::runtime::scheduler::Batch;

/// Produces payloads for a [`ResourceCache`].
///
/// Called at most once per claimed load. The loader either completes the
/// request synchronously and returns an invalid [`Batch`], or returns a
/// batch whose stages (or some external system) complete the request later.
/// The returned batch is not queued by the cache; the caller of
/// [`ResourceCache::try_load`] queues it.
pub trait ResourceLoader<P: Send + Sync + 'static>: Send + Sync + 'static {
    fn load(
        &self,
        request: LoadRequest<P>,
    ) -> Batch;
}

impl<P, F> ResourceLoader<P> for F
where
    P: Send + Sync + 'static,
    F: Fn(LoadRequest<P>) -> Batch + Send + Sync + 'static,
{
    fn load(
        &self,
        request: LoadRequest<P>,
    ) -> Batch {
        self(request)
    }
}

/// The right (and obligation) to complete one claimed load.
///
/// Consumed by [`finish`](Self::finish) or [`fail`](Self::fail). Dropping an
/// unconsumed request fails the load so listeners are never left hanging.
#[must_use = "dropping a load request fails the load"]
pub struct LoadRequest<P: Send + Sync + 'static> {
    cache: ResourceCache<P>,
    identifier: Identifier,
    guid: Option<Guid>,
    reload: bool,
    completed: bool,
}

impl<P: Send + Sync + 'static> fmt::Debug for LoadRequest<P> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("LoadRequest")
            .field("identifier", &self.identifier)
            .field("guid", &self.guid)
            .field("reload", &self.reload)
            .finish()
    }
}

impl<P: Send + Sync + 'static> LoadRequest<P> {
    pub(crate) fn new(
        cache: ResourceCache<P>,
        identifier: Identifier,
        guid: Option<Guid>,
        reload: bool,
    ) -> Self {
        Self {
            cache,
            identifier,
            guid,
            reload,
            completed: false,
        }
    }

    #[inline]
    pub fn identifier(&self) -> Identifier {
        self.identifier
    }

    /// GUID the resource was registered under; `None` for procedural ones.
    #[inline]
    pub fn guid(&self) -> Option<Guid> {
        self.guid
    }

    /// Whether this load replaces an already loaded payload.
    #[inline]
    pub fn is_reload(&self) -> bool {
        self.reload
    }

    #[inline]
    pub fn cache(&self) -> &ResourceCache<P> {
        &self.cache
    }

    /// Publish the payload and notify every pending listener.
    pub fn finish(
        mut self,
        payload: P,
    ) -> CacheResult<()> {
        self.completed = true;
        self.cache.on_loading_finished(self.identifier, payload)
    }

    /// Mark the load failed and notify every pending listener.
    pub fn fail(mut self) -> CacheResult<()> {
        self.completed = true;
        self.cache.on_loading_failed(self.identifier)
    }
}

impl<P: Send + Sync + 'static> Drop for LoadRequest<P> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        warn!(identifier = %self.identifier, "load request dropped without completion; failing the load");
        if let Err(err) = self.cache.on_loading_failed(self.identifier) {
            warn!(%err, "could not fail abandoned load");
        }
    }
}
