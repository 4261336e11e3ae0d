use crate::{handler::ResourceEventHandler, key::NamespacedName};
use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

/// Point-in-time view on whether a [`WatchSource`] has delivered the full
/// initial listing of watched objects.
#[derive(Clone, Debug, Default)]
pub struct CacheSyncState(Arc<AtomicBool>);

impl CacheSyncState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_synced(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn mark_synced(&self) {
        self.0.store(true, Ordering::Release)
    }
}

/// Keeps a local mirror of remote objects and reports every change to a
/// [`ResourceEventHandler`].
pub trait WatchSource: Send + 'static {
    type Object: Send + Sync + 'static;

    /// Handle to the synchronization flag, must be obtained before [`WatchSource::run`].
    fn sync_state(&self) -> CacheSyncState;

    /// Produce notifications until the returned future is dropped.
    fn run<H>(self, handler: H) -> impl Future<Output = ()> + Send + 'static
    where
        H: ResourceEventHandler<Self::Object> + 'static;
}

/// Classification of [`ResourceAccessor`] errors.
pub trait AccessError: std::error::Error + Send + Sync + 'static {
    /// The object does not (or no longer) exist.
    fn is_not_found(&self) -> bool;
    /// The update was based on an outdated version of the object.
    fn is_conflict(&self) -> bool;
}

/// Reads and writes single objects directly from/to the remote store,
/// bypassing the local mirror.
pub trait ResourceAccessor: Send + Sync + 'static {
    type Object: Clone + Send + Sync + 'static;
    type Error: AccessError;

    fn get(
        &self,
        key: &NamespacedName,
    ) -> impl Future<Output = Result<Self::Object, Self::Error>> + Send;

    fn update(
        &self,
        obj: &Self::Object,
    ) -> impl Future<Output = Result<Self::Object, Self::Error>> + Send;
}
