use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::Api;
use kube_runtime::{
    WatchStreamExt,
    reflector::{ObjectRef, Store, store::Writer},
    watcher::{self, Event},
};
use rustrial_k8s_replica_guard_runtime::{CacheSyncState, ResourceEventHandler, WatchSource};
use std::{collections::HashSet, future::Future, pin::pin};

/// Local mirror of [`Deployment`]s, kept up to date by a kube watcher.
///
/// Every watch event is compared with the mirror before it is applied, so
/// handlers see the previous state on updates and the last known state on
/// deletes. Objects which vanished while the watch was re-listing are reported
/// as deleted once the re-list completes.
pub(crate) struct DeploymentInformer {
    api: Api<Deployment>,
    config: watcher::Config,
    mirror: Mirror,
}

impl DeploymentInformer {
    pub fn new(api: Api<Deployment>, config: watcher::Config) -> Self {
        Self {
            api,
            config,
            mirror: Mirror::default(),
        }
    }
}

impl WatchSource for DeploymentInformer {
    type Object = Deployment;

    fn sync_state(&self) -> CacheSyncState {
        self.mirror.sync_state.clone()
    }

    fn run<H>(self, handler: H) -> impl Future<Output = ()> + Send + 'static
    where
        H: ResourceEventHandler<Deployment> + 'static,
    {
        let Self {
            api,
            config,
            mut mirror,
        } = self;
        async move {
            let mut events = pin!(watcher::watcher(api, config).default_backoff());
            while let Some(event) = events.next().await {
                match event {
                    Ok(event) => mirror.apply(event, &handler),
                    Err(e) => warn!("Deployment watch failed, retrying: {}", e),
                }
            }
            warn!("Deployment watch stream ended");
        }
    }
}

struct Mirror {
    writer: Writer<Deployment>,
    store: Store<Deployment>,
    sync_state: CacheSyncState,
    /// Objects seen since the last `Init`, `None` outside of a (re-)list.
    listed: Option<HashSet<ObjectRef<Deployment>>>,
}

impl Default for Mirror {
    fn default() -> Self {
        let writer: Writer<Deployment> = Default::default();
        let store = writer.as_reader();
        Self {
            writer,
            store,
            sync_state: CacheSyncState::new(),
            listed: None,
        }
    }
}

impl Mirror {
    fn apply<H>(&mut self, event: Event<Deployment>, handler: &H)
    where
        H: ResourceEventHandler<Deployment>,
    {
        match &event {
            Event::Apply(obj) => self.notify_applied(obj, handler),
            Event::Delete(obj) => handler.on_delete(obj),
            Event::Init => {
                debug!("listing Deployments");
                self.listed = Some(HashSet::new());
            }
            Event::InitApply(obj) => {
                if let Some(listed) = self.listed.as_mut() {
                    listed.insert(ObjectRef::from_obj(obj));
                }
                self.notify_applied(obj, handler);
            }
            Event::InitDone => {
                let listed = self.listed.take().unwrap_or_default();
                for obj in self.store.state() {
                    if !listed.contains(&ObjectRef::from_obj(obj.as_ref())) {
                        handler.on_delete(obj.as_ref());
                    }
                }
            }
        }
        self.writer.apply_watcher_event(&event);
        if matches!(event, Event::InitDone) && !self.sync_state.has_synced() {
            info!("Deployment cache synced with {} objects", self.store.len());
            self.sync_state.mark_synced();
        }
    }

    fn notify_applied<H>(&self, obj: &Deployment, handler: &H)
    where
        H: ResourceEventHandler<Deployment>,
    {
        match self.store.get(&ObjectRef::from_obj(obj)) {
            Some(old) => handler.on_update(old.as_ref(), obj),
            None => handler.on_add(obj),
        }
    }
}
