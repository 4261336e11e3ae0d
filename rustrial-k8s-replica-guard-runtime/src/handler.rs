use crate::{key::NamespacedName, queue::WorkQueue};
use kube::Resource;

/// Callbacks fired by a [`WatchSource`](crate::WatchSource) for every change
/// of the local mirror. Implementations must not block.
pub trait ResourceEventHandler<K>: Send + Sync {
    fn on_add(&self, obj: &K);
    fn on_update(&self, old: &K, new: &K);
    /// Called with the last known state of the deleted object.
    fn on_delete(&self, obj: &K);
}

/// Turns notifications into work queue items.
///
/// Only the identity of the notified object is queued, the payload is
/// dropped. The reconciler always reads the latest state, so any number of
/// notifications for the same object collapse into a single reconcile pass.
#[derive(Clone)]
pub struct EnqueueHandler {
    queue: WorkQueue<NamespacedName>,
}

impl EnqueueHandler {
    pub fn new(queue: WorkQueue<NamespacedName>) -> Self {
        Self { queue }
    }

    fn enqueue<K: Resource>(&self, event: &str, obj: &K) {
        match NamespacedName::from_resource(obj) {
            Ok(key) => {
                trace!("{} notification for {}", event, key);
                self.queue.add(key);
            }
            Err(e) => error!("dropping {} notification: {}", event, e),
        }
    }
}

impl<K: Resource> ResourceEventHandler<K> for EnqueueHandler {
    fn on_add(&self, obj: &K) {
        self.enqueue("add", obj)
    }

    fn on_update(&self, _old: &K, new: &K) {
        self.enqueue("update", new)
    }

    fn on_delete(&self, obj: &K) {
        self.enqueue("delete", obj)
    }
}
