use crate::{
    key::NamespacedName,
    source::{AccessError, ResourceAccessor},
};
use std::{future::Future, time::Duration};

/// Result of a successful reconcile pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Reconcile the object again after `duration`, even if no notification arrives.
    pub fn requeue(duration: Duration) -> Self {
        Self {
            requeue_after: Some(duration),
        }
    }

    /// Do nothing until the next notification for the object.
    pub fn await_change() -> Self {
        Self {
            requeue_after: None,
        }
    }

    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}

/// What the worker loop does with a failed key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Re-queue with rate limiting.
    Retry,
    /// Forget the key, retrying cannot fix the error.
    Drop,
}

/// Idempotent "observe, compare, correct" function invoked once per dequeued key.
pub trait Reconciler: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    fn reconcile(
        &self,
        key: &NamespacedName,
    ) -> impl Future<Output = Result<Action, Self::Error>> + Send;

    fn error_policy(&self, _key: &NamespacedName, _error: &Self::Error) -> ErrorPolicy {
        ErrorPolicy::Retry
    }
}

/// Desired state of an object, expressed as a correction of its current state.
pub trait DriftPolicy<K>: Send + Sync + 'static {
    /// Returns the updated object if `current` drifted from the desired state.
    fn desired(&self, current: &K) -> Option<K>;

    /// Short summary of the observed state, used for logging.
    fn describe(&self, _current: &K) -> Option<String> {
        None
    }
}

impl<K, F> DriftPolicy<K> for F
where
    F: Fn(&K) -> Option<K> + Send + Sync + 'static,
{
    fn desired(&self, current: &K) -> Option<K> {
        self(current)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ReconcileError<E: std::error::Error + 'static> {
    #[error("failed to fetch {key}: {source}")]
    Fetch { key: NamespacedName, source: E },
    /// The object was modified concurrently, the next attempt starts from a fresh copy.
    #[error("conflict while updating {key}: {source}")]
    Conflict { key: NamespacedName, source: E },
    #[error("failed to update {key}: {source}")]
    Update { key: NamespacedName, source: E },
}

/// [`Reconciler`] which drives each object to the state given by a [`DriftPolicy`].
///
/// Every pass fetches the object from the [`ResourceAccessor`], never from the
/// local mirror, and writes at most one update derived from that fresh copy.
/// Deleted objects are not an error, there is nothing left to converge.
pub struct EnsureReconciler<A, P> {
    accessor: A,
    policy: P,
    resync_period: Option<Duration>,
}

impl<A, P> EnsureReconciler<A, P>
where
    A: ResourceAccessor,
    P: DriftPolicy<A::Object>,
{
    pub fn new(accessor: A, policy: P) -> Self {
        Self {
            accessor,
            policy,
            resync_period: None,
        }
    }

    /// Reconcile converged objects again after `period`.
    pub fn resync_period(mut self, period: Option<Duration>) -> Self {
        self.resync_period = period;
        self
    }

    #[cfg(test)]
    pub(crate) fn accessor(&self) -> &A {
        &self.accessor
    }

    fn done(&self) -> Action {
        self.resync_period
            .map(Action::requeue)
            .unwrap_or_else(Action::await_change)
    }
}

impl<A, P> Reconciler for EnsureReconciler<A, P>
where
    A: ResourceAccessor,
    P: DriftPolicy<A::Object>,
{
    type Error = ReconcileError<A::Error>;

    async fn reconcile(&self, key: &NamespacedName) -> Result<Action, Self::Error> {
        let current = match self.accessor.get(key).await {
            Ok(current) => current,
            Err(e) if e.is_not_found() => {
                info!("{} deleted, nothing to reconcile", key);
                return Ok(Action::await_change());
            }
            Err(source) => {
                return Err(ReconcileError::Fetch {
                    key: key.clone(),
                    source,
                });
            }
        };
        if let Some(summary) = self.policy.describe(&current) {
            debug!("observed {}: {}", key, summary);
        }
        let Some(updated) = self.policy.desired(&current) else {
            debug!("{} is in desired state, skipping", key);
            return Ok(self.done());
        };
        match self.accessor.update(&updated).await {
            Ok(updated) => {
                match self.policy.describe(&updated) {
                    Some(summary) => info!("updated {}: {}", key, summary),
                    None => info!("updated {}", key),
                }
                Ok(self.done())
            }
            Err(source) if source.is_conflict() => Err(ReconcileError::Conflict {
                key: key.clone(),
                source,
            }),
            Err(source) => Err(ReconcileError::Update {
                key: key.clone(),
                source,
            }),
        }
    }
}
