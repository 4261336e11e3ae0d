//! Level triggered reconcile loop: a watch source feeds object keys into a
//! deduplicating, rate limited work queue drained by a pool of workers.

#[macro_use]
extern crate log;

mod controller;
mod handler;
mod key;
mod queue;
mod rate_limiter;
mod reconcile;
mod source;

pub use controller::{Controller, ControllerConfig, ControllerState, Error};
pub use handler::{EnqueueHandler, ResourceEventHandler};
pub use key::{KeyError, NamespacedName};
pub use queue::WorkQueue;
pub use rate_limiter::{
    BucketRateLimiter, ExponentialFailureRateLimiter, MaxOfRateLimiter, RateLimiter,
    default_controller_rate_limiter,
};
pub use reconcile::{Action, DriftPolicy, EnsureReconciler, ErrorPolicy, ReconcileError, Reconciler};
pub use source::{AccessError, CacheSyncState, ResourceAccessor, WatchSource};
