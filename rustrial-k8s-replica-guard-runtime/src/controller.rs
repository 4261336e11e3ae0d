use crate::{
    handler::EnqueueHandler,
    key::NamespacedName,
    queue::WorkQueue,
    rate_limiter::RateLimiter,
    reconcile::{ErrorPolicy, Reconciler},
    source::{CacheSyncState, WatchSource},
};
use futures::FutureExt;
use kube::Resource;
use std::{
    any::Any, future::Future, panic::AssertUnwindSafe, pin::pin, sync::Arc, time::Duration,
};
use tokio::{sync::watch, task::JoinSet, time::timeout};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("timed out after {0:?} waiting for cache to sync")]
    CacheSyncTimeout(Duration),
    #[error("cancelled while waiting for cache to sync")]
    CacheSyncCancelled,
    #[error("watch source stopped before cache was synced")]
    WatchSourceStopped,
    #[error("controller needs at least one worker")]
    NoWorkers,
}

/// Lifecycle of a [`Controller`], observable through [`Controller::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControllerState {
    NotStarted,
    SyncingCache,
    Running,
    Draining,
    Stopped,
}

#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Number of concurrent worker loops.
    pub workers: usize,
    /// Startup fails if the cache did not sync within this time.
    pub cache_sync_timeout: Duration,
    pub cache_sync_poll_interval: Duration,
    /// On shutdown, workers still busy after this time are aborted.
    pub drain_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            cache_sync_timeout: Duration::from_secs(60),
            cache_sync_poll_interval: Duration::from_millis(100),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl ControllerConfig {
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn cache_sync_timeout(mut self, timeout: Duration) -> Self {
        self.cache_sync_timeout = timeout;
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }
}

/// Wires a [`WatchSource`], a [`WorkQueue`] and a pool of workers running a
/// [`Reconciler`].
pub struct Controller<S, R> {
    source: S,
    reconciler: Arc<R>,
    queue: WorkQueue<NamespacedName>,
    config: ControllerConfig,
    state: watch::Sender<ControllerState>,
}

impl<S, R> Controller<S, R>
where
    S: WatchSource,
    S::Object: Resource,
    R: Reconciler,
{
    pub fn new(source: S, reconciler: R, config: ControllerConfig) -> Self {
        Self::with_queue(source, reconciler, config, WorkQueue::new())
    }

    pub fn with_rate_limiter(
        source: S,
        reconciler: R,
        config: ControllerConfig,
        rate_limiter: impl RateLimiter<NamespacedName> + 'static,
    ) -> Self {
        Self::with_queue(
            source,
            reconciler,
            config,
            WorkQueue::with_rate_limiter(rate_limiter),
        )
    }

    fn with_queue(
        source: S,
        reconciler: R,
        config: ControllerConfig,
        queue: WorkQueue<NamespacedName>,
    ) -> Self {
        let (state, _) = watch::channel(ControllerState::NotStarted);
        Self {
            source,
            reconciler: Arc::new(reconciler),
            queue,
            config,
            state,
        }
    }

    pub fn queue(&self) -> WorkQueue<NamespacedName> {
        self.queue.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ControllerState> {
        self.state.subscribe()
    }

    /// Run until `shutdown` resolves.
    ///
    /// Workers are only started once the watch source reports a synced cache.
    /// Returns an error if the cache does not sync, `Ok(())` after a clean
    /// shutdown.
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send) -> Result<(), Error> {
        let Self {
            source,
            reconciler,
            queue,
            config,
            state,
        } = self;
        if config.workers == 0 {
            return Err(Error::NoWorkers);
        }
        let mut shutdown = pin!(shutdown);

        state.send_replace(ControllerState::SyncingCache);
        let sync_state = source.sync_state();
        let mut watch = tokio::spawn(source.run(EnqueueHandler::new(queue.clone())));
        info!("waiting for cache to sync");
        let synced = tokio::select! {
            synced = wait_for_cache_sync(&sync_state, &config) => synced,
            _ = &mut watch => Err(Error::WatchSourceStopped),
            _ = &mut shutdown => Err(Error::CacheSyncCancelled),
        };
        if let Err(e) = synced {
            error!("failed to start controller: {}", e);
            watch.abort();
            queue.shut_down();
            state.send_replace(ControllerState::Stopped);
            return Err(e);
        }

        info!("cache synced, starting {} workers", config.workers);
        state.send_replace(ControllerState::Running);
        let mut workers = JoinSet::new();
        for id in 0..config.workers {
            workers.spawn(worker(id, queue.clone(), reconciler.clone()));
        }
        let mut watch_running = true;
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested, draining work queue");
                    break;
                }
                result = &mut watch, if watch_running => {
                    watch_running = false;
                    match result {
                        Err(e) if e.is_panic() => error!("watch source panicked: {}", e),
                        _ => warn!("watch source stopped, no further notifications are processed"),
                    }
                }
                Some(result) = workers.join_next() => {
                    log_worker_exit(result);
                    if workers.is_empty() {
                        warn!("all workers stopped before shutdown was requested");
                        break;
                    }
                }
            }
        }

        state.send_replace(ControllerState::Draining);
        watch.abort();
        queue.shut_down();
        let drained = timeout(config.drain_timeout, async {
            while let Some(result) = workers.join_next().await {
                log_worker_exit(result);
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                "{} workers still busy after {:?}, aborting them",
                workers.len(),
                config.drain_timeout
            );
            workers.abort_all();
            while workers.join_next().await.is_some() {}
        }
        state.send_replace(ControllerState::Stopped);
        info!("controller stopped");
        Ok(())
    }
}

async fn wait_for_cache_sync(
    sync_state: &CacheSyncState,
    config: &ControllerConfig,
) -> Result<(), Error> {
    let poll_interval = config
        .cache_sync_poll_interval
        .max(Duration::from_millis(1));
    let poll = async {
        let mut interval = tokio::time::interval(poll_interval);
        loop {
            interval.tick().await;
            if sync_state.has_synced() {
                return;
            }
        }
    };
    timeout(config.cache_sync_timeout, poll)
        .await
        .map_err(|_| Error::CacheSyncTimeout(config.cache_sync_timeout))
}

fn log_worker_exit(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!("worker panicked: {}", e);
        }
    }
}

async fn worker<R: Reconciler>(id: usize, queue: WorkQueue<NamespacedName>, reconciler: Arc<R>) {
    debug!("worker {} started", id);
    while process_next_item(&queue, reconciler.as_ref()).await {}
    debug!("worker {} stopped", id);
}

/// Releases the key on every exit path, including cancellation of the
/// reconcile future and panics.
struct DoneGuard<'a> {
    queue: &'a WorkQueue<NamespacedName>,
    key: NamespacedName,
}

impl Drop for DoneGuard<'_> {
    fn drop(&mut self) {
        self.queue.done(&self.key);
    }
}

/// Take one key from the queue and reconcile it. Returns `false` once the
/// queue is shut down.
pub(crate) async fn process_next_item<R: Reconciler>(
    queue: &WorkQueue<NamespacedName>,
    reconciler: &R,
) -> bool {
    let Some(key) = queue.get().await else {
        return false;
    };
    let guard = DoneGuard {
        queue,
        key: key.clone(),
    };
    let result = AssertUnwindSafe(reconciler.reconcile(&key))
        .catch_unwind()
        .await;
    drop(guard);

    match result {
        Ok(Ok(action)) => {
            queue.forget(&key);
            match action.requeue_after() {
                Some(delay) => {
                    debug!("reconciled {}, requeue in {:?}", key, delay);
                    queue.add_after(key, delay);
                }
                None => debug!("reconciled {}", key),
            }
        }
        Ok(Err(e)) => match reconciler.error_policy(&key, &e) {
            ErrorPolicy::Retry => retry(queue, key, &e),
            ErrorPolicy::Drop => {
                queue.forget(&key);
                error!("dropping {} after non-retryable error: {}", key, e);
            }
        },
        Err(panic) => retry(queue, key, &PanicMessage(panic)),
    }
    true
}

fn retry(queue: &WorkQueue<NamespacedName>, key: NamespacedName, error: &dyn std::fmt::Display) {
    let attempt = queue.num_requeues(&key) + 1;
    let display = key.to_string();
    match queue.add_rate_limited(key) {
        Some(delay) => error!(
            "error reconciling {} (attempt {}), retrying in {:?}: {}",
            display, attempt, delay, error
        ),
        None => error!(
            "error reconciling {}, not retried as queue is shutting down: {}",
            display, error
        ),
    }
}

struct PanicMessage(Box<dyn Any + Send>);

impl std::fmt::Display for PanicMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let message = self
            .0
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| self.0.downcast_ref::<String>().map(|s| s.as_str()))
            .unwrap_or("unknown panic");
        write!(f, "reconcile panicked: {}", message)
    }
}
