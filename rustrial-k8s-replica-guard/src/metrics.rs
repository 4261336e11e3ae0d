use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram, Meter},
};
use rustrial_k8s_replica_guard_runtime::{Action, ErrorPolicy, NamespacedName, Reconciler};
use std::time::Instant;

const REPLICA_CONTROLLER: &str = "replica_controller";

pub(crate) fn metric_name(name: &str) -> String {
    format!("replica_guard_{}", name)
}

/// Records invocation count, error count and duration of every reconcile pass.
pub(crate) struct InstrumentedReconciler<R> {
    inner: R,
    reconcile_count: Counter<u64>,
    reconcile_errors: Counter<u64>,
    reconcile_duration: Histogram<u64>,
}

impl<R: Reconciler> InstrumentedReconciler<R> {
    pub fn new(inner: R) -> Self {
        let meter: Meter = global::meter(REPLICA_CONTROLLER);
        let reconcile_count = meter
            .u64_counter(metric_name("reconcile_count"))
            .with_description("Count of Deployment reconcile invocations")
            .build();
        let reconcile_errors = meter
            .u64_counter(metric_name("reconcile_errors"))
            .with_description("Count of failed Deployment reconcile invocations")
            .build();
        let reconcile_duration = meter
            .u64_histogram(metric_name("reconcile_duration_ms"))
            .with_description("Reconcile duration of Deployments in milliseconds")
            .with_unit("ms")
            .build();
        Self {
            inner,
            reconcile_count,
            reconcile_errors,
            reconcile_duration,
        }
    }
}

impl<R: Reconciler> Reconciler for InstrumentedReconciler<R> {
    type Error = R::Error;

    async fn reconcile(&self, key: &NamespacedName) -> Result<Action, R::Error> {
        let start = Instant::now();
        let result = self.inner.reconcile(key).await;
        let labels = [KeyValue::new("namespace", key.namespace().to_string())];
        self.reconcile_count.add(1, &labels);
        self.reconcile_duration
            .record(start.elapsed().as_millis() as u64, &labels);
        if result.is_err() {
            self.reconcile_errors.add(1, &labels);
        }
        result
    }

    fn error_policy(&self, key: &NamespacedName, error: &R::Error) -> ErrorPolicy {
        self.inner.error_policy(key, error)
    }
}
