#[macro_use]
extern crate log;

use deployment_accessor::{DeploymentAccessor, LabelScoped};
use deployment_informer::DeploymentInformer;
use errors::ControllerError;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{Api, Client, core::Selector};
use label_selector::parse_label_selector;
use kube_runtime::watcher;
use metrics::InstrumentedReconciler;
use opentelemetry::global;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus_exporter::start_prometheus_metrics_server;
use replica_policy::MinReplicas;
use rustrial_k8s_replica_guard_runtime::{
    BucketRateLimiter, Controller, ControllerConfig, EnsureReconciler,
    ExponentialFailureRateLimiter, MaxOfRateLimiter, NamespacedName,
};
use std::{net::SocketAddr, str::FromStr, time::Duration};

mod deployment_accessor;
mod deployment_informer;
mod errors;
mod label_selector;
mod metrics;
mod prometheus_exporter;
mod replica_policy;

/// The K8s field manager name.
const MANAGER: &str = "rustrial-replica-guard";

/// One year.
const MAX_PERIOD_SECS: u64 = 365 * 24 * 3600;

#[derive(Clone, Debug)]
struct Configuration {
    watch_namespace: Option<String>,
    label_selector: Selector,
    min_replicas: i32,
    controller: ControllerConfig,
    resync_period: Option<Duration>,
    retry_base_delay: Duration,
    retry_max_delay: Duration,
    metrics_addr: SocketAddr,
}

impl Configuration {
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(env_var)
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        fn parse<T: FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            name: &str,
        ) -> Result<Option<T>, ControllerError>
        where
            T::Err: std::fmt::Display,
        {
            lookup(name)
                .map(|v| {
                    v.parse::<T>().map_err(|e| {
                        ControllerError::Configuration(format!("{}={:?}: {}", name, v, e))
                    })
                })
                .transpose()
        }

        let watch_namespace = lookup("WATCH_NAMESPACE").filter(|ns| ns != "*");
        let min_replicas = parse::<i32>(&lookup, "MIN_REPLICAS")?.unwrap_or(2);
        if min_replicas < 0 {
            return Err(ControllerError::Configuration(format!(
                "MIN_REPLICAS must not be negative, got {}",
                min_replicas
            )));
        }
        // Upper bound of all configured periods and delays.
        let max_period = Duration::from_secs(MAX_PERIOD_SECS);
        let duration = |name: &str,
                        unit: fn(u64) -> Duration|
         -> Result<Option<Duration>, ControllerError> {
            match parse::<u64>(&lookup, name)?.map(unit) {
                Some(d) if d > max_period => Err(ControllerError::Configuration(format!(
                    "{} must not exceed {:?}, got {:?}",
                    name, max_period, d
                ))),
                d => Ok(d),
            }
        };

        let defaults = ControllerConfig::default();
        let workers = parse::<usize>(&lookup, "WORKERS")?.unwrap_or(defaults.workers);
        if workers == 0 {
            return Err(ControllerError::Configuration(
                "WORKERS must be at least 1".to_string(),
            ));
        }
        let controller = defaults
            .clone()
            .workers(workers)
            .cache_sync_timeout(
                duration("CACHE_SYNC_TIMEOUT_SECS", Duration::from_secs)?
                    .unwrap_or(defaults.cache_sync_timeout),
            )
            .drain_timeout(
                duration("DRAIN_TIMEOUT_SECS", Duration::from_secs)?
                    .unwrap_or(defaults.drain_timeout),
            );
        let retry_base_delay = duration("RETRY_BASE_DELAY_MS", Duration::from_millis)?
            .unwrap_or(Duration::from_millis(5));
        let retry_max_delay = duration("RETRY_MAX_DELAY_SECS", Duration::from_secs)?
            .unwrap_or(Duration::from_secs(1000));
        if retry_base_delay > retry_max_delay {
            return Err(ControllerError::Configuration(format!(
                "RETRY_BASE_DELAY_MS ({:?}) must not exceed RETRY_MAX_DELAY_SECS ({:?})",
                retry_base_delay, retry_max_delay
            )));
        }
        let label_selector = lookup("WATCH_LABEL_SELECTOR")
            .map(|selector| parse_label_selector(selector.as_str()))
            .transpose()?
            .unwrap_or_default();
        let metrics_addr = lookup("METRICS_LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0".to_string());
        let metrics_port = lookup("METRICS_LISTEN_PORT").unwrap_or_else(|| "9000".to_string());
        let metrics_addr = format!("{}:{}", metrics_addr, metrics_port)
            .parse()
            .map_err(|e| {
                ControllerError::Configuration(format!("invalid metrics listen address: {}", e))
            })?;
        Ok(Configuration {
            watch_namespace,
            label_selector,
            min_replicas,
            controller,
            resync_period: duration("RESYNC_PERIOD_SECS", Duration::from_secs)?
                .filter(|period| !period.is_zero()),
            retry_base_delay,
            retry_max_delay,
            metrics_addr,
        })
    }

    fn deployments(&self, client: Client) -> Api<Deployment> {
        match &self.watch_namespace {
            Some(ns) => {
                info!("Controller is only watching Deployments in namespace {}", ns);
                Api::namespaced(client, ns.as_str())
            }
            None => {
                info!("Controller is watching Deployments in all namespaces");
                Api::all(client)
            }
        }
    }

    fn watcher_config(&self) -> watcher::Config {
        if self.label_selector.selects_all() {
            watcher::Config::default()
        } else {
            info!("Controller is only watching Deployments matching {}", self.label_selector);
            watcher::Config::default().labels(self.label_selector.to_string().as_str())
        }
    }

    fn rate_limiter(&self) -> MaxOfRateLimiter<NamespacedName> {
        MaxOfRateLimiter::new(vec![
            Box::new(ExponentialFailureRateLimiter::new(
                self.retry_base_delay,
                self.retry_max_delay,
            )),
            Box::new(BucketRateLimiter::default()),
        ])
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await
        }
    };
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = interrupt => info!("received SIGINT, shutting down ..."),
        _ = terminate => info!("received SIGTERM, shutting down ..."),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        debug!("rustls crypto provider already installed");
    }
    let configuration = Configuration::from_env()?;
    debug!("{:?}", configuration);

    let registry = prometheus::Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()?;
    let meter_provider = SdkMeterProvider::builder().with_reader(exporter).build();
    global::set_meter_provider(meter_provider.clone());
    let metrics_server = start_prometheus_metrics_server(configuration.metrics_addr, registry);

    let client = Client::try_default().await?;
    let informer = DeploymentInformer::new(
        configuration.deployments(client.clone()),
        configuration.watcher_config(),
    );
    let reconciler = InstrumentedReconciler::new(
        EnsureReconciler::new(
            LabelScoped::new(
                DeploymentAccessor::new(client),
                configuration.label_selector.clone(),
            ),
            MinReplicas::new(configuration.min_replicas),
        )
        .resync_period(configuration.resync_period),
    );
    let controller = Controller::with_rate_limiter(
        informer,
        reconciler,
        configuration.controller.clone(),
        configuration.rate_limiter(),
    );
    info!(
        "start controller ensuring at least {} replicas per Deployment ...",
        configuration.min_replicas
    );
    tokio::select! {
        result = controller.run(shutdown_signal()) => result?,
        result = metrics_server => result?,
    };
    meter_provider.shutdown()?;
    info!("controller stopped");
    Ok(())
}
