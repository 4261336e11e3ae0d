use crate::{MANAGER, errors::ControllerError};
use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    Api, Client, ResourceExt,
    api::PostParams,
    core::{Selector, SelectorExt},
};
use rustrial_k8s_replica_guard_runtime::{NamespacedName, ResourceAccessor};

/// Reads and replaces [`Deployment`]s directly on the API server.
///
/// Updates use `replace`, so the `resourceVersion` of the fetched object acts
/// as precondition and concurrent modifications surface as `409 Conflict`.
#[derive(Clone)]
pub(crate) struct DeploymentAccessor {
    client: Client,
}

impl DeploymentAccessor {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaced_api(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

impl ResourceAccessor for DeploymentAccessor {
    type Object = Deployment;
    type Error = ControllerError;

    async fn get(&self, key: &NamespacedName) -> Result<Deployment, ControllerError> {
        Ok(self
            .namespaced_api(key.namespace())
            .get(key.name())
            .await?)
    }

    async fn update(&self, deployment: &Deployment) -> Result<Deployment, ControllerError> {
        let namespace = deployment.namespace().unwrap_or_default();
        let mut pp = PostParams::default();
        pp.field_manager = Some(MANAGER.to_string());
        Ok(self
            .namespaced_api(namespace.as_str())
            .replace(deployment.name_any().as_str(), &pp, deployment)
            .await?)
    }
}

/// Restricts an accessor to the [`Deployment`]s selected by `selector`.
///
/// The watch only narrows which notifications arrive, an object fetched after
/// its labels changed is reported as not found so it is left alone.
pub(crate) struct LabelScoped<A> {
    inner: A,
    selector: Selector,
}

impl<A> LabelScoped<A> {
    pub fn new(inner: A, selector: Selector) -> Self {
        Self { inner, selector }
    }
}

impl<A> ResourceAccessor for LabelScoped<A>
where
    A: ResourceAccessor<Object = Deployment, Error = ControllerError>,
{
    type Object = Deployment;
    type Error = ControllerError;

    async fn get(&self, key: &NamespacedName) -> Result<Deployment, ControllerError> {
        let deployment = self.inner.get(key).await?;
        if self.selector.matches(deployment.labels()) {
            Ok(deployment)
        } else {
            Err(ControllerError::OutOfScope(key.to_string()))
        }
    }

    async fn update(&self, deployment: &Deployment) -> Result<Deployment, ControllerError> {
        self.inner.update(deployment).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{label_selector::parse_label_selector, replica_policy::MinReplicas};
    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use kube::api::ObjectMeta;
    use rustrial_k8s_replica_guard_runtime::{Action, EnsureReconciler, Reconciler};
    use std::{
        collections::BTreeMap,
        sync::{Arc, Mutex},
    };

    #[derive(Clone, Default)]
    struct InMemory {
        objects: Arc<Mutex<BTreeMap<String, Deployment>>>,
        updates: Arc<Mutex<Vec<String>>>,
    }

    impl InMemory {
        fn with(deployments: impl IntoIterator<Item = Deployment>) -> Self {
            let store = Self::default();
            for d in deployments {
                let key = NamespacedName::from_resource(&d).unwrap().to_string();
                store.objects.lock().unwrap().insert(key, d);
            }
            store
        }
    }

    impl ResourceAccessor for InMemory {
        type Object = Deployment;
        type Error = ControllerError;

        async fn get(&self, key: &NamespacedName) -> Result<Deployment, ControllerError> {
            self.objects
                .lock()
                .unwrap()
                .get(&key.to_string())
                .cloned()
                .ok_or_else(|| ControllerError::Configuration(format!("{} missing", key)))
        }

        async fn update(&self, deployment: &Deployment) -> Result<Deployment, ControllerError> {
            let key = NamespacedName::from_resource(deployment).unwrap().to_string();
            self.updates.lock().unwrap().push(key.clone());
            self.objects
                .lock()
                .unwrap()
                .insert(key, deployment.clone());
            Ok(deployment.clone())
        }
    }

    fn deployment(name: &str, labels: &[(&str, &str)]) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("test".to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn objects_outside_the_selector_are_not_scaled() {
        let store = InMemory::with([
            deployment("web", &[("app", "web")]),
            deployment("relabeled", &[("app", "batch")]),
            deployment("unlabeled", &[]),
        ]);
        let selector = parse_label_selector("app=web").unwrap();
        let reconciler = EnsureReconciler::new(
            LabelScoped::new(store.clone(), selector),
            MinReplicas::new(2),
        );

        for name in ["relabeled", "unlabeled", "web"] {
            let key = NamespacedName::new("test", name).unwrap();
            let action = reconciler.reconcile(&key).await.unwrap();
            assert_eq!(Action::await_change(), action);
        }
        assert_eq!(vec!["test/web".to_string()], *store.updates.lock().unwrap());
    }

    #[tokio::test]
    async fn empty_selector_selects_everything() {
        let store = InMemory::with([deployment("unlabeled", &[])]);
        let scoped = LabelScoped::new(store, Selector::default());
        let key = NamespacedName::new("test", "unlabeled").unwrap();
        assert!(scoped.get(&key).await.is_ok());
    }
}
