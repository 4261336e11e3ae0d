use k8s_openapi::api::apps::v1::Deployment;
use rustrial_k8s_replica_guard_runtime::DriftPolicy;

/// Ensures every [`Deployment`] asks for at least `minimum` replicas.
#[derive(Clone, Debug)]
pub(crate) struct MinReplicas {
    minimum: i32,
}

impl MinReplicas {
    pub fn new(minimum: i32) -> Self {
        Self { minimum }
    }
}

/// An unset `spec.replicas` counts as zero.
fn replicas(deployment: &Deployment) -> i32 {
    deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .unwrap_or(0)
}

impl DriftPolicy<Deployment> for MinReplicas {
    fn desired(&self, current: &Deployment) -> Option<Deployment> {
        if replicas(current) >= self.minimum {
            return None;
        }
        let mut updated = current.clone();
        updated.spec.get_or_insert_with(Default::default).replicas = Some(self.minimum);
        Some(updated)
    }

    fn describe(&self, current: &Deployment) -> Option<String> {
        Some(format!("replicas={}", replicas(current)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use kube::api::ObjectMeta;

    fn deployment(replicas: Option<i32>) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("test".to_string()),
                resource_version: Some("42".to_string()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn scales_up_to_minimum() {
        let policy = MinReplicas::new(2);
        let current = deployment(Some(0));
        let updated = policy.desired(&current).unwrap();
        assert_eq!(Some(2), updated.spec.as_ref().unwrap().replicas);
        // The fetched object is left alone and the update keeps its precondition.
        assert_eq!(Some(0), current.spec.as_ref().unwrap().replicas);
        assert_eq!(current.metadata, updated.metadata);
    }

    #[test]
    fn unset_replicas_count_as_zero() {
        let policy = MinReplicas::new(2);
        let updated = policy.desired(&deployment(None)).unwrap();
        assert_eq!(Some(2), updated.spec.unwrap().replicas);
        assert_eq!(Some("replicas=0".to_string()), policy.describe(&deployment(None)));
    }

    #[test]
    fn leaves_converged_deployments_alone() {
        let policy = MinReplicas::new(2);
        assert!(policy.desired(&deployment(Some(2))).is_none());
        assert!(policy.desired(&deployment(Some(7))).is_none());
        // Applying the policy to its own result is a no-op.
        let updated = policy.desired(&deployment(Some(1))).unwrap();
        assert!(policy.desired(&updated).is_none());
    }
}
