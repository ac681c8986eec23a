use crate::state::WorkloadKey;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::PodSpec;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::fmt::Debug;

/// A resource carrying a pod template whose images should be kept warm.
pub trait Workload
where
    Self: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Send
        + Sync
        + DeserializeOwned
        + 'static,
{
    fn kind_name() -> String {
        Self::kind(&()).into_owned()
    }

    fn pod_spec(&self) -> Option<&PodSpec>;

    fn image_pull_secrets(&self) -> Vec<String> {
        self.pod_spec()
            .and_then(|ps| ps.image_pull_secrets.as_ref())
            .map(|secrets| secrets.iter().map(|s| s.name.clone()).collect())
            .unwrap_or_default()
    }

    fn workload_key(&self) -> WorkloadKey {
        WorkloadKey::new(
            Self::kind_name(),
            self.namespace().unwrap_or_default(),
            self.name_any(),
        )
    }
}

impl Workload for Deployment {
    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref().and_then(|s| s.template.spec.as_ref())
    }
}

impl Workload for StatefulSet {
    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref().and_then(|s| s.template.spec.as_ref())
    }
}

impl Workload for DaemonSet {
    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref().and_then(|s| s.template.spec.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use k8s_openapi::api::core::v1::{LocalObjectReference, PodTemplateSpec};
    use kube::api::ObjectMeta;

    #[test]
    fn test_workload_key_includes_kind() {
        let deployment = Deployment {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("shop".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let statefulset = StatefulSet {
            metadata: deployment.metadata.clone(),
            ..Default::default()
        };

        assert_eq!(
            deployment.workload_key(),
            WorkloadKey::new("Deployment", "shop", "web")
        );
        assert_ne!(deployment.workload_key(), statefulset.workload_key());
    }

    #[test]
    fn test_image_pull_secrets() {
        let deployment = Deployment {
            spec: Some(DeploymentSpec {
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        image_pull_secrets: Some(vec![
                            LocalObjectReference {
                                name: "registry-a".to_string(),
                            },
                            LocalObjectReference {
                                name: "registry-b".to_string(),
                            },
                        ]),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        };

        assert_eq!(
            deployment.image_pull_secrets(),
            vec!["registry-a".to_string(), "registry-b".to_string()]
        );
        assert!(Deployment::default().image_pull_secrets().is_empty());
    }
}
