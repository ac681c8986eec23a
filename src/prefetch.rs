use crate::config::Prefetch;
use crate::state::DesiredState;
use anyhow::Context;
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, LocalObjectReference, PodSpec, PodTemplateSpec,
    ResourceRequirements, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{ObjectMeta, Patch, PatchParams, PostParams};
use kube::{Api, Client};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info};

static PREFETCH_FIELD_MANAGER: &str = "kube-image-prefetch";
static SHARE_VOLUME: &str = "share";
static SHARE_MOUNT_PATH: &str = "/mount";
/// Where the init container copies the binary, and what the pullers execute.
pub static SHARED_BINARY_PATH: &str = "/mount/sleep";
static CONTAINERS_PATH: &str = "/spec/template/spec/containers";
static PULL_SECRETS_PATH: &str = "/spec/template/spec/imagePullSecrets";

/// Receives every recomputed desired state.
pub trait PrefetchSink: Send + Sync {
    fn sync(&self, desired: &DesiredState) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// The managed DaemonSet whose containers pull every wanted image.
pub struct PrefetchSet {
    api: Api<DaemonSet>,
    name: String,
    image: String,
}

impl PrefetchSet {
    pub fn new(client: Client, config: &Prefetch) -> Self {
        Self {
            api: Api::namespaced(client, &config.namespace),
            name: config.name.clone(),
            image: config.image.clone(),
        }
    }

    /// Creates the DaemonSet unless it already exists. An existing one is left
    /// untouched, the first sync replaces its containers.
    pub async fn ensure_exists(&self) -> anyhow::Result<()> {
        let existing = self
            .api
            .get_opt(&self.name)
            .await
            .with_context(|| format!("Failed to look up DaemonSet {}", self.name))?;
        if existing.is_some() {
            info!("Found existing prefetch DaemonSet {}", self.name);
            return Ok(());
        }

        info!("Creating prefetch DaemonSet {}", self.name);
        self.api
            .create(&PostParams::default(), &build_daemonset(&self.name, &self.image))
            .await
            .with_context(|| format!("Failed to create DaemonSet {}", self.name))?;
        Ok(())
    }
}

impl PrefetchSink for PrefetchSet {
    async fn sync(&self, desired: &DesiredState) -> anyhow::Result<()> {
        let document = generate_patch(desired);
        debug!("Patching DaemonSet {} with patch {}", self.name, document);
        let patch: json_patch::Patch =
            serde_json::from_value(document).context("Failed to build JSON patch")?;

        let params = PatchParams {
            field_manager: Some(PREFETCH_FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        self.api
            .patch(&self.name, &params, &Patch::Json::<()>(patch))
            .await
            .with_context(|| format!("Failed to patch DaemonSet {}", self.name))?;

        info!(
            "Prefetch DaemonSet {} now pulls {} images",
            self.name,
            desired.images.len()
        );
        Ok(())
    }
}

fn labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), name.to_string())])
}

fn share_mount() -> VolumeMount {
    VolumeMount {
        name: SHARE_VOLUME.to_string(),
        mount_path: SHARE_MOUNT_PATH.to_string(),
        ..Default::default()
    }
}

/// The initial DaemonSet: an init container that copies this binary onto the
/// shared volume and no pullers yet.
///
/// The API server rejects a pod template without containers. Clusters that
/// hit this can add a placeholder container running `/mount/sleep sleep`,
/// which the first sync replaces along with the rest of the list.
pub fn build_daemonset(name: &str, image: &str) -> DaemonSet {
    let labels = labels(name);
    DaemonSet {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    init_containers: Some(vec![Container {
                        name: "init".to_string(),
                        image: Some(image.to_string()),
                        image_pull_policy: Some("Always".to_string()),
                        args: Some(vec![
                            "copy".to_string(),
                            "--dest".to_string(),
                            SHARED_BINARY_PATH.to_string(),
                        ]),
                        volume_mounts: Some(vec![share_mount()]),
                        ..Default::default()
                    }]),
                    containers: Vec::new(),
                    image_pull_secrets: Some(Vec::new()),
                    volumes: Some(vec![Volume {
                        name: SHARE_VOLUME.to_string(),
                        empty_dir: Some(EmptyDirVolumeSource::default()),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// A container that only exists to make the node pull `image`, then idles.
pub fn build_prefetch_container(image: &str, index: usize) -> Container {
    Container {
        name: format!("prefetch-{}", index),
        image: Some(image.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec![SHARED_BINARY_PATH.to_string()]),
        args: Some(vec!["sleep".to_string()]),
        volume_mounts: Some(vec![share_mount()]),
        resources: Some(ResourceRequirements {
            limits: Some(BTreeMap::from([
                ("cpu".to_string(), Quantity("1m".to_string())),
                ("memory".to_string(), Quantity("10M".to_string())),
            ])),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Two replace operations carrying the complete container and pull secret lists.
pub fn generate_patch(desired: &DesiredState) -> serde_json::Value {
    let containers: Vec<Container> = desired
        .images
        .iter()
        .enumerate()
        .map(|(index, image)| build_prefetch_container(image, index))
        .collect();
    let pull_secrets: Vec<LocalObjectReference> = desired
        .pull_secrets
        .iter()
        .map(|name| LocalObjectReference { name: name.clone() })
        .collect();

    json!([
        {
            "op": "replace",
            "path": CONTAINERS_PATH,
            "value": containers,
        },
        {
            "op": "replace",
            "path": PULL_SECRETS_PATH,
            "value": pull_secrets,
        }
    ])
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    /// Records every desired state it is asked to sync.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingSink {
        synced: Arc<Mutex<Vec<DesiredState>>>,
        fail_next: Arc<AtomicBool>,
    }

    impl RecordingSink {
        pub(crate) fn calls(&self) -> usize {
            self.synced.lock().unwrap().len()
        }

        pub(crate) fn last(&self) -> DesiredState {
            self.synced.lock().unwrap().last().cloned().expect("no sync yet")
        }

        pub(crate) fn fail_next(&self) {
            self.fail_next.store(true, Ordering::SeqCst);
        }
    }

    impl PrefetchSink for RecordingSink {
        async fn sync(&self, desired: &DesiredState) -> anyhow::Result<()> {
            self.synced.lock().unwrap().push(desired.clone());
            if self.fail_next.swap(false, Ordering::SeqCst) {
                anyhow::bail!("conflict");
            }
            Ok(())
        }
    }

    #[test]
    fn test_fresh_daemonset_has_no_pullers() {
        let ds = build_daemonset("kube-image-prefetch", "prefetch:latest");
        let spec = ds.spec.expect("spec");
        let pod_spec = spec.template.spec.expect("pod spec");

        assert!(pod_spec.containers.is_empty());
        let init = pod_spec.init_containers.expect("init containers");
        assert_eq!(init.len(), 1);
        assert_eq!(init[0].image.as_deref(), Some("prefetch:latest"));
        assert_eq!(
            init[0].args,
            Some(vec![
                "copy".to_string(),
                "--dest".to_string(),
                "/mount/sleep".to_string()
            ])
        );
        let volumes = pod_spec.volumes.expect("volumes");
        assert_eq!(volumes[0].name, "share");
        assert!(volumes[0].empty_dir.is_some());
    }

    #[test]
    fn test_selector_matches_template_labels() {
        let ds = build_daemonset("kube-image-prefetch", "prefetch:latest");
        let spec = ds.spec.expect("spec");

        assert_eq!(
            spec.selector.match_labels,
            spec.template.metadata.and_then(|m| m.labels)
        );
        assert_eq!(ds.metadata.labels, spec.selector.match_labels);
    }

    #[test]
    fn test_prefetch_container() {
        let container = build_prefetch_container("web:1", 3);

        assert_eq!(container.name, "prefetch-3");
        assert_eq!(container.image.as_deref(), Some("web:1"));
        assert_eq!(container.image_pull_policy.as_deref(), Some("IfNotPresent"));
        assert_eq!(container.command, Some(vec!["/mount/sleep".to_string()]));
        assert_eq!(container.args, Some(vec!["sleep".to_string()]));
        let mounts = container.volume_mounts.expect("mounts");
        assert_eq!(mounts[0].mount_path, "/mount");
        let limits = container.resources.and_then(|r| r.limits).expect("limits");
        assert_eq!(limits["cpu"], Quantity("1m".to_string()));
        assert_eq!(limits["memory"], Quantity("10M".to_string()));
    }

    #[test]
    fn test_patch_replaces_both_lists() {
        let desired = DesiredState {
            images: vec!["web:1".to_string(), "db:2".to_string()],
            pull_secrets: vec!["registry".to_string()],
        };
        let patch = generate_patch(&desired);
        let ops = patch.as_array().expect("array");

        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0]["op"], "replace");
        assert_eq!(ops[0]["path"], "/spec/template/spec/containers");
        assert_eq!(ops[0]["value"][0]["name"], "prefetch-0");
        assert_eq!(ops[0]["value"][1]["image"], "db:2");
        assert_eq!(ops[0]["value"][1]["imagePullPolicy"], "IfNotPresent");
        assert_eq!(ops[1]["op"], "replace");
        assert_eq!(ops[1]["path"], "/spec/template/spec/imagePullSecrets");
        assert_eq!(ops[1]["value"], json!([{ "name": "registry" }]));

        serde_json::from_value::<json_patch::Patch>(patch).expect("valid JSON patch");
    }

    #[test]
    fn test_empty_desired_state_clears_lists() {
        let patch = generate_patch(&DesiredState::default());

        assert_eq!(patch[0]["value"], json!([]));
        assert_eq!(patch[1]["value"], json!([]));
    }
}
