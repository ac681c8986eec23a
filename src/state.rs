use crate::config::Config;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

#[derive(Clone)]
pub struct ControllerContext {
    pub(crate) kube_client: kube::Client,
    pub(crate) config: Config,
}

/// Identity of a source workload. The kind is part of the key so that a
/// Deployment and a StatefulSet sharing a name never overwrite each other.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkloadKey {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl WorkloadKey {
    pub fn new(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for WorkloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Created,
    Updated,
    Deleted,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Created => write!(f, "created"),
            Action::Updated => write!(f, "updated"),
            Action::Deleted => write!(f, "deleted"),
        }
    }
}

/// A change notification for a single workload. Processing an event only
/// reads the cache and republishes the workload's images, so redelivery is
/// harmless.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub key: WorkloadKey,
    pub action: Action,
}

impl Event {
    pub fn new(key: WorkloadKey, action: Action) -> Self {
        Self { key, action }
    }
}

/// The images and pull secrets one workload contributes.
///
/// `images` is `None` for a tombstone, which is different from a workload that
/// exists but contributes no images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSet {
    pub key: WorkloadKey,
    pub images: Option<Vec<String>>,
    pub pull_secrets: Vec<String>,
}

impl ImageSet {
    pub fn new(key: WorkloadKey, images: Vec<String>, pull_secrets: Vec<String>) -> Self {
        Self {
            key,
            images: Some(images),
            pull_secrets,
        }
    }

    pub fn tombstone(key: WorkloadKey) -> Self {
        Self {
            key,
            images: None,
            pull_secrets: Vec::new(),
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.images.is_none()
    }
}

/// What the managed DaemonSet should contain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredState {
    pub images: Vec<String>,
    pub pull_secrets: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub workloads: usize,
    pub images: usize,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}
