use crate::prefetch::PrefetchSink;
use crate::state::{DesiredState, ImageSet, SyncStatus, WorkloadKey};
use chrono::Utc;
use std::collections::{BTreeMap, HashSet};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

/// Sole owner of the per-workload image sets. Every message is applied and
/// synced before the next one is received.
pub struct Aggregator<S> {
    workloads: BTreeMap<WorkloadKey, ImageSet>,
    sink: S,
    status: watch::Sender<SyncStatus>,
}

impl<S: PrefetchSink> Aggregator<S> {
    pub fn new(sink: S, status: watch::Sender<SyncStatus>) -> Self {
        Self {
            workloads: BTreeMap::new(),
            sink,
            status,
        }
    }

    pub async fn run(mut self, mut image_sets: mpsc::Receiver<ImageSet>) {
        info!("Aggregator started");
        while let Some(image_set) = image_sets.recv().await {
            self.handle(image_set).await;
        }
        info!("Aggregator stopped, all reconcilers are gone");
    }

    /// Applies one image set and pushes the resulting desired state.
    pub async fn handle(&mut self, image_set: ImageSet) {
        let desired = self.apply(image_set);
        let result = self.sink.sync(&desired).await;

        let workloads = self.workloads.len();
        self.status.send_modify(|status| {
            status.workloads = workloads;
            status.images = desired.images.len();
            match &result {
                Ok(()) => {
                    status.last_synced_at = Some(Utc::now());
                    status.last_error = None;
                }
                Err(e) => status.last_error = Some(format!("{:#}", e)),
            }
        });

        // Not retried here, the next event resends the complete state.
        if let Err(e) = result {
            error!("Failed to sync prefetch images: {:?}", e);
        }
    }

    pub fn apply(&mut self, image_set: ImageSet) -> DesiredState {
        if image_set.is_tombstone() {
            debug!("Removing images of {}", image_set.key);
            self.workloads.remove(&image_set.key);
        } else {
            debug!("Updating images of {}", image_set.key);
            self.workloads.insert(image_set.key.clone(), image_set);
        }
        self.desired()
    }

    /// Deduplicated images in first-seen order. Pull secrets are concatenated
    /// as they are, duplicates included.
    pub fn desired(&self) -> DesiredState {
        let mut seen = HashSet::new();
        let mut desired = DesiredState::default();
        for image_set in self.workloads.values() {
            for image in image_set.images.iter().flatten() {
                if seen.insert(image.as_str()) {
                    desired.images.push(image.clone());
                }
            }
            desired
                .pull_secrets
                .extend(image_set.pull_secrets.iter().cloned());
        }
        desired
    }
}
