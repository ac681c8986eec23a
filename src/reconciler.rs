use crate::images::get_images;
use crate::queue::WorkQueue;
use crate::state::{Action, Event, ImageSet, WorkloadKey};
use crate::watcher::ObjectCache;
use crate::workload::Workload;
use std::marker::PhantomData;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("{0} is not in the local cache")]
    NotInCache(WorkloadKey),

    #[error("aggregator is no longer receiving image sets")]
    AggregatorClosed,
}

/// Drains the queue and publishes the images of each changed workload.
pub struct Worker<K, C> {
    queue: WorkQueue<Event>,
    cache: C,
    image_sets: mpsc::Sender<ImageSet>,
    /// The managed DaemonSet, which must never contribute its own pullers.
    ignored: Option<WorkloadKey>,
    _kind: PhantomData<fn() -> K>,
}

impl<K: Workload, C: ObjectCache<K>> Worker<K, C> {
    pub fn new(
        queue: WorkQueue<Event>,
        cache: C,
        image_sets: mpsc::Sender<ImageSet>,
        ignored: Option<WorkloadKey>,
    ) -> Self {
        Self {
            queue,
            cache,
            image_sets,
            ignored,
            _kind: PhantomData,
        }
    }

    pub async fn run(self, id: usize) {
        debug!("{} worker {} started", K::kind_name(), id);
        while self.process_next_item().await {}
        info!("{} worker {} stopped", K::kind_name(), id);
    }

    /// Processes one event. Returns `false` once the queue has shut down.
    pub async fn process_next_item(&self) -> bool {
        let Some(event) = self.queue.get().await else {
            return false;
        };

        match self.process_item(&event).await {
            Ok(()) => self.queue.forget(&event.key),
            Err(e) => {
                self.queue.retry_or_forget(event.clone(), &e);
            }
        }
        self.queue.done(&event.key);
        true
    }

    async fn process_item(&self, event: &Event) -> Result<(), ReconcileError> {
        if self.ignored.as_ref() == Some(&event.key) {
            debug!("Skipping managed workload {}", event.key);
            return Ok(());
        }

        let image_set = match event.action {
            Action::Created | Action::Updated => {
                let workload = self
                    .cache
                    .get_by_key(&event.key)
                    .ok_or_else(|| ReconcileError::NotInCache(event.key.clone()))?;
                let images = get_images(workload.as_ref());
                debug!("{} {} requires images {:?}", event.key, event.action, images);
                ImageSet::new(event.key.clone(), images, workload.image_pull_secrets())
            }
            Action::Deleted => ImageSet::tombstone(event.key.clone()),
        };

        self.image_sets
            .send(image_set)
            .await
            .map_err(|_| ReconcileError::AggregatorClosed)
    }
}
