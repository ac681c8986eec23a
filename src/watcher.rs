use crate::queue::WorkQueue;
use crate::state::{Action, Event, WorkloadKey};
use crate::workload::Workload;
use futures::StreamExt;
use kube::Api;
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::{WatchStreamExt, watcher};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Read access to the locally mirrored workloads.
pub trait ObjectCache<K>: Send + Sync {
    fn get_by_key(&self, key: &WorkloadKey) -> Option<Arc<K>>;
}

impl<K: Workload> ObjectCache<K> for Store<K> {
    fn get_by_key(&self, key: &WorkloadKey) -> Option<Arc<K>> {
        self.get(&ObjectRef::new(&key.name).within(&key.namespace))
    }
}

/// Turns watcher events into queue events and keeps track of the keys it has
/// seen, so that objects which disappeared while the watch was down are
/// reported as deleted after the next relist.
///
/// The reflector store only exposes listed objects once the list is done, so
/// events for `InitApply` are held back until `InitDone`.
#[derive(Debug, Default)]
pub struct EventTranslator {
    known: HashSet<WorkloadKey>,
    relisted: Option<HashSet<WorkloadKey>>,
    listed: Vec<Event>,
}

impl EventTranslator {
    pub fn translate<K: Workload>(&mut self, event: &watcher::Event<K>) -> Vec<Event> {
        match event {
            watcher::Event::Apply(obj) => vec![self.applied(obj.workload_key())],
            watcher::Event::Delete(obj) => {
                let key = obj.workload_key();
                self.known.remove(&key);
                vec![Event::new(key, Action::Deleted)]
            }
            watcher::Event::Init => {
                self.relisted = Some(HashSet::new());
                self.listed.clear();
                Vec::new()
            }
            watcher::Event::InitApply(obj) => {
                let key = obj.workload_key();
                let Some(relisted) = self.relisted.as_mut() else {
                    return vec![self.applied(key)];
                };
                // Becomes known at InitDone, a restarted list starts over.
                let action = if self.known.contains(&key) {
                    Action::Updated
                } else {
                    Action::Created
                };
                relisted.insert(key.clone());
                self.listed.push(Event::new(key, action));
                Vec::new()
            }
            watcher::Event::InitDone => {
                let Some(relisted) = self.relisted.take() else {
                    return Vec::new();
                };
                let mut events = std::mem::take(&mut self.listed);
                events.extend(
                    self.known
                        .difference(&relisted)
                        .map(|key| Event::new(key.clone(), Action::Deleted)),
                );
                self.known = relisted;
                events
            }
        }
    }

    fn applied(&mut self, key: WorkloadKey) -> Event {
        let action = if self.known.insert(key.clone()) {
            Action::Created
        } else {
            Action::Updated
        };
        Event::new(key, action)
    }
}

/// Mirrors all workloads of kind `K` into the reflector store and queues an
/// event for every change until shutdown.
pub async fn watch_workloads<K: Workload>(
    api: Api<K>,
    writer: reflector::store::Writer<K>,
    queue: WorkQueue<Event>,
    shutdown: CancellationToken,
) {
    let kind = K::kind_name();
    info!("Starting {} watcher", kind);

    let stream = reflector::reflector(
        writer,
        watcher(api, watcher::Config::default()).default_backoff(),
    );
    let mut stream = Box::pin(stream);
    let mut translator = EventTranslator::default();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("{} watcher shutdown requested", kind);
                break;
            }
            next = stream.next() => match next {
                Some(Ok(event)) => {
                    for event in translator.translate(&event) {
                        debug!(
                            "Queueing {} event for {} ({} pending)",
                            event.action,
                            event.key,
                            queue.len()
                        );
                        queue.add(event);
                    }
                }
                Some(Err(e)) => warn!("{} watch stream error, backing off: {}", kind, e),
                None => {
                    warn!("{} watch stream ended", kind);
                    break;
                }
            }
        }
    }
}
