use crate::aggregator::Aggregator;
use crate::config::WorkloadKind;
use crate::prefetch::PrefetchSet;
use crate::queue::WorkQueue;
use crate::reconciler::Worker;
use crate::state::{Action, ControllerContext, Event, ImageSet, SyncStatus, WorkloadKey};
use crate::watcher::watch_workloads;
use crate::webserver;
use crate::workload::Workload;
use anyhow::Context;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use kube::runtime::reflector;
use kube::{Api, Client};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Reconcilers block on a full channel, so a slow patch throttles them.
const IMAGE_SET_CHANNEL_CAPACITY: usize = 1;

type Resync = Arc<dyn Fn() -> usize + Send + Sync>;

pub async fn create_client() -> anyhow::Result<Client> {
    info!("Initializing K8s controller");
    let client = Client::try_default().await?;
    let api_server_info = client.apiserver_version().await?;
    info!(
        "Connected to namespace {}, Kubernetes API server with version {}.{}",
        client.default_namespace(),
        api_server_info.major,
        api_server_info.minor
    );
    Ok(client)
}

/// Runs every role of the controller until `shutdown` fires.
pub async fn run(ctx: ControllerContext, shutdown: CancellationToken) -> anyhow::Result<()> {
    let prefetch = PrefetchSet::new(ctx.kube_client.clone(), &ctx.config.prefetch);
    prefetch
        .ensure_exists()
        .await
        .context("Failed to set up the prefetch DaemonSet")?;

    let (status_tx, status_rx) = watch::channel(SyncStatus::default());
    let (image_sets_tx, image_sets_rx) = mpsc::channel(IMAGE_SET_CHANNEL_CAPACITY);

    let mut tasks = JoinSet::new();
    tasks.spawn(Aggregator::new(prefetch, status_tx).run(image_sets_rx));

    let mut resyncs: Vec<Resync> = Vec::new();
    for kind in &ctx.config.workloads.kinds {
        let resync = match kind {
            WorkloadKind::Deployment => {
                spawn_pipeline::<Deployment>(&ctx, &mut tasks, &image_sets_tx, &shutdown)
            }
            WorkloadKind::StatefulSet => {
                spawn_pipeline::<StatefulSet>(&ctx, &mut tasks, &image_sets_tx, &shutdown)
            }
            WorkloadKind::DaemonSet => {
                spawn_pipeline::<DaemonSet>(&ctx, &mut tasks, &image_sets_tx, &shutdown)
            }
        };
        resyncs.push(resync);
    }
    // Only the workers hold senders now, the aggregator exits after they do.
    drop(image_sets_tx);

    let mut scheduler = match &ctx.config.resync_schedule.0 {
        Some(schedule) => Some(schedule_resync(schedule, resyncs).await?),
        None => {
            info!("Periodic resync disabled");
            None
        }
    };

    let app = webserver::create_app(status_rx);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], ctx.config.webserver.port));
    info!("Starting webserver on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind webserver to {}", addr))?;
    let server_shutdown = shutdown.clone();
    tasks.spawn(async move {
        let server = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await });
        if let Err(e) = server.await {
            warn!("Webserver stopped with error: {:?}", e);
        }
    });

    shutdown.cancelled().await;
    info!("Shutting down");
    if let Some(scheduler) = scheduler.as_mut() {
        scheduler.shutdown().await?;
    }
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            warn!("Task failed during shutdown: {:?}", e);
        }
    }
    Ok(())
}

/// Starts the watcher, queue and workers for one workload kind and returns a
/// handle that requeues every cached workload of that kind.
fn spawn_pipeline<K: Workload>(
    ctx: &ControllerContext,
    tasks: &mut JoinSet<()>,
    image_sets: &mpsc::Sender<ImageSet>,
    shutdown: &CancellationToken,
) -> Resync {
    let client = ctx.kube_client.clone();
    let api: Api<K> = match &ctx.config.workloads.namespace {
        Some(namespace) => Api::namespaced(client, namespace),
        None => Api::all(client),
    };
    let (store, writer) = reflector::store::<K>();
    let queue = WorkQueue::new(ctx.config.queue.rate_limit());

    let prefetch = &ctx.config.prefetch;
    let managed = WorkloadKey::new("DaemonSet", &prefetch.namespace, &prefetch.name);
    let ignored = (K::kind_name() == managed.kind).then_some(managed);

    tasks.spawn(watch_workloads(api, writer, queue.clone(), shutdown.clone()));
    for id in 0..ctx.config.workers.0.max(1) {
        let worker: Worker<K, _> =
            Worker::new(queue.clone(), store.clone(), image_sets.clone(), ignored.clone());
        tasks.spawn(worker.run(id));
    }
    tasks.spawn({
        let queue = queue.clone();
        let shutdown = shutdown.clone();
        async move {
            shutdown.cancelled().await;
            queue.shutdown();
        }
    });

    Arc::new(move || {
        let workloads = store.state();
        for workload in &workloads {
            queue.add(Event::new(workload.workload_key(), Action::Updated));
        }
        workloads.len()
    })
}

async fn schedule_resync(schedule: &str, resyncs: Vec<Resync>) -> anyhow::Result<JobScheduler> {
    info!("Scheduling periodic resync at cron schedule {}", schedule);
    let scheduler = JobScheduler::new().await?;
    let resyncs = Arc::new(resyncs);

    let job = Job::new_async(schedule, move |_uuid, _l| {
        let resyncs = Arc::clone(&resyncs);
        Box::pin(async move {
            let requeued: usize = resyncs.iter().map(|resync| resync()).sum();
            info!("Periodic resync requeued {} workloads", requeued);
        })
    })
    .with_context(|| format!("Invalid resync schedule {}", schedule))?;
    scheduler.add(job).await?;
    scheduler.start().await?;
    Ok(scheduler)
}
