//! Habitat controller: watch caches, event routing, work queue and workers

pub mod habitat;
pub mod peers;
pub mod queue;
pub mod retry;
pub mod router;
pub mod statefulset;
pub mod validation;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use k8s_openapi::NamespaceResourceScope;
use kube::runtime::watcher;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cache::WatchCache;
use crate::client::ClusterClient;
use crate::config::OperatorSettings;
use crate::events::EventRecorder;
use crate::habitat::{labels, Habitat};
use crate::key::ReconcileKey;
use crate::scheme::Scheme;

use self::habitat::{reconcile, Outcome};
use self::queue::WorkQueue;
use self::retry::ExponentialBackoff;
use self::router::EventRouter;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("{task} task panicked")]
    TaskPanicked { task: String },
    #[error("{task} task failed: {source}")]
    TaskFailed {
        task: String,
        #[source]
        source: JoinError,
    },
}

/// One watch cache per observed kind
pub struct Caches {
    pub habitats: Arc<WatchCache<Habitat>>,
    pub stateful_sets: Arc<WatchCache<StatefulSet>>,
    pub config_maps: Arc<WatchCache<ConfigMap>>,
    pub pods: Arc<WatchCache<Pod>>,
}

impl Default for Caches {
    fn default() -> Self {
        Self::new()
    }
}

impl Caches {
    pub fn new() -> Self {
        Self {
            habitats: Arc::new(WatchCache::new("Habitat")),
            stateful_sets: Arc::new(WatchCache::new("StatefulSet")),
            config_maps: Arc::new(WatchCache::new("ConfigMap")),
            pods: Arc::new(WatchCache::new("Pod")),
        }
    }

    pub fn all_synced(&self) -> bool {
        self.habitats.has_synced()
            && self.stateful_sets.has_synced()
            && self.config_maps.has_synced()
            && self.pods.has_synced()
    }

    pub async fn wait_synced(&self) {
        tokio::join!(
            self.habitats.wait_synced(),
            self.stateful_sets.wait_synced(),
            self.config_maps.wait_synced(),
            self.pods.wait_synced(),
        );
    }
}

/// Shared state for the reconciler
pub struct ControllerContext {
    /// Cluster writes and live reads
    pub client: Arc<dyn ClusterClient>,
    /// Local mirrors of every watched kind
    pub caches: Arc<Caches>,
    /// Registered kinds, for owner and event references
    pub scheme: Arc<Scheme>,
    /// User-facing Kubernetes Events
    pub recorder: EventRecorder,
    /// Operator tunables
    pub settings: Arc<OperatorSettings>,
}

impl ControllerContext {
    pub fn new(client: Arc<dyn ClusterClient>, settings: OperatorSettings) -> Self {
        let scheme = Arc::new(Scheme::new());
        Self {
            recorder: EventRecorder::new(client.clone(), scheme.clone()),
            client,
            caches: Arc::new(Caches::new()),
            scheme,
            settings: Arc::new(settings),
        }
    }
}

/// Ties the caches, router, queue and workers together
pub struct HabitatController {
    ctx: Arc<ControllerContext>,
    queue: WorkQueue<ReconcileKey>,
    workers: usize,
}

impl HabitatController {
    /// Build the controller and route cache events into its queue
    pub fn new(ctx: Arc<ControllerContext>, workers: usize) -> Self {
        let queue = WorkQueue::new(ExponentialBackoff::new(
            ctx.settings.backoff_base,
            ctx.settings.backoff_max,
        ));
        let router = Arc::new(EventRouter::new(
            queue.clone(),
            ctx.caches.habitats.clone(),
            ctx.settings.custom_version.clone(),
        ));
        router.register(&ctx.caches);

        Self {
            ctx,
            queue,
            workers: workers.max(1),
        }
    }

    pub fn queue(&self) -> &WorkQueue<ReconcileKey> {
        &self.queue
    }

    /// Run until `token` is cancelled.
    ///
    /// Watches start immediately; workers start once every cache has synced.
    /// On cancellation the queue is shut down and all tasks are awaited, so
    /// in-flight reconciles complete before this returns.
    pub async fn run(
        self,
        client: Client,
        namespace: Option<String>,
        token: CancellationToken,
    ) -> Result<(), ControllerError> {
        let ns = namespace.as_deref();
        let managed = || watcher::Config::default().labels(labels::MANAGED_SELECTOR);

        let mut watches = JoinSet::new();
        spawn_watch(
            &mut watches,
            self.ctx.caches.habitats.clone(),
            api(&client, ns),
            watcher::Config::default(),
            token.clone(),
        );
        spawn_watch(
            &mut watches,
            self.ctx.caches.stateful_sets.clone(),
            api(&client, ns),
            managed(),
            token.clone(),
        );
        spawn_watch(
            &mut watches,
            self.ctx.caches.config_maps.clone(),
            api(&client, ns),
            managed(),
            token.clone(),
        );
        spawn_watch(
            &mut watches,
            self.ctx.caches.pods.clone(),
            api(&client, ns),
            managed(),
            token.clone(),
        );

        let mut workers = JoinSet::new();
        tokio::select! {
            _ = token.cancelled() => {
                info!("Shutdown requested before caches synced");
            }
            _ = self.ctx.caches.wait_synced() => {
                info!(workers = self.workers, "Caches synced, starting workers");
                for id in 0..self.workers {
                    workers.spawn(run_worker(self.ctx.clone(), self.queue.clone(), id));
                }
            }
        }

        token.cancelled().await;
        info!("Shutting down controller");
        self.queue.shutdown();

        let mut result = Ok(());
        for (task, set) in [("worker", &mut workers), ("watch", &mut watches)] {
            while let Some(joined) = set.join_next().await {
                if let Err(e) = joined {
                    let err = task_error(task, e);
                    error!(error = %err, "Controller task did not exit cleanly");
                    result = Err(err);
                }
            }
        }
        info!("Controller stopped");
        result
    }
}

fn api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

fn spawn_watch<K>(
    set: &mut JoinSet<()>,
    cache: Arc<WatchCache<K>>,
    api: Api<K>,
    config: watcher::Config,
    token: CancellationToken,
) where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug + Send + Sync + 'static,
{
    set.spawn(async move { cache.run(api, config, token).await });
}

fn task_error(task: &str, e: JoinError) -> ControllerError {
    if e.is_panic() {
        ControllerError::TaskPanicked {
            task: task.to_string(),
        }
    } else {
        ControllerError::TaskFailed {
            task: task.to_string(),
            source: e,
        }
    }
}

/// Take keys off the queue until it shuts down
async fn run_worker(ctx: Arc<ControllerContext>, queue: WorkQueue<ReconcileKey>, id: usize) {
    info!(worker = id, "Worker started");
    while process_next(&ctx, &queue).await {}
    info!(worker = id, "Worker stopped");
}

/// Reconcile one key. Returns false once the queue has shut down.
pub async fn process_next(ctx: &ControllerContext, queue: &WorkQueue<ReconcileKey>) -> bool {
    let Some(key) = queue.get().await else {
        return false;
    };

    match AssertUnwindSafe(reconcile(ctx, &key)).catch_unwind().await {
        Ok(Ok(Outcome::Synced)) => queue.forget(&key),
        Ok(Ok(Outcome::Skipped)) => {}
        Ok(Err(e)) => {
            warn!(
                key = %key,
                error = %e,
                attempt = queue.num_requeues(&key) + 1,
                "Reconcile failed, requeueing with backoff"
            );
            queue.add_rate_limited(key.clone());
        }
        Err(panic) => {
            error!(
                key = %key,
                panic = panic_message(panic.as_ref()),
                "Reconcile panicked, requeueing with backoff"
            );
            queue.add_rate_limited(key.clone());
        }
    }
    queue.done(&key);
    true
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
}
