//! Routes cache events to Habitat keys on the work queue
//!
//! Habitat events enqueue the Habitat itself. Events on StatefulSets,
//! ConfigMaps and Pods enqueue the Habitat named by their `habitat-name`
//! label, provided that Habitat is known to the cache.

use std::sync::Arc;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;
use tracing::{debug, error};

use crate::cache::{CacheEvent, WatchCache};
use crate::habitat::Habitat;
use crate::key::{owner_key, ReconcileKey};

use super::queue::WorkQueue;
use super::Caches;

pub struct EventRouter {
    queue: WorkQueue<ReconcileKey>,
    habitats: Arc<WatchCache<Habitat>>,
    custom_version: String,
}

impl EventRouter {
    pub fn new(
        queue: WorkQueue<ReconcileKey>,
        habitats: Arc<WatchCache<Habitat>>,
        custom_version: String,
    ) -> Self {
        Self {
            queue,
            habitats,
            custom_version,
        }
    }

    /// Install handlers on every cache
    pub fn register(self: &Arc<Self>, caches: &Caches) {
        let router = self.clone();
        caches
            .habitats
            .add_handler(move |event| router.on_habitat(event));

        let router = self.clone();
        caches
            .stateful_sets
            .add_handler(move |event: &CacheEvent<StatefulSet>| {
                router.on_owned("StatefulSet", event)
            });

        let router = self.clone();
        caches
            .config_maps
            .add_handler(move |event: &CacheEvent<ConfigMap>| router.on_owned("ConfigMap", event));

        let router = self.clone();
        caches.pods.add_handler(move |event| router.on_pod(event));
    }

    pub fn on_habitat(&self, event: &CacheEvent<Habitat>) {
        match event {
            CacheEvent::Added(h) | CacheEvent::Deleted(h) => self.enqueue_habitat(h),
            CacheEvent::Updated { old, new } => {
                if old.spec == new.spec {
                    debug!(
                        name = new.metadata.name.as_deref().unwrap_or_default(),
                        "Habitat spec unchanged, ignoring update"
                    );
                    return;
                }
                self.enqueue_habitat(new)
            }
        }
    }

    /// StatefulSets and ConfigMaps: every change enqueues the owner
    pub fn on_owned<K: Resource>(&self, kind: &str, event: &CacheEvent<K>) {
        let obj = match event {
            CacheEvent::Added(o) | CacheEvent::Deleted(o) => o,
            CacheEvent::Updated { new, .. } => new,
        };
        self.enqueue_owner(kind, obj.meta());
    }

    pub fn on_pod(&self, event: &CacheEvent<Pod>) {
        match event {
            CacheEvent::Added(pod) | CacheEvent::Deleted(pod) => {
                self.enqueue_owner("Pod", &pod.metadata)
            }
            CacheEvent::Updated { old, new } => {
                if pod_needs_update(old, new) {
                    self.enqueue_owner("Pod", &new.metadata);
                }
            }
        }
    }

    fn enqueue_habitat(&self, habitat: &Habitat) {
        let Some(key) = habitat.key() else {
            return;
        };
        if habitat.custom_version() != Some(self.custom_version.as_str()) {
            debug!(
                key = %key,
                custom_version = ?habitat.custom_version(),
                "Ignoring Habitat with foreign version marker"
            );
            return;
        }
        self.queue.add(key);
    }

    fn enqueue_owner(&self, kind: &str, meta: &ObjectMeta) {
        let key = match owner_key(meta) {
            Ok(key) => key,
            Err(e) => {
                error!(kind, error = %e, "Cannot determine owning Habitat");
                return;
            }
        };

        match self.habitats.get(&key) {
            Some(habitat) => self.enqueue_habitat(&habitat),
            None => debug!(kind, owner = %key, "Owning Habitat not in cache"),
        }
    }
}

/// Pod updates matter only when the object and its phase both changed
pub fn pod_needs_update(old: &Pod, new: &Pod) -> bool {
    if old.metadata.resource_version == new.metadata.resource_version {
        return false;
    }
    let phase = |p: &Pod| p.status.as_ref().and_then(|s| s.phase.clone());
    phase(old) != phase(new)
}
