//! Test fixtures and an in-memory cluster

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Event, Pod, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::watcher;
use parking_lot::Mutex;

use crate::client::{ClientError, ClusterClient, MockClusterClient};
use crate::config::OperatorSettings;
use crate::controllers::statefulset::owned_labels;
use crate::controllers::{Caches, ControllerContext};
use crate::events::EventRecorder;
use crate::habitat::{Habitat, HabitatSpec, HabitatStatus, ServiceSpec};
use crate::key::ReconcileKey;
use crate::scheme::Scheme;

/// A valid standalone Habitat carrying the default version marker
pub fn habitat(namespace: &str, name: &str, count: i32) -> Habitat {
    let mut h = Habitat::new(
        name,
        HabitatSpec {
            custom_version: Some("v1beta2".to_string()),
            count,
            image: "myimg:latest".to_string(),
            service_account_name: None,
            service: ServiceSpec {
                name: name.to_string(),
                topology: "standalone".to_string(),
                ..Default::default()
            },
            env: vec![],
            persistent_storage: None,
        },
    );
    h.metadata.namespace = Some(namespace.to_string());
    h.metadata.uid = Some(format!("uid-{name}"));
    h.metadata.resource_version = Some("1".to_string());
    h.metadata.generation = Some(1);
    h
}

pub fn context_with(mock: MockClusterClient, settings: OperatorSettings) -> ControllerContext {
    ControllerContext::new(Arc::new(mock), settings)
}

/// Context whose client is a [`FakeCluster`] writing through to its caches
pub fn fake_context(settings: OperatorSettings) -> (Arc<FakeCluster>, Arc<ControllerContext>) {
    let caches = Arc::new(Caches::new());
    let fake = Arc::new(FakeCluster::new(caches.clone()));
    let client: Arc<dyn ClusterClient> = fake.clone();
    let scheme = Arc::new(Scheme::new());

    let ctx = ControllerContext {
        recorder: EventRecorder::new(client.clone(), scheme.clone()),
        client,
        caches,
        scheme,
        settings: Arc::new(settings),
    };
    (fake, Arc::new(ctx))
}

#[derive(Default)]
struct FakeState {
    stateful_sets: HashMap<ReconcileKey, StatefulSet>,
    config_maps: HashMap<ReconcileKey, ConfigMap>,
    pods: HashMap<ReconcileKey, Pod>,
    secrets: HashSet<ReconcileKey>,
    events: Vec<Event>,
    writes: usize,
    next_rv: u64,
}

impl FakeState {
    fn next_resource_version(&mut self) -> String {
        self.next_rv += 1;
        (100 + self.next_rv).to_string()
    }
}

/// API server stand-in. Every write is mirrored into the caches, the way a
/// watch would deliver it.
pub struct FakeCluster {
    caches: Arc<Caches>,
    state: Mutex<FakeState>,
    list_delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    panic_on_list: AtomicBool,
}

impl FakeCluster {
    pub fn new(caches: Arc<Caches>) -> Self {
        Self {
            caches,
            state: Mutex::new(FakeState::default()),
            list_delay: Mutex::new(Duration::ZERO),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            panic_on_list: AtomicBool::new(false),
        }
    }

    /// Mutating calls served so far, events excluded
    pub fn writes(&self) -> usize {
        self.state.lock().writes
    }

    pub fn stateful_set(&self, namespace: &str, name: &str) -> Option<StatefulSet> {
        self.state
            .lock()
            .stateful_sets
            .get(&ReconcileKey::new(namespace, name))
            .cloned()
    }

    pub fn config_map(&self, namespace: &str, name: &str) -> Option<ConfigMap> {
        self.state
            .lock()
            .config_maps
            .get(&ReconcileKey::new(namespace, name))
            .cloned()
    }

    /// Reasons of recorded events, oldest first
    pub fn event_reasons(&self) -> Vec<String> {
        self.state
            .lock()
            .events
            .iter()
            .filter_map(|e| e.reason.clone())
            .collect()
    }

    /// Change a live StatefulSet the way another client would
    pub fn edit_stateful_set(
        &self,
        namespace: &str,
        name: &str,
        edit: impl FnOnce(&mut StatefulSet),
    ) {
        let key = ReconcileKey::new(namespace, name);
        let edited = {
            let mut state = self.state.lock();
            let rv = state.next_resource_version();
            let Some(sts) = state.stateful_sets.get_mut(&key) else {
                return;
            };
            edit(sts);
            sts.metadata.resource_version = Some(rv);
            sts.clone()
        };
        self.caches
            .stateful_sets
            .apply(watcher::Event::Apply(edited));
    }

    pub fn add_secret(&self, namespace: &str, name: &str) {
        self.state
            .lock()
            .secrets
            .insert(ReconcileKey::new(namespace, name));
    }

    /// Replace the running members of `habitat` with one pod per address
    pub fn set_pods(&self, namespace: &str, habitat: &str, ips: &[&str]) {
        let mut removed = Vec::new();
        let mut added = Vec::new();
        {
            let mut state = self.state.lock();
            let stale: Vec<ReconcileKey> = state
                .pods
                .iter()
                .filter(|(key, pod)| {
                    key.namespace() == namespace
                        && matches_selector(&pod.metadata, &format!("habitat-name={habitat}"))
                })
                .map(|(key, _)| key.clone())
                .collect();
            for key in stale {
                removed.extend(state.pods.remove(&key));
            }

            for (i, ip) in ips.iter().enumerate() {
                let name = format!("{habitat}-{i}");
                let pod = Pod {
                    metadata: ObjectMeta {
                        name: Some(name.clone()),
                        namespace: Some(namespace.to_string()),
                        labels: Some(owned_labels(habitat)),
                        resource_version: Some(state.next_resource_version()),
                        ..Default::default()
                    },
                    status: Some(PodStatus {
                        phase: Some("Running".to_string()),
                        pod_ip: Some(ip.to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                };
                state
                    .pods
                    .insert(ReconcileKey::new(namespace, name), pod.clone());
                added.push(pod);
            }
        }

        for pod in removed {
            self.caches.pods.apply(watcher::Event::Delete(pod));
        }
        for pod in added {
            self.caches.pods.apply(watcher::Event::Apply(pod));
        }
    }

    /// Make every pod listing take `delay`
    pub fn set_list_delay(&self, delay: Duration) {
        *self.list_delay.lock() = delay;
    }

    /// Make the next pod listing panic
    pub fn panic_on_next_list(&self) {
        self.panic_on_list.store(true, Ordering::SeqCst);
    }

    /// Highest number of pod listings observed running at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

fn object_key(namespace: &str, meta: &ObjectMeta) -> ReconcileKey {
    ReconcileKey::new(namespace, meta.name.as_deref().unwrap_or_default())
}

/// Equality-based selectors only: `a=b,c=d`
fn matches_selector(meta: &ObjectMeta, selector: &str) -> bool {
    let empty = BTreeMap::new();
    let labels = meta.labels.as_ref().unwrap_or(&empty);
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
            None => false,
        })
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn create_stateful_set(
        &self,
        namespace: &str,
        sts: &StatefulSet,
    ) -> Result<StatefulSet, ClientError> {
        let key = object_key(namespace, &sts.metadata);
        let created = {
            let mut state = self.state.lock();
            if state.stateful_sets.contains_key(&key) {
                return Err(ClientError::AlreadyExists(key.to_string()));
            }
            let mut created = sts.clone();
            created.metadata.namespace = Some(namespace.to_string());
            created.metadata.resource_version = Some(state.next_resource_version());
            state.stateful_sets.insert(key, created.clone());
            state.writes += 1;
            created
        };
        self.caches
            .stateful_sets
            .apply(watcher::Event::Apply(created.clone()));
        Ok(created)
    }

    async fn get_stateful_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<StatefulSet>, ClientError> {
        Ok(self.stateful_set(namespace, name))
    }

    async fn replace_stateful_set(
        &self,
        namespace: &str,
        sts: &StatefulSet,
    ) -> Result<StatefulSet, ClientError> {
        let key = object_key(namespace, &sts.metadata);
        let replaced = {
            let mut state = self.state.lock();
            let current = state
                .stateful_sets
                .get(&key)
                .ok_or_else(|| ClientError::NotFound(key.to_string()))?;
            if current.metadata.resource_version != sts.metadata.resource_version {
                return Err(ClientError::Conflict(key.to_string()));
            }
            let mut replaced = sts.clone();
            replaced.metadata.namespace = Some(namespace.to_string());
            replaced.metadata.resource_version = Some(state.next_resource_version());
            state.stateful_sets.insert(key, replaced.clone());
            state.writes += 1;
            replaced
        };
        self.caches
            .stateful_sets
            .apply(watcher::Event::Apply(replaced.clone()));
        Ok(replaced)
    }

    async fn delete_stateful_set(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        let key = ReconcileKey::new(namespace, name);
        let removed = {
            let mut state = self.state.lock();
            let removed = state
                .stateful_sets
                .remove(&key)
                .ok_or_else(|| ClientError::NotFound(key.to_string()))?;
            state.writes += 1;
            removed
        };
        self.caches
            .stateful_sets
            .apply(watcher::Event::Delete(removed));
        Ok(())
    }

    async fn delete_pods(&self, namespace: &str, selector: &str) -> Result<(), ClientError> {
        let removed: Vec<Pod> = {
            let mut state = self.state.lock();
            let keys: Vec<ReconcileKey> = state
                .pods
                .iter()
                .filter(|(key, pod)| {
                    key.namespace() == namespace && matches_selector(&pod.metadata, selector)
                })
                .map(|(key, _)| key.clone())
                .collect();
            state.writes += 1;
            keys.iter().filter_map(|k| state.pods.remove(k)).collect()
        };
        for pod in removed {
            self.caches.pods.apply(watcher::Event::Delete(pod));
        }
        Ok(())
    }

    async fn create_config_map(
        &self,
        namespace: &str,
        cm: &ConfigMap,
    ) -> Result<ConfigMap, ClientError> {
        let key = object_key(namespace, &cm.metadata);
        let created = {
            let mut state = self.state.lock();
            if state.config_maps.contains_key(&key) {
                return Err(ClientError::AlreadyExists(key.to_string()));
            }
            let mut created = cm.clone();
            created.metadata.namespace = Some(namespace.to_string());
            created.metadata.resource_version = Some(state.next_resource_version());
            state.config_maps.insert(key, created.clone());
            state.writes += 1;
            created
        };
        self.caches
            .config_maps
            .apply(watcher::Event::Apply(created.clone()));
        Ok(created)
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, ClientError> {
        Ok(self.config_map(namespace, name))
    }

    async fn replace_config_map(
        &self,
        namespace: &str,
        cm: &ConfigMap,
    ) -> Result<ConfigMap, ClientError> {
        let key = object_key(namespace, &cm.metadata);
        let replaced = {
            let mut state = self.state.lock();
            let current = state
                .config_maps
                .get(&key)
                .ok_or_else(|| ClientError::NotFound(key.to_string()))?;
            if current.metadata.resource_version != cm.metadata.resource_version {
                return Err(ClientError::Conflict(key.to_string()));
            }
            let mut replaced = cm.clone();
            replaced.metadata.namespace = Some(namespace.to_string());
            replaced.metadata.resource_version = Some(state.next_resource_version());
            state.config_maps.insert(key, replaced.clone());
            state.writes += 1;
            replaced
        };
        self.caches
            .config_maps
            .apply(watcher::Event::Apply(replaced.clone()));
        Ok(replaced)
    }

    async fn list_running_pods(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<Pod>, ClientError> {
        if self.panic_on_list.swap(false, Ordering::SeqCst) {
            panic!("pod listing for {namespace}/{selector} blew up");
        }
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        let delay = *self.list_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let state = self.state.lock();
        Ok(state
            .pods
            .iter()
            .filter(|(key, pod)| {
                key.namespace() == namespace
                    && matches_selector(&pod.metadata, selector)
                    && pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running")
            })
            .map(|(_, pod)| pod.clone())
            .collect())
    }

    async fn secret_exists(&self, namespace: &str, name: &str) -> Result<bool, ClientError> {
        Ok(self
            .state
            .lock()
            .secrets
            .contains(&ReconcileKey::new(namespace, name)))
    }

    async fn patch_habitat_status(
        &self,
        namespace: &str,
        name: &str,
        status: &HabitatStatus,
    ) -> Result<(), ClientError> {
        let key = ReconcileKey::new(namespace, name);
        let mut habitat = self
            .caches
            .habitats
            .get(&key)
            .map(|h| (*h).clone())
            .ok_or_else(|| ClientError::NotFound(key.to_string()))?;
        {
            let mut state = self.state.lock();
            habitat.status = Some(status.clone());
            habitat.metadata.resource_version = Some(state.next_resource_version());
            state.writes += 1;
        }
        self.caches.habitats.apply(watcher::Event::Apply(habitat));
        Ok(())
    }

    async fn create_event(&self, _namespace: &str, event: &Event) -> Result<(), ClientError> {
        self.state.lock().events.push(event.clone());
        Ok(())
    }
}
