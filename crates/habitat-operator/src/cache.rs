//! Watch-backed local caches
//!
//! A [`WatchCache`] mirrors every object of one kind that a watcher stream
//! reports. Reads never touch the API server. Registered handlers receive a
//! typed [`CacheEvent`] for each change, including the adds, updates and
//! deletes implied by a full re-list.

use std::collections::HashMap;
use std::fmt::Debug;
use std::pin::pin;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::watcher::{self, watcher};
use kube::runtime::WatchStreamExt;
use kube::{Api, Resource};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::key::ReconcileKey;

/// A change observed by a [`WatchCache`]
#[derive(Debug, Clone)]
pub enum CacheEvent<K> {
    Added(Arc<K>),
    Updated { old: Arc<K>, new: Arc<K> },
    /// Carries the last state known for the object
    Deleted(Arc<K>),
}

type Handler<K> = Box<dyn Fn(&CacheEvent<K>) + Send + Sync>;

/// Local, event-driven mirror of one resource kind
pub struct WatchCache<K> {
    kind: &'static str,
    store: RwLock<HashMap<ReconcileKey, Arc<K>>>,
    /// Objects collected during a re-list, swapped in on `InitDone`
    relist: Mutex<Option<HashMap<ReconcileKey, Arc<K>>>>,
    synced: watch::Sender<bool>,
    handlers: RwLock<Vec<Handler<K>>>,
}

impl<K> WatchCache<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            store: RwLock::new(HashMap::new()),
            relist: Mutex::new(None),
            synced: watch::Sender::new(false),
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register a handler invoked for every subsequent change
    pub fn add_handler(&self, handler: impl Fn(&CacheEvent<K>) + Send + Sync + 'static) {
        self.handlers.write().push(Box::new(handler));
    }

    pub fn get(&self, key: &ReconcileKey) -> Option<Arc<K>> {
        self.store.read().get(key).cloned()
    }

    pub fn list(&self) -> Vec<Arc<K>> {
        self.store.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.store.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.read().is_empty()
    }

    /// True once the first complete list has been applied
    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Wait until the first complete list has been applied
    pub async fn wait_synced(&self) {
        let mut rx = self.synced.subscribe();
        // The sender lives as long as self, so this only fails if self is gone
        let _ = rx.wait_for(|synced| *synced).await;
    }

    /// Apply one watcher event to the store and notify handlers
    pub fn apply(&self, event: watcher::Event<K>) {
        let events = match event {
            watcher::Event::Init => {
                debug!(kind = self.kind, "Re-list started");
                *self.relist.lock() = Some(HashMap::new());
                Vec::new()
            }
            watcher::Event::InitApply(obj) => {
                let Some(key) = ReconcileKey::from_meta(obj.meta()) else {
                    return;
                };
                self.relist
                    .lock()
                    .get_or_insert_with(HashMap::new)
                    .insert(key, Arc::new(obj));
                Vec::new()
            }
            watcher::Event::InitDone => {
                let fresh = self.relist.lock().take().unwrap_or_default();
                let events = self.replace(fresh);
                if !self.synced.send_replace(true) {
                    info!(kind = self.kind, objects = self.len(), "Cache synced");
                }
                events
            }
            watcher::Event::Apply(obj) => {
                let Some(key) = ReconcileKey::from_meta(obj.meta()) else {
                    return;
                };
                let new = Arc::new(obj);
                match self.store.write().insert(key, new.clone()) {
                    Some(old) => vec![CacheEvent::Updated { old, new }],
                    None => vec![CacheEvent::Added(new)],
                }
            }
            watcher::Event::Delete(obj) => {
                let Some(key) = ReconcileKey::from_meta(obj.meta()) else {
                    return;
                };
                let removed = self.store.write().remove(&key);
                vec![CacheEvent::Deleted(removed.unwrap_or_else(|| Arc::new(obj)))]
            }
        };

        self.dispatch(&events);
    }

    /// Swap in a complete listing and compute the implied changes
    fn replace(&self, fresh: HashMap<ReconcileKey, Arc<K>>) -> Vec<CacheEvent<K>> {
        let mut store = self.store.write();
        let mut events = Vec::new();

        for (key, old) in store.iter() {
            if !fresh.contains_key(key) {
                events.push(CacheEvent::Deleted(old.clone()));
            }
        }
        for (key, new) in &fresh {
            match store.get(key) {
                None => events.push(CacheEvent::Added(new.clone())),
                Some(old) if old.meta().resource_version != new.meta().resource_version => {
                    events.push(CacheEvent::Updated {
                        old: old.clone(),
                        new: new.clone(),
                    })
                }
                Some(_) => {}
            }
        }

        *store = fresh;
        events
    }

    fn dispatch(&self, events: &[CacheEvent<K>]) {
        if events.is_empty() {
            return;
        }
        let handlers = self.handlers.read();
        for event in events {
            for handler in handlers.iter() {
                handler(event);
            }
        }
    }

    /// Feed the cache from a watch on `api` until `token` is cancelled.
    ///
    /// The watcher re-lists on desync and backs off on errors; the cache itself
    /// never retries.
    pub async fn run(&self, api: Api<K>, config: watcher::Config, token: CancellationToken) {
        let mut stream = pin!(watcher(api, config).default_backoff());

        info!(kind = self.kind, "Starting watch");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                item = stream.next() => match item {
                    Some(Ok(event)) => self.apply(event),
                    Some(Err(e)) => warn!(kind = self.kind, error = %e, "Watch stream error"),
                    None => {
                        warn!(kind = self.kind, "Watch stream ended");
                        break;
                    }
                },
            }
        }
        info!(kind = self.kind, "Watch stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cm(name: &str, rv: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns1".to_string()),
                resource_version: Some(rv.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[derive(Default)]
    struct Counts {
        added: AtomicUsize,
        updated: AtomicUsize,
        deleted: AtomicUsize,
    }

    fn counting_cache() -> (WatchCache<ConfigMap>, Arc<Counts>) {
        let cache = WatchCache::new("ConfigMap");
        let counts = Arc::new(Counts::default());
        let c = counts.clone();
        cache.add_handler(move |event| {
            let counter = match event {
                CacheEvent::Added(_) => &c.added,
                CacheEvent::Updated { .. } => &c.updated,
                CacheEvent::Deleted(_) => &c.deleted,
            };
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (cache, counts)
    }

    #[test]
    fn test_initial_list_marks_synced() {
        let (cache, counts) = counting_cache();
        assert!(!cache.has_synced());

        cache.apply(watcher::Event::Init);
        cache.apply(watcher::Event::InitApply(cm("a", "1")));
        cache.apply(watcher::Event::InitApply(cm("b", "1")));
        assert!(!cache.has_synced());
        assert!(cache.is_empty());

        cache.apply(watcher::Event::InitDone);
        assert!(cache.has_synced());
        assert_eq!(cache.len(), 2);
        assert_eq!(counts.added.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_apply_and_delete() {
        let (cache, counts) = counting_cache();
        let key = ReconcileKey::new("ns1", "a");

        cache.apply(watcher::Event::Apply(cm("a", "1")));
        cache.apply(watcher::Event::Apply(cm("a", "2")));
        assert_eq!(
            cache.get(&key).unwrap().metadata.resource_version.as_deref(),
            Some("2")
        );

        cache.apply(watcher::Event::Delete(cm("a", "2")));
        assert!(cache.get(&key).is_none());

        assert_eq!(counts.added.load(Ordering::SeqCst), 1);
        assert_eq!(counts.updated.load(Ordering::SeqCst), 1);
        assert_eq!(counts.deleted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_relist_diffs_against_store() {
        let (cache, counts) = counting_cache();
        cache.apply(watcher::Event::Apply(cm("keep", "1")));
        cache.apply(watcher::Event::Apply(cm("change", "1")));
        cache.apply(watcher::Event::Apply(cm("gone", "1")));

        cache.apply(watcher::Event::Init);
        cache.apply(watcher::Event::InitApply(cm("keep", "1")));
        cache.apply(watcher::Event::InitApply(cm("change", "2")));
        cache.apply(watcher::Event::InitApply(cm("new", "1")));
        cache.apply(watcher::Event::InitDone);

        assert_eq!(cache.len(), 3);
        assert!(cache.get(&ReconcileKey::new("ns1", "gone")).is_none());
        // 3 direct applies + 1 from the re-list
        assert_eq!(counts.added.load(Ordering::SeqCst), 4);
        assert_eq!(counts.updated.load(Ordering::SeqCst), 1);
        assert_eq!(counts.deleted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wait_synced_returns_after_init_done() {
        let cache = Arc::new(WatchCache::<ConfigMap>::new("ConfigMap"));
        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.wait_synced().await })
        };

        cache.apply(watcher::Event::Init);
        cache.apply(watcher::Event::InitDone);

        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("wait_synced did not return")
            .unwrap();
    }
}
