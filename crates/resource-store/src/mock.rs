//! In-memory ObjectStore for unit testing
//!
//! Mirrors the API server semantics the reconcilers depend on: monotonically
//! increasing `resourceVersion`, conflict detection on writes, spec/status
//! write separation, finalizer-gated deletion and a watch stream. Tests can
//! count writes and inject conflicts or transient failures.

use crate::error::StoreError;
use crate::key::{LabelSelector, ObjectKey};
use crate::store_trait::{ObjectStore, WatchEvent, WatchStream};
use futures::{future, stream, StreamExt};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

const EVENT_BUFFER: usize = 1024;

struct Inner<K> {
    objects: BTreeMap<ObjectKey, K>,
    next_version: u64,
    writes: usize,
    conflicts_to_inject: usize,
    failures_to_inject: usize,
}

/// In-memory [`ObjectStore`]
pub struct MemoryStore<K> {
    inner: Arc<Mutex<Inner<K>>>,
    events: broadcast::Sender<WatchEvent<K>>,
}

impl<K> Clone for MemoryStore<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            events: self.events.clone(),
        }
    }
}

impl<K> Default for MemoryStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

fn key_of<K: Resource>(obj: &K) -> Result<ObjectKey, StoreError> {
    ObjectKey::of(obj).ok_or_else(|| StoreError::NotFound("object has no name".to_string()))
}

/// Copies the `status` of `from` onto `onto`, leaving everything else of `onto` alone
fn with_status_of<K>(onto: &K, from: &K) -> Result<K, StoreError>
where
    K: Serialize + DeserializeOwned,
{
    let mut target = serde_json::to_value(onto)?;
    let status = serde_json::to_value(from)?
        .get("status")
        .cloned()
        .unwrap_or(Value::Null);
    if let Value::Object(map) = &mut target {
        if status.is_null() {
            map.remove("status");
        } else {
            map.insert("status".to_string(), status);
        }
    }
    Ok(serde_json::from_value(target)?)
}

impl<K> MemoryStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Creates an empty store
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                objects: BTreeMap::new(),
                next_version: 1,
                writes: 0,
                conflicts_to_inject: 0,
                failures_to_inject: 0,
            })),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: WatchEvent<K>) {
        // No subscriber is fine
        let _ = self.events.send(event);
    }

    /// Adds an object (for test setup); not counted as a write
    pub fn seed(&self, obj: K) -> Result<K, StoreError> {
        let created = self.insert_new(&obj)?;
        self.lock().writes -= 1;
        Ok(created)
    }

    /// Synchronous read (for test assertions)
    pub fn peek(&self, key: &ObjectKey) -> Option<K> {
        self.lock().objects.get(key).cloned()
    }

    /// All stored objects, ordered by key (for test assertions)
    pub fn objects(&self) -> Vec<K> {
        self.lock().objects.values().cloned().collect()
    }

    /// Number of successful writes (create, update, update_status, delete)
    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    /// The next `n` update/update_status calls fail with `Conflict`
    pub fn inject_conflicts(&self, n: usize) {
        self.lock().conflicts_to_inject = n;
    }

    /// The next `n` calls of any kind fail with `Transient`
    pub fn inject_failures(&self, n: usize) {
        self.lock().failures_to_inject = n;
    }

    fn check_failure(inner: &mut Inner<K>) -> Result<(), StoreError> {
        if inner.failures_to_inject > 0 {
            inner.failures_to_inject -= 1;
            return Err(StoreError::Transient("injected failure".to_string()));
        }
        Ok(())
    }

    fn next_version(inner: &mut Inner<K>) -> String {
        let version = inner.next_version;
        inner.next_version += 1;
        version.to_string()
    }

    fn insert_new(&self, obj: &K) -> Result<K, StoreError> {
        let key = key_of(obj)?;
        let created = {
            let mut inner = self.lock();
            Self::check_failure(&mut inner)?;
            if inner.objects.contains_key(&key) {
                return Err(StoreError::AlreadyExists(key.to_string()));
            }

            let mut created = obj.clone();
            let version = Self::next_version(&mut inner);
            let meta = created.meta_mut();
            meta.namespace = Some(key.namespace.clone());
            meta.uid = Some(format!("uid-{}", version));
            meta.resource_version = Some(version);
            meta.deletion_timestamp = None;

            inner.objects.insert(key, created.clone());
            inner.writes += 1;
            created
        };
        self.publish(WatchEvent::Applied(created.clone()));
        Ok(created)
    }

    /// Loads the stored copy of `obj` and runs the optimistic concurrency checks
    fn stored_for_write(inner: &mut Inner<K>, obj: &K) -> Result<(ObjectKey, K), StoreError> {
        Self::check_failure(inner)?;
        let key = key_of(obj)?;
        let stored = inner
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;

        if inner.conflicts_to_inject > 0 {
            inner.conflicts_to_inject -= 1;
            return Err(StoreError::Conflict(format!("{} (injected)", key)));
        }
        if let Some(expected) = obj.meta().resource_version.as_ref() {
            if stored.meta().resource_version.as_ref() != Some(expected) {
                return Err(StoreError::Conflict(key.to_string()));
            }
        }
        Ok((key, stored))
    }

    fn mark_deleting(obj: &mut K) -> Result<(), StoreError> {
        if obj.meta().deletion_timestamp.is_none() {
            let now = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
            obj.meta_mut().deletion_timestamp = Some(serde_json::from_value(json!(now))?);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl<K> ObjectStore<K> for MemoryStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, key: &ObjectKey) -> Result<K, StoreError> {
        let mut inner = self.lock();
        Self::check_failure(&mut inner)?;
        inner
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn list(&self, namespace: Option<&str>, selector: &LabelSelector) -> Result<Vec<K>, StoreError> {
        let mut inner = self.lock();
        Self::check_failure(&mut inner)?;
        Ok(inner
            .objects
            .iter()
            .filter(|(key, _)| namespace.is_none_or(|ns| key.namespace == ns))
            .filter(|(_, obj)| selector.matches(obj.meta().labels.as_ref()))
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, obj: &K) -> Result<K, StoreError> {
        self.insert_new(obj)
    }

    async fn update(&self, obj: &K) -> Result<K, StoreError> {
        let event = {
            let mut inner = self.lock();
            let (key, stored) = Self::stored_for_write(&mut inner, obj)?;

            // Status and server-owned metadata are not writable through update
            let mut updated = with_status_of(obj, &stored)?;
            {
                let meta = updated.meta_mut();
                meta.namespace = Some(key.namespace.clone());
                meta.uid = stored.meta().uid.clone();
                meta.deletion_timestamp = stored.meta().deletion_timestamp.clone();
            }

            inner.writes += 1;
            if updated.meta().deletion_timestamp.is_some() && updated.finalizers().is_empty() {
                inner.objects.remove(&key);
                WatchEvent::Deleted(updated)
            } else {
                updated.meta_mut().resource_version = Some(Self::next_version(&mut inner));
                inner.objects.insert(key, updated.clone());
                WatchEvent::Applied(updated)
            }
        };
        let result = event.object().clone();
        self.publish(event);
        Ok(result)
    }

    async fn update_status(&self, obj: &K) -> Result<K, StoreError> {
        let updated = {
            let mut inner = self.lock();
            let (key, stored) = Self::stored_for_write(&mut inner, obj)?;

            let mut updated = with_status_of(&stored, obj)?;
            updated.meta_mut().resource_version = Some(Self::next_version(&mut inner));
            inner.objects.insert(key, updated.clone());
            inner.writes += 1;
            updated
        };
        self.publish(WatchEvent::Applied(updated.clone()));
        Ok(updated)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let event = {
            let mut inner = self.lock();
            Self::check_failure(&mut inner)?;
            let Some(mut stored) = inner.objects.get(key).cloned() else {
                return Ok(());
            };

            if stored.finalizers().is_empty() {
                inner.objects.remove(key);
                inner.writes += 1;
                WatchEvent::Deleted(stored)
            } else if stored.meta().deletion_timestamp.is_some() {
                return Ok(());
            } else {
                Self::mark_deleting(&mut stored)?;
                stored.meta_mut().resource_version = Some(Self::next_version(&mut inner));
                inner.objects.insert(key.clone(), stored.clone());
                inner.writes += 1;
                WatchEvent::Applied(stored)
            }
        };
        self.publish(event);
        Ok(())
    }

    fn watch(&self, namespace: Option<&str>) -> WatchStream<K> {
        let namespace = namespace.map(str::to_string);
        let rx = self.events.subscribe();

        let initial: Vec<Result<WatchEvent<K>, StoreError>> = self
            .lock()
            .objects
            .iter()
            .filter(|(key, _)| namespace.as_deref().is_none_or(|ns| key.namespace == ns))
            .map(|(_, obj)| Ok(WatchEvent::Applied(obj.clone())))
            .collect();

        let live = stream::unfold(rx, |mut rx| async move {
            match rx.recv().await {
                Ok(event) => Some((Ok(event), rx)),
                Err(broadcast::error::RecvError::Lagged(missed)) => Some((
                    Err(StoreError::Transient(format!("watch lagged by {} events", missed))),
                    rx,
                )),
                Err(broadcast::error::RecvError::Closed) => None,
            }
        })
        .filter(move |item| {
            let keep = match (item, namespace.as_deref()) {
                (Ok(event), Some(ns)) => event.object().meta().namespace.as_deref() == Some(ns),
                _ => true,
            };
            future::ready(keep)
        });

        stream::iter(initial).chain(live).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::{IPPool, IPPoolSpec, IPPoolStatus};
    use futures::StreamExt;

    fn pool(name: &str) -> IPPool {
        let mut pool = IPPool::new(
            name,
            IPPoolSpec {
                addresses: vec!["10.0.0.1".to_string()],
                prefix: 24,
                ..Default::default()
            },
        );
        pool.metadata.namespace = Some("default".to_string());
        pool
    }

    #[tokio::test]
    async fn test_update_with_stale_version_conflicts() {
        let store = MemoryStore::<IPPool>::new();
        let created = store.create(&pool("p1")).await.unwrap();

        let mut first = created.clone();
        first.spec.prefix = 25;
        store.update(&first).await.unwrap();

        let mut stale = created;
        stale.spec.prefix = 26;
        let err = store.update(&stale).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_update_does_not_touch_status() {
        let store = MemoryStore::<IPPool>::new();
        let mut created = store.create(&pool("p1")).await.unwrap();
        created.status = Some(IPPoolStatus {
            total_addresses: 1,
            ..Default::default()
        });
        let with_status = store.update_status(&created).await.unwrap();

        let mut spec_write = with_status.clone();
        spec_write.status = None;
        spec_write.spec.prefix = 25;
        let after = store.update(&spec_write).await.unwrap();

        assert_eq!(after.spec.prefix, 25);
        assert_eq!(after.status.map(|s| s.total_addresses), Some(1));
    }

    #[tokio::test]
    async fn test_delete_waits_for_finalizers() {
        let store = MemoryStore::<IPPool>::new();
        let mut obj = pool("p1");
        obj.metadata.finalizers = Some(vec!["example.com/hold".to_string()]);
        store.create(&obj).await.unwrap();
        let key = ObjectKey::new("default", "p1");

        store.delete(&key).await.unwrap();
        let marked = store.get(&key).await.unwrap();
        assert!(marked.metadata.deletion_timestamp.is_some());

        let mut release = marked;
        release.metadata.finalizers = Some(vec![]);
        store.update(&release).await.unwrap();
        assert!(store.get_opt(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_watch_replays_existing_then_streams_changes() {
        let store = MemoryStore::<IPPool>::new();
        store.seed(pool("p1")).unwrap();
        let mut events = store.watch(Some("default"));

        store.create(&pool("p2")).await.unwrap();
        store.delete(&ObjectKey::new("default", "p1")).await.unwrap();

        let names: Vec<(bool, String)> = events
            .by_ref()
            .take(3)
            .map(|e| {
                let e = e.unwrap();
                (matches!(e, WatchEvent::Applied(_)), e.object().name_any())
            })
            .collect()
            .await;
        assert_eq!(
            names,
            vec![
                (true, "p1".to_string()),
                (true, "p2".to_string()),
                (false, "p1".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_seed_is_not_a_write() {
        let store = MemoryStore::<IPPool>::new();
        store.seed(pool("p1")).unwrap();
        assert_eq!(store.write_count(), 0);
        store.delete(&ObjectKey::new("default", "missing")).await.unwrap();
        assert_eq!(store.write_count(), 0);
    }
}
