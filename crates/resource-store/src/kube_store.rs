//! Kubernetes-backed resource store
//!
//! Thin adapter from [`ObjectStore`] onto `kube::Api`. Status writes use a
//! merge patch that carries `metadata.resourceVersion`, which makes the API
//! server reject the patch with 409 when the object moved since it was read.

use crate::error::StoreError;
use crate::key::{LabelSelector, ObjectKey};
use crate::store_trait::{ObjectStore, WatchEvent, WatchStream};
use futures::{future, StreamExt};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use kube_runtime::{watcher, WatchStreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::fmt::Debug;
use std::marker::PhantomData;
use tracing::debug;

/// Which call an API error came from; 409 means different things for each
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb {
    Read,
    Create,
    Write,
}

/// [`ObjectStore`] backed by the Kubernetes API server
pub struct KubeStore<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Clone for KubeStore<K> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            _kind: PhantomData,
        }
    }
}

impl<K> KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
    <K as Resource>::DynamicType: Default,
{
    /// Creates a store for resource kind `K`
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }

    fn api(&self, namespace: Option<&str>) -> Api<K> {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

fn key_of<K: Resource>(obj: &K) -> Result<ObjectKey, StoreError> {
    ObjectKey::of(obj).ok_or_else(|| StoreError::NotFound("object has no name".to_string()))
}

/// Outcome class of an API status code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorClass {
    NotFound,
    AlreadyExists,
    Conflict,
    Transient,
    Fatal,
}

fn error_class(code: Option<u16>, verb: Verb) -> ErrorClass {
    match code {
        Some(404) => ErrorClass::NotFound,
        Some(409) if verb == Verb::Create => ErrorClass::AlreadyExists,
        Some(409) => ErrorClass::Conflict,
        Some(429) => ErrorClass::Transient,
        Some(code) if code >= 500 => ErrorClass::Transient,
        Some(_) => ErrorClass::Fatal,
        // Connection, TLS and timeout failures never reached the server's decision
        None => ErrorClass::Transient,
    }
}

/// Maps an API error onto the store taxonomy
fn classify(err: kube::Error, key: &ObjectKey, verb: Verb) -> StoreError {
    let code = match &err {
        kube::Error::Api(resp) => Some(resp.code),
        _ => None,
    };

    match error_class(code, verb) {
        ErrorClass::NotFound => StoreError::NotFound(key.to_string()),
        ErrorClass::AlreadyExists => StoreError::AlreadyExists(key.to_string()),
        ErrorClass::Conflict => StoreError::Conflict(key.to_string()),
        ErrorClass::Transient => StoreError::Transient(format!("{}: {}", key, err)),
        ErrorClass::Fatal => StoreError::Kube(err),
    }
}

#[async_trait::async_trait]
impl<K> ObjectStore<K> for KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static,
    <K as Resource>::DynamicType: Default,
{
    async fn get(&self, key: &ObjectKey) -> Result<K, StoreError> {
        self.api(Some(&key.namespace))
            .get(&key.name)
            .await
            .map_err(|e| classify(e, key, Verb::Read))
    }

    async fn list(&self, namespace: Option<&str>, selector: &LabelSelector) -> Result<Vec<K>, StoreError> {
        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels(&selector.to_string());
        }
        let scope = ObjectKey::new(namespace.unwrap_or("*"), "*");
        let list = self
            .api(namespace)
            .list(&params)
            .await
            .map_err(|e| classify(e, &scope, Verb::Read))?;
        Ok(list.items)
    }

    async fn create(&self, obj: &K) -> Result<K, StoreError> {
        let key = key_of(obj)?;
        debug!("Creating {}", key);
        self.api(Some(&key.namespace))
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| classify(e, &key, Verb::Create))
    }

    async fn update(&self, obj: &K) -> Result<K, StoreError> {
        let key = key_of(obj)?;
        debug!("Replacing {} at resourceVersion {:?}", key, obj.resource_version());
        self.api(Some(&key.namespace))
            .replace(&key.name, &PostParams::default(), obj)
            .await
            .map_err(|e| classify(e, &key, Verb::Write))
    }

    async fn update_status(&self, obj: &K) -> Result<K, StoreError> {
        let key = key_of(obj)?;
        let value = serde_json::to_value(obj)?;
        let patch = json!({
            "metadata": { "resourceVersion": obj.resource_version() },
            "status": value.get("status").cloned().unwrap_or_default(),
        });
        debug!("Patching status of {} at resourceVersion {:?}", key, obj.resource_version());
        self.api(Some(&key.namespace))
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| classify(e, &key, Verb::Write))
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        debug!("Deleting {}", key);
        match self
            .api(Some(&key.namespace))
            .delete(&key.name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => match classify(e, key, Verb::Write) {
                StoreError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    fn watch(&self, namespace: Option<&str>) -> WatchStream<K> {
        watcher(self.api(namespace), watcher::Config::default())
            .default_backoff()
            .filter_map(|event| {
                future::ready(match event {
                    Ok(watcher::Event::Apply(obj)) | Ok(watcher::Event::InitApply(obj)) => {
                        Some(Ok(WatchEvent::Applied(obj)))
                    }
                    Ok(watcher::Event::Delete(obj)) => Some(Ok(WatchEvent::Deleted(obj))),
                    Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => None,
                    Err(e) => Some(Err(StoreError::Transient(format!("watch stream: {}", e)))),
                })
            })
            .boxed()
    }
}
