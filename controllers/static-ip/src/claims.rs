//! Claim identity, creation and lookup helpers.
//!
//! A claim's name is derived from its owner, so re-deriving it on every
//! reconciliation always lands on the same object and creation is
//! idempotent.

use crate::context::Context;
use crate::error::ReconcileError;
use crds::{
    ClaimOwnerRef, IPClaim, IPClaimSpec, IPPoolRef, OwnerKind, CLAIM_FINALIZER, CLUSTER_NAME_LABEL,
    OWNER_KIND_LABEL, OWNER_NAME_LABEL, POOL_ANNOTATION, POOL_LABEL,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use resource_store::{LabelSelector, ObjectKey};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Maximum length of a label value
const LABEL_VALUE_MAX: usize = 63;

/// Claim name for a machine device (`Some(index)`) or a cluster endpoint (`None`)
pub fn claim_name(owner: &str, device_index: Option<usize>) -> String {
    match device_index {
        Some(index) => format!("{}-{}", owner, index),
        None => owner.to_string(),
    }
}

/// Whether an object carries a finalizer
pub fn has_finalizer(meta: &ObjectMeta, finalizer: &str) -> bool {
    meta.finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == finalizer))
}

/// Adds a finalizer; returns whether the metadata changed
pub fn add_finalizer(meta: &mut ObjectMeta, finalizer: &str) -> bool {
    if has_finalizer(meta, finalizer) {
        return false;
    }
    meta.finalizers
        .get_or_insert_with(Vec::new)
        .push(finalizer.to_string());
    true
}

/// Removes a finalizer; returns whether the metadata changed
pub fn remove_finalizer(meta: &mut ObjectMeta, finalizer: &str) -> bool {
    if !has_finalizer(meta, finalizer) {
        return false;
    }
    if let Some(finalizers) = meta.finalizers.as_mut() {
        finalizers.retain(|f| f != finalizer);
    }
    true
}

fn insert_label(labels: &mut BTreeMap<String, String>, key: &str, value: &str) {
    if value.len() <= LABEL_VALUE_MAX {
        labels.insert(key.to_string(), value.to_string());
    }
}

/// The owner a claim is created for
#[derive(Debug, Clone)]
pub struct ClaimOwner {
    /// Owner kind
    pub kind: OwnerKind,
    /// Owner key; claims live in the owner's namespace
    pub key: ObjectKey,
    /// Controller reference, absent when the owner has no uid yet
    pub reference: Option<OwnerReference>,
}

impl ClaimOwner {
    fn matches(&self, claim: &IPClaim) -> bool {
        claim.spec.owner_ref.kind == self.kind && claim.spec.owner_ref.name == self.key.name
    }
}

/// Returns the claim for `(owner, device_index)`, creating it when absent.
///
/// An existing claim is returned as is, even if the owner's pool selection
/// changed since it was created.
pub async fn ensure_claim(
    ctx: &Context,
    owner: &ClaimOwner,
    pool: &ObjectKey,
    device_index: Option<usize>,
) -> Result<IPClaim, ReconcileError> {
    let name = claim_name(&owner.key.name, device_index);
    let key = owner.key.sibling(name.clone());

    let claim = match ctx.call("get claim", ctx.claims.get_opt(&key)).await? {
        Some(claim) => claim,
        None => {
            let claim = new_claim(owner, &name, pool, device_index)?;
            match ctx.call("create claim", ctx.claims.create(&claim)).await {
                Ok(created) => {
                    info!("Created IPClaim {} against pool {}", key, pool);
                    return Ok(created);
                }
                // Created concurrently or by an earlier, interrupted pass
                Err(ReconcileError::Conflict(_)) => ctx.call("get claim", ctx.claims.get(&key)).await?,
                Err(e) => return Err(e),
            }
        }
    };

    if !owner.matches(&claim) {
        return Err(ReconcileError::InvalidConfig(format!(
            "IPClaim {} belongs to {} {}, not {} {}",
            key, claim.spec.owner_ref.kind, claim.spec.owner_ref.name, owner.kind, owner.key.name
        )));
    }
    debug!("IPClaim {} already exists", key);
    Ok(claim)
}

fn new_claim(
    owner: &ClaimOwner,
    name: &str,
    pool: &ObjectKey,
    device_index: Option<usize>,
) -> Result<IPClaim, ReconcileError> {
    let device_index = device_index
        .map(u32::try_from)
        .transpose()
        .map_err(|_| ReconcileError::InvalidConfig(format!("device index of {} out of range", name)))?;

    let mut labels = BTreeMap::new();
    insert_label(&mut labels, OWNER_KIND_LABEL, owner.kind.as_str());
    insert_label(&mut labels, OWNER_NAME_LABEL, &owner.key.name);
    insert_label(&mut labels, POOL_LABEL, &pool.name);

    let mut claim = IPClaim::new(
        name,
        IPClaimSpec {
            pool_ref: IPPoolRef {
                name: pool.name.clone(),
                namespace: (pool.namespace != owner.key.namespace).then(|| pool.namespace.clone()),
            },
            owner_ref: ClaimOwnerRef {
                kind: owner.kind,
                name: owner.key.name.clone(),
            },
            device_index,
        },
    );
    claim.metadata.namespace = Some(owner.key.namespace.clone());
    claim.metadata.labels = Some(labels);
    claim.metadata.owner_references = owner.reference.clone().map(|r| vec![r]);
    claim.metadata.finalizers = Some(vec![CLAIM_FINALIZER.to_string()]);
    Ok(claim)
}

/// Key of the pool a claim draws from
pub fn pool_key_of(claim: &IPClaim, claim_key: &ObjectKey) -> ObjectKey {
    ObjectKey::new(
        claim
            .spec
            .pool_ref
            .namespace
            .clone()
            .unwrap_or_else(|| claim_key.namespace.clone()),
        claim.spec.pool_ref.name.clone(),
    )
}

/// Resolves the pool an owner allocates from.
///
/// The pool annotation wins; otherwise the owner's cluster label must select
/// exactly one pool in the owner's namespace.
pub async fn resolve_pool(
    ctx: &Context,
    owner_key: &ObjectKey,
    meta: &ObjectMeta,
) -> Result<ObjectKey, ReconcileError> {
    let annotated = meta
        .annotations
        .as_ref()
        .and_then(|a| a.get(POOL_ANNOTATION))
        .map(|name| name.trim())
        .filter(|name| !name.is_empty());

    if let Some(name) = annotated {
        let pool_key = owner_key.sibling(name);
        return match ctx.call("get pool", ctx.pools.get_opt(&pool_key)).await? {
            Some(_) => Ok(pool_key),
            None => Err(ReconcileError::PoolNotFound(pool_key.to_string())),
        };
    }

    let Some(cluster) = meta.labels.as_ref().and_then(|l| l.get(CLUSTER_NAME_LABEL)) else {
        return Err(ReconcileError::PoolNotFound(format!(
            "{} has neither the {} annotation nor the {} label",
            owner_key, POOL_ANNOTATION, CLUSTER_NAME_LABEL
        )));
    };

    let selector = LabelSelector::default().with(CLUSTER_NAME_LABEL, cluster.as_str());
    let pools = ctx
        .call("list pools", ctx.pools.list(Some(&owner_key.namespace), &selector))
        .await?;
    match pools.as_slice() {
        [pool] => ObjectKey::of(pool)
            .ok_or_else(|| ReconcileError::PoolNotFound(format!("pool for cluster {}", cluster))),
        [] => Err(ReconcileError::PoolNotFound(format!(
            "no IPPool in {} labelled {}={}",
            owner_key.namespace, CLUSTER_NAME_LABEL, cluster
        ))),
        many => Err(ReconcileError::InvalidConfig(format!(
            "{} IPPools in {} are labelled {}={}; annotate the owner with {}",
            many.len(),
            owner_key.namespace,
            CLUSTER_NAME_LABEL,
            cluster,
            POOL_ANNOTATION
        ))),
    }
}

/// Claims created for an owner
pub async fn owned_claims(ctx: &Context, kind: OwnerKind, owner_key: &ObjectKey) -> Result<Vec<IPClaim>, ReconcileError> {
    let selector = LabelSelector::default().with(OWNER_KIND_LABEL, kind.as_str());
    let claims = ctx
        .call("list claims", ctx.claims.list(Some(&owner_key.namespace), &selector))
        .await?;
    Ok(claims
        .into_iter()
        .filter(|c| c.spec.owner_ref.kind == kind && c.spec.owner_ref.name == owner_key.name)
        .collect())
}

/// Claims drawing from a pool that do not hold an address yet
pub async fn waiting_claims(ctx: &Context, pool_key: &ObjectKey) -> Result<Vec<ObjectKey>, ReconcileError> {
    let claims = ctx
        .call("list claims", ctx.claims.list(Some(&pool_key.namespace), &LabelSelector::default()))
        .await?;
    Ok(claims
        .iter()
        .filter(|c| c.fulfilled_address().is_none())
        .filter_map(|c| ObjectKey::of(c).map(|key| (pool_key_of(c, &key), key)))
        .filter(|(pool, _)| pool == pool_key)
        .map(|(_, key)| key)
        .collect())
}
