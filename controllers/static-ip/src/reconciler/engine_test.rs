//! Unit tests for the claim fulfillment engine

#[cfg(test)]
mod tests {
    use crate::error::ReconcileError;
    use crate::queue::Action;
    use crate::reconciler::engine::{holder_id, Fulfillment, Wait};
    use crate::test_utils::*;
    use resource_store::{ObjectKey, ObjectStore};
    use std::collections::HashSet;
    use std::sync::Arc;
    use tokio::task::JoinSet;

    fn pool_key() -> ObjectKey {
        ObjectKey::new("default", "vm-net")
    }

    #[test]
    fn test_holder_id_is_qualified_across_namespaces() {
        let claim = ObjectKey::new("default", "m1-0");
        assert_eq!(holder_id(&pool_key(), &claim), "m1-0");
        assert_eq!(holder_id(&ObjectKey::new("infra", "vm-net"), &claim), "default/m1-0");
    }

    #[tokio::test]
    async fn test_allocate_picks_lowest_free_address_and_is_idempotent() {
        let stores = TestStores::new();
        stores
            .pools
            .seed(test_pool("vm-net", "default", &["10.0.0.3", "10.0.0.1", "10.0.0.2"]))
            .unwrap();
        stores.claims.seed(test_claim("m1-0", "default", "vm-net", "m1", Some(0))).unwrap();
        let reconciler = stores.reconciler();
        let claim = ObjectKey::new("default", "m1-0");

        let first = reconciler.engine.allocate(&pool_key(), &claim).await.unwrap();
        assert_eq!(first.address, "10.0.0.1");
        assert_eq!(first.gateway, "10.0.0.254");
        assert_eq!(first.prefix, 24);
        assert_eq!(first.dns_servers, vec!["10.0.0.53".to_string(), "10.0.0.54".to_string()]);

        let writes = stores.pools.write_count();
        let again = reconciler.engine.allocate(&pool_key(), &claim).await.unwrap();
        assert_eq!(again, first);
        assert_eq!(stores.pools.write_count(), writes);

        let status = stores.pools.peek(&pool_key()).unwrap().status.unwrap();
        assert_eq!(status.allocations.len(), 1);
        assert_eq!(status.allocated_addresses, 1);
        assert_eq!(status.available_addresses, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_allocations_never_share_an_address() {
        let stores = TestStores::new();
        let addresses: Vec<String> = (1..=8).map(|i| format!("10.0.0.{}", i)).collect();
        let refs: Vec<&str> = addresses.iter().map(String::as_str).collect();
        stores.pools.seed(test_pool("vm-net", "default", &refs)).unwrap();
        for i in 0..8 {
            stores
                .claims
                .seed(test_claim(&format!("m{}-0", i), "default", "vm-net", &format!("m{}", i), Some(0)))
                .unwrap();
        }
        let reconciler = Arc::new(stores.reconciler());

        let mut tasks = JoinSet::new();
        for i in 0..8 {
            let reconciler = Arc::clone(&reconciler);
            tasks.spawn(async move {
                let claim = ObjectKey::new("default", format!("m{}-0", i));
                reconciler.engine.allocate(&pool_key(), &claim).await
            });
        }

        let mut assigned = HashSet::new();
        while let Some(joined) = tasks.join_next().await {
            let address = joined.unwrap().unwrap();
            assert!(assigned.insert(address.address.clone()), "{} handed out twice", address.address);
        }
        assert_eq!(assigned.len(), 8);
        assert_eq!(stores.pools.peek(&pool_key()).unwrap().status.unwrap().allocations.len(), 8);

        stores.claims.seed(test_claim("m8-0", "default", "vm-net", "m8", Some(0))).unwrap();
        let result = reconciler
            .engine
            .allocate(&pool_key(), &ObjectKey::new("default", "m8-0"))
            .await;
        assert!(matches!(result, Err(ReconcileError::PoolExhausted(_))));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let stores = TestStores::new();
        stores.pools.seed(test_pool("vm-net", "default", &["10.0.0.1", "10.0.0.2"])).unwrap();
        stores.claims.seed(test_claim("m1-0", "default", "vm-net", "m1", Some(0))).unwrap();
        let reconciler = stores.reconciler();
        let claim = ObjectKey::new("default", "m1-0");

        reconciler.engine.allocate(&pool_key(), &claim).await.unwrap();
        let released = reconciler.engine.release(&pool_key(), &claim).await.unwrap();
        assert_eq!(released.as_deref(), Some("10.0.0.1"));
        let after_first = stores.pools.peek(&pool_key()).unwrap().status;
        let writes = stores.pools.write_count();

        let released = reconciler.engine.release(&pool_key(), &claim).await.unwrap();
        assert_eq!(released, None);
        assert_eq!(stores.pools.write_count(), writes);
        assert_eq!(stores.pools.peek(&pool_key()).unwrap().status, after_first);
        assert_eq!(after_first.unwrap().available_addresses, 2);
    }

    #[tokio::test]
    async fn test_release_from_missing_pool_succeeds() {
        let stores = TestStores::new();
        let reconciler = stores.reconciler();

        let released = reconciler
            .engine
            .release(&pool_key(), &ObjectKey::new("default", "m1-0"))
            .await
            .unwrap();
        assert_eq!(released, None);
        assert_eq!(stores.total_writes(), 0);
    }

    #[tokio::test]
    async fn test_allocate_retries_on_conflict() {
        let stores = TestStores::new();
        stores.pools.seed(test_pool("vm-net", "default", &["10.0.0.1"])).unwrap();
        stores.claims.seed(test_claim("m1-0", "default", "vm-net", "m1", Some(0))).unwrap();
        let reconciler = stores.reconciler();

        stores.pools.inject_conflicts(2);
        let address = reconciler
            .engine
            .allocate(&pool_key(), &ObjectKey::new("default", "m1-0"))
            .await
            .unwrap();
        assert_eq!(address.address, "10.0.0.1");
        assert_eq!(stores.pools.peek(&pool_key()).unwrap().status.unwrap().allocations.len(), 1);
    }

    #[tokio::test]
    async fn test_allocate_refuses_deleting_claim() {
        let stores = TestStores::new();
        stores.pools.seed(test_pool("vm-net", "default", &["10.0.0.1"])).unwrap();
        stores.claims.seed(test_claim("m1-0", "default", "vm-net", "m1", Some(0))).unwrap();
        let claim = ObjectKey::new("default", "m1-0");
        stores.claims.delete(&claim).await.unwrap();
        let reconciler = stores.reconciler();

        let result = reconciler.engine.allocate(&pool_key(), &claim).await;
        assert!(matches!(result, Err(ReconcileError::NotFound(_))));
        assert!(stores.pools.peek(&pool_key()).unwrap().status.is_none());
    }

    #[tokio::test]
    async fn test_allocate_from_missing_pool() {
        let stores = TestStores::new();
        stores.claims.seed(test_claim("m1-0", "default", "vm-net", "m1", Some(0))).unwrap();
        let reconciler = stores.reconciler();

        let result = reconciler
            .engine
            .allocate(&pool_key(), &ObjectKey::new("default", "m1-0"))
            .await;
        assert!(matches!(result, Err(ReconcileError::PoolNotFound(_))));
    }

    #[tokio::test]
    async fn test_allocate_binds_nothing_from_pool_without_gateway() {
        let stores = TestStores::new();
        let mut pool = test_pool("vm-net", "default", &["10.0.0.1"]);
        pool.spec.gateway = None;
        stores.pools.seed(pool).unwrap();
        stores.claims.seed(test_claim("m1-0", "default", "vm-net", "m1", Some(0))).unwrap();
        let reconciler = stores.reconciler();

        let result = reconciler
            .engine
            .allocate(&pool_key(), &ObjectKey::new("default", "m1-0"))
            .await;
        assert!(matches!(result, Err(ReconcileError::Validation(_))));
        assert!(stores.pools.peek(&pool_key()).unwrap().status.is_none());
        assert_eq!(stores.pools.write_count(), 0);
    }

    #[tokio::test]
    async fn test_lookup_follows_claim_lifecycle() {
        let stores = TestStores::new();
        stores.pools.seed(test_pool("vm-net", "default", &["10.0.0.1"])).unwrap();
        stores.claims.seed(test_claim("m1-0", "default", "vm-net", "m1", Some(0))).unwrap();
        let reconciler = stores.reconciler();
        let claim = ObjectKey::new("default", "m1-0");

        assert_eq!(
            reconciler.engine.lookup(&claim).await.unwrap(),
            Fulfillment::Pending(Wait::Allocating)
        );

        assert!(matches!(reconciler.reconcile_claim(&claim).await, Action::AwaitChange));
        match reconciler.engine.lookup(&claim).await.unwrap() {
            Fulfillment::Fulfilled(address) => {
                assert_eq!(address.address, "10.0.0.1");
                assert_eq!(address.search_domains, vec!["lab.example.com".to_string()]);
            }
            other => panic!("expected a fulfilled claim, got {:?}", other),
        }

        assert_eq!(
            reconciler.engine.lookup(&ObjectKey::new("default", "gone")).await.unwrap(),
            Fulfillment::Pending(Wait::Allocating)
        );
    }

    #[tokio::test]
    async fn test_starved_claim_is_fulfilled_after_release() {
        let stores = TestStores::new();
        stores.pools.seed(test_pool("vm-net", "default", &["10.0.0.1"])).unwrap();
        stores.claims.seed(test_claim("m1-0", "default", "vm-net", "m1", Some(0))).unwrap();
        stores.claims.seed(test_claim("m2-0", "default", "vm-net", "m2", Some(0))).unwrap();
        let reconciler = stores.reconciler();
        let first = ObjectKey::new("default", "m1-0");
        let second = ObjectKey::new("default", "m2-0");

        assert!(matches!(reconciler.reconcile_claim(&first).await, Action::AwaitChange));
        assert!(matches!(reconciler.reconcile_claim(&second).await, Action::Requeue(_)));
        assert_eq!(
            reconciler.engine.lookup(&second).await.unwrap(),
            Fulfillment::Pending(Wait::PoolExhausted)
        );

        stores.claims.delete(&first).await.unwrap();
        assert!(matches!(reconciler.reconcile_claim(&first).await, Action::AwaitChange));
        assert!(stores.claims.peek(&first).is_none());

        assert!(matches!(reconciler.reconcile_claim(&second).await, Action::AwaitChange));
        let status = stores.claims.peek(&second).unwrap().status.unwrap();
        assert_eq!(status.address.unwrap().address, "10.0.0.1");
    }

    #[tokio::test]
    async fn test_reconcile_pool_refreshes_counters_once() {
        let stores = TestStores::new();
        stores.pools.seed(test_pool("vm-net", "default", &["10.0.0.1", "10.0.0.2"])).unwrap();
        let reconciler = stores.reconciler();

        assert!(matches!(reconciler.reconcile_pool(&pool_key()).await, Action::Requeue(_)));
        let status = stores.pools.peek(&pool_key()).unwrap().status.unwrap();
        assert_eq!(status.total_addresses, 2);
        assert_eq!(status.available_addresses, 2);

        let writes = stores.pools.write_count();
        reconciler.reconcile_pool(&pool_key()).await;
        assert_eq!(stores.pools.write_count(), writes);
    }
}
