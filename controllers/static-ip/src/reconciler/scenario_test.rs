//! Owner lifecycle tests driving the reconcilers the way watch events do

#[cfg(test)]
mod tests {
    use crate::queue::Action;
    use crate::test_utils::*;
    use crds::{find_condition, ConditionStatus, HasConditions, VSphereMachine, STATIC_IP_CONFIGURED};
    use resource_store::{ObjectKey, ObjectStore};
    use std::time::Duration;

    fn machine_key(name: &str) -> ObjectKey {
        ObjectKey::new("default", name)
    }

    fn configured_reason(machine: &VSphereMachine) -> (ConditionStatus, Option<String>) {
        let condition = find_condition(machine.conditions(), STATIC_IP_CONFIGURED).unwrap();
        (condition.status.clone(), condition.reason.clone())
    }

    /// Seeds a pool and a single-device machine, then runs owner, claim and
    /// owner passes until the machine is configured
    async fn configured_machine(stores: &TestStores, reconciler: &crate::reconciler::Reconciler) {
        stores.pools.seed(test_pool("vm-net", "default", &["10.0.0.1", "10.0.0.2"])).unwrap();
        stores
            .machines
            .seed(test_machine("m1", "default", vec![static_device()], Some("vm-net")))
            .unwrap();

        assert!(matches!(reconciler.reconcile_machine(&machine_key("m1")).await, Action::Requeue(_)));
        assert!(matches!(reconciler.reconcile_claim(&machine_key("m1-0")).await, Action::AwaitChange));
        assert!(matches!(
            reconciler.reconcile_machine(&machine_key("m1")).await,
            Action::Requeue(d) if d == Duration::from_secs(600)
        ));
    }

    #[tokio::test]
    async fn test_static_device_gets_first_pool_address() {
        let stores = TestStores::new();
        let reconciler = stores.reconciler();
        configured_machine(&stores, &reconciler).await;

        let machine = stores.machines.peek(&machine_key("m1")).unwrap();
        let device = &machine.spec.network.devices[0];
        assert_eq!(device.ip_addrs, vec!["10.0.0.1/24".to_string()]);
        assert_eq!(device.gateway4.as_deref(), Some("10.0.0.254"));
        assert_eq!(device.nameservers, vec!["10.0.0.53".to_string(), "10.0.0.54".to_string()]);
        assert_eq!(device.search_domains, vec!["lab.example.com".to_string()]);
        assert_eq!(configured_reason(&machine), (ConditionStatus::True, Some("Configured".to_string())));

        let pool = stores.pools.peek(&machine_key("vm-net")).unwrap().status.unwrap();
        assert_eq!(pool.allocations.len(), 1);
        assert_eq!(pool.allocations[0].address, "10.0.0.1");
        assert_eq!(pool.allocations[0].claim, "m1-0");
    }

    #[tokio::test]
    async fn test_converged_owner_is_not_written_again() {
        let stores = TestStores::new();
        let reconciler = stores.reconciler();
        configured_machine(&stores, &reconciler).await;
        reconciler.reconcile_pool(&machine_key("vm-net")).await;

        let writes = stores.total_writes();
        reconciler.reconcile_machine(&machine_key("m1")).await;
        reconciler.reconcile_claim(&machine_key("m1-0")).await;
        reconciler.reconcile_pool(&machine_key("vm-net")).await;
        reconciler.reconcile_machine(&machine_key("m1")).await;
        assert_eq!(stores.total_writes(), writes);
    }

    #[tokio::test]
    async fn test_switching_to_dhcp_leaves_claim_alone() {
        let stores = TestStores::new();
        let reconciler = stores.reconciler();
        configured_machine(&stores, &reconciler).await;

        let mut machine = stores.machines.peek(&machine_key("m1")).unwrap();
        machine.spec.network.devices[0] = dhcp_device();
        stores.machines.update(&machine).await.unwrap();

        assert!(matches!(reconciler.reconcile_machine(&machine_key("m1")).await, Action::AwaitChange));
        let claim = stores.claims.peek(&machine_key("m1-0")).unwrap();
        assert_eq!(claim.fulfilled_address().map(|a| a.address.as_str()), Some("10.0.0.1"));
        assert!(stores.machines.peek(&machine_key("m1")).unwrap().spec.network.devices[0].ip_addrs.is_empty());
        assert_eq!(
            stores.pools.peek(&machine_key("vm-net")).unwrap().status.unwrap().allocations.len(),
            1
        );
    }

    #[tokio::test]
    async fn test_exhausted_pool_leaves_device_empty() {
        let stores = TestStores::new();
        stores.pools.seed(test_pool("vm-net", "default", &["10.0.0.1"])).unwrap();
        for name in ["m1", "m2"] {
            stores
                .machines
                .seed(test_machine(name, "default", vec![static_device()], Some("vm-net")))
                .unwrap();
        }
        let reconciler = stores.reconciler();

        for name in ["m1", "m2"] {
            reconciler.reconcile_machine(&machine_key(name)).await;
            reconciler.reconcile_claim(&machine_key(&format!("{}-0", name))).await;
        }
        assert!(matches!(reconciler.reconcile_machine(&machine_key("m2")).await, Action::Requeue(d) if d < Duration::from_secs(600)));

        let m2 = stores.machines.peek(&machine_key("m2")).unwrap();
        assert!(m2.spec.network.devices[0].ip_addrs.is_empty());
        assert_eq!(configured_reason(&m2), (ConditionStatus::False, Some("PoolExhausted".to_string())));
        let claim = stores.claims.peek(&machine_key("m2-0")).unwrap();
        assert!(claim.fulfilled_address().is_none());
    }

    #[tokio::test]
    async fn test_deleting_owner_returns_its_addresses() {
        let stores = TestStores::new();
        let reconciler = stores.reconciler();
        configured_machine(&stores, &reconciler).await;

        stores.machines.delete(&machine_key("m1")).await.unwrap();
        assert!(stores.machines.peek(&machine_key("m1")).is_some());
        assert!(matches!(reconciler.reconcile_machine(&machine_key("m1")).await, Action::AwaitChange));

        assert!(stores.machines.peek(&machine_key("m1")).is_none());
        assert!(stores.claims.peek(&machine_key("m1-0")).is_none());
        let pool = stores.pools.peek(&machine_key("vm-net")).unwrap().status.unwrap();
        assert!(pool.allocations.is_empty());
        assert_eq!(pool.available_addresses, 2);

        stores
            .machines
            .seed(test_machine("m3", "default", vec![static_device()], Some("vm-net")))
            .unwrap();
        reconciler.reconcile_machine(&machine_key("m3")).await;
        reconciler.reconcile_claim(&machine_key("m3-0")).await;
        reconciler.reconcile_machine(&machine_key("m3")).await;
        let m3 = stores.machines.peek(&machine_key("m3")).unwrap();
        assert_eq!(m3.spec.network.devices[0].ip_addrs, vec!["10.0.0.1/24".to_string()]);
    }

    #[tokio::test]
    async fn test_dhcp_machine_is_never_touched() {
        let stores = TestStores::new();
        stores.pools.seed(test_pool("vm-net", "default", &["10.0.0.1"])).unwrap();
        stores
            .machines
            .seed(test_machine("m1", "default", vec![dhcp_device(), dhcp_device()], Some("vm-net")))
            .unwrap();
        let reconciler = stores.reconciler();

        for _ in 0..3 {
            assert!(matches!(reconciler.reconcile_machine(&machine_key("m1")).await, Action::AwaitChange));
        }
        assert!(stores.claims.objects().is_empty());
        assert_eq!(stores.total_writes(), 0);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried_quietly() {
        let stores = TestStores::new();
        stores.pools.seed(test_pool("vm-net", "default", &["10.0.0.1"])).unwrap();
        stores
            .machines
            .seed(test_machine("m1", "default", vec![static_device()], Some("vm-net")))
            .unwrap();
        let reconciler = stores.reconciler();

        stores.machines.inject_failures(1);
        assert!(matches!(
            reconciler.reconcile_machine(&machine_key("m1")).await,
            Action::Requeue(d) if d < Duration::from_secs(1)
        ));
        let machine = stores.machines.peek(&machine_key("m1")).unwrap();
        assert!(machine.conditions().is_empty());
        assert_eq!(stores.total_writes(), 0);
    }

    #[tokio::test]
    async fn test_cluster_endpoint_gets_pool_address() {
        let stores = TestStores::new();
        stores.pools.seed(test_pool("vm-net", "default", &["10.0.0.1", "10.0.0.2"])).unwrap();
        stores.clusters.seed(test_cluster("workload", "default", Some("vm-net"))).unwrap();
        let reconciler = stores.reconciler();
        let key = machine_key("workload");

        assert!(matches!(reconciler.reconcile_cluster(&key).await, Action::Requeue(_)));
        let claim = stores.claims.peek(&key).unwrap();
        assert_eq!(claim.spec.device_index, None);

        reconciler.reconcile_claim(&key).await;
        reconciler.reconcile_cluster(&key).await;
        let endpoint = stores.clusters.peek(&key).unwrap().spec.control_plane_endpoint;
        assert_eq!(endpoint.host, "10.0.0.1");
        assert_eq!(endpoint.port, 6443);

        let writes = stores.total_writes();
        assert!(matches!(reconciler.reconcile_cluster(&key).await, Action::AwaitChange));
        assert_eq!(stores.total_writes(), writes);
    }

    #[tokio::test]
    async fn test_deleting_cluster_returns_endpoint_address() {
        let stores = TestStores::new();
        stores.pools.seed(test_pool("vm-net", "default", &["10.0.0.1"])).unwrap();
        stores.clusters.seed(test_cluster("workload", "default", Some("vm-net"))).unwrap();
        let reconciler = stores.reconciler();
        let key = machine_key("workload");

        reconciler.reconcile_cluster(&key).await;
        reconciler.reconcile_claim(&key).await;
        reconciler.reconcile_cluster(&key).await;
        assert_eq!(stores.clusters.peek(&key).unwrap().spec.control_plane_endpoint.host, "10.0.0.1");

        stores.clusters.delete(&key).await.unwrap();
        assert!(stores.clusters.peek(&key).is_some());
        assert!(matches!(reconciler.reconcile_cluster(&key).await, Action::AwaitChange));

        assert!(stores.clusters.peek(&key).is_none());
        assert!(stores.claims.peek(&key).is_none());
        let pool = stores.pools.peek(&machine_key("vm-net")).unwrap().status.unwrap();
        assert!(pool.allocations.is_empty());
        assert_eq!(pool.available_addresses, 1);
    }

    #[tokio::test]
    async fn test_endpoint_from_pool_without_gateway_is_reported() {
        let stores = TestStores::new();
        let mut pool = test_pool("vm-net", "default", &["10.0.0.1"]);
        pool.spec.gateway = None;
        stores.pools.seed(pool).unwrap();
        stores.clusters.seed(test_cluster("workload", "default", Some("vm-net"))).unwrap();
        let reconciler = stores.reconciler();
        let key = machine_key("workload");

        reconciler.reconcile_cluster(&key).await;
        reconciler.reconcile_claim(&key).await;
        assert!(matches!(
            reconciler.reconcile_cluster(&key).await,
            Action::Requeue(d) if d == Duration::from_secs(600)
        ));

        let cluster = stores.clusters.peek(&key).unwrap();
        assert!(cluster.spec.control_plane_endpoint.host.is_empty());
        let condition = find_condition(cluster.conditions(), STATIC_IP_CONFIGURED).unwrap();
        assert_eq!(condition.status, ConditionStatus::False);
        assert_eq!(condition.reason.as_deref(), Some("ValidationFailed"));
        assert!(condition.message.as_deref().is_some_and(|m| m.contains("has no gateway")));
        assert!(stores
            .pools
            .peek(&machine_key("vm-net"))
            .unwrap()
            .status
            .is_none_or(|s| s.allocations.is_empty()));
    }

    #[tokio::test]
    async fn test_dhcp_endpoint_is_skipped() {
        let stores = TestStores::new();
        stores.pools.seed(test_pool("vm-net", "default", &["10.0.0.1"])).unwrap();
        let mut cluster = test_cluster("workload", "default", Some("vm-net"));
        cluster
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(crds::ENDPOINT_MODE_ANNOTATION.to_string(), "dhcp".to_string());
        stores.clusters.seed(cluster).unwrap();
        let reconciler = stores.reconciler();

        assert!(matches!(reconciler.reconcile_cluster(&machine_key("workload")).await, Action::AwaitChange));
        assert!(stores.claims.objects().is_empty());
    }
}
