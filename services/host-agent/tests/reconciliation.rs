//! Integration tests for the claim-and-reconcile flow.
//!
//! Several agents share one in-memory coordination store, standing in for a
//! fleet of hosts pointed at the same etcd. Mock drivers record hypervisor
//! and storage calls; lease expiry is driven with the paused tokio clock.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use corral_coord::{CoordError, CoordStore, CreateOutcome, MemoryStore};
use corral_host_agent::claim::{ClaimManager, ClaimOutcome};
use corral_host_agent::config::Config;
use corral_host_agent::keys;
use corral_host_agent::records::{ClaimRecord, DesiredPlacement, HostRecord, ResourceRequest};
use corral_host_agent::reconciler::Reconciler;
use corral_host_agent::virt::MockVirt;
use corral_host_agent::volume::MockVolumes;
use futures_util::future::join_all;
use tokio::sync::watch;

fn test_config(host_id: &str) -> Config {
    Config {
        host_id: host_id.to_string(),
        store_url: "http://127.0.0.1:2379".to_string(),
        data_dir: "/tmp/host-agent-test".to_string(),
        tick_interval_secs: 2,
        claim_ttl_secs: 5,
        host_ttl_secs: 5,
        total_ram_mib: 8192,
        total_vcpu: 4,
        source_image: "images/cirros-0.3.3-x86_64-disk.raw".to_string(),
        volume_pool: "volumes".to_string(),
        mock_drivers: true,
    }
}

struct TestHost {
    reconciler: Reconciler,
    virt: Arc<MockVirt>,
    volumes: Arc<MockVolumes>,
}

fn host_over(host_id: &str, store: Arc<dyn CoordStore>) -> TestHost {
    let virt = Arc::new(MockVirt::new());
    let volumes = Arc::new(MockVolumes::new());

    let reconciler = Reconciler::new(&test_config(host_id), store, virt.clone(), volumes.clone());
    TestHost {
        reconciler,
        virt,
        volumes,
    }
}

fn test_host(host_id: &str, store: &MemoryStore) -> TestHost {
    host_over(host_id, Arc::new(store.clone()))
}

fn failing_volume_host(host_id: &str, store: &MemoryStore) -> TestHost {
    let virt = Arc::new(MockVirt::new());
    let volumes = Arc::new(MockVolumes::failing());
    let store: Arc<dyn CoordStore> = Arc::new(store.clone());

    let reconciler = Reconciler::new(&test_config(host_id), store, virt.clone(), volumes.clone());
    TestHost {
        reconciler,
        virt,
        volumes,
    }
}

async fn seed_desired(store: &MemoryStore, placement_id: &str, name: &str, ram_mib: u64, vcpus: u32) {
    let placement = DesiredPlacement {
        name: name.to_string(),
        resources: ResourceRequest { ram_mib, vcpus },
        source_image: None,
    };
    store
        .write(
            &keys::desired(placement_id),
            &serde_json::to_string(&placement).unwrap(),
            None,
        )
        .await
        .unwrap();
}

async fn read_claim(store: &MemoryStore, placement_id: &str) -> Option<ClaimRecord> {
    store
        .read(&keys::claimed(placement_id))
        .await
        .unwrap()
        .map(|raw| serde_json::from_str(&raw).unwrap())
}

/// Store wrapper whose operations can be switched to fail, standing in for
/// an etcd that is unreachable or misbehaving.
#[derive(Clone)]
struct FlakyStore {
    inner: MemoryStore,
    failure: Arc<Mutex<Option<CoordError>>>,
}

impl FlakyStore {
    fn new(inner: &MemoryStore) -> Self {
        Self {
            inner: inner.clone(),
            failure: Arc::new(Mutex::new(None)),
        }
    }

    fn fail_with(&self, error: CoordError) {
        *self.failure.lock().unwrap() = Some(error);
    }

    fn recover(&self) {
        *self.failure.lock().unwrap() = None;
    }

    fn check(&self) -> Result<(), CoordError> {
        match &*self.failure.lock().unwrap() {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CoordStore for FlakyStore {
    async fn read(&self, key: &str) -> Result<Option<String>, CoordError> {
        self.check()?;
        self.inner.read(key).await
    }

    async fn write(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), CoordError> {
        self.check()?;
        self.inner.write(key, value, ttl).await
    }

    async fn create_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<CreateOutcome, CoordError> {
        self.check()?;
        self.inner.create_if_absent(key, value, ttl).await
    }

    async fn list_children(&self, key: &str) -> Result<BTreeMap<String, String>, CoordError> {
        self.check()?;
        self.inner.list_children(key).await
    }
}

#[tokio::test]
async fn test_single_host_claims_and_starts_instance() {
    let store = MemoryStore::new();
    let mut host = test_host("h1", &store);
    seed_desired(&store, "vm-1", "web-1", 2048, 2).await;

    let stats = host.reconciler.tick().await.unwrap();

    assert_eq!(stats.claims_won, 1);
    assert_eq!(stats.instances_created, 1);
    assert_eq!(stats.claims_refreshed, 1);
    assert_eq!(host.reconciler.instance_count(), 1);

    let claim = read_claim(&store, "vm-1").await.unwrap();
    assert_eq!(claim.host, "h1");
    assert_eq!(claim.instance.as_deref(), Some("vm-1-web-1"));

    let started = host.virt.started().await;
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].name, "vm-1-web-1");
    assert_eq!(started[0].memory_kib, 2048 * 1024);
    assert_eq!(started[0].vcpus, 2);

    let created = host.volumes.created().await;
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].0, "vm-vm-1-0");
}

#[tokio::test]
async fn test_claimed_placements_are_not_taken_twice() {
    let store = MemoryStore::new();
    let mut h1 = test_host("h1", &store);
    let mut h2 = test_host("h2", &store);
    seed_desired(&store, "vm-1", "web-1", 1024, 1).await;

    h1.reconciler.tick().await.unwrap();
    let stats = h2.reconciler.tick().await.unwrap();

    assert_eq!(stats.claims_won, 0);
    assert_eq!(stats.instances_created, 0);
    assert_eq!(h1.reconciler.instance_count() + h2.reconciler.instance_count(), 1);
    assert!(h2.virt.started().await.is_empty());
    assert_eq!(read_claim(&store, "vm-1").await.unwrap().host, "h1");
}

#[tokio::test]
async fn test_concurrent_claim_race_admits_one_winner() {
    let store = MemoryStore::new();
    let coord: Arc<dyn CoordStore> = Arc::new(store.clone());

    let managers: Vec<ClaimManager> = (0..8)
        .map(|i| ClaimManager::new(Arc::clone(&coord), &format!("h{i}"), Duration::from_secs(5)))
        .collect();

    let outcomes = join_all(managers.iter().map(|m| m.try_claim("vm-1"))).await;

    let won = outcomes
        .iter()
        .filter(|o| matches!(o.as_ref().unwrap(), ClaimOutcome::Claimed))
        .count();
    assert_eq!(won, 1);
}

#[tokio::test]
async fn test_work_spreads_across_unclaimed_placements() {
    let store = MemoryStore::new();
    let mut h1 = test_host("h1", &store);
    let mut h2 = test_host("h2", &store);

    seed_desired(&store, "vm-1", "web-1", 1024, 1).await;
    h1.reconciler.tick().await.unwrap();

    seed_desired(&store, "vm-2", "web-2", 1024, 1).await;
    let stats = h2.reconciler.tick().await.unwrap();

    // vm-1 is already claimed by h1, so h2 picks up only vm-2.
    assert_eq!(stats.claims_won, 1);
    assert_eq!(read_claim(&store, "vm-1").await.unwrap().host, "h1");
    assert_eq!(read_claim(&store, "vm-2").await.unwrap().host, "h2");
}

#[tokio::test]
async fn test_steady_state_ticks_are_idempotent() {
    let store = MemoryStore::new();
    let mut host = test_host("h1", &store);
    seed_desired(&store, "vm-1", "web-1", 1024, 1).await;

    host.reconciler.tick().await.unwrap();
    let stats = host.reconciler.tick().await.unwrap();

    assert_eq!(stats.claims_won, 0);
    assert_eq!(stats.instances_created, 0);
    assert_eq!(stats.instances_destroyed, 0);
    assert_eq!(stats.claims_refreshed, 1);
    assert_eq!(host.virt.started().await.len(), 1);
    assert_eq!(host.volumes.created().await.len(), 1);
}

#[tokio::test]
async fn test_placement_removal_tears_down_instance() {
    let store = MemoryStore::new();
    let mut host = test_host("h1", &store);
    seed_desired(&store, "vm-1", "web-1", 1024, 1).await;

    host.reconciler.tick().await.unwrap();
    assert_eq!(host.reconciler.instance_count(), 1);

    store.remove(&keys::desired("vm-1")).await;
    let stats = host.reconciler.tick().await.unwrap();

    assert_eq!(stats.instances_destroyed, 1);
    assert_eq!(host.reconciler.instance_count(), 0);
    assert_eq!(host.virt.stopped().await, vec!["vm-1-web-1".to_string()]);
    assert_eq!(host.virt.undefined().await, vec!["vm-1-web-1".to_string()]);
    assert_eq!(host.volumes.deleted().await, vec!["mock/vm-vm-1-0".to_string()]);
}

#[tokio::test]
async fn test_same_requested_name_yields_distinct_domains() {
    let store = MemoryStore::new();
    let mut host = test_host("h1", &store);
    seed_desired(&store, "vm-1", "web", 1024, 1).await;
    seed_desired(&store, "vm-2", "web", 1024, 1).await;

    host.reconciler.tick().await.unwrap();

    let started = host.virt.started().await;
    assert_eq!(started.len(), 2);
    assert_ne!(started[0].name, started[1].name);

    // Tearing down one placement must not touch the other's domain.
    store.remove(&keys::desired("vm-1")).await;
    host.reconciler.tick().await.unwrap();

    assert_eq!(host.reconciler.instance_count(), 1);
    assert_eq!(host.virt.stopped().await, vec!["vm-1-web".to_string()]);
    assert_eq!(
        read_claim(&store, "vm-2").await.unwrap().instance.as_deref(),
        Some("vm-2-web")
    );
}

#[tokio::test(start_paused = true)]
async fn test_lapsed_claim_is_retaken_by_another_host() {
    let store = MemoryStore::new();
    let mut h1 = test_host("h1", &store);
    let mut h2 = test_host("h2", &store);
    seed_desired(&store, "vm-1", "web-1", 1024, 1).await;

    h1.reconciler.tick().await.unwrap();
    assert_eq!(read_claim(&store, "vm-1").await.unwrap().host, "h1");

    // h1 goes silent; its claim lease lapses.
    tokio::time::advance(Duration::from_secs(6)).await;
    assert!(read_claim(&store, "vm-1").await.is_none());

    let stats = h2.reconciler.tick().await.unwrap();
    assert_eq!(stats.claims_won, 1);
    assert_eq!(h2.reconciler.instance_count(), 1);
    assert_eq!(read_claim(&store, "vm-1").await.unwrap().host, "h2");
}

#[tokio::test(start_paused = true)]
async fn test_refreshed_claim_outlives_its_original_lease() {
    let store = MemoryStore::new();
    let mut host = test_host("h1", &store);
    seed_desired(&store, "vm-1", "web-1", 1024, 1).await;

    host.reconciler.tick().await.unwrap();
    tokio::time::advance(Duration::from_secs(3)).await;
    host.reconciler.tick().await.unwrap();
    tokio::time::advance(Duration::from_secs(3)).await;

    // Six seconds after the claim was first written, the refresh from the
    // second tick is still holding it.
    assert_eq!(read_claim(&store, "vm-1").await.unwrap().host, "h1");
}

#[tokio::test(start_paused = true)]
async fn test_failed_realization_holds_claim_until_lease_lapses() {
    let store = MemoryStore::new();
    let mut broken = failing_volume_host("h1", &store);
    let mut healthy = test_host("h2", &store);
    seed_desired(&store, "vm-1", "web-1", 1024, 1).await;

    let stats = broken.reconciler.tick().await.unwrap();
    assert_eq!(stats.claims_won, 1);
    assert_eq!(stats.create_failures, 1);
    assert_eq!(broken.reconciler.instance_count(), 0);
    assert!(broken.virt.started().await.is_empty());

    // The failed claim is still held, so the healthy host cannot move yet.
    let stats = healthy.reconciler.tick().await.unwrap();
    assert_eq!(stats.claims_won, 0);
    assert_eq!(healthy.reconciler.instance_count(), 0);

    // Once the lease lapses the healthy host takes over.
    tokio::time::advance(Duration::from_secs(6)).await;
    let stats = healthy.reconciler.tick().await.unwrap();
    assert_eq!(stats.claims_won, 1);
    assert_eq!(healthy.reconciler.instance_count(), 1);
    assert_eq!(read_claim(&store, "vm-1").await.unwrap().host, "h2");
}

#[tokio::test]
async fn test_start_failure_leaves_volume_behind() {
    let store = MemoryStore::new();
    let virt = Arc::new(MockVirt::failing());
    let volumes = Arc::new(MockVolumes::new());
    let coord: Arc<dyn CoordStore> = Arc::new(store.clone());
    let mut reconciler =
        Reconciler::new(&test_config("h1"), coord, virt.clone(), volumes.clone());
    seed_desired(&store, "vm-1", "web-1", 1024, 1).await;

    let stats = reconciler.tick().await.unwrap();

    assert_eq!(stats.create_failures, 1);
    assert_eq!(reconciler.instance_count(), 0);
    assert_eq!(volumes.created().await.len(), 1);
    assert!(volumes.deleted().await.is_empty());
    assert_eq!(read_claim(&store, "vm-1").await.unwrap().host, "h1");
}

#[tokio::test]
async fn test_heartbeat_advertises_capacity_and_usage() {
    let store = MemoryStore::new();
    let mut host = test_host("h1", &store);
    seed_desired(&store, "vm-1", "web-1", 2048, 2).await;

    host.reconciler.tick().await.unwrap();
    // The first tick heartbeats before claiming; the second reflects usage.
    host.reconciler.tick().await.unwrap();

    let raw = store.read(&keys::host("h1")).await.unwrap().unwrap();
    let record: HostRecord = serde_json::from_str(&raw).unwrap();
    assert_eq!(record.name, "h1");
    assert_eq!(record.total_ram, 8192);
    assert_eq!(record.total_vcpu, 4);
    assert_eq!(record.used_ram, 2048);
    assert_eq!(record.used_vcpu, 2);
}

#[tokio::test]
async fn test_malformed_placement_does_not_block_others() {
    let store = MemoryStore::new();
    let mut host = test_host("h1", &store);

    store
        .write(&keys::desired("vm-bad"), "not json", None)
        .await
        .unwrap();
    seed_desired(&store, "vm-1", "web-1", 1024, 1).await;

    let stats = host.reconciler.tick().await.unwrap();

    assert_eq!(stats.claims_won, 1);
    assert_eq!(host.reconciler.instance_count(), 1);
    assert!(read_claim(&store, "vm-bad").await.is_none());
}

#[tokio::test]
async fn test_malformed_placement_value_does_not_tear_down_its_instance() {
    let store = MemoryStore::new();
    let mut host = test_host("h1", &store);
    seed_desired(&store, "vm-1", "web-1", 1024, 1).await;

    host.reconciler.tick().await.unwrap();
    assert_eq!(host.reconciler.instance_count(), 1);

    // The desired value is corrupted but the key is still present, so the
    // placement has not been removed and the instance must stay up.
    store
        .write(&keys::desired("vm-1"), "not json", None)
        .await
        .unwrap();
    let stats = host.reconciler.tick().await.unwrap();

    assert_eq!(stats.instances_destroyed, 0);
    assert_eq!(host.reconciler.instance_count(), 1);
    assert!(host.virt.stopped().await.is_empty());
}

#[tokio::test]
async fn test_shutdown_tears_down_local_instances() {
    let store = MemoryStore::new();
    let host = test_host("h1", &store);
    seed_desired(&store, "vm-1", "web-1", 1024, 1).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(host.reconciler.run(shutdown_rx));

    // Let the first tick claim and start the instance.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(host.virt.started().await.len(), 1);

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    assert_eq!(host.virt.stopped().await, vec!["vm-1-web-1".to_string()]);
    assert_eq!(host.virt.undefined().await, vec!["vm-1-web-1".to_string()]);
    assert_eq!(host.volumes.deleted().await, vec!["mock/vm-vm-1-0".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_transient_store_outage_is_ridden_out() {
    let store = MemoryStore::new();
    let flaky = FlakyStore::new(&store);
    let host = host_over("h1", Arc::new(flaky.clone()));
    seed_desired(&store, "vm-1", "web-1", 1024, 1).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(host.reconciler.run(shutdown_rx));

    // First tick claims and starts the instance.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(host.virt.started().await.len(), 1);

    // The store goes dark across the second tick; nothing is torn down.
    flaky.fail_with(CoordError::Unavailable("connection refused".to_string()));
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(host.virt.stopped().await.is_empty());

    // After recovery the loop resumes refreshing: the claim is still held
    // past its original five-second lease.
    flaky.recover();
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(read_claim(&store, "vm-1").await.unwrap().host, "h1");
    assert!(host.virt.stopped().await.is_empty());

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_fatal_store_error_tears_down_and_exits() {
    let store = MemoryStore::new();
    let flaky = FlakyStore::new(&store);
    let host = host_over("h1", Arc::new(flaky.clone()));
    seed_desired(&store, "vm-1", "web-1", 1024, 1).await;

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(host.reconciler.run(shutdown_rx));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(host.virt.started().await.len(), 1);

    // Serialization failures are not retryable.
    flaky.fail_with(CoordError::Serialization("bad record".to_string()));
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(handle.await.unwrap().is_err());
    assert_eq!(host.virt.stopped().await, vec!["vm-1-web-1".to_string()]);
    assert_eq!(host.virt.undefined().await, vec!["vm-1-web-1".to_string()]);
    assert_eq!(host.volumes.deleted().await, vec!["mock/vm-vm-1-0".to_string()]);
}
