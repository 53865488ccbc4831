use caphub_core::store::local::LocalStore;
use caphub_core::store::remote::{RemoteConfig, RemoteStore};
use caphub_core::{
    Capability, CapabilityType, CatalogStore, ChildScope, Organization, StoreError, UsageRecord,
};
use std::time::Duration;
use tempfile::TempDir;

// Endpoint that refuses connections immediately; used to prove a test path
// never reaches the network.
const DEAD_ENDPOINT: &str = "http://127.0.0.1:9/snapshot";

fn offline_config(ttl: Duration) -> RemoteConfig {
    RemoteConfig {
        endpoint: DEAD_ENDPOINT.to_string(),
        repository: "catalog".to_string(),
        bearer_token: None,
        snapshot_ttl: ttl,
    }
}

/// Builds a checkout directory whose `.caphub/snapshot.db` holds a seeded
/// catalog. The snapshot uses the writable local schema, which is what the
/// registry serves.
fn seeded_checkout() -> TempDir {
    let checkout = TempDir::new().unwrap();
    std::fs::create_dir_all(checkout.path().join("src")).unwrap();

    let seed = TempDir::new().unwrap();
    {
        let local = LocalStore::open(seed.path()).unwrap();
        let mut parent = Organization::new("acme", "ACME");
        parent.children = vec!["acme-labs".to_string()];
        local.create_organization(&parent, false).unwrap();
        local
            .create_organization(&Organization::new("acme-labs", "ACME Labs"), false)
            .unwrap();
        local
            .create_capability(
                &Capability::new("Ping", CapabilityType::Local, "ping.sh", "acme"),
                false,
            )
            .unwrap();
        local
            .create_capability(
                &Capability::new("Trace", CapabilityType::Local, "trace.sh", "acme-labs"),
                false,
            )
            .unwrap();
        let mut hidden = Organization::new("hidden", "Hidden");
        hidden.installed = false;
        local.create_organization(&hidden, false).unwrap();
        local
            .record_usage(&UsageRecord {
                capability_id: "acme.Ping".to_string(),
                executed_at: 1_000,
                duration_ms: 10,
                success: true,
                error_message: None,
                parameters_snapshot: None,
            })
            .unwrap();
    }

    let snapshot_dir = checkout.path().join(".caphub");
    std::fs::create_dir_all(&snapshot_dir).unwrap();
    std::fs::copy(
        seed.path().join("installed.db"),
        snapshot_dir.join("snapshot.db"),
    )
    .unwrap();
    checkout
}

fn connected_store(checkout: &TempDir) -> RemoteStore {
    let mut store =
        RemoteStore::new(checkout.path(), offline_config(Duration::from_secs(3600))).unwrap();
    store.connect().unwrap();
    store
}

#[test]
fn fresh_snapshot_connects_without_network() {
    let checkout = seeded_checkout();
    let store = connected_store(&checkout);
    assert!(store.is_snapshot_fresh());
    assert!(store.organization_exists("acme"));
}

#[test]
fn listing_reads_the_cached_snapshot() {
    let checkout = seeded_checkout();
    let store = connected_store(&checkout);

    let orgs = store.list_organizations().unwrap();
    let ids: Vec<&str> = orgs.iter().map(|org| org.id.as_str()).collect();
    assert_eq!(ids, vec!["acme", "acme-labs"]);

    let caps = store
        .list_capabilities("acme", ChildScope::DirectOnly)
        .unwrap();
    assert_eq!(caps.len(), 1);
    assert_eq!(caps[0].name, "Ping");
    assert_eq!(caps[0].id, "acme.Ping");
}

#[test]
fn uninstalled_organizations_are_filtered_from_the_listing() {
    let checkout = seeded_checkout();
    let store = connected_store(&checkout);

    let orgs = store.list_organizations().unwrap();
    assert!(orgs.iter().all(|org| org.id != "hidden"));
    // The row is still present in the snapshot; only the listing filters.
    assert!(store.organization_exists("hidden"));
}

#[test]
fn include_children_scope_widens_the_listing() {
    let checkout = seeded_checkout();
    let store = connected_store(&checkout);

    let widened = store
        .list_capabilities("acme", ChildScope::IncludeChildren)
        .unwrap();
    let names: Vec<&str> = widened.iter().map(|cap| cap.name.as_str()).collect();
    assert_eq!(names, vec!["Ping", "Trace"]);
}

#[test]
fn usage_and_installation_queries_read_the_snapshot() {
    let checkout = seeded_checkout();
    let store = connected_store(&checkout);

    let usage = store.usage_for_capability("acme.Ping").unwrap();
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].executed_at, 1_000);

    let install = store
        .installation_for_capability("acme.Ping")
        .unwrap()
        .unwrap();
    assert_eq!(install.source, "local");
}

#[test]
fn every_mutation_is_rejected() {
    let checkout = seeded_checkout();
    let store = connected_store(&checkout);

    let org = Organization::new("new-org", "New Org");
    assert!(matches!(
        store.create_organization(&org, false),
        Err(StoreError::OperationNotSupported("create_organization"))
    ));
    let cap = Capability::new("Ping", CapabilityType::Local, "ping.sh", "acme");
    assert!(matches!(
        store.create_capability(&cap, true),
        Err(StoreError::OperationNotSupported("create_capability"))
    ));
    assert!(matches!(
        store.remove_organization("acme"),
        Err(StoreError::OperationNotSupported("remove_organization"))
    ));
    assert!(matches!(
        store.remove_capability("Ping", "acme"),
        Err(StoreError::OperationNotSupported("remove_capability"))
    ));
    assert!(matches!(
        store.record_usage(&UsageRecord {
            capability_id: "acme.Ping".to_string(),
            executed_at: 2_000,
            duration_ms: 1,
            success: true,
            error_message: None,
            parameters_snapshot: None,
        }),
        Err(StoreError::OperationNotSupported("record_usage"))
    ));

    // The snapshot is untouched after all of the above.
    assert!(store.capability_exists("Ping", "acme"));
}

#[test]
fn queries_before_connect_fail_and_probes_read_false() {
    let checkout = seeded_checkout();
    let store =
        RemoteStore::new(checkout.path(), offline_config(Duration::from_secs(3600))).unwrap();

    assert!(store.list_organizations().is_err());
    assert!(!store.organization_exists("acme"));
    assert!(!store.capability_exists("Ping", "acme"));
}

#[test]
fn stale_snapshot_with_unreachable_endpoint_fails_connect() {
    let checkout = seeded_checkout();
    // Zero TTL forces a refetch even though a snapshot is cached.
    let mut store = RemoteStore::new(checkout.path(), offline_config(Duration::ZERO)).unwrap();
    assert!(!store.is_snapshot_fresh());

    let err = store.connect().unwrap_err();
    assert!(matches!(err, StoreError::Snapshot(_)));
}

#[test]
fn missing_snapshot_is_never_fresh() {
    let checkout = TempDir::new().unwrap();
    std::fs::create_dir_all(checkout.path().join("src")).unwrap();
    let store =
        RemoteStore::new(checkout.path(), offline_config(Duration::from_secs(3600))).unwrap();
    assert!(!store.is_snapshot_fresh());
}
