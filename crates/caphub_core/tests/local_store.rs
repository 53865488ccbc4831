use caphub_core::store::local::LocalStore;
use caphub_core::{
    open_store as open_store_for_mode, Capability, CapabilityType, CatalogStore, ChildScope,
    Organization, Parameter,
    ParameterType, StoreError, StoreMode, UsageRecord,
};
use tempfile::TempDir;

fn open_store() -> (LocalStore, TempDir) {
    let dir = TempDir::new().unwrap();
    let store = LocalStore::open(dir.path()).unwrap();
    (store, dir)
}

fn acme() -> Organization {
    let mut org = Organization::new("acme", "ACME");
    org.description = "demo org".to_string();
    org
}

fn ping_capability() -> Capability {
    let mut cap = Capability::new("Ping", CapabilityType::Local, "ping.sh", "acme");
    cap.description = "Probe a target host".to_string();
    cap.parameters.push(Parameter {
        name: "target".to_string(),
        type_tag: ParameterType::String,
        required: true,
        default_value: None,
        description: "host to probe".to_string(),
        context_tags: None,
    });
    cap
}

#[test]
fn create_organization_then_exists() {
    let (store, _dir) = open_store();
    store.create_organization(&acme(), false).unwrap();
    assert!(store.organization_exists("acme"));
    assert!(!store.organization_exists("ghost"));
}

#[test]
fn slash_identifier_is_rejected_before_any_side_effect() {
    let (store, dir) = open_store();
    let org = Organization::new("bad/id", "Bad");

    let err = store.create_organization(&org, false).unwrap_err();
    assert!(matches!(err, StoreError::Validation(_)));
    assert!(!store.organization_exists("bad/id"));
    assert!(!dir.path().join("repository").join("bad").exists());
}

#[test]
fn path_like_capability_name_is_rejected_before_any_side_effect() {
    let outer = TempDir::new().unwrap();
    let store = LocalStore::open(&outer.path().join("store")).unwrap();
    store.create_organization(&acme(), false).unwrap();

    // A traversal name would resolve to `<outer>/escaped/` if it reached
    // the file tree.
    let cap = Capability::new("../../../escaped", CapabilityType::Local, "run.sh", "acme");
    let err = store.create_capability(&cap, false).unwrap_err();
    assert!(matches!(err, StoreError::Validation(_)));
    assert!(!store.capability_exists("../../../escaped", "acme"));
    assert!(!outer.path().join("escaped").exists());
}

#[test]
fn duplicate_create_returns_already_exists_and_keeps_first_record() {
    let (store, _dir) = open_store();
    store.create_organization(&acme(), false).unwrap();

    let mut second = acme();
    second.name = "ACME v2".to_string();
    let err = store.create_organization(&second, false).unwrap_err();
    assert!(matches!(
        err,
        StoreError::AlreadyExists {
            entity: "organization",
            ..
        }
    ));

    let listed = store.list_organizations().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "ACME");
}

#[test]
fn create_with_overwrite_replaces_the_record() {
    let (store, _dir) = open_store();
    store.create_organization(&acme(), false).unwrap();

    let mut replacement = acme();
    replacement.name = "ACME v2".to_string();
    replacement.categories = vec!["local".to_string()];
    store.create_organization(&replacement, true).unwrap();

    let listed = store.list_organizations().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "ACME v2");
    assert_eq!(listed[0].categories, vec!["local".to_string()]);
}

#[test]
fn overwriting_organization_keeps_owned_capabilities() {
    let (store, _dir) = open_store();
    store.create_organization(&acme(), false).unwrap();
    store.create_capability(&ping_capability(), false).unwrap();

    store.create_organization(&acme(), true).unwrap();

    let caps = store
        .list_capabilities("acme", ChildScope::DirectOnly)
        .unwrap();
    assert_eq!(caps.len(), 1);
}

#[test]
fn capability_for_unknown_organization_writes_nothing() {
    let (store, dir) = open_store();
    let err = store.create_capability(&ping_capability(), false).unwrap_err();
    assert!(matches!(err, StoreError::OrganizationNotFound(id) if id == "acme"));
    assert!(!dir.path().join("repository").join("acme").exists());
}

#[test]
fn capability_roundtrip_preserves_declared_shape() {
    let (store, _dir) = open_store();
    store.create_organization(&acme(), false).unwrap();
    store.create_capability(&ping_capability(), false).unwrap();

    let caps = store
        .list_capabilities("acme", ChildScope::DirectOnly)
        .unwrap();
    assert_eq!(caps.len(), 1);
    let loaded = &caps[0];
    assert_eq!(loaded.id, "acme.Ping");
    assert_eq!(loaded.name, "Ping");
    assert_eq!(loaded.kind, CapabilityType::Local);
    assert_eq!(loaded.entry_point, "ping.sh");
    assert_eq!(loaded.effective_group(), "acme");
    assert_eq!(loaded.parameters.len(), 1);
    assert_eq!(loaded.parameters[0].name, "target");
    assert_eq!(loaded.parameters[0].type_tag, ParameterType::String);
    assert!(loaded.parameters[0].required);
}

#[test]
fn create_capability_writes_file_tree_artifacts() {
    let (store, dir) = open_store();
    store.create_organization(&acme(), false).unwrap();
    store.create_capability(&ping_capability(), false).unwrap();

    let org_dir = dir.path().join("repository").join("acme");
    assert!(org_dir.join("org.json").is_file());
    assert!(org_dir.join("Ping").join("capability.json").is_file());
    assert!(org_dir.join("Ping").join("run.sh").is_file());
}

#[test]
fn capability_create_marks_installed() {
    let (store, _dir) = open_store();
    store.create_organization(&acme(), false).unwrap();
    store.create_capability(&ping_capability(), false).unwrap();

    let record = store
        .installation_for_capability("acme.Ping")
        .unwrap()
        .unwrap();
    assert_eq!(record.source, "local");
    assert!(record.installed_at > 0);
}

#[test]
fn remove_organization_cascades_rows_and_file_tree() {
    let (store, dir) = open_store();
    store.create_organization(&acme(), false).unwrap();
    store.create_capability(&ping_capability(), false).unwrap();

    store.remove_organization("acme").unwrap();

    let caps = store
        .list_capabilities("acme", ChildScope::DirectOnly)
        .unwrap();
    assert!(caps.is_empty());
    assert!(!dir.path().join("repository").join("acme").exists());
    assert!(store
        .installation_for_capability("acme.Ping")
        .unwrap()
        .is_none());
}

#[test]
fn remove_missing_capability_returns_not_found() {
    let (store, _dir) = open_store();
    store.create_organization(&acme(), false).unwrap();

    let err = store.remove_capability("Ghost", "acme").unwrap_err();
    assert!(matches!(
        err,
        StoreError::NotFound {
            entity: "capability",
            ..
        }
    ));
}

#[test]
fn acme_ping_scenario_matches_contract() {
    let (store, _dir) = open_store();
    store.create_organization(&acme(), false).unwrap();
    store.create_capability(&ping_capability(), false).unwrap();

    let orgs = store.list_organizations().unwrap();
    assert_eq!(orgs.len(), 1);
    assert_eq!(orgs[0].id, "acme");

    let caps = store
        .list_capabilities("acme", ChildScope::DirectOnly)
        .unwrap();
    assert_eq!(caps.len(), 1);
    assert_eq!(caps[0].name, "Ping");

    assert!(store.capability_exists("Ping", "acme"));
    store.remove_capability("Ping", "acme").unwrap();
    assert!(!store.capability_exists("Ping", "acme"));
}

#[test]
fn list_organizations_sorts_by_name_and_filters_uninstalled() {
    let (store, _dir) = open_store();
    let mut zeta = Organization::new("zeta", "Zeta");
    let mut alpha = Organization::new("alpha", "Alpha");
    let mut hidden = Organization::new("hidden", "Hidden");
    zeta.installed = true;
    alpha.installed = true;
    hidden.installed = false;
    store.create_organization(&zeta, false).unwrap();
    store.create_organization(&hidden, false).unwrap();
    store.create_organization(&alpha, false).unwrap();

    let listed = store.list_organizations().unwrap();
    let ids: Vec<&str> = listed.iter().map(|org| org.id.as_str()).collect();
    assert_eq!(ids, vec!["alpha", "zeta"]);
}

#[test]
fn include_children_scope_folds_in_child_capabilities() {
    let (store, _dir) = open_store();
    let mut parent = Organization::new("parent", "Parent");
    parent.children = vec!["child".to_string()];
    store.create_organization(&parent, false).unwrap();
    store
        .create_organization(&Organization::new("child", "Child"), false)
        .unwrap();

    let mut parent_cap = Capability::new("Alpha", CapabilityType::Local, "alpha.sh", "parent");
    let mut child_cap = Capability::new("Beta", CapabilityType::Local, "beta.sh", "child");
    parent_cap.description = "parent-owned".to_string();
    child_cap.description = "child-owned".to_string();
    store.create_capability(&parent_cap, false).unwrap();
    store.create_capability(&child_cap, false).unwrap();

    let direct = store
        .list_capabilities("parent", ChildScope::DirectOnly)
        .unwrap();
    assert_eq!(direct.len(), 1);
    assert_eq!(direct[0].name, "Alpha");

    let widened = store
        .list_capabilities("parent", ChildScope::IncludeChildren)
        .unwrap();
    let names: Vec<&str> = widened.iter().map(|cap| cap.name.as_str()).collect();
    assert_eq!(names, vec!["Alpha", "Beta"]);
}

#[test]
fn open_store_dispatches_to_the_local_backend() {
    let dir = TempDir::new().unwrap();
    let mode = StoreMode::Local {
        root: Some(dir.path().to_path_buf()),
    };
    let store = open_store_for_mode(&mode).unwrap();

    store.create_organization(&acme(), false).unwrap();
    store.create_capability(&ping_capability(), false).unwrap();

    let orgs = store.list_organizations().unwrap();
    assert_eq!(orgs.len(), 1);
    let caps = store
        .list_capabilities("acme", ChildScope::DirectOnly)
        .unwrap();
    assert_eq!(caps.len(), 1);
    assert!(dir.path().join("installed.db").is_file());
}

#[test]
fn usage_log_is_append_only_and_ordered() {
    let (store, _dir) = open_store();
    store.create_organization(&acme(), false).unwrap();
    store.create_capability(&ping_capability(), false).unwrap();

    for (executed_at, success) in [(1_000, true), (2_000, false)] {
        store
            .record_usage(&UsageRecord {
                capability_id: "acme.Ping".to_string(),
                executed_at,
                duration_ms: 42,
                success,
                error_message: (!success).then(|| "timeout".to_string()),
                parameters_snapshot: None,
            })
            .unwrap();
    }

    let log = store.usage_for_capability("acme.Ping").unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].executed_at, 1_000);
    assert!(log[0].success);
    assert_eq!(log[1].error_message.as_deref(), Some("timeout"));
}
