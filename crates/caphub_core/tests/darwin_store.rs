use caphub_core::store::darwin::DarwinStore;
use caphub_core::{
    Capability, CapabilityType, CatalogStore, ChildScope, Organization, StoreError,
};
use tempfile::TempDir;
use uuid::Uuid;

fn open_store() -> (DarwinStore, TempDir) {
    let dir = TempDir::new().unwrap();
    let store = DarwinStore::open(dir.path()).unwrap();
    (store, dir)
}

fn weather_org() -> Organization {
    let mut org = Organization::new("weather-co", "Weather Co");
    org.description = "weather tooling".to_string();
    org.categories = vec!["remote".to_string()];
    org
}

fn fetch_weather() -> Capability {
    Capability::new(
        "FetchWeather",
        CapabilityType::Remote,
        "https://api.weather.example/v1",
        "weather-co",
    )
}

#[test]
fn contract_create_list_exists_remove() {
    let (store, _dir) = open_store();
    store.create_organization(&weather_org(), false).unwrap();
    store.create_capability(&fetch_weather(), false).unwrap();

    assert_eq!(store.list_organizations().unwrap().len(), 1);
    let caps = store
        .list_capabilities("weather-co", ChildScope::DirectOnly)
        .unwrap();
    assert_eq!(caps.len(), 1);
    assert!(store.capability_exists("FetchWeather", "weather-co"));

    store.remove_capability("FetchWeather", "weather-co").unwrap();
    assert!(!store.capability_exists("FetchWeather", "weather-co"));
    store.remove_organization("weather-co").unwrap();
    assert!(!store.organization_exists("weather-co"));
}

#[test]
fn capability_id_is_a_random_uuid() {
    let (store, _dir) = open_store();
    store.create_organization(&weather_org(), false).unwrap();
    store.create_capability(&fetch_weather(), false).unwrap();

    let caps = store
        .list_capabilities("weather-co", ChildScope::DirectOnly)
        .unwrap();
    let stored_id = &caps[0].id;
    assert!(Uuid::parse_str(stored_id).is_ok());
    assert_ne!(stored_id, "weather-co.FetchWeather");
}

#[test]
fn capability_directory_uses_kebab_case_name() {
    let (store, dir) = open_store();
    store.create_organization(&weather_org(), false).unwrap();
    store.create_capability(&fetch_weather(), false).unwrap();

    let cap_dir = dir
        .path()
        .join("repository")
        .join("weather-co")
        .join("fetch-weather");
    assert!(cap_dir.join("capability.json").is_file());
    // Remote type: no stub script, no marker.
    assert!(!cap_dir.join("run.sh").exists());
    assert!(!cap_dir.join(".builtin").exists());
}

#[test]
fn core_capability_gets_builtin_marker_and_refusal_stub() {
    let (store, dir) = open_store();
    store.create_organization(&weather_org(), false).unwrap();
    let cap = Capability::new("HostClock", CapabilityType::Core, "host", "weather-co");
    store.create_capability(&cap, false).unwrap();

    let cap_dir = dir
        .path()
        .join("repository")
        .join("weather-co")
        .join("host-clock");
    assert!(cap_dir.join(".builtin").is_file());
    let stub = std::fs::read_to_string(cap_dir.join("run.sh")).unwrap();
    assert!(stub.contains("exit 1"));
}

#[test]
fn organization_metadata_round_trips_through_blob_column() {
    let (store, dir) = open_store();
    let mut org = weather_org();
    org.children = vec!["weather-labs".to_string()];
    org.logos = vec!["logo.png".to_string()];
    store.create_organization(&org, false).unwrap();
    drop(store);

    // The external schema keeps one display-name column and folds the rest
    // into a JSON blob.
    let conn = rusqlite::Connection::open(dir.path().join("installed.db")).unwrap();
    let metadata: String = conn
        .query_row(
            "SELECT metadata FROM orgs WHERE identifier = 'weather-co';",
            [],
            |row| row.get(0),
        )
        .unwrap();
    let blob: serde_json::Value = serde_json::from_str(&metadata).unwrap();
    assert_eq!(blob["description"], "weather tooling");
    assert_eq!(blob["children"][0], "weather-labs");

    let store = DarwinStore::open(dir.path()).unwrap();
    let listed = store.list_organizations().unwrap();
    assert_eq!(listed[0].children, vec!["weather-labs".to_string()]);
    assert_eq!(listed[0].logos, vec!["logo.png".to_string()]);
}

#[test]
fn symbol_only_capability_name_is_rejected() {
    let (store, dir) = open_store();
    store.create_organization(&weather_org(), false).unwrap();

    // A name that kebab-cases to nothing would collapse the capability
    // directory into the organization directory.
    let cap = Capability::new("---", CapabilityType::Local, "run.sh", "weather-co");
    let err = store.create_capability(&cap, false).unwrap_err();
    assert!(matches!(err, StoreError::Validation(_)));

    let org_dir = dir.path().join("repository").join("weather-co");
    assert!(org_dir.join("org.json").is_file());
}

#[test]
fn duplicate_capability_requires_overwrite() {
    let (store, _dir) = open_store();
    store.create_organization(&weather_org(), false).unwrap();
    store.create_capability(&fetch_weather(), false).unwrap();

    let err = store.create_capability(&fetch_weather(), false).unwrap_err();
    assert!(matches!(
        err,
        StoreError::AlreadyExists {
            entity: "capability",
            ..
        }
    ));

    // Overwrite replaces the row under a fresh identifier.
    let before = store
        .list_capabilities("weather-co", ChildScope::DirectOnly)
        .unwrap()[0]
        .id
        .clone();
    store.create_capability(&fetch_weather(), true).unwrap();
    let after = store
        .list_capabilities("weather-co", ChildScope::DirectOnly)
        .unwrap();
    assert_eq!(after.len(), 1);
    assert_ne!(after[0].id, before);
}

#[test]
fn remove_organization_cascades_capability_rows() {
    let (store, _dir) = open_store();
    store.create_organization(&weather_org(), false).unwrap();
    store.create_capability(&fetch_weather(), false).unwrap();
    let cap_id = store
        .list_capabilities("weather-co", ChildScope::DirectOnly)
        .unwrap()[0]
        .id
        .clone();

    store.remove_organization("weather-co").unwrap();
    assert!(store.installation_for_capability(&cap_id).unwrap().is_none());
    assert!(store.usage_for_capability(&cap_id).unwrap().is_empty());
}

#[test]
fn include_children_scope_reads_children_from_metadata() {
    let (store, _dir) = open_store();
    let mut parent = weather_org();
    parent.children = vec!["weather-labs".to_string()];
    store.create_organization(&parent, false).unwrap();
    store
        .create_organization(&Organization::new("weather-labs", "Weather Labs"), false)
        .unwrap();
    store.create_capability(&fetch_weather(), false).unwrap();
    store
        .create_capability(
            &Capability::new("Forecast", CapabilityType::Remote, "https://x", "weather-labs"),
            false,
        )
        .unwrap();

    let widened = store
        .list_capabilities("weather-co", ChildScope::IncludeChildren)
        .unwrap();
    let names: Vec<&str> = widened.iter().map(|cap| cap.name.as_str()).collect();
    assert_eq!(names, vec!["FetchWeather", "Forecast"]);
}
