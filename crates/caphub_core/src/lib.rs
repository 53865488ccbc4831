//! Core persistence and cache layer for the capability catalog.
//! This crate is the single source of truth for catalog invariants.

pub mod cache;
pub mod db;
pub mod logging;
pub mod model;
pub mod store;

pub use cache::{
    CacheError, CacheFile, CacheManager, CacheResult, InstalledCache, MetadataCache,
    OrganizationsCache, SearchIndexCache, CACHE_SCHEMA_VERSION,
};
pub use logging::{default_log_level, init_logging, logging_status};
pub use model::{
    AuthSpec, Capability, CapabilityType, InstallationRecord, Organization, OutputDescriptor,
    Parameter, ParameterType, UsageRecord, ValidationError,
};
pub use store::{
    open_store, CatalogStore, ChildScope, DarwinStore, LocalStore, RemoteConfig, RemoteStore,
    StoreError, StoreMode, StoreResult,
};

/// Minimal health-check API for early integration.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
