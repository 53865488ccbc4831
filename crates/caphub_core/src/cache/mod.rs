//! Derived read-optimized projections over the active backend.
//!
//! # Responsibility
//! - Produce, persist and reload the four JSON projections (installed
//!   items, search index, organizations, metadata+statistics).
//! - Offer a caller-driven staleness probe and a best-effort clear.
//!
//! # Invariants
//! - Every refresh fully re-derives from the backend; there is no
//!   incremental update path.
//! - Each document carries its own `generated` timestamp and schema
//!   `version`; the cache never becomes a second source of truth.
//! - Staleness checking is the caller's responsibility; nothing here
//!   auto-invalidates on TTL expiry.

use crate::model::{Capability, Organization};
use crate::store::local::now_epoch_ms;
use crate::store::{CatalogStore, ChildScope, StoreError};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Schema version stamped into every projection document.
pub const CACHE_SCHEMA_VERSION: &str = "1.0.0";

const CACHE_DIR: &str = "cache";

pub type CacheResult<T> = Result<T, CacheError>;

/// Cache-layer error for derivation, persistence and reload operations.
#[derive(Debug)]
pub enum CacheError {
    Io { path: PathBuf, source: io::Error },
    Serde(serde_json::Error),
    Store(StoreError),
}

impl Display for CacheError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "cache file operation failed at `{}`: {source}", path.display())
            }
            Self::Serde(err) => write!(f, "cache document (de)serialization failed: {err}"),
            Self::Store(err) => write!(f, "{err}"),
        }
    }
}

impl Error for CacheError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Serde(err) => Some(err),
            Self::Store(err) => Some(err),
        }
    }
}

impl From<StoreError> for CacheError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serde(value)
    }
}

/// One of the four persisted projection files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheFile {
    Installed,
    SearchIndex,
    Organizations,
    Metadata,
}

impl CacheFile {
    pub const ALL: [Self; 4] = [
        Self::Installed,
        Self::SearchIndex,
        Self::Organizations,
        Self::Metadata,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            Self::Installed => "installed.json",
            Self::SearchIndex => "search_index.json",
            Self::Organizations => "organizations.json",
            Self::Metadata => "metadata.json",
        }
    }
}

/// Flattened capability record shared by the installed and search caches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitySummary {
    pub id: String,
    pub name: String,
    pub organization: String,
    pub group: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub entry_point: String,
    /// Category tags inherited from the owning organization.
    pub categories: Vec<String>,
    /// Union of the declared parameters' context tags.
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledCache {
    pub generated: i64,
    pub version: String,
    pub items: Vec<CapabilitySummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchIndexEntry {
    #[serde(flatten)]
    pub summary: CapabilitySummary,
    pub search_terms: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchIndexCache {
    pub generated: i64,
    pub version: String,
    pub index: Vec<SearchIndexEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrganizationSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub logo: Option<String>,
    pub local_only: bool,
    pub capability_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrganizationsCache {
    pub generated: i64,
    pub version: String,
    pub organizations: Vec<OrganizationSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatistics {
    pub total_capabilities: usize,
    pub total_organizations: usize,
    pub total_groups: usize,
    pub total_installed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataCache {
    pub generated: i64,
    pub version: String,
    pub statistics: CacheStatistics,
    pub organizations: Vec<Organization>,
    pub groups: Vec<String>,
    pub capabilities: Vec<Capability>,
}

/// Full backend scan one refresh derives its projections from.
struct CatalogSnapshot {
    organizations: Vec<Organization>,
    /// `(organization, capabilities, installed flags)` triples in
    /// organization listing order.
    by_organization: Vec<(Organization, Vec<(Capability, bool)>)>,
}

/// Derives and persists projections for whichever backend is active.
pub struct CacheManager {
    cache_dir: PathBuf,
}

impl CacheManager {
    /// Creates a manager persisting under `<root>/cache/`.
    pub fn new(root: &Path) -> Self {
        Self {
            cache_dir: root.join(CACHE_DIR),
        }
    }

    /// Directory holding the four projection files.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Absolute path of one projection file.
    pub fn cache_path(&self, file: CacheFile) -> PathBuf {
        self.cache_dir.join(file.file_name())
    }

    /// Regenerates all four projections unconditionally and sequentially.
    ///
    /// A crash mid-sequence leaves some projections stale relative to
    /// others; each is independently regenerable and carries its own
    /// timestamp, so that is tolerated rather than rolled back.
    pub fn refresh_all_caches(&self, store: &dyn CatalogStore) -> CacheResult<()> {
        self.refresh_installed_cache(store)?;
        self.refresh_search_index(store)?;
        self.refresh_organizations_cache(store)?;
        self.refresh_metadata_cache(store)?;
        info!("event=cache_refresh module=cache status=ok scope=all");
        Ok(())
    }

    /// Regenerates the installed-items projection.
    pub fn refresh_installed_cache(&self, store: &dyn CatalogStore) -> CacheResult<()> {
        let snapshot = scan_catalog(store)?;
        let items = snapshot
            .by_organization
            .iter()
            .flat_map(|(org, caps)| {
                caps.iter()
                    .filter(|(_, installed)| *installed)
                    .map(|(cap, _)| summarize(cap, org))
            })
            .collect();
        let document = InstalledCache {
            generated: now_epoch_ms(),
            version: CACHE_SCHEMA_VERSION.to_string(),
            items,
        };
        self.write_document(CacheFile::Installed, &document)
    }

    /// Regenerates the search-index projection.
    pub fn refresh_search_index(&self, store: &dyn CatalogStore) -> CacheResult<()> {
        let snapshot = scan_catalog(store)?;
        let index = snapshot
            .by_organization
            .iter()
            .flat_map(|(org, caps)| {
                caps.iter().map(|(cap, _)| SearchIndexEntry {
                    summary: summarize(cap, org),
                    search_terms: search_terms(cap),
                })
            })
            .collect();
        let document = SearchIndexCache {
            generated: now_epoch_ms(),
            version: CACHE_SCHEMA_VERSION.to_string(),
            index,
        };
        self.write_document(CacheFile::SearchIndex, &document)
    }

    /// Regenerates the organizations projection with capability counts.
    pub fn refresh_organizations_cache(&self, store: &dyn CatalogStore) -> CacheResult<()> {
        let snapshot = scan_catalog(store)?;
        let organizations = snapshot
            .by_organization
            .iter()
            .map(|(org, caps)| OrganizationSummary {
                id: org.id.clone(),
                name: org.name.clone(),
                description: org.description.clone(),
                logo: org.logos.first().cloned(),
                local_only: org.local_only,
                capability_count: caps.len(),
            })
            .collect();
        let document = OrganizationsCache {
            generated: now_epoch_ms(),
            version: CACHE_SCHEMA_VERSION.to_string(),
            organizations,
        };
        self.write_document(CacheFile::Organizations, &document)
    }

    /// Regenerates the combined metadata+statistics projection.
    pub fn refresh_metadata_cache(&self, store: &dyn CatalogStore) -> CacheResult<()> {
        let snapshot = scan_catalog(store)?;
        let capabilities: Vec<Capability> = snapshot
            .by_organization
            .iter()
            .flat_map(|(_, caps)| caps.iter().map(|(cap, _)| cap.clone()))
            .collect();
        let groups: Vec<String> = snapshot
            .by_organization
            .iter()
            .flat_map(|(_, caps)| caps.iter().map(|(cap, _)| cap.effective_group().to_string()))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let total_installed = snapshot
            .by_organization
            .iter()
            .flat_map(|(_, caps)| caps.iter())
            .filter(|(_, installed)| *installed)
            .count();

        let document = MetadataCache {
            generated: now_epoch_ms(),
            version: CACHE_SCHEMA_VERSION.to_string(),
            statistics: CacheStatistics {
                total_capabilities: capabilities.len(),
                total_organizations: snapshot.organizations.len(),
                total_groups: groups.len(),
                total_installed,
            },
            organizations: snapshot.organizations,
            groups,
            capabilities,
        };
        self.write_document(CacheFile::Metadata, &document)
    }

    /// Loads the persisted installed-items projection.
    pub fn load_installed_from_cache(&self) -> CacheResult<InstalledCache> {
        self.read_document(CacheFile::Installed)
    }

    /// Loads the persisted search-index projection.
    pub fn load_search_index_from_cache(&self) -> CacheResult<SearchIndexCache> {
        self.read_document(CacheFile::SearchIndex)
    }

    /// Loads the persisted organizations projection.
    pub fn load_organizations_from_cache(&self) -> CacheResult<OrganizationsCache> {
        self.read_document(CacheFile::Organizations)
    }

    /// Loads the persisted metadata projection.
    pub fn load_metadata_from_cache(&self) -> CacheResult<MetadataCache> {
        self.read_document(CacheFile::Metadata)
    }

    /// Whether one projection's `generated` stamp is younger than
    /// `max_age`. Any read or parse failure reads as stale.
    pub fn is_cache_valid(&self, file: CacheFile, max_age: Duration) -> bool {
        #[derive(Deserialize)]
        struct Envelope {
            generated: i64,
        }

        let Ok(body) = fs::read_to_string(self.cache_path(file)) else {
            return false;
        };
        let Ok(envelope) = serde_json::from_str::<Envelope>(&body) else {
            return false;
        };
        let age_ms = now_epoch_ms().saturating_sub(envelope.generated);
        age_ms >= 0 && (age_ms as u128) < max_age.as_millis()
    }

    /// Best-effort deletion of all four projection files.
    ///
    /// Per-file deletion errors are logged and swallowed.
    pub fn clear_all_caches(&self) {
        for file in CacheFile::ALL {
            let path = self.cache_path(file);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => warn!(
                    "event=cache_clear module=cache status=warn path={} error={err}",
                    path.display()
                ),
            }
        }
        info!("event=cache_clear module=cache status=ok");
    }

    fn write_document<T: Serialize>(&self, file: CacheFile, document: &T) -> CacheResult<()> {
        fs::create_dir_all(&self.cache_dir).map_err(|source| CacheError::Io {
            path: self.cache_dir.clone(),
            source,
        })?;
        let path = self.cache_path(file);
        let body = serde_json::to_string_pretty(document)?;
        fs::write(&path, body).map_err(|source| CacheError::Io { path, source })
    }

    fn read_document<T: serde::de::DeserializeOwned>(&self, file: CacheFile) -> CacheResult<T> {
        let path = self.cache_path(file);
        let body = fs::read_to_string(&path).map_err(|source| CacheError::Io { path, source })?;
        Ok(serde_json::from_str(&body)?)
    }
}

fn scan_catalog(store: &dyn CatalogStore) -> CacheResult<CatalogSnapshot> {
    let organizations = store.list_organizations()?;
    let mut by_organization = Vec::with_capacity(organizations.len());
    for org in &organizations {
        let capabilities = store.list_capabilities(&org.id, ChildScope::DirectOnly)?;
        let mut annotated = Vec::with_capacity(capabilities.len());
        for capability in capabilities {
            let installed = store
                .installation_for_capability(&capability.id)?
                .is_some();
            annotated.push((capability, installed));
        }
        by_organization.push((org.clone(), annotated));
    }
    Ok(CatalogSnapshot {
        organizations,
        by_organization,
    })
}

fn summarize(cap: &Capability, org: &Organization) -> CapabilitySummary {
    let tags = cap
        .parameters
        .iter()
        .flat_map(|parameter| parameter.context_tags.iter().flatten().cloned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    CapabilitySummary {
        id: cap.id.clone(),
        name: cap.name.clone(),
        organization: cap.organization_id.clone(),
        group: cap.effective_group().to_string(),
        description: cap.description.clone(),
        kind: cap.kind.as_db_str().to_string(),
        entry_point: cap.entry_point.clone(),
        categories: org.categories.clone(),
        tags,
    }
}

/// Flattened, deduplicated, lower-cased token list for one capability.
fn search_terms(cap: &Capability) -> Vec<String> {
    let mut terms = BTreeSet::new();
    let mut push = |text: &str| {
        for token in text.split_whitespace() {
            let normalized = token
                .trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase();
            if !normalized.is_empty() {
                terms.insert(normalized);
            }
        }
    };

    push(&cap.name);
    push(&cap.description);
    push(&cap.organization_id);
    push(cap.effective_group());
    push(cap.kind.as_db_str());
    for parameter in &cap.parameters {
        push(&parameter.name);
    }

    terms.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::search_terms;
    use crate::model::{Capability, CapabilityType, Parameter, ParameterType};

    fn capability_with_parameter() -> Capability {
        let mut cap = Capability::new("Ping", CapabilityType::Local, "ping.sh", "acme");
        cap.description = "Probe a Target host".to_string();
        cap.parameters.push(Parameter {
            name: "target".to_string(),
            type_tag: ParameterType::String,
            required: true,
            default_value: None,
            description: String::new(),
            context_tags: None,
        });
        cap
    }

    #[test]
    fn search_terms_are_lowercased_and_deduplicated() {
        let terms = search_terms(&capability_with_parameter());
        assert!(terms.contains(&"ping".to_string()));
        assert!(terms.contains(&"probe".to_string()));
        assert!(terms.contains(&"acme".to_string()));
        assert!(terms.contains(&"local".to_string()));
        // `target` appears in both the description and a parameter name;
        // the index stores it once.
        assert_eq!(
            terms.iter().filter(|term| term.as_str() == "target").count(),
            1
        );
        assert!(terms.iter().all(|term| term.chars().all(|c| !c.is_uppercase())));
    }
}
