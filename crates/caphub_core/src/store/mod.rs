//! Persistence contract over catalog backends.
//!
//! # Responsibility
//! - Define the uniform create/list/remove/exists contract every backend
//!   satisfies, plus the shared error taxonomy.
//! - Select and validate a backend once, at construction, via `StoreMode`.
//!
//! # Invariants
//! - Validation errors are raised before any side effect occurs.
//! - Existence probes never propagate errors; internal failure reads as
//!   `false`.
//! - Backend dispatch happens once in `open_store`, never per call.

use crate::db::DbError;
use crate::model::{Capability, InstallationRecord, Organization, UsageRecord, ValidationError};
use log::warn;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::io;
use std::path::{Path, PathBuf};

pub mod darwin;
mod fs_tree;
pub mod local;
pub mod remote;

pub use darwin::DarwinStore;
pub use local::LocalStore;
pub use remote::{RemoteConfig, RemoteStore};

pub type StoreResult<T> = Result<T, StoreError>;

/// Shared error taxonomy for all catalog backends.
#[derive(Debug)]
pub enum StoreError {
    /// Identifier already taken and `overwrite` was false.
    AlreadyExists { entity: &'static str, id: String },
    /// Target organization or capability does not exist.
    NotFound { entity: &'static str, id: String },
    /// A capability references an organization that is absent.
    OrganizationNotFound(String),
    Validation(ValidationError),
    Db(DbError),
    /// File-tree side effect failed; the relational state may already have
    /// been mutated. Callers must re-check existence before retrying.
    FileSystem { path: PathBuf, source: io::Error },
    PermissionDenied(PathBuf),
    /// Any mutation attempted on the read-only remote backend.
    OperationNotSupported(&'static str),
    /// Remote snapshot fetch or decode failed for this connection attempt.
    Snapshot(String),
    /// Persisted state cannot be converted to a valid read model.
    InvalidData(String),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyExists { entity, id } => write!(f, "{entity} already exists: {id}"),
            Self::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            Self::OrganizationNotFound(id) => write!(f, "organization not found: {id}"),
            Self::Validation(err) => write!(f, "{err}"),
            Self::Db(err) => write!(f, "{err}"),
            Self::FileSystem { path, source } => {
                write!(f, "file-tree operation failed at `{}`: {source}", path.display())
            }
            Self::PermissionDenied(path) => {
                write!(f, "permission denied: {}", path.display())
            }
            Self::OperationNotSupported(operation) => {
                write!(f, "operation not supported on this backend: {operation}")
            }
            Self::Snapshot(message) => write!(f, "snapshot fetch failed: {message}"),
            Self::InvalidData(message) => write!(f, "invalid persisted catalog data: {message}"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            Self::Db(err) => Some(err),
            Self::FileSystem { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<ValidationError> for StoreError {
    fn from(value: ValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<DbError> for StoreError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Organization scope applied by `list_capabilities`.
///
/// The source systems disagreed on whether a listing folds in capabilities
/// owned by declared child organizations, so the scope is an explicit
/// parameter rather than a backend-specific surprise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildScope {
    /// Capabilities owned directly by the organization.
    DirectOnly,
    /// Direct capabilities plus those owned by declared children.
    IncludeChildren,
}

/// Uniform persistence contract over catalog backends.
pub trait CatalogStore {
    /// Creates or replaces one organization.
    ///
    /// Fails with `AlreadyExists` when the identifier is taken and
    /// `overwrite` is false. On writable backends this performs a
    /// relational upsert plus a file-tree write; the two steps are not
    /// atomic (see `StoreError::FileSystem`).
    fn create_organization(&self, org: &Organization, overwrite: bool) -> StoreResult<()>;

    /// Creates or replaces one capability, its parameters, its file-tree
    /// artifacts and an installation record.
    ///
    /// Fails with `OrganizationNotFound` when the owning organization is
    /// absent, `AlreadyExists` under the same overwrite semantics as
    /// `create_organization`.
    fn create_capability(&self, cap: &Capability, overwrite: bool) -> StoreResult<()>;

    /// Full scan ordered by name ascending, filtered to installed-only
    /// where the backend tracks that flag.
    fn list_organizations(&self) -> StoreResult<Vec<Organization>>;

    /// Capabilities within the organization under the requested scope.
    fn list_capabilities(&self, org_id: &str, scope: ChildScope) -> StoreResult<Vec<Capability>>;

    /// Deletes the organization, cascading to owned capabilities,
    /// parameters, installation and usage rows, and the file subtree.
    fn remove_organization(&self, org_id: &str) -> StoreResult<()>;

    /// Deletes one capability and its file subtree. Missing capability
    /// yields `NotFound`.
    fn remove_capability(&self, name: &str, org_id: &str) -> StoreResult<()>;

    /// Existence probe; never propagates errors.
    fn organization_exists(&self, org_id: &str) -> bool;

    /// Existence probe; never propagates errors.
    fn capability_exists(&self, name: &str, org_id: &str) -> bool;

    /// Appends one usage record. Read-only backends reject this.
    fn record_usage(&self, usage: &UsageRecord) -> StoreResult<()>;

    /// Usage log for one capability, oldest first.
    fn usage_for_capability(&self, cap_id: &str) -> StoreResult<Vec<UsageRecord>>;

    /// Installation record for one capability, if installed.
    fn installation_for_capability(&self, cap_id: &str)
        -> StoreResult<Option<InstallationRecord>>;
}

/// Backend selector, validated once at construction.
#[derive(Debug, Clone)]
pub enum StoreMode {
    /// Writable local backend. `None` resolves to the fixed home-relative
    /// root.
    Local { root: Option<PathBuf> },
    /// Read-only snapshot backend anchored at a caller-supplied repository
    /// checkout.
    Remote {
        checkout: PathBuf,
        config: RemoteConfig,
    },
    /// Writable backend matching the darwin host application's schema.
    /// `None` resolves to the fixed home-relative root.
    DarwinNative { root: Option<PathBuf> },
}

impl StoreMode {
    /// Validates the variant and resolves its effective root directory.
    pub fn validate(&self) -> StoreResult<PathBuf> {
        match self {
            Self::Local { root } => resolve_home_root(root.as_deref(), ".caphub"),
            Self::DarwinNative { root } => resolve_home_root(root.as_deref(), ".caphub-darwin"),
            Self::Remote { checkout, .. } => validate_remote_checkout(checkout),
        }
    }
}

/// Opens the backend selected by `mode`. Dispatch happens here, once.
///
/// The remote variant performs its snapshot `connect()` step as part of
/// opening; callers needing finer control construct `RemoteStore` directly.
pub fn open_store(mode: &StoreMode) -> StoreResult<Box<dyn CatalogStore>> {
    let root = mode.validate()?;
    match mode {
        StoreMode::Local { .. } => Ok(Box::new(LocalStore::open(&root)?)),
        StoreMode::DarwinNative { .. } => Ok(Box::new(DarwinStore::open(&root)?)),
        StoreMode::Remote { config, .. } => {
            let mut store = RemoteStore::new(&root, config.clone())?;
            store.connect()?;
            Ok(Box::new(store))
        }
    }
}

fn resolve_home_root(root: Option<&Path>, fixed: &str) -> StoreResult<PathBuf> {
    if let Some(root) = root {
        return Ok(root.to_path_buf());
    }
    let home = dirs::home_dir().ok_or(StoreError::InvalidData(
        "cannot resolve home directory for store root".to_string(),
    ))?;
    Ok(home.join(fixed))
}

fn validate_remote_checkout(checkout: &Path) -> StoreResult<PathBuf> {
    let metadata = std::fs::metadata(checkout).map_err(|source| StoreError::FileSystem {
        path: checkout.to_path_buf(),
        source,
    })?;
    if !metadata.is_dir() {
        return Err(StoreError::Validation(ValidationError::InvalidPath(
            "remote checkout must be a directory",
        )));
    }
    if !checkout.join("src").is_dir() {
        return Err(StoreError::Validation(ValidationError::InvalidPath(
            "remote checkout must contain a src/ directory",
        )));
    }
    if metadata.permissions().readonly() {
        return Err(StoreError::PermissionDenied(checkout.to_path_buf()));
    }

    for marker in ["package.json", "schema", ".git"] {
        if !checkout.join(marker).exists() {
            warn!(
                "event=mode_validate module=store status=warn missing={marker} checkout={}",
                checkout.display()
            );
        }
    }

    Ok(checkout.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::{StoreError, StoreMode};
    use crate::model::ValidationError;
    use std::path::PathBuf;

    #[test]
    fn local_mode_resolves_explicit_root() {
        let mode = StoreMode::Local {
            root: Some(PathBuf::from("/tmp/caphub-test-root")),
        };
        let root = mode.validate().unwrap();
        assert_eq!(root, PathBuf::from("/tmp/caphub-test-root"));
    }

    #[test]
    fn remote_mode_rejects_missing_checkout() {
        let mode = StoreMode::Remote {
            checkout: PathBuf::from("/nonexistent/caphub-checkout"),
            config: super::RemoteConfig::default(),
        };
        assert!(matches!(
            mode.validate(),
            Err(StoreError::FileSystem { .. })
        ));
    }

    #[test]
    fn remote_mode_rejects_checkout_without_src() {
        let dir = tempfile::TempDir::new().unwrap();
        let mode = StoreMode::Remote {
            checkout: dir.path().to_path_buf(),
            config: super::RemoteConfig::default(),
        };
        assert!(matches!(
            mode.validate(),
            Err(StoreError::Validation(ValidationError::InvalidPath(_)))
        ));

        std::fs::create_dir(dir.path().join("src")).unwrap();
        assert_eq!(mode.validate().unwrap(), dir.path());
    }
}
