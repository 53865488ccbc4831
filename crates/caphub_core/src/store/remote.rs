//! Read-only backend over a downloaded catalog snapshot.
//!
//! # Responsibility
//! - Fetch, cache and refresh the remote relational snapshot under a TTL.
//! - Answer list/exists queries against the read-only local copy.
//!
//! # Invariants
//! - Construction is cheap; `connect()` is the explicit step that may
//!   touch the network and is the only suspension point in the core.
//! - Every mutating operation fails with `OperationNotSupported`.
//! - A fetch is never retried within one connection attempt and carries no
//!   timeout beyond the transport default.

use crate::db::{open_snapshot_read_only, DbError};
use crate::model::{Capability, InstallationRecord, Organization, UsageRecord};
use crate::store::fs_tree::ensure_dir;
use crate::store::local::{
    parse_capability_row, parse_installation_row, parse_organization_row, parse_parameter_row,
    parse_usage_row,
};
use crate::store::{CatalogStore, ChildScope, StoreError, StoreResult};
use base64::prelude::{Engine as _, BASE64_STANDARD};
use log::{info, warn};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

const SNAPSHOT_DIR: &str = ".caphub";
const SNAPSHOT_FILE: &str = "snapshot.db";
const DEFAULT_ENDPOINT: &str = "https://registry.caphub.dev/api/v1/snapshot";
const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Remote snapshot policy. The TTL is configuration, not protocol.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Snapshot endpoint receiving `{"repository": "<name>"}`.
    pub endpoint: String,
    /// Repository name requested from the endpoint.
    pub repository: String,
    /// Optional bearer token attached to the fetch.
    pub bearer_token: Option<String>,
    /// Snapshot freshness window; a younger cached file skips the fetch.
    pub snapshot_ttl: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            repository: "catalog".to_string(),
            bearer_token: None,
            snapshot_ttl: DEFAULT_TTL,
        }
    }
}

#[derive(Deserialize)]
struct SnapshotResponse {
    /// Base64-encoded relational store file.
    database: Option<String>,
}

/// Read-only catalog store over a cached remote snapshot.
pub struct RemoteStore {
    snapshot_path: PathBuf,
    config: RemoteConfig,
    conn: Option<Connection>,
}

impl RemoteStore {
    /// Prepares the store under the validated checkout directory.
    ///
    /// No network or database activity happens here; see [`Self::connect`].
    pub fn new(checkout: &Path, config: RemoteConfig) -> StoreResult<Self> {
        let snapshot_dir = checkout.join(SNAPSHOT_DIR);
        ensure_dir(&snapshot_dir)?;
        Ok(Self {
            snapshot_path: snapshot_dir.join(SNAPSHOT_FILE),
            config,
            conn: None,
        })
    }

    /// Local path of the cached snapshot file.
    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    /// Whether the cached snapshot is younger than the configured TTL.
    pub fn is_snapshot_fresh(&self) -> bool {
        let Ok(metadata) = fs::metadata(&self.snapshot_path) else {
            return false;
        };
        let Ok(modified) = metadata.modified() else {
            return false;
        };
        SystemTime::now()
            .duration_since(modified)
            .map(|age| age < self.config.snapshot_ttl)
            .unwrap_or(false)
    }

    /// Ensures a fresh snapshot exists locally and opens it read-only.
    ///
    /// Stale or absent snapshots trigger one authenticated fetch; any
    /// non-200 status or missing `database` field fails this connection
    /// attempt without retry.
    pub fn connect(&mut self) -> StoreResult<()> {
        if self.is_snapshot_fresh() {
            info!(
                "event=snapshot_connect module=remote status=ok source=cache path={}",
                self.snapshot_path.display()
            );
        } else {
            self.fetch_snapshot()?;
        }
        self.conn = Some(open_snapshot_read_only(&self.snapshot_path)?);
        Ok(())
    }

    fn fetch_snapshot(&self) -> StoreResult<()> {
        info!(
            "event=snapshot_fetch module=remote status=start endpoint={} repository={}",
            self.config.endpoint, self.config.repository
        );

        let client = reqwest::blocking::Client::new();
        let mut request = client
            .post(&self.config.endpoint)
            .json(&serde_json::json!({ "repository": self.config.repository }));
        if let Some(token) = &self.config.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().map_err(|err| {
            warn!("event=snapshot_fetch module=remote status=error error={err}");
            StoreError::Snapshot(format!("request to `{}` failed: {err}", self.config.endpoint))
        })?;

        let status = response.status();
        if status.as_u16() != 200 {
            return Err(StoreError::Snapshot(format!(
                "endpoint returned status {status}"
            )));
        }

        let body: SnapshotResponse = response
            .json()
            .map_err(|err| StoreError::Snapshot(format!("malformed response body: {err}")))?;
        let encoded = body
            .database
            .ok_or_else(|| StoreError::Snapshot("response missing `database` field".to_string()))?;
        let raw = BASE64_STANDARD
            .decode(encoded.as_bytes())
            .map_err(|err| StoreError::Snapshot(format!("invalid base64 payload: {err}")))?;

        fs::write(&self.snapshot_path, raw).map_err(|source| StoreError::FileSystem {
            path: self.snapshot_path.clone(),
            source,
        })?;
        info!(
            "event=snapshot_fetch module=remote status=ok path={}",
            self.snapshot_path.display()
        );
        Ok(())
    }

    fn conn(&self) -> StoreResult<&Connection> {
        self.conn
            .as_ref()
            .ok_or(StoreError::Db(DbError::NotConnected))
    }

    fn children_of(&self, org_id: &str) -> StoreResult<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT children FROM organizations WHERE org_id = ?1;")?;
        let mut rows = stmt.query([org_id])?;
        if let Some(row) = rows.next()? {
            let text: String = row.get(0)?;
            let children: Vec<String> = serde_json::from_str(&text).map_err(|err| {
                StoreError::InvalidData(format!("invalid JSON in organizations.children: {err}"))
            })?;
            return Ok(children);
        }
        Ok(Vec::new())
    }

    fn load_capabilities_for_ids(&self, org_ids: &[String]) -> StoreResult<Vec<Capability>> {
        if org_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let placeholders = vec!["?"; org_ids.len()].join(", ");
        let sql = format!(
            "SELECT cap_id, name, description, type, entry_point, org_id, group_id,
                    output_json, auth_json, headers_json
             FROM capabilities
             WHERE org_id IN ({placeholders})
             ORDER BY name ASC, cap_id ASC;"
        );
        let bind_values: Vec<Value> = org_ids
            .iter()
            .map(|id| Value::Text(id.clone()))
            .collect();

        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(bind_values))?;
        let mut capabilities = Vec::new();
        while let Some(row) = rows.next()? {
            let mut capability = parse_capability_row(row)?;
            capability.parameters = self.load_parameters(&capability.id)?;
            capabilities.push(capability);
        }
        Ok(capabilities)
    }

    fn load_parameters(&self, cap_id: &str) -> StoreResult<Vec<crate::model::Parameter>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT name, type, required, default_json, description, context_tags
             FROM parameters
             WHERE cap_id = ?1
             ORDER BY position ASC;",
        )?;
        let mut rows = stmt.query([cap_id])?;
        let mut parameters = Vec::new();
        while let Some(row) = rows.next()? {
            parameters.push(parse_parameter_row(row)?);
        }
        Ok(parameters)
    }

    fn organization_exists_inner(&self, org_id: &str) -> StoreResult<bool> {
        let exists: i64 = self.conn()?.query_row(
            "SELECT EXISTS(SELECT 1 FROM organizations WHERE org_id = ?1);",
            [org_id],
            |row| row.get(0),
        )?;
        Ok(exists == 1)
    }

    fn capability_exists_inner(&self, name: &str, org_id: &str) -> StoreResult<bool> {
        let exists: i64 = self.conn()?.query_row(
            "SELECT EXISTS(SELECT 1 FROM capabilities WHERE org_id = ?1 AND name = ?2);",
            [org_id, name],
            |row| row.get(0),
        )?;
        Ok(exists == 1)
    }
}

impl CatalogStore for RemoteStore {
    fn create_organization(&self, _org: &Organization, _overwrite: bool) -> StoreResult<()> {
        Err(StoreError::OperationNotSupported("create_organization"))
    }

    fn create_capability(&self, _cap: &Capability, _overwrite: bool) -> StoreResult<()> {
        Err(StoreError::OperationNotSupported("create_capability"))
    }

    fn list_organizations(&self) -> StoreResult<Vec<Organization>> {
        // The snapshot carries the writable schema's installed flag; honor
        // it the same way the writable backends do.
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT org_id, name, description, logos, categories, children,
                    installed, local_only
             FROM organizations
             WHERE installed = 1
             ORDER BY name ASC, org_id ASC;",
        )?;
        let mut rows = stmt.query([])?;
        let mut organizations = Vec::new();
        while let Some(row) = rows.next()? {
            organizations.push(parse_organization_row(row)?);
        }
        Ok(organizations)
    }

    fn list_capabilities(&self, org_id: &str, scope: ChildScope) -> StoreResult<Vec<Capability>> {
        let org_ids = match scope {
            ChildScope::DirectOnly => vec![org_id.to_string()],
            // Two round trips: a children lookup, then one IN query across
            // the root id and its children.
            ChildScope::IncludeChildren => {
                let mut ids = vec![org_id.to_string()];
                ids.extend(self.children_of(org_id)?);
                ids
            }
        };
        self.load_capabilities_for_ids(&org_ids)
    }

    fn remove_organization(&self, _org_id: &str) -> StoreResult<()> {
        Err(StoreError::OperationNotSupported("remove_organization"))
    }

    fn remove_capability(&self, _name: &str, _org_id: &str) -> StoreResult<()> {
        Err(StoreError::OperationNotSupported("remove_capability"))
    }

    fn organization_exists(&self, org_id: &str) -> bool {
        self.organization_exists_inner(org_id).unwrap_or(false)
    }

    fn capability_exists(&self, name: &str, org_id: &str) -> bool {
        self.capability_exists_inner(name, org_id).unwrap_or(false)
    }

    fn record_usage(&self, _usage: &UsageRecord) -> StoreResult<()> {
        Err(StoreError::OperationNotSupported("record_usage"))
    }

    fn usage_for_capability(&self, cap_id: &str) -> StoreResult<Vec<UsageRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT cap_id, executed_at, duration_ms, success, error_message, params_json
             FROM usage
             WHERE cap_id = ?1
             ORDER BY executed_at ASC, usage_id ASC;",
        )?;
        let mut rows = stmt.query([cap_id])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(parse_usage_row(row)?);
        }
        Ok(records)
    }

    fn installation_for_capability(
        &self,
        cap_id: &str,
    ) -> StoreResult<Option<InstallationRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT cap_id, installed_at, source, metadata_json
             FROM installations
             WHERE cap_id = ?1;",
        )?;
        let mut rows = stmt.query([cap_id])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_installation_row(row)?));
        }
        Ok(None)
    }
}
