//! Writable local backend: SQLite rows plus a mirrored file tree.
//!
//! # Responsibility
//! - Satisfy the catalog contract against the local five-table schema.
//! - Mirror every organization/capability into `repository/<org>/<cap>/`
//!   artifacts for human and tool inspection.
//!
//! # Invariants
//! - The relational store is authoritative; file artifacts are derived.
//! - Capability identifiers are derived as `{org_id}.{name}`.
//! - Relational upsert and file-tree write are two separate side effects;
//!   a failure between them leaves a partially-created state that callers
//!   resolve by re-checking existence.

use crate::db::open_catalog_db;
use crate::model::{
    AuthSpec, Capability, CapabilityType, InstallationRecord, Organization, OutputDescriptor,
    Parameter, ParameterType, UsageRecord,
};
use crate::store::fs_tree::{
    ensure_dir, remove_subtree, write_json_artifact, write_stub_file, CAPABILITY_ARTIFACT,
    ORG_ARTIFACT,
};
use crate::store::{CatalogStore, ChildScope, StoreError, StoreResult};
use log::info;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, Transaction,
    TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const DB_FILE: &str = "installed.db";
const REPOSITORY_DIR: &str = "repository";

const ORG_SELECT_SQL: &str = "SELECT
    org_id,
    name,
    description,
    logos,
    categories,
    children,
    installed,
    local_only
FROM organizations";

const CAP_SELECT_SQL: &str = "SELECT
    cap_id,
    name,
    description,
    type,
    entry_point,
    org_id,
    group_id,
    output_json,
    auth_json,
    headers_json
FROM capabilities";

/// SQLite-backed writable catalog store.
pub struct LocalStore {
    conn: Connection,
    root: PathBuf,
}

impl LocalStore {
    /// Opens (creating if needed) the store rooted at `root`.
    ///
    /// # Side effects
    /// - Creates `root` and `root/repository/`.
    /// - Opens `root/installed.db` and applies pending migrations.
    pub fn open(root: &Path) -> StoreResult<Self> {
        ensure_dir(root)?;
        ensure_dir(&root.join(REPOSITORY_DIR))?;
        let conn = open_catalog_db(root.join(DB_FILE))?;
        info!(
            "event=store_open module=local status=ok root={}",
            root.display()
        );
        Ok(Self {
            conn,
            root: root.to_path_buf(),
        })
    }

    /// Root directory this store owns.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn org_dir(&self, org_id: &str) -> PathBuf {
        self.root.join(REPOSITORY_DIR).join(org_id)
    }

    fn capability_dir(&self, org_id: &str, name: &str) -> PathBuf {
        self.org_dir(org_id).join(name)
    }

    fn organization_row(&self, org_id: &str) -> StoreResult<Option<Organization>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{ORG_SELECT_SQL} WHERE org_id = ?1;"))?;
        let mut rows = stmt.query([org_id])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_organization_row(row)?));
        }
        Ok(None)
    }

    fn capability_id_for(&self, name: &str, org_id: &str) -> StoreResult<Option<String>> {
        let id: Option<String> = self
            .conn
            .query_row(
                "SELECT cap_id FROM capabilities WHERE org_id = ?1 AND name = ?2;",
                params![org_id, name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    fn load_capabilities_for_ids(&self, org_ids: &[String]) -> StoreResult<Vec<Capability>> {
        if org_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; org_ids.len()].join(", ");
        let sql = format!(
            "{CAP_SELECT_SQL} WHERE org_id IN ({placeholders}) ORDER BY name ASC, cap_id ASC;"
        );
        let bind_values: Vec<Value> = org_ids
            .iter()
            .map(|id| Value::Text(id.clone()))
            .collect();

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(bind_values))?;
        let mut capabilities = Vec::new();
        while let Some(row) = rows.next()? {
            let mut capability = parse_capability_row(row)?;
            capability.parameters = self.load_parameters(&capability.id)?;
            capabilities.push(capability);
        }
        Ok(capabilities)
    }

    fn load_parameters(&self, cap_id: &str) -> StoreResult<Vec<Parameter>> {
        let mut stmt = self.conn.prepare(
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

    fn write_capability_artifacts(&self, cap: &Capability) -> StoreResult<()> {
        let dir = self.capability_dir(&cap.organization_id, &cap.name);
        write_json_artifact(&dir, CAPABILITY_ARTIFACT, cap)?;
        if cap.kind.has_script_stub() {
            let stub = format!(
                "#!/bin/sh\n# Entry stub for `{}`; replace with the implementation.\nexec \"$(dirname \"$0\")/{}\" \"$@\"\n",
                cap.name, cap.entry_point
            );
            write_stub_file(&dir, "run.sh", &stub)?;
        }
        Ok(())
    }

    fn organization_exists_inner(&self, org_id: &str) -> StoreResult<bool> {
        let exists: i64 = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM organizations WHERE org_id = ?1);",
            [org_id],
            |row| row.get(0),
        )?;
        Ok(exists == 1)
    }

    fn capability_exists_inner(&self, name: &str, org_id: &str) -> StoreResult<bool> {
        Ok(self.capability_id_for(name, org_id)?.is_some())
    }
}

impl CatalogStore for LocalStore {
    fn create_organization(&self, org: &Organization, overwrite: bool) -> StoreResult<()> {
        org.validate()?;

        let exists = self.organization_exists_inner(&org.id)?;
        if exists && !overwrite {
            return Err(StoreError::AlreadyExists {
                entity: "organization",
                id: org.id.clone(),
            });
        }

        let logos = to_json_text(&org.logos)?;
        let categories = to_json_text(&org.categories)?;
        let children = to_json_text(&org.children)?;

        if exists {
            // Plain UPDATE; INSERT OR REPLACE would cascade-delete owned
            // capability rows through the foreign key.
            self.conn.execute(
                "UPDATE organizations
                 SET name = ?2,
                     description = ?3,
                     logos = ?4,
                     categories = ?5,
                     children = ?6,
                     installed = ?7,
                     local_only = ?8,
                     updated_at = (strftime('%s', 'now') * 1000)
                 WHERE org_id = ?1;",
                params![
                    org.id,
                    org.name,
                    org.description,
                    logos,
                    categories,
                    children,
                    bool_to_int(org.installed),
                    bool_to_int(org.local_only),
                ],
            )?;
        } else {
            self.conn.execute(
                "INSERT INTO organizations (
                    org_id, name, description, logos, categories, children,
                    installed, local_only
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8);",
                params![
                    org.id,
                    org.name,
                    org.description,
                    logos,
                    categories,
                    children,
                    bool_to_int(org.installed),
                    bool_to_int(org.local_only),
                ],
            )?;
        }

        write_json_artifact(&self.org_dir(&org.id), ORG_ARTIFACT, org)?;
        info!(
            "event=org_create module=local status=ok org={} overwrite={overwrite}",
            org.id
        );
        Ok(())
    }

    fn create_capability(&self, cap: &Capability, overwrite: bool) -> StoreResult<()> {
        cap.validate()?;

        if !self.organization_exists_inner(&cap.organization_id)? {
            return Err(StoreError::OrganizationNotFound(
                cap.organization_id.clone(),
            ));
        }

        let existing = self.capability_id_for(&cap.name, &cap.organization_id)?;
        if existing.is_some() && !overwrite {
            return Err(StoreError::AlreadyExists {
                entity: "capability",
                id: cap.name.clone(),
            });
        }

        let cap_id = format!("{}.{}", cap.organization_id, cap.name);
        let mut stored = cap.clone();
        stored.id = cap_id.clone();

        let output = to_json_text(&stored.output)?;
        let auth = to_json_text(&stored.auth)?;
        let headers = stored
            .headers
            .as_ref()
            .map(to_json_text)
            .transpose()?;

        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        if let Some(existing_id) = existing {
            tx.execute("DELETE FROM capabilities WHERE cap_id = ?1;", [existing_id])?;
        }
        tx.execute(
            "INSERT INTO capabilities (
                cap_id, name, description, type, entry_point, org_id,
                group_id, output_json, auth_json, headers_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10);",
            params![
                cap_id,
                stored.name,
                stored.description,
                stored.kind.as_db_str(),
                stored.entry_point,
                stored.organization_id,
                stored.group_id.as_deref(),
                output,
                auth,
                headers.as_deref(),
            ],
        )?;
        insert_parameters(&tx, &cap_id, &stored.parameters)?;
        tx.execute(
            "INSERT INTO installations (cap_id, installed_at, source, metadata_json)
             VALUES (?1, ?2, 'local', NULL);",
            params![cap_id, now_epoch_ms()],
        )?;
        tx.commit()?;

        self.write_capability_artifacts(&stored)?;
        info!(
            "event=cap_create module=local status=ok cap={} org={} overwrite={overwrite}",
            stored.name, stored.organization_id
        );
        Ok(())
    }

    fn list_organizations(&self) -> StoreResult<Vec<Organization>> {
        let mut stmt = self.conn.prepare(&format!(
            "{ORG_SELECT_SQL} WHERE installed = 1 ORDER BY name ASC, org_id ASC;"
        ))?;
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
            ChildScope::IncludeChildren => match self.organization_row(org_id)? {
                Some(org) => {
                    let mut ids = vec![org.id];
                    ids.extend(org.children);
                    ids
                }
                None => return Ok(Vec::new()),
            },
        };
        self.load_capabilities_for_ids(&org_ids)
    }

    fn remove_organization(&self, org_id: &str) -> StoreResult<()> {
        let changed = self
            .conn
            .execute("DELETE FROM organizations WHERE org_id = ?1;", [org_id])?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                entity: "organization",
                id: org_id.to_string(),
            });
        }
        remove_subtree(&self.org_dir(org_id))?;
        info!("event=org_remove module=local status=ok org={org_id}");
        Ok(())
    }

    fn remove_capability(&self, name: &str, org_id: &str) -> StoreResult<()> {
        let Some(cap_id) = self.capability_id_for(name, org_id)? else {
            return Err(StoreError::NotFound {
                entity: "capability",
                id: name.to_string(),
            });
        };
        self.conn
            .execute("DELETE FROM capabilities WHERE cap_id = ?1;", [cap_id])?;
        remove_subtree(&self.capability_dir(org_id, name))?;
        info!("event=cap_remove module=local status=ok cap={name} org={org_id}");
        Ok(())
    }

    fn organization_exists(&self, org_id: &str) -> bool {
        self.organization_exists_inner(org_id).unwrap_or(false)
    }

    fn capability_exists(&self, name: &str, org_id: &str) -> bool {
        self.capability_exists_inner(name, org_id).unwrap_or(false)
    }

    fn record_usage(&self, usage: &UsageRecord) -> StoreResult<()> {
        let params_json = usage
            .parameters_snapshot
            .as_ref()
            .map(to_json_text)
            .transpose()?;
        self.conn.execute(
            "INSERT INTO usage (
                cap_id, executed_at, duration_ms, success, error_message, params_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6);",
            params![
                usage.capability_id,
                usage.executed_at,
                usage.duration_ms,
                bool_to_int(usage.success),
                usage.error_message.as_deref(),
                params_json.as_deref(),
            ],
        )?;
        Ok(())
    }

    fn usage_for_capability(&self, cap_id: &str) -> StoreResult<Vec<UsageRecord>> {
        let mut stmt = self.conn.prepare(
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
        let mut stmt = self.conn.prepare(
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

fn insert_parameters(
    tx: &Transaction<'_>,
    cap_id: &str,
    parameters: &[Parameter],
) -> StoreResult<()> {
    for (position, parameter) in parameters.iter().enumerate() {
        let default_json = parameter
            .default_value
            .as_ref()
            .map(to_json_text)
            .transpose()?;
        let context_tags = parameter
            .context_tags
            .as_ref()
            .map(to_json_text)
            .transpose()?;
        tx.execute(
            "INSERT INTO parameters (
                cap_id, position, name, type, required, default_json,
                description, context_tags
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8);",
            params![
                cap_id,
                position as i64,
                parameter.name,
                parameter.type_tag.as_db_str(),
                bool_to_int(parameter.required),
                default_json.as_deref(),
                parameter.description,
                context_tags.as_deref(),
            ],
        )?;
    }
    Ok(())
}

pub(crate) fn parse_organization_row(row: &Row<'_>) -> StoreResult<Organization> {
    Ok(Organization {
        id: row.get("org_id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        logos: from_json_column(row, "logos")?,
        categories: from_json_column(row, "categories")?,
        children: from_json_column(row, "children")?,
        installed: int_to_bool(row.get("installed")?, "organizations.installed")?,
        local_only: int_to_bool(row.get("local_only")?, "organizations.local_only")?,
    })
}

pub(crate) fn parse_capability_row(row: &Row<'_>) -> StoreResult<Capability> {
    let type_text: String = row.get("type")?;
    let kind = CapabilityType::parse(&type_text).ok_or_else(|| {
        StoreError::InvalidData(format!("invalid capability type `{type_text}`"))
    })?;

    let output: OutputDescriptor = from_json_column(row, "output_json")?;
    let auth: AuthSpec = from_json_column(row, "auth_json")?;
    let headers = match row.get::<_, Option<String>>("headers_json")? {
        Some(text) => Some(parse_json_text(&text, "capabilities.headers_json")?),
        None => None,
    };

    Ok(Capability {
        id: row.get("cap_id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        kind,
        entry_point: row.get("entry_point")?,
        organization_id: row.get("org_id")?,
        group_id: row.get("group_id")?,
        parameters: Vec::new(),
        output,
        auth,
        headers,
    })
}

pub(crate) fn parse_parameter_row(row: &Row<'_>) -> StoreResult<Parameter> {
    let type_text: String = row.get("type")?;
    let type_tag = ParameterType::parse(&type_text)
        .ok_or_else(|| StoreError::InvalidData(format!("invalid parameter type `{type_text}`")))?;

    let default_value = match row.get::<_, Option<String>>("default_json")? {
        Some(text) => Some(parse_json_text(&text, "parameters.default_json")?),
        None => None,
    };
    let context_tags = match row.get::<_, Option<String>>("context_tags")? {
        Some(text) => Some(parse_json_text(&text, "parameters.context_tags")?),
        None => None,
    };

    Ok(Parameter {
        name: row.get("name")?,
        type_tag,
        required: int_to_bool(row.get("required")?, "parameters.required")?,
        default_value,
        description: row.get("description")?,
        context_tags,
    })
}

pub(crate) fn parse_usage_row(row: &Row<'_>) -> StoreResult<UsageRecord> {
    let parameters_snapshot = match row.get::<_, Option<String>>("params_json")? {
        Some(text) => Some(parse_json_text(&text, "usage.params_json")?),
        None => None,
    };
    Ok(UsageRecord {
        capability_id: row.get("cap_id")?,
        executed_at: row.get("executed_at")?,
        duration_ms: row.get("duration_ms")?,
        success: int_to_bool(row.get("success")?, "usage.success")?,
        error_message: row.get("error_message")?,
        parameters_snapshot,
    })
}

pub(crate) fn parse_installation_row(row: &Row<'_>) -> StoreResult<InstallationRecord> {
    let metadata = match row.get::<_, Option<String>>("metadata_json")? {
        Some(text) => Some(parse_json_text(&text, "installations.metadata_json")?),
        None => None,
    };
    Ok(InstallationRecord {
        capability_id: row.get("cap_id")?,
        installed_at: row.get("installed_at")?,
        source: row.get("source")?,
        metadata,
    })
}

pub(crate) fn to_json_text<T: serde::Serialize>(value: &T) -> StoreResult<String> {
    serde_json::to_string(value)
        .map_err(|err| StoreError::InvalidData(format!("cannot serialize value: {err}")))
}

pub(crate) fn parse_json_text<T: serde::de::DeserializeOwned>(
    text: &str,
    column: &str,
) -> StoreResult<T> {
    serde_json::from_str(text)
        .map_err(|err| StoreError::InvalidData(format!("invalid JSON in {column}: {err}")))
}

fn from_json_column<T: serde::de::DeserializeOwned>(
    row: &Row<'_>,
    column: &'static str,
) -> StoreResult<T> {
    let text: String = row.get(column)?;
    parse_json_text(&text, column)
}

pub(crate) fn bool_to_int(value: bool) -> i64 {
    if value {
        1
    } else {
        0
    }
}

pub(crate) fn int_to_bool(value: i64, column: &'static str) -> StoreResult<bool> {
    match value {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(StoreError::InvalidData(format!(
            "invalid boolean value `{other}` in {column}"
        ))),
    }
}

pub(crate) fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or_default()
}
