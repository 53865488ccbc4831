//! Writable backend matching the darwin host application's on-disk schema.
//!
//! # Responsibility
//! - Satisfy the catalog contract against the externally-owned `orgs` /
//!   `caps` / `cap_params` / `cap_installs` / `cap_usage` schema.
//! - Mirror capabilities into kebab-cased directories with the host's
//!   marker-file conventions for compiled-in types.
//!
//! # Invariants
//! - Table and column names are dictated by the external consumer and must
//!   not drift; the schema is applied verbatim, never migrated through the
//!   local registry.
//! - Organization metadata persists as one JSON blob column.
//! - Capability identifiers are random UUIDv4 values.

use crate::model::{
    AuthSpec, Capability, CapabilityType, InstallationRecord, Organization, OutputDescriptor,
    Parameter, ParameterType, UsageRecord,
};
use crate::store::fs_tree::{
    ensure_dir, kebab_case, remove_subtree, write_json_artifact, write_stub_file,
    BUILTIN_MARKER, CAPABILITY_ARTIFACT, ORG_ARTIFACT,
};
use crate::store::local::{
    bool_to_int, int_to_bool, now_epoch_ms, parse_json_text, to_json_text,
};
use crate::store::{CatalogStore, ChildScope, StoreError, StoreResult};
use log::info;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, Transaction,
    TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

const DB_FILE: &str = "installed.db";
const REPOSITORY_DIR: &str = "repository";

/// Fixed schema owned by the darwin host application. Byte-for-byte
/// compatibility matters more than relational hygiene here.
const DARWIN_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS orgs (
    identifier   TEXT PRIMARY KEY NOT NULL,
    display_name TEXT NOT NULL,
    metadata     TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS caps (
    cap_uuid         TEXT PRIMARY KEY NOT NULL,
    title            TEXT NOT NULL,
    summary          TEXT NOT NULL DEFAULT '',
    cap_type         TEXT NOT NULL,
    entry_point      TEXT NOT NULL,
    org_identifier   TEXT NOT NULL REFERENCES orgs(identifier) ON DELETE CASCADE,
    group_identifier TEXT,
    output_spec      TEXT NOT NULL DEFAULT '{}',
    auth_spec        TEXT NOT NULL DEFAULT '{\"kind\":\"none\"}',
    header_spec      TEXT,
    UNIQUE (org_identifier, group_identifier, title)
);

CREATE INDEX IF NOT EXISTS idx_caps_org ON caps(org_identifier);
CREATE INDEX IF NOT EXISTS idx_caps_type ON caps(cap_type);

CREATE TABLE IF NOT EXISTS cap_params (
    cap_uuid      TEXT NOT NULL REFERENCES caps(cap_uuid) ON DELETE CASCADE,
    idx           INTEGER NOT NULL,
    param_name    TEXT NOT NULL,
    param_type    TEXT NOT NULL,
    is_required   INTEGER NOT NULL DEFAULT 0,
    default_value TEXT,
    summary       TEXT NOT NULL DEFAULT '',
    contexts      TEXT,
    PRIMARY KEY (cap_uuid, idx)
);

CREATE TABLE IF NOT EXISTS cap_installs (
    cap_uuid     TEXT PRIMARY KEY NOT NULL REFERENCES caps(cap_uuid) ON DELETE CASCADE,
    installed_at INTEGER NOT NULL,
    source       TEXT NOT NULL,
    metadata     TEXT
);

CREATE TABLE IF NOT EXISTS cap_usage (
    row_id        INTEGER PRIMARY KEY AUTOINCREMENT,
    cap_uuid      TEXT NOT NULL REFERENCES caps(cap_uuid) ON DELETE CASCADE,
    executed_at   INTEGER NOT NULL,
    duration_ms   INTEGER NOT NULL,
    success       INTEGER NOT NULL,
    error_message TEXT,
    params        TEXT
);

CREATE INDEX IF NOT EXISTS idx_cap_usage_time ON cap_usage(cap_uuid, executed_at);
";

/// Schema-flexibility escape hatch: everything beyond the display name is
/// folded into the `metadata` blob column.
#[derive(Debug, Serialize, Deserialize)]
struct OrgMetadata {
    #[serde(default)]
    description: String,
    #[serde(default)]
    logos: Vec<String>,
    #[serde(default)]
    categories: Vec<String>,
    #[serde(default)]
    children: Vec<String>,
    #[serde(default = "default_true")]
    installed: bool,
    #[serde(default)]
    local_only: bool,
}

fn default_true() -> bool {
    true
}

/// Catalog store matching the darwin host application's exact schema.
pub struct DarwinStore {
    conn: Connection,
    root: PathBuf,
}

impl DarwinStore {
    /// Opens (creating if needed) the store rooted at `root`.
    pub fn open(root: &Path) -> StoreResult<Self> {
        ensure_dir(root)?;
        ensure_dir(&root.join(REPOSITORY_DIR))?;
        let conn = Connection::open(root.join(DB_FILE))?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA journal_mode = WAL;",
        )?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(DARWIN_SCHEMA)?;
        info!(
            "event=store_open module=darwin status=ok root={}",
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

    fn capability_dir(&self, org_id: &str, display_name: &str) -> PathBuf {
        self.org_dir(org_id).join(kebab_case(display_name))
    }

    fn organization_row(&self, org_id: &str) -> StoreResult<Option<Organization>> {
        let mut stmt = self
            .conn
            .prepare("SELECT identifier, display_name, metadata FROM orgs WHERE identifier = ?1;")?;
        let mut rows = stmt.query([org_id])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_org_row(row)?));
        }
        Ok(None)
    }

    fn capability_uuid_for(&self, name: &str, org_id: &str) -> StoreResult<Option<String>> {
        let id: Option<String> = self
            .conn
            .query_row(
                "SELECT cap_uuid FROM caps WHERE org_identifier = ?1 AND title = ?2;",
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
            "SELECT cap_uuid, title, summary, cap_type, entry_point, org_identifier,
                    group_identifier, output_spec, auth_spec, header_spec
             FROM caps
             WHERE org_identifier IN ({placeholders})
             ORDER BY title ASC, cap_uuid ASC;"
        );
        let bind_values: Vec<Value> = org_ids
            .iter()
            .map(|id| Value::Text(id.clone()))
            .collect();

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(bind_values))?;
        let mut capabilities = Vec::new();
        while let Some(row) = rows.next()? {
            let mut capability = parse_cap_row(row)?;
            capability.parameters = self.load_parameters(&capability.id)?;
            capabilities.push(capability);
        }
        Ok(capabilities)
    }

    fn load_parameters(&self, cap_uuid: &str) -> StoreResult<Vec<Parameter>> {
        let mut stmt = self.conn.prepare(
            "SELECT param_name, param_type, is_required, default_value, summary, contexts
             FROM cap_params
             WHERE cap_uuid = ?1
             ORDER BY idx ASC;",
        )?;
        let mut rows = stmt.query([cap_uuid])?;
        let mut parameters = Vec::new();
        while let Some(row) = rows.next()? {
            parameters.push(parse_param_row(row)?);
        }
        Ok(parameters)
    }

    fn write_capability_artifacts(&self, cap: &Capability) -> StoreResult<()> {
        let dir = self.capability_dir(&cap.organization_id, &cap.name);
        write_json_artifact(&dir, CAPABILITY_ARTIFACT, cap)?;
        if cap.kind == CapabilityType::Core {
            // Compiled into the host: the marker plus a refusal stub tell
            // tooling there is no script to run here.
            write_stub_file(&dir, BUILTIN_MARKER, "")?;
            write_stub_file(
                &dir,
                "run.sh",
                "#!/bin/sh\necho \"this capability is provided by the host application\" >&2\nexit 1\n",
            )?;
        } else if cap.kind.has_script_stub() {
            let stub = format!(
                "#!/bin/sh\nexec \"$(dirname \"$0\")/{}\" \"$@\"\n",
                cap.entry_point
            );
            write_stub_file(&dir, "run.sh", &stub)?;
        }
        Ok(())
    }

    fn organization_exists_inner(&self, org_id: &str) -> StoreResult<bool> {
        let exists: i64 = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM orgs WHERE identifier = ?1);",
            [org_id],
            |row| row.get(0),
        )?;
        Ok(exists == 1)
    }
}

impl CatalogStore for DarwinStore {
    fn create_organization(&self, org: &Organization, overwrite: bool) -> StoreResult<()> {
        org.validate()?;

        let exists = self.organization_exists_inner(&org.id)?;
        if exists && !overwrite {
            return Err(StoreError::AlreadyExists {
                entity: "organization",
                id: org.id.clone(),
            });
        }

        let metadata = to_json_text(&OrgMetadata {
            description: org.description.clone(),
            logos: org.logos.clone(),
            categories: org.categories.clone(),
            children: org.children.clone(),
            installed: org.installed,
            local_only: org.local_only,
        })?;

        if exists {
            self.conn.execute(
                "UPDATE orgs SET display_name = ?2, metadata = ?3 WHERE identifier = ?1;",
                params![org.id, org.name, metadata],
            )?;
        } else {
            self.conn.execute(
                "INSERT INTO orgs (identifier, display_name, metadata) VALUES (?1, ?2, ?3);",
                params![org.id, org.name, metadata],
            )?;
        }

        write_json_artifact(&self.org_dir(&org.id), ORG_ARTIFACT, org)?;
        info!(
            "event=org_create module=darwin status=ok org={} overwrite={overwrite}",
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

        let existing = self.capability_uuid_for(&cap.name, &cap.organization_id)?;
        if existing.is_some() && !overwrite {
            return Err(StoreError::AlreadyExists {
                entity: "capability",
                id: cap.name.clone(),
            });
        }

        let mut stored = cap.clone();
        stored.id = Uuid::new_v4().to_string();

        let output = to_json_text(&stored.output)?;
        let auth = to_json_text(&stored.auth)?;
        let headers = stored.headers.as_ref().map(to_json_text).transpose()?;

        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        if let Some(existing_uuid) = existing {
            tx.execute("DELETE FROM caps WHERE cap_uuid = ?1;", [existing_uuid])?;
        }
        tx.execute(
            "INSERT INTO caps (
                cap_uuid, title, summary, cap_type, entry_point, org_identifier,
                group_identifier, output_spec, auth_spec, header_spec
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10);",
            params![
                stored.id,
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
        for (idx, parameter) in stored.parameters.iter().enumerate() {
            let default_value = parameter
                .default_value
                .as_ref()
                .map(to_json_text)
                .transpose()?;
            let contexts = parameter
                .context_tags
                .as_ref()
                .map(to_json_text)
                .transpose()?;
            tx.execute(
                "INSERT INTO cap_params (
                    cap_uuid, idx, param_name, param_type, is_required,
                    default_value, summary, contexts
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8);",
                params![
                    stored.id,
                    idx as i64,
                    parameter.name,
                    parameter.type_tag.as_db_str(),
                    bool_to_int(parameter.required),
                    default_value.as_deref(),
                    parameter.description,
                    contexts.as_deref(),
                ],
            )?;
        }
        tx.execute(
            "INSERT INTO cap_installs (cap_uuid, installed_at, source, metadata)
             VALUES (?1, ?2, 'darwin', NULL);",
            params![stored.id, now_epoch_ms()],
        )?;
        tx.commit()?;

        self.write_capability_artifacts(&stored)?;
        info!(
            "event=cap_create module=darwin status=ok cap={} org={} overwrite={overwrite}",
            stored.name, stored.organization_id
        );
        Ok(())
    }

    fn list_organizations(&self) -> StoreResult<Vec<Organization>> {
        let mut stmt = self.conn.prepare(
            "SELECT identifier, display_name, metadata
             FROM orgs
             ORDER BY display_name ASC, identifier ASC;",
        )?;
        let mut rows = stmt.query([])?;
        let mut organizations = Vec::new();
        while let Some(row) = rows.next()? {
            let org = parse_org_row(row)?;
            if org.installed {
                organizations.push(org);
            }
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
            .execute("DELETE FROM orgs WHERE identifier = ?1;", [org_id])?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                entity: "organization",
                id: org_id.to_string(),
            });
        }
        remove_subtree(&self.org_dir(org_id))?;
        info!("event=org_remove module=darwin status=ok org={org_id}");
        Ok(())
    }

    fn remove_capability(&self, name: &str, org_id: &str) -> StoreResult<()> {
        let Some(cap_uuid) = self.capability_uuid_for(name, org_id)? else {
            return Err(StoreError::NotFound {
                entity: "capability",
                id: name.to_string(),
            });
        };
        self.conn
            .execute("DELETE FROM caps WHERE cap_uuid = ?1;", [cap_uuid])?;
        remove_subtree(&self.capability_dir(org_id, name))?;
        info!("event=cap_remove module=darwin status=ok cap={name} org={org_id}");
        Ok(())
    }

    fn organization_exists(&self, org_id: &str) -> bool {
        self.organization_exists_inner(org_id).unwrap_or(false)
    }

    fn capability_exists(&self, name: &str, org_id: &str) -> bool {
        self.capability_uuid_for(name, org_id)
            .map(|id| id.is_some())
            .unwrap_or(false)
    }

    fn record_usage(&self, usage: &UsageRecord) -> StoreResult<()> {
        let params_text = usage
            .parameters_snapshot
            .as_ref()
            .map(to_json_text)
            .transpose()?;
        self.conn.execute(
            "INSERT INTO cap_usage (
                cap_uuid, executed_at, duration_ms, success, error_message, params
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6);",
            params![
                usage.capability_id,
                usage.executed_at,
                usage.duration_ms,
                bool_to_int(usage.success),
                usage.error_message.as_deref(),
                params_text.as_deref(),
            ],
        )?;
        Ok(())
    }

    fn usage_for_capability(&self, cap_id: &str) -> StoreResult<Vec<UsageRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT cap_uuid, executed_at, duration_ms, success, error_message, params
             FROM cap_usage
             WHERE cap_uuid = ?1
             ORDER BY executed_at ASC, row_id ASC;",
        )?;
        let mut rows = stmt.query([cap_id])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let parameters_snapshot = match row.get::<_, Option<String>>("params")? {
                Some(text) => Some(parse_json_text(&text, "cap_usage.params")?),
                None => None,
            };
            records.push(UsageRecord {
                capability_id: row.get("cap_uuid")?,
                executed_at: row.get("executed_at")?,
                duration_ms: row.get("duration_ms")?,
                success: int_to_bool(row.get("success")?, "cap_usage.success")?,
                error_message: row.get("error_message")?,
                parameters_snapshot,
            });
        }
        Ok(records)
    }

    fn installation_for_capability(
        &self,
        cap_id: &str,
    ) -> StoreResult<Option<InstallationRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT cap_uuid, installed_at, source, metadata
             FROM cap_installs
             WHERE cap_uuid = ?1;",
        )?;
        let mut rows = stmt.query([cap_id])?;
        if let Some(row) = rows.next()? {
            let metadata = match row.get::<_, Option<String>>("metadata")? {
                Some(text) => Some(parse_json_text(&text, "cap_installs.metadata")?),
                None => None,
            };
            return Ok(Some(InstallationRecord {
                capability_id: row.get("cap_uuid")?,
                installed_at: row.get("installed_at")?,
                source: row.get("source")?,
                metadata,
            }));
        }
        Ok(None)
    }
}

fn parse_org_row(row: &Row<'_>) -> StoreResult<Organization> {
    let metadata_text: String = row.get("metadata")?;
    let metadata: OrgMetadata = parse_json_text(&metadata_text, "orgs.metadata")?;
    Ok(Organization {
        id: row.get("identifier")?,
        name: row.get("display_name")?,
        description: metadata.description,
        logos: metadata.logos,
        categories: metadata.categories,
        children: metadata.children,
        installed: metadata.installed,
        local_only: metadata.local_only,
    })
}

fn parse_cap_row(row: &Row<'_>) -> StoreResult<Capability> {
    let type_text: String = row.get("cap_type")?;
    let kind = CapabilityType::parse(&type_text)
        .ok_or_else(|| StoreError::InvalidData(format!("invalid capability type `{type_text}`")))?;

    let output_text: String = row.get("output_spec")?;
    let output: OutputDescriptor = parse_json_text(&output_text, "caps.output_spec")?;
    let auth_text: String = row.get("auth_spec")?;
    let auth: AuthSpec = parse_json_text(&auth_text, "caps.auth_spec")?;
    let headers = match row.get::<_, Option<String>>("header_spec")? {
        Some(text) => Some(parse_json_text(&text, "caps.header_spec")?),
        None => None,
    };

    Ok(Capability {
        id: row.get("cap_uuid")?,
        name: row.get("title")?,
        description: row.get("summary")?,
        kind,
        entry_point: row.get("entry_point")?,
        organization_id: row.get("org_identifier")?,
        group_id: row.get("group_identifier")?,
        parameters: Vec::new(),
        output,
        auth,
        headers,
    })
}

fn parse_param_row(row: &Row<'_>) -> StoreResult<Parameter> {
    let type_text: String = row.get("param_type")?;
    let type_tag = ParameterType::parse(&type_text)
        .ok_or_else(|| StoreError::InvalidData(format!("invalid parameter type `{type_text}`")))?;

    let default_value = match row.get::<_, Option<String>>("default_value")? {
        Some(text) => Some(parse_json_text(&text, "cap_params.default_value")?),
        None => None,
    };
    let context_tags = match row.get::<_, Option<String>>("contexts")? {
        Some(text) => Some(parse_json_text(&text, "cap_params.contexts")?),
        None => None,
    };

    Ok(Parameter {
        name: row.get("param_name")?,
        type_tag,
        required: int_to_bool(row.get("is_required")?, "cap_params.is_required")?,
        default_value,
        description: row.get("summary")?,
        context_tags,
    })
}
