//! Catalog entity records.
//!
//! # Responsibility
//! - Define the plain data records shared by every backend: organizations,
//!   capabilities, parameters, installation and usage records.
//! - Provide identifier validation used before any store mutation.
//!
//! # Invariants
//! - Identifiers match `^[a-zA-Z0-9_-]+$`; anything else is rejected by
//!   `validate()` before a backend performs side effects.
//! - A capability's `group_id` defaults to the owning organization when
//!   absent; `effective_group()` encodes that rule in one place.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};

static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_-]+$").expect("valid identifier regex"));

/// Returns whether `value` is a well-formed catalog identifier.
pub fn is_valid_identifier(value: &str) -> bool {
    IDENTIFIER_RE.is_match(value)
}

/// Validation errors raised before any backend side effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Identifier contains characters outside `[a-zA-Z0-9_-]` or is empty.
    InvalidIdentifier { field: &'static str, value: String },
    /// A required free-text field is empty.
    EmptyField(&'static str),
    /// A supplied filesystem path fails a structural requirement.
    InvalidPath(&'static str),
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidIdentifier { field, value } => {
                write!(f, "invalid {field} identifier: `{value}`")
            }
            Self::EmptyField(field) => write!(f, "{field} must not be empty"),
            Self::InvalidPath(reason) => write!(f, "invalid path: {reason}"),
        }
    }
}

impl Error for ValidationError {}

/// Capability type discriminator.
///
/// Determines which auxiliary files a writable backend generates alongside
/// the relational row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityType {
    /// Script-backed capability executed from the file tree.
    Local,
    /// Single-function capability with a generated entry stub.
    Function,
    /// Logic compiled into the host; file tree carries a marker only.
    Core,
    /// Executed against a remote endpoint; no local stub.
    Remote,
}

impl CapabilityType {
    pub fn as_db_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Function => "function",
            Self::Core => "core",
            Self::Remote => "remote",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "local" => Some(Self::Local),
            "function" => Some(Self::Function),
            "core" => Some(Self::Core),
            "remote" => Some(Self::Remote),
            _ => None,
        }
    }

    /// Whether the backend writes an executable stub script for this type.
    pub fn has_script_stub(self) -> bool {
        matches!(self, Self::Local | Self::Function)
    }
}

/// Declared parameter type tag.
///
/// Interpreted at the type-conversion boundary, never enforced by storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    String,
    Integer,
    Boolean,
    Array,
    Object,
}

impl ParameterType {
    pub fn as_db_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "string" => Some(Self::String),
            "integer" => Some(Self::Integer),
            "boolean" => Some(Self::Boolean),
            "array" => Some(Self::Array),
            "object" => Some(Self::Object),
            _ => None,
        }
    }
}

/// Authentication declaration attached to a capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthSpec {
    /// No authentication required.
    None,
    /// OAuth-style flow with a URL pair, client id and scopes.
    Oauth {
        authorize_url: String,
        token_url: String,
        client_id: String,
        scopes: Vec<String>,
    },
    /// Secret resolved from an environment variable at execution time.
    ApiKeyEnv { env_var: String },
}

impl Default for AuthSpec {
    fn default() -> Self {
        Self::None
    }
}

/// Declared input parameter of a capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(rename = "type")]
    pub type_tag: ParameterType,
    pub required: bool,
    /// Declared default; opaque to the persistence layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<serde_json::Value>,
    #[serde(default)]
    pub description: String,
    /// Optional context tags consumed by the host at execution time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_tags: Option<Vec<String>>,
}

/// Declared output of a capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub type_tag: ParameterType,
    #[serde(default)]
    pub description: String,
}

impl Default for OutputDescriptor {
    fn default() -> Self {
        Self {
            name: "result".to_string(),
            type_tag: ParameterType::String,
            description: String::new(),
        }
    }
}

/// Named namespace owning capabilities and child organizations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Organization {
    /// Globally unique identifier within one backend.
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Zero or more logo references.
    #[serde(default)]
    pub logos: Vec<String>,
    /// Category tags such as `local`, `remote`, `builtin`.
    #[serde(default)]
    pub categories: Vec<String>,
    /// Ordered child organization identifiers. Forms a tree by convention;
    /// callers must avoid self-reference.
    #[serde(default)]
    pub children: Vec<String>,
    #[serde(default = "default_true")]
    pub installed: bool,
    #[serde(default)]
    pub local_only: bool,
}

fn default_true() -> bool {
    true
}

impl Organization {
    /// Creates an organization with empty optional fields.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            logos: Vec::new(),
            categories: Vec::new(),
            children: Vec::new(),
            installed: true,
            local_only: false,
        }
    }

    /// Validates declaration-level invariants before persistence.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !is_valid_identifier(&self.id) {
            return Err(ValidationError::InvalidIdentifier {
                field: "organization",
                value: self.id.clone(),
            });
        }
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyField("organization name"));
        }
        for child in &self.children {
            if !is_valid_identifier(child) {
                return Err(ValidationError::InvalidIdentifier {
                    field: "child organization",
                    value: child.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Named, typed, executable unit of functionality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    /// Backend-specific identifier: `{org}.{name}` on the local backend,
    /// a random identifier on the darwin-native backend.
    pub id: String,
    /// Unique within the owning organization (and group, where tracked).
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub kind: CapabilityType,
    pub entry_point: String,
    pub organization_id: String,
    /// Optional group; defaults to the organization when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub output: OutputDescriptor,
    #[serde(default)]
    pub auth: AuthSpec,
    /// Custom headers forwarded verbatim by the executor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
}

impl Capability {
    /// Creates a capability with defaulted optional fields.
    pub fn new(
        name: impl Into<String>,
        kind: CapabilityType,
        entry_point: impl Into<String>,
        organization_id: impl Into<String>,
    ) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            description: String::new(),
            kind,
            entry_point: entry_point.into(),
            organization_id: organization_id.into(),
            group_id: None,
            parameters: Vec::new(),
            output: OutputDescriptor::default(),
            auth: AuthSpec::None,
            headers: None,
        }
    }

    /// Group identifier with the organization fallback applied.
    pub fn effective_group(&self) -> &str {
        self.group_id.as_deref().unwrap_or(&self.organization_id)
    }

    /// Validates declaration-level invariants before persistence.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyField("capability name"));
        }
        // The name becomes a directory component and half of the derived
        // `{org}.{name}` identifier on writable backends; it must match the
        // identifier pattern and must survive kebab-casing non-empty.
        if !is_valid_identifier(&self.name)
            || !self.name.chars().any(|c| c.is_ascii_alphanumeric())
        {
            return Err(ValidationError::InvalidIdentifier {
                field: "capability",
                value: self.name.clone(),
            });
        }
        if !is_valid_identifier(&self.organization_id) {
            return Err(ValidationError::InvalidIdentifier {
                field: "organization",
                value: self.organization_id.clone(),
            });
        }
        if let Some(group) = &self.group_id {
            if !is_valid_identifier(group) {
                return Err(ValidationError::InvalidIdentifier {
                    field: "group",
                    value: group.clone(),
                });
            }
        }
        if self.entry_point.trim().is_empty() {
            return Err(ValidationError::EmptyField("capability entry point"));
        }
        for parameter in &self.parameters {
            if parameter.name.trim().is_empty() {
                return Err(ValidationError::EmptyField("parameter name"));
            }
        }
        Ok(())
    }
}

/// One record per installed capability.
///
/// Existence of this record is what backends use to mean "installed", as
/// distinct from merely "defined".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallationRecord {
    pub capability_id: String,
    /// Epoch milliseconds.
    pub installed_at: i64,
    /// Free-form source tag, e.g. `local`, `remote`.
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Append-only execution log entry. Never updated after insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub capability_id: String,
    /// Epoch milliseconds.
    pub executed_at: i64,
    pub duration_ms: i64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters_snapshot: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::{is_valid_identifier, Capability, CapabilityType, Organization, ValidationError};

    #[test]
    fn identifier_pattern_accepts_alphanumeric_hyphen_underscore() {
        assert!(is_valid_identifier("acme"));
        assert!(is_valid_identifier("acme-labs_2"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("acme/labs"));
        assert!(!is_valid_identifier("acme labs"));
        assert!(!is_valid_identifier("acme.labs"));
    }

    #[test]
    fn organization_validation_rejects_slash_identifier() {
        let org = Organization::new("bad/id", "Bad");
        let err = org.validate().unwrap_err();
        assert!(matches!(
            err,
            ValidationError::InvalidIdentifier {
                field: "organization",
                ..
            }
        ));
    }

    #[test]
    fn organization_validation_rejects_invalid_child_identifier() {
        let mut org = Organization::new("acme", "ACME");
        org.children.push("bad child".to_string());
        assert!(org.validate().is_err());
    }

    #[test]
    fn capability_group_defaults_to_organization() {
        let mut cap = Capability::new("Ping", CapabilityType::Local, "ping.sh", "acme");
        assert_eq!(cap.effective_group(), "acme");
        cap.group_id = Some("network".to_string());
        assert_eq!(cap.effective_group(), "network");
    }

    #[test]
    fn capability_validation_rejects_path_like_names() {
        for name in ["../../../escaped", "a/b", "a\\b", "..", "---", "___"] {
            let cap = Capability::new(name, CapabilityType::Local, "run.sh", "acme");
            assert!(cap.validate().is_err(), "accepted `{name}`");
        }
        let cap = Capability::new("Fetch_Weather-2", CapabilityType::Local, "run.sh", "acme");
        assert!(cap.validate().is_ok());
    }

    #[test]
    fn capability_validation_requires_entry_point() {
        let cap = Capability::new("Ping", CapabilityType::Local, "  ", "acme");
        let err = cap.validate().unwrap_err();
        assert_eq!(err, ValidationError::EmptyField("capability entry point"));
    }
}
