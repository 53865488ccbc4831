//! File-tree artifact helpers shared by the writable backends.
//!
//! # Responsibility
//! - Write JSON artifacts and type-specific stub files under the
//!   per-organization directory tree.
//! - Remove artifact subtrees on cascade delete.
//!
//! # Invariants
//! - The relational store is authoritative; artifacts here are derived and
//!   re-derivable via `create_*` with `overwrite=true`.
//! - Subtree removal tolerates an already-missing directory.

use crate::store::{StoreError, StoreResult};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::Path;

/// Name of the per-organization metadata artifact.
pub const ORG_ARTIFACT: &str = "org.json";
/// Name of the per-capability metadata artifact.
pub const CAPABILITY_ARTIFACT: &str = "capability.json";
/// Marker written for capabilities whose logic is compiled into the host.
pub const BUILTIN_MARKER: &str = ".builtin";

/// Creates `dir` and all missing parents.
pub fn ensure_dir(dir: &Path) -> StoreResult<()> {
    fs::create_dir_all(dir).map_err(|source| fs_error(dir, source))
}

/// Serializes `value` as pretty JSON into `dir/file_name`.
pub fn write_json_artifact<T: Serialize>(dir: &Path, file_name: &str, value: &T) -> StoreResult<()> {
    ensure_dir(dir)?;
    let path = dir.join(file_name);
    let body = serde_json::to_string_pretty(value)
        .map_err(|err| StoreError::InvalidData(format!("cannot serialize `{file_name}`: {err}")))?;
    fs::write(&path, body).map_err(|source| fs_error(&path, source))
}

/// Writes a plain-text stub file, marking it executable on unix.
pub fn write_stub_file(dir: &Path, file_name: &str, body: &str) -> StoreResult<()> {
    ensure_dir(dir)?;
    let path = dir.join(file_name);
    fs::write(&path, body).map_err(|source| fs_error(&path, source))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = fs::Permissions::from_mode(0o755);
        fs::set_permissions(&path, perms).map_err(|source| fs_error(&path, source))?;
    }
    Ok(())
}

/// Removes `dir` recursively. Missing directory is not an error.
pub fn remove_subtree(dir: &Path) -> StoreResult<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(fs_error(dir, source)),
    }
}

/// Kebab-cases a display name for darwin-native directory layout.
///
/// Non-alphanumeric runs collapse into single hyphens; leading/trailing
/// hyphens are trimmed.
pub fn kebab_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_hyphen = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_hyphen && !out.is_empty() {
                out.push('-');
            }
            pending_hyphen = false;
            // Split camelCase word boundaries the way the host app does.
            if c.is_ascii_uppercase() && out.chars().last().is_some_and(|p| p.is_ascii_lowercase())
            {
                out.push('-');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            pending_hyphen = true;
        }
    }
    out
}

fn fs_error(path: &Path, source: io::Error) -> StoreError {
    if source.kind() == io::ErrorKind::PermissionDenied {
        return StoreError::PermissionDenied(path.to_path_buf());
    }
    StoreError::FileSystem {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::kebab_case;

    #[test]
    fn kebab_case_handles_spaces_and_camel_case() {
        assert_eq!(kebab_case("Ping"), "ping");
        assert_eq!(kebab_case("Fetch Weather"), "fetch-weather");
        assert_eq!(kebab_case("fetchWeatherNow"), "fetch-weather-now");
        assert_eq!(kebab_case("  spaced   out  "), "spaced-out");
        assert_eq!(kebab_case("v2_beta"), "v2-beta");
    }
}
