//! Migration definitions and their on-disk naming.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{MigrateResult, MigrationError};

/// Numeric migration identifier, unique within one schema at one revision.
pub type MigrationId = i64;

/// File holding a migration's up statements.
pub const UP_FILE: &str = "up.sql";
/// File holding a migration's down statements.
pub const DOWN_FILE: &str = "down.sql";
/// File holding a migration's metadata.
pub const METADATA_FILE: &str = "metadata.toml";

/// One reversible schema change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Migration {
    /// Migration ID (leading integer of the directory name).
    pub id: MigrationId,
    /// Slug used in the directory name; the identity compared across branches.
    pub name: String,
    /// Human readable title from the metadata file.
    pub title: String,
    /// IDs this migration depends on.
    pub parents: Vec<MigrationId>,
    /// Up SQL content.
    pub up_query: String,
    /// Down SQL content.
    pub down_query: String,
    /// Whether the up statements need elevated privileges.
    pub privileged: bool,
    /// Whether re-running the up statements is unsafe.
    pub non_idempotent: bool,
    /// Directory holding the migration.
    pub path: PathBuf,
}

impl Migration {
    /// Create a migration with empty bodies.
    pub fn new(id: MigrationId, name: impl Into<String>) -> Self {
        let title = name.into();
        Self {
            id,
            name: sanitize_name(&title),
            title,
            parents: Vec::new(),
            up_query: String::new(),
            down_query: String::new(),
            privileged: false,
            non_idempotent: false,
            path: PathBuf::new(),
        }
    }

    /// Set the parents.
    pub fn with_parents(mut self, parents: impl IntoIterator<Item = MigrationId>) -> Self {
        let mut parents: Vec<_> = parents.into_iter().collect();
        parents.sort_unstable();
        parents.dedup();
        self.parents = parents;
        self
    }

    /// Set the up and down bodies.
    pub fn with_queries(mut self, up: impl Into<String>, down: impl Into<String>) -> Self {
        self.up_query = up.into();
        self.down_query = down.into();
        self
    }

    /// Set the directory path.
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    /// Mark the migration as privileged.
    pub fn privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    /// Directory name for this migration: `<id>_<slug>`, or `<id>` without a slug.
    pub fn dir_name(&self) -> String {
        dir_name(self.id, &self.name)
    }

    /// `<id>_<slug>` label for progress output.
    pub fn label(&self) -> String {
        self.dir_name()
    }

    /// Metadata persisted next to the bodies.
    pub fn metadata(&self) -> Metadata {
        Metadata {
            name: self.title.clone(),
            parents: self.parents.clone(),
            privileged: self.privileged,
            non_idempotent: self.non_idempotent,
        }
    }
}

/// Contents of `metadata.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Human readable name.
    #[serde(default)]
    pub name: String,
    /// Parent migration IDs.
    #[serde(default)]
    pub parents: Vec<MigrationId>,
    /// Requires elevated privileges.
    #[serde(default, skip_serializing_if = "is_false")]
    pub privileged: bool,
    /// Unsafe to re-run.
    #[serde(default, skip_serializing_if = "is_false")]
    pub non_idempotent: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl Metadata {
    /// Parse metadata from TOML text.
    pub fn parse(content: &str, path: &Path) -> MigrateResult<Self> {
        toml::from_str(content).map_err(|e| MigrationError::Metadata {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Render metadata as TOML text.
    pub fn render(&self, path: &Path) -> MigrateResult<String> {
        toml::to_string(self).map_err(|e| MigrationError::Metadata {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }
}

/// Build a directory name from an ID and slug.
pub fn dir_name(id: MigrationId, slug: &str) -> String {
    if slug.is_empty() {
        id.to_string()
    } else {
        format!("{}_{}", id, slug)
    }
}

/// Parse a migration directory or file name into `(id, slug)`.
///
/// The ID is the leading run of digits; it must be followed by the end of the
/// name, `_` or `.`. Anything after the first `.` (file extensions) is
/// dropped from the slug. Returns `None` for names that are not migrations,
/// including hidden (`_`-prefixed) entries.
pub fn parse_migration_name(name: &str) -> Option<(MigrationId, String)> {
    let digits = name.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return None;
    }

    let id: MigrationId = name[..digits].parse().ok()?;
    if id <= 0 {
        return None;
    }

    let rest = &name[digits..];
    let slug = match rest.chars().next() {
        None | Some('.') => "",
        Some('_') => rest[1..].split('.').next().unwrap_or_default(),
        Some(_) => return None,
    };

    Some((id, slug.to_string()))
}

/// Lowercase a free-form name into a `[a-z0-9_]` slug.
pub fn sanitize_name(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('_') {
            slug.push('_');
        }
    }
    slug.trim_matches('_').to_string()
}

/// Hidden variant of a migration directory: the base name prefixed with `_`.
pub fn hidden_path(path: &Path) -> PathBuf {
    let base = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("_{}", base))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_migration_name() {
        assert_eq!(
            parse_migration_name("1528395834_create_users"),
            Some((1528395834, "create_users".to_string()))
        );
        assert_eq!(parse_migration_name("12"), Some((12, String::new())));
        assert_eq!(
            parse_migration_name("7_add_index.up.sql"),
            Some((7, "add_index".to_string()))
        );
    }

    #[test]
    fn test_parse_migration_name_invalid() {
        assert_eq!(parse_migration_name("_3_hidden"), None);
        assert_eq!(parse_migration_name("README.md"), None);
        assert_eq!(parse_migration_name("12abc"), None);
        assert_eq!(parse_migration_name("0_zero"), None);
        assert_eq!(parse_migration_name(""), None);
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("Add users table"), "add_users_table");
        assert_eq!(sanitize_name("  --Drop: old/index!! "), "drop_old_index");
        assert_eq!(sanitize_name("already_fine"), "already_fine");
    }

    #[test]
    fn test_dir_name_round_trips_through_parser() {
        let migration = Migration::new(42, "Add Users");
        assert_eq!(migration.dir_name(), "42_add_users");
        assert_eq!(
            parse_migration_name(&migration.dir_name()),
            Some((42, "add_users".to_string()))
        );
    }

    #[test]
    fn test_hidden_path() {
        let hidden = hidden_path(Path::new("migrations/frontend/2_add_users"));
        assert_eq!(hidden, PathBuf::from("migrations/frontend/_2_add_users"));
        assert_eq!(parse_migration_name("_2_add_users"), None);
    }

    #[test]
    fn test_metadata_parse() {
        let metadata = Metadata::parse(
            "name = \"add users\"\nparents = [1, 2]\nprivileged = true\n",
            Path::new("metadata.toml"),
        )
        .unwrap();
        assert_eq!(metadata.name, "add users");
        assert_eq!(metadata.parents, vec![1, 2]);
        assert!(metadata.privileged);
        assert!(!metadata.non_idempotent);
    }

    #[test]
    fn test_metadata_parse_error_names_file() {
        let err = Metadata::parse("parents = \"nope\"", Path::new("x/metadata.toml")).unwrap_err();
        assert!(err.to_string().contains("x/metadata.toml"));
    }

    #[test]
    fn test_metadata_render_skips_false_flags() {
        let metadata = Migration::new(3, "squashed").with_parents([2, 1]).metadata();
        let rendered = metadata.render(Path::new("metadata.toml")).unwrap();
        assert!(rendered.contains("parents = [1, 2]"));
        assert!(!rendered.contains("privileged"));
    }
}
