//! CLI configuration handling.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use migraph_migrate::{DumpOptions, ShadowConfig};

use crate::error::{CliError, CliResult};

/// Default config file name (lives in project root)
pub const CONFIG_FILE_NAME: &str = "migraph.toml";

/// Default migrations root (relative to project root)
pub const MIGRATIONS_DIR: &str = "migrations";

/// Schemas described when no configuration file exists
pub const DEFAULT_SCHEMAS: [&str; 3] = ["frontend", "codeintel", "codeinsights"];

/// migraph configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Database configuration
    pub database: DatabaseConfig,

    /// Configured schemas
    pub schemas: Vec<SchemaConfig>,

    /// Squash configuration
    pub squash: SquashConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            schemas: DEFAULT_SCHEMAS.iter().map(|name| SchemaConfig::named(name)).collect(),
            squash: SquashConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> CliResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration, falling back to the defaults when the file is absent
    pub fn load_or_default(path: &Path) -> CliResult<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Look up a schema by name
    pub fn schema(&self, name: &str) -> CliResult<&SchemaConfig> {
        self.schemas.iter().find(|s| s.name == name).ok_or_else(|| {
            CliError::Validation(format!(
                "unknown database '{}', expected one of: {}",
                name,
                self.schema_names().join(", ")
            ))
        })
    }

    /// Names of all configured schemas
    pub fn schema_names(&self) -> Vec<&str> {
        self.schemas.iter().map(|s| s.name.as_str()).collect()
    }

    /// Connection URL for a schema: command line, then schema, then global
    pub fn database_url(&self, schema: &SchemaConfig, cli_url: Option<&str>) -> CliResult<String> {
        cli_url
            .map(str::to_string)
            .or_else(|| schema.url.clone())
            .or_else(|| self.database.url.clone())
            .ok_or_else(|| {
                CliError::Config(format!(
                    "no database URL for '{}'; set MIGRAPH_DATABASE_URL or [database] url",
                    schema.name
                ))
            })
    }
}

/// Database configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database connection URL
    pub url: Option<String>,
}

/// One schema's migrations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    /// Schema name used by `--db`
    pub name: String,

    /// Migrations directory (relative to project root)
    pub directory: PathBuf,

    /// Connection URL overriding `[database] url`
    pub url: Option<String>,

    /// Tables whose rows are kept when squashing
    pub data_tables: Vec<String>,

    /// Tables seeded with a single zero count when squashing
    pub count_tables: Vec<String>,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self::named("frontend")
    }
}

impl SchemaConfig {
    /// A schema in its conventional directory
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            directory: Path::new(MIGRATIONS_DIR).join(name),
            url: None,
            data_tables: Vec::new(),
            count_tables: Vec::new(),
        }
    }

    /// Dump options for squashing this schema
    pub fn dump_options(&self, skip_data: bool) -> DumpOptions {
        DumpOptions {
            data_tables: self.data_tables.clone(),
            count_tables: self.count_tables.clone(),
            skip_data,
            ..DumpOptions::default()
        }
    }
}

/// Squash configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SquashConfig {
    /// Docker image for the shadow database
    pub image: String,

    /// Minor releases that must stay downgradable
    pub distance: i64,

    /// Skip data tables by default
    pub skip_data: bool,

    /// Readiness probes before giving up
    pub ready_attempts: u32,

    /// Delay between readiness probes
    pub ready_backoff_ms: u64,

    /// Server used by `--local` squashes
    pub admin_url: Option<String>,
}

impl Default for SquashConfig {
    fn default() -> Self {
        let shadow = ShadowConfig::default();
        Self {
            image: shadow.image,
            distance: migraph_migrate::squash::DEFAULT_SQUASH_DISTANCE,
            skip_data: false,
            ready_attempts: shadow.ready_attempts,
            ready_backoff_ms: shadow.ready_backoff.as_millis() as u64,
            admin_url: None,
        }
    }
}

impl SquashConfig {
    /// Shadow database settings
    pub fn shadow_config(&self) -> ShadowConfig {
        let mut config = ShadowConfig::default()
            .with_image(&self.image)
            .with_readiness(self.ready_attempts, Duration::from_millis(self.ready_backoff_ms));
        if let Some(url) = &self.admin_url {
            config = config.with_admin_url(url);
        }
        config
    }
}
