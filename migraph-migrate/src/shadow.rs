//! Disposable databases for replaying migrations.
//!
//! A shadow database lives for exactly one squash: it is provisioned empty,
//! migrated up to the squash root, dumped, and torn down again.
//!
//! # Example
//!
//! ```rust,ignore
//! use migraph_migrate::shadow::{DatabaseProvisioner, DockerProvisioner, ShadowConfig};
//!
//! let provisioner = DockerProvisioner::new(ShadowConfig::default());
//! let mut shadow = provisioner.provision(&cancel).await?;
//! // ... migrate and dump `shadow.url()` ...
//! provisioner.teardown(&mut shadow, &cancel).await?;
//! ```

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use url::Url;

use crate::command;
use crate::error::{MigrateResult, MigrationError};

/// Default image for containerized shadow databases.
pub const DEFAULT_IMAGE: &str = "postgres:12-alpine";

/// Configuration for shadow database provisioning.
#[derive(Debug, Clone)]
pub struct ShadowConfig {
    /// Prefix for shadow database names.
    pub prefix: String,
    /// Container image (Docker provisioning).
    pub image: String,
    /// Administrative connection URL (local provisioning).
    pub admin_url: String,
    /// Superuser password set on containers.
    pub password: String,
    /// How many readiness probes to run before giving up.
    pub ready_attempts: u32,
    /// Wait between readiness probes.
    pub ready_backoff: Duration,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            prefix: "migraph_squash_".to_string(),
            image: DEFAULT_IMAGE.to_string(),
            admin_url: "postgres://postgres@localhost:5432/postgres".to_string(),
            password: "migraph".to_string(),
            ready_attempts: 30,
            ready_backoff: Duration::from_millis(500),
        }
    }
}

impl ShadowConfig {
    /// Set the container image.
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    /// Set the administrative URL used by local provisioning.
    pub fn with_admin_url(mut self, url: impl Into<String>) -> Self {
        self.admin_url = url.into();
        self
    }

    /// Set readiness polling.
    pub fn with_readiness(mut self, attempts: u32, backoff: Duration) -> Self {
        self.ready_attempts = attempts.max(1);
        self.ready_backoff = backoff;
        self
    }

    /// Generate a unique shadow database name.
    pub fn generate_name(&self) -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        format!("{}{}", self.prefix, &id[..12])
    }

    /// Connection URL for `db_name` on the server behind `base_url`.
    pub fn shadow_url(base_url: &str, db_name: &str) -> MigrateResult<String> {
        let mut url = Url::parse(base_url).map_err(|e| {
            MigrationError::shadow_database(format!("invalid database URL '{}': {}", base_url, e))
        })?;
        url.set_path(db_name);
        Ok(url.to_string())
    }
}

/// Current state of a shadow database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowState {
    /// Exists and accepts connections.
    Ready,
    /// Has been torn down.
    Dropped,
}

/// A provisioned shadow database.
#[derive(Debug)]
pub struct ShadowDatabase {
    name: String,
    url: String,
    container: Option<String>,
    state: ShadowState,
}

impl ShadowDatabase {
    /// Describe an already-running database.
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            container: None,
            state: ShadowState::Ready,
        }
    }

    /// Mark the database as living inside a container.
    pub fn in_container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    /// Database name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connection URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Container hosting the database, if any.
    pub fn container(&self) -> Option<&str> {
        self.container.as_deref()
    }

    /// Current state.
    pub fn state(&self) -> ShadowState {
        self.state
    }

    /// Record that the database is gone.
    pub fn mark_dropped(&mut self) {
        self.state = ShadowState::Dropped;
    }

    /// Program and leading arguments for running a Postgres client tool
    /// against this database: inside the container when there is one.
    pub fn client_command(&self, tool: &str) -> (String, Vec<String>) {
        match &self.container {
            Some(container) => (
                "docker".to_string(),
                vec![
                    "exec".to_string(),
                    container.clone(),
                    tool.to_string(),
                    "-U".to_string(),
                    "postgres".to_string(),
                    "-d".to_string(),
                    self.name.clone(),
                ],
            ),
            None => (tool.to_string(), vec![format!("--dbname={}", self.url)]),
        }
    }
}

impl Drop for ShadowDatabase {
    fn drop(&mut self) {
        if self.state == ShadowState::Ready {
            tracing::warn!(
                "Shadow database '{}' was not torn down. Consider calling teardown() explicitly.",
                self.name
            );
        }
    }
}

/// Starts and stops shadow databases.
#[async_trait::async_trait]
pub trait DatabaseProvisioner: Send + Sync {
    /// Start an empty database and wait until it accepts connections.
    async fn provision(&self, cancel: &CancellationToken) -> MigrateResult<ShadowDatabase>;

    /// Destroy the database. Calling this twice is harmless.
    async fn teardown(
        &self,
        database: &mut ShadowDatabase,
        cancel: &CancellationToken,
    ) -> MigrateResult<()>;
}

/// Runs each shadow database in its own throwaway container.
#[derive(Debug, Clone, Default)]
pub struct DockerProvisioner {
    config: ShadowConfig,
}

impl DockerProvisioner {
    /// Create a provisioner.
    pub fn new(config: ShadowConfig) -> Self {
        Self { config }
    }

    async fn published_port(&self, name: &str, cancel: &CancellationToken) -> MigrateResult<u16> {
        let output = command::run("docker", &["port", name, "5432/tcp"], &[], cancel).await?;
        parse_published_port(&output.stdout).ok_or_else(|| {
            MigrationError::shadow_database(format!(
                "could not read published port of container {}: {:?}",
                name, output.stdout
            ))
        })
    }

    async fn start(&self, name: &str, cancel: &CancellationToken) -> MigrateResult<ShadowDatabase> {
        let password = format!("POSTGRES_PASSWORD={}", self.config.password);
        let db = format!("POSTGRES_DB={}", name);
        command::run(
            "docker",
            &[
                "run",
                "--detach",
                "--rm",
                "--publish",
                "127.0.0.1::5432",
                "--name",
                name,
                "-e",
                password.as_str(),
                "-e",
                db.as_str(),
                self.config.image.as_str(),
            ],
            &[],
            cancel,
        )
        .await
        .map_err(|e| MigrationError::shadow_database(format!("failed to start container: {}", e)))?;

        // The container is running from here on and must not leak.
        let port = match self.published_port(name, cancel).await {
            Ok(port) => port,
            Err(e) => {
                let _ = command::run("docker", &["rm", "--force", name], &[], cancel).await;
                return Err(e);
            }
        };
        let url = format!(
            "postgres://postgres:{}@127.0.0.1:{}/{}?sslmode=disable",
            self.config.password, port, name
        );
        Ok(ShadowDatabase::new(name, url).in_container(name))
    }
}

#[async_trait::async_trait]
impl DatabaseProvisioner for DockerProvisioner {
    async fn provision(&self, cancel: &CancellationToken) -> MigrateResult<ShadowDatabase> {
        let name = self.config.generate_name();
        tracing::info!(image = %self.config.image, name = %name, "Starting shadow database container");

        let mut database = self.start(&name, cancel).await?;
        let (program, args) = database.client_command("pg_isready");
        if let Err(e) = wait_until_ready(&program, &args, &self.config, cancel).await {
            let _ = self.teardown(&mut database, cancel).await;
            return Err(e);
        }
        Ok(database)
    }

    async fn teardown(
        &self,
        database: &mut ShadowDatabase,
        cancel: &CancellationToken,
    ) -> MigrateResult<()> {
        if database.state() == ShadowState::Dropped {
            return Ok(());
        }
        if let Some(container) = database.container().map(str::to_string) {
            tracing::info!(container = %container, "Removing shadow database container");
            command::run("docker", &["rm", "--force", container.as_str()], &[], cancel).await?;
        }
        database.mark_dropped();
        Ok(())
    }
}

/// Creates a scratch database on an existing server through `psql`.
#[derive(Debug, Clone, Default)]
pub struct LocalProvisioner {
    config: ShadowConfig,
}

impl LocalProvisioner {
    /// Create a provisioner.
    pub fn new(config: ShadowConfig) -> Self {
        Self { config }
    }

    async fn admin(&self, sql: &str, cancel: &CancellationToken) -> MigrateResult<()> {
        let dbname = format!("--dbname={}", self.config.admin_url);
        command::run(
            "psql",
            &[dbname.as_str(), "--no-psqlrc", "--quiet", "--command", sql],
            &[],
            cancel,
        )
        .await
        .map(|_| ())
        .map_err(|e| MigrationError::shadow_database(e.to_string()))
    }
}

#[async_trait::async_trait]
impl DatabaseProvisioner for LocalProvisioner {
    async fn provision(&self, cancel: &CancellationToken) -> MigrateResult<ShadowDatabase> {
        let name = self.config.generate_name();
        let url = ShadowConfig::shadow_url(&self.config.admin_url, &name)?;
        tracing::info!(name = %name, "Creating local shadow database");

        self.admin(&create_sql(&name), cancel).await?;
        let mut database = ShadowDatabase::new(name, url);

        let (program, args) = database.client_command("pg_isready");
        if let Err(e) = wait_until_ready(&program, &args, &self.config, cancel).await {
            let _ = self.teardown(&mut database, cancel).await;
            return Err(e);
        }
        Ok(database)
    }

    async fn teardown(
        &self,
        database: &mut ShadowDatabase,
        cancel: &CancellationToken,
    ) -> MigrateResult<()> {
        if database.state() == ShadowState::Dropped {
            return Ok(());
        }
        tracing::info!(name = %database.name(), "Dropping local shadow database");
        self.admin(&drop_sql(database.name()), cancel).await?;
        database.mark_dropped();
        Ok(())
    }
}

/// Probe until `program args` succeeds, retrying with a fixed backoff.
///
/// Only checks that ran and failed are retried; a check that cannot start
/// fails immediately.
async fn wait_until_ready(
    program: &str,
    args: &[String],
    config: &ShadowConfig,
    cancel: &CancellationToken,
) -> MigrateResult<()> {
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    let mut last_error = None;

    for attempt in 1..=config.ready_attempts {
        match command::run(program, &args, &[], cancel).await {
            Ok(_) => {
                tracing::debug!(attempt, "Shadow database is ready");
                return Ok(());
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!(attempt, error = %e, "Shadow database not ready yet");
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(MigrationError::Cancelled),
            _ = tokio::time::sleep(config.ready_backoff) => {}
        }
    }

    Err(MigrationError::shadow_database(format!(
        "database did not accept connections after {} attempts: {}",
        config.ready_attempts,
        last_error.map(|e| e.to_string()).unwrap_or_default()
    )))
}

/// Parse `docker port` output such as `127.0.0.1:49153`.
fn parse_published_port(output: &str) -> Option<u16> {
    output
        .lines()
        .filter_map(|line| line.trim().rsplit(':').next())
        .find_map(|port| port.parse().ok())
}

/// SQL creating a shadow database.
pub fn create_sql(name: &str) -> String {
    format!(
        "CREATE DATABASE {} WITH TEMPLATE template0 ENCODING 'UTF8'",
        quote_identifier(name)
    )
}

/// SQL dropping a shadow database.
pub fn drop_sql(name: &str) -> String {
    format!("DROP DATABASE IF EXISTS {}", quote_identifier(name))
}

/// Quote a PostgreSQL identifier.
fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_name_is_unique() {
        let config = ShadowConfig::default();
        let a = config.generate_name();
        let b = config.generate_name();
        assert!(a.starts_with("migraph_squash_"));
        assert_eq!(a.len(), "migraph_squash_".len() + 12);
        assert_ne!(a, b);
    }

    #[test]
    fn test_shadow_url_replaces_database() {
        let url =
            ShadowConfig::shadow_url("postgres://sg:pw@localhost:5432/sg?sslmode=disable", "scratch")
                .unwrap();
        assert_eq!(url, "postgres://sg:pw@localhost:5432/scratch?sslmode=disable");

        assert!(ShadowConfig::shadow_url("not a url", "scratch").is_err());
    }

    #[test]
    fn test_sql_quotes_identifiers() {
        assert_eq!(
            create_sql("shadow"),
            "CREATE DATABASE \"shadow\" WITH TEMPLATE template0 ENCODING 'UTF8'"
        );
        assert_eq!(drop_sql("a\"b"), "DROP DATABASE IF EXISTS \"a\"\"b\"");
    }

    #[test]
    fn test_parse_published_port() {
        assert_eq!(parse_published_port("127.0.0.1:49153\n"), Some(49153));
        assert_eq!(parse_published_port("0.0.0.0:5433\n[::]:5433\n"), Some(5433));
        assert_eq!(parse_published_port(""), None);
    }

    #[test]
    fn test_client_command() {
        let mut local = ShadowDatabase::new("scratch", "postgres://localhost/scratch");
        let (program, args) = local.client_command("pg_dump");
        assert_eq!(program, "pg_dump");
        assert_eq!(args, vec!["--dbname=postgres://localhost/scratch"]);
        local.mark_dropped();

        let mut contained = ShadowDatabase::new("scratch", "postgres://localhost/scratch")
            .in_container("box");
        let (program, args) = contained.client_command("pg_dump");
        assert_eq!(program, "docker");
        assert_eq!(
            args,
            vec!["exec", "box", "pg_dump", "-U", "postgres", "-d", "scratch"]
        );
        contained.mark_dropped();
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let provisioner = DockerProvisioner::default();
        let cancel = CancellationToken::new();
        let mut database = ShadowDatabase::new("scratch", "postgres://localhost/scratch");
        database.mark_dropped();
        provisioner.teardown(&mut database, &cancel).await.unwrap();
        assert_eq!(database.state(), ShadowState::Dropped);
    }

    #[tokio::test]
    async fn test_missing_readiness_binary_fails_without_retrying() {
        let config = ShadowConfig::default().with_readiness(5, Duration::from_secs(30));
        let cancel = CancellationToken::new();
        let started = std::time::Instant::now();
        let err = wait_until_ready("migraph-no-such-program", &[], &config, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::Spawn { .. }));
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_wait_until_ready_gives_up() {
        let config = ShadowConfig::default().with_readiness(2, Duration::from_millis(1));
        let cancel = CancellationToken::new();
        let err = wait_until_ready("false", &[], &config, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::ShadowDatabaseError(_)));
        assert!(err.to_string().contains("2 attempts"));
    }
}
