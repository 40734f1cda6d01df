//! Version control access.

use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;

use crate::command;
use crate::error::{MigrateResult, MigrationError};

/// Read-only access to historical trees.
#[async_trait::async_trait]
pub trait VersionControl: Send + Sync {
    /// Paths of every file under `path` at `revision`, relative to the repository root.
    async fn list_files_at(
        &self,
        revision: &str,
        path: &Path,
        cancel: &CancellationToken,
    ) -> MigrateResult<Vec<String>>;

    /// Paths under `path` that differ between two revisions.
    async fn diff_names(
        &self,
        revision_a: &str,
        revision_b: &str,
        path: &Path,
        cancel: &CancellationToken,
    ) -> MigrateResult<Vec<String>>;

    /// The repository root that listed paths are relative to.
    fn root(&self) -> &Path;
}

/// [`VersionControl`] backed by the `git` binary.
#[derive(Debug, Clone)]
pub struct Git {
    root: PathBuf,
}

impl Git {
    /// Create an accessor for the repository at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn git(&self, args: &[&str], cancel: &CancellationToken) -> MigrateResult<String> {
        let root = self.root.display().to_string();
        let mut full = vec!["-C", root.as_str()];
        full.extend_from_slice(args);

        command::run("git", &full, &[], cancel)
            .await
            .map(|output| output.stdout)
            .map_err(|e| match e {
                MigrationError::Command { message, .. } => {
                    MigrationError::vcs(format!("git {}: {}", args.join(" "), message))
                }
                other => other,
            })
    }
}

#[async_trait::async_trait]
impl VersionControl for Git {
    async fn list_files_at(
        &self,
        revision: &str,
        path: &Path,
        cancel: &CancellationToken,
    ) -> MigrateResult<Vec<String>> {
        let path = path.display().to_string();
        let stdout = self
            .git(
                &["ls-tree", "-r", "--name-only", revision, "--", path.as_str()],
                cancel,
            )
            .await?;
        Ok(non_empty_lines(&stdout))
    }

    async fn diff_names(
        &self,
        revision_a: &str,
        revision_b: &str,
        path: &Path,
        cancel: &CancellationToken,
    ) -> MigrateResult<Vec<String>> {
        let path = path.display().to_string();
        let stdout = self
            .git(
                &["diff", "--name-only", revision_a, revision_b, "--", path.as_str()],
                cancel,
            )
            .await?;
        Ok(non_empty_lines(&stdout))
    }

    fn root(&self) -> &Path {
        &self.root
    }
}

fn non_empty_lines(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_empty_lines() {
        let lines = non_empty_lines("migrations/a/1_x/up.sql\n\n  migrations/a/2_y/up.sql  \n");
        assert_eq!(
            lines,
            vec!["migrations/a/1_x/up.sql", "migrations/a/2_y/up.sql"]
        );
    }

    #[tokio::test]
    async fn test_git_outside_repository_is_vcs_error() {
        let dir = tempfile::tempdir().unwrap();
        let git = Git::new(dir.path());
        let cancel = CancellationToken::new();
        let result = git
            .list_files_at("HEAD", Path::new("migrations"), &cancel)
            .await;
        // Either git is missing or the directory is not a repository.
        assert!(matches!(
            result,
            Err(MigrationError::Vcs(_)) | Err(MigrationError::Spawn { .. })
        ));
    }
}
