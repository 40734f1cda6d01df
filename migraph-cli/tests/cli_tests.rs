//! Integration tests for the migraph CLI

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Get the migraph binary
#[allow(deprecated)]
fn migraph_cmd() -> Command {
    let mut cmd = Command::cargo_bin("migraph").unwrap();
    cmd.env_remove("MIGRAPH_DATABASE_URL");
    cmd
}

#[test]
fn test_help_command() {
    migraph_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("dependency-graph tooling"))
        .stdout(predicate::str::contains("Usage: migraph"))
        .stdout(predicate::str::contains("migration"))
        .stdout(predicate::str::contains("version"));
}

#[test]
fn test_version_command() {
    migraph_cmd()
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains("Version"))
        .stdout(predicate::str::contains("0.1.0"));
}

#[test]
fn test_migration_help() {
    migraph_cmd()
        .args(["migration", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("add"))
        .stdout(predicate::str::contains("up"))
        .stdout(predicate::str::contains("down"))
        .stdout(predicate::str::contains("squash"))
        .stdout(predicate::str::contains("fixup"))
        .stdout(predicate::str::contains("leaves"));
}

#[test]
fn test_fixup_help() {
    migraph_cmd()
        .args(["migration", "fixup", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--main"))
        .stdout(predicate::str::contains("--run"))
        .stdout(predicate::str::contains("--dry-run"));
}

#[test]
fn test_add_creates_migration_directories() {
    let temp_dir = TempDir::new().unwrap();

    migraph_cmd()
        .current_dir(temp_dir.path())
        .args(["migration", "add", "create users"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1_create_users"));

    let first = temp_dir.path().join("migrations/frontend/1_create_users");
    assert!(first.join("up.sql").exists());
    assert!(first.join("down.sql").exists());
    assert!(first.join("metadata.toml").exists());

    migraph_cmd()
        .current_dir(temp_dir.path())
        .args(["migration", "add", "--db", "codeintel", "Add Index"])
        .assert()
        .success();
    assert!(
        temp_dir
            .path()
            .join("migrations/codeintel/1_add_index")
            .exists()
    );

    migraph_cmd()
        .current_dir(temp_dir.path())
        .args(["migration", "add", "add teams"])
        .assert()
        .success();

    let metadata =
        fs::read_to_string(temp_dir.path().join("migrations/frontend/2_add_teams/metadata.toml"))
            .unwrap();
    assert!(metadata.contains("parents = [1]"));
    assert!(metadata.contains("add teams"));
}

#[test]
fn test_leaves_reports_dominator() {
    let temp_dir = TempDir::new().unwrap();

    for name in ["init", "users"] {
        migraph_cmd()
            .current_dir(temp_dir.path())
            .args(["migration", "add", name])
            .assert()
            .success();
    }

    migraph_cmd()
        .current_dir(temp_dir.path())
        .args(["migration", "leaves"])
        .assert()
        .success()
        .stdout(predicate::str::contains("2_users"))
        .stdout(predicate::str::contains("Dominator"));
}

#[test]
fn test_leaves_without_migrations() {
    let temp_dir = TempDir::new().unwrap();

    migraph_cmd()
        .current_dir(temp_dir.path())
        .args(["migration", "leaves", "--db", "codeinsights"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No migrations defined"));
}

#[test]
fn test_unknown_database_lists_names() {
    let temp_dir = TempDir::new().unwrap();

    migraph_cmd()
        .current_dir(temp_dir.path())
        .args(["migration", "leaves", "--db", "nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown database 'nope'"))
        .stderr(predicate::str::contains("frontend, codeintel, codeinsights"));
}

#[test]
fn test_config_file_defines_schemas() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(
        temp_dir.path().join("migraph.toml"),
        r#"
[[schemas]]
name = "app"
directory = "db/app"
"#,
    )
    .unwrap();

    migraph_cmd()
        .current_dir(temp_dir.path())
        .args(["migration", "add", "--db", "app", "init"])
        .assert()
        .success();
    assert!(temp_dir.path().join("db/app/1_init/up.sql").exists());

    migraph_cmd()
        .current_dir(temp_dir.path())
        .args(["migration", "add", "init"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("expected one of: app"));
}

#[test]
fn test_invalid_config_fails() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(temp_dir.path().join("migraph.toml"), "schemas = 3").unwrap();

    migraph_cmd()
        .current_dir(temp_dir.path())
        .args(["migration", "leaves"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Configuration error"));
}

#[test]
fn test_squash_rejects_invalid_release() {
    let temp_dir = TempDir::new().unwrap();

    migraph_cmd()
        .current_dir(temp_dir.path())
        .args(["migration", "squash", "latest"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid release 'latest'"));

    migraph_cmd()
        .current_dir(temp_dir.path())
        .args(["migration", "squash", "v5.1.0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid release"));
}

#[test]
fn test_up_without_database_url_fails() {
    let temp_dir = TempDir::new().unwrap();

    migraph_cmd()
        .current_dir(temp_dir.path())
        .args(["migration", "up"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no database URL"));
}

#[test]
fn test_fixup_outside_repository_fails() {
    let temp_dir = TempDir::new().unwrap();

    migraph_cmd()
        .current_dir(temp_dir.path())
        .args([
            "migration",
            "fixup",
            "--run=false",
            "--db",
            "frontend",
            "--main",
            "migraph-no-such-branch",
        ])
        .assert()
        .failure();
}

#[test]
fn test_invalid_command() {
    migraph_cmd()
        .arg("invalid_command")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}

#[test]
fn test_global_options() {
    migraph_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("0.1.0"));
}
