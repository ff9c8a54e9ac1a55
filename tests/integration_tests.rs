//! Integration tests for the slipway CLI
//!
//! These cover the commands that need neither a container daemon nor the
//! cloud services: configuration, the metadata database and argument errors.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to create a slipway Command isolated in `dir`
fn slipway(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("slipway");
    cmd.current_dir(dir.path())
        .env_remove("SLIPWAY_CONFIG")
        .env_remove("SLIPWAY_AUTH_TOKEN")
        .env_remove("RUST_LOG")
        .env("XDG_CONFIG_HOME", dir.path().join("xdg"));
    cmd
}

/// Helper to write a slipway.toml whose database lives in `dir`
fn write_config(dir: &TempDir, extra: &str) {
    let content = format!(
        "[worker]\ndb_path = \"{}\"\nlog_dir = \"{}\"\n{}",
        dir.path().join("slipway.db").display(),
        dir.path().join("logs").display(),
        extra
    );
    fs::write(dir.path().join("slipway.toml"), content).unwrap();
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_slipway_help() {
        let dir = TempDir::new().unwrap();
        slipway(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("build-lp"))
            .stdout(predicate::str::contains("destroy"));
    }

    #[test]
    fn test_slipway_version() {
        let dir = TempDir::new().unwrap();
        slipway(&dir).arg("--version").assert().success();
    }

    #[test]
    fn test_run_requires_job() {
        let dir = TempDir::new().unwrap();
        slipway(&dir)
            .arg("run")
            .assert()
            .failure()
            .stderr(predicate::str::contains("--job"));
    }

    #[test]
    fn test_run_missing_job_file() {
        let dir = TempDir::new().unwrap();
        slipway(&dir)
            .args(["run", "--job", "nope.json"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to read job file"));
    }

    #[test]
    fn test_explicit_missing_config_is_error() {
        let dir = TempDir::new().unwrap();
        slipway(&dir)
            .args(["--config", "missing.toml", "db", "init"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Config file not found"));
    }
}

// =============================================================================
// Configuration Tests
// =============================================================================

mod configuration {
    use super::*;

    #[test]
    fn test_config_show_defaults() {
        let dir = TempDir::new().unwrap();
        slipway(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("using defaults"))
            .stdout(predicate::str::contains("[worker]"))
            .stdout(predicate::str::contains("clone_attempts = 5"));
    }

    #[test]
    fn test_config_init_creates_toml() {
        let dir = TempDir::new().unwrap();
        slipway(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created slipway.toml"));
        assert!(dir.path().join("slipway.toml").exists());

        slipway(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
    }

    #[test]
    fn test_config_validate_flags_missing_swift_url() {
        let dir = TempDir::new().unwrap();
        slipway(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("storage.swift.url"));
    }

    #[test]
    fn test_config_validate_clean_config() {
        let dir = TempDir::new().unwrap();
        write_config(
            &dir,
            "[storage.swift]\nurl = \"http://swift.local/v1/AUTH_t\"\ntemp_url_key = \"k\"\n",
        );
        slipway(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid."));
    }

    #[test]
    fn test_config_show_redacts_tokens() {
        let dir = TempDir::new().unwrap();
        write_config(
            &dir,
            "[deployer]\nflavor = \"m1.large\"\nauth_token = \"hunter2\"\n",
        );
        slipway(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("m1.large"))
            .stdout(predicate::str::contains("hunter2").not());
    }
}

// =============================================================================
// Metadata Database Tests
// =============================================================================

mod database {
    use super::*;

    #[test]
    fn test_db_init_creates_file() {
        let dir = TempDir::new().unwrap();
        write_config(&dir, "");
        slipway(&dir)
            .args(["db", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Database ready"));
        assert!(dir.path().join("slipway.db").exists());
    }

    #[test]
    fn test_add_and_show_assembly() {
        let dir = TempDir::new().unwrap();
        write_config(&dir, "");
        slipway(&dir)
            .args([
                "db",
                "add-assembly",
                "--name",
                "web",
                "--plan-id",
                "7",
                "--workflow",
                "build,deploy",
            ])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"status\": \"QUEUED\""));

        slipway(&dir)
            .args(["db", "show-assembly", "1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"name\": \"web\""))
            .stdout(predicate::str::contains("\"plan_id\": 7"))
            .stdout(predicate::str::contains("\"components\": []"));
    }

    #[test]
    fn test_add_assembly_rejects_bad_workflow() {
        let dir = TempDir::new().unwrap();
        write_config(&dir, "");
        slipway(&dir)
            .args([
                "db",
                "add-assembly",
                "--name",
                "web",
                "--plan-id",
                "1",
                "--workflow",
                "build,build",
            ])
            .assert()
            .failure()
            .stderr(predicate::str::contains("more than once"));
    }

    #[test]
    fn test_add_image_language_pack() {
        let dir = TempDir::new().unwrap();
        write_config(&dir, "");
        slipway(&dir)
            .args([
                "db",
                "add-image",
                "--name",
                "python",
                "--status",
                "READY",
                "--external-ref",
                "lp-python",
                "--docker-image-name",
                "lp-python",
            ])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"artifact_type\": \"language_pack\""))
            .stdout(predicate::str::contains("\"status\": \"READY\""));
    }

    #[test]
    fn test_show_missing_assembly() {
        let dir = TempDir::new().unwrap();
        write_config(&dir, "");
        slipway(&dir)
            .args(["db", "show-assembly", "42"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Assembly 42 not found"));
    }
}
