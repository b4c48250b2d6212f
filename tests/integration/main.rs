//! Integration tests for previewd

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use tempfile::TempDir;

    fn previewd() -> Command {
        cargo_bin_cmd!("previewd")
    }

    #[test]
    fn help_displays() {
        previewd()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("On-demand preview environments"));
    }

    #[test]
    fn version_displays() {
        previewd()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("previewd"));
    }

    #[test]
    fn config_path_honors_flag() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("custom.toml");
        previewd()
            .arg("--config")
            .arg(&path)
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("custom.toml"));
    }

    #[test]
    fn config_show_prints_defaults() {
        let dir = TempDir::new().unwrap();
        previewd()
            .arg("--config")
            .arg(dir.path().join("missing.toml"))
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[server]"))
            .stdout(predicate::str::contains("production"));
    }

    #[test]
    fn config_init_writes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        previewd()
            .arg("--config")
            .arg(&path)
            .args(["config", "init"])
            .assert()
            .success();
        assert!(path.exists());

        previewd()
            .arg("--config")
            .arg(&path)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[repo]"));
    }

    #[test]
    fn invalid_config_fails_with_message() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "environments = []\n").unwrap();
        previewd()
            .arg("--config")
            .arg(&path)
            .args(["config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Error:"));
    }

    #[test]
    fn status_runs() {
        // Runtime or git may be missing; the command must still not panic
        let dir = TempDir::new().unwrap();
        let _ = previewd()
            .arg("--config")
            .arg(dir.path().join("missing.toml"))
            .arg("status")
            .assert();
    }

    #[test]
    fn unknown_subcommand_fails() {
        previewd().arg("frobnicate").assert().failure();
    }
}
