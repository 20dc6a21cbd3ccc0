use assert_cmd::Command;
use predicates::str::contains;

fn server() -> Command {
    Command::cargo_bin("rexec-server").unwrap()
}

fn empty_config() -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "").unwrap();
    (dir, path)
}

#[test]
fn help_lists_options() {
    server()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("--pool-size"))
        .stdout(contains("--tokens"));
}

#[test]
fn missing_explicit_config_fails() {
    server()
        .args(["--config", "/nonexistent/rexec/config.toml"])
        .assert()
        .failure()
        .stderr(contains("failed to read config"));
}

#[test]
fn zero_pool_size_is_rejected() {
    let (_dir, config) = empty_config();
    server()
        .arg("--config")
        .arg(&config)
        .args(["--pool-size", "0"])
        .assert()
        .failure()
        .stderr(contains("pool size must be at least 1"));
}

#[test]
fn missing_certificate_fails_before_listening() {
    let (dir, config) = empty_config();
    server()
        .arg("--config")
        .arg(&config)
        .arg("--cert")
        .arg(dir.path().join("absent.crt"))
        .arg("--key")
        .arg(dir.path().join("absent.key"))
        .args(["--listen", "127.0.0.1:0"])
        .assert()
        .failure()
        .stderr(contains("failed to read certificate"));
}
