//! Shared E2E test helpers for `lume-serve` binary tests.

use assert_cmd::cargo::cargo_bin_cmd;
use std::time::Duration;

/// Default timeout for a single CLI run.
pub const TIMEOUT_BASIC: Duration = Duration::from_secs(20);

/// Environment variables that would change the resolved configuration.
const CONFIG_VARS: &[&str] = &[
    "LUME_CONFIG",
    "LUME_PROTOCOLS",
    "LUME_COALESCE_WINDOW_MS",
    "LUME_SHUTDOWN_TIMEOUT_MS",
    "LUME_RESTART_LISTENERS",
    "EPICS_CA_SERVER_PORT",
    "EPICS_PVA_SERVER_PORT",
    "RUST_LOG",
];

/// Build a Command for the `lume-serve` binary with a clean environment.
pub fn lume_cmd() -> assert_cmd::Command {
    let mut cmd: assert_cmd::Command = cargo_bin_cmd!("lume-serve");
    cmd.timeout(TIMEOUT_BASIC);
    for var in CONFIG_VARS {
        cmd.env_remove(var);
    }
    cmd
}

/// Writes `content` to `server.toml` in a fresh temp directory.
///
/// Returns (path, _guard); keep the guard alive for the test's duration.
pub fn config_file(content: &str) -> (std::path::PathBuf, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("create temp dir for config");
    let path = tmp.path().join("server.toml");
    std::fs::write(&path, content).expect("write config");
    (path, tmp)
}
