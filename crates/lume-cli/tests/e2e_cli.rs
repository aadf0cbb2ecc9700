//! E2E integration tests for the `lume-serve` binary.
//!
//! Each test spawns the binary as a subprocess. Results go to stdout;
//! errors (anyhow) go to stderr.

mod common;

use common::{config_file, lume_cmd};
use predicates::prelude::PredicateBooleanExt;
use predicates::str::contains;

// ─── --check ───────────────────────────────────────────────────────

#[test]
fn check_prints_demo_pv_table() {
    lume_cmd()
        .arg("--check")
        .assert()
        .success()
        .stdout(contains("protocols: ca,pva"))
        .stdout(contains("test:input1"))
        .stdout(contains("test:output1"))
        .stdout(contains("image"))
        .stdout(contains("lume-serve v").not());
}

#[test]
fn check_json_lists_every_variable() {
    let output = lume_cmd()
        .args(["--check", "--json", "--prefix", "beam"])
        .output()
        .expect("run lume-serve");
    assert!(output.status.success());

    let doc: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout is JSON");
    let vars = doc["variables"].as_array().expect("variables array");
    assert_eq!(vars.len(), 5);
    assert!(vars
        .iter()
        .any(|v| v["pvname"] == "beam:output1" && v["protocol"] == "pva"));
    assert_eq!(doc["protocols"], serde_json::json!(["ca", "pva"]));
}

#[test]
fn json_without_check_is_a_usage_error() {
    lume_cmd().arg("--json").assert().failure();
}

#[test]
fn protocols_flag_overrides_settings() {
    lume_cmd()
        .args(["--check", "--protocols", "pva"])
        .assert()
        .success()
        .stdout(contains("protocols: pva"));
}

// ─── Configuration errors ──────────────────────────────────────────

#[test]
fn unparsable_config_fails() {
    let (path, _guard) = config_file("[epics\nprefix = ");
    lume_cmd()
        .arg("--config")
        .arg(&path)
        .arg("--check")
        .assert()
        .failure()
        .stderr(contains("config error"));
}

#[test]
fn binding_to_unknown_variable_fails() {
    let (path, _guard) = config_file(
        r#"
[epics.pvs.nonexistent]
protocol = "ca"
"#,
    );
    lume_cmd()
        .arg("--config")
        .arg(&path)
        .arg("--check")
        .assert()
        .failure()
        .stderr(contains("nonexistent"));
}

// ─── Serving ───────────────────────────────────────────────────────

#[test]
fn put_inputs_then_read_outputs() {
    lume_cmd()
        .args([
            "--seed", "7", "--put", "input1=10", "--put", "input2=20", "--get", "output2",
            "--get", "output3", "--get", "output1",
        ])
        .assert()
        .success()
        .stdout(contains("lume-serve v"))
        .stdout(contains("output2 = 10"))
        .stdout(contains("output3 = 20"))
        .stdout(contains("output1 = image[50, 50]"))
        .stdout(contains("server: stopped"))
        .stdout(contains("listener ca: stopped"))
        .stdout(contains("listener pva: stopped"));
}

#[test]
fn out_of_range_put_fails() {
    lume_cmd()
        .args(["--put", "input1=300"])
        .assert()
        .failure()
        .stderr(contains("rejected"))
        .stdout(contains("server: stopped"));
}

#[test]
fn run_for_stops_on_its_own() {
    lume_cmd()
        .args(["--run-for-ms", "50"])
        .assert()
        .success()
        .stdout(contains("evaluations: 1 (failed: 0"));
}

#[test]
fn log_file_receives_debug_events() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let log = tmp.path().join("logs").join("lume.log");
    lume_cmd()
        .arg("--log-file")
        .arg(&log)
        .args(["--put", "input1=3", "--get", "output2"])
        .assert()
        .success()
        .stdout(contains("output2 = 3"));

    let content = std::fs::read_to_string(&log).expect("log file written");
    assert!(content.contains("server started"), "log was: {content}");
    assert!(content.contains("server stopped"), "log was: {content}");
    assert!(!content.contains('\u{1b}'), "file log must not carry ANSI codes");
}
