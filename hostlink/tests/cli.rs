//! CLI tests: spawn `hostlink` against the reference test host and check exit codes.

use std::path::Path;
use std::process::{Command, Output};

use hostlink::exit_codes;
use hostlink::io::config::{HostlinkConfig, TestHostConfig, load_config, write_config};
use hostlink::test_support::{scratch_dir, write_test_source};

fn write_reference_config(dir: &Path) {
    let cfg = HostlinkConfig {
        connection_timeout_secs: 30,
        testhost: TestHostConfig {
            command: vec![env!("CARGO_BIN_EXE_hostlink-testhost").to_string()],
            ..TestHostConfig::default()
        },
        ..HostlinkConfig::default()
    };
    write_config(&dir.join("hostlink.toml"), &cfg).expect("write config");
}

fn hostlink(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_hostlink"))
        .current_dir(dir)
        .args(args)
        .output()
        .expect("run hostlink")
}

#[test]
fn init_writes_default_config() {
    let temp = scratch_dir();
    let output = hostlink(temp.path(), &["init"]);

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let cfg = load_config(&temp.path().join("hostlink.toml")).expect("load");
    assert_eq!(cfg, HostlinkConfig::default());
}

#[test]
fn discover_lists_tests() {
    let temp = scratch_dir();
    write_reference_config(temp.path());
    write_test_source(temp.path(), "a.tests", &["Suite.one", "Suite.two"]);

    let output = hostlink(temp.path(), &["discover", "a.tests"]);

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Suite.one"));
    assert!(stdout.contains("2 test(s) found"));
}

#[test]
fn run_with_failure_exits_with_tests_failed() {
    let temp = scratch_dir();
    write_reference_config(temp.path());
    write_test_source(temp.path(), "a.tests", &["Suite.one", "!Suite.two"]);

    let output = hostlink(temp.path(), &["run", "a.tests"]);

    assert_eq!(output.status.code(), Some(exit_codes::TESTS_FAILED));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("2 executed, 1 passed, 1 failed"));
}

#[test]
fn crashing_host_exits_with_aborted() {
    let temp = scratch_dir();
    write_reference_config(temp.path());
    write_test_source(temp.path(), "a.tests", &["Suite.one", "crash: segfault in adapter"]);

    let output = hostlink(temp.path(), &["run", "a.tests"]);

    assert_eq!(output.status.code(), Some(exit_codes::ABORTED));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("segfault in adapter"));
}

#[test]
fn missing_source_is_invalid() {
    let temp = scratch_dir();
    write_reference_config(temp.path());

    let output = hostlink(temp.path(), &["run", "missing.tests"]);

    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
}
