// CLI integration tests over the local backend.
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};

use serde_json::Value;

fn cmd(base_dir: &Path) -> Command {
    let exe = env!("CARGO_BIN_EXE_dfspipe");
    let mut command = Command::new(exe);
    command.args(["--kind", "file", "--base-dir"]).arg(base_dir);
    command
}

fn parse_json(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).expect("valid json")
}

#[test]
fn produce_then_consume_flow() {
    let temp = tempfile::tempdir().expect("tempdir");

    let produce = cmd(temp.path())
        .args(["produce", "orders", "one", "two", "three"])
        .output()
        .expect("produce");
    assert!(produce.status.success(), "{}", String::from_utf8_lossy(&produce.stderr));
    let summary = parse_json(&produce.stdout);
    assert_eq!(summary["topic"], "orders");
    assert_eq!(summary["records"], 3);

    let consume = cmd(temp.path())
        .args(["consume", "orders", "--max", "3"])
        .output()
        .expect("consume");
    assert!(consume.status.success());
    assert_eq!(String::from_utf8_lossy(&consume.stdout), "one\ntwo\nthree\n");
}

#[test]
fn produce_reads_stdin_and_consume_emits_json() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut child = cmd(temp.path())
        .args(["produce", "logs"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .expect("spawn");
    child
        .stdin
        .take()
        .expect("stdin")
        .write_all(b"alpha\nbeta\n")
        .expect("write stdin");
    let output = child.wait_with_output().expect("wait");
    assert!(output.status.success());
    assert_eq!(parse_json(&output.stdout)["records"], 2);

    let consume = cmd(temp.path())
        .args(["consume", "logs", "--json", "--timeout-ms", "300"])
        .output()
        .expect("consume");
    assert!(consume.status.success());
    let lines: Vec<Value> = String::from_utf8_lossy(&consume.stdout)
        .lines()
        .map(|line| parse_json(line.as_bytes()))
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["payload"], "alpha");
    assert_eq!(lines[0]["offset"], 0);
    assert_eq!(lines[1]["payload"], "beta");
    assert_eq!(lines[1]["offset"], 6);
    assert!(lines[1]["file"].as_str().expect("file").ends_with(".rec"));
}

#[test]
fn resume_from_position_and_list() {
    let temp = tempfile::tempdir().expect("tempdir");
    let produce = cmd(temp.path())
        .args(["produce", "jobs", "a", "b"])
        .output()
        .expect("produce");
    assert!(produce.status.success());

    let ls = cmd(temp.path())
        .args(["ls", "jobs", "--json"])
        .output()
        .expect("ls");
    assert!(ls.status.success());
    let files = parse_json(&ls.stdout);
    let file = files[0].as_str().expect("file name").to_string();
    assert_eq!(files.as_array().expect("array").len(), 1);

    let consume = cmd(temp.path())
        .args(["consume", "jobs", "--from-file", &file, "--from-offset", "2", "--max", "1"])
        .output()
        .expect("consume");
    assert!(consume.status.success());
    assert_eq!(String::from_utf8_lossy(&consume.stdout), "b\n");
}

#[test]
fn usage_errors_are_json_with_exit_code() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = cmd(temp.path())
        .args(["produce", ".hidden", "x"])
        .output()
        .expect("produce");
    assert_eq!(output.status.code(), Some(2));
    let err = parse_json(&output.stderr);
    assert_eq!(err["error"]["kind"], "Usage");
    assert!(err["error"]["hint"].is_string());

    let output = cmd(temp.path())
        .args(["--config"])
        .arg(temp.path().join("missing.json"))
        .args(["ls", "t"])
        .output()
        .expect("ls");
    assert_eq!(output.status.code(), Some(3));
    assert_eq!(parse_json(&output.stderr)["error"]["kind"], "NotFound");
}

#[test]
fn consume_times_out_cleanly_on_empty_topic() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = cmd(temp.path())
        .args(["consume", "empty", "--timeout-ms", "100"])
        .output()
        .expect("consume");
    assert!(output.status.success());
    assert!(output.stdout.is_empty());
}
