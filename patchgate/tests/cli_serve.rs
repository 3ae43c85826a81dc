//! CLI tests: spawn the `patchgate` binary and drive the line protocol.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Output, Stdio};

use serde_json::{Value, json};

use patchgate::exit_codes;

const ENV_KEYS: [&str; 10] = [
    "PATCHGATE_WORKSPACE",
    "PATCHGATE_RUN_ROOT",
    "PATCHGATE_MODEL",
    "PATCHGATE_RUN_TAG",
    "PATCHGATE_MAX_BYTES",
    "KANI_DOCKER_IMAGE",
    "KANI_TIMEOUT_SECS",
    "PATCHGATE_MAX_KANI_RUNS",
    "VSCODE_PID",
    "TERM_PROGRAM",
];

fn patchgate(dir: &Path, args: &[&str], stdin: &str) -> Output {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_patchgate"));
    cmd.current_dir(dir)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for key in ENV_KEYS {
        cmd.env_remove(key);
    }
    let mut child = cmd.spawn().expect("spawn patchgate");
    child
        .stdin
        .take()
        .expect("stdin")
        .write_all(stdin.as_bytes())
        .expect("write stdin");
    child.wait_with_output().expect("wait patchgate")
}

fn write_config(dir: &Path, sandbox: &Path, signal: &Path) {
    let config = format!(
        "sandbox_root = \"{}\"\n\
         runs_root = \"{}\"\n\
         model = \"cli-test\"\n\n\
         [signal]\n\
         mode = \"always\"\n\
         path = \"{}\"\n",
        sandbox.display(),
        dir.join("runs").display(),
        signal.display()
    );
    fs::write(dir.join("patchgate.toml"), config).expect("write config");
}

fn lines(output: &Output) -> Vec<Value> {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|l| serde_json::from_str(l).expect("json line"))
        .collect()
}

#[test]
fn serve_round_trip_with_approval_and_signal() {
    let temp = tempfile::tempdir().expect("tempdir");
    let sandbox = temp.path().join("ws");
    fs::create_dir(&sandbox).expect("sandbox");
    fs::write(sandbox.join("a.txt"), "one\n").expect("seed");
    let signal = temp.path().join("signal/ui.signal.json");
    write_config(temp.path(), &sandbox, &signal);

    let diff = "--- a/a.txt\n+++ b/a.txt\n@@ -1 +1 @@\n-one\n+two\n";
    let input = [
        json!({"type": "tool_call", "id": 1, "name": "list_dir", "arguments": {}}),
        json!({
            "type": "tool_call",
            "id": 2,
            "name": "propose_patch",
            "arguments": {"diff": diff}
        }),
        json!({"type": "approval", "token": "YES"}),
        json!({"type": "tool_call", "id": 3, "name": "launch_missiles", "arguments": {}}),
    ]
    .iter()
    .map(|v| format!("{v}\n"))
    .collect::<String>();

    let output = patchgate(temp.path(), &["serve", "--tag", "cli"], &input);
    assert_eq!(
        output.status.code(),
        Some(exit_codes::OK),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let out = lines(&output);
    assert_eq!(out.len(), 4);
    assert_eq!(out[0]["ok"], true);
    assert_eq!(out[1]["result"]["patch_id"], 1);
    assert_eq!(out[2]["result"]["outcome"], "applied");
    assert_eq!(out[3]["error"]["kind"], "unknown_tool");
    assert_eq!(fs::read_to_string(sandbox.join("a.txt")).expect("read"), "two\n");

    let event: Value =
        serde_json::from_str(&fs::read_to_string(&signal).expect("signal")).expect("signal json");
    assert_eq!(event["event"], "file_diff");
    assert_eq!(event["before"], "one\n");
    assert_eq!(event["after"], "two\n");

    let runs: Vec<_> = fs::read_dir(temp.path().join("runs"))
        .expect("runs")
        .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(runs.len(), 1);
    assert!(runs[0].starts_with("run-") && runs[0].ends_with("-cli"));
    let meta: Value = serde_json::from_str(
        &fs::read_to_string(temp.path().join("runs").join(&runs[0]).join("session.json"))
            .expect("meta"),
    )
    .expect("meta json");
    assert_eq!(meta["model"], "cli-test");
    assert!(meta["env"].as_object().is_some_and(|env| env.contains_key("PATCHGATE_WORKSPACE")));
}

#[test]
fn missing_sandbox_root_is_fatal() {
    let temp = tempfile::tempdir().expect("tempdir");
    let signal = temp.path().join("signal.json");
    write_config(temp.path(), &temp.path().join("does-not-exist"), &signal);

    let output = patchgate(temp.path(), &["serve"], "");
    assert_eq!(output.status.code(), Some(exit_codes::FATAL));
    assert!(String::from_utf8_lossy(&output.stderr).contains("does not exist"));
    assert!(output.stdout.is_empty());
}

#[test]
fn tools_prints_the_catalog() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = patchgate(temp.path(), &["tools"], "");
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let catalog: Vec<Value> = serde_json::from_slice(&output.stdout).expect("catalog json");
    let names: Vec<&str> = catalog.iter().filter_map(|t| t["name"].as_str()).collect();
    assert_eq!(
        names,
        ["read_file", "write_file", "list_dir", "propose_patch", "init_rust_crate", "run_kani"]
    );
}
