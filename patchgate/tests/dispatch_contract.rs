//! Tool-call contract: containment for every path-taking tool, new-file-only
//! writes, and verification outcomes that keep `fail` and `error` apart.

use std::fs;
use std::sync::Arc;

use serde_json::{Value, json};

use patchgate::core::verdict::{Verdict, VerdictStatus};
use patchgate::dispatch::Dispatcher;
use patchgate::error::ToolError;
use patchgate::io::config::FilesConfig;
use patchgate::io::verifier::VerifyRequest;
use patchgate::test_support::{
    RecordingSink, ScriptedVerifier, TestSandbox, create_diff, replace_diff,
};
use patchgate::tools::ToolCatalog;

fn dispatcher(
    sandbox: &TestSandbox,
    sink: Arc<RecordingSink>,
    verifier: &ScriptedVerifier,
) -> Dispatcher {
    Dispatcher::new(
        sandbox.engine(sink),
        ToolCatalog::load().expect("catalog"),
        FilesConfig::default(),
        Box::new(verifier.clone()),
        3,
    )
}

fn snapshot(sandbox: &TestSandbox) -> Vec<(String, Vec<u8>)> {
    let mut out = Vec::new();
    let mut stack = vec![sandbox.root().to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir).expect("read_dir") {
            let path = entry.expect("entry").path();
            let meta = fs::symlink_metadata(&path).expect("meta");
            if meta.is_dir() {
                stack.push(path.clone());
                out.push((path.display().to_string(), Vec::new()));
            } else if meta.is_file() {
                out.push((path.display().to_string(), fs::read(&path).expect("read")));
            }
        }
    }
    out.sort();
    out
}

fn kind(result: Result<Value, ToolError>) -> &'static str {
    result.expect_err("expected tool error").kind()
}

#[test]
fn escaping_paths_are_rejected_by_every_tool_without_side_effects() {
    let sandbox = TestSandbox::new();
    sandbox.write("src/lib.rs", "fn a() {}\n");
    let sink = Arc::new(RecordingSink::default());
    let verifier = ScriptedVerifier::default();
    let mut d = dispatcher(&sandbox, sink.clone(), &verifier);
    let before = snapshot(&sandbox);

    let calls = [
        ("write_file", json!({"path": "../evil.rs", "content": "x"})),
        ("write_file", json!({"path": "/tmp/evil.rs", "content": "x"})),
        ("read_file", json!({"path": "../../etc/passwd"})),
        ("list_dir", json!({"path": ".."})),
        (
            "propose_patch",
            json!({"diff": replace_diff("../src/lib.rs", "fn a() {}\n", "fn b() {}\n")}),
        ),
        (
            "propose_patch",
            json!({"diff": create_diff("../escaped.rs", "fn e() {}\n")}),
        ),
        ("init_rust_crate", json!({"project_dir": "../crate"})),
        ("run_kani", json!({"project_dir": "../crate"})),
    ];
    for (name, args) in calls {
        assert_eq!(kind(d.dispatch(name, args)), "containment_violation", "{name}");
    }

    assert_eq!(snapshot(&sandbox), before);
    assert!(sink.events().is_empty());
    assert!(d.engine().session().store().is_empty());
    assert!(verifier.requests().is_empty());
    assert!(!sandbox.root().parent().expect("parent").join("evil.rs").exists());
}

#[cfg(unix)]
#[test]
fn symlinks_out_of_the_sandbox_are_containment_violations() {
    let sandbox = TestSandbox::new();
    let outside = sandbox.outside();
    fs::write(outside.join("secret.rs"), "secret\n").expect("secret");
    std::os::unix::fs::symlink(&outside, sandbox.root().join("escape")).expect("symlink");
    let mut d = dispatcher(
        &sandbox,
        Arc::new(RecordingSink::default()),
        &ScriptedVerifier::default(),
    );

    assert_eq!(
        kind(d.dispatch("read_file", json!({"path": "escape/secret.rs"}))),
        "containment_violation"
    );
    assert_eq!(
        kind(d.dispatch("list_dir", json!({"path": "escape"}))),
        "containment_violation"
    );
    assert_eq!(
        kind(d.dispatch("write_file", json!({"path": "escape/new.rs", "content": "x"}))),
        "containment_violation"
    );
    assert_eq!(
        kind(d.dispatch(
            "propose_patch",
            json!({"diff": replace_diff("escape/secret.rs", "secret\n", "public\n")})
        )),
        "containment_violation"
    );
    assert!(!outside.join("new.rs").exists());
    assert_eq!(fs::read_to_string(outside.join("secret.rs")).expect("read"), "secret\n");
}

#[test]
fn write_file_creates_without_approval_but_never_overwrites() {
    let sandbox = TestSandbox::new();
    sandbox.write("existing.rs", "keep\n");
    let sink = Arc::new(RecordingSink::default());
    let mut d = dispatcher(&sandbox, sink.clone(), &ScriptedVerifier::default());

    let ok = d
        .dispatch("write_file", json!({"path": "src/fresh.rs", "content": "fn f() {}\n"}))
        .expect("write new");
    assert_eq!(ok["path"], "src/fresh.rs");
    assert_eq!(sandbox.read("src/fresh.rs"), "fn f() {}\n");

    assert_eq!(
        kind(d.dispatch("write_file", json!({"path": "existing.rs", "content": "clobber"}))),
        "file_exists"
    );
    assert_eq!(sandbox.read("existing.rs"), "keep\n");
    assert_eq!(sink.events().len(), 1);
    assert!(d.engine().pending().is_none());
}

#[test]
fn read_and_list_are_read_only() {
    let sandbox = TestSandbox::new();
    sandbox.write("src/lib.rs", "fn a() {}\n");
    let mut d = dispatcher(
        &sandbox,
        Arc::new(RecordingSink::default()),
        &ScriptedVerifier::default(),
    );
    let before = snapshot(&sandbox);

    let read = d.dispatch("read_file", json!({"path": "src/lib.rs"})).expect("read");
    assert_eq!(read["content"], "fn a() {}\n");
    assert_eq!(read["truncated"], false);
    let listing = d.dispatch("list_dir", json!({"path": "src"})).expect("list");
    assert_eq!(listing["entries"][0]["name"], "lib.rs");
    assert_eq!(listing["entries"][0]["kind"], "file");

    assert_eq!(snapshot(&sandbox), before);
}

#[test]
fn verification_fail_and_error_stay_distinct() {
    let sandbox = TestSandbox::new();
    sandbox.write("demo/Cargo.toml", "[package]\nname = \"demo\"\n");
    let fail = Verdict {
        status: VerdictStatus::Fail,
        diagnostics: "Check 1: add.assertion.1\n - Status: FAILURE".to_string(),
        exit_code: Some(1),
    };
    let timeout = Verdict::error("checker timed out after 300s; result undetermined", None);
    let verifier = ScriptedVerifier::new([fail, timeout]);
    let mut d = dispatcher(&sandbox, Arc::new(RecordingSink::default()), &verifier);

    let err = d
        .dispatch("run_kani", json!({"project_dir": "demo", "harness": "check_add"}))
        .unwrap_err();
    assert_eq!(err.kind(), "verification_failure");
    let payload = serde_json::to_value(err.to_payload()).expect("payload");
    assert_eq!(payload["verdict"]["status"], "fail");
    assert!(payload["verdict"]["diagnostics"].as_str().is_some_and(|t| t.contains("FAILURE")));

    let err = d.dispatch("run_kani", json!({"project_dir": "demo"})).unwrap_err();
    assert_eq!(err.kind(), "verification_error");
    let payload = serde_json::to_value(err.to_payload()).expect("payload");
    assert_eq!(payload["verdict"]["status"], "error");
    assert_eq!(verifier.requests().len(), 2);

    let logs = d.engine().session().dir().join("verify");
    assert!(logs.join("verify-0001.log").is_file());
    assert!(logs.join("verify-0002.log").is_file());
}

#[test]
fn init_then_verify_passes_project_to_verifier() {
    let sandbox = TestSandbox::new();
    let sink = Arc::new(RecordingSink::default());
    let verifier_verdict = Verdict {
        status: VerdictStatus::Pass,
        diagnostics: "2 harness(es) verified".to_string(),
        exit_code: Some(0),
    };
    let verifier = ScriptedVerifier::new([verifier_verdict]);
    let mut d = dispatcher(&sandbox, sink.clone(), &verifier);

    let init = d
        .dispatch("init_rust_crate", json!({"project_dir": "workspace/proofs"}))
        .expect("init");
    assert_eq!(init["created"].as_array().map(Vec::len), Some(2));
    assert_eq!(sink.events().len(), 2);

    let ok = d
        .dispatch(
            "run_kani",
            json!({
                "project_dir": "proofs",
                "harness": "check_add",
                "args": ["--quiet", "--default-unwind=4"]
            }),
        )
        .expect("verify");
    assert_eq!(ok["status"], "pass");
    assert_eq!(ok["project_dir"], "proofs");

    assert_eq!(
        verifier.requests(),
        vec![VerifyRequest {
            workspace_root: sandbox.root().to_path_buf(),
            project: "proofs".to_string(),
            harness: Some("check_add".to_string()),
            args: vec![
                "--quiet".to_string(),
                "--default-unwind".to_string(),
                "4".to_string()
            ],
        }]
    );
}

#[test]
fn rejected_kani_arguments_never_reach_the_verifier() {
    let sandbox = TestSandbox::new();
    sandbox.write("demo/Cargo.toml", "[package]\nname = \"demo\"\n");
    let verifier = ScriptedVerifier::default();
    let mut d = dispatcher(&sandbox, Arc::new(RecordingSink::default()), &verifier);

    let bad = [
        json!({"project_dir": "demo", "args": ["--enable-unstable"]}),
        json!({"project_dir": "demo", "args": ["--unwind", "lots"]}),
        json!({"project_dir": "demo", "harness": "-rf"}),
    ];
    for args in bad {
        assert_eq!(kind(d.dispatch("run_kani", args)), "invalid_arguments");
    }
    assert_eq!(kind(d.dispatch("run_kani", json!({"project_dir": "nope"}))), "not_found");
    assert!(verifier.requests().is_empty());
}
