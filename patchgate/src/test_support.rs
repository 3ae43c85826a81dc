//! Test-only helpers: temp sandboxes, recording sinks and scripted collaborators.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::core::patch::Patch;
use crate::core::verdict::Verdict;
use crate::engine::PatchEngine;
use crate::io::config::{Config, EnvSnapshot};
use crate::io::git_apply::{ApplyTool, GitApply};
use crate::io::session::{RunSession, SessionInit};
use crate::io::signal::{FileDiffEvent, SignalSink};
use crate::io::verifier::{Verifier, VerifyReport, VerifyRequest};
use crate::io::workspace::Workspace;
use crate::review::{ApprovalGate, Decision};

/// Temp directory holding a sandbox (`ws/`) and a runs root (`runs/`).
pub struct TestSandbox {
    _temp: tempfile::TempDir,
    root: PathBuf,
    runs: PathBuf,
}

impl Default for TestSandbox {
    fn default() -> Self {
        Self::new()
    }
}

impl TestSandbox {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("ws");
        let runs = temp.path().join("runs");
        fs::create_dir(&root).expect("create sandbox");
        let root = fs::canonicalize(&root).expect("canonical sandbox");
        Self {
            _temp: temp,
            root,
            runs,
        }
    }

    /// Canonical sandbox root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory outside the sandbox but inside the temp dir.
    pub fn outside(&self) -> PathBuf {
        let dir = self.root.parent().expect("parent").join("outside");
        fs::create_dir_all(&dir).expect("create outside");
        dir
    }

    pub fn write(&self, relative: &str, contents: &str) {
        let path = self.root.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(path, contents).expect("write sandbox file");
    }

    pub fn read(&self, relative: &str) -> String {
        fs::read_to_string(self.root.join(relative)).expect("read sandbox file")
    }

    pub fn workspace(&self) -> Workspace {
        Workspace::open(&self.root).expect("open workspace")
    }

    pub fn session(&self, tag: &str) -> RunSession {
        RunSession::start(SessionInit {
            runs_root: &self.runs,
            sandbox_root: &self.root,
            model: "test-model",
            tag: Some(tag),
            env: EnvSnapshot::default(),
        })
        .expect("start session")
    }

    pub fn engine(&self, sink: Arc<dyn SignalSink>) -> PatchEngine {
        self.engine_with(Box::new(GitApply::new(&Config::default().apply)), sink)
    }

    pub fn engine_with(
        &self,
        apply_tool: Box<dyn ApplyTool>,
        sink: Arc<dyn SignalSink>,
    ) -> PatchEngine {
        PatchEngine::new(self.workspace(), self.session("test"), apply_tool, sink)
    }
}

/// Sink that keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<FileDiffEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<FileDiffEvent> {
        self.events.lock().expect("lock").clone()
    }
}

impl SignalSink for RecordingSink {
    fn emit(&self, event: FileDiffEvent) {
        self.events.lock().expect("lock").push(event);
    }
}

/// Verifier returning queued verdicts and recording requests.
///
/// Clones share the script, so a test can keep one handle after boxing another.
#[derive(Debug, Default, Clone)]
pub struct ScriptedVerifier {
    verdicts: Arc<Mutex<VecDeque<Verdict>>>,
    requests: Arc<Mutex<Vec<VerifyRequest>>>,
}

impl ScriptedVerifier {
    pub fn new(verdicts: impl IntoIterator<Item = Verdict>) -> Self {
        Self {
            verdicts: Arc::new(Mutex::new(verdicts.into_iter().collect())),
            requests: Arc::default(),
        }
    }

    pub fn requests(&self) -> Vec<VerifyRequest> {
        self.requests.lock().expect("lock").clone()
    }
}

impl Verifier for ScriptedVerifier {
    fn verify(&self, request: &VerifyRequest) -> VerifyReport {
        self.requests.lock().expect("lock").push(request.clone());
        let verdict = self
            .verdicts
            .lock()
            .expect("lock")
            .pop_front()
            .expect("scripted verifier ran out of verdicts");
        VerifyReport {
            transcript: format!("scripted: {}\n", verdict.diagnostics),
            verdict,
        }
    }
}

/// Gate answering from a script (deny once exhausted) and recording what it saw.
#[derive(Debug, Default)]
pub struct ScriptedGate {
    decisions: Mutex<VecDeque<Decision>>,
    asked: Mutex<Vec<u32>>,
}

impl ScriptedGate {
    pub fn new(decisions: impl IntoIterator<Item = Decision>) -> Self {
        Self {
            decisions: Mutex::new(decisions.into_iter().collect()),
            asked: Mutex::new(Vec::new()),
        }
    }

    /// Sequence numbers presented for approval, in order.
    pub fn asked(&self) -> Vec<u32> {
        self.asked.lock().expect("lock").clone()
    }
}

impl ApprovalGate for ScriptedGate {
    fn decide(&self, pending: &Patch) -> Decision {
        self.asked.lock().expect("lock").push(pending.seq);
        self.decisions
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or(Decision::Deny)
    }
}

/// Git-style diff replacing the whole of `before` with `after`.
///
/// Both texts must be newline-terminated; either may be several lines.
pub fn replace_diff(path: &str, before: &str, after: &str) -> String {
    let old: Vec<&str> = before.lines().collect();
    let new: Vec<&str> = after.lines().collect();
    let mut diff = format!(
        "--- a/{path}\n+++ b/{path}\n@@ -1,{} +1,{} @@\n",
        old.len(),
        new.len()
    );
    for line in old {
        diff.push_str(&format!("-{line}\n"));
    }
    for line in new {
        diff.push_str(&format!("+{line}\n"));
    }
    diff
}

/// Diff that would create `path` from nothing.
pub fn create_diff(path: &str, contents: &str) -> String {
    let lines: Vec<&str> = contents.lines().collect();
    let mut diff = format!("--- /dev/null\n+++ b/{path}\n@@ -0,0 +1,{} @@\n", lines.len());
    for line in lines {
        diff.push_str(&format!("+{line}\n"));
    }
    diff
}
