//! Patch Validation/Application Engine.
//!
//! `propose` validates a diff against the current workspace before anyone sees it;
//! `approve_latest` applies the most recent valid patch. Applies are staged: the
//! touched files are copied to scratch, patched there, and each post-image is then
//! renamed into place, so a failing apply tool never leaves a half-patched tree.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::diff::{ChangeKind, DiffSummary, parse_unified_diff};
use crate::core::patch::{Patch, StreamCapture, TransitionError};
use crate::error::ToolError;
use crate::io::git_apply::{ApplyRun, ApplyTool};
use crate::io::session::RunSession;
use crate::io::signal::{FileDiffEvent, SignalSink};
use crate::io::workspace::Workspace;
use crate::store::StoreError;

/// Result of a successful `propose`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Proposal {
    pub patch_id: u32,
    pub validation: &'static str,
    pub touched: Vec<String>,
    pub digest: String,
    pub check_output: String,
}

/// Result of a successful approval.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Applied {
    pub patch_id: u32,
    pub files: Vec<String>,
    pub stat: String,
}

/// One touched file during a staged apply.
struct Staged {
    relative: String,
    live: PathBuf,
    before: Vec<u8>,
    after: Option<Vec<u8>>,
}

pub struct PatchEngine {
    workspace: Workspace,
    session: RunSession,
    apply_tool: Box<dyn ApplyTool>,
    signals: Arc<dyn SignalSink>,
}

impl PatchEngine {
    pub fn new(
        workspace: Workspace,
        session: RunSession,
        apply_tool: Box<dyn ApplyTool>,
        signals: Arc<dyn SignalSink>,
    ) -> Self {
        Self {
            workspace,
            session,
            apply_tool,
            signals,
        }
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn session(&self) -> &RunSession {
        &self.session
    }

    pub fn signals(&self) -> &Arc<dyn SignalSink> {
        &self.signals
    }

    /// Latest valid patch if it can still be approved.
    pub fn pending(&self) -> Option<Patch> {
        self.session
            .store()
            .latest_valid()
            .filter(Patch::is_pending_approval)
    }

    /// Create and validate a patch from diff text.
    ///
    /// Paths escaping the sandbox are refused before a patch is created. Anything
    /// else that is wrong with the diff produces an `invalid` patch so the attempt
    /// stays in the audit log.
    #[instrument(skip_all)]
    pub fn propose(&self, diff: &str) -> Result<Proposal, ToolError> {
        let parsed = parse_unified_diff(diff);
        if let Ok(summary) = &parsed {
            for path in summary.all_paths() {
                self.workspace.resolve(&path)?;
            }
        }

        let store = self.session.store();
        let patch = store.create(diff, now());
        self.session.persist(&patch)?;
        let seq = patch.seq;
        debug!(seq, "patch created");

        let summary = match parsed {
            Ok(summary) => summary,
            Err(err) => return Err(self.reject(seq, Vec::new(), err.to_string())),
        };
        let touched = summary.targets();
        if let Some(reason) = self.policy_violation(&summary) {
            return Err(self.reject(seq, touched, reason));
        }

        let paths = self.session.patch_paths(seq);
        let run = match self
            .apply_tool
            .check(self.workspace.root(), &paths.diff, summary.strip)
        {
            Ok(run) => run,
            Err(err) => {
                let reason = format!("could not run apply tool: {err:#}");
                return Err(self.reject(seq, touched, reason));
            }
        };

        let valid = run.success;
        let check_output = run.capture.stdout.clone();
        let reason = failure_text(&run);
        let patch = store
            .record(seq, |p| {
                p.touched = touched.clone();
                p.mark_validated(valid, run.capture, now())
            })
            .map_err(store_error)?;
        self.session.persist(&patch)?;

        if !valid {
            info!(seq, "patch rejected by dry run");
            return Err(ToolError::ValidationFailure { seq, reason });
        }
        info!(seq, files = touched.len(), "patch validated, awaiting approval");
        Ok(Proposal {
            patch_id: seq,
            validation: "valid",
            touched,
            digest: patch.digest,
            check_output,
        })
    }

    /// Apply the latest valid patch. Only ever called after an affirmative decision.
    #[instrument(skip_all)]
    pub fn approve_latest(&self) -> Result<Applied, ToolError> {
        let patch = self
            .session
            .store()
            .latest_valid()
            .ok_or(ToolError::NoPendingPatch)?;
        let seq = patch.seq;
        match patch.ensure_approvable() {
            Ok(()) => {}
            Err(TransitionError::AlreadyApplied { .. }) => {
                warn!(seq, "refusing to apply patch twice");
                return Err(ToolError::DuplicateApplyAttempt { seq });
            }
            Err(_) => return Err(ToolError::PatchNotPending { seq }),
        }

        let (staged, run) = match self.stage(&patch) {
            Ok(staged) => staged,
            Err(err) => {
                return Err(self.fail(seq, StreamCapture::new("", format!("{err:#}"))));
            }
        };
        if !run.success {
            let mut capture = run.capture;
            if capture.stderr.trim().is_empty() {
                capture.stderr.push_str("apply tool reported failure\n");
            }
            return Err(self.fail(seq, capture));
        }
        if staged.iter().all(|s| s.after.as_deref() == Some(s.before.as_slice())) {
            let mut capture = run.capture;
            capture.stderr.push_str("no file changes\n");
            return Err(self.fail(seq, capture));
        }

        if let Err(err) = self.commit(&staged) {
            let capture = StreamCapture::new(run.capture.stdout, format!("{err:#}"));
            return Err(self.fail(seq, capture));
        }

        let stat = run.capture.stdout.clone();
        let patch = self
            .session
            .store()
            .record(seq, |p| p.mark_applied(run.capture, now()))
            .map_err(store_error)?;
        self.session.persist(&patch)?;

        let mut files = Vec::with_capacity(staged.len());
        for file in &staged {
            if file.after.as_deref() == Some(file.before.as_slice()) {
                continue;
            }
            let after = file
                .after
                .as_deref()
                .map(String::from_utf8_lossy)
                .unwrap_or_default();
            self.signals.emit(FileDiffEvent::new(
                file.relative.clone(),
                Some(&file.live),
                &String::from_utf8_lossy(&file.before),
                &after,
            ));
            files.push(file.relative.clone());
        }
        info!(seq, files = files.len(), "patch applied");
        Ok(Applied {
            patch_id: seq,
            files,
            stat,
        })
    }

    /// Patch-level rules the dry run cannot express.
    fn policy_violation(&self, summary: &DiffSummary) -> Option<String> {
        if let Some(path) = summary.copied_or_renamed.first() {
            return Some(format!("renames and copies are not supported ('{path}')"));
        }
        for file in &summary.files {
            if file.binary {
                return Some(format!("binary patches are not supported ('{}')", file.target()));
            }
            if file.mode_change {
                return Some(format!("file mode changes are not supported ('{}')", file.target()));
            }
            match file.kind() {
                ChangeKind::Create => {
                    return Some(format!(
                        "patch creates '{}'; create new files with write_file",
                        file.target()
                    ));
                }
                ChangeKind::Rename => {
                    return Some(format!("renames are not supported ('{}')", file.target()));
                }
                ChangeKind::Modify | ChangeKind::Delete => {}
            }
            match self.workspace.resolve(file.target()) {
                Ok(live) if live.is_file() => {}
                Ok(_) => {
                    return Some(format!("'{}' does not exist in the workspace", file.target()));
                }
                Err(err) => return Some(err.to_string()),
            }
        }
        None
    }

    /// Copy touched files to scratch and run the real apply there.
    fn stage(&self, patch: &Patch) -> Result<(Vec<Staged>, ApplyRun)> {
        let summary = parse_unified_diff(&patch.diff).context("re-parse approved diff")?;
        let scratch = tempfile::tempdir().context("create scratch dir")?;
        let root = scratch.path().join("tree");

        let mut staged = Vec::new();
        for relative in summary.targets() {
            let live = self.workspace.resolve(&relative)?;
            let before = fs::read(&live).with_context(|| format!("read {}", live.display()))?;
            let copy = root.join(&relative);
            if let Some(parent) = copy.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create {}", parent.display()))?;
            }
            fs::write(&copy, &before).with_context(|| format!("stage {}", copy.display()))?;
            staged.push(Staged {
                relative,
                live,
                before,
                after: None,
            });
        }

        let patch_file = self.session.patch_paths(patch.seq).diff;
        let run = self.apply_tool.apply(&root, &patch_file, summary.strip)?;
        if run.success {
            for file in &mut staged {
                let copy = root.join(&file.relative);
                file.after = match fs::read(&copy) {
                    Ok(bytes) => Some(bytes),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
                    Err(err) => {
                        return Err(err).with_context(|| format!("read staged {}", copy.display()));
                    }
                };
            }
        }
        Ok((staged, run))
    }

    /// Move every post-image into the live tree.
    fn commit(&self, staged: &[Staged]) -> Result<()> {
        for file in staged {
            match &file.after {
                Some(after) if after == &file.before => {}
                Some(after) => replace_file(&file.live, after)?,
                None => fs::remove_file(&file.live)
                    .with_context(|| format!("remove {}", file.live.display()))?,
            }
        }
        Ok(())
    }

    fn reject(&self, seq: u32, touched: Vec<String>, reason: String) -> ToolError {
        let recorded = self.session.store().record(seq, |p| {
            p.touched = touched;
            p.reject(reason.clone(), now())
        });
        match recorded {
            Ok(patch) => {
                if let Err(err) = self.session.persist(&patch) {
                    return ToolError::Io(err);
                }
                info!(seq, reason = %reason, "patch rejected");
                ToolError::ValidationFailure { seq, reason }
            }
            Err(err) => store_error(err),
        }
    }

    fn fail(&self, seq: u32, capture: StreamCapture) -> ToolError {
        let reason = capture.stderr.trim().to_string();
        match self
            .session
            .store()
            .record(seq, |p| p.mark_failed(capture, now()))
        {
            Ok(patch) => {
                if let Err(err) = self.session.persist(&patch) {
                    return ToolError::Io(err);
                }
                warn!(seq, reason = %reason, "patch failed to apply");
                ToolError::ApplyFailure { seq, reason }
            }
            Err(err) => store_error(err),
        }
    }
}

/// Write `contents` next to `path` and rename over it, keeping permissions.
/// Mode changes never reach here; `policy_violation` rejects them.
fn replace_file(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    let permissions = fs::metadata(path)
        .with_context(|| format!("stat {}", path.display()))?
        .permissions();
    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("create temp file in {}", parent.display()))?;
    std::io::Write::write_all(&mut tmp, contents)
        .with_context(|| format!("write temp file for {}", path.display()))?;
    fs::set_permissions(tmp.path(), permissions)
        .with_context(|| format!("copy permissions for {}", path.display()))?;
    tmp.persist(path)
        .with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

fn failure_text(run: &ApplyRun) -> String {
    let stderr = run.capture.stderr.trim();
    if stderr.is_empty() {
        "apply tool reported failure".to_string()
    } else {
        stderr.to_string()
    }
}

fn store_error(err: StoreError) -> ToolError {
    ToolError::Io(anyhow::Error::new(err))
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::patch::{ApplyState, Validation};
    use crate::test_support::{RecordingSink, TestSandbox, create_diff, replace_diff};

    const BEFORE: &str = "fn one() -> i32 {\n    1\n}\n";
    const AFTER: &str = "fn one() -> i32 {\n    2\n}\n";

    struct BrokenApply;

    impl ApplyTool for BrokenApply {
        fn check(&self, _: &Path, _: &Path, _: u8) -> Result<ApplyRun> {
            Ok(ApplyRun {
                success: true,
                capture: StreamCapture::default(),
            })
        }

        fn apply(&self, workdir: &Path, _: &Path, _: u8) -> Result<ApplyRun> {
            // Scribble on the scratch copy, then report failure.
            fs::write(workdir.join("lib.rs"), "garbage").expect("scribble");
            Ok(ApplyRun {
                success: false,
                capture: StreamCapture::new("", "error: patch failed: lib.rs:1"),
            })
        }
    }

    #[test]
    fn valid_patch_applies_and_signals() {
        let sandbox = TestSandbox::new();
        sandbox.write("lib.rs", BEFORE);
        let sink = Arc::new(RecordingSink::default());
        let engine = sandbox.engine(sink.clone());

        let proposal = engine
            .propose(&replace_diff("lib.rs", BEFORE, AFTER))
            .expect("propose");
        assert_eq!(proposal.patch_id, 1);
        assert_eq!(proposal.touched, vec!["lib.rs".to_string()]);
        assert_eq!(sandbox.read("lib.rs"), BEFORE, "validation must not mutate");
        assert!(sink.events().is_empty());

        let applied = engine.approve_latest().expect("approve");
        assert_eq!(applied.files, vec!["lib.rs".to_string()]);
        assert_eq!(sandbox.read("lib.rs"), AFTER);

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].before, BEFORE);
        assert_eq!(events[0].after, AFTER);
    }

    #[test]
    fn second_approval_is_a_duplicate() {
        let sandbox = TestSandbox::new();
        sandbox.write("lib.rs", BEFORE);
        let engine = sandbox.engine(Arc::new(RecordingSink::default()));
        engine.propose(&replace_diff("lib.rs", BEFORE, AFTER)).expect("propose");
        engine.approve_latest().expect("approve");

        let err = engine.approve_latest().unwrap_err();
        assert_eq!(err.kind(), "duplicate_apply_attempt");
        assert_eq!(sandbox.read("lib.rs"), AFTER);
    }

    #[test]
    fn creating_files_through_patches_is_invalid() {
        let sandbox = TestSandbox::new();
        let engine = sandbox.engine(Arc::new(RecordingSink::default()));
        let diff = create_diff("new.rs", "fn new() {}\n");

        let err = engine.propose(&diff).unwrap_err();
        assert_eq!(err.kind(), "validation_failure");
        assert!(!sandbox.root().join("new.rs").exists());
        let patch = engine.session().store().get(1).expect("patch kept");
        assert_eq!(patch.validation, Validation::Invalid);
        assert_eq!(patch.apply, ApplyState::Rejected);
        assert_eq!(engine.approve_latest().unwrap_err().kind(), "no_pending_patch");
    }

    #[test]
    fn escaping_paths_create_no_patch() {
        let sandbox = TestSandbox::new();
        let engine = sandbox.engine(Arc::new(RecordingSink::default()));
        let err = engine
            .propose(&replace_diff("../outside.rs", "a\n", "b\n"))
            .unwrap_err();
        assert_eq!(err.kind(), "containment_violation");
        assert!(engine.session().store().is_empty());
        assert_eq!(
            fs::read_dir(engine.session().patches_dir()).expect("dir").count(),
            0
        );
    }

    #[test]
    fn garbage_diff_is_recorded_invalid() {
        let sandbox = TestSandbox::new();
        let engine = sandbox.engine(Arc::new(RecordingSink::default()));
        let err = engine.propose("this is not a diff").unwrap_err();
        assert_eq!(err.kind(), "validation_failure");
        assert!(engine.session().patch_paths(1).diff.exists());
    }

    #[test]
    fn failed_apply_leaves_workspace_untouched() {
        let sandbox = TestSandbox::new();
        sandbox.write("lib.rs", BEFORE);
        let sink = Arc::new(RecordingSink::default());
        let engine = sandbox.engine_with(Box::new(BrokenApply), sink.clone());

        engine.propose(&replace_diff("lib.rs", BEFORE, AFTER)).expect("propose");
        let err = engine.approve_latest().unwrap_err();
        assert_eq!(err.kind(), "apply_failure");
        assert_eq!(sandbox.read("lib.rs"), BEFORE);
        assert!(sink.events().is_empty());

        let patch = engine.session().store().get(1).expect("patch");
        assert_eq!(patch.apply, ApplyState::Failed);
        assert_eq!(engine.approve_latest().unwrap_err().kind(), "patch_not_pending");
        let apply_err =
            fs::read_to_string(engine.session().patch_paths(1).apply_err).expect("log");
        assert!(apply_err.contains("patch failed"));
    }

    #[test]
    fn patch_without_byte_changes_fails_at_apply() {
        let sandbox = TestSandbox::new();
        sandbox.write("a.txt", "one\n");
        let sink = Arc::new(RecordingSink::default());
        let engine = sandbox.engine(sink.clone());

        engine
            .propose(&replace_diff("a.txt", "one\n", "one\n"))
            .expect("dry run accepts a no-op hunk");
        let err = engine.approve_latest().unwrap_err();
        assert_eq!(err.kind(), "apply_failure");
        assert_eq!(sandbox.read("a.txt"), "one\n");
        assert!(sink.events().is_empty());

        let patch = engine.session().store().get(1).expect("patch");
        assert_eq!(patch.apply, ApplyState::Failed);
        let apply_err =
            fs::read_to_string(engine.session().patch_paths(1).apply_err).expect("log");
        assert!(apply_err.contains("no file changes"));
    }

    #[test]
    fn mode_changes_are_invalid() {
        let sandbox = TestSandbox::new();
        sandbox.write("a.txt", "one\n");
        let engine = sandbox.engine(Arc::new(RecordingSink::default()));
        let diff = format!(
            "diff --git a/a.txt b/a.txt\nold mode 100644\nnew mode 100755\n{}",
            replace_diff("a.txt", "one\n", "two\n")
        );

        let err = engine.propose(&diff).unwrap_err();
        assert_eq!(err.kind(), "validation_failure");
        assert!(err.to_string().contains("mode"));
        let patch = engine.session().store().get(1).expect("patch");
        assert_eq!(patch.validation, Validation::Invalid);
        assert_eq!(engine.approve_latest().unwrap_err().kind(), "no_pending_patch");
        assert_eq!(sandbox.read("a.txt"), "one\n");
    }

    #[test]
    fn binary_patches_are_invalid() {
        let sandbox = TestSandbox::new();
        sandbox.write("a.txt", "one\n");
        sandbox.write("logo.png", "png");
        let engine = sandbox.engine(Arc::new(RecordingSink::default()));
        let diff = format!(
            "diff --git a/logo.png b/logo.png\n\
             index 1111111..2222222 100644\n\
             Binary files a/logo.png and b/logo.png differ\n\
             diff --git a/a.txt b/a.txt\n{}",
            replace_diff("a.txt", "one\n", "two\n")
        );

        let err = engine.propose(&diff).unwrap_err();
        assert_eq!(err.kind(), "validation_failure");
        assert!(err.to_string().contains("binary"));
        assert_eq!(sandbox.read("logo.png"), "png");
    }

    #[test]
    fn deleting_an_existing_file() {
        let sandbox = TestSandbox::new();
        sandbox.write("old.txt", "bye\n");
        let sink = Arc::new(RecordingSink::default());
        let engine = sandbox.engine(sink.clone());
        let diff = "--- a/old.txt\n+++ /dev/null\n@@ -1 +0,0 @@\n-bye\n";

        engine.propose(diff).expect("propose");
        engine.approve_latest().expect("approve");
        assert!(!sandbox.root().join("old.txt").exists());
        assert_eq!(sink.events()[0].after, "");
    }
}
