//! Apply-tool adapter around `git apply`.
//!
//! `git apply` works outside repositories too, which is what the sandbox usually is.
//! `GIT_CEILING_DIRECTORIES` stops it from discovering an enclosing repository and
//! reinterpreting diff paths relative to that repository's top level.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, instrument};

use crate::core::patch::StreamCapture;
use crate::io::config::ApplyConfig;
use crate::io::process::{Keep, OutputLimit, run_with_timeout};

/// Result of one apply-tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyRun {
    pub success: bool,
    pub capture: StreamCapture,
}

/// Something that can dry-run and apply a unified diff inside a directory.
pub trait ApplyTool {
    /// Check the diff applies cleanly to `workdir` without touching it.
    fn check(&self, workdir: &Path, patch_file: &Path, strip: u8) -> Result<ApplyRun>;

    /// Apply the diff to the files under `workdir`.
    fn apply(&self, workdir: &Path, patch_file: &Path, strip: u8) -> Result<ApplyRun>;
}

/// [`ApplyTool`] backed by the `git` binary.
#[derive(Debug, Clone)]
pub struct GitApply {
    timeout: Duration,
    output_limit_bytes: usize,
}

impl GitApply {
    pub fn new(cfg: &ApplyConfig) -> Self {
        Self {
            timeout: Duration::from_secs(cfg.timeout_secs),
            output_limit_bytes: cfg.output_limit_bytes,
        }
    }

    fn command(&self, workdir: &Path, flags: &[&str], patch_file: &Path, strip: u8) -> Command {
        let mut cmd = Command::new("git");
        cmd.arg("apply")
            .args(flags)
            .arg(format!("-p{strip}"))
            .arg(patch_file)
            .current_dir(workdir);
        if let Some(parent) = workdir.parent() {
            cmd.env("GIT_CEILING_DIRECTORIES", parent);
        }
        cmd
    }

    fn run(&self, cmd: Command, what: &str) -> Result<ApplyRun> {
        let out = run_with_timeout(
            cmd,
            self.timeout,
            OutputLimit {
                bytes: self.output_limit_bytes,
                keep: Keep::Head,
            },
        )
        .with_context(|| format!("run git apply ({what})"))?;
        let mut stderr = out.stderr_text();
        if out.timed_out {
            stderr.push_str(&format!(
                "\n[git apply timed out after {}s]\n",
                self.timeout.as_secs()
            ));
        }
        debug!(what, success = out.success(), "git apply finished");
        Ok(ApplyRun {
            success: out.success(),
            capture: StreamCapture::new(out.stdout_text(), stderr),
        })
    }
}

impl ApplyTool for GitApply {
    #[instrument(skip_all, fields(workdir = %workdir.display(), strip))]
    fn check(&self, workdir: &Path, patch_file: &Path, strip: u8) -> Result<ApplyRun> {
        let cmd = self.command(workdir, &["--check", "--verbose"], patch_file, strip);
        self.run(cmd, "check")
    }

    #[instrument(skip_all, fields(workdir = %workdir.display(), strip))]
    fn apply(&self, workdir: &Path, patch_file: &Path, strip: u8) -> Result<ApplyRun> {
        // `--stat` alone only reports; `--apply` after it applies as well.
        let cmd = self.command(workdir, &["--stat", "--apply"], patch_file, strip);
        self.run(cmd, "apply")
    }
}
