//! Verification Sandbox Orchestrator: `cargo kani` inside a locked-down container.
//!
//! The workspace is mounted read-only; the project is copied into a tmpfs scratch
//! area and built there with networking disabled. Whatever happens, the outcome
//! comes back as a classified [`Verdict`], never as an error that aborts the run.

use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::core::verdict::{CheckerExit, Verdict, classify};
use crate::io::config::VerifierConfig;
use crate::io::process::{Keep, OutputLimit, run_with_timeout};

const FLAGS: [&str; 3] = ["--quiet", "--verbose", "--tests"];
const VALUED: [&str; 3] = ["--harness", "--default-unwind", "--unwind"];

/// Copy the project out of the read-only mount, then hand remaining args to kani.
const SCRATCH_SCRIPT: &str = concat!(
    r#"mkdir -p /tmp/work && cp -a "/work/$1/." /tmp/work"#,
    r#" && cd /tmp/work && shift && exec cargo kani "$@""#,
);

/// One verification request, already containment-checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyRequest {
    /// Canonical sandbox root, mounted at `/work`.
    pub workspace_root: PathBuf,
    /// Project directory relative to the root, `/`-separated (`""` is the root).
    pub project: String,
    /// Proof harness to check; all harnesses when `None`.
    pub harness: Option<String>,
    /// Extra checker arguments, already passed through [`validate_kani_args`].
    pub args: Vec<String>,
}

/// Verdict plus the raw transcript kept for the run's verify log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    pub verdict: Verdict,
    pub transcript: String,
}

pub trait Verifier: Send + Sync {
    fn verify(&self, request: &VerifyRequest) -> VerifyReport;
}

/// Check checker arguments against the allowlist.
///
/// Valued flags take the next argument (or an `=value` suffix); unwind values must
/// be integers and harness names plain paths.
pub fn validate_kani_args(args: &[String]) -> Result<Vec<String>, String> {
    let mut out = Vec::with_capacity(args.len());
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if FLAGS.contains(&arg.as_str()) {
            out.push(arg.clone());
            continue;
        }
        let (flag, inline) = match arg.split_once('=') {
            Some((flag, value)) => (flag, Some(value.to_string())),
            None => (arg.as_str(), None),
        };
        if !VALUED.contains(&flag) {
            return Err(format!("disallowed kani argument '{arg}'"));
        }
        let value = match inline {
            Some(value) => value,
            None => iter
                .next()
                .cloned()
                .ok_or_else(|| format!("{flag} requires a value"))?,
        };
        if flag == "--harness" {
            validate_harness(&value)?;
        } else if value.is_empty() || !value.chars().all(|c| c.is_ascii_digit()) {
            return Err(format!("{flag} expects a non-negative integer (got '{value}')"));
        }
        out.push(flag.to_string());
        out.push(value);
    }
    Ok(out)
}

pub fn validate_harness(name: &str) -> Result<(), String> {
    let ok = !name.is_empty()
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':');
    if ok {
        Ok(())
    } else {
        Err(format!("invalid harness name '{name}'"))
    }
}

/// [`Verifier`] running the checker image under a container runtime.
#[derive(Debug)]
pub struct KaniDockerVerifier {
    cfg: VerifierConfig,
    runs: AtomicU32,
}

impl KaniDockerVerifier {
    pub fn new(cfg: &VerifierConfig) -> Self {
        Self {
            cfg: cfg.clone(),
            runs: AtomicU32::new(0),
        }
    }

    fn container_name(&self) -> String {
        let n = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        format!(
            "patchgate-kani-{}-{}-{n}",
            std::process::id(),
            chrono::Utc::now().timestamp_millis()
        )
    }

    /// Full runtime argument vector, program first.
    pub fn command_line(&self, request: &VerifyRequest, name: &str) -> Vec<String> {
        let cfg = &self.cfg;
        let mut argv: Vec<String> = [
            cfg.runtime.as_str(),
            "run",
            "--rm",
            "--name",
            name,
            "--network",
            "none",
            "--cap-drop",
            "ALL",
            "--security-opt",
            "no-new-privileges",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        argv.extend([
            "--pids-limit".to_string(),
            cfg.pids_limit.to_string(),
            "--memory".to_string(),
            cfg.memory.clone(),
            "--cpus".to_string(),
            cfg.cpus.clone(),
            "--tmpfs".to_string(),
            "/tmp:rw,exec".to_string(),
            "-v".to_string(),
            format!("{}:/work:ro", request.workspace_root.display()),
        ]);
        for env in [
            "HOME=/root",
            "RUSTUP_HOME=/root/.rustup",
            "CARGO_HOME=/root/.cargo",
            "RUSTUP_TOOLCHAIN=stable",
            "CARGO_TARGET_DIR=/tmp/target",
            "CARGO_NET_OFFLINE=true",
        ] {
            argv.push("-e".to_string());
            argv.push(env.to_string());
        }
        argv.extend([
            "--entrypoint".to_string(),
            "sh".to_string(),
            cfg.image.clone(),
            "-c".to_string(),
            SCRATCH_SCRIPT.to_string(),
            "patchgate".to_string(),
            request.project.clone(),
        ]);
        if let Some(harness) = &request.harness {
            argv.push("--harness".to_string());
            argv.push(harness.clone());
        }
        argv.extend(request.args.iter().cloned());
        argv
    }

    fn remove_container(&self, name: &str) {
        let mut cmd = Command::new(&self.cfg.runtime);
        cmd.args(["rm", "-f", name]);
        let limit = OutputLimit {
            bytes: 4_096,
            keep: Keep::Tail,
        };
        match run_with_timeout(cmd, Duration::from_secs(30), limit) {
            Ok(out) if out.success() => info!(container = name, "removed timed-out container"),
            Ok(out) => {
                warn!(container = name, stderr = %out.stderr_text(), "container removal failed");
            }
            Err(err) => {
                warn!(container = name, err = %format!("{err:#}"), "container removal failed");
            }
        }
    }
}

impl Verifier for KaniDockerVerifier {
    #[instrument(skip_all, fields(project = %request.project, harness = ?request.harness))]
    fn verify(&self, request: &VerifyRequest) -> VerifyReport {
        let name = self.container_name();
        let argv = self.command_line(request, &name);
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        let limit = OutputLimit {
            bytes: self.cfg.output_limit_bytes,
            keep: Keep::Tail,
        };

        let header = format!("$ {}\n", argv.join(" "));
        let (exit, stdout, stderr) =
            match run_with_timeout(cmd, Duration::from_secs(self.cfg.timeout_secs), limit) {
                Err(err) => (
                    CheckerExit::SpawnFailed(format!("{err:#}")),
                    String::new(),
                    String::new(),
                ),
                Ok(out) => {
                    let exit = if out.timed_out {
                        self.remove_container(&name);
                        CheckerExit::TimedOut {
                            secs: self.cfg.timeout_secs,
                        }
                    } else {
                        CheckerExit::Exited(out.status.code())
                    };
                    (exit, out.stdout_text(), out.stderr_text())
                }
            };

        let verdict = classify(&exit, &stdout, &stderr);
        info!(status = ?verdict.status, exit_code = ?verdict.exit_code, "verification finished");
        VerifyReport {
            transcript: format!("{header}--- stdout ---\n{stdout}\n--- stderr ---\n{stderr}\n"),
            verdict,
        }
    }
}
