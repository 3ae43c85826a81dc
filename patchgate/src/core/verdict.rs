//! Classification of formal-verification runs into `pass`, `fail` or `error`.
//!
//! `fail` means the checker determined a property is violated. `error` means the
//! run could not determine anything (timeout, missing image, build failure).
//! The two must never be conflated.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static SUMMARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Complete - (\d+) successfully verified harness(?:es)?, (\d+) failures?")
        .expect("static summary regex")
});

const FAILED_MARKER: &str = "VERIFICATION:- FAILED";
const SUCCESS_MARKER: &str = "VERIFICATION:- SUCCESSFUL";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerdictStatus {
    Pass,
    Fail,
    Error,
}

/// Classified result of one checker run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub status: VerdictStatus,
    pub diagnostics: String,
    pub exit_code: Option<i32>,
}

impl Verdict {
    pub fn error(diagnostics: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self {
            status: VerdictStatus::Error,
            diagnostics: diagnostics.into(),
            exit_code,
        }
    }
}

/// How the checker process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckerExit {
    Exited(Option<i32>),
    TimedOut { secs: u64 },
    SpawnFailed(String),
}

/// Harness tally parsed from the checker's closing summary line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HarnessSummary {
    pub verified: u32,
    pub failures: u32,
}

pub fn parse_summary(output: &str) -> Option<HarnessSummary> {
    let caps = SUMMARY.captures_iter(output).last()?;
    Some(HarnessSummary {
        verified: caps[1].parse().ok()?,
        failures: caps[2].parse().ok()?,
    })
}

/// Classify a finished checker run from its exit and combined output.
pub fn classify(exit: &CheckerExit, stdout: &str, stderr: &str) -> Verdict {
    let code = match exit {
        CheckerExit::SpawnFailed(reason) => {
            return Verdict::error(format!("could not start checker: {reason}"), None);
        }
        CheckerExit::TimedOut { secs } => {
            return Verdict::error(
                format!(
                    "checker timed out after {secs}s; result undetermined\n{}",
                    tail(stdout, stderr)
                ),
                None,
            );
        }
        CheckerExit::Exited(code) => *code,
    };

    let summary = parse_summary(stdout);
    let counterexample =
        stdout.contains(FAILED_MARKER) || summary.is_some_and(|s| s.failures > 0);
    if counterexample {
        return Verdict {
            status: VerdictStatus::Fail,
            diagnostics: failure_report(stdout, stderr),
            exit_code: code,
        };
    }

    if code == Some(0) {
        let diagnostics = match summary {
            Some(s) => format!("{} harness(es) verified", s.verified),
            None if stdout.contains(SUCCESS_MARKER) => "verification successful".to_string(),
            None => "checker exited successfully".to_string(),
        };
        return Verdict {
            status: VerdictStatus::Pass,
            diagnostics,
            exit_code: code,
        };
    }

    let reason = match code {
        Some(125) => "container runtime could not run the checker image",
        Some(126) | Some(127) => "checker command not runnable inside the container",
        Some(137) => "checker was killed (out of memory or resource limit)",
        None => "checker terminated by a signal",
        _ => "checker exited without a verification result",
    };
    Verdict::error(format!("{reason}\n{}", tail(stdout, stderr)), code)
}

/// Failed checks and counterexample trace lines, followed by the summary.
fn failure_report(stdout: &str, stderr: &str) -> String {
    let mut lines: Vec<&str> = Vec::new();
    let mut in_trace = false;
    for line in stdout.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("Checking harness") {
            lines.push(line);
            in_trace = false;
        } else if trimmed.contains("Status: FAILURE") || trimmed.starts_with("Failed Checks:") {
            lines.push(line);
            in_trace = true;
        } else if in_trace && (trimmed.starts_with("- ") || trimmed.starts_with("File:")) {
            lines.push(line);
        } else if trimmed.starts_with(FAILED_MARKER)
            || trimmed.starts_with("Complete - ")
            || trimmed.starts_with("Summary:")
        {
            lines.push(line);
            in_trace = false;
        }
    }
    if lines.is_empty() {
        return tail(stdout, stderr);
    }
    let mut out = lines.join("\n");
    if !stderr.trim().is_empty() {
        out.push_str("\n--- stderr ---\n");
        out.push_str(stderr.trim());
    }
    out
}

fn tail(stdout: &str, stderr: &str) -> String {
    let mut out = String::new();
    if !stdout.trim().is_empty() {
        out.push_str(stdout.trim());
    }
    if !stderr.trim().is_empty() {
        if !out.is_empty() {
            out.push_str("\n--- stderr ---\n");
        }
        out.push_str(stderr.trim());
    }
    out
}
