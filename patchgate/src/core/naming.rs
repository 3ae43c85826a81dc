//! Deterministic names for run directories and per-patch artifacts.

use chrono::{DateTime, Utc};

/// Run directory name: `run-<day>-<unix-seconds>[-<tag>]`, day as `Mon-20240101`.
pub fn run_dir_name(created_at: DateTime<Utc>, tag: Option<&str>) -> String {
    let day = created_at.format("%a-%Y%m%d");
    let secs = created_at.timestamp();
    match tag {
        Some(tag) => format!("run-{day}-{secs}-{tag}"),
        None => format!("run-{day}-{secs}"),
    }
}

/// Operator tags end up in a directory name, so keep them to `[A-Za-z0-9._-]`.
pub fn validate_tag(tag: &str) -> Result<(), String> {
    if tag.is_empty() {
        return Err("run tag must not be empty".to_string());
    }
    if tag.starts_with('.') {
        return Err(format!("run tag must not start with '.' (got '{tag}')"));
    }
    if tag
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'))
    {
        return Err(format!("run tag must be [A-Za-z0-9._-] only (got '{tag}')"));
    }
    Ok(())
}

/// Zero-padded artifact stem, e.g. `patch-0001`.
pub fn patch_stem(seq: u32) -> String {
    format!("patch-{seq:04}")
}

/// Zero-padded verification log name, e.g. `verify-0002.log`.
pub fn verify_log_name(seq: u32) -> String {
    format!("verify-{seq:04}.log")
}
