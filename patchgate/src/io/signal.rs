//! One-way `file_diff` events for external observers such as an editor extension.
//!
//! Emission never fails the caller: sink errors are logged and dropped. Observers
//! poll or watch the event file and must tolerate missing or stale contents.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Before/after view of one changed file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDiffEvent {
    pub event: String,
    /// Workspace-relative path.
    pub path: String,
    pub abs_path: Option<String>,
    pub before: String,
    pub after: String,
    /// Seconds since the epoch, fractional.
    pub time: f64,
    pub pid: u32,
}

impl FileDiffEvent {
    pub const KIND: &'static str = "file_diff";

    pub fn new(
        path: impl Into<String>,
        abs_path: Option<&Path>,
        before: &str,
        after: &str,
    ) -> Self {
        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        Self {
            event: Self::KIND.to_string(),
            path: path.into(),
            abs_path: abs_path.map(|p| p.display().to_string()),
            before: before.to_string(),
            after: after.to_string(),
            time,
            pid: std::process::id(),
        }
    }
}

/// Receiver of file change events. Fire-and-forget.
pub trait SignalSink: Send + Sync {
    fn emit(&self, event: FileDiffEvent);
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl SignalSink for NullSink {
    fn emit(&self, event: FileDiffEvent) {
        debug!(path = %event.path, "signal disabled, dropping event");
    }
}

/// Sink that atomically replaces a JSON file with the latest event.
#[derive(Debug, Clone)]
pub struct FileSignalSink {
    path: PathBuf,
    max_bytes: usize,
}

impl FileSignalSink {
    pub fn new(path: impl Into<PathBuf>, max_bytes: usize) -> Self {
        Self {
            path: path.into(),
            max_bytes,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, mut event: FileDiffEvent) -> Result<()> {
        event.before = clip_text(&event.before, self.max_bytes);
        event.after = clip_text(&event.after, self.max_bytes);
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create signal dir {}", parent.display()))?;
        }
        let payload = serde_json::to_string(&event).context("serialize signal event")?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, payload)
            .with_context(|| format!("write temp signal {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("replace signal {}", self.path.display()))?;
        Ok(())
    }
}

impl SignalSink for FileSignalSink {
    fn emit(&self, event: FileDiffEvent) {
        let path = event.path.clone();
        match self.write(event) {
            Ok(()) => debug!(path = %path, "signal written"),
            Err(err) => warn!(path = %path, err = %format!("{err:#}"), "failed to write signal"),
        }
    }
}

/// Clip `text` to at most `max_bytes` on a char boundary, marking the cut.
pub fn clip_text(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n...[truncated]\n", &text[..end])
}
