//! Run sessions: one durable directory per invocation under the runs root.
//!
//! ```text
//! runs/run-Mon-20240101-1704067200[-tag]/
//!   session.json          written once at start
//!   patches/patch-0001.diff
//!   patches/patch-0001.check.out|.check.err
//!   patches/patch-0001.apply.out|.apply.err
//!   patches/patch-0001.json   rewritten on each transition
//!   verify/verify-0001.log
//! ```

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::core::naming::{patch_stem, run_dir_name, validate_tag, verify_log_name};
use crate::core::patch::Patch;
use crate::io::config::EnvSnapshot;
use crate::store::PatchStore;

/// Contents of `session.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionMeta {
    pub session_id: String,
    pub model: String,
    pub sandbox_root: PathBuf,
    pub run_dir: PathBuf,
    pub created_at: String,
    pub created_unix: i64,
    pub tag: Option<String>,
    /// Environment keys consulted at startup, with the values seen.
    pub env: EnvSnapshot,
    pub tool_version: String,
}

/// Inputs for [`RunSession::start`].
#[derive(Debug, Clone)]
pub struct SessionInit<'a> {
    pub runs_root: &'a Path,
    pub sandbox_root: &'a Path,
    pub model: &'a str,
    pub tag: Option<&'a str>,
    pub env: EnvSnapshot,
}

/// Artifact paths for one patch.
#[derive(Debug, Clone)]
pub struct PatchPaths {
    pub diff: PathBuf,
    pub check_out: PathBuf,
    pub check_err: PathBuf,
    pub apply_out: PathBuf,
    pub apply_err: PathBuf,
    pub record: PathBuf,
}

impl PatchPaths {
    pub fn new(patches_dir: &Path, seq: u32) -> Self {
        let stem = patch_stem(seq);
        let file = |suffix: &str| patches_dir.join(format!("{stem}.{suffix}"));
        Self {
            diff: file("diff"),
            check_out: file("check.out"),
            check_err: file("check.err"),
            apply_out: file("apply.out"),
            apply_err: file("apply.err"),
            record: file("json"),
        }
    }
}

/// One agent invocation. Owns its patch store, so sessions never share counters.
#[derive(Debug)]
pub struct RunSession {
    meta: SessionMeta,
    dir: PathBuf,
    patches_dir: PathBuf,
    verify_dir: PathBuf,
    store: PatchStore,
    verify_seq: AtomicU32,
}

impl RunSession {
    pub fn start(init: SessionInit<'_>) -> Result<Self> {
        Self::start_at(init, Utc::now())
    }

    /// Create the run directory for a given creation instant.
    ///
    /// The directory must not exist yet; two sessions never share one.
    #[instrument(skip_all, fields(runs_root = %init.runs_root.display()))]
    pub fn start_at(init: SessionInit<'_>, created: DateTime<Utc>) -> Result<Self> {
        if let Some(tag) = init.tag {
            validate_tag(tag).map_err(anyhow::Error::msg)?;
        }
        let session_id = run_dir_name(created, init.tag);
        fs::create_dir_all(init.runs_root)
            .with_context(|| format!("create runs root {}", init.runs_root.display()))?;
        let dir = init.runs_root.join(&session_id);
        fs::create_dir(&dir).with_context(|| format!("create run directory {}", dir.display()))?;
        let patches_dir = dir.join("patches");
        let verify_dir = dir.join("verify");
        for sub in [&patches_dir, &verify_dir] {
            fs::create_dir(sub).with_context(|| format!("create {}", sub.display()))?;
        }

        let meta = SessionMeta {
            session_id: session_id.clone(),
            model: init.model.to_string(),
            sandbox_root: init.sandbox_root.to_path_buf(),
            run_dir: dir.clone(),
            created_at: created.to_rfc3339_opts(SecondsFormat::Secs, true),
            created_unix: created.timestamp(),
            tag: init.tag.map(str::to_string),
            env: init.env,
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
        };
        write_once(&dir.join("session.json"), &meta)?;
        info!(session_id = %session_id, dir = %dir.display(), "run session started");

        Ok(Self {
            meta,
            dir,
            patches_dir,
            verify_dir,
            store: PatchStore::new(),
            verify_seq: AtomicU32::new(0),
        })
    }

    pub fn id(&self) -> &str {
        &self.meta.session_id
    }

    pub fn meta(&self) -> &SessionMeta {
        &self.meta
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn patches_dir(&self) -> &Path {
        &self.patches_dir
    }

    pub fn store(&self) -> &PatchStore {
        &self.store
    }

    /// Delegates to the store's serialized counter.
    pub fn next_patch_id(&self) -> u32 {
        self.store.next_patch_id()
    }

    pub fn patch_paths(&self, seq: u32) -> PatchPaths {
        PatchPaths::new(&self.patches_dir, seq)
    }

    /// Write whatever artifacts `patch` has accumulated so far.
    ///
    /// The diff and stream logs are written when first known and then left alone;
    /// only the JSON record is replaced as the patch moves through its states.
    pub fn persist(&self, patch: &Patch) -> Result<PatchPaths> {
        let paths = self.patch_paths(patch.seq);
        if !paths.diff.exists() {
            write_text(&paths.diff, &patch.diff)?;
        }
        if let Some(check) = &patch.check
            && !paths.check_out.exists()
        {
            write_text(&paths.check_out, &check.stdout)?;
            write_text(&paths.check_err, &check.stderr)?;
        }
        if let Some(applied) = &patch.applied
            && !paths.apply_out.exists()
        {
            write_text(&paths.apply_out, &applied.stdout)?;
            write_text(&paths.apply_err, &applied.stderr)?;
        }
        let mut record = serde_json::to_string_pretty(patch).context("serialize patch record")?;
        record.push('\n');
        write_atomic(&paths.record, &record)?;
        debug!(
            seq = patch.seq,
            validation = ?patch.validation,
            apply = ?patch.apply,
            "patch persisted"
        );
        Ok(paths)
    }

    /// Echo a verification result into `verify/verify-NNNN.log`.
    pub fn write_verify_log(&self, contents: &str) -> Result<PathBuf> {
        let seq = self.verify_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let path = self.verify_dir.join(verify_log_name(seq));
        write_text(&path, contents)?;
        Ok(path)
    }
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_once<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("create {}", path.display()))?;
    file.write_all(buf.as_bytes())
        .with_context(|| format!("write {}", path.display()))
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp record {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace record {}", path.display()))?;
    Ok(())
}
