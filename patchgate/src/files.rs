//! Direct file tools: reads, directory listings and new-file creation.
//!
//! Existing files are never modified here; that only happens through an approved
//! patch. Every path goes through [`Workspace`] before the filesystem is touched.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;

use anyhow::Context;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::ToolError;
use crate::io::config::FilesConfig;
use crate::io::signal::{FileDiffEvent, SignalSink};
use crate::io::workspace::{Workspace, extension_allowed};
use crate::tools::{InitRustCrateArgs, normalize_project_dir};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FileContent {
    pub path: String,
    pub content: String,
    pub bytes: u64,
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Written {
    pub path: String,
    pub bytes: usize,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Listing {
    pub path: String,
    pub entries: Vec<DirEntry>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CrateInit {
    pub project_dir: String,
    pub crate_name: String,
    pub created: Vec<String>,
    pub existing: Vec<String>,
}

fn check_extension(path: &Path, relative: &str, cfg: &FilesConfig) -> Result<(), ToolError> {
    if extension_allowed(path, &cfg.allowed_extensions) {
        Ok(())
    } else {
        Err(ToolError::Policy(format!(
            "'{relative}' has a file type outside the allowed set ({})",
            cfg.allowed_extensions.join(", ")
        )))
    }
}

pub fn read_file(
    ws: &Workspace,
    cfg: &FilesConfig,
    relative: &str,
) -> Result<FileContent, ToolError> {
    let path = ws.resolve(relative)?;
    check_extension(&path, relative, cfg)?;
    let meta = match fs::metadata(&path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(ToolError::NotFound(relative.to_string()));
        }
        Err(err) => return Err(io_error(err, format!("stat {relative}"))),
    };
    if !meta.is_file() {
        return Err(ToolError::Policy(format!("'{relative}' is not a regular file")));
    }
    let bytes = fs::read(&path).with_context(|| format!("read {relative}"))?;
    let truncated = bytes.len() > cfg.max_bytes;
    let shown = if truncated { &bytes[..cfg.max_bytes] } else { &bytes[..] };
    let mut content = String::from_utf8_lossy(shown).into_owned();
    if truncated {
        content.push_str(&format!(
            "\n...[truncated: showing {} of {} bytes]\n",
            cfg.max_bytes,
            bytes.len()
        ));
    }
    debug!(path = relative, bytes = bytes.len(), truncated, "file read");
    Ok(FileContent {
        path: ws.relative(&path),
        content,
        bytes: meta.len(),
        truncated,
    })
}

/// Create a new file. Refuses to touch anything that already exists.
pub fn write_file(
    ws: &Workspace,
    cfg: &FilesConfig,
    signals: &dyn SignalSink,
    relative: &str,
    content: &str,
) -> Result<Written, ToolError> {
    let path = ws.resolve(relative)?;
    check_extension(&path, relative, cfg)?;
    if content.len() > cfg.max_bytes {
        return Err(ToolError::Policy(format!(
            "content is {} bytes; the limit is {}",
            content.len(),
            cfg.max_bytes
        )));
    }
    create_new(ws, &path, relative, content)?;
    let shown = ws.relative(&path);
    signals.emit(FileDiffEvent::new(shown.clone(), Some(&path), "", content));
    info!(path = %shown, bytes = content.len(), "file created");
    Ok(Written {
        path: shown,
        bytes: content.len(),
    })
}

fn create_new(ws: &Workspace, path: &Path, relative: &str, content: &str) -> Result<(), ToolError> {
    if fs::symlink_metadata(path).is_ok() {
        return Err(ToolError::FileExists(relative.to_string()));
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create parent of {relative}"))?;
        // Directories created above must still resolve inside the root.
        ws.resolve_dir(&ws.relative(parent))?;
    }
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            return Err(ToolError::FileExists(relative.to_string()));
        }
        Err(err) => return Err(io_error(err, format!("create {relative}"))),
    };
    file.write_all(content.as_bytes())
        .with_context(|| format!("write {relative}"))?;
    Ok(())
}

pub fn list_dir(ws: &Workspace, relative: &str) -> Result<Listing, ToolError> {
    let dir = ws.resolve_dir(relative)?;
    let read = match fs::read_dir(&dir) {
        Ok(read) => read,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(ToolError::NotFound(relative.to_string()));
        }
        Err(_) if dir.is_file() => {
            return Err(ToolError::Policy(format!("'{relative}' is not a directory")));
        }
        Err(err) => return Err(io_error(err, format!("list {relative}"))),
    };

    let mut entries = Vec::new();
    for entry in read {
        let entry = entry.with_context(|| format!("list {relative}"))?;
        let meta = entry
            .metadata()
            .with_context(|| format!("stat entry in {relative}"))?;
        let kind = if meta.file_type().is_symlink() {
            EntryKind::Symlink
        } else if meta.is_dir() {
            EntryKind::Dir
        } else {
            EntryKind::File
        };
        entries.push(DirEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            kind,
            size: if kind == EntryKind::File { meta.len() } else { 0 },
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(Listing {
        path: ws.relative(&dir),
        entries,
    })
}

fn validate_crate_name(name: &str) -> Result<(), ToolError> {
    let ok = !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(ToolError::InvalidArguments(format!("invalid crate name '{name}'")))
    }
}

/// Scaffold a minimal crate, creating only files that are missing.
pub fn init_rust_crate(
    ws: &Workspace,
    signals: &dyn SignalSink,
    args: &InitRustCrateArgs,
) -> Result<CrateInit, ToolError> {
    let project_dir = normalize_project_dir(&args.project_dir);
    let dir = ws.resolve_dir(&project_dir)?;
    let crate_name = match &args.crate_name {
        Some(name) => name.clone(),
        None => project_dir.rsplit('/').next().unwrap_or_default().to_string(),
    };
    validate_crate_name(&crate_name)?;

    let (entry, lib_section, body) = if args.lib {
        (
            "src/lib.rs",
            "\n[lib]\npath = \"src/lib.rs\"\n",
            "pub fn placeholder() -> i32 {\n    0\n}\n",
        )
    } else {
        ("src/main.rs", "", "fn main() {\n    println!(\"hello\");\n}\n")
    };
    let manifest = format!(
        "[package]\nname = \"{crate_name}\"\nversion = \"0.1.0\"\nedition = \"2021\"\n{lib_section}"
    );

    let mut created = Vec::new();
    let mut existing = Vec::new();
    for (file, contents) in [("Cargo.toml", manifest.as_str()), (entry, body)] {
        let relative = if project_dir.is_empty() {
            file.to_string()
        } else {
            format!("{project_dir}/{file}")
        };
        let path = ws.resolve(&relative)?;
        match create_new(ws, &path, &relative, contents) {
            Ok(()) => {
                signals.emit(FileDiffEvent::new(relative.clone(), Some(&path), "", contents));
                created.push(relative);
            }
            Err(ToolError::FileExists(_)) => existing.push(relative),
            Err(err) => return Err(err),
        }
    }
    info!(project = %ws.relative(&dir), created = created.len(), "crate initialized");
    Ok(CrateInit {
        project_dir,
        crate_name,
        created,
        existing,
    })
}

fn io_error(err: std::io::Error, what: String) -> ToolError {
    ToolError::Io(anyhow::Error::new(err).context(what))
}
