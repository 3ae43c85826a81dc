//! Unified diff header parsing.
//!
//! Only the structure needed to police a patch is extracted: which files it names,
//! how many hunks it carries, and which `-p` strip level the apply tool needs.
//! Hunk bodies are skipped by length so a removed line such as `-- note` is never
//! mistaken for a `---` file header.
//!
//! Git sections that carry no `---`/`+++` pair (an empty file created or deleted,
//! a pure mode change, a binary patch) are registered from their `diff --git`
//! line, so every file the apply tool would touch shows up in the summary.

use std::sync::LazyLock;

use regex::Regex;

static HUNK_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").expect("static hunk regex")
});

/// One file section of a diff. `None` means `/dev/null`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileChange {
    pub old_path: Option<String>,
    pub new_path: Option<String>,
    /// `old mode`/`new mode` extended headers present.
    pub mode_change: bool,
    /// Binary payload instead of text hunks.
    pub binary: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Modify,
    Create,
    Delete,
    Rename,
}

impl FileChange {
    pub fn kind(&self) -> ChangeKind {
        match (&self.old_path, &self.new_path) {
            (None, _) => ChangeKind::Create,
            (Some(_), None) => ChangeKind::Delete,
            (Some(old), Some(new)) if old != new => ChangeKind::Rename,
            _ => ChangeKind::Modify,
        }
    }

    /// Workspace-relative path this section mutates.
    pub fn target(&self) -> &str {
        self.new_path
            .as_deref()
            .or(self.old_path.as_deref())
            .unwrap_or_default()
    }
}

/// Structural summary of a unified diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffSummary {
    pub files: Vec<FileChange>,
    pub hunks: usize,
    /// Leading path components the apply tool must strip (`-p`).
    pub strip: u8,
    /// Paths named by git `rename`/`copy` extended headers.
    pub copied_or_renamed: Vec<String>,
}

impl DiffSummary {
    /// Every distinct path named anywhere in the diff, in first-seen order.
    pub fn all_paths(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let named = self
            .files
            .iter()
            .flat_map(|f| [f.old_path.as_ref(), f.new_path.as_ref()])
            .flatten()
            .chain(self.copied_or_renamed.iter());
        for path in named {
            if !out.contains(path) {
                out.push(path.clone());
            }
        }
        out
    }

    /// Distinct mutation targets, in first-seen order.
    pub fn targets(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for file in &self.files {
            let target = file.target().to_string();
            if !out.contains(&target) {
                out.push(target);
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiffParseError {
    #[error("diff names no files (expected '---' and '+++' headers)")]
    NoFiles,
    #[error("diff has file headers but no hunks")]
    NoHunks,
    #[error("line {line}: '+++' header without a preceding '---' header")]
    OrphanNewHeader { line: usize },
    #[error("line {line}: hunk header before any file header")]
    HunkWithoutFile { line: usize },
    #[error("line {line}: malformed hunk header '{text}'")]
    BadHunkHeader { line: usize, text: String },
    #[error("line {line}: hunk body ends early ({old} old / {new} new lines missing)")]
    TruncatedHunk { line: usize, old: u32, new: u32 },
    #[error("line {line}: empty path in file header")]
    EmptyPath { line: usize },
    #[error("line {line}: cannot read paths from '{text}'")]
    BadGitHeader { line: usize, text: String },
}

/// `diff --git` section being read; flushed as a `FileChange` when it has no
/// `---`/`+++` pair of its own.
#[derive(Debug)]
struct GitSection {
    old: String,
    new: String,
    created: bool,
    deleted: bool,
    mode_change: bool,
    binary: bool,
}

impl GitSection {
    fn into_change(self) -> FileChange {
        FileChange {
            old_path: (!self.created).then_some(self.old),
            new_path: (!self.deleted).then_some(self.new),
            mode_change: self.mode_change,
            binary: self.binary,
        }
    }
}

/// Parse the headers of a unified diff.
pub fn parse_unified_diff(text: &str) -> Result<DiffSummary, DiffParseError> {
    let mut raw_files: Vec<FileChange> = Vec::new();
    let mut copied_or_renamed = Vec::new();
    let mut pending_old: Option<Option<String>> = None;
    let mut section: Option<GitSection> = None;
    let mut hunks = 0usize;
    let mut remaining_old = 0u32;
    let mut remaining_new = 0u32;
    let mut last_line = 0usize;

    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        last_line = line_no;

        if remaining_old > 0 || remaining_new > 0 {
            match line.chars().next() {
                Some(' ') | None => {
                    remaining_old = remaining_old.saturating_sub(1);
                    remaining_new = remaining_new.saturating_sub(1);
                    continue;
                }
                Some('-') => {
                    remaining_old = remaining_old.saturating_sub(1);
                    continue;
                }
                Some('+') => {
                    remaining_new = remaining_new.saturating_sub(1);
                    continue;
                }
                Some('\\') => continue,
                Some(_) => {
                    return Err(DiffParseError::TruncatedHunk {
                        line: line_no,
                        old: remaining_old,
                        new: remaining_new,
                    });
                }
            }
        }

        if let Some(rest) = line.strip_prefix("diff --git ") {
            raw_files.extend(section.take().map(GitSection::into_change));
            let (old, new) = split_git_paths(rest).ok_or_else(|| DiffParseError::BadGitHeader {
                line: line_no,
                text: line.to_string(),
            })?;
            section = Some(GitSection {
                old,
                new,
                created: false,
                deleted: false,
                mode_change: false,
                binary: false,
            });
        } else if let Some(rest) = line.strip_prefix("--- ") {
            pending_old = Some(parse_header_path(rest, line_no)?);
        } else if let Some(rest) = line.strip_prefix("+++ ") {
            let old = pending_old
                .take()
                .ok_or(DiffParseError::OrphanNewHeader { line: line_no })?;
            let new = parse_header_path(rest, line_no)?;
            let git = section.take();
            raw_files.push(FileChange {
                old_path: old,
                new_path: new,
                mode_change: git.as_ref().is_some_and(|g| g.mode_change),
                binary: git.as_ref().is_some_and(|g| g.binary),
            });
        } else if let Some(git) = section.as_mut().filter(|_| is_extended_header(line)) {
            if line.starts_with("new file mode ") {
                git.created = true;
            } else if line.starts_with("deleted file mode ") {
                git.deleted = true;
            } else if line.starts_with("old mode ") || line.starts_with("new mode ") {
                git.mode_change = true;
            } else if line.starts_with("Binary files ") || line == "GIT binary patch" {
                git.binary = true;
            }
            if let Some(path) = copy_or_rename_path(line) {
                copied_or_renamed.push(unquote(path.trim()).to_string());
            }
        } else if line.starts_with("@@") {
            if raw_files.is_empty() {
                return Err(DiffParseError::HunkWithoutFile { line: line_no });
            }
            let caps = HUNK_HEADER
                .captures(line)
                .ok_or_else(|| DiffParseError::BadHunkHeader {
                    line: line_no,
                    text: line.to_string(),
                })?;
            remaining_old = hunk_len(caps.get(2).map(|m| m.as_str()));
            remaining_new = hunk_len(caps.get(4).map(|m| m.as_str()));
            hunks += 1;
        } else if let Some(path) = copy_or_rename_path(line) {
            copied_or_renamed.push(unquote(path.trim()).to_string());
        }
    }
    raw_files.extend(section.take().map(GitSection::into_change));

    if remaining_old > 0 || remaining_new > 0 {
        return Err(DiffParseError::TruncatedHunk {
            line: last_line,
            old: remaining_old,
            new: remaining_new,
        });
    }
    if raw_files.is_empty() {
        return Err(DiffParseError::NoFiles);
    }
    if hunks == 0 {
        return Err(DiffParseError::NoHunks);
    }

    let strip = strip_level(&raw_files);
    let files = raw_files
        .into_iter()
        .map(|file| FileChange {
            old_path: file.old_path.map(|p| strip_components(&p, strip)),
            new_path: file.new_path.map(|p| strip_components(&p, strip)),
            ..file
        })
        .collect();

    Ok(DiffSummary {
        files,
        hunks,
        strip,
        copied_or_renamed,
    })
}

fn hunk_len(raw: Option<&str>) -> u32 {
    raw.and_then(|s| s.parse().ok()).unwrap_or(1)
}

fn is_extended_header(line: &str) -> bool {
    const PREFIXES: [&str; 13] = [
        "new file mode ",
        "deleted file mode ",
        "old mode ",
        "new mode ",
        "index ",
        "similarity index ",
        "dissimilarity index ",
        "rename from ",
        "rename to ",
        "copy from ",
        "copy to ",
        "Binary files ",
        "GIT binary patch",
    ];
    PREFIXES.iter().any(|prefix| line.starts_with(prefix))
}

fn copy_or_rename_path(line: &str) -> Option<&str> {
    ["rename from ", "rename to ", "copy from ", "copy to "]
        .iter()
        .find_map(|prefix| line.strip_prefix(prefix))
}

/// Split the two paths of a `diff --git` line, prefixes kept.
///
/// Unquoted paths may contain spaces, so the split point is the one that makes
/// both sides name the same file; otherwise the first ` b/`.
fn split_git_paths(rest: &str) -> Option<(String, String)> {
    if let Some(quoted) = rest.strip_prefix('"') {
        let (old, tail) = quoted.split_once('"')?;
        return Some((old.to_string(), unquote(tail.trim()).to_string()));
    }
    if let Some((old, new)) = rest.split_once(" \"") {
        let new = new.strip_suffix('"')?;
        return Some((old.to_string(), new.to_string()));
    }
    let splits: Vec<usize> = rest.match_indices(" b/").map(|(idx, _)| idx).collect();
    let same_file = splits
        .iter()
        .copied()
        .find(|&idx| rest[..idx].get(2..) == rest[idx + 1..].get(2..));
    if let Some(idx) = same_file.or_else(|| splits.first().copied()) {
        return Some((rest[..idx].to_string(), rest[idx + 1..].to_string()));
    }
    // `--no-prefix` output: only the same-name case can be split reliably.
    let mid = rest.len() / 2;
    if rest.len() % 2 == 1
        && rest.as_bytes().get(mid) == Some(&b' ')
        && rest[..mid] == rest[mid + 1..]
    {
        return Some((rest[..mid].to_string(), rest[mid + 1..].to_string()));
    }
    None
}

/// Header path without trailing timestamp or quoting. `None` for `/dev/null`.
fn parse_header_path(rest: &str, line: usize) -> Result<Option<String>, DiffParseError> {
    let path = rest.split('\t').next().unwrap_or_default().trim();
    let path = unquote(path);
    if path.is_empty() {
        return Err(DiffParseError::EmptyPath { line });
    }
    if path == "/dev/null" {
        return Ok(None);
    }
    Ok(Some(path.to_string()))
}

fn unquote(path: &str) -> &str {
    path.strip_prefix('"')
        .and_then(|p| p.strip_suffix('"'))
        .unwrap_or(path)
}

/// `1` when every named path carries a git-style `a/` or `b/` prefix.
fn strip_level(files: &[FileChange]) -> u8 {
    let all_prefixed = files
        .iter()
        .flat_map(|f| [f.old_path.as_deref(), f.new_path.as_deref()])
        .flatten()
        .all(|p| p.starts_with("a/") || p.starts_with("b/"));
    u8::from(all_prefixed)
}

fn strip_components(path: &str, strip: u8) -> String {
    let mut rest = path;
    for _ in 0..strip {
        match rest.split_once('/') {
            Some((_, tail)) => rest = tail,
            None => break,
        }
    }
    rest.to_string()
}
