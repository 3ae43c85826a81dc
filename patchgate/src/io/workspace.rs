//! Workspace boundary: every path a tool touches is resolved here first.
//!
//! Resolution is lexical first (no `..` may climb above the root), then physical:
//! each existing prefix of the path is checked with `symlink_metadata`, and any
//! symlink found is canonicalized and must still land under the canonical root.
//! A dangling symlink counts as an escape. Nothing is ever clamped.

use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContainmentError {
    #[error("absolute paths are not allowed: '{0}'")]
    Absolute(String),
    #[error("path escapes the sandbox: '{0}'")]
    Escapes(String),
    #[error("path '{path}' resolves through a symlink outside the sandbox")]
    SymlinkEscape { path: String },
    #[error("path must not be empty")]
    Empty,
}

/// Sandbox root with containment-checked path resolution.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Open an existing sandbox root. A missing root is an infrastructure fault.
    pub fn open(root: &Path) -> Result<Self> {
        let root = fs::canonicalize(root)
            .with_context(|| format!("sandbox root {} does not exist", root.display()))?;
        if !root.is_dir() {
            return Err(anyhow!("sandbox root {} is not a directory", root.display()));
        }
        debug!(root = %root.display(), "workspace opened");
        Ok(Self { root })
    }

    /// Canonical sandbox root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a workspace-relative file path.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, ContainmentError> {
        let resolved = self.resolve_dir(relative)?;
        if resolved == self.root {
            return Err(ContainmentError::Empty);
        }
        Ok(resolved)
    }

    /// Resolve a workspace-relative directory; `""` and `"."` name the root itself.
    pub fn resolve_dir(&self, relative: &str) -> Result<PathBuf, ContainmentError> {
        let normalized = normalize(relative)?;
        let candidate = self.root.join(&normalized);
        self.check_physical(&candidate, relative)?;
        Ok(candidate)
    }

    /// Path relative to the root, `/`-separated, for display and events.
    pub fn relative(&self, absolute: &Path) -> String {
        absolute
            .strip_prefix(&self.root)
            .unwrap_or(absolute)
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }

    fn check_physical(&self, candidate: &Path, original: &str) -> Result<(), ContainmentError> {
        let Ok(suffix) = candidate.strip_prefix(&self.root) else {
            return Err(ContainmentError::Escapes(original.to_string()));
        };
        let mut current = self.root.clone();
        for component in suffix.components() {
            current.push(component);
            let meta = match fs::symlink_metadata(&current) {
                Ok(meta) => meta,
                // Nothing below a missing component exists, so nothing can link out.
                Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
                Err(_) => return Err(ContainmentError::Escapes(original.to_string())),
            };
            if meta.file_type().is_symlink() {
                let target = fs::canonicalize(&current).map_err(|_| {
                    ContainmentError::SymlinkEscape {
                        path: original.to_string(),
                    }
                })?;
                if !target.starts_with(&self.root) {
                    debug!(path = original, target = %target.display(), "symlink escape");
                    return Err(ContainmentError::SymlinkEscape {
                        path: original.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Lexically normalize a relative path, refusing to climb above its start.
fn normalize(relative: &str) -> Result<PathBuf, ContainmentError> {
    let path = Path::new(relative);
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => {
                return Err(ContainmentError::Absolute(relative.to_string()));
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return Err(ContainmentError::Escapes(relative.to_string()));
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }
    Ok(out)
}

/// File extension policy shared by file tools. Empty allows everything.
pub fn extension_allowed(path: &Path, allowed: &[String]) -> bool {
    if allowed.is_empty() {
        return true;
    }
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| allowed.iter().any(|a| a.eq_ignore_ascii_case(ext)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> (tempfile::TempDir, Workspace) {
        let temp = tempfile::tempdir().expect("tempdir");
        let ws = Workspace::open(temp.path()).expect("open");
        (temp, ws)
    }

    #[test]
    fn missing_root_is_fatal() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = Workspace::open(&temp.path().join("nope")).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn resolves_nested_and_dotted_paths() {
        let (_temp, ws) = workspace();
        let resolved = ws.resolve("src/./sub/../lib.rs").expect("resolve");
        assert_eq!(resolved, ws.root().join("src/lib.rs"));
        assert_eq!(ws.relative(&resolved), "src/lib.rs");
    }

    #[test]
    fn rejects_parent_escape_and_absolute_paths() {
        let (_temp, ws) = workspace();
        assert_eq!(
            ws.resolve("../outside.rs"),
            Err(ContainmentError::Escapes("../outside.rs".to_string()))
        );
        assert_eq!(
            ws.resolve("a/../../b.rs"),
            Err(ContainmentError::Escapes("a/../../b.rs".to_string()))
        );
        assert!(matches!(
            ws.resolve("/etc/passwd"),
            Err(ContainmentError::Absolute(_))
        ));
    }

    #[test]
    fn root_is_a_directory_but_not_a_file() {
        let (_temp, ws) = workspace();
        assert_eq!(ws.resolve_dir("").expect("root"), ws.root());
        assert_eq!(ws.resolve_dir(".").expect("root"), ws.root());
        assert_eq!(ws.resolve("."), Err(ContainmentError::Empty));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_out_of_root_is_rejected() {
        let (temp, ws) = workspace();
        let outside = tempfile::tempdir().expect("outside");
        std::os::unix::fs::symlink(outside.path(), temp.path().join("link")).expect("symlink");

        assert!(matches!(
            ws.resolve("link/secret.rs"),
            Err(ContainmentError::SymlinkEscape { .. })
        ));
        assert!(matches!(
            ws.resolve_dir("link"),
            Err(ContainmentError::SymlinkEscape { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_inside_root_and_dangling_links() {
        let (temp, ws) = workspace();
        fs::create_dir(temp.path().join("real")).expect("mkdir");
        std::os::unix::fs::symlink(temp.path().join("real"), temp.path().join("alias"))
            .expect("symlink");
        assert!(ws.resolve("alias/file.rs").is_ok());

        std::os::unix::fs::symlink("/nonexistent/target", temp.path().join("dangling"))
            .expect("symlink");
        assert!(matches!(
            ws.resolve("dangling"),
            Err(ContainmentError::SymlinkEscape { .. })
        ));
    }

    #[test]
    fn extension_policy() {
        let allowed = vec!["rs".to_string(), "md".to_string()];
        assert!(extension_allowed(Path::new("src/lib.rs"), &allowed));
        assert!(extension_allowed(Path::new("README.MD"), &allowed));
        assert!(!extension_allowed(Path::new("run.sh"), &allowed));
        assert!(!extension_allowed(Path::new("Makefile"), &allowed));
        assert!(extension_allowed(Path::new("Makefile"), &[]));
    }
}
