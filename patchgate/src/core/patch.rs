//! Patch artifact and its validation/apply state machine.
//!
//! ```text
//! Unchecked --dry-run ok--> Valid --approved--> Applied
//!     |                       |
//!     +--dry-run fails--> Invalid (apply: rejected)
//!                             +--apply fails--> Failed
//! ```
//!
//! `Invalid`, `Applied` and `Failed` are terminal. Transitions are checked here so
//! no caller can move a patch along an edge that does not exist.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Outcome of the dry-run check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Validation {
    Unchecked,
    Valid,
    Invalid,
}

/// Outcome of the real apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyState {
    Pending,
    Applied,
    /// Never offered for approval because validation failed.
    Rejected,
    Failed,
}

/// Captured standard streams of one apply-tool invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamCapture {
    pub stdout: String,
    pub stderr: String,
}

impl StreamCapture {
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("patch {seq} was already validated")]
    AlreadyValidated { seq: u32 },
    #[error("patch {seq} is not valid and can never be applied")]
    NotValid { seq: u32 },
    #[error("patch {seq} is already applied")]
    AlreadyApplied { seq: u32 },
    #[error("patch {seq} already failed to apply")]
    AlreadyFailed { seq: u32 },
}

/// One proposed unified diff and everything learned about it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Patch {
    pub seq: u32,
    #[serde(skip)]
    pub diff: String,
    /// SHA-256 of the diff text, hex encoded.
    pub digest: String,
    pub validation: Validation,
    pub apply: ApplyState,
    /// Workspace-relative paths the diff mutates (empty when headers did not parse).
    pub touched: Vec<String>,
    /// Why validation failed, when it failed before the apply tool ran.
    pub rejection: Option<String>,
    #[serde(skip)]
    pub check: Option<StreamCapture>,
    #[serde(skip)]
    pub applied: Option<StreamCapture>,
    pub created_at: String,
    pub validated_at: Option<String>,
    pub finished_at: Option<String>,
}

impl Patch {
    pub fn new(seq: u32, diff: impl Into<String>, created_at: impl Into<String>) -> Self {
        let diff = diff.into();
        let digest = hex::encode(Sha256::digest(diff.as_bytes()));
        Self {
            seq,
            diff,
            digest,
            validation: Validation::Unchecked,
            apply: ApplyState::Pending,
            touched: Vec::new(),
            rejection: None,
            check: None,
            applied: None,
            created_at: created_at.into(),
            validated_at: None,
            finished_at: None,
        }
    }

    /// Record the dry-run result. Happens exactly once.
    pub fn mark_validated(
        &mut self,
        valid: bool,
        capture: StreamCapture,
        at: impl Into<String>,
    ) -> Result<(), TransitionError> {
        if self.validation != Validation::Unchecked {
            return Err(TransitionError::AlreadyValidated { seq: self.seq });
        }
        self.check = Some(capture);
        self.validated_at = Some(at.into());
        if valid {
            self.validation = Validation::Valid;
        } else {
            self.validation = Validation::Invalid;
            self.apply = ApplyState::Rejected;
        }
        Ok(())
    }

    /// Mark invalid without running the apply tool (unparseable diff, policy breach).
    pub fn reject(
        &mut self,
        reason: impl Into<String>,
        at: impl Into<String>,
    ) -> Result<(), TransitionError> {
        let reason = reason.into();
        self.mark_validated(false, StreamCapture::new("", reason.clone()), at)?;
        self.rejection = Some(reason);
        Ok(())
    }

    /// Check that this patch may be applied now.
    pub fn ensure_approvable(&self) -> Result<(), TransitionError> {
        match (self.validation, self.apply) {
            (Validation::Valid, ApplyState::Pending) => Ok(()),
            (_, ApplyState::Applied) => Err(TransitionError::AlreadyApplied { seq: self.seq }),
            (_, ApplyState::Failed) => Err(TransitionError::AlreadyFailed { seq: self.seq }),
            _ => Err(TransitionError::NotValid { seq: self.seq }),
        }
    }

    pub fn mark_applied(
        &mut self,
        capture: StreamCapture,
        at: impl Into<String>,
    ) -> Result<(), TransitionError> {
        self.ensure_approvable()?;
        self.apply = ApplyState::Applied;
        self.applied = Some(capture);
        self.finished_at = Some(at.into());
        Ok(())
    }

    pub fn mark_failed(
        &mut self,
        capture: StreamCapture,
        at: impl Into<String>,
    ) -> Result<(), TransitionError> {
        self.ensure_approvable()?;
        self.apply = ApplyState::Failed;
        self.applied = Some(capture);
        self.finished_at = Some(at.into());
        Ok(())
    }

    pub fn is_pending_approval(&self) -> bool {
        self.ensure_approvable().is_ok()
    }
}
