//! Recoverable tool-call failures.
//!
//! Everything here is turned into a structured result for the conversation; none
//! of it ends the process. Infrastructure faults that do end it stay `anyhow`.

use serde::Serialize;

use crate::core::verdict::Verdict;
use crate::io::workspace::ContainmentError;

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error(transparent)]
    Containment(#[from] ContainmentError),
    #[error("'{0}' already exists; modify existing files with propose_patch")]
    FileExists(String),
    #[error("'{0}' not found")]
    NotFound(String),
    #[error("{0}")]
    Policy(String),
    #[error("patch {seq} failed validation: {reason}")]
    ValidationFailure { seq: u32, reason: String },
    #[error("patch {seq} failed to apply: {reason}")]
    ApplyFailure { seq: u32, reason: String },
    #[error("patch {seq} is already applied; approving it again does nothing")]
    DuplicateApplyAttempt { seq: u32 },
    #[error("no validated patch is waiting for approval")]
    NoPendingPatch,
    #[error("latest valid patch {seq} is no longer pending")]
    PatchNotPending { seq: u32 },
    #[error("verification found a violated property")]
    VerificationFailure(Verdict),
    #[error("verification could not reach a result")]
    VerificationError(Verdict),
    #[error("verification budget of {limit} run(s) for this turn is used up")]
    VerificationBudgetExhausted { limit: u32 },
    #[error("{0:#}")]
    Io(anyhow::Error),
}

impl ToolError {
    /// Stable machine-readable code.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownTool(_) => "unknown_tool",
            Self::InvalidArguments(_) => "invalid_arguments",
            Self::Containment(_) => "containment_violation",
            Self::FileExists(_) => "file_exists",
            Self::NotFound(_) => "not_found",
            Self::Policy(_) => "policy_violation",
            Self::ValidationFailure { .. } => "validation_failure",
            Self::ApplyFailure { .. } => "apply_failure",
            Self::DuplicateApplyAttempt { .. } => "duplicate_apply_attempt",
            Self::NoPendingPatch => "no_pending_patch",
            Self::PatchNotPending { .. } => "patch_not_pending",
            Self::VerificationFailure(_) => "verification_failure",
            Self::VerificationError(_) => "verification_error",
            Self::VerificationBudgetExhausted { .. } => "verification_budget_exhausted",
            Self::Io(_) => "io",
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        let verdict = match self {
            Self::VerificationFailure(v) | Self::VerificationError(v) => Some(v.clone()),
            _ => None,
        };
        ErrorPayload {
            kind: self.kind(),
            message: self.to_string(),
            verdict,
        }
    }
}

impl From<anyhow::Error> for ToolError {
    fn from(err: anyhow::Error) -> Self {
        Self::Io(err)
    }
}

/// Wire form of a [`ToolError`].
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub kind: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
}
