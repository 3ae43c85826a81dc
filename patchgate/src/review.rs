//! Approval boundary between a validated patch and the live workspace.
//!
//! The engine never asks anyone anything. A driver obtains a [`Decision`] from
//! whatever front end it has (stdin token, test script, editor button) and calls
//! [`review_latest`]; only [`Decision::Affirm`] reaches `approve_latest`.

use serde::Serialize;
use tracing::info;

use crate::core::patch::Patch;
use crate::engine::{Applied, PatchEngine};
use crate::error::ToolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Affirm,
    Deny,
}

/// Interpret an operator token. Only `yes`/`y` affirm; everything else denies.
pub fn parse_token(token: &str) -> Decision {
    match token.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Decision::Affirm,
        _ => Decision::Deny,
    }
}

/// Source of approval decisions for pending patches.
pub trait ApprovalGate {
    fn decide(&self, pending: &Patch) -> Decision;
}

/// Gate holding a decision that was already supplied out of band.
#[derive(Debug, Clone, Copy)]
pub struct TokenGate(pub Decision);

impl TokenGate {
    pub fn from_token(token: &str) -> Self {
        Self(parse_token(token))
    }
}

impl ApprovalGate for TokenGate {
    fn decide(&self, _pending: &Patch) -> Decision {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReviewOutcome {
    Applied(Applied),
    /// Declined; the patch stays valid and can still be approved later.
    Declined { patch_id: u32 },
}

/// Put the latest valid patch in front of `gate` and act on the answer.
///
/// A latest valid patch that was already applied is reported as a duplicate
/// without consulting the gate.
pub fn review_latest(
    engine: &PatchEngine,
    gate: &dyn ApprovalGate,
) -> Result<ReviewOutcome, ToolError> {
    let Some(pending) = engine.pending() else {
        // Let the engine pick the precise error (none, duplicate, not pending).
        return engine.approve_latest().map(ReviewOutcome::Applied);
    };
    match gate.decide(&pending) {
        Decision::Affirm => engine.approve_latest().map(ReviewOutcome::Applied),
        Decision::Deny => {
            info!(seq = pending.seq, "patch declined by operator");
            Ok(ReviewOutcome::Declined {
                patch_id: pending.seq,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::patch::Validation;
    use crate::test_support::{RecordingSink, ScriptedGate, TestSandbox, replace_diff};
    use std::sync::Arc;

    #[test]
    fn tokens() {
        assert_eq!(parse_token("yes"), Decision::Affirm);
        assert_eq!(parse_token(" Y \n"), Decision::Affirm);
        assert_eq!(parse_token("YES"), Decision::Affirm);
        assert_eq!(parse_token("no"), Decision::Deny);
        assert_eq!(parse_token("yes please"), Decision::Deny);
        assert_eq!(parse_token(""), Decision::Deny);
    }

    #[test]
    fn deny_leaves_patch_valid_and_workspace_unchanged() {
        let sandbox = TestSandbox::new();
        sandbox.write("a.txt", "one\n");
        let engine = sandbox.engine(Arc::new(RecordingSink::default()));
        engine.propose(&replace_diff("a.txt", "one\n", "two\n")).expect("propose");

        let outcome = review_latest(&engine, &TokenGate::from_token("no")).expect("review");
        assert_eq!(outcome, ReviewOutcome::Declined { patch_id: 1 });
        assert_eq!(sandbox.read("a.txt"), "one\n");
        let patch = engine.session().store().get(1).expect("patch");
        assert_eq!(patch.validation, Validation::Valid);
        assert!(patch.is_pending_approval());

        let outcome = review_latest(&engine, &TokenGate::from_token("y")).expect("review");
        assert!(matches!(outcome, ReviewOutcome::Applied(_)));
        assert_eq!(sandbox.read("a.txt"), "two\n");
    }

    #[test]
    fn gate_is_not_consulted_without_a_pending_patch() {
        let sandbox = TestSandbox::new();
        let engine = sandbox.engine(Arc::new(RecordingSink::default()));
        let gate = ScriptedGate::new([Decision::Affirm]);

        let err = review_latest(&engine, &gate).unwrap_err();
        assert_eq!(err.kind(), "no_pending_patch");
        assert!(gate.asked().is_empty());
    }

    #[test]
    fn gate_sees_the_latest_valid_patch() {
        let sandbox = TestSandbox::new();
        sandbox.write("a.txt", "one\n");
        let engine = sandbox.engine(Arc::new(RecordingSink::default()));
        engine.propose(&replace_diff("a.txt", "one\n", "two\n")).expect("first");
        engine.propose(&replace_diff("a.txt", "one\n", "three\n")).expect("second");
        let gate = ScriptedGate::new([Decision::Affirm]);

        review_latest(&engine, &gate).expect("review");
        assert_eq!(gate.asked(), vec![2]);
        assert_eq!(sandbox.read("a.txt"), "three\n");
    }
}
