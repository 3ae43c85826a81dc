//! Human-gated patch workflow for LLM-driven edits inside a sandboxed directory.
//!
//! An agent proposes changes as unified diffs; each one is validated against the
//! current workspace before an operator is ever asked about it, and only an explicit
//! out-of-band approval applies it. Verification runs in an isolated container and
//! reports `pass`, `fail` or `error`, keeping "could not determine" apart from
//! "proven wrong".
//!
//! - **[`core`]**: Pure, deterministic logic (diff headers, patch state machine,
//!   verdict classification, artifact naming). No I/O.
//! - **[`io`]**: Side-effecting adapters (config, workspace boundary, processes,
//!   `git apply`, run sessions, signals, the verifier container).
//!
//! Orchestration modules ([`store`], [`engine`], [`review`], [`files`], [`dispatch`],
//! [`serve`]) tie the two together behind the agent-facing tool contract in [`tools`].

pub mod core;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod exit_codes;
pub mod files;
pub mod io;
pub mod logging;
pub mod review;
pub mod serve;
pub mod store;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod tools;
