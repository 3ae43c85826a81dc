//! Side-effecting adapters for the patch workflow.

pub mod config;
pub mod git_apply;
pub mod process;
pub mod session;
pub mod signal;
pub mod verifier;
pub mod workspace;
