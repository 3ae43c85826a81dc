//! Deterministic, pure logic shared by the patch workflow.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod diff;
pub mod naming;
pub mod patch;
pub mod verdict;
