//! Probe execution: one HTTP request in, one classified outcome out.

pub mod engine;
pub mod selftest;
pub mod sse;

pub use engine::{ProbeEngine, ProbeOutcome};
pub use selftest::SelfTestEngine;
