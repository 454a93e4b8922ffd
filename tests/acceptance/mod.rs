//! Acceptance tests for the real-time core.
//!
//! These tests verify wall-clock behavior of the assembled runtime:
//! - Cycle timing and jitter of the cyclic worker
//! - Bounded shutdown and fault reporting
//! - Long-duration lossless streaming over the SPSC queue (soak)
//!
//! Tests needing RT privileges or long run times are `#[ignore]`d.

mod common;
mod latency_test;
mod shutdown_test;
mod soak_test;
