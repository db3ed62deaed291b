//! Shared test utilities for foreman integration tests.
//!
//! This module provides:
//! - `TestHarness` wiring the in-memory backends into sessions
//! - Builders for manifest items and resource specs

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::TestHarness;
