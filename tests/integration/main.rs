// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Integration tests for the autoscaling operator
//!
//! These tests drive the reconcile passes end to end against the in-memory
//! Application Auto Scaling control plane. No cluster or AWS account is
//! needed:
//!
//! ```bash
//! cargo test --test integration
//! ```

#[path = "../common/mod.rs"]
mod common;


// Test modules
mod adoption_tests;
mod policy_tests;
mod target_tests;

pub use harness::*;
