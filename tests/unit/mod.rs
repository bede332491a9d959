// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Unit tests for the autoscaling operator
//!
//! This module contains unit tests for:
//! - The Differ
//! - Spec validation
//! - Status builders and conditions
//! - State machine transitions
//! - The identity registry

#[path = "../common/mod.rs"]
mod common;

mod identity;
mod validation;
