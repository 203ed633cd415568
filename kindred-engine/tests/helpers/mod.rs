//! Test Helper Utilities
//!
//! Shared setup for kindred-engine integration tests

#![allow(dead_code)]

pub mod harness;

pub use harness::{connect_pair, profile, start_time, TestEngine};
