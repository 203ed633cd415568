//! # Kindred Common Library
//!
//! Shared code for the Kindred friendship engine including:
//! - Domain models (profiles, matches, connections, messages, notifications)
//! - Database initialization and schema
//! - Event types (KindredEvent enum) and the EventBus
//! - Configuration loading
//! - Time source abstraction and UUID helpers

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod models;
pub mod time;
pub mod uuid_utils;

pub use error::{Error, Result};
pub use models::PairKey;
pub use time::{ManualTimeSource, SystemTimeSource, TimeSource};
