//! # Kindred Engine
//!
//! Friendship Discovery & Connection Engine:
//! - **matching**: compatibility scoring and bounded daily match queues
//! - **lifecycle**: connection levels, milestones, requests and blocking
//! - **conversation**: ordered per-pair message log with live subscriptions
//! - **notifications**: per-recipient notification records and unread counters
//!
//! [`Engine`] wires the components over one SQLite pool.

pub mod config;
pub mod conversation;
pub mod db;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod locks;
pub mod matching;
pub mod notifications;
pub mod profiles;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{Error, Result};
