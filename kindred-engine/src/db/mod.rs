//! Database access layer
//!
//! Query functions for every table the engine owns, plus the read-only
//! profile store. Functions take a `&mut SqliteConnection` so callers can run
//! them on a pooled connection or inside a transaction.

pub mod candidates;
pub mod connections;
pub mod messages;
pub mod notifications;
pub mod profiles;

use crate::error::Result;
use kindred_common::time;
use chrono::{DateTime, Utc};

/// Decode an optional microsecond column
pub(crate) fn opt_timestamp(micros: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    Ok(micros.map(time::from_micros).transpose()?)
}
