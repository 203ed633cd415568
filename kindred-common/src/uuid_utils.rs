//! UUID utilities

use crate::{Error, Result};
use uuid::Uuid;

/// Generate a new UUIDv4
pub fn generate() -> Uuid {
    Uuid::new_v4()
}

/// Parse UUID from string
pub fn parse(s: &str) -> std::result::Result<Uuid, uuid::Error> {
    Uuid::parse_str(s)
}

/// Parse a UUID read back from a TEXT column
///
/// A malformed value means the row was written by something other than this
/// engine, so it surfaces as `InvalidInput` naming the column.
pub fn parse_column(column: &str, value: &str) -> Result<Uuid> {
    Uuid::parse_str(value)
        .map_err(|e| Error::InvalidInput(format!("Invalid UUID in column {}: {}", column, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_is_unique() {
        assert_ne!(generate(), generate());
    }

    #[test]
    fn test_parse_column_reports_column_name() {
        let err = parse_column("viewer_id", "not-a-uuid").unwrap_err();
        assert!(err.to_string().contains("viewer_id"));
    }

    #[test]
    fn test_parse_round_trip() {
        let id = generate();
        assert_eq!(parse(&id.to_string()).unwrap(), id);
    }
}
