//! Database value parsing utilities
//!
//! Provides error-safe parsing of stored values.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Error as SqlError;
use uuid::Uuid;

use crate::models::{MessageKind, Plan, RoomId, UserId};

/// Format a timestamp for storage.
///
/// Fixed-width (microseconds, `Z` suffix) so that text ordering in SQL
/// matches chronological ordering.
pub fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error<E>(column: usize, e: E) -> SqlError
where
    E: std::error::Error + Send + Sync + 'static,
{
    SqlError::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
}

/// Parse a UUID from a database string column
pub fn parse_uuid(s: &str) -> Result<Uuid, SqlError> {
    Uuid::parse_str(s).map_err(|e| conversion_error(0, e))
}

pub fn parse_room_id(s: &str) -> Result<RoomId, SqlError> {
    parse_uuid(s).map(RoomId)
}

pub fn parse_user_id(s: &str) -> Result<UserId, SqlError> {
    parse_uuid(s).map(UserId)
}

/// Parse a DateTime from an RFC3339 string
pub fn parse_datetime(s: &str) -> Result<DateTime<Utc>, SqlError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(0, e))
}

/// Parse the JSON `active_plan` column.
///
/// A malformed document is reported as `None` ("no plan yet") rather than
/// failing the whole room read.
pub fn parse_plan_opt(s: Option<String>) -> Option<Plan> {
    let raw = s?;
    match serde_json::from_str(&raw) {
        Ok(plan) => Some(plan),
        Err(e) => {
            tracing::warn!(error = %e, "Discarding malformed active_plan");
            None
        }
    }
}

/// Convert a stored `type` column to a message kind
pub fn kind_from_str(s: &str) -> MessageKind {
    MessageKind::parse(s).unwrap_or_default()
}

/// Extension trait for converting rusqlite Results to Option
pub trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>, SqlError>;
}

impl<T> OptionalExt<T> for Result<T, SqlError> {
    fn optional(self) -> Result<Option<T>, SqlError> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(SqlError::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_datetime_text_order_matches_time_order() {
        let early = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let late = early + chrono::Duration::microseconds(1500);

        let a = format_datetime(early);
        let b = format_datetime(late);
        assert_eq!(a.len(), b.len());
        assert!(a < b);
        assert_eq!(parse_datetime(&b).unwrap(), late);
    }

    #[test]
    fn test_malformed_plan_is_none() {
        assert!(parse_plan_opt(Some("{not json".into())).is_none());
        assert!(parse_plan_opt(None).is_none());
    }
}
