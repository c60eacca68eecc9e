//! Pure query-status handling for a SQL engine coordinator.
//!
//! Everything here is side-effect free:
//! - [`units`] normalizes human-readable memory and duration strings.
//! - [`record`] resolves raw status records into typed records and flattens
//!   them into persisted rows.
//! - [`matcher`] classifies records that should be cancelled.

use time::{OffsetDateTime, UtcOffset};

pub mod matcher;
pub mod record;
pub mod units;

pub use matcher::{
    match_kill_request, match_reporting_tool, parse_kill_call, select_targets, CancelPlan,
    QueryState, KILL_QUERY_PREFIX, REPORTING_TOOL_PREFIX,
};
pub use record::{
    flatten_record, flatten_value, parse_record, parse_records, FlatQueryRow, QueryStats,
    RawQueryRecord, SessionInfo, DEFAULT_LOOKUP_CATALOG,
};
pub use units::{convert_duration, convert_memory, UnitKind};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ReaperError {
    #[error("unrecognized {kind} unit in value {value:?}")]
    UnrecognizedUnit { kind: UnitKind, value: String },
    #[error("invalid numeric literal in value {value:?}")]
    InvalidNumber { value: String },
    #[error("missing field: {0}")]
    MissingField(String),
    #[error("invalid query record: {0}")]
    InvalidRecord(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Formats a timestamp as RFC3339 in UTC.
///
/// # Errors
/// Returns [`ReaperError::Serialization`] when the timestamp cannot be
/// rendered.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, ReaperError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            ReaperError::Serialization(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
