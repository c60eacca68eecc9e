use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::units::{convert_duration, convert_memory};
use crate::ReaperError;

pub const DEFAULT_LOOKUP_CATALOG: &str = "default";

/// One query-status entry from the coordinator's `/v1/query` listing.
///
/// Only the keys the log needs are modelled; anything else in the payload is
/// ignored. Missing non-optional keys fail resolution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RawQueryRecord {
    pub query_id: String,
    pub query: String,
    pub state: String,
    pub memory_pool: String,
    pub query_stats: QueryStats,
    pub session: SessionInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueryStats {
    pub blocked_reasons: Vec<String>,
    pub completed_drivers: i64,
    pub create_time: String,
    pub elapsed_time: String,
    pub end_time: Option<String>,
    pub execution_time: String,
    pub fully_blocked: bool,
    pub peak_memory_reservation: String,
    pub total_cpu_time: String,
    pub total_drivers: i64,
    pub total_memory_reservation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub catalog: Option<String>,
    pub catalog_properties: Value,
    pub prepared_statements: Value,
    pub source: String,
    pub start_time: i64,
    pub system_properties: Value,
    pub time_zone_key: Value,
    pub user: String,
}

/// Single-level row persisted in the `queries` table, keyed by `query_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlatQueryRow {
    pub query_id: String,
    pub memory_pool: String,
    pub query: String,
    pub blocked_reasons: String,
    pub completed_drivers: i64,
    pub create_time: String,
    pub elapsed_time: i64,
    pub end_time: Option<String>,
    pub execution_time: i64,
    pub fully_blocked: String,
    pub peak_mem: f64,
    pub total_cpu_time: i64,
    pub total_drivers: i64,
    pub total_memory_reservation: f64,
    pub lookup_catalog: String,
    pub catalog_properties: String,
    pub prepared_statements: String,
    pub source: String,
    pub start_time: i64,
    pub system_properties: String,
    pub time_zone_key: String,
    pub presto_user: String,
    pub query_state: String,
}

/// Resolves one raw JSON entry into a [`RawQueryRecord`].
///
/// # Errors
/// Returns [`ReaperError::MissingField`] when a required key is absent and
/// [`ReaperError::InvalidRecord`] when a key has the wrong shape.
pub fn parse_record(value: &Value) -> Result<RawQueryRecord, ReaperError> {
    RawQueryRecord::deserialize(value).map_err(|err| {
        let label = match value.get("queryId").and_then(Value::as_str) {
            Some(query_id) => format!("query {query_id}"),
            None => "query <unknown id>".to_string(),
        };
        classify_decode_error(&label, &err)
    })
}

/// Resolves the full `/v1/query` payload. The payload must be a JSON array;
/// the first malformed entry fails the whole batch.
///
/// # Errors
/// Returns [`ReaperError::InvalidRecord`] when the payload is not an array,
/// or the error of the first entry that fails [`parse_record`].
pub fn parse_records(payload: &Value) -> Result<Vec<RawQueryRecord>, ReaperError> {
    let Some(entries) = payload.as_array() else {
        return Err(ReaperError::InvalidRecord(
            "query listing MUST be a JSON array".to_string(),
        ));
    };
    entries.iter().map(parse_record).collect()
}

/// Flattens a resolved record into its persisted row.
///
/// # Errors
/// Returns the unit conversion error for any duration or memory field that
/// cannot be normalized, or [`ReaperError::Serialization`] when a session
/// mapping cannot be rendered to JSON text.
pub fn flatten_record(record: &RawQueryRecord) -> Result<FlatQueryRow, ReaperError> {
    let stats = &record.query_stats;
    let session = &record.session;

    Ok(FlatQueryRow {
        query_id: record.query_id.clone(),
        memory_pool: record.memory_pool.clone(),
        query: record.query.clone(),
        blocked_reasons: stats.blocked_reasons.join(","),
        completed_drivers: stats.completed_drivers,
        create_time: stats.create_time.clone(),
        elapsed_time: convert_duration(&stats.elapsed_time)?,
        end_time: stats.end_time.clone(),
        execution_time: convert_duration(&stats.execution_time)?,
        fully_blocked: flag_text(stats.fully_blocked).to_string(),
        peak_mem: convert_memory(&stats.peak_memory_reservation)?,
        total_cpu_time: convert_duration(&stats.total_cpu_time)?,
        total_drivers: stats.total_drivers,
        total_memory_reservation: convert_memory(&stats.total_memory_reservation)?,
        lookup_catalog: session
            .catalog
            .clone()
            .unwrap_or_else(|| DEFAULT_LOOKUP_CATALOG.to_string()),
        catalog_properties: to_json_text("catalogProperties", &session.catalog_properties)?,
        prepared_statements: to_json_text("preparedStatements", &session.prepared_statements)?,
        source: session.source.clone(),
        start_time: session.start_time,
        system_properties: to_json_text("systemProperties", &session.system_properties)?,
        time_zone_key: scalar_text(&session.time_zone_key),
        presto_user: session.user.clone(),
        query_state: record.state.clone(),
    })
}

/// Resolves and flattens a raw JSON entry in one step.
///
/// # Errors
/// Returns any error from [`parse_record`] or [`flatten_record`].
pub fn flatten_value(value: &Value) -> Result<FlatQueryRow, ReaperError> {
    flatten_record(&parse_record(value)?)
}

fn classify_decode_error(label: &str, err: &serde_json::Error) -> ReaperError {
    let message = err.to_string();
    if message.starts_with("missing field") {
        ReaperError::MissingField(format!("{label}: {message}"))
    } else {
        ReaperError::InvalidRecord(format!("{label}: {message}"))
    }
}

fn to_json_text(field: &str, value: &Value) -> Result<String, ReaperError> {
    serde_json::to_string(value)
        .map_err(|err| ReaperError::Serialization(format!("failed to encode {field}: {err}")))
}

/// Capitalized flag text, the form existing query logs filter on.
fn flag_text(flag: bool) -> &'static str {
    if flag {
        "True"
    } else {
        "False"
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]

    use super::*;
    use serde_json::json;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn fixture_value() -> Value {
        json!({
            "queryId": "20240101_000000_00001_abcde",
            "query": "SELECT * FROM orders",
            "state": "RUNNING",
            "memoryPool": "general",
            "scheduled": true,
            "queryStats": {
                "blockedReasons": ["WAITING_FOR_MEMORY", "WAITING_FOR_INPUT"],
                "completedDrivers": 12,
                "createTime": "2024-01-01T00:00:00.000Z",
                "elapsedTime": "1.50m",
                "endTime": "2024-01-01T00:01:30.000Z",
                "executionTime": "1500ms",
                "fullyBlocked": false,
                "peakMemoryReservation": "512MB",
                "totalCpuTime": "250us",
                "totalDrivers": 40,
                "totalMemoryReservation": "2G"
            },
            "session": {
                "catalog": "hive",
                "catalogProperties": {"hive": {"bucket_execution_enabled": "false"}},
                "preparedStatements": {},
                "source": "presto-cli",
                "startTime": 1_704_067_200_000_i64,
                "systemProperties": {"query_max_run_time": "1h"},
                "timeZoneKey": 2072,
                "user": "analyst"
            }
        })
    }

    fn remove_path(value: &mut Value, parent: &str, key: &str) {
        let target = if parent.is_empty() {
            value.as_object_mut()
        } else {
            value.get_mut(parent).and_then(Value::as_object_mut)
        };
        match target {
            Some(map) => {
                map.remove(key);
            }
            None => panic!("fixture has no object at {parent}"),
        }
    }

    #[test]
    fn flattens_every_column() {
        let row = must_ok(flatten_value(&fixture_value()));

        assert_eq!(row.query_id, "20240101_000000_00001_abcde");
        assert_eq!(row.memory_pool, "general");
        assert_eq!(row.query, "SELECT * FROM orders");
        assert_eq!(row.blocked_reasons, "WAITING_FOR_MEMORY,WAITING_FOR_INPUT");
        assert_eq!(row.completed_drivers, 12);
        assert_eq!(row.create_time, "2024-01-01T00:00:00.000Z");
        assert_eq!(row.elapsed_time, 90);
        assert_eq!(row.end_time.as_deref(), Some("2024-01-01T00:01:30.000Z"));
        assert_eq!(row.execution_time, 1);
        assert_eq!(row.fully_blocked, "False");
        assert_eq!(row.peak_mem, 0.5);
        assert_eq!(row.total_cpu_time, 0);
        assert_eq!(row.total_drivers, 40);
        assert_eq!(row.total_memory_reservation, 2.0);
        assert_eq!(row.lookup_catalog, "hive");
        assert_eq!(
            row.catalog_properties,
            r#"{"hive":{"bucket_execution_enabled":"false"}}"#
        );
        assert_eq!(row.prepared_statements, "{}");
        assert_eq!(row.source, "presto-cli");
        assert_eq!(row.start_time, 1_704_067_200_000);
        assert_eq!(row.system_properties, r#"{"query_max_run_time":"1h"}"#);
        assert_eq!(row.time_zone_key, "2072");
        assert_eq!(row.presto_user, "analyst");
        assert_eq!(row.query_state, "RUNNING");
    }

    #[test]
    fn absent_catalog_and_end_time_use_defaults() {
        let mut value = fixture_value();
        remove_path(&mut value, "session", "catalog");
        remove_path(&mut value, "queryStats", "endTime");

        let row = must_ok(flatten_value(&value));
        assert_eq!(row.lookup_catalog, DEFAULT_LOOKUP_CATALOG);
        assert_eq!(row.end_time, None);
    }

    #[test]
    fn fully_blocked_is_stored_capitalized() {
        let mut value = fixture_value();
        value["queryStats"]["fullyBlocked"] = json!(true);
        let row = must_ok(flatten_value(&value));
        assert_eq!(row.fully_blocked, "True");
    }

    #[test]
    fn null_and_absent_catalog_both_use_the_default() {
        let mut explicit_null = fixture_value();
        explicit_null["session"]["catalog"] = Value::Null;
        let mut absent = fixture_value();
        remove_path(&mut absent, "session", "catalog");

        let from_null = must_ok(flatten_value(&explicit_null));
        let from_absent = must_ok(flatten_value(&absent));
        assert_eq!(from_null.lookup_catalog, DEFAULT_LOOKUP_CATALOG);
        assert_eq!(from_absent.lookup_catalog, DEFAULT_LOOKUP_CATALOG);
    }

    #[test]
    fn empty_blocked_reasons_join_to_empty_text() {
        let mut value = fixture_value();
        value["queryStats"]["blockedReasons"] = json!([]);
        let row = must_ok(flatten_value(&value));
        assert_eq!(row.blocked_reasons, "");
    }

    #[test]
    fn missing_session_user_is_a_missing_field_error() {
        let mut value = fixture_value();
        remove_path(&mut value, "session", "user");

        match flatten_value(&value) {
            Err(ReaperError::MissingField(message)) => {
                assert!(message.contains("user"), "message={message}");
                assert!(message.contains("20240101_000000_00001_abcde"), "message={message}");
            }
            other => panic!("expected missing field error, got {other:?}"),
        }
    }

    #[test]
    fn missing_nested_mapping_is_a_missing_field_error() {
        let mut value = fixture_value();
        remove_path(&mut value, "session", "systemProperties");
        assert!(matches!(
            flatten_value(&value),
            Err(ReaperError::MissingField(_))
        ));
    }

    #[test]
    fn wrong_shape_is_an_invalid_record_error() {
        let mut value = fixture_value();
        value["queryStats"]["completedDrivers"] = json!("twelve");
        assert!(matches!(
            flatten_value(&value),
            Err(ReaperError::InvalidRecord(_))
        ));
    }

    #[test]
    fn bad_unit_in_stats_fails_the_row() {
        let mut value = fixture_value();
        value["queryStats"]["peakMemoryReservation"] = json!("12XQ");
        assert!(matches!(
            flatten_value(&value),
            Err(ReaperError::UnrecognizedUnit { .. })
        ));
    }

    #[test]
    fn string_time_zone_key_is_copied_verbatim() {
        let mut value = fixture_value();
        value["session"]["timeZoneKey"] = json!("UTC");
        let row = must_ok(flatten_value(&value));
        assert_eq!(row.time_zone_key, "UTC");
    }

    #[test]
    fn flattening_is_deterministic() {
        let record = must_ok(parse_record(&fixture_value()));
        let first = must_ok(flatten_record(&record));
        let second = must_ok(flatten_record(&record));
        assert_eq!(first, second);
    }

    #[test]
    fn listing_must_be_an_array() {
        assert!(matches!(
            parse_records(&json!({"queryId": "x"})),
            Err(ReaperError::InvalidRecord(_))
        ));

        let parsed = must_ok(parse_records(&json!([fixture_value(), fixture_value()])));
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn one_malformed_entry_fails_the_listing() {
        let mut broken = fixture_value();
        remove_path(&mut broken, "", "memoryPool");
        assert!(matches!(
            parse_records(&json!([fixture_value(), broken])),
            Err(ReaperError::MissingField(_))
        ));
    }
}
