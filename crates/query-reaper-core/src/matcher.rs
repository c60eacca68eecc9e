use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::record::RawQueryRecord;

pub const KILL_QUERY_PREFIX: &str = "CALL system.runtime.kill_query('";
pub const KILL_QUERY_SUFFIX: &str = "')";
/// Catalog-introspection statement the reporting tool issues on connect.
pub const REPORTING_TOOL_PREFIX: &str = "SELECT DISTINCT CONCAT(CONCAT(table_catalog,";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryState {
    Queued,
    Planning,
    Starting,
    Running,
    Finishing,
    Finished,
    Failed,
}

impl QueryState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Planning => "PLANNING",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Finishing => "FINISHING",
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "QUEUED" => Some(Self::Queued),
            "PLANNING" => Some(Self::Planning),
            "STARTING" => Some(Self::Starting),
            "RUNNING" => Some(Self::Running),
            "FINISHING" => Some(Self::Finishing),
            "FINISHED" => Some(Self::Finished),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Only queued and running queries are eligible for cancellation.
    #[must_use]
    pub fn is_cancellable(self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }
}

fn is_cancellable_state(state: &str) -> bool {
    QueryState::parse(state).is_some_and(QueryState::is_cancellable)
}

fn is_word_char(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '_'
}

/// Extracts the target id from a statement that starts with
/// `CALL system.runtime.kill_query('<id>')`. Anything after the closing
/// parenthesis is ignored.
#[must_use]
pub fn parse_kill_call(query: &str) -> Option<&str> {
    let rest = query.strip_prefix(KILL_QUERY_PREFIX)?;
    let token_len = rest
        .char_indices()
        .find(|(_, ch)| !is_word_char(*ch))
        .map_or(rest.len(), |(index, _)| index);
    if token_len == 0 {
        return None;
    }

    let (token, tail) = rest.split_at(token_len);
    tail.starts_with(KILL_QUERY_SUFFIX).then_some(token)
}

/// Returns the query id named by an active kill statement.
#[must_use]
pub fn match_kill_request(record: &RawQueryRecord) -> Option<&str> {
    if !is_cancellable_state(&record.state) {
        return None;
    }
    parse_kill_call(&record.query)
}

/// Returns the record's own id when it is an active reporting-tool
/// introspection query.
#[must_use]
pub fn match_reporting_tool(record: &RawQueryRecord) -> Option<&str> {
    if !is_cancellable_state(&record.state) {
        return None;
    }
    record
        .query
        .starts_with(REPORTING_TOOL_PREFIX)
        .then_some(record.query_id.as_str())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CancelPlan {
    pub kill_requested: Vec<String>,
    pub reporting_tool: Vec<String>,
    pub targets: BTreeSet<String>,
}

impl CancelPlan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Classifies a whole snapshot. Both matchers run over every record before
/// anything is cancelled; `targets` is the deduplicated union.
#[must_use]
pub fn select_targets(records: &[RawQueryRecord]) -> CancelPlan {
    let mut plan = CancelPlan::default();

    for record in records {
        if let Some(target) = match_kill_request(record) {
            plan.kill_requested.push(target.to_string());
            plan.targets.insert(target.to_string());
        }
        if let Some(target) = match_reporting_tool(record) {
            plan.reporting_tool.push(target.to_string());
            plan.targets.insert(target.to_string());
        }
    }

    plan
}
