#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use query_reaper_core::{format_rfc3339, now_utc, FlatQueryRow};
use rusqlite::{params, Connection, OptionalExtension, Row};

const QUERY_LOG_MIGRATION_VERSION: i64 = 1;

const SCHEMA_QUERY_LOG_V1: &str = r"
CREATE TABLE IF NOT EXISTS queries (
  queryId TEXT PRIMARY KEY,
  memoryPool TEXT NOT NULL,
  query TEXT NOT NULL,
  blockedReasons TEXT NOT NULL,
  completedDrivers INTEGER NOT NULL,
  createTime TEXT NOT NULL,
  elapsedTime INTEGER NOT NULL,
  endTime TEXT,
  executionTime INTEGER NOT NULL,
  fullyBlocked TEXT NOT NULL,
  peakMem REAL NOT NULL,
  totalCpuTime INTEGER NOT NULL,
  totalDrivers INTEGER NOT NULL,
  totalMemoryReservation REAL NOT NULL,
  lookupCatalog TEXT NOT NULL,
  catalogProperties TEXT NOT NULL,
  preparedStatements TEXT NOT NULL,
  source TEXT NOT NULL,
  startTime INTEGER NOT NULL,
  systemProperties TEXT NOT NULL,
  timeZoneKey TEXT NOT NULL,
  prestoUser TEXT NOT NULL,
  queryState TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_queries_state_create_time
  ON queries(queryState, createTime);
";

const QUERY_COLUMNS: &str = "queryId, memoryPool, query, blockedReasons, completedDrivers,
  createTime, elapsedTime, endTime, executionTime, fullyBlocked, peakMem, totalCpuTime,
  totalDrivers, totalMemoryReservation, lookupCatalog, catalogProperties, preparedStatements,
  source, startTime, systemProperties, timeZoneKey, prestoUser, queryState";

/// Local log of every query the coordinator reported, one row per `queryId`.
pub struct SqliteQueryLog {
    conn: Connection,
}

impl SqliteQueryLog {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Opens the log and applies the schema; the file is created if absent.
    pub fn open_and_migrate(path: &Path) -> Result<Self> {
        let log = Self::open(path)?;
        log.migrate()?;
        Ok(log)
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_QUERY_LOG_V1)
            .context("failed to apply query log schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![QUERY_LOG_MIGRATION_VERSION, now],
            )
            .context("failed to register query log schema migration")?;

        Ok(())
    }

    pub fn schema_version(&self) -> Result<Option<i64>> {
        self.conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get::<_, Option<i64>>(0)
            })
            .context("failed to read schema version")
    }

    /// Writes the batch in one transaction. A row whose `queryId` is already
    /// present replaces the stored row.
    pub fn upsert_rows(&mut self, rows: &[FlatQueryRow]) -> Result<usize> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start query log transaction")?;

        {
            let mut stmt = tx
                .prepare(&format!(
                    "INSERT OR REPLACE INTO queries({QUERY_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                             ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)"
                ))
                .context("failed to prepare query log upsert")?;

            for row in rows {
                stmt.execute(params![
                    row.query_id,
                    row.memory_pool,
                    row.query,
                    row.blocked_reasons,
                    row.completed_drivers,
                    row.create_time,
                    row.elapsed_time,
                    row.end_time,
                    row.execution_time,
                    row.fully_blocked,
                    row.peak_mem,
                    row.total_cpu_time,
                    row.total_drivers,
                    row.total_memory_reservation,
                    row.lookup_catalog,
                    row.catalog_properties,
                    row.prepared_statements,
                    row.source,
                    row.start_time,
                    row.system_properties,
                    row.time_zone_key,
                    row.presto_user,
                    row.query_state,
                ])
                .with_context(|| format!("failed to upsert query {}", row.query_id))?;
            }
        }

        tx.commit().context("failed to commit query log batch")?;
        tracing::debug!(count = rows.len(), "upserted query log rows");
        Ok(rows.len())
    }

    pub fn get_row(&self, query_id: &str) -> Result<Option<FlatQueryRow>> {
        self.conn
            .query_row(
                &format!("SELECT {QUERY_COLUMNS} FROM queries WHERE queryId = ?1"),
                params![query_id],
                parse_query_row,
            )
            .optional()
            .with_context(|| format!("failed to load query {query_id}"))
    }

    /// Lists stored rows, newest `createTime` first, optionally filtered by
    /// state.
    pub fn list_rows(
        &self,
        state: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<FlatQueryRow>> {
        let limit = match limit {
            Some(value) => i64::try_from(value).context("limit out of range")?,
            None => -1,
        };

        let mut stmt = self.conn.prepare(&format!(
            "SELECT {QUERY_COLUMNS} FROM queries
             WHERE (?1 IS NULL OR queryState = ?1)
             ORDER BY createTime DESC, queryId ASC
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![state, limit], parse_query_row)?;
        collect_rows(rows)
    }

    pub fn count_rows(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM queries", [], |row| row.get(0))
            .context("failed to count query log rows")?;
        usize::try_from(count).context("query log row count out of range")
    }
}

fn parse_query_row(row: &Row<'_>) -> rusqlite::Result<FlatQueryRow> {
    Ok(FlatQueryRow {
        query_id: row.get(0)?,
        memory_pool: row.get(1)?,
        query: row.get(2)?,
        blocked_reasons: row.get(3)?,
        completed_drivers: row.get(4)?,
        create_time: row.get(5)?,
        elapsed_time: row.get(6)?,
        end_time: row.get(7)?,
        execution_time: row.get(8)?,
        fully_blocked: row.get(9)?,
        peak_mem: row.get(10)?,
        total_cpu_time: row.get(11)?,
        total_drivers: row.get(12)?,
        total_memory_reservation: row.get(13)?,
        lookup_catalog: row.get(14)?,
        catalog_properties: row.get(15)?,
        prepared_statements: row.get(16)?,
        source: row.get(17)?,
        start_time: row.get(18)?,
        system_properties: row.get(19)?,
        time_zone_key: row.get(20)?,
        presto_user: row.get(21)?,
        query_state: row.get(22)?,
    })
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]

    use super::*;
    use proptest::prelude::*;
    use ulid::Ulid;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_log() -> SqliteQueryLog {
        must(SqliteQueryLog::open_and_migrate(Path::new(":memory:")))
    }

    fn fixture_row(query_id: &str, state: &str, create_time: &str) -> FlatQueryRow {
        FlatQueryRow {
            query_id: query_id.to_string(),
            memory_pool: "general".to_string(),
            query: "SELECT 1".to_string(),
            blocked_reasons: String::new(),
            completed_drivers: 4,
            create_time: create_time.to_string(),
            elapsed_time: 12,
            end_time: None,
            execution_time: 10,
            fully_blocked: "False".to_string(),
            peak_mem: 0.25,
            total_cpu_time: 3,
            total_drivers: 8,
            total_memory_reservation: 0.5,
            lookup_catalog: "hive".to_string(),
            catalog_properties: "{}".to_string(),
            prepared_statements: "{}".to_string(),
            source: "presto-cli".to_string(),
            start_time: 1_704_067_200_000,
            system_properties: "{}".to_string(),
            time_zone_key: "2072".to_string(),
            presto_user: "analyst".to_string(),
            query_state: state.to_string(),
        }
    }

    #[test]
    fn migrate_is_idempotent_and_records_version() {
        let log = fixture_log();
        must(log.migrate());
        assert_eq!(must(log.schema_version()), Some(1));
    }

    #[test]
    fn upsert_round_trips_every_column() {
        let mut log = fixture_log();
        let mut row = fixture_row("q1", "RUNNING", "2024-01-01T00:00:00.000Z");
        row.end_time = Some("2024-01-01T00:00:12.000Z".to_string());
        row.blocked_reasons = "WAITING_FOR_MEMORY".to_string();

        assert_eq!(must(log.upsert_rows(std::slice::from_ref(&row))), 1);

        let stored = match must(log.get_row("q1")) {
            Some(value) => value,
            None => panic!("expected stored row"),
        };
        assert_eq!(stored, row);
    }

    #[test]
    fn same_query_id_keeps_last_observation() {
        let mut log = fixture_log();
        let first = fixture_row("q1", "RUNNING", "2024-01-01T00:00:00.000Z");
        let mut second = first.clone();
        second.query_state = "FINISHED".to_string();
        second.elapsed_time = 99;

        must(log.upsert_rows(&[first]));
        must(log.upsert_rows(&[second.clone()]));

        assert_eq!(must(log.count_rows()), 1);
        assert_eq!(must(log.get_row("q1")), Some(second));
    }

    #[test]
    fn missing_row_is_none() {
        let log = fixture_log();
        assert_eq!(must(log.get_row("absent")), None);
    }

    #[test]
    fn list_filters_by_state_and_orders_newest_first() {
        let mut log = fixture_log();
        must(log.upsert_rows(&[
            fixture_row("q1", "RUNNING", "2024-01-01T00:00:00.000Z"),
            fixture_row("q2", "FINISHED", "2024-01-02T00:00:00.000Z"),
            fixture_row("q3", "RUNNING", "2024-01-03T00:00:00.000Z"),
        ]));

        let all = must(log.list_rows(None, None));
        let ids: Vec<&str> = all.iter().map(|row| row.query_id.as_str()).collect();
        assert_eq!(ids, vec!["q3", "q2", "q1"]);

        let running = must(log.list_rows(Some("RUNNING"), None));
        let ids: Vec<&str> = running.iter().map(|row| row.query_id.as_str()).collect();
        assert_eq!(ids, vec!["q3", "q1"]);

        let limited = must(log.list_rows(None, Some(1)));
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].query_id, "q3");
    }

    #[test]
    fn log_file_is_created_on_first_open_and_reused() {
        let db_path =
            std::env::temp_dir().join(format!("query-log-reopen-{}.sqlite", Ulid::new()));

        {
            let mut log = must(SqliteQueryLog::open_and_migrate(&db_path));
            must(log.upsert_rows(&[fixture_row("q1", "RUNNING", "2024-01-01T00:00:00.000Z")]));
        }
        assert!(db_path.exists());

        let reopened = must(SqliteQueryLog::open_and_migrate(&db_path));
        assert_eq!(must(reopened.count_rows()), 1);

        drop(reopened);
        let _ = std::fs::remove_file(&db_path);
        let _ = std::fs::remove_file(db_path.with_extension("sqlite-wal"));
        let _ = std::fs::remove_file(db_path.with_extension("sqlite-shm"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_repeated_upserts_leave_one_row_per_id(ids in prop::collection::vec(0u8..6, 1..40)) {
            let mut log = fixture_log();
            let mut distinct = std::collections::BTreeSet::new();

            for (seq, id) in ids.iter().copied().enumerate() {
                let mut row = fixture_row(&format!("q{id}"), "RUNNING", "2024-01-01T00:00:00.000Z");
                row.elapsed_time = i64::try_from(seq).unwrap_or(i64::MAX);
                must(log.upsert_rows(&[row]));
                distinct.insert(id);
            }

            prop_assert_eq!(must(log.count_rows()), distinct.len());

            if let Some(last) = ids.last() {
                let stored = must(log.get_row(&format!("q{last}")));
                let expected = i64::try_from(ids.len() - 1).unwrap_or(i64::MAX);
                prop_assert_eq!(stored.map(|row| row.elapsed_time), Some(expected));
            }
        }
    }
}
