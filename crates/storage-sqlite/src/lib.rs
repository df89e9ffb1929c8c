//! SQLite-backed implementation of `storage::StorageBackend`.
//!
//! Reproduces the two-table / two-secondary-index key-value design from
//! spec.md §4.5 with real SQL tables and indexes: `traces(project_id,
//! start_time)` stands in for the `project-time-index` GSI, `spans(trace_id)`
//! stands in for the `trace-index` GSI. Each row's full record is kept as a
//! JSON blob in a `data` column — the indexed columns are the subset of
//! attributes the index needs, duplicated from that same JSON for
//! queryability, matching "projection: all attributes" from spec.md §4.5.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use storage::backend::TracePage;
use storage::cursor::{self, PageToken};
use storage::error::StorageError;
use storage::filter::TraceListFilter;
use storage::StorageBackend;
use tokio::sync::Mutex;
use trace::dto::{SpanCompleteRequest, StatsResponse, TraceCompleteRequest};
use trace::{Span, SpanId, Trace, TraceId};

/// Time-to-live for every record: 90 days, matching spec.md §3/§4.5.
const TTL_SECONDS: i64 = 90 * 24 * 3600;
/// Bound on the stats aggregator's trace scan (spec.md §4.5/§4.7).
const STATS_SCAN_LIMIT: i64 = 50;

const MIGRATIONS: &[&str] = &[r#"
    CREATE TABLE IF NOT EXISTS traces (
        trace_id    TEXT PRIMARY KEY,
        project_id  TEXT NOT NULL,
        start_time  TEXT NOT NULL,
        ttl         INTEGER NOT NULL,
        data        TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_traces_project_time
        ON traces(project_id, start_time DESC, trace_id DESC);

    CREATE TABLE IF NOT EXISTS spans (
        span_id   TEXT PRIMARY KEY,
        trace_id  TEXT NOT NULL,
        ttl       INTEGER NOT NULL,
        data      TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_spans_trace ON spans(trace_id);
"#];

/// rusqlite and `storage::StorageError` are both foreign to this crate, so
/// they can't be linked by a `From` impl; every call site maps explicitly.
fn db(e: rusqlite::Error) -> StorageError {
    StorageError::Database(e.to_string())
}

fn run_migrations(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        )",
    )
    .map_err(db)?;
    let current_version: i64 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM migrations", [], |r| r.get(0))
        .unwrap_or(0);

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i64;
        if version > current_version {
            conn.execute_batch(migration).map_err(db)?;
            conn.execute(
                "INSERT INTO migrations (version, applied_at) VALUES (?1, ?2)",
                params![version, Utc::now().to_rfc3339()],
            )
            .map_err(db)?;
            tracing::info!(version, "applied storage migration");
        }
    }
    Ok(())
}

fn now_epoch() -> i64 {
    Utc::now().timestamp()
}

pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(db)?;
        run_migrations(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory().map_err(db)?;
        run_migrations(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn row_to_trace(data: &str) -> Result<Trace, StorageError> {
        serde_json::from_str(data).map_err(Into::into)
    }

    fn row_to_span(data: &str) -> Result<Span, StorageError> {
        serde_json::from_str(data).map_err(Into::into)
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    async fn save_trace(&self, trace: &Trace) -> Result<(), StorageError> {
        let conn = self.conn.lock().await;
        let data = serde_json::to_string(trace)?;
        conn.execute(
            "INSERT OR REPLACE INTO traces (trace_id, project_id, start_time, ttl, data)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                trace.id.to_string(),
                trace.project_id,
                trace.start_time.to_rfc3339(),
                now_epoch() + TTL_SECONDS,
                data,
            ],
        )
        .map_err(db)?;
        tracing::debug!(trace_id = %trace.id, "saved trace");
        Ok(())
    }

    async fn get_trace(
        &self,
        id: TraceId,
        project_id: Option<&str>,
    ) -> Result<Option<Trace>, StorageError> {
        let conn = self.conn.lock().await;
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM traces WHERE trace_id = ?1 AND ttl > ?2",
                params![id.to_string(), now_epoch()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db)?;
        let Some(data) = data else { return Ok(None) };
        let trace = Self::row_to_trace(&data)?;
        if let Some(pid) = project_id {
            if trace.project_id != pid {
                tracing::warn!(trace_id = %id, "trace owned by a different project");
                return Ok(None);
            }
        }
        Ok(Some(trace))
    }

    async fn list_traces(
        &self,
        project_id: &str,
        limit: u32,
        cursor_str: Option<&str>,
        filter: &TraceListFilter,
    ) -> Result<TracePage, StorageError> {
        let conn = self.conn.lock().await;
        let window = limit as i64 + 1;
        let now = now_epoch();

        let rows: Vec<(String, String, String)> = if let Some(token) =
            cursor_str.and_then(cursor::decode)
        {
            let mut stmt = conn
                .prepare(
                    "SELECT data, start_time, trace_id FROM traces
                     WHERE project_id = ?1 AND ttl > ?2
                       AND (start_time < ?3 OR (start_time = ?3 AND trace_id < ?4))
                     ORDER BY start_time DESC, trace_id DESC
                     LIMIT ?5",
                )
                .map_err(db)?;
            stmt.query_map(
                params![
                    project_id,
                    now,
                    token.start_time.to_rfc3339(),
                    token.trace_id.to_string(),
                    window,
                ],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .map_err(db)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db)?
        } else {
            let mut stmt = conn
                .prepare(
                    "SELECT data, start_time, trace_id FROM traces
                     WHERE project_id = ?1 AND ttl > ?2
                     ORDER BY start_time DESC, trace_id DESC
                     LIMIT ?3",
                )
                .map_err(db)?;
            stmt.query_map(params![project_id, now, window], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })
            .map_err(db)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db)?
        };

        let has_extra = rows.len() as i64 > limit as i64;
        let page_rows = if has_extra { &rows[..limit as usize] } else { &rows[..] };

        let last_key = if has_extra {
            let (_, start_time, trace_id) = &rows[limit as usize - 1];
            Some(PageToken {
                start_time: DateTime::parse_from_rfc3339(start_time)
                    .map_err(|e| StorageError::InvalidTimestamp(e.to_string()))?
                    .with_timezone(&Utc),
                trace_id: trace_id
                    .parse()
                    .map_err(|e| StorageError::Database(format!("invalid trace id: {e}")))?,
            })
        } else {
            None
        };

        let mut traces = Vec::with_capacity(page_rows.len());
        for (data, _, _) in page_rows {
            let trace = Self::row_to_trace(data)?;
            if filter.matches(&trace) {
                traces.push(trace);
            }
        }

        Ok(TracePage { traces, last_key })
    }

    async fn complete_trace(
        &self,
        id: TraceId,
        req: TraceCompleteRequest,
    ) -> Result<bool, StorageError> {
        let conn = self.conn.lock().await;
        conn.execute_batch("BEGIN IMMEDIATE").map_err(db)?;

        let data: Option<String> = conn
            .query_row("SELECT data FROM traces WHERE trace_id = ?1", params![id.to_string()], |r| {
                r.get(0)
            })
            .optional()
            .map_err(db)?;
        let Some(data) = data else {
            conn.execute_batch("ROLLBACK").map_err(db)?;
            return Ok(false);
        };

        let mut trace = Self::row_to_trace(&data)?;
        req.apply(&mut trace, Utc::now());
        let updated = serde_json::to_string(&trace)?;
        conn.execute(
            "UPDATE traces SET data = ?1 WHERE trace_id = ?2",
            params![updated, id.to_string()],
        )
        .map_err(db)?;
        conn.execute_batch("COMMIT").map_err(db)?;
        tracing::debug!(trace_id = %id, "completed trace");
        Ok(true)
    }

    async fn save_span(&self, span: &Span) -> Result<(), StorageError> {
        let conn = self.conn.lock().await;
        conn.execute_batch("BEGIN IMMEDIATE").map_err(db)?;

        let data = serde_json::to_string(span)?;
        conn.execute(
            "INSERT OR REPLACE INTO spans (span_id, trace_id, ttl, data) VALUES (?1, ?2, ?3, ?4)",
            params![span.id.to_string(), span.trace_id.to_string(), now_epoch() + TTL_SECONDS, data],
        )
        .map_err(db)?;

        let trace_data: Option<String> = conn
            .query_row(
                "SELECT data FROM traces WHERE trace_id = ?1",
                params![span.trace_id.to_string()],
                |r| r.get(0),
            )
            .optional()
            .map_err(db)?;
        if let Some(trace_data) = trace_data {
            let mut trace = Self::row_to_trace(&trace_data)?;
            trace.span_count += 1;
            let updated = serde_json::to_string(&trace)?;
            conn.execute(
                "UPDATE traces SET data = ?1 WHERE trace_id = ?2",
                params![updated, span.trace_id.to_string()],
            )
            .map_err(db)?;
        }
        conn.execute_batch("COMMIT").map_err(db)?;
        tracing::debug!(span_id = %span.id, trace_id = %span.trace_id, "saved span");
        Ok(())
    }

    async fn get_span(&self, id: SpanId) -> Result<Option<Span>, StorageError> {
        let conn = self.conn.lock().await;
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM spans WHERE span_id = ?1 AND ttl > ?2",
                params![id.to_string(), now_epoch()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db)?;
        data.map(|d| Self::row_to_span(&d)).transpose()
    }

    async fn get_spans(&self, trace_id: TraceId) -> Result<Vec<Span>, StorageError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT data FROM spans WHERE trace_id = ?1 AND ttl > ?2")
            .map_err(db)?;
        let rows = stmt
            .query_map(params![trace_id.to_string(), now_epoch()], |row| {
                row.get::<_, String>(0)
            })
            .map_err(db)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db)?;
        rows.iter().map(|d| Self::row_to_span(d)).collect()
    }

    async fn complete_span(
        &self,
        id: SpanId,
        req: SpanCompleteRequest,
    ) -> Result<bool, StorageError> {
        let conn = self.conn.lock().await;
        conn.execute_batch("BEGIN IMMEDIATE").map_err(db)?;

        let data: Option<String> = conn
            .query_row("SELECT data FROM spans WHERE span_id = ?1", params![id.to_string()], |r| {
                r.get(0)
            })
            .optional()
            .map_err(db)?;
        let Some(data) = data else {
            conn.execute_batch("ROLLBACK").map_err(db)?;
            return Ok(false);
        };

        let mut span = Self::row_to_span(&data)?;
        let cost_supplied = req.cost_usd.is_some();
        let previous_cost = span.cost_usd.unwrap_or(Decimal::ZERO);
        req.apply(&mut span, Utc::now());
        let updated = serde_json::to_string(&span)?;
        conn.execute(
            "UPDATE spans SET data = ?1 WHERE span_id = ?2",
            params![updated, id.to_string()],
        )
        .map_err(db)?;

        // Denormalized trace.total_cost is kept in sync by folding in the
        // delta against this span's own previous cost, not the raw new
        // value — re-completing a span with the same cost_usd must not
        // double-count it.
        if cost_supplied {
            let new_cost = span.cost_usd.unwrap_or(Decimal::ZERO);
            let delta = new_cost - previous_cost;
            let trace_data: Option<String> = conn
                .query_row(
                    "SELECT data FROM traces WHERE trace_id = ?1",
                    params![span.trace_id.to_string()],
                    |r| r.get(0),
                )
                .optional()
                .map_err(db)?;
            if let Some(trace_data) = trace_data {
                let mut trace = Self::row_to_trace(&trace_data)?;
                trace.total_cost += delta;
                let updated = serde_json::to_string(&trace)?;
                conn.execute(
                    "UPDATE traces SET data = ?1 WHERE trace_id = ?2",
                    params![updated, span.trace_id.to_string()],
                )
                .map_err(db)?;
            }
        }

        conn.execute_batch("COMMIT").map_err(db)?;
        tracing::debug!(span_id = %id, "completed span");
        Ok(true)
    }

    async fn stats(&self, project_id: &str) -> Result<StatsResponse, StorageError> {
        let conn = self.conn.lock().await;
        let now = now_epoch();

        let total_traces: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM traces WHERE project_id = ?1 AND ttl > ?2",
                params![project_id, now],
                |r| r.get(0),
            )
            .map_err(db)?;

        let mut stmt = conn
            .prepare(
                "SELECT trace_id FROM traces WHERE project_id = ?1 AND ttl > ?2
                 ORDER BY start_time DESC LIMIT ?3",
            )
            .map_err(db)?;
        let trace_ids: Vec<String> = stmt
            .query_map(params![project_id, now, STATS_SCAN_LIMIT], |r| r.get(0))
            .map_err(db)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db)?;
        drop(stmt);

        let mut total_spans: u64 = 0;
        let mut total_tokens: u64 = 0;
        let mut total_cost = Decimal::ZERO;

        for trace_id in &trace_ids {
            let mut span_stmt = conn
                .prepare("SELECT data FROM spans WHERE trace_id = ?1 AND ttl > ?2")
                .map_err(db)?;
            let spans: Vec<String> = span_stmt
                .query_map(params![trace_id, now], |r| r.get(0))
                .map_err(db)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db)?;
            for data in spans {
                let span = Self::row_to_span(&data)?;
                total_spans += 1;
                total_tokens += span.tokens_input.unwrap_or(0) + span.tokens_output.unwrap_or(0);
                if let Some(cost) = span.cost_usd {
                    total_cost += cost;
                }
            }
        }

        Ok(StatsResponse {
            total_traces: total_traces as u64,
            total_spans,
            total_tokens,
            total_cost: total_cost.round_dp(4),
        })
    }

    async fn sweep_expired(&self) -> Result<u64, StorageError> {
        let conn = self.conn.lock().await;
        let now = now_epoch();
        let traces_deleted = conn
            .execute("DELETE FROM traces WHERE ttl < ?1", params![now])
            .map_err(db)?;
        let spans_deleted = conn
            .execute("DELETE FROM spans WHERE ttl < ?1", params![now])
            .map_err(db)?;
        let total = (traces_deleted + spans_deleted) as u64;
        if total > 0 {
            tracing::info!(traces_deleted, spans_deleted, "swept expired records");
        }
        Ok(total)
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    fn open_trace(project_id: &str, name: &str) -> Trace {
        Trace {
            id: Uuid::now_v7(),
            name: name.to_string(),
            project_id: project_id.to_string(),
            start_time: Utc::now(),
            end_time: None,
            duration_ms: None,
            metadata: None,
            tags: None,
            user_id: None,
            session_id: None,
            output: None,
            span_count: 0,
            total_cost: Decimal::ZERO,
        }
    }

    #[tokio::test]
    async fn save_and_get_round_trips() {
        let backend = SqliteBackend::memory().unwrap();
        let trace = open_trace("dev", "q1");
        backend.save_trace(&trace).await.unwrap();
        let fetched = backend.get_trace(trace.id, None).await.unwrap().unwrap();
        assert_eq!(fetched.name, "q1");
        assert_eq!(fetched.project_id, "dev");
    }

    #[tokio::test]
    async fn cross_project_get_is_none() {
        let backend = SqliteBackend::memory().unwrap();
        let trace = open_trace("project-a", "q1");
        backend.save_trace(&trace).await.unwrap();
        let fetched = backend.get_trace(trace.id, Some("project-b")).await.unwrap();
        assert!(fetched.is_none());
    }

    #[tokio::test]
    async fn pagination_has_more_and_cursor_round_trip() {
        let backend = SqliteBackend::memory().unwrap();
        for i in 0..5 {
            let mut t = open_trace("dev", &format!("trace-{i}"));
            t.start_time = Utc::now() - chrono::Duration::seconds(5 - i);
            backend.save_trace(&t).await.unwrap();
        }
        let filter = TraceListFilter::default();
        let page1 = backend.list_traces("dev", 2, None, &filter).await.unwrap();
        assert_eq!(page1.traces.len(), 2);
        assert!(page1.last_key.is_some());

        let cursor_str = cursor::encode(page1.last_key.as_ref().unwrap());
        let page2 = backend
            .list_traces("dev", 2, Some(&cursor_str), &filter)
            .await
            .unwrap();
        assert_eq!(page2.traces.len(), 2);

        let ids1: Vec<_> = page1.traces.iter().map(|t| t.id).collect();
        let ids2: Vec<_> = page2.traces.iter().map(|t| t.id).collect();
        assert!(ids1.iter().all(|id| !ids2.contains(id)));
    }

    #[tokio::test]
    async fn span_count_denormalizes_on_save() {
        let backend = SqliteBackend::memory().unwrap();
        let trace = open_trace("dev", "q1");
        backend.save_trace(&trace).await.unwrap();

        let span = Span {
            id: Uuid::now_v7(),
            trace_id: trace.id,
            parent_span_id: None,
            name: "call".into(),
            span_type: trace::SpanKind::Llm,
            start_time: Utc::now(),
            end_time: None,
            duration_ms: None,
            input_data: None,
            output_data: None,
            metadata: None,
            model: Some("gpt-4".into()),
            tokens_input: Some(10),
            tokens_output: Some(5),
            cost_usd: None,
            error: None,
        };
        backend.save_span(&span).await.unwrap();

        let fetched = backend.get_trace(trace.id, None).await.unwrap().unwrap();
        assert_eq!(fetched.span_count, 1);
    }

    #[tokio::test]
    async fn stats_bounded_scan() {
        let backend = SqliteBackend::memory().unwrap();
        let trace = open_trace("dev", "q1");
        backend.save_trace(&trace).await.unwrap();
        let span = Span {
            id: Uuid::now_v7(),
            trace_id: trace.id,
            parent_span_id: None,
            name: "call".into(),
            span_type: trace::SpanKind::Llm,
            start_time: Utc::now(),
            end_time: None,
            duration_ms: None,
            input_data: None,
            output_data: None,
            metadata: None,
            model: None,
            tokens_input: Some(10),
            tokens_output: Some(20),
            cost_usd: Some(Decimal::new(15, 2)),
            error: None,
        };
        backend.save_span(&span).await.unwrap();

        let stats = backend.stats("dev").await.unwrap();
        assert_eq!(stats.total_traces, 1);
        assert_eq!(stats.total_spans, 1);
        assert_eq!(stats.total_tokens, 30);
    }

    #[tokio::test]
    async fn sweep_removes_expired_rows() {
        let backend = SqliteBackend::memory().unwrap();
        let trace = open_trace("dev", "old");
        backend.save_trace(&trace).await.unwrap();
        {
            let conn = backend.conn.lock().await;
            conn.execute("UPDATE traces SET ttl = 1", []).unwrap();
        }
        let removed = backend.sweep_expired().await.unwrap();
        assert_eq!(removed, 1);
        assert!(backend.get_trace(trace.id, None).await.unwrap().is_none());
    }
}
