use async_trait::async_trait;
use trace::dto::{SpanCompleteRequest, StatsResponse, TraceCompleteRequest};
use trace::{Span, SpanId, Trace, TraceId};

use crate::cursor::PageToken;
use crate::error::StorageError;
use crate::filter::TraceListFilter;

/// A page of traces returned by [`StorageBackend::list_traces`], before
/// post-query filtering and cursor re-encoding happen in the caller.
pub struct TracePage {
    pub traces: Vec<Trace>,
    pub last_key: Option<PageToken>,
}

/// Storage abstraction over the two-table, two-secondary-index key-value
/// model described in spec.md §4.5: `traces` keyed by `trace_id` with a
/// `project-time-index`, and `spans` keyed by `span_id` with a `trace-index`.
///
/// Every method already reflects the graceful-degradation contract from
/// spec.md §7: read methods return `Ok(None)`/`Ok(vec![])` rather than an
/// error when the underlying store simply has nothing to return; `Err` is
/// reserved for genuine backend failures, which the `api` crate maps to a
/// 500 at the handler boundary.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Persist a new open trace. TTL is attached by the backend.
    async fn save_trace(&self, trace: &Trace) -> Result<(), StorageError>;

    /// Primary-key fetch. If `project_id` is supplied and doesn't match the
    /// stored trace's owner, returns `Ok(None)` rather than the record —
    /// ownership mismatches are not distinguishable from absence to the
    /// caller (spec.md §4.3/§8 invariant 3).
    async fn get_trace(
        &self,
        id: TraceId,
        project_id: Option<&str>,
    ) -> Result<Option<Trace>, StorageError>;

    /// Query the `project-time-index`: traces owned by `project_id`,
    /// newest-first, up to `limit` items, optionally continuing from
    /// `cursor`. Post-query filters are applied by the backend before the
    /// page is truncated to `limit` so that `has_more`/`next_cursor`
    /// reflect the filtered result set.
    async fn list_traces(
        &self,
        project_id: &str,
        limit: u32,
        cursor: Option<&str>,
        filter: &TraceListFilter,
    ) -> Result<TracePage, StorageError>;

    /// Read-modify-write completion: loads the existing trace, stamps
    /// `end_time`/`duration_ms`, applies any supplied fields, writes back.
    /// Returns `false` if the trace doesn't exist.
    async fn complete_trace(
        &self,
        id: TraceId,
        req: TraceCompleteRequest,
    ) -> Result<bool, StorageError>;

    /// Persist a new open span. TTL is attached by the backend. Also bumps
    /// the owning trace's denormalized `span_count` (SPEC_FULL.md §9 Open
    /// Question 2).
    async fn save_span(&self, span: &Span) -> Result<(), StorageError>;

    /// Primary-key fetch, TTL stripped.
    async fn get_span(&self, id: SpanId) -> Result<Option<Span>, StorageError>;

    /// Query the `trace-index`: every span belonging to `trace_id`. Callers
    /// must authorize via `get_trace` first — this method performs no
    /// ownership check itself.
    async fn get_spans(&self, trace_id: TraceId) -> Result<Vec<Span>, StorageError>;

    /// Read-modify-write completion, mirrors `complete_trace`. Also updates
    /// the owning trace's denormalized `total_cost`.
    async fn complete_span(
        &self,
        id: SpanId,
        req: SpanCompleteRequest,
    ) -> Result<bool, StorageError>;

    /// Bounded-scan aggregate: count via the project index, then sum
    /// tokens/cost across the 50 most-recent traces' spans (spec.md §4.5
    /// under *Stats*, §4.7).
    async fn stats(&self, project_id: &str) -> Result<StatsResponse, StorageError>;

    /// Delete every record (trace or span) whose `ttl` has passed. Returns
    /// the number of rows removed. Stands in for the managed store's
    /// asynchronous TTL deletion (SPEC_FULL.md §4.5).
    async fn sweep_expired(&self) -> Result<u64, StorageError>;

    fn backend_name(&self) -> &'static str;
}
