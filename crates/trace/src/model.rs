use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

pub type TraceId = Uuid;
pub type SpanId = Uuid;

/// The closed set of span kinds accepted by the service. Unlike the prior
/// implementation this is a real enum, not a loosely-validated string — an
/// unrecognized kind is a validation error, not a silent pass-through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    Llm,
    Tool,
    Agent,
    Function,
    Retrieval,
    Embedding,
    Chain,
    Other,
}

impl SpanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanKind::Llm => "llm",
            SpanKind::Tool => "tool",
            SpanKind::Agent => "agent",
            SpanKind::Function => "function",
            SpanKind::Retrieval => "retrieval",
            SpanKind::Embedding => "embedding",
            SpanKind::Chain => "chain",
            SpanKind::Other => "other",
        }
    }
}

impl std::str::FromStr for SpanKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "llm" => SpanKind::Llm,
            "tool" => SpanKind::Tool,
            "agent" => SpanKind::Agent,
            "function" => SpanKind::Function,
            "retrieval" => SpanKind::Retrieval,
            "embedding" => SpanKind::Embedding,
            "chain" => SpanKind::Chain,
            "other" => SpanKind::Other,
            _ => return Err(()),
        })
    }
}

/// A top-level observed operation, owned by exactly one project.
///
/// `project_id` is immutable after creation. `end_time`/`duration_ms` are
/// absent while the trace is open; they're set exactly once, by `complete`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Trace {
    pub id: TraceId,
    pub name: String,
    pub project_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub metadata: Option<HashMap<String, String>>,
    pub tags: Option<Vec<String>>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub output: Option<String>,
    /// Denormalized count of spans belonging to this trace, updated on
    /// every span write (see SPEC_FULL.md Open Question 2).
    pub span_count: u64,
    /// Denormalized running total of `cost_usd` across this trace's spans.
    pub total_cost: Decimal,
}

impl Trace {
    pub fn is_completed(&self) -> bool {
        self.end_time.is_some()
    }

    /// Stamp completion fields in place. Idempotent in shape: re-completion
    /// simply overwrites `end_time`/`duration_ms`/`output` again.
    pub fn complete(&mut self, end_time: DateTime<Utc>, output: Option<String>) {
        self.duration_ms = Some((end_time - self.start_time).num_milliseconds().max(0));
        self.end_time = Some(end_time);
        if output.is_some() {
            self.output = output;
        }
    }
}

/// A sub-operation inside a trace, owned transitively through `trace_id`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Span {
    pub id: SpanId,
    pub trace_id: TraceId,
    pub parent_span_id: Option<SpanId>,
    pub name: String,
    pub span_type: SpanKind,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub input_data: Option<serde_json::Value>,
    pub output_data: Option<serde_json::Value>,
    pub metadata: Option<HashMap<String, String>>,
    pub model: Option<String>,
    pub tokens_input: Option<u64>,
    pub tokens_output: Option<u64>,
    pub cost_usd: Option<Decimal>,
    pub error: Option<String>,
}

impl Span {
    pub fn is_completed(&self) -> bool {
        self.end_time.is_some()
    }

    /// Stamp completion, applying only the fields the caller actually
    /// supplied (`None` leaves the existing value untouched) — mirrors the
    /// storage layer's `SET`-only-supplied-fields update expression.
    #[allow(clippy::too_many_arguments)]
    pub fn complete(
        &mut self,
        end_time: DateTime<Utc>,
        output_data: Option<serde_json::Value>,
        error: Option<String>,
        tokens_input: Option<u64>,
        tokens_output: Option<u64>,
        cost_usd: Option<Decimal>,
    ) {
        self.duration_ms = Some((end_time - self.start_time).num_milliseconds().max(0));
        self.end_time = Some(end_time);
        if output_data.is_some() {
            self.output_data = output_data;
        }
        if error.is_some() {
            self.error = error;
        }
        if tokens_input.is_some() {
            self.tokens_input = tokens_input;
        }
        if tokens_output.is_some() {
            self.tokens_output = tokens_output;
        }
        if cost_usd.is_some() {
            self.cost_usd = cost_usd;
        }
    }
}
