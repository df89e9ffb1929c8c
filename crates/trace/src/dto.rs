//! Request and response schemas for the HTTP surface. Kept in this crate
//! (rather than `api`) because the "entity model" component in spec.md §2
//! bundles request/response schemas together with the types and validators
//! they're built from.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::ValidationError;
use crate::model::{Span, SpanId, SpanKind, Trace, TraceId};
use crate::validate;

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct TraceCreate {
    pub name: String,
    pub project_id: String,
    #[serde(default)]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl TraceCreate {
    /// Validate all supplied fields, then build an open `Trace` owned by
    /// `project_id` (the caller has already checked this matches the API
    /// key's project — see `auth`).
    pub fn into_trace(self) -> Result<Trace, ValidationError> {
        validate::validate_name(&self.name)?;
        validate::validate_project_id(&self.project_id)?;
        if let Some(uid) = &self.user_id {
            validate::validate_identifier_field("user_id", uid)?;
        }
        if let Some(sid) = &self.session_id {
            validate::validate_identifier_field("session_id", sid)?;
        }
        let tags = match self.tags {
            Some(t) => Some(validate::normalize_tags(t)?),
            None => None,
        };
        let metadata = self.metadata.map(validate::normalize_metadata);

        Ok(Trace {
            id: Uuid::now_v7(),
            name: self.name,
            project_id: self.project_id,
            start_time: chrono::Utc::now(),
            end_time: None,
            duration_ms: None,
            metadata,
            tags,
            user_id: self.user_id,
            session_id: self.session_id,
            output: None,
            span_count: 0,
            total_cost: Decimal::ZERO,
        })
    }
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct SpanCreate {
    pub name: String,
    pub span_type: String,
    #[serde(default)]
    pub parent_span_id: Option<SpanId>,
    #[serde(default)]
    pub input_data: Option<serde_json::Value>,
    #[serde(default)]
    pub output_data: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub tokens_input: Option<u64>,
    #[serde(default)]
    pub tokens_output: Option<u64>,
    #[serde(default)]
    pub cost_usd: Option<Decimal>,
    #[serde(default)]
    pub error: Option<String>,
}

impl SpanCreate {
    pub fn into_span(self, trace_id: TraceId) -> Result<Span, ValidationError> {
        validate::validate_name(&self.name)?;
        let span_type: SpanKind = self
            .span_type
            .parse()
            .map_err(|_| ValidationError::UnknownSpanKind(self.span_type.clone()))?;
        if let Some(cost) = self.cost_usd {
            validate::validate_non_negative_decimal("cost_usd", cost)?;
        }
        let metadata = self.metadata.map(validate::normalize_metadata);
        let input_data = self
            .input_data
            .map(|v| crate::sizeguard::truncate_payload(v, crate::sizeguard::MAX_INPUT_OUTPUT_SIZE));
        let output_data = self
            .output_data
            .map(|v| crate::sizeguard::truncate_payload(v, crate::sizeguard::MAX_INPUT_OUTPUT_SIZE));
        let error = self.error.map(validate::normalize_output);

        Ok(Span {
            id: Uuid::now_v7(),
            trace_id,
            parent_span_id: self.parent_span_id,
            name: self.name,
            span_type,
            start_time: chrono::Utc::now(),
            end_time: None,
            duration_ms: None,
            input_data,
            output_data,
            metadata,
            model: self.model,
            tokens_input: self.tokens_input,
            tokens_output: self.tokens_output,
            cost_usd: self.cost_usd,
            error,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct SpanCompleteRequest {
    #[serde(default)]
    pub output_data: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub tokens_input: Option<u64>,
    #[serde(default)]
    pub tokens_output: Option<u64>,
    #[serde(default)]
    pub cost_usd: Option<Decimal>,
}

impl SpanCompleteRequest {
    /// Reject a negative `cost_usd` before it's accepted. Call before `apply`.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(cost) = self.cost_usd {
            validate::validate_non_negative_decimal("cost_usd", cost)?;
        }
        Ok(())
    }

    pub fn apply(self, span: &mut Span, end_time: chrono::DateTime<chrono::Utc>) {
        let output_data = self
            .output_data
            .map(|v| crate::sizeguard::truncate_payload(v, crate::sizeguard::MAX_INPUT_OUTPUT_SIZE));
        let error = self.error.map(validate::normalize_output);
        span.complete(
            end_time,
            output_data,
            error,
            self.tokens_input,
            self.tokens_output,
            self.cost_usd,
        );
    }
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct TraceCompleteRequest {
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl TraceCompleteRequest {
    pub fn apply(self, trace: &mut Trace, end_time: chrono::DateTime<chrono::Utc>) {
        let output = self.output.map(validate::normalize_output);
        if let Some(metadata) = self.metadata {
            trace.metadata = Some(validate::normalize_metadata(metadata));
        }
        trace.complete(end_time, output);
    }
}

/// Query parameters for `GET /api/traces`.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct TraceListQuery {
    pub limit: Option<u32>,
    pub cursor: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    /// Comma-separated tag list; a trace matches if it has any of them.
    pub tags: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TraceActionResponse {
    pub trace_id: TraceId,
    pub status: &'static str,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SpanActionResponse {
    pub span_id: SpanId,
    pub status: &'static str,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TraceListResponse {
    pub traces: Vec<Trace>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TraceDetailResponse {
    pub trace: Trace,
    pub spans: Vec<Span>,
    pub span_count: usize,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct StatsResponse {
    pub total_traces: u64,
    pub total_spans: u64,
    pub total_tokens: u64,
    pub total_cost: Decimal,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
    pub storage: &'static str,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub last_sweep: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub detail: String,
}

impl ErrorResponse {
    pub fn new(detail: impl Into<String>) -> Self {
        Self { detail: detail.into() }
    }
}
