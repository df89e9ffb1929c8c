//! Instrumentation SDK for sending traces and spans to a traceway server.
//!
//! Mirrors the Python reference client's design: tracing must never break
//! the host application. Every network call swallows its error as a
//! `tracing::warn!` and returns `None`/no-op rather than propagating a
//! `Result`. `TraceHandle`/`SpanHandle` buffer `set_output`/`set_error`
//! until `complete()` is called explicitly or the handle is dropped, at
//! which point exactly one PATCH is issued — on drop this is a best-effort
//! fire-and-forget task, since `Drop` cannot `.await`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use trace::dto::{SpanCompleteRequest, SpanCreate, TraceCompleteRequest, TraceCreate};
use trace::{SpanId, TraceId};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Local response shapes: the server's `TraceActionResponse`/`SpanActionResponse`
/// carry a `&'static str` status field that can't implement `Deserialize`, so
/// the client reads just the id it needs.
#[derive(Deserialize)]
struct TraceCreated {
    trace_id: TraceId,
}

#[derive(Deserialize)]
struct SpanCreated {
    span_id: SpanId,
}

/// Configuration and HTTP plumbing shared by every handle produced from a
/// single client. Cheap to clone (wraps an `Arc` internally via `reqwest::Client`).
pub struct TracerClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    project_id: Option<String>,
    enabled: bool,
}

impl TracerClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let project_id = api_key.strip_prefix("project-").map(|s| s.to_string());
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            enabled: true,
            project_id,
            api_key: Some(api_key),
        }
    }

    /// Build from `TRACER_URL`, `TRACER_API_KEY`, `TRACER_PROJECT_ID`,
    /// `TRACING_ENABLED` — matching the Python client's env var names.
    /// Missing `TRACER_API_KEY` disables tracing rather than failing.
    pub fn from_env() -> Self {
        let base_url = std::env::var("TRACER_URL")
            .unwrap_or_else(|_| "http://localhost:8080".to_string())
            .trim_end_matches('/')
            .to_string();
        let api_key = std::env::var("TRACER_API_KEY").ok();
        let enabled = api_key.is_some()
            && std::env::var("TRACING_ENABLED")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(true);
        if api_key.is_none() {
            tracing::warn!("no TRACER_API_KEY set, tracing disabled");
        }
        let project_id = std::env::var("TRACER_PROJECT_ID").ok().or_else(|| {
            api_key
                .as_deref()
                .and_then(|k| k.strip_prefix("project-"))
                .map(|s| s.to_string())
        });
        Self {
            http: reqwest::Client::new(),
            base_url,
            api_key,
            project_id,
            enabled,
        }
    }

    pub fn disabled() -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: String::new(),
            api_key: None,
            project_id: None,
            enabled: false,
        }
    }

    fn headers(&self) -> Vec<(&'static str, String)> {
        match &self.api_key {
            Some(key) => vec![("x-api-key", key.clone())],
            None => Vec::new(),
        }
    }

    /// Start a trace; returns a handle regardless of success, so callers
    /// never need to branch on tracing being enabled — a handle backed by
    /// no trace_id just no-ops its span/complete calls.
    pub async fn trace(self: &Arc<Self>, name: impl Into<String>) -> TraceHandle {
        let trace_id = self.create_trace(name.into(), None, None, None, None).await;
        TraceHandle {
            client: self.clone(),
            trace_id,
            output: None,
            completed: false,
        }
    }

    pub async fn create_trace(
        &self,
        name: String,
        metadata: Option<HashMap<String, Value>>,
        tags: Option<Vec<String>>,
        user_id: Option<String>,
        session_id: Option<String>,
    ) -> Option<TraceId> {
        if !self.enabled {
            return None;
        }
        let project_id = self.project_id.clone()?;

        let body = TraceCreate { name, project_id, metadata, tags, user_id, session_id };
        let url = format!("{}/api/traces", self.base_url);

        let mut req = self.http.post(&url).json(&body).timeout(DEFAULT_TIMEOUT);
        for (k, v) in self.headers() {
            req = req.header(k, v);
        }

        match req.send().await {
            Ok(resp) => match resp.error_for_status() {
                Ok(resp) => match resp.json::<TraceCreated>().await {
                    Ok(parsed) => {
                        tracing::info!(trace_id = %parsed.trace_id, "created trace");
                        Some(parsed.trace_id)
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to parse create_trace response");
                        None
                    }
                },
                Err(e) => {
                    tracing::warn!(error = %e, "create_trace request failed");
                    None
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "failed to reach tracer server");
                None
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create_span(
        &self,
        trace_id: TraceId,
        name: String,
        span_type: String,
        input_data: Option<Value>,
        metadata: Option<HashMap<String, Value>>,
        model: Option<String>,
        parent_span_id: Option<SpanId>,
    ) -> Option<SpanId> {
        if !self.enabled {
            return None;
        }

        let body = SpanCreate {
            name,
            span_type,
            parent_span_id,
            input_data,
            output_data: None,
            metadata,
            model,
            tokens_input: None,
            tokens_output: None,
            cost_usd: None,
            error: None,
        };
        let url = format!("{}/api/traces/{trace_id}/spans", self.base_url);

        let mut req = self.http.post(&url).json(&body).timeout(DEFAULT_TIMEOUT);
        for (k, v) in self.headers() {
            req = req.header(k, v);
        }

        match req.send().await {
            Ok(resp) => match resp.error_for_status() {
                Ok(resp) => match resp.json::<SpanCreated>().await {
                    Ok(parsed) => Some(parsed.span_id),
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to parse create_span response");
                        None
                    }
                },
                Err(e) => {
                    tracing::warn!(error = %e, "create_span request failed");
                    None
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "failed to reach tracer server");
                None
            }
        }
    }

    pub async fn complete_span(
        &self,
        span_id: SpanId,
        output_data: Option<Value>,
        error: Option<String>,
        tokens_input: Option<u64>,
        tokens_output: Option<u64>,
        cost_usd: Option<Decimal>,
    ) {
        if !self.enabled {
            return;
        }
        let body = SpanCompleteRequest { output_data, error, tokens_input, tokens_output, cost_usd };
        let url = format!("{}/api/spans/{span_id}/complete", self.base_url);

        let mut req = self.http.patch(&url).json(&body).timeout(DEFAULT_TIMEOUT);
        for (k, v) in self.headers() {
            req = req.header(k, v);
        }

        if let Err(e) = req.send().await {
            tracing::warn!(error = %e, span_id = %span_id, "failed to complete span");
        }
    }

    pub async fn complete_trace(&self, trace_id: TraceId, output: Option<String>) {
        if !self.enabled {
            return;
        }
        let body = TraceCompleteRequest { output, metadata: None };
        let url = format!("{}/api/traces/{trace_id}/complete", self.base_url);

        let mut req = self.http.patch(&url).json(&body).timeout(DEFAULT_TIMEOUT);
        for (k, v) in self.headers() {
            req = req.header(k, v);
        }

        if let Err(e) = req.send().await {
            tracing::warn!(error = %e, trace_id = %trace_id, "failed to complete trace");
        }
    }
}

/// Handle to an in-flight trace. Dropping it without calling `complete()`
/// still issues the completion PATCH, spawned onto the ambient tokio
/// runtime — mirrors the Python client's `__aexit__` semantics.
#[must_use]
pub struct TraceHandle {
    client: Arc<TracerClient>,
    trace_id: Option<TraceId>,
    output: Option<String>,
    completed: bool,
}

impl TraceHandle {
    pub fn trace_id(&self) -> Option<TraceId> {
        self.trace_id
    }

    pub fn set_output(&mut self, output: impl Into<String>) {
        self.output = Some(output.into());
    }

    pub async fn span(
        &self,
        name: impl Into<String>,
        span_type: impl Into<String>,
        input_data: Option<Value>,
        metadata: Option<HashMap<String, Value>>,
        model: Option<String>,
    ) -> SpanHandle {
        let span_id = match self.trace_id {
            Some(trace_id) => {
                self.client
                    .create_span(trace_id, name.into(), span_type.into(), input_data, metadata, model, None)
                    .await
            }
            None => None,
        };
        SpanHandle {
            client: self.client.clone(),
            trace_id: self.trace_id,
            span_id,
            output_data: None,
            error: None,
            tokens_input: None,
            tokens_output: None,
            cost_usd: None,
            completed: false,
        }
    }

    /// Explicitly complete the trace, consuming the handle so `Drop` is a no-op.
    pub async fn complete(mut self) {
        if let Some(trace_id) = self.trace_id {
            self.client.complete_trace(trace_id, self.output.take()).await;
        }
        self.completed = true;
    }
}

impl Drop for TraceHandle {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        let Some(trace_id) = self.trace_id else { return };
        let client = self.client.clone();
        let output = self.output.take();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                client.complete_trace(trace_id, output).await;
            });
        }
    }
}

/// Handle to an in-flight span, possibly nested under another span via
/// `span()`. Same drop-completes contract as `TraceHandle`.
#[must_use]
pub struct SpanHandle {
    client: Arc<TracerClient>,
    trace_id: Option<TraceId>,
    span_id: Option<SpanId>,
    output_data: Option<Value>,
    error: Option<String>,
    tokens_input: Option<u64>,
    tokens_output: Option<u64>,
    cost_usd: Option<Decimal>,
    completed: bool,
}

impl SpanHandle {
    pub fn span_id(&self) -> Option<SpanId> {
        self.span_id
    }

    pub fn set_output(
        &mut self,
        output_data: Option<Value>,
        tokens_input: Option<u64>,
        tokens_output: Option<u64>,
        cost_usd: Option<Decimal>,
    ) {
        self.output_data = output_data;
        self.tokens_input = tokens_input;
        self.tokens_output = tokens_output;
        self.cost_usd = cost_usd;
    }

    pub fn set_error(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
    }

    pub async fn span(
        &self,
        name: impl Into<String>,
        span_type: impl Into<String>,
        input_data: Option<Value>,
        metadata: Option<HashMap<String, Value>>,
        model: Option<String>,
    ) -> SpanHandle {
        let child_span_id = match (self.trace_id, self.span_id) {
            (Some(trace_id), Some(parent_span_id)) => {
                self.client
                    .create_span(
                        trace_id,
                        name.into(),
                        span_type.into(),
                        input_data,
                        metadata,
                        model,
                        Some(parent_span_id),
                    )
                    .await
            }
            _ => None,
        };
        SpanHandle {
            client: self.client.clone(),
            trace_id: self.trace_id,
            span_id: child_span_id,
            output_data: None,
            error: None,
            tokens_input: None,
            tokens_output: None,
            cost_usd: None,
            completed: false,
        }
    }

    pub async fn complete(mut self) {
        if let Some(span_id) = self.span_id {
            self.client
                .complete_span(
                    span_id,
                    self.output_data.take(),
                    self.error.take(),
                    self.tokens_input,
                    self.tokens_output,
                    self.cost_usd,
                )
                .await;
        }
        self.completed = true;
    }
}

impl Drop for SpanHandle {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        let Some(span_id) = self.span_id else { return };
        let client = self.client.clone();
        let output_data = self.output_data.take();
        let error = self.error.take();
        let tokens_input = self.tokens_input;
        let tokens_output = self.tokens_output;
        let cost_usd = self.cost_usd;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                client.complete_span(span_id, output_data, error, tokens_input, tokens_output, cost_usd).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_client_never_calls_out() {
        let client = Arc::new(TracerClient::disabled());
        let mut trace = client.trace("noop").await;
        assert!(trace.trace_id().is_none());
        trace.set_output("done");
        let span = trace.span("step", "function", None, None, None).await;
        assert!(span.span_id().is_none());
        span.complete().await;
        trace.complete().await;
    }

    #[test]
    fn project_id_is_extracted_from_api_key() {
        let client = TracerClient::new("http://localhost:8080", "project-acme");
        assert_eq!(client.project_id.as_deref(), Some("acme"));
    }
}
