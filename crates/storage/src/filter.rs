/// Post-query filters applied in memory after a `project-time-index` query,
/// per spec.md §4.5. A trace matches if every `Some` field is satisfied;
/// `tags` matches if the trace has *any* of the listed tags.
#[derive(Debug, Default, Clone)]
pub struct TraceListFilter {
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub tags: Vec<String>,
}

impl TraceListFilter {
    pub fn matches(&self, trace: &trace::Trace) -> bool {
        if let Some(uid) = &self.user_id {
            if trace.user_id.as_deref() != Some(uid.as_str()) {
                return false;
            }
        }
        if let Some(sid) = &self.session_id {
            if trace.session_id.as_deref() != Some(sid.as_str()) {
                return false;
            }
        }
        if !self.tags.is_empty() {
            let trace_tags = trace.tags.as_deref().unwrap_or(&[]);
            if !self.tags.iter().any(|t| trace_tags.contains(t)) {
                return false;
            }
        }
        true
    }
}
