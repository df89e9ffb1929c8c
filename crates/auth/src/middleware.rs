use std::collections::HashSet;

use async_trait::async_trait;
use axum::extract::{FromRef, FromRequestParts};
use axum::http::request::Parts;

use crate::error::AuthError;

const HEADER: &str = "x-api-key";
const KEY_PREFIX: &str = "project-";

/// Deployment-wide authorization settings, built by the `daemon` crate from
/// config/env and handed to the router as shared state.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// When `false`, any (or no) key is accepted and `default_project_key`
    /// stands in — spec.md §4.3's "local development" mode switch.
    pub required: bool,
    pub valid_keys: HashSet<String>,
    pub default_project_key: String,
}

impl AuthConfig {
    pub fn new(required: bool, valid_keys: Vec<String>, default_project_key: String) -> Self {
        Self {
            required,
            valid_keys: valid_keys.into_iter().collect(),
            default_project_key,
        }
    }

    /// Disabled auth, accepting everything as `project-default` — the
    /// crate's own `Default` mirrors the documented env-var default.
    pub fn disabled() -> Self {
        Self {
            required: false,
            valid_keys: HashSet::new(),
            default_project_key: "project-default".to_string(),
        }
    }
}

/// The caller's project, recovered from the `X-API-Key` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub project_id: String,
}

fn strip_project_prefix(key: &str) -> Result<String, AuthError> {
    let project_id = key.strip_prefix(KEY_PREFIX).ok_or(AuthError::InvalidFormat)?;
    if project_id.is_empty() {
        return Err(AuthError::InvalidFormat);
    }
    Ok(project_id.to_string())
}

/// Extractor for the caller's authorization context. Pulled in ahead of the
/// handler body on every protected route; public routes (`/health`) simply
/// don't declare it as a parameter.
#[derive(Clone)]
pub struct Auth(pub AuthContext);

#[async_trait]
impl<S> FromRequestParts<S> for Auth
where
    AuthConfig: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let config = AuthConfig::from_ref(state);
        let header = parts
            .headers
            .get(HEADER)
            .map(|v| v.to_str().map_err(|_| AuthError::InvalidFormat))
            .transpose()?;

        let key = match header {
            Some(key) => key.to_string(),
            None if !config.required => config.default_project_key.clone(),
            None => return Err(AuthError::MissingKey),
        };

        let project_id = strip_project_prefix(&key)?;

        if config.required && !config.valid_keys.contains(&key) {
            tracing::warn!(project_id, "rejected unknown API key");
            return Err(AuthError::UnknownKey);
        }

        Ok(Auth(AuthContext { project_id }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_well_formed_prefix() {
        assert_eq!(strip_project_prefix("project-acme").unwrap(), "acme");
    }

    #[test]
    fn rejects_missing_prefix() {
        assert!(matches!(strip_project_prefix("acme"), Err(AuthError::InvalidFormat)));
    }

    #[test]
    fn rejects_empty_remainder() {
        assert!(matches!(strip_project_prefix("project-"), Err(AuthError::InvalidFormat)));
    }
}
