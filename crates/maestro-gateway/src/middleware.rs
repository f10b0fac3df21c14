use crate::server::ApiError;
use axum::{
    extract::{Query, Request, State},
    middleware::Next,
    response::Response,
};
use maestro_core::MaestroError;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

/// API keys accepted by the gateway. An empty set leaves the gateway open.
#[derive(Clone, Debug, Default)]
pub struct ApiKeys {
    keys: HashSet<String>,
}

#[derive(Deserialize)]
struct KeyParam {
    api_key: Option<String>,
}

impl ApiKeys {
    /// Accept exactly `keys`. Blank entries are ignored.
    pub fn new(keys: impl IntoIterator<Item = String>) -> Self {
        Self {
            keys: keys
                .into_iter()
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    /// Whether requests must present a key.
    pub fn is_enabled(&self) -> bool {
        !self.keys.is_empty()
    }

    /// Number of accepted keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether no key is configured.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Check the key carried by `request`.
    ///
    /// The key is read from `Authorization: Bearer <key>`, falling back to the
    /// `api_key` query parameter.
    pub fn authorize(&self, request: &Request) -> Result<(), MaestroError> {
        if !self.is_enabled() {
            return Ok(());
        }
        match presented_key(request) {
            Some(key) if self.keys.contains(&key) => Ok(()),
            Some(_) => Err(MaestroError::Unauthorized("invalid API key".into())),
            None => Err(MaestroError::Unauthorized("API key required".into())),
        }
    }
}

fn presented_key(request: &Request) -> Option<String> {
    let bearer = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);
    bearer.or_else(|| {
        Query::<KeyParam>::try_from_uri(request.uri())
            .ok()
            .and_then(|Query(p)| p.api_key)
    })
}

/// Rejects requests without an accepted key using the gateway's JSON error
/// body (`{"error", "code": "Unauthorized"}`, status 401).
pub async fn require_api_key(
    State(keys): State<Arc<ApiKeys>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Err(e) = keys.authorize(&request) {
        warn!(path = %request.uri().path(), error = %e, "Rejected request");
        return Err(e.into());
    }
    Ok(next.run(request).await)
}
