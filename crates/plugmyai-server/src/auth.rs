use axum::async_trait;
use axum::extract::{FromRequestParts, Query};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use plugmyai_core::Scope;
use serde::Deserialize;

use crate::AppState;
use crate::error::ApiError;

/// Identity and capabilities of an authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub app_id: String,
    pub app_name: String,
    pub scope: Scope,
    /// Empty means every provider is allowed.
    pub allowed_providers: Vec<String>,
    pub is_admin: bool,
}

impl Caller {
    pub fn admin() -> Self {
        Self {
            app_id: "admin".into(),
            app_name: "admin".into(),
            scope: Scope::Full,
            allowed_providers: Vec::new(),
            is_admin: true,
        }
    }

    pub fn allows(&self, provider_id: &str) -> bool {
        self.allowed_providers.is_empty() || self.allowed_providers.iter().any(|p| p == provider_id)
    }
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Bearer token from the `Authorization` header, else the `token` query
/// parameter.
fn bearer_token(parts: &Parts) -> Option<String> {
    let header = parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split_once(' '))
        .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("bearer"))
        .map(|(_, token)| token.trim())
        .filter(|t| !t.is_empty());
    if let Some(token) = header {
        return Some(token.to_string());
    }
    Query::<TokenQuery>::try_from_uri(&parts.uri)
        .ok()
        .and_then(|Query(q)| q.token)
        .filter(|t| !t.is_empty())
}

/// Resolve a token to a caller: the admin token, or a paired app that has
/// not been revoked.
pub fn authorize(state: &AppState, token: Option<&str>) -> Result<Caller, ApiError> {
    let token =
        token.ok_or_else(|| ApiError::Unauthorized("missing authorization token".into()))?;
    if token == &*state.admin_token {
        return Ok(Caller::admin());
    }
    let app = state
        .store
        .get_app_by_token(token)?
        .ok_or_else(|| ApiError::Unauthorized("invalid or revoked token".into()))?;
    Ok(Caller {
        app_id: app.id,
        app_name: app.name,
        scope: app.scope,
        allowed_providers: app.providers,
        is_admin: false,
    })
}

/// Any authorized caller: a paired app or the admin.
pub struct AppCaller(pub Caller);

#[async_trait]
impl FromRequestParts<AppState> for AppCaller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        authorize(state, bearer_token(parts).as_deref()).map(AppCaller)
    }
}

/// Admin-only endpoints.
pub struct AdminCaller;

#[async_trait]
impl FromRequestParts<AppState> for AdminCaller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let caller = authorize(state, bearer_token(parts).as_deref())?;
        if !caller.is_admin {
            return Err(ApiError::Forbidden("admin access required".into()));
        }
        Ok(AdminCaller)
    }
}
