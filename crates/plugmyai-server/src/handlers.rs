use std::time::Duration;

use axum::Json;
use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::response::Response;
use metrics::counter;
use plugmyai_core::{CompletionChunk, CompletionRequest, Message, Scope};
use plugmyai_store::{App, ConnectRequest, HistoryEntry, HistoryFilter, HistorySort};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::AppState;
use crate::auth::{AdminCaller, AppCaller};
use crate::completions::handle_completion;
use crate::error::ApiError;
use crate::pairing::{ConnectParams, ConnectStarted, Decision, OfferableProviders, PollResponse};

const PROVIDER_TEST_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn status(State(state): State<AppState>) -> Json<Value> {
    counter!("requests_total", 1, "endpoint" => "status");
    let providers: Vec<&str> = state
        .registry
        .available()
        .await
        .into_iter()
        .map(|p| p.name())
        .collect();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_s": state.started_at.elapsed().as_secs(),
        "port": state.port,
        "providers": providers,
    }))
}

pub async fn models(State(state): State<AppState>, AppCaller(caller): AppCaller) -> Json<Value> {
    counter!("requests_total", 1, "endpoint" => "models");
    let mut data = Vec::new();
    for provider in state.registry.available().await {
        if !caller.allows(provider.id()) {
            continue;
        }
        for model in provider.models().await {
            data.push(json!({
                "id": model.id,
                "object": "model",
                "created": state.started_unix,
                "owned_by": model.provider,
            }));
        }
    }
    Json(json!({"object": "list", "data": data}))
}

pub async fn chat_completions(
    State(state): State<AppState>,
    AppCaller(caller): AppCaller,
    payload: Result<Json<CompletionRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    counter!("requests_total", 1, "endpoint" => "chat_completions");
    let Json(req) = payload?;
    handle_completion(state, caller, req).await
}

pub async fn connect(
    State(state): State<AppState>,
    payload: Result<Json<ConnectParams>, JsonRejection>,
) -> Result<Json<ConnectStarted>, ApiError> {
    counter!("requests_total", 1, "endpoint" => "connect");
    let Json(params) = payload?;
    Ok(Json(state.pairing.start(params)?))
}

pub async fn connect_poll(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PollResponse>, ApiError> {
    Ok(Json(state.pairing.poll(&id)?))
}

#[derive(Debug, Default, Deserialize)]
struct ApproveParams {
    #[serde(default)]
    providers: Vec<String>,
    #[serde(default)]
    scope: Option<String>,
}

/// An empty body approves with the requested scope and no provider
/// restriction.
pub async fn connect_approve(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Decision>, ApiError> {
    let params: ApproveParams = if body.iter().all(u8::is_ascii_whitespace) {
        ApproveParams::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::InvalidRequest(format!("invalid request body: {e}")))?
    };
    let scope = match params.scope.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(s) => Some(
            s.parse::<Scope>()
                .map_err(|e| ApiError::InvalidRequest(e.to_string()))?,
        ),
    };
    Ok(Json(state.pairing.approve(&id, params.providers, scope)?))
}

pub async fn connect_deny(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Decision>, ApiError> {
    Ok(Json(state.pairing.deny(&id)?))
}

pub async fn connect_pending(
    State(state): State<AppState>,
) -> Result<Json<Vec<ConnectRequest>>, ApiError> {
    Ok(Json(state.pairing.pending()?))
}

pub async fn connect_providers(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<OfferableProviders>, ApiError> {
    Ok(Json(state.pairing.offerable_providers(&id).await?))
}

/// Query string of `GET /v1/history`; malformed numbers fall back to defaults.
#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    limit: Option<String>,
    offset: Option<String>,
    app_name: Option<String>,
    sort: Option<String>,
}

impl HistoryQuery {
    fn into_filter(self) -> HistoryFilter {
        HistoryFilter {
            limit: self.limit.and_then(|v| v.trim().parse().ok()),
            offset: self
                .offset
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0),
            app_name: self.app_name,
            sort: self
                .sort
                .as_deref()
                .map(HistorySort::parse_lenient)
                .unwrap_or_default(),
        }
    }
}

pub async fn history_list(
    State(state): State<AppState>,
    _admin: AdminCaller,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Value>, ApiError> {
    let (entries, total) = state.store.list_history_filtered(&query.into_filter())?;
    Ok(Json(json!({"entries": entries, "total": total})))
}

pub async fn history_delete(
    State(state): State<AppState>,
    _admin: AdminCaller,
) -> Result<Json<Value>, ApiError> {
    let deleted = state.store.delete_all_history()?;
    info!(deleted, "history cleared");
    Ok(Json(json!({"status": "ok"})))
}

pub async fn history_get(
    State(state): State<AppState>,
    _admin: AdminCaller,
    Path(id): Path<String>,
) -> Result<Json<HistoryEntry>, ApiError> {
    state
        .store
        .get_history_entry(&id)?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("history entry not found".into()))
}

pub async fn providers(State(state): State<AppState>, _admin: AdminCaller) -> Json<Value> {
    let mut data = Vec::new();
    for provider in state.registry.all() {
        let available = provider.available().await;
        let models = provider.models().await;
        data.push(json!({
            "id": provider.id(),
            "name": provider.name(),
            "available": available,
            "models": models,
        }));
    }
    Json(Value::Array(data))
}

fn mask_token(token: &str) -> String {
    let visible: String = token.chars().take(8).collect();
    format!("{visible}...")
}

pub async fn apps_list(
    State(state): State<AppState>,
    _admin: AdminCaller,
) -> Result<Json<Vec<App>>, ApiError> {
    let mut apps = state.store.list_apps()?;
    for app in &mut apps {
        app.token = mask_token(&app.token);
    }
    Ok(Json(apps))
}

pub async fn apps_revoke(
    State(state): State<AppState>,
    _admin: AdminCaller,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !state.store.revoke_app(&id)? {
        return Err(ApiError::NotFound("app not found".into()));
    }
    info!(app_id = %id, "app revoked");
    Ok(Json(json!({"status": "revoked"})))
}

pub async fn onboarding_status(State(state): State<AppState>, _admin: AdminCaller) -> Json<Value> {
    let mut providers = Vec::new();
    for provider in state.registry.all() {
        let available = provider.available().await;
        providers.push(json!({
            "id": provider.id(),
            "name": provider.name(),
            "available": available,
        }));
    }
    let setup_complete = state.config.read().await.setup_complete;
    Json(json!({"setup_complete": setup_complete, "providers": providers}))
}

#[derive(Debug, Deserialize)]
pub struct TestProviderParams {
    #[serde(default)]
    provider_id: String,
}

/// Run a short real completion and report whether the backend works.
pub async fn onboarding_test_provider(
    State(state): State<AppState>,
    _admin: AdminCaller,
    payload: Result<Json<TestProviderParams>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(params) = payload?;
    let Some(provider) = state.registry.find_by_id(&params.provider_id) else {
        return Ok(Json(failure(format!("unknown provider: {}", params.provider_id))));
    };
    if !provider.available().await {
        return Ok(Json(failure(format!(
            "{} is not installed or not reachable",
            provider.name()
        ))));
    }

    let req = CompletionRequest {
        messages: vec![Message::user("Respond with just the word 'ok'")],
        stream: true,
        ..Default::default()
    };
    let cancel = CancellationToken::new();
    let mut stream = match provider.complete(&cancel, &req).await {
        Ok(stream) => stream,
        Err(e) => return Ok(Json(failure(format!("failed to start test: {e}")))),
    };

    let drained = tokio::time::timeout(PROVIDER_TEST_TIMEOUT, async {
        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                CompletionChunk::Delta { text: t } => text.push_str(&t),
                CompletionChunk::Done { .. } => return Ok(text),
                CompletionChunk::Error { message } => return Err(message),
            }
        }
        Ok(text)
    })
    .await;
    cancel.cancel();

    let outcome = match drained {
        Ok(Ok(text)) => json!({"success": true, "message": text.trim()}),
        Ok(Err(message)) => failure(with_auth_hint(message)),
        Err(_) => failure("provider test timed out".into()),
    };
    Ok(Json(outcome))
}

fn failure(message: String) -> Value {
    json!({"success": false, "error": message})
}

fn with_auth_hint(message: String) -> String {
    if ["auth", "credential", "login"]
        .iter()
        .any(|needle| message.contains(needle))
    {
        format!("{message} (try running the CLI in a terminal to sign in)")
    } else {
        message
    }
}

/// Persist `setup_complete = true`; the in-memory flag is restored if the
/// write fails.
pub async fn onboarding_complete(
    State(state): State<AppState>,
    _admin: AdminCaller,
) -> Result<Json<Value>, ApiError> {
    let mut config = state.config.write().await;
    let previous = config.setup_complete;
    config.setup_complete = true;
    if let Err(e) = config.save() {
        config.setup_complete = previous;
        error!(error = %e, "failed to save config");
        return Err(ApiError::Internal(format!("failed to save config: {e}")));
    }
    info!("onboarding complete");
    Ok(Json(json!({"status": "ok"})))
}

pub async fn metrics_endpoint(State(state): State<AppState>) -> String {
    state.metrics.render()
}
