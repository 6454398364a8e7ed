//! `POST /v1/chat/completions`: resolve a provider, enforce the caller's
//! capabilities and relay the canonical stream as SSE or a single reply.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use metrics::counter;
use plugmyai_core::{CompletionChunk, CompletionRequest, Usage, ids};
use plugmyai_providers::CompletionStream;
use plugmyai_providers::stream::STREAM_CAPACITY;
use plugmyai_store::{HistoryEntry, HistoryStatus, Store};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::AppState;
use crate::auth::Caller;
use crate::error::ApiError;

pub async fn handle_completion(
    state: AppState,
    caller: Caller,
    mut req: CompletionRequest,
) -> Result<Response, ApiError> {
    if req.messages.is_empty() {
        return Err(ApiError::InvalidRequest("messages array is required".into()));
    }
    let provider = state
        .registry
        .find_provider(&req.model)
        .await
        .cloned()
        .ok_or_else(|| ApiError::NoProviderAvailable(req.model.clone()))?;
    if !caller.allows(provider.id()) {
        return Err(ApiError::Forbidden(format!(
            "app is not allowed to use provider: {}",
            provider.id()
        )));
    }
    req.scope = caller.scope;

    let draft = HistoryDraft::new(state.store.clone(), &caller, &req, provider.id());
    let cancel = CancellationToken::new();
    let stream = match provider.complete(&cancel, &req).await {
        Ok(stream) => stream,
        Err(e) => {
            let message = e.to_string();
            warn!(provider = provider.id(), error = %message, "completion failed to start");
            draft.finish(&Transcript::failed(message.clone()));
            return Err(ApiError::Upstream(message));
        }
    };
    debug!(provider = provider.id(), model = %req.model, stream = req.stream, scope = %req.scope, "completion started");

    let deadline = Instant::now() + state.request_timeout;
    let meta = ResponseMeta::new(&req.model);
    if req.stream {
        Ok(stream_response(stream, draft, meta, deadline))
    } else {
        let transcript = collect(stream, deadline).await;
        draft.finish(&transcript);
        match transcript.error {
            Some(message) => Err(ApiError::Upstream(message)),
            None => Ok(Json(meta.reply(&transcript)).into_response()),
        }
    }
}

/// Identity shared by every frame of one response.
struct ResponseMeta {
    id: String,
    created: i64,
    model: String,
}

impl ResponseMeta {
    fn new(model: &str) -> Self {
        Self {
            id: format!("chatcmpl-{}", ids::short_id()),
            created: Utc::now().timestamp(),
            model: model.to_string(),
        }
    }

    /// One `chat.completion.chunk` frame per canonical chunk.
    fn frame(&self, chunk: &CompletionChunk) -> Value {
        let mut frame = json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
        });
        match chunk {
            CompletionChunk::Delta { text } => {
                frame["choices"] = json!([{
                    "index": 0,
                    "delta": {"content": text},
                    "finish_reason": null,
                }]);
            }
            CompletionChunk::Done {
                finish_reason,
                usage,
            } => {
                frame["choices"] = json!([{
                    "index": 0,
                    "delta": {},
                    "finish_reason": finish_reason,
                }]);
                if let Some(usage) = usage {
                    frame["usage"] = usage_json(usage);
                }
            }
            CompletionChunk::Error { message } => {
                frame["choices"] = json!([]);
                frame["error"] = json!({"message": message, "type": "upstream_error"});
            }
        }
        frame
    }

    fn reply(&self, transcript: &Transcript) -> Value {
        json!({
            "id": self.id,
            "object": "chat.completion",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": transcript.text},
                "finish_reason": transcript.finish_reason.as_deref().unwrap_or("stop"),
            }],
            "usage": usage_json(&transcript.usage.unwrap_or_default()),
        })
    }
}

fn usage_json(usage: &Usage) -> Value {
    json!({
        "prompt_tokens": usage.prompt_tokens,
        "completion_tokens": usage.completion_tokens,
        "total_tokens": usage.total_tokens,
    })
}

/// Everything a finished completion produced, in arrival order.
#[derive(Debug, Default)]
struct Transcript {
    text: String,
    finish_reason: Option<String>,
    usage: Option<Usage>,
    error: Option<String>,
}

impl Transcript {
    fn failed(message: String) -> Self {
        Self {
            error: Some(message),
            ..Default::default()
        }
    }

    fn push(&mut self, chunk: CompletionChunk) {
        match chunk {
            CompletionChunk::Delta { text } => self.text.push_str(&text),
            CompletionChunk::Done {
                finish_reason,
                usage,
            } => {
                self.finish_reason = Some(finish_reason);
                self.usage = usage;
            }
            CompletionChunk::Error { message } => self.error = Some(message),
        }
    }

    fn is_complete(&self) -> bool {
        self.finish_reason.is_some() || self.error.is_some()
    }
}

/// Pull the next chunk, or an error terminal once `deadline` passes.
async fn next_before(stream: &mut CompletionStream, deadline: Instant) -> Option<CompletionChunk> {
    tokio::select! {
        chunk = stream.next() => chunk,
        _ = tokio::time::sleep_until(deadline) => {
            stream.cancel();
            Some(CompletionChunk::error("request timed out"))
        }
    }
}

async fn collect(mut stream: CompletionStream, deadline: Instant) -> Transcript {
    let mut transcript = Transcript::default();
    while let Some(chunk) = next_before(&mut stream, deadline).await {
        let terminal = chunk.is_terminal();
        transcript.push(chunk);
        if terminal {
            break;
        }
    }
    transcript
}

fn stream_response(
    mut stream: CompletionStream,
    draft: HistoryDraft,
    meta: ResponseMeta,
    deadline: Instant,
) -> Response {
    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(STREAM_CAPACITY);
    tokio::spawn(async move {
        let mut transcript = Transcript::default();
        let mut disconnected = false;
        loop {
            let next = tokio::select! {
                biased;
                _ = tx.closed() => {
                    disconnected = true;
                    break;
                }
                next = next_before(&mut stream, deadline) => next,
            };
            let Some(chunk) = next else { break };
            let event = Event::default().data(meta.frame(&chunk).to_string());
            let terminal = chunk.is_terminal();
            transcript.push(chunk);
            if tx.send(Ok(event)).await.is_err() {
                disconnected = true;
                break;
            }
            if terminal {
                let _ = tx.send(Ok(Event::default().data("[DONE]"))).await;
                break;
            }
        }
        if disconnected && !transcript.is_complete() {
            stream.cancel();
            debug!(id = %meta.id, "client disconnected mid-stream");
            transcript.error = Some("client disconnected".into());
        }
        draft.finish(&transcript);
    });
    Sse::new(ReceiverStream::new(rx)).into_response()
}

/// The parts of a history entry known before the backend answers.
///
/// Dropped unfinished (the client went away while the handler was
/// suspended), it records the request as disconnected.
struct HistoryDraft {
    store: Arc<Store>,
    app_id: String,
    app_name: String,
    model: String,
    provider: &'static str,
    messages: Value,
    started: Instant,
    created_at: DateTime<Utc>,
    written: bool,
}

impl HistoryDraft {
    fn new(store: Arc<Store>, caller: &Caller, req: &CompletionRequest, provider: &'static str) -> Self {
        Self {
            store,
            app_id: caller.app_id.clone(),
            app_name: caller.app_name.clone(),
            model: req.model.clone(),
            provider,
            messages: serde_json::to_value(&req.messages).unwrap_or_else(|_| json!([])),
            started: Instant::now(),
            created_at: Utc::now(),
            written: false,
        }
    }

    /// Write exactly one entry. Failures are logged, never surfaced.
    fn finish(mut self, transcript: &Transcript) {
        self.write(transcript);
    }

    fn write(&mut self, transcript: &Transcript) {
        if self.written {
            return;
        }
        self.written = true;
        let usage = transcript.usage.unwrap_or_default();
        let status = match transcript.error {
            Some(_) => HistoryStatus::Error,
            None => HistoryStatus::Success,
        };
        counter!("completions_total", 1, "provider" => self.provider, "status" => status.as_str());
        let entry = HistoryEntry {
            id: ids::short_id(),
            app_id: std::mem::take(&mut self.app_id),
            app_name: std::mem::take(&mut self.app_name),
            model: std::mem::take(&mut self.model),
            provider: self.provider.to_string(),
            messages: self.messages.take(),
            response: json!({"content": transcript.text}),
            tokens_in: usage.prompt_tokens,
            tokens_out: usage.completion_tokens,
            duration_ms: duration_ms(self.started.elapsed()),
            status,
            error_message: transcript.error.clone(),
            created_at: self.created_at,
        };
        if let Err(e) = self.store.log_history(&entry) {
            error!(error = %e, history_id = %entry.id, "failed to log history");
        }
    }
}

impl Drop for HistoryDraft {
    fn drop(&mut self) {
        if !self.written {
            debug!(provider = self.provider, "completion abandoned before it finished");
            self.write(&Transcript::failed("client disconnected".into()));
        }
    }
}

fn duration_ms(elapsed: Duration) -> i64 {
    i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcript_concatenates_in_order() {
        let mut t = Transcript::default();
        for chunk in [
            CompletionChunk::delta("Hel"),
            CompletionChunk::delta("lo"),
            CompletionChunk::done(Some(Usage::new(2, 1))),
        ] {
            t.push(chunk);
        }
        assert_eq!(t.text, "Hello");
        assert_eq!(t.finish_reason.as_deref(), Some("stop"));
        assert_eq!(t.usage.map(|u| u.total_tokens), Some(3));
        assert!(t.is_complete());
    }

    #[test]
    fn frames_share_identity() {
        let meta = ResponseMeta::new("claude");
        let delta = meta.frame(&CompletionChunk::delta("A"));
        let done = meta.frame(&CompletionChunk::done(None));
        assert_eq!(delta["id"], done["id"]);
        assert_eq!(delta["created"], done["created"]);
        assert_eq!(delta["choices"][0]["delta"]["content"], "A");
        assert_eq!(done["choices"][0]["finish_reason"], "stop");
        assert!(done.get("usage").is_none());

        let err = meta.frame(&CompletionChunk::error("boom"));
        assert_eq!(err["choices"], json!([]));
        assert_eq!(err["error"]["message"], "boom");
    }

    #[tokio::test]
    async fn collect_times_out() {
        let parent = CancellationToken::new();
        let (_sender, stream) = CompletionStream::channel(&parent);
        let t = collect(stream, Instant::now() + Duration::from_millis(20)).await;
        assert_eq!(t.error.as_deref(), Some("request timed out"));
    }
}
