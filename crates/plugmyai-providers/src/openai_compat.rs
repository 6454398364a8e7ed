use std::time::Duration;

use futures::TryStreamExt;
use plugmyai_core::{CompletionChunk, CompletionRequest, Message, Model, ProviderConfig, Usage};
use reqwest::header::ACCEPT;
use serde::{Deserialize, Serialize};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::stream::{pump_lines, CompletionStream, Parsed, PumpEnd};
use crate::{Provider, ProviderError};

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434/v1";

const LIVENESS_TIMEOUT: Duration = Duration::from_secs(2);
const MODELS_TIMEOUT: Duration = Duration::from_secs(5);
const ERROR_BODY_LIMIT: usize = 1024;

/// Adapter for any HTTP API speaking the OpenAI chat-completions protocol
/// (Ollama, LM Studio, vLLM and the like).
#[derive(Debug, Clone)]
pub struct OpenAiCompat {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct UpstreamRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

/// Payload of one `data:` line.
#[derive(Deserialize)]
struct StreamPayload {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<UpstreamUsage>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<ChoiceDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct UpstreamUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

impl OpenAiCompat {
    pub const ID: &'static str = "openai-compat";
    pub const NAME: &'static str = "OpenAI Compatible";

    pub fn new(base_url: Option<String>, api_key: Option<String>) -> Result<Self, ProviderError> {
        let base_url = base_url
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.into());
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ProviderError::InvalidSettings {
                provider: Self::ID,
                message: format!("base_url must be an http(s) URL, got '{base_url}'"),
            });
        }
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
        })
    }

    pub fn from_config(cfg: &ProviderConfig) -> Result<Provider, ProviderError> {
        let s = &cfg.settings;
        Self::new(s.base_url.clone(), s.api_key.clone()).map(Provider::OpenAiCompat)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.authorize(self.http.get(format!("{}{path}", self.base_url)))
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    /// Live probe of `GET /models`.
    pub async fn available(&self) -> bool {
        match self.get("/models").timeout(LIVENESS_TIMEOUT).send().await {
            Ok(resp) => resp.status() == reqwest::StatusCode::OK,
            Err(e) => {
                debug!(provider = Self::ID, error = %e, "liveness probe failed");
                false
            }
        }
    }

    pub async fn models(&self) -> Vec<Model> {
        match self.fetch_models().await {
            Ok(models) => models,
            Err(e) => {
                debug!(provider = Self::ID, error = %e, "listing models failed");
                Vec::new()
            }
        }
    }

    async fn fetch_models(&self) -> Result<Vec<Model>, ProviderError> {
        let resp = self.get("/models").timeout(MODELS_TIMEOUT).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Http { status, text });
        }
        let list = resp.json::<ModelList>().await?;
        Ok(list
            .data
            .into_iter()
            .map(|m| Model::new(m.id.clone(), m.id, Self::ID))
            .collect())
    }

    pub async fn complete(
        &self,
        cancel: &CancellationToken,
        req: &CompletionRequest,
    ) -> Result<CompletionStream, ProviderError> {
        let body = UpstreamRequest {
            model: &req.model,
            messages: &req.messages,
            stream: true,
            temperature: req.temperature,
            max_tokens: req.max_tokens,
        };
        let send = self
            .authorize(self.http.post(format!("{}/chat/completions", self.base_url)))
            .header(ACCEPT, "text/event-stream")
            .json(&body)
            .send();
        let resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            resp = send => resp?,
        };
        if !resp.status().is_success() {
            let status = resp.status();
            let mut text = resp.text().await.unwrap_or_default();
            truncate(&mut text, ERROR_BODY_LIMIT);
            return Err(ProviderError::Http { status, text });
        }

        let (sender, stream) = CompletionStream::channel(cancel);
        let body = StreamReader::new(resp.bytes_stream().map_err(std::io::Error::other));
        tokio::spawn(async move {
            let mut events = EventState::default();
            let end = pump_lines(body, &sender, Self::ID, |line| events.accept(line)).await;
            if end == PumpEnd::Eof {
                sender.send(events.finish()).await;
            }
        });
        Ok(stream)
    }
}

fn truncate(text: &mut String, limit: usize) {
    if text.len() <= limit {
        return;
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
}

/// Finish reason and usage seen so far on an SSE body.
#[derive(Debug, Default)]
struct EventState {
    finish_reason: Option<String>,
    usage: Option<Usage>,
}

impl EventState {
    fn accept(&mut self, line: &str) -> Parsed {
        let Some(data) = line.strip_prefix("data:") else {
            return Parsed::Empty;
        };
        let data = data.trim_start();
        if data == "[DONE]" {
            return Parsed::Chunk(self.done());
        }
        let Ok(payload) = serde_json::from_str::<StreamPayload>(data) else {
            return Parsed::Skipped;
        };
        if let Some(u) = payload.usage {
            self.usage = Some(Usage::new(u.prompt_tokens, u.completion_tokens));
        }
        let Some(choice) = payload.choices.into_iter().next() else {
            return Parsed::Empty;
        };
        if let Some(reason) = choice.finish_reason.filter(|r| !r.is_empty()) {
            self.finish_reason = Some(reason);
        }
        match choice.delta.and_then(|d| d.content) {
            Some(text) if !text.is_empty() => Parsed::Chunk(CompletionChunk::delta(text)),
            _ => Parsed::Empty,
        }
    }

    fn done(&mut self) -> CompletionChunk {
        CompletionChunk::Done {
            finish_reason: self.finish_reason.take().unwrap_or_else(|| "stop".into()),
            usage: self.usage.take(),
        }
    }

    /// Terminal for a body that ended without `[DONE]`.
    fn finish(&mut self) -> CompletionChunk {
        if self.finish_reason.is_some() {
            self.done()
        } else {
            CompletionChunk::error("openai-compat: stream ended before completion")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sse(lines: &[&str]) -> ResponseTemplate {
        let body: String = lines.iter().map(|l| format!("{l}\n\n")).collect();
        ResponseTemplate::new(200).set_body_raw(body, "text/event-stream")
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            model: "llama3".into(),
            messages: vec![Message::user("hi")],
            max_tokens: Some(16),
            ..Default::default()
        }
    }

    async fn drain(mut stream: CompletionStream) -> Vec<CompletionChunk> {
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.push(chunk);
        }
        out
    }

    #[tokio::test]
    async fn streams_deltas_then_done() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("accept", "text/event-stream"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_string_contains("\"stream\":true"))
            .and(body_string_contains("\"max_tokens\":16"))
            .respond_with(sse(&[
                r#"data: {"choices":[{"delta":{"content":"A"},"finish_reason":null}]}"#,
                r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
                "data: [DONE]",
            ]))
            .mount(&server)
            .await;

        let p = OpenAiCompat::new(Some(format!("{}/v1/", server.uri())), Some("sk-test".into()))
            .expect("provider");
        let stream = p
            .complete(&CancellationToken::new(), &request())
            .await
            .expect("complete");
        assert_eq!(
            drain(stream).await,
            vec![
                CompletionChunk::delta("A"),
                CompletionChunk::Done {
                    finish_reason: "stop".into(),
                    usage: None
                }
            ]
        );
    }

    #[tokio::test]
    async fn eof_after_finish_reason_is_done_with_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(sse(&[
                ": keep-alive",
                r#"data: {"choices":[{"delta":{"content":"x"},"finish_reason":"length"}]}"#,
                r#"data: {"choices":[],"usage":{"prompt_tokens":4,"completion_tokens":1,"total_tokens":5}}"#,
            ]))
            .mount(&server)
            .await;

        let p = OpenAiCompat::new(Some(server.uri()), None).expect("provider");
        let stream = p
            .complete(&CancellationToken::new(), &request())
            .await
            .expect("complete");
        assert_eq!(
            drain(stream).await,
            vec![
                CompletionChunk::delta("x"),
                CompletionChunk::Done {
                    finish_reason: "length".into(),
                    usage: Some(Usage::new(4, 1))
                }
            ]
        );
    }

    #[tokio::test]
    async fn eof_without_finish_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(sse(&[
                r#"data: {"choices":[{"delta":{"content":"partial"}}]}"#,
                "data: {not json",
            ]))
            .mount(&server)
            .await;

        let p = OpenAiCompat::new(Some(server.uri()), None).expect("provider");
        let chunks = drain(
            p.complete(&CancellationToken::new(), &request())
                .await
                .expect("complete"),
        )
        .await;
        assert_eq!(chunks.len(), 2);
        assert!(matches!(chunks[1], CompletionChunk::Error { .. }));
    }

    /// Serves one SSE delta and then keeps the connection open without
    /// another byte.
    async fn stalling_upstream() -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 16 * 1024];
            let mut head = Vec::new();
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = sock.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                head.extend_from_slice(&buf[..n]);
            }
            let event = "data: {\"choices\":[{\"delta\":{\"content\":\"A\"}}]}\n\n";
            let resp = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\n\r\n{:x}\r\n{event}\r\n",
                event.len()
            );
            sock.write_all(resp.as_bytes()).await.unwrap();
            while matches!(sock.read(&mut buf).await, Ok(n) if n > 0) {}
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn cancelling_a_stalled_body_is_prompt() {
        let p = OpenAiCompat::new(Some(stalling_upstream().await), None).expect("provider");
        let cancel = CancellationToken::new();
        let mut stream = p.complete(&cancel, &request()).await.expect("complete");
        assert_eq!(stream.next().await, Some(CompletionChunk::delta("A")));

        cancel.cancel();
        let terminal = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("cancellation should be prompt");
        assert_eq!(terminal, Some(CompletionChunk::error("request cancelled")));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn non_success_status_fails_before_streaming() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;

        let p = OpenAiCompat::new(Some(server.uri()), None).expect("provider");
        let err = p
            .complete(&CancellationToken::new(), &request())
            .await
            .err()
            .expect("complete should fail");
        match err {
            ProviderError::Http { status, text } => {
                assert_eq!(status, reqwest::StatusCode::UNAUTHORIZED);
                assert_eq!(text, "bad key");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn models_and_liveness() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                serde_json::json!({"object":"list","data":[{"id":"llama3"},{"id":"qwen"}]})
                    .to_string(),
                "application/json",
            ))
            .mount(&server)
            .await;

        let p = OpenAiCompat::new(Some(server.uri()), None).expect("provider");
        assert!(p.available().await);
        let ids: Vec<_> = p.models().await.into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["llama3", "qwen"]);
    }

    #[tokio::test]
    async fn unreachable_backend_is_unavailable() {
        let p = OpenAiCompat::new(Some("http://127.0.0.1:9".into()), None).expect("provider");
        assert!(!p.available().await);
        assert!(p.models().await.is_empty());
    }

    #[test]
    fn rejects_non_http_base_url() {
        assert!(matches!(
            OpenAiCompat::new(Some("ftp://host".into()), None),
            Err(ProviderError::InvalidSettings { .. })
        ));
    }

    #[test]
    fn truncates_on_char_boundary() {
        let mut s = "é".repeat(600);
        truncate(&mut s, ERROR_BODY_LIMIT);
        assert!(s.len() <= ERROR_BODY_LIMIT);
        assert!(s.chars().all(|c| c == 'é'));
    }
}
