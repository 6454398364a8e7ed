#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use plugmyai_core::{CompletionChunk, CompletionRequest, Message, Scope, Usage};
use plugmyai_providers::{ClaudeCode, Codex, CompletionStream, Provider};
use tokio_util::sync::CancellationToken;

fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn claude(path: &Path) -> Provider {
    Provider::ClaudeCode(ClaudeCode::new(Some(path.display().to_string()), None))
}

fn request() -> CompletionRequest {
    CompletionRequest {
        model: "claude".into(),
        messages: vec![Message::user("say hi")],
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
async fn claude_ndjson_becomes_delta_and_done() {
    let dir = tempfile::tempdir().unwrap();
    let path = script(
        dir.path(),
        "claude",
        r#"echo '{"type":"system","subtype":"init"}'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]}}'
echo '{"type":"result","usage":{"input_tokens":3,"output_tokens":1}}'"#,
    );
    let provider = claude(&path);
    assert!(provider.available().await);

    let stream = provider
        .complete(&CancellationToken::new(), &request())
        .await
        .expect("spawn");
    assert_eq!(
        drain(stream).await,
        vec![
            CompletionChunk::delta("hi"),
            CompletionChunk::done(Some(Usage::new(3, 1))),
        ]
    );
}

#[tokio::test]
async fn undecodable_output_line_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let path = script(
        dir.path(),
        "claude",
        r#"printf '\377\376 garbage\n'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]}}'
echo '{"type":"result","usage":{"input_tokens":3,"output_tokens":1}}'"#,
    );
    let stream = claude(&path)
        .complete(&CancellationToken::new(), &request())
        .await
        .expect("spawn");
    assert_eq!(
        drain(stream).await,
        vec![
            CompletionChunk::delta("hi"),
            CompletionChunk::done(Some(Usage::new(3, 1))),
        ]
    );
}

#[tokio::test]
async fn clean_exit_without_result_is_done() {
    let dir = tempfile::tempdir().unwrap();
    let path = script(
        dir.path(),
        "codex",
        r#"echo '{"type":"response.output_text.delta","delta":"ok"}'"#,
    );
    let provider = Provider::Codex(Codex::new(Some(path.display().to_string()), None));
    let mut req = request();
    req.scope = Scope::Full;
    let chunks = drain(provider.complete(&CancellationToken::new(), &req).await.unwrap()).await;
    assert_eq!(
        chunks,
        vec![CompletionChunk::delta("ok"), CompletionChunk::done(None)]
    );
}

#[tokio::test]
async fn failing_exit_is_an_error_terminal() {
    let dir = tempfile::tempdir().unwrap();
    let path = script(dir.path(), "claude", "exit 3");
    let chunks = drain(
        claude(&path)
            .complete(&CancellationToken::new(), &request())
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(chunks.len(), 1);
    match &chunks[0] {
        CompletionChunk::Error { message } => assert!(message.contains("exit"), "{message}"),
        other => panic!("unexpected chunk: {other:?}"),
    }
}

#[tokio::test]
async fn cancellation_stops_a_hung_process() {
    let dir = tempfile::tempdir().unwrap();
    let path = script(
        dir.path(),
        "claude",
        r#"echo '{"type":"assistant","message":{"content":[{"type":"text","text":"partial"}]}}'
sleep 30"#,
    );
    let cancel = CancellationToken::new();
    let mut stream = claude(&path).complete(&cancel, &request()).await.unwrap();
    assert_eq!(stream.next().await, Some(CompletionChunk::delta("partial")));

    cancel.cancel();
    let terminal = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("cancellation should be prompt");
    assert_eq!(terminal, Some(CompletionChunk::error("request cancelled")));
    assert_eq!(stream.next().await, None);
}

#[tokio::test]
async fn missing_binary_fails_synchronously() {
    let provider = claude(Path::new("/nonexistent/claude"));
    assert!(!provider.available().await);
    assert!(provider
        .complete(&CancellationToken::new(), &request())
        .await
        .is_err());
}
