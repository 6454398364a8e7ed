//! Shared plumbing for adapters that drive a local command-line agent.

use std::process::Stdio;

use plugmyai_core::{CompletionChunk, Usage};
use serde::Deserialize;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::stream::{ChunkSender, CompletionStream, Parsed, PumpEnd, pump_lines};
use crate::ProviderError;

/// `usage` object emitted by both CLI dialects.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
}

impl From<TokenUsage> for Usage {
    fn from(u: TokenUsage) -> Self {
        Usage::new(u.input_tokens, u.output_tokens)
    }
}

/// Whether `program` resolves to an executable, either as a path or on `PATH`.
pub(crate) fn installed(program: &str) -> bool {
    which::which(program).is_ok()
}

/// Spawn one process for a request and stream its stdout through `parse`.
pub(crate) fn spawn<F>(
    label: &'static str,
    program: &str,
    args: &[String],
    cancel: &CancellationToken,
    parse: F,
) -> Result<CompletionStream, ProviderError>
where
    F: FnMut(&str) -> Parsed + Send + 'static,
{
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ProviderError::Spawn {
            program: program.to_string(),
            source,
        })?;
    let stdout = child.stdout.take().ok_or_else(|| ProviderError::Spawn {
        program: program.to_string(),
        source: std::io::Error::other("stdout was not captured"),
    })?;
    debug!(provider = label, pid = child.id(), "spawned backend process");

    let (sender, stream) = CompletionStream::channel(cancel);
    tokio::spawn(async move {
        let end = pump_lines(stdout, &sender, label, parse).await;
        finish(label, child, &sender, end).await;
    });
    Ok(stream)
}

async fn finish(label: &str, mut child: Child, sender: &ChunkSender, end: PumpEnd) {
    if end == PumpEnd::Cancelled {
        kill(label, &mut child).await;
        return;
    }
    let status = tokio::select! {
        biased;
        _ = sender.cancelled() => {
            kill(label, &mut child).await;
            return;
        }
        status = child.wait() => status,
    };
    if end == PumpEnd::Terminal {
        return;
    }
    let chunk = match status {
        Ok(status) if status.success() => CompletionChunk::done(None),
        Ok(status) => CompletionChunk::error(format!("{label} exited unsuccessfully ({status})")),
        Err(e) => CompletionChunk::error(format!("{label}: waiting for process: {e}")),
    };
    sender.send(chunk).await;
}

async fn kill(label: &str, child: &mut Child) {
    if let Err(e) = child.kill().await {
        warn!(provider = label, error = %e, "failed to kill backend process");
    }
}
