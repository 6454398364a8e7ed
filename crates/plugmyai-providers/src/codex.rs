use plugmyai_core::{CompletionChunk, CompletionRequest, Model, ProviderConfig, Scope};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::cli::{self, TokenUsage};
use crate::stream::{CompletionStream, Parsed};
use crate::{prompt, Provider, ProviderError};

/// Adapter for `codex exec --json`.
#[derive(Debug, Clone)]
pub struct Codex {
    cli_path: String,
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum CliEvent {
    #[serde(rename = "response.output_text.delta")]
    OutputTextDelta {
        #[serde(default)]
        delta: String,
    },
    #[serde(rename = "response.completed")]
    Completed {
        #[serde(default)]
        usage: Option<TokenUsage>,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        message: String,
    },
    #[serde(other)]
    Other,
}

impl Codex {
    pub const ID: &'static str = "codex";
    pub const NAME: &'static str = "Codex";

    pub fn new(cli_path: Option<String>, model: Option<String>) -> Self {
        Self {
            cli_path: cli_path
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| "codex".into()),
            model: model.filter(|m| !m.is_empty()),
        }
    }

    pub fn from_config(cfg: &ProviderConfig) -> Result<Provider, ProviderError> {
        let s = &cfg.settings;
        Ok(Provider::Codex(Self::new(s.cli_path.clone(), s.model.clone())))
    }

    pub fn available(&self) -> bool {
        cli::installed(&self.cli_path)
    }

    pub fn models(&self) -> Vec<Model> {
        let mut models = vec![Model::new("codex", "Codex (default)", Self::ID)];
        if let Some(m) = &self.model {
            models.push(Model::new(m, m, Self::ID));
        }
        models
    }

    /// Arguments for one request. Full scope lets codex act without asking.
    pub fn args(&self, req: &CompletionRequest) -> Vec<String> {
        let mut args = vec!["exec".to_string(), prompt::flatten(&req.messages), "--json".into()];
        if let Some(m) = &self.model {
            args.push("--model".into());
            args.push(m.clone());
        }
        if req.scope == Scope::Full {
            args.push("--full-auto".into());
        }
        args
    }

    pub fn complete(
        &self,
        cancel: &CancellationToken,
        req: &CompletionRequest,
    ) -> Result<CompletionStream, ProviderError> {
        cli::spawn(Self::ID, &self.cli_path, &self.args(req), cancel, parse_line)
    }
}

fn parse_line(line: &str) -> Parsed {
    match serde_json::from_str::<CliEvent>(line) {
        Ok(CliEvent::OutputTextDelta { delta }) if delta.is_empty() => Parsed::Empty,
        Ok(CliEvent::OutputTextDelta { delta }) => Parsed::Chunk(CompletionChunk::delta(delta)),
        Ok(CliEvent::Completed { usage }) => {
            Parsed::Chunk(CompletionChunk::done(usage.map(Into::into)))
        }
        Ok(CliEvent::Error { message }) => {
            Parsed::Chunk(CompletionChunk::error(format!("codex CLI error: {message}")))
        }
        Ok(CliEvent::Other) | Err(_) => Parsed::Skipped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plugmyai_core::{Message, Usage};

    #[test]
    fn full_scope_adds_full_auto() {
        let p = Codex::new(Some(String::new()), None);
        let mut req = CompletionRequest {
            messages: vec![Message::user("fix it")],
            ..Default::default()
        };
        assert_eq!(p.args(&req), vec!["exec", "fix it", "--json"]);
        req.scope = Scope::Full;
        assert_eq!(p.args(&req), vec!["exec", "fix it", "--json", "--full-auto"]);
    }

    #[test]
    fn parses_dialect() {
        assert_eq!(
            parse_line(r#"{"type":"response.output_text.delta","delta":"he"}"#),
            Parsed::Chunk(CompletionChunk::delta("he"))
        );
        assert_eq!(
            parse_line(r#"{"type":"response.output_text.delta","delta":""}"#),
            Parsed::Empty
        );
        assert_eq!(
            parse_line(r#"{"type":"response.completed","usage":{"input_tokens":5,"output_tokens":2}}"#),
            Parsed::Chunk(CompletionChunk::done(Some(Usage::new(5, 2))))
        );
        assert_eq!(
            parse_line(r#"{"type":"error","message":"rate limited"}"#),
            Parsed::Chunk(CompletionChunk::error("codex CLI error: rate limited"))
        );
        assert_eq!(parse_line(r#"{"type":"item.started"}"#), Parsed::Skipped);
        assert_eq!(parse_line("{"), Parsed::Skipped);
    }
}
