use plugmyai_core::{CompletionChunk, CompletionRequest, Model, ProviderConfig, Scope};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::cli::{self, TokenUsage};
use crate::stream::{CompletionStream, Parsed};
use crate::{prompt, Provider, ProviderError};

/// Adapter for the Claude Code CLI, reusing the user's existing login.
#[derive(Debug, Clone)]
pub struct ClaudeCode {
    cli_path: String,
    model: Option<String>,
}

/// One NDJSON line of `claude --output-format stream-json --verbose`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CliLine {
    Assistant {
        #[serde(default)]
        message: Option<AssistantMessage>,
    },
    ContentBlockDelta {
        #[serde(default)]
        delta: Option<TextDelta>,
    },
    Result {
        #[serde(default)]
        usage: Option<TokenUsage>,
    },
    Error {
        #[serde(default)]
        content: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct TextDelta {
    #[serde(default)]
    text: String,
}

impl ClaudeCode {
    pub const ID: &'static str = "claude-code";
    pub const NAME: &'static str = "Claude Code";

    pub fn new(cli_path: Option<String>, model: Option<String>) -> Self {
        Self {
            cli_path: cli_path
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| "claude".into()),
            model: model.filter(|m| !m.is_empty()),
        }
    }

    pub fn from_config(cfg: &ProviderConfig) -> Result<Provider, ProviderError> {
        let s = &cfg.settings;
        Ok(Provider::ClaudeCode(Self::new(s.cli_path.clone(), s.model.clone())))
    }

    pub fn available(&self) -> bool {
        cli::installed(&self.cli_path)
    }

    pub fn models(&self) -> Vec<Model> {
        let mut models = vec![Model::new("claude", "Claude (default)", Self::ID)];
        if let Some(m) = &self.model {
            models.push(Model::new(m, m, Self::ID));
        }
        models
    }

    /// Arguments for one request. Chat scope disables every tool.
    pub fn args(&self, req: &CompletionRequest) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            prompt::flatten(&req.messages),
            "--output-format".into(),
            "stream-json".into(),
            "--verbose".into(),
        ];
        if let Some(m) = &self.model {
            args.push("--model".into());
            args.push(m.clone());
        }
        if req.scope == Scope::Chat {
            args.push("--allowedTools".into());
            args.push(String::new());
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
    let Ok(line) = serde_json::from_str::<CliLine>(line) else {
        return Parsed::Skipped;
    };
    match line {
        CliLine::Assistant { message } => {
            let text: String = message
                .into_iter()
                .flat_map(|m| m.content)
                .filter(|b| b.kind == "text")
                .map(|b| b.text)
                .collect();
            if text.is_empty() {
                Parsed::Empty
            } else {
                Parsed::Chunk(CompletionChunk::delta(text))
            }
        }
        CliLine::ContentBlockDelta { delta } => match delta {
            Some(d) if !d.text.is_empty() => Parsed::Chunk(CompletionChunk::delta(d.text)),
            _ => Parsed::Empty,
        },
        CliLine::Result { usage } => Parsed::Chunk(CompletionChunk::done(usage.map(Into::into))),
        CliLine::Error { content } => {
            Parsed::Chunk(CompletionChunk::error(format!("claude CLI error: {content}")))
        }
        CliLine::Other => Parsed::Skipped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plugmyai_core::{Message, Usage};

    fn request(scope: Scope) -> CompletionRequest {
        CompletionRequest {
            model: "claude".into(),
            messages: vec![Message::user("hello")],
            scope,
            ..Default::default()
        }
    }

    #[test]
    fn chat_scope_disables_tools() {
        let p = ClaudeCode::new(None, Some("opus".into()));
        let args = p.args(&request(Scope::Chat));
        assert_eq!(
            args,
            vec![
                "-p",
                "hello",
                "--output-format",
                "stream-json",
                "--verbose",
                "--model",
                "opus",
                "--allowedTools",
                ""
            ]
        );
        let full = p.args(&request(Scope::Full));
        assert!(!full.iter().any(|a| a == "--allowedTools"));
    }

    #[test]
    fn models_include_configured_model() {
        let ids: Vec<_> = ClaudeCode::new(None, Some("sonnet".into()))
            .models()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["claude", "sonnet"]);
        assert_eq!(ClaudeCode::new(None, Some(String::new())).models().len(), 1);
    }

    #[test]
    fn parses_dialect() {
        assert_eq!(
            parse_line(
                r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hi"},{"type":"tool_use","id":"x"},{"type":"text","text":"!"}]}}"#
            ),
            Parsed::Chunk(CompletionChunk::delta("hi!"))
        );
        assert_eq!(
            parse_line(r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"more"}}"#),
            Parsed::Chunk(CompletionChunk::delta("more"))
        );
        assert_eq!(
            parse_line(r#"{"type":"result","result":"hi","usage":{"input_tokens":3,"output_tokens":1}}"#),
            Parsed::Chunk(CompletionChunk::done(Some(Usage::new(3, 1))))
        );
        assert_eq!(
            parse_line(r#"{"type":"error","content":"not logged in"}"#),
            Parsed::Chunk(CompletionChunk::error("claude CLI error: not logged in"))
        );
        assert_eq!(parse_line(r#"{"type":"assistant","message":{"content":[]}}"#), Parsed::Empty);
        assert_eq!(parse_line(r#"{"type":"system","subtype":"init"}"#), Parsed::Skipped);
        assert_eq!(parse_line("not json"), Parsed::Skipped);
    }
}
