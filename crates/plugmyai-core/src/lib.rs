pub mod config;
pub mod ids;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use config::{Config, ConfigError, ProviderConfig, ProviderSettings};

/// Role for chat messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Chat message sent to a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Coarse permission level granted to a caller.
///
/// `Chat` restricts a backend to conversation; `Full` lets it use whatever
/// tool, file or shell capabilities it has.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    #[default]
    Chat,
    Full,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Chat => "chat",
            Scope::Full => "full",
        }
    }

    /// Parse an optional, possibly empty scope value, falling back to `default`.
    pub fn parse_or(value: Option<&str>, default: Scope) -> Result<Scope, InvalidScope> {
        match value.map(str::trim) {
            None | Some("") => Ok(default),
            Some(s) => s.parse(),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("scope must be 'chat' or 'full', got '{0}'")]
pub struct InvalidScope(pub String);

impl FromStr for Scope {
    type Err = InvalidScope;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat" => Ok(Scope::Chat),
            "full" => Ok(Scope::Full),
            other => Err(InvalidScope(other.to_string())),
        }
    }
}

/// Unified chat completion request accepted by the gateway.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Stamped from the caller's authorization, never read from the body.
    #[serde(skip)]
    pub scope: Scope,
}

/// Token accounting reported by a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Canonical unit of streamed output shared by every backend.
///
/// A well-formed stream is zero or more `Delta`s followed by exactly one
/// terminal (`Done` or `Error`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionChunk {
    Delta {
        text: String,
    },
    Done {
        finish_reason: String,
        usage: Option<Usage>,
    },
    Error {
        message: String,
    },
}

impl CompletionChunk {
    pub fn delta(text: impl Into<String>) -> Self {
        Self::Delta { text: text.into() }
    }

    pub fn done(usage: Option<Usage>) -> Self {
        Self::Done {
            finish_reason: "stop".into(),
            usage,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Delta { .. })
    }
}

/// A model advertised by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub name: String,
    pub provider: String,
}

impl Model {
    pub fn new(id: impl Into<String>, name: impl Into<String>, provider: &str) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            provider: provider.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_parses_and_defaults() {
        assert_eq!(Scope::parse_or(None, Scope::Chat), Ok(Scope::Chat));
        assert_eq!(Scope::parse_or(Some(""), Scope::Full), Ok(Scope::Full));
        assert_eq!(Scope::parse_or(Some("full"), Scope::Chat), Ok(Scope::Full));
        assert_eq!(
            Scope::parse_or(Some("admin"), Scope::Chat),
            Err(InvalidScope("admin".into()))
        );
    }

    #[test]
    fn request_ignores_client_scope() {
        let req: CompletionRequest = serde_json::from_str(
            r#"{"model":"m","messages":[{"role":"user","content":"hi"}],"scope":"full"}"#,
        )
        .unwrap();
        assert_eq!(req.scope, Scope::Chat);
        assert!(!req.stream);
        assert_eq!(req.messages[0], Message::user("hi"));
    }

    #[test]
    fn usage_totals() {
        assert_eq!(Usage::new(3, 1).total_tokens, 4);
    }
}
