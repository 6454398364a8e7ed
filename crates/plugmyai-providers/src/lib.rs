//! Backend adapters that turn each native protocol into one canonical
//! [`CompletionStream`].

mod claude;
mod cli;
mod codex;
mod error;
mod openai_compat;
pub mod prompt;
mod registry;
pub mod stream;

use plugmyai_core::{CompletionRequest, Model};
use tokio_util::sync::CancellationToken;

pub use claude::ClaudeCode;
pub use codex::Codex;
pub use error::ProviderError;
pub use openai_compat::{OpenAiCompat, DEFAULT_BASE_URL};
pub use registry::{builtin_constructors, Constructor, Registry};
pub use stream::CompletionStream;

/// A configured backend.
#[derive(Debug, Clone)]
pub enum Provider {
    ClaudeCode(ClaudeCode),
    Codex(Codex),
    OpenAiCompat(OpenAiCompat),
}

impl Provider {
    pub fn id(&self) -> &'static str {
        match self {
            Provider::ClaudeCode(_) => ClaudeCode::ID,
            Provider::Codex(_) => Codex::ID,
            Provider::OpenAiCompat(_) => OpenAiCompat::ID,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Provider::ClaudeCode(_) => ClaudeCode::NAME,
            Provider::Codex(_) => Codex::NAME,
            Provider::OpenAiCompat(_) => OpenAiCompat::NAME,
        }
    }

    /// Probed on every call; never cached.
    pub async fn available(&self) -> bool {
        match self {
            Provider::ClaudeCode(p) => p.available(),
            Provider::Codex(p) => p.available(),
            Provider::OpenAiCompat(p) => p.available().await,
        }
    }

    pub async fn models(&self) -> Vec<Model> {
        match self {
            Provider::ClaudeCode(p) => p.models(),
            Provider::Codex(p) => p.models(),
            Provider::OpenAiCompat(p) => p.models().await,
        }
    }

    /// Start a completion. Cancelling `cancel` or dropping the returned
    /// stream stops the backend.
    pub async fn complete(
        &self,
        cancel: &CancellationToken,
        req: &CompletionRequest,
    ) -> Result<CompletionStream, ProviderError> {
        match self {
            Provider::ClaudeCode(p) => p.complete(cancel, req),
            Provider::Codex(p) => p.complete(cancel, req),
            Provider::OpenAiCompat(p) => p.complete(cancel, req).await,
        }
    }
}
