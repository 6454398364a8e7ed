use reqwest::StatusCode;
use thiserror::Error;

/// Errors raised before a completion stream exists.
///
/// Failures after streaming has begun travel inside the stream as
/// [`plugmyai_core::CompletionChunk::Error`].
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("unknown provider type '{0}'")]
    UnknownType(String),
    #[error("invalid {provider} settings: {message}")]
    InvalidSettings {
        provider: &'static str,
        message: String,
    },
    #[error("starting {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    /// Error from the underlying HTTP client.
    #[error(transparent)]
    Request(#[from] reqwest::Error),
    /// Non-successful HTTP status returned by the upstream API.
    #[error("upstream API error {status}: {text}")]
    Http { status: StatusCode, text: String },
    #[error("request cancelled")]
    Cancelled,
}
