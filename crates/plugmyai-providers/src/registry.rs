use std::collections::HashMap;

use plugmyai_core::{Model, ProviderConfig};
use tracing::{info, warn};

use crate::{ClaudeCode, Codex, OpenAiCompat, Provider, ProviderError};

/// Builds a provider from its configuration entry.
pub type Constructor = fn(&ProviderConfig) -> Result<Provider, ProviderError>;

/// Constructor table for every provider type shipped with the daemon.
pub fn builtin_constructors() -> HashMap<&'static str, Constructor> {
    let mut table: HashMap<&'static str, Constructor> = HashMap::new();
    table.insert(ClaudeCode::ID, ClaudeCode::from_config);
    table.insert(Codex::ID, Codex::from_config);
    table.insert(OpenAiCompat::ID, OpenAiCompat::from_config);
    table
}

/// The configured providers, fixed after startup.
#[derive(Debug, Default)]
pub struct Registry {
    providers: Vec<Provider>,
}

impl Registry {
    pub fn new(providers: Vec<Provider>) -> Self {
        Self { providers }
    }

    /// Build from configuration entries, skipping disabled, unknown,
    /// duplicate or failing ones.
    pub fn build<'a>(
        entries: impl IntoIterator<Item = &'a ProviderConfig>,
        constructors: &HashMap<&'static str, Constructor>,
    ) -> Self {
        let mut providers: Vec<Provider> = Vec::new();
        for entry in entries {
            if !entry.enabled {
                continue;
            }
            let built = match constructors.get(entry.kind.as_str()) {
                Some(ctor) => ctor(entry),
                None => Err(ProviderError::UnknownType(entry.kind.clone())),
            };
            match built {
                Ok(p) if providers.iter().any(|q| q.id() == p.id()) => {
                    warn!(provider = p.id(), name = %entry.name, "duplicate provider entry skipped");
                }
                Ok(p) => {
                    info!(provider = p.id(), name = %entry.name, "provider registered");
                    providers.push(p);
                }
                Err(e) => {
                    warn!(kind = %entry.kind, name = %entry.name, error = %e, "provider skipped");
                }
            }
        }
        Self { providers }
    }

    pub fn all(&self) -> &[Provider] {
        &self.providers
    }

    pub async fn available(&self) -> Vec<&Provider> {
        let mut out = Vec::new();
        for p in &self.providers {
            if p.available().await {
                out.push(p);
            }
        }
        out
    }

    /// Models of every currently available provider.
    pub async fn all_models(&self) -> Vec<Model> {
        let mut models = Vec::new();
        for p in self.available().await {
            models.extend(p.models().await);
        }
        models
    }

    pub fn find_by_id(&self, id: &str) -> Option<&Provider> {
        self.providers.iter().find(|p| p.id() == id)
    }

    /// First available provider advertising `model`, else the first
    /// available provider at all.
    pub async fn find_provider(&self, model: &str) -> Option<&Provider> {
        let available = self.available().await;
        for &p in &available {
            if p.models().await.iter().any(|m| m.id == model) {
                return Some(p);
            }
        }
        available.into_iter().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plugmyai_core::ProviderSettings;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn entry(kind: &str, enabled: bool, settings: ProviderSettings) -> ProviderConfig {
        ProviderConfig {
            kind: kind.into(),
            name: kind.into(),
            enabled,
            settings,
        }
    }

    fn missing_cli() -> ProviderSettings {
        ProviderSettings {
            cli_path: Some("/nonexistent/plug-my-ai-test-cli".into()),
            ..Default::default()
        }
    }

    async fn models_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"{"data":[{"id":"llama3"}]}"#,
                "application/json",
            ))
            .mount(&server)
            .await;
        server
    }

    #[test]
    fn build_skips_unknown_disabled_and_invalid_entries() {
        let entries = vec![
            entry("claude-code", true, missing_cli()),
            entry("codex", false, ProviderSettings::default()),
            entry("gemini", true, ProviderSettings::default()),
            entry(
                "openai-compat",
                true,
                ProviderSettings {
                    base_url: Some("not a url".into()),
                    ..Default::default()
                },
            ),
            entry("claude-code", true, ProviderSettings::default()),
        ];
        let reg = Registry::build(&entries, &builtin_constructors());
        let ids: Vec<_> = reg.all().iter().map(Provider::id).collect();
        assert_eq!(ids, vec!["claude-code"]);
        assert!(reg.find_by_id("codex").is_none());
    }

    #[tokio::test]
    async fn find_provider_prefers_advertiser_then_falls_back() {
        let server = models_server().await;
        let entries = vec![
            entry("claude-code", true, missing_cli()),
            entry(
                "openai-compat",
                true,
                ProviderSettings {
                    base_url: Some(server.uri()),
                    ..Default::default()
                },
            ),
        ];
        let reg = Registry::build(&entries, &builtin_constructors());
        assert_eq!(reg.all().len(), 2);

        let avail: Vec<_> = reg.available().await.into_iter().map(Provider::id).collect();
        assert_eq!(avail, vec!["openai-compat"]);

        let found = reg.find_provider("llama3").await.expect("provider");
        assert_eq!(found.id(), "openai-compat");
        // claude is advertised by an unavailable provider, so fall back.
        let fallback = reg.find_provider("claude").await.expect("fallback");
        assert_eq!(fallback.id(), "openai-compat");

        let models: Vec<_> = reg.all_models().await.into_iter().map(|m| m.id).collect();
        assert_eq!(models, vec!["llama3"]);
    }

    #[tokio::test]
    async fn nothing_available_finds_nothing() {
        let entries = vec![entry("claude-code", true, missing_cli())];
        let reg = Registry::build(&entries, &builtin_constructors());
        assert!(reg.find_provider("claude").await.is_none());
        assert!(reg.all_models().await.is_empty());
    }
}
