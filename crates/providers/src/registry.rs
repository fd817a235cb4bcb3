//! Provider registry.
//!
//! Constructs and holds all configured LLM provider instances. At startup the
//! registry reads the [`LlmConfig`], resolves authentication, and
//! instantiates the adapter for each configured provider.  Roles map a
//! purpose (`executor`, `summarizer`) onto a `provider_id/model` pair.

use crate::anthropic::AnthropicProvider;
use crate::traits::LlmProvider;
use sb_domain::config::{LlmConfig, ProviderKind};
use sb_domain::error::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;

pub const ROLE_EXECUTOR: &str = "executor";
pub const ROLE_SUMMARIZER: &str = "summarizer";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ProviderRegistry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Holds all instantiated LLM providers and role assignments.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
    /// role -> "provider_id/model"
    roles: HashMap<String, String>,
}

impl ProviderRegistry {
    /// Build the registry from the application's [`LlmConfig`].
    ///
    /// Providers that fail to initialize are logged and skipped.  Set
    /// `SB_REQUIRE_LLM=1` to fail startup instead when none come up.
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let mut registry = Self::default();

        for pc in &config.providers {
            let result: Result<Arc<dyn LlmProvider>> = match pc.kind {
                ProviderKind::Anthropic => {
                    AnthropicProvider::from_config(pc, config.request_timeout_sec)
                        .map(|p| Arc::new(p) as Arc<dyn LlmProvider>)
                }
            };

            match result {
                Ok(provider) => {
                    tracing::info!(provider_id = %pc.id, kind = ?pc.kind, "registered LLM provider");
                    registry.providers.insert(pc.id.clone(), provider);
                }
                Err(e) => {
                    tracing::warn!(
                        provider_id = %pc.id,
                        kind = ?pc.kind,
                        error = %e,
                        "failed to initialize LLM provider, skipping"
                    );
                }
            }
        }

        if registry.providers.is_empty() && !config.providers.is_empty() {
            let require = std::env::var("SB_REQUIRE_LLM")
                .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
                .unwrap_or(false);
            if require {
                return Err(Error::Config(
                    "all configured LLM providers failed to initialize".into(),
                ));
            }
            tracing::warn!("no LLM providers initialized; turns will fail until auth is configured");
        }

        for (role_name, role_cfg) in &config.roles {
            registry
                .roles
                .insert(role_name.clone(), role_cfg.model.clone());
        }

        Ok(registry)
    }

    /// Register a provider instance directly.
    pub fn insert(&mut self, provider: Arc<dyn LlmProvider>) {
        self.providers
            .insert(provider.provider_id().to_string(), provider);
    }

    /// Assign `role` to a `provider_id/model` reference.
    pub fn set_role(&mut self, role: &str, model_ref: &str) {
        self.roles.insert(role.to_string(), model_ref.to_string());
    }

    /// Look up a provider by its config id.
    pub fn get(&self, provider_id: &str) -> Option<Arc<dyn LlmProvider>> {
        self.providers.get(provider_id).cloned()
    }

    /// Provider assigned to `role`.
    pub fn for_role(&self, role: &str) -> Option<Arc<dyn LlmProvider>> {
        let model_ref = self.roles.get(role)?;
        let provider_id = model_ref.split('/').next().unwrap_or(model_ref);
        self.get(provider_id)
    }

    /// Model name (without provider prefix) assigned to `role`.
    pub fn model_for_role(&self, role: &str) -> Option<&str> {
        let model_ref = self.roles.get(role)?;
        model_ref.split_once('/').map(|(_, model)| model)
    }

    /// Provider and concrete model for `role`, falling back to the
    /// provider's default model.
    pub fn resolve_role(&self, role: &str) -> Result<(Arc<dyn LlmProvider>, String)> {
        let provider = self
            .for_role(role)
            .ok_or_else(|| Error::Config(format!("no provider available for role '{role}'")))?;
        let model = self
            .model_for_role(role)
            .map(str::to_string)
            .unwrap_or_else(|| provider.default_model().to_string());
        Ok((provider, model))
    }

    /// Iterate over all registered providers.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<dyn LlmProvider>)> {
        self.providers.iter()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// List all registered provider IDs (sorted).
    pub fn list_providers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// List roles and their assigned model specs.
    pub fn list_roles(&self) -> HashMap<String, String> {
        self.roles.clone()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{ChatRequest, ChatResponse};
    use sb_domain::config::{AuthConfig, ProviderConfig, RoleConfig};
    use sb_domain::stream::{BoxStream, StreamEvent};
    use tokio_util::sync::CancellationToken;

    struct Named(&'static str);

    #[async_trait::async_trait]
    impl LlmProvider for Named {
        async fn chat(&self, _req: &ChatRequest) -> Result<ChatResponse> {
            Err(Error::Other("unused".into()))
        }
        async fn chat_stream(
            &self,
            _req: &ChatRequest,
            _cancel: Option<CancellationToken>,
        ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
            Err(Error::Other("unused".into()))
        }
        fn provider_id(&self) -> &str {
            self.0
        }
        fn default_model(&self) -> &str {
            "fallback-model"
        }
    }

    #[test]
    fn roles_resolve_provider_and_model() {
        let mut reg = ProviderRegistry::default();
        reg.insert(Arc::new(Named("anthropic")));
        reg.set_role(ROLE_EXECUTOR, "anthropic/claude-sonnet-4-5");
        reg.set_role(ROLE_SUMMARIZER, "anthropic");

        let (p, model) = reg.resolve_role(ROLE_EXECUTOR).unwrap();
        assert_eq!(p.provider_id(), "anthropic");
        assert_eq!(model, "claude-sonnet-4-5");

        let (_, model) = reg.resolve_role(ROLE_SUMMARIZER).unwrap();
        assert_eq!(model, "fallback-model");
    }

    #[test]
    fn unknown_role_is_a_config_error() {
        let reg = ProviderRegistry::default();
        assert!(matches!(reg.resolve_role("executor"), Err(Error::Config(_))));
    }

    #[test]
    fn provider_without_credentials_is_skipped() {
        let mut config = LlmConfig::default();
        config.providers.push(ProviderConfig {
            id: "anthropic".into(),
            kind: ProviderKind::Anthropic,
            base_url: "https://api.anthropic.com".into(),
            auth: AuthConfig {
                env: Some("SB_TEST_REGISTRY_NO_SUCH_VAR".into()),
                ..Default::default()
            },
            default_model: None,
            max_output_tokens: 1024,
        });
        config.roles.insert(
            "executor".into(),
            RoleConfig {
                model: "anthropic/claude-sonnet-4-5".into(),
            },
        );
        let reg = ProviderRegistry::from_config(&config).unwrap();
        assert!(reg.is_empty());
        assert_eq!(reg.list_roles().len(), 1);
    }
}
