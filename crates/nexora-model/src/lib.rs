// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod catalog;
pub mod ids;
pub mod oauth;
pub mod options;
pub mod registry;
pub mod sanitize;
mod anthropic;
mod bedrock;
mod google;
mod mock;
mod openai_compat;
mod provider;
mod types;

pub use anthropic::AnthropicProvider;
pub use bedrock::BedrockProvider;
pub use catalog::ModelCatalogEntry;
pub use google::GeminiProvider;
pub use mock::{MockProvider, ScriptedMockProvider};
pub use openai_compat::{AuthStyle, OpenAICompatProvider};
pub use options::CallOptions;
pub use provider::{ModelProvider, ResponseStream};
pub use registry::{get_provider, known_provider_ids, list_providers, ProviderMeta};
pub use types::*;

use anyhow::bail;
use std::sync::Arc;

use nexora_config::ModelConfig;

/// A constructed model bundled with its catalog record and the user-selected
/// configuration.  Rebuilt by the coordinator on credential refresh or model
/// switch; session state is untouched by a rebuild.
#[derive(Clone)]
pub struct ModelHandle {
    pub provider: Arc<dyn ModelProvider>,
    pub entry: ModelCatalogEntry,
    pub config: ModelConfig,
    /// Options merged from catalog defaults, provider options, and the
    /// per-model config, then provider-enriched.
    pub options: CallOptions,
}

impl ModelHandle {
    /// Build a handle from configuration, resolving the catalog entry and
    /// the merged option set.
    pub fn build(cfg: &ModelConfig, provider_opts: &serde_json::Value) -> anyhow::Result<Self> {
        let provider = from_config(cfg)?;
        let entry = catalog::lookup(&cfg.provider, &cfg.name)
            .unwrap_or_else(|| ModelCatalogEntry::unknown(&cfg.provider, &cfg.name));
        let mut options = options::resolve(cfg, &entry, provider_opts);
        if entry.responses_reasoning {
            options = options::enrich_responses_reasoning(options);
        }
        Ok(Self {
            provider: Arc::from(provider),
            entry,
            config: cfg.clone(),
            options,
        })
    }

    pub fn context_window(&self) -> u32 {
        self.entry.context_window
    }

    pub fn supports_images(&self) -> bool {
        self.entry.supports_images
    }

    /// Cost of a call against this model in USD.
    pub fn cost(&self, usage: &Usage) -> f64 {
        self.entry.cost(
            usage.prompt_tokens + usage.cache_read_tokens + usage.cache_write_tokens,
            usage.completion_tokens,
        )
    }
}

/// Construct a boxed [`ModelProvider`] from configuration.
///
/// Selects the driver implementation based on `cfg.provider`.  Run
/// `nexora list-providers` to see all recognised provider ids.
pub fn from_config(cfg: &ModelConfig) -> anyhow::Result<Box<dyn ModelProvider>> {
    // key() returns a fresh Option<String> on each call so that each match arm
    // can take ownership without cross-arm borrow issues.
    let key = || resolve_api_key(cfg);

    let base_url = |default: &str| -> String {
        cfg.base_url.clone().unwrap_or_else(|| default.into())
    };

    match cfg.provider.as_str() {
        "anthropic" => Ok(Box::new(AnthropicProvider::new(
            cfg.name.clone(),
            key(),
            cfg.base_url.clone(),
        ))),
        // MiniMax rides the Anthropic transport but authenticates with its
        // API key as the Bearer token.
        "minimax" => Ok(Box::new(AnthropicProvider::minimax(
            cfg.name.clone(),
            key(),
            cfg.base_url.clone(),
        ))),

        "openai" => Ok(Box::new(OpenAICompatProvider::new(
            "openai",
            cfg.name.clone(),
            key(),
            &base_url("https://api.openai.com/v1"),
            vec![],
            AuthStyle::Bearer,
        ))),
        "openai_compat" => {
            let b = cfg.base_url.as_deref().ok_or_else(|| {
                anyhow::anyhow!("openai_compat provider requires base_url in config")
            })?;
            Ok(Box::new(OpenAICompatProvider::new(
                "openai_compat",
                cfg.name.clone(),
                key(),
                b,
                vec![],
                if key().is_some() { AuthStyle::Bearer } else { AuthStyle::None },
            )))
        }
        "openrouter" => Ok(Box::new(OpenAICompatProvider::new(
            "openrouter",
            cfg.name.clone(),
            key(),
            &base_url("https://openrouter.ai/api/v1"),
            vec![
                ("HTTP-Referer".into(), "https://github.com/nexora-ai/nexora".into()),
                ("X-Title".into(), "nexora".into()),
            ],
            AuthStyle::Bearer,
        ))),

        // Azure embeds the deployment in the URL path and uses the api-key
        // header instead of a Bearer token.
        "azure" => {
            let chat_url = if let Some(b) = &cfg.base_url {
                let api_ver = cfg.azure_api_version.as_deref().unwrap_or("2024-10-21");
                format!(
                    "{}/chat/completions?api-version={}",
                    b.trim_end_matches('/'),
                    api_ver
                )
            } else {
                let resource = cfg
                    .azure_resource
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("azure provider requires azure_resource or base_url"))?;
                let deployment = cfg.azure_deployment.as_deref().unwrap_or(&cfg.name);
                let api_ver = cfg.azure_api_version.as_deref().unwrap_or("2024-10-21");
                format!(
                    "https://{resource}.openai.azure.com/openai/deployments/{deployment}/chat/completions?api-version={api_ver}"
                )
            };
            Ok(Box::new(OpenAICompatProvider::with_full_chat_url(
                "azure",
                cfg.name.clone(),
                key(),
                chat_url,
                vec![],
                AuthStyle::ApiKeyHeader,
            )))
        }

        "bedrock" => Ok(Box::new(BedrockProvider::new(
            cfg.name.clone(),
            cfg.aws_region.clone(),
        ))),

        "gemini" => Ok(Box::new(GeminiProvider::new(
            cfg.name.clone(),
            key(),
            cfg.base_url.clone(),
        ))),
        "vertex" => {
            let project = cfg
                .vertex_project
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("vertex provider requires vertex_project"))?;
            let location = cfg.vertex_location.as_deref().unwrap_or("us-central1");
            Ok(Box::new(GeminiProvider::vertex(
                cfg.name.clone(),
                key(),
                project,
                location,
            )))
        }

        // ── Fast summariser hosts (OpenAI-compatible) ─────────────────────────
        "cerebras" => Ok(Box::new(OpenAICompatProvider::new(
            "cerebras",
            cfg.name.clone(),
            key(),
            &base_url("https://api.cerebras.ai/v1"),
            vec![],
            AuthStyle::Bearer,
        ))),
        "xai" => Ok(Box::new(OpenAICompatProvider::new(
            "xai",
            cfg.name.clone(),
            key(),
            &base_url("https://api.x.ai/v1"),
            vec![],
            AuthStyle::Bearer,
        ))),
        "zai" => Ok(Box::new(OpenAICompatProvider::new(
            "zai",
            cfg.name.clone(),
            key(),
            &base_url("https://api.z.ai/api/paas/v4"),
            vec![],
            AuthStyle::Bearer,
        ))),
        "synthetic" => Ok(Box::new(OpenAICompatProvider::new(
            "synthetic",
            cfg.name.clone(),
            key(),
            &base_url("https://api.synthetic.new/v1"),
            vec![],
            AuthStyle::Bearer,
        ))),

        "mock" => Ok(Box::new(MockProvider)),

        other => {
            let known: Vec<&str> = registry::known_provider_ids().collect();
            bail!(
                "unknown model provider: {other:?}\n\
                 Run `nexora list-providers` for a full list, or check your config.\n\
                 Known providers: {known}",
                known = known.join(", ")
            )
        }
    }
}

fn resolve_api_key(cfg: &ModelConfig) -> Option<String> {
    if let Some(k) = &cfg.api_key {
        return Some(k.clone());
    }
    if let Some(env) = &cfg.api_key_env {
        return std::env::var(env).ok();
    }
    // Auto-resolve from the registry default env var if neither is set.
    if let Some(meta) = registry::get_provider(&cfg.provider) {
        if let Some(env_var) = meta.default_api_key_env {
            return std::env::var(env_var).ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config(provider: &str, model: &str) -> ModelConfig {
        ModelConfig {
            provider: provider.into(),
            name: model.into(),
            ..ModelConfig::default()
        }
    }

    #[test]
    fn from_config_anthropic_succeeds() {
        assert!(from_config(&minimal_config("anthropic", "claude-sonnet-4-5")).is_ok());
    }

    #[test]
    fn from_config_minimax_succeeds() {
        assert!(from_config(&minimal_config("minimax", "MiniMax-M2")).is_ok());
    }

    #[test]
    fn from_config_mock_succeeds() {
        assert!(from_config(&minimal_config("mock", "mock-model")).is_ok());
    }

    #[test]
    fn from_config_openai_compat_requires_base_url() {
        let result = from_config(&minimal_config("openai_compat", "local"));
        assert!(result.is_err());
        assert!(result.err().unwrap().to_string().contains("base_url"));
    }

    #[test]
    fn from_config_vertex_requires_project() {
        let result = from_config(&minimal_config("vertex", "gemini-2.5-pro"));
        assert!(result.err().unwrap().to_string().contains("vertex_project"));
    }

    #[test]
    fn from_config_unknown_provider_returns_error() {
        let result = from_config(&minimal_config("totally_unknown_provider_xyz", "m"));
        let msg = result.err().unwrap().to_string();
        assert!(msg.contains("unknown model provider"));
        assert!(msg.contains("list-providers") || msg.contains("Known providers"));
    }

    #[test]
    fn all_registry_providers_have_constructors() {
        // Every provider id in the registry must be handled by from_config
        // without returning "unknown provider" (missing config errors are OK).
        for meta in list_providers() {
            let result = from_config(&minimal_config(meta.id, "test-model"));
            if let Err(e) = result {
                let msg = e.to_string();
                assert!(
                    !msg.contains("unknown model provider"),
                    "provider {id} is in registry but not handled by from_config: {msg}",
                    id = meta.id
                );
            }
        }
    }

    #[test]
    fn resolve_api_key_prefers_explicit_key() {
        let cfg = ModelConfig {
            api_key: Some("explicit-key".into()),
            api_key_env: Some("NONEXISTENT_ENV_VAR_XYZ".into()),
            ..ModelConfig::default()
        };
        assert_eq!(resolve_api_key(&cfg).as_deref(), Some("explicit-key"));
    }

    #[test]
    fn model_handle_resolves_catalog_entry() {
        let handle =
            ModelHandle::build(&minimal_config("mock", "mock-model"), &serde_json::Value::Null)
                .unwrap();
        assert_eq!(handle.context_window(), 100_000);
    }

    #[test]
    fn model_handle_unknown_model_uses_fallback_entry() {
        let mut cfg = minimal_config("openai_compat", "totally-local-model");
        cfg.base_url = Some("http://localhost:8000/v1".into());
        let handle = ModelHandle::build(&cfg, &serde_json::Value::Null).unwrap();
        assert_eq!(handle.entry.context_window, 128_000);
        assert!(!handle.supports_images());
    }

    #[test]
    fn model_handle_enriches_responses_reasoning() {
        let handle =
            ModelHandle::build(&minimal_config("openai", "gpt-5.2"), &serde_json::Value::Null)
                .unwrap();
        assert_eq!(handle.options.extra["reasoning_summary"], "auto");
    }
}
