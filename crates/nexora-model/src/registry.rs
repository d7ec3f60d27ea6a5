// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Provider registry: static metadata for every supported model provider.
//!
//! This module is the single source of truth for which provider IDs exist
//! and what their defaults are.  It does **not** contain construction logic –
//! that lives in [`crate::from_config`].

/// Metadata describing a registered provider.
#[derive(Debug, Clone)]
pub struct ProviderMeta {
    /// Unique provider id used in the `model.provider` config field.
    pub id: &'static str,
    /// Human-readable display name.
    pub name: &'static str,
    /// One-line description shown by `nexora list-providers`.
    pub description: &'static str,
    /// Default environment variable that holds the API key.
    /// `None` for providers that use non-key auth (AWS) or none at all.
    pub default_api_key_env: Option<&'static str>,
    /// Default base URL when the user does not set `model.base_url`.
    /// `None` means the user must supply one (Azure, generic compat).
    pub default_base_url: Option<&'static str>,
    /// Whether an explicit API key is required.
    pub requires_api_key: bool,
    /// Whether the provider requires the strict 9-alphanumeric tool-call ID
    /// alphabet instead of the default `call_` + hex format.
    pub strict_tool_call_ids: bool,
}

/// Complete registry of supported providers.
pub static PROVIDERS: &[ProviderMeta] = &[
    ProviderMeta {
        id: "anthropic",
        name: "Anthropic",
        description: "Anthropic Claude models",
        default_api_key_env: Some("ANTHROPIC_API_KEY"),
        default_base_url: Some("https://api.anthropic.com"),
        requires_api_key: true,
        strict_tool_call_ids: false,
    },
    ProviderMeta {
        id: "openai",
        name: "OpenAI",
        description: "OpenAI GPT and o-series models",
        default_api_key_env: Some("OPENAI_API_KEY"),
        default_base_url: Some("https://api.openai.com/v1"),
        requires_api_key: true,
        strict_tool_call_ids: false,
    },
    ProviderMeta {
        id: "openai_compat",
        name: "OpenAI-compatible",
        description: "Any OpenAI-compatible endpoint (set base_url)",
        default_api_key_env: None,
        default_base_url: None,
        requires_api_key: false,
        strict_tool_call_ids: false,
    },
    ProviderMeta {
        id: "openrouter",
        name: "OpenRouter",
        description: "OpenRouter gateway (200+ models from many providers)",
        default_api_key_env: Some("OPENROUTER_API_KEY"),
        default_base_url: Some("https://openrouter.ai/api/v1"),
        requires_api_key: true,
        strict_tool_call_ids: false,
    },
    ProviderMeta {
        id: "azure",
        name: "Azure OpenAI",
        description: "Azure-hosted OpenAI deployments (set base_url or azure_* config fields)",
        default_api_key_env: Some("AZURE_OPENAI_API_KEY"),
        default_base_url: None,
        requires_api_key: true,
        strict_tool_call_ids: false,
    },
    ProviderMeta {
        id: "bedrock",
        name: "AWS Bedrock",
        description: "AWS Bedrock Converse API (SigV4 or AWS_BEARER_TOKEN_BEDROCK)",
        default_api_key_env: None,
        default_base_url: None,
        requires_api_key: false,
        strict_tool_call_ids: false,
    },
    ProviderMeta {
        id: "gemini",
        name: "Google Gemini",
        description: "Google Gemini models via Generative Language API",
        default_api_key_env: Some("GEMINI_API_KEY"),
        default_base_url: Some("https://generativelanguage.googleapis.com"),
        requires_api_key: true,
        strict_tool_call_ids: false,
    },
    ProviderMeta {
        id: "vertex",
        name: "Google Vertex",
        description: "Gemini models via Vertex AI (set vertex_project + vertex_location)",
        default_api_key_env: Some("GOOGLE_APPLICATION_TOKEN"),
        default_base_url: None,
        requires_api_key: true,
        strict_tool_call_ids: false,
    },
    ProviderMeta {
        id: "minimax",
        name: "MiniMax",
        description: "MiniMax models via the Anthropic-compatible transport",
        default_api_key_env: Some("MINIMAX_API_KEY"),
        default_base_url: Some("https://api.minimax.io/anthropic"),
        requires_api_key: true,
        strict_tool_call_ids: false,
    },
    // ── Fast summariser hosts (OpenAI-compatible) ─────────────────────────────
    ProviderMeta {
        id: "cerebras",
        name: "Cerebras",
        description: "Cerebras fast inference platform",
        default_api_key_env: Some("CEREBRAS_API_KEY"),
        default_base_url: Some("https://api.cerebras.ai/v1"),
        requires_api_key: true,
        strict_tool_call_ids: false,
    },
    ProviderMeta {
        id: "xai",
        name: "xAI",
        description: "xAI Grok models",
        default_api_key_env: Some("XAI_API_KEY"),
        default_base_url: Some("https://api.x.ai/v1"),
        requires_api_key: true,
        strict_tool_call_ids: false,
    },
    ProviderMeta {
        id: "zai",
        name: "Z.AI",
        description: "Zhipu AI GLM models",
        default_api_key_env: Some("ZAI_API_KEY"),
        default_base_url: Some("https://api.z.ai/api/paas/v4"),
        requires_api_key: true,
        strict_tool_call_ids: true,
    },
    ProviderMeta {
        id: "synthetic",
        name: "Synthetic",
        description: "Synthetic open-model hosting",
        default_api_key_env: Some("SYNTHETIC_API_KEY"),
        default_base_url: Some("https://api.synthetic.new/v1"),
        requires_api_key: true,
        strict_tool_call_ids: false,
    },
    ProviderMeta {
        id: "mock",
        name: "Mock",
        description: "Mock provider for tests (no network, echoes input)",
        default_api_key_env: None,
        default_base_url: None,
        requires_api_key: false,
        strict_tool_call_ids: false,
    },
];

/// Returns all registered providers in declaration order.
pub fn list_providers() -> &'static [ProviderMeta] {
    PROVIDERS
}

/// Look up a provider by its id.  Returns `None` for unknown ids.
pub fn get_provider(id: &str) -> Option<&'static ProviderMeta> {
    PROVIDERS.iter().find(|p| p.id == id)
}

/// Returns an iterator over all known provider ids.
pub fn known_provider_ids() -> impl Iterator<Item = &'static str> {
    PROVIDERS.iter().map(|p| p.id)
}
