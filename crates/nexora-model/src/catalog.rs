// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Model catalog: static metadata for known models.

use serde::{Deserialize, Serialize};

fn default_cost() -> f64 {
    0.0
}

/// Metadata for a single model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelCatalogEntry {
    /// Provider-scoped model identifier (e.g. "claude-sonnet-4-5")
    pub id: String,
    /// Human-readable display name
    pub name: String,
    /// Provider identifier: "anthropic" | "openai" | "openrouter" | ...
    pub provider: String,
    /// Total context window in tokens (input + output)
    pub context_window: u32,
    /// Maximum output tokens per completion
    pub max_output_tokens: u32,
    /// Whether the model accepts image input
    #[serde(default)]
    pub supports_images: bool,
    /// Whether the model exposes a reasoning channel via the responses API
    #[serde(default)]
    pub responses_reasoning: bool,
    /// Default reasoning effort declared for the model, if any
    #[serde(default)]
    pub reasoning_effort: Option<String>,
    /// Catalog-declared option defaults; the lowest-precedence option layer
    #[serde(default)]
    pub default_options: serde_json::Value,
    /// USD per million input tokens
    #[serde(default = "default_cost")]
    pub cost_per_mtok_input: f64,
    /// USD per million output tokens
    #[serde(default = "default_cost")]
    pub cost_per_mtok_output: f64,
}

impl ModelCatalogEntry {
    /// Cost of one call in USD.
    pub fn cost(&self, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        (prompt_tokens as f64 / 1e6) * self.cost_per_mtok_input
            + (completion_tokens as f64 / 1e6) * self.cost_per_mtok_output
    }

    /// Fallback entry for models missing from the bundled catalog.
    pub fn unknown(provider: &str, id: &str) -> Self {
        Self {
            id: id.into(),
            name: id.into(),
            provider: provider.into(),
            context_window: 128_000,
            max_output_tokens: 4_096,
            supports_images: false,
            responses_reasoning: false,
            reasoning_effort: None,
            default_options: serde_json::Value::Null,
            cost_per_mtok_input: 0.0,
            cost_per_mtok_output: 0.0,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    models: Vec<ModelCatalogEntry>,
}

/// Return all entries from the bundled static catalog.
pub fn static_catalog() -> Vec<ModelCatalogEntry> {
    let yaml = include_str!("../models.yaml");
    let catalog: CatalogFile =
        serde_yaml::from_str(yaml).expect("bundled models.yaml must be valid");
    catalog.models
}

/// Look up a single model by provider and id (or name).
pub fn lookup(provider: &str, model_id: &str) -> Option<ModelCatalogEntry> {
    static_catalog()
        .into_iter()
        .find(|e| e.provider == provider && (e.id == model_id || e.name == model_id))
}

/// Look up the context window for a model.  Falls back to `default` if not in catalog.
pub fn context_window(provider: &str, model_id: &str, default: u32) -> u32 {
    lookup(provider, model_id)
        .map(|e| e.context_window)
        .unwrap_or(default)
}

// ─── Fast-summariser selection ────────────────────────────────────────────────

/// Summariser candidates in priority order: fastest first.
pub const FAST_SUMMARIZERS: &[(&str, &str)] = &[
    ("cerebras", "zai-glm-4.6"),
    ("xai", "grok-4-1-fast"),
    ("zai", "glm-4.5-flash"),
    ("synthetic", "minimax/minimax-m2.1"),
];

/// Pick the fastest available summariser.
///
/// `is_enabled` reports whether the named provider is configured and not
/// disabled.  Returns `None` when no candidate is available — the caller
/// falls back to the main large model.
pub fn pick_fast_summarizer(is_enabled: impl Fn(&str) -> bool) -> Option<(&'static str, &'static str)> {
    FAST_SUMMARIZERS
        .iter()
        .find(|(provider, _)| is_enabled(provider))
        .copied()
}

// ── Unit tests ────────────────────────────────────────────────────────────────
