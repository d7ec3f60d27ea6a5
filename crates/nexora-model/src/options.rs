// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Call-option merging and provider enrichment.
//!
//! Three JSON fragments are deep-merged per model build (later overrides
//! earlier): the catalog's declared option defaults, the provider-level
//! options, and the per-selected-model options.  The merged value is parsed
//! into a typed [`CallOptions`]; unknown keys land in `extra` and are
//! forwarded verbatim to the driver.  Parse failures fall back to an empty
//! option set and are logged.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::warn;

use nexora_config::ModelConfig;

use crate::catalog::ModelCatalogEntry;

/// Fully resolved options for one model call.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CallOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    #[serde(default)]
    pub think: bool,
    /// Provider-specific keys forwarded as-is into the request body.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CallOptions {
    /// Per-call override applied on top of the resolved options (e.g. an
    /// explicit max-output-tokens or temperature from the caller).
    pub fn with_overrides(mut self, max_tokens: Option<u32>, temperature: Option<f32>) -> Self {
        if max_tokens.is_some() {
            self.max_tokens = max_tokens;
        }
        if temperature.is_some() {
            self.temperature = temperature;
        }
        self
    }
}

/// Deep-merge `src` into `dst`; `src` wins on scalar and array conflicts,
/// objects merge recursively.
pub fn deep_merge(dst: &mut Value, src: &Value) {
    match (dst, src) {
        (Value::Object(d), Value::Object(s)) => {
            for (k, v) in s {
                deep_merge(d.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
        (dst, src) => *dst = src.clone(),
    }
}

/// Merge the three option layers and parse into [`CallOptions`].
///
/// Order (later overrides earlier): catalog defaults → provider-level
/// options → per-selected-model options.  Scalar sampling parameters are
/// then resolved "first non-zero wins" across the per-model config and the
/// catalog defaults.
pub fn resolve(cfg: &ModelConfig, entry: &ModelCatalogEntry, provider_opts: &Value) -> CallOptions {
    let mut merged = json!({});
    // Null layers are absent layers, not overrides.
    for layer in [&entry.default_options, provider_opts, &cfg.provider_options] {
        if !layer.is_null() {
            deep_merge(&mut merged, layer);
        }
    }

    let mut opts: CallOptions = match serde_json::from_value(merged.clone()) {
        Ok(o) => o,
        Err(e) => {
            warn!(error = %e, "unparseable provider options; falling back to empty option set");
            CallOptions::default()
        }
    };

    // Scalars: first non-zero wins across per-model config, then catalog
    // defaults (already present in `opts` from the merge above).
    opts.temperature = first_nonzero_f32(cfg.temperature, opts.temperature);
    opts.top_p = first_nonzero_f32(cfg.top_p, opts.top_p);
    opts.top_k = first_nonzero_u32(cfg.top_k, opts.top_k);
    opts.frequency_penalty = first_nonzero_f32(cfg.frequency_penalty, opts.frequency_penalty);
    opts.presence_penalty = first_nonzero_f32(cfg.presence_penalty, opts.presence_penalty);

    opts.max_tokens = cfg
        .max_tokens
        .or(opts.max_tokens)
        .or(Some(entry.max_output_tokens));
    if opts
        .reasoning_effort
        .as_deref()
        .map(str::is_empty)
        .unwrap_or(true)
    {
        opts.reasoning_effort = cfg
            .reasoning_effort
            .clone()
            .filter(|e| !e.is_empty())
            .or_else(|| entry.reasoning_effort.clone());
    }
    opts.think = cfg.think || opts.think;

    enrich(&cfg.provider, opts)
}

fn first_nonzero_f32(a: Option<f32>, b: Option<f32>) -> Option<f32> {
    a.filter(|v| *v != 0.0).or(b)
}

fn first_nonzero_u32(a: Option<u32>, b: Option<u32>) -> Option<u32> {
    a.filter(|v| *v != 0).or(b)
}

// ─── Provider enrichment ──────────────────────────────────────────────────────

/// Apply provider-specific option defaults after the merge.
///
/// Each injection is conditional: an explicit value from any layer is never
/// overwritten.
pub fn enrich(provider: &str, mut opts: CallOptions) -> CallOptions {
    match provider {
        "anthropic" => {
            if opts.think && !opts.extra.contains_key("thinking") {
                opts.extra
                    .insert("thinking".into(), json!({ "budget_tokens": 2000 }));
            }
        }
        "openai" | "openai_compat" | "azure" => {
            if let Some(effort) = opts.reasoning_effort.clone().filter(|e| !e.is_empty()) {
                if !opts.extra.contains_key("reasoning_effort") {
                    opts.extra.insert("reasoning_effort".into(), json!(effort));
                }
            }
        }
        "openrouter" => {
            if let Some(effort) = opts.reasoning_effort.clone().filter(|e| !e.is_empty()) {
                if !opts.extra.contains_key("reasoning") {
                    opts.extra.insert(
                        "reasoning".into(),
                        json!({ "enabled": true, "effort": effort }),
                    );
                }
            }
        }
        "gemini" | "vertex" => {
            if !opts.extra.contains_key("thinking_config") {
                opts.extra.insert(
                    "thinking_config".into(),
                    json!({ "thinking_budget": 2000, "include_thoughts": true }),
                );
            }
        }
        "zai" => {
            opts.extra.insert("tool_stream".into(), json!(true));
        }
        _ => {}
    }
    opts
}

/// For responses-API-capable reasoning models, ask for a reasoning summary
/// and encrypted reasoning content.  Applied by the coordinator when the
/// catalog marks the model accordingly.
pub fn enrich_responses_reasoning(mut opts: CallOptions) -> CallOptions {
    if !opts.extra.contains_key("reasoning_summary") {
        opts.extra.insert("reasoning_summary".into(), json!("auto"));
    }
    if !opts.extra.contains_key("include_encrypted_reasoning") {
        opts.extra
            .insert("include_encrypted_reasoning".into(), json!(true));
    }
    opts
}

// ─── OpenRouter exacto routing ────────────────────────────────────────────────

/// Model bases that opt into OpenRouter's deterministic `:exacto` routing.
const EXACTO_MODELS: &[&str] = &[
    "moonshotai/kimi-k2-0905",
    "deepseek/deepseek-v3.1-terminus",
    "z-ai/glm-4.6",
    "openai/gpt-oss-120b",
    "qwen/qwen3-coder",
    "deepseek-coder-2",
];

/// Append `:exacto` to known model IDs before the call.  Applied at the wire
/// boundary only; the configured model name is left untouched.
pub fn openrouter_wire_model(model: &str) -> String {
    if EXACTO_MODELS.contains(&model) {
        format!("{model}:exacto")
    } else {
        model.to_string()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
