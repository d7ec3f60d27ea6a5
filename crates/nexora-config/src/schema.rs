// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so fields that should be enabled unless explicitly
/// disabled need a named function.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// The large model used for every normal completion turn.
    #[serde(default)]
    pub model: ModelConfig,
    /// Optional small model used for cheap side tasks (session titles,
    /// summaries).  Falls back to the large model when absent.
    #[serde(default)]
    pub small_model: Option<ModelConfig>,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub delegation: DelegationConfig,
    #[serde(default)]
    pub resources: ResourceConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    /// Named provider configurations.
    ///
    /// Define custom endpoints or additional accounts here and reference
    /// them by name with `--model <key>` or `--model <key>/<model>`.
    ///
    /// ```yaml
    /// providers:
    ///   work_anthropic:
    ///     provider: anthropic
    ///     api_key_env: WORK_ANTHROPIC_KEY
    ///     name: claude-sonnet-4-5
    /// ```
    #[serde(default)]
    pub providers: std::collections::HashMap<String, ModelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier.  Run `nexora list-providers` for the full list.
    /// Common values: "anthropic" | "openai" | "openai_compat" | "openrouter" |
    /// "azure" | "bedrock" | "gemini" | "vertex" | "minimax" | "mock"
    pub provider: String,
    /// Model name forwarded to the provider API
    pub name: String,
    /// Environment variable that holds the API key (read at runtime)
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env in config files to avoid secrets
    /// in version-controlled files
    pub api_key: Option<String>,
    /// Base URL override.  Useful for proxies and OpenAI-compatible servers.
    /// For most hosted providers the correct default is auto-selected.
    pub base_url: Option<String>,
    /// Maximum tokens to request in a single completion
    pub max_tokens: Option<u32>,

    // ── Sampling parameters ───────────────────────────────────────────────────
    // Resolved "first non-zero wins" against the catalog defaults, so `None`
    // (or 0.0) defers to whatever the catalog declares for the model.
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,

    // ── Reasoning ─────────────────────────────────────────────────────────────
    /// Reasoning effort forwarded to providers that accept it
    /// ("low" | "medium" | "high").  Empty/None disables the injection.
    pub reasoning_effort: Option<String>,
    /// Request extended thinking from providers that support it (Anthropic,
    /// Gemini).  A default thinking budget is injected unless
    /// `provider_options` already carries an explicit block.
    #[serde(default)]
    pub think: bool,

    // ── Azure OpenAI ─────────────────────────────────────────────────────────
    /// Azure resource name (the subdomain of `.openai.azure.com`).
    /// Required when provider = "azure" and base_url is not set.
    pub azure_resource: Option<String>,
    /// Azure deployment name.  Defaults to `name` when not set.
    pub azure_deployment: Option<String>,
    /// Azure REST API version string, e.g. `"2024-10-21"`.
    pub azure_api_version: Option<String>,

    // ── AWS Bedrock ───────────────────────────────────────────────────────────
    /// AWS region override (also honoured via AWS_DEFAULT_REGION env var).
    pub aws_region: Option<String>,

    // ── Google Vertex ─────────────────────────────────────────────────────────
    pub vertex_project: Option<String>,
    pub vertex_location: Option<String>,

    /// Free-form provider-specific options merged on top of the catalog
    /// defaults and the provider-level options.  Later layers override
    /// earlier ones; see the option-merging rules in nexora-model.
    #[serde(default)]
    pub provider_options: serde_json::Value,

    /// Whether this provider is enabled.  Disabled providers are skipped by
    /// the fast-summariser selection.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".into(),
            name: "claude-sonnet-4-5".into(),
            // api_key_env is intentionally None here.  Key resolution falls
            // through to the provider registry, which knows the canonical
            // env-var name for each provider.  Hard-coding it here would
            // shadow the registry lookup whenever the provider is overridden.
            api_key_env: None,
            api_key: None,
            base_url: None,
            max_tokens: None,
            temperature: None,
            top_p: None,
            top_k: None,
            frequency_penalty: None,
            presence_penalty: None,
            reasoning_effort: None,
            think: false,
            azure_resource: None,
            azure_deployment: None,
            azure_api_version: None,
            aws_region: None,
            vertex_project: None,
            vertex_location: None,
            provider_options: serde_json::Value::Null,
            enabled: true,
        }
    }
}

fn default_max_tool_rounds() -> u32 {
    200
}
fn default_summarize_threshold() -> f32 {
    0.85
}
fn default_keep_recent() -> usize {
    10
}
fn default_tool_result_token_cap() -> usize {
    2000
}
fn default_summary_keep_turns() -> usize {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Auto-approve every tool invocation without consulting the permission
    /// service.
    #[serde(default)]
    pub yolo_mode: bool,
    /// Tool allow-list.  `None` exposes the full intrinsic catalogue; an
    /// explicit list restricts the tools offered to the model.
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,
    /// Allow-list applied to tools contributed by MCP servers.
    #[serde(default)]
    pub mcp_allowed_tools: Option<Vec<String>>,
    /// Maximum number of autonomous tool-call rounds before stopping
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,
    /// Schedule a summarisation turn after a turn whose estimated prompt
    /// tokens reach this fraction of the context window.
    #[serde(default = "default_true")]
    pub auto_summarize: bool,
    #[serde(default = "default_summarize_threshold")]
    pub summarize_threshold: f32,
    /// Recent-message window protected from tool-result dropping during
    /// compaction.  KeepRecent retains twice this many messages.
    #[serde(default = "default_keep_recent")]
    pub keep_recent: usize,
    /// Per-tool-result token budget enforced by the TruncateToolOutputs
    /// compaction level.  0 disables per-result truncation.
    #[serde(default = "default_tool_result_token_cap")]
    pub tool_result_token_cap: usize,
    /// Number of recent turns retained verbatim after a summarisation turn.
    #[serde(default = "default_summary_keep_turns")]
    pub summary_keep_turns: usize,
    /// System prompt override; leave None to use the built-in prompt
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            yolo_mode: false,
            allowed_tools: None,
            mcp_allowed_tools: None,
            max_tool_rounds: default_max_tool_rounds(),
            auto_summarize: true,
            summarize_threshold: default_summarize_threshold(),
            keep_recent: default_keep_recent(),
            tool_result_token_cap: default_tool_result_token_cap(),
            summary_keep_turns: default_summary_keep_turns(),
            system_prompt: None,
        }
    }
}

fn default_queue_timeout_secs() -> u64 {
    30 * 60
}
fn default_per_agent_cpu_percent() -> f32 {
    12.0
}
fn default_per_agent_memory_mb() -> u64 {
    384
}
fn default_min_free_cpu_percent() -> f32 {
    15.0
}
fn default_min_free_memory_mb() -> u64 {
    768
}
fn default_per_parent_cap() -> usize {
    10
}

/// Delegation pool sizing and admission control.
///
/// `max_concurrent = 0` selects dynamic sizing: the pool recomputes the
/// ceiling from available CPU and memory on every spawn attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationConfig {
    #[serde(default)]
    pub max_concurrent: usize,
    #[serde(default = "default_queue_timeout_secs")]
    pub queue_timeout_secs: u64,
    /// Estimated CPU share of one sub-agent, in percent of the whole machine.
    #[serde(default = "default_per_agent_cpu_percent")]
    pub per_agent_cpu_percent: f32,
    /// Estimated resident memory of one sub-agent.
    #[serde(default = "default_per_agent_memory_mb")]
    pub per_agent_memory_mb: u64,
    /// CPU headroom that must remain free after a spawn.
    #[serde(default = "default_min_free_cpu_percent")]
    pub min_free_cpu_percent: f32,
    /// Memory headroom that must remain free after a spawn.
    #[serde(default = "default_min_free_memory_mb")]
    pub min_free_memory_mb: u64,
    /// Hard ceiling on concurrent delegate sessions per parent session,
    /// independent of pool-wide headroom.
    #[serde(default = "default_per_parent_cap")]
    pub per_parent_cap: usize,
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 0,
            queue_timeout_secs: default_queue_timeout_secs(),
            per_agent_cpu_percent: default_per_agent_cpu_percent(),
            per_agent_memory_mb: default_per_agent_memory_mb(),
            min_free_cpu_percent: default_min_free_cpu_percent(),
            min_free_memory_mb: default_min_free_memory_mb(),
            per_parent_cap: default_per_parent_cap(),
        }
    }
}

fn default_poll_interval_secs() -> u64 {
    5
}
fn default_cpu_threshold() -> f32 {
    80.0
}
fn default_memory_threshold() -> f32 {
    85.0
}
fn default_min_free_disk_gb() -> u64 {
    5
}
fn default_max_violations() -> usize {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// CPU usage percentage above which a violation is recorded.
    #[serde(default = "default_cpu_threshold")]
    pub cpu_threshold: f32,
    /// Memory usage percentage above which a violation is recorded.
    #[serde(default = "default_memory_threshold")]
    pub memory_threshold: f32,
    /// Minimum free disk space below which a violation is recorded.
    #[serde(default = "default_min_free_disk_gb")]
    pub min_free_disk_gb: u64,
    /// Transition an attached state machine to ResourcePaused once
    /// `max_violations` violations have accumulated.
    #[serde(default)]
    pub enable_auto_pause: bool,
    #[serde(default = "default_max_violations")]
    pub max_violations: usize,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            cpu_threshold: default_cpu_threshold(),
            memory_threshold: default_memory_threshold(),
            min_free_disk_gb: default_min_free_disk_gb(),
            enable_auto_pause: false,
            max_violations: default_max_violations(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Global retry ceiling across all recovery strategies.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
