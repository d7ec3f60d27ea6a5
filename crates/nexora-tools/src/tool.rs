// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier minted by the model or the salvage path.
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments
    pub args: Value,
}

/// Per-invocation context handed to every tool.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    /// Session the invocation belongs to.
    pub session_id: String,
    pub working_dir: Option<PathBuf>,
}

impl ToolContext {
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            working_dir: None,
        }
    }
}

/// The result of executing a tool.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub call_id: String,
    /// Plain-text content fed back to the model.
    pub content: String,
    /// Base64 payload for binary output (screenshots, downloads).
    pub data: Option<String>,
    pub mime_type: Option<String>,
    /// Opaque tool-specific metadata (JSON string) surfaced to observers but
    /// not to the model.
    pub metadata: Option<String>,
    /// If true, the tool execution failed non-fatally (content carries the
    /// error message).
    pub is_error: bool,
}

impl ToolOutput {
    /// Successful plain-text result.
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: content.into(),
            data: None,
            mime_type: None,
            metadata: None,
            is_error: false,
        }
    }

    /// Error result containing a plain-text error message.
    pub fn err(call_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: msg.into(),
            data: None,
            mime_type: None,
            metadata: None,
            is_error: true,
        }
    }

    pub fn with_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }

    pub fn with_data(mut self, data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self.mime_type = Some(mime_type.into());
        self
    }
}

/// Trait implemented by every capability exposed to the model.
///
/// The core treats tools as opaque: a stable name, a model-facing
/// description, a JSON Schema for inputs, and an async handler.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the input object
    fn parameters_schema(&self) -> Value;
    /// Whether independent invocations of this tool may run concurrently
    /// within one assistant batch.  Tools with side effects that must be
    /// serialised (shell, edits) return `false`.
    fn parallel_safe(&self) -> bool {
        false
    }
    /// Execute the tool.  Errors should be wrapped in [`ToolOutput::err`].
    async fn execute(&self, ctx: &ToolContext, call: &ToolCall) -> ToolOutput;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
