use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::options::CallOptions;

// ─── Roles & finish reasons ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Why a model stream stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Canceled,
    Length,
    ToolCalls,
    Error,
    Unknown,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Canceled => "canceled",
            FinishReason::Length => "length",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::Error => "error",
            FinishReason::Unknown => "unknown",
        }
    }
}

// ─── Content parts ────────────────────────────────────────────────────────────

/// A single part of a message.
///
/// Messages are ordered sequences of parts: a streaming assistant message
/// typically accumulates `Reasoning`, `Text`, and `ToolCall` parts in arrival
/// order and ends with a `Finish` marker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    /// Hidden chain-of-thought.  `signature` is the provider-supplied replay
    /// token (Anthropic extended thinking) and must be sent back verbatim.
    Reasoning {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    ToolCall {
        id: String,
        name: String,
        /// Canonical JSON argument string.
        arguments: String,
        /// False while argument deltas are still being streamed.
        finished: bool,
    },
    ToolResult {
        call_id: String,
        content: String,
        /// Base64 payload for binary tool output.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        /// Opaque tool-specific metadata (JSON string).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<String>,
        #[serde(default)]
        is_error: bool,
    },
    Binary {
        data: String,
        mime_type: String,
    },
    ImageUrl {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Finish {
        reason: FinishReason,
    },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image(url: impl Into<String>) -> Self {
        Self::ImageUrl {
            url: url.into(),
            detail: None,
        }
    }
}

// ─── Messages ─────────────────────────────────────────────────────────────────

/// A single message in a session.
///
/// Immutable once final, except streaming assistant messages which are
/// updated in place until the turn ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub parts: Vec<ContentPart>,
    /// Model / provider tags recorded on assistant messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Set only on messages produced by the summarisation path.
    #[serde(default)]
    pub is_summary: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    fn new(session_id: impl Into<String>, role: Role, parts: Vec<ContentPart>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            role,
            parts,
            model: None,
            provider: None,
            is_summary: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn system(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(session_id, Role::System, vec![ContentPart::text(text)])
    }

    pub fn user(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(session_id, Role::User, vec![ContentPart::text(text)])
    }

    pub fn user_with_parts(session_id: impl Into<String>, parts: Vec<ContentPart>) -> Self {
        Self::new(session_id, Role::User, parts)
    }

    pub fn assistant(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(session_id, Role::Assistant, vec![ContentPart::text(text)])
    }

    /// Empty assistant message used as the in-place streaming target.
    pub fn assistant_streaming(session_id: impl Into<String>) -> Self {
        Self::new(session_id, Role::Assistant, Vec::new())
    }

    pub fn tool_result(
        session_id: impl Into<String>,
        call_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::new(
            session_id,
            Role::Tool,
            vec![ContentPart::ToolResult {
                call_id: call_id.into(),
                content: content.into(),
                data: None,
                mime_type: None,
                metadata: None,
                is_error: false,
            }],
        )
    }

    pub fn tool_error(
        session_id: impl Into<String>,
        call_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let mut m = Self::tool_result(session_id, call_id, content);
        if let Some(ContentPart::ToolResult { is_error, .. }) = m.parts.first_mut() {
            *is_error = true;
        }
        m
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    /// Concatenation of all text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn reasoning(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Reasoning { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// All tool-call parts, in arrival order.
    pub fn tool_calls(&self) -> Vec<&ContentPart> {
        self.parts
            .iter()
            .filter(|p| matches!(p, ContentPart::ToolCall { .. }))
            .collect()
    }

    pub fn tool_results(&self) -> Vec<&ContentPart> {
        self.parts
            .iter()
            .filter(|p| matches!(p, ContentPart::ToolResult { .. }))
            .collect()
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.parts.iter().rev().find_map(|p| match p {
            ContentPart::Finish { reason } => Some(*reason),
            _ => None,
        })
    }

    pub fn image_urls(&self) -> Vec<&str> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::ImageUrl { url, .. } => Some(url.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn has_images(&self) -> bool {
        !self.image_urls().is_empty()
            || self
                .parts
                .iter()
                .any(|p| matches!(p, ContentPart::Binary { .. }))
    }

    // ── Streaming mutators ────────────────────────────────────────────────────

    pub fn append_text(&mut self, delta: &str) {
        if let Some(ContentPart::Text { text }) = self.parts.last_mut() {
            text.push_str(delta);
        } else {
            self.parts.push(ContentPart::text(delta));
        }
        self.updated_at = Utc::now();
    }

    pub fn append_reasoning(&mut self, delta: &str, signature: Option<&str>) {
        if let Some(ContentPart::Reasoning { text, signature: sig }) = self.parts.last_mut() {
            text.push_str(delta);
            if let Some(s) = signature {
                *sig = Some(s.to_string());
            }
        } else {
            self.parts.push(ContentPart::Reasoning {
                text: delta.to_string(),
                signature: signature.map(str::to_string),
            });
        }
        self.updated_at = Utc::now();
    }

    /// Record a finalised tool call requested by the model.
    pub fn add_tool_call(&mut self, id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) {
        self.parts.push(ContentPart::ToolCall {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
            finished: true,
        });
        self.updated_at = Utc::now();
    }

    pub fn set_finish(&mut self, reason: FinishReason) {
        self.parts.push(ContentPart::Finish { reason });
        self.updated_at = Utc::now();
    }
}

// ─── Requests & stream events ─────────────────────────────────────────────────

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the input object
    pub parameters: serde_json::Value,
}

/// Request sent to a model provider.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    /// System prompt.  Kept out of `messages` so providers with a dedicated
    /// system field map it without scanning.
    pub system: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    /// Fully merged + enriched call options for this request.
    pub options: CallOptions,
}

/// A single streamed event from the model.
#[derive(Debug, Clone)]
pub enum ResponseEvent {
    TextDelta(String),
    /// A reasoning delta.  `signature` arrives once, at the end of the block,
    /// for providers that sign their thinking output.
    ReasoningDelta {
        text: String,
        signature: Option<String>,
    },
    /// Tool-call fragment.  Providers interleave fragments for parallel calls
    /// by `index`; id/name arrive once, arguments accumulate across deltas.
    ToolCallDelta {
        index: u32,
        id: String,
        name: String,
        arguments: String,
    },
    Usage(Usage),
    /// The stream ended.
    Finish(FinishReason),
    /// A recoverable provider-level error (non-fatal warning).
    Error(String),
}

/// Token usage from one model call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_write_tokens += other.cache_write_tokens;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
