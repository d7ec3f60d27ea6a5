// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use nexora_model::Usage;
use nexora_tools::ToolCall;

use crate::compact::CompactionLevel;
use crate::state::AgentState;

/// Events emitted by the agent during a single turn.
/// Consumers subscribe to these to drive their output.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A text chunk streamed from the model
    TextDelta(String),
    /// A complete text response from the model (after streaming finishes)
    TextComplete(String),
    /// A reasoning chunk from the model
    ReasoningDelta(String),
    /// The model has requested a tool call
    ToolCallStarted(ToolCall),
    /// A tool call finished
    ToolCallFinished {
        call_id: String,
        tool_name: String,
        output: String,
        is_error: bool,
    },
    /// The prompt was queued behind an active turn
    PromptQueued { position: usize },
    /// Inline compaction was applied to the outgoing context
    ContextCompacted {
        level: CompactionLevel,
        tokens_before: usize,
        tokens_after: usize,
    },
    /// Token usage reported by the provider for one model call
    TokenUsage(Usage),
    /// The agent lifecycle state changed
    StateChanged { from: AgentState, to: AgentState },
    /// The progress tracker detected a stuck loop.  Policy belongs to the
    /// consumer; the agent itself does not halt.
    StuckDetected { reason: String },
    /// The agent has finished processing the current user turn
    TurnComplete,
    /// The turn was cancelled; any streamed text is carried along
    Canceled { partial_text: String },
    /// A recoverable error occurred
    Error(String),
}
