// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Inline context compaction: token estimation and tiered, pairing-preserving
//! message pruning.

use nexora_model::{ContentPart, Message};

/// Structural overhead charged per tool-call / tool-result part.
const STRUCTURAL_OVERHEAD: usize = 20;
const IMAGE_TOKENS: usize = 100;
const FINISH_TOKENS: usize = 10;

pub const BRIDGE_TEXT: &str = "[earlier conversation compacted]";
const ELIDED_TEXT: &str = "[tool output elided to fit context budget]";
const TRUNCATION_NOTICE: &str = "\n[output truncated to fit context budget]";
const SUMMARY_PLACEHOLDER: &str = "[no summary available; earlier history dropped]";

// ─── Token estimation ─────────────────────────────────────────────────────────

/// `⌈len_bytes / 4 × 1.1⌉`
fn text_tokens(s: &str) -> usize {
    (s.len() * 11).div_ceil(40)
}

pub fn estimate_part(part: &ContentPart) -> usize {
    match part {
        ContentPart::Text { text } => text_tokens(text),
        ContentPart::Reasoning { text, signature } => {
            text_tokens(text) + signature.as_deref().map(text_tokens).unwrap_or(0)
        }
        ContentPart::ToolCall { id, name, arguments, .. } => {
            STRUCTURAL_OVERHEAD + text_tokens(id) + text_tokens(name) + text_tokens(arguments)
        }
        ContentPart::ToolResult { call_id, content, data, mime_type, metadata, .. } => {
            STRUCTURAL_OVERHEAD
                + text_tokens(call_id)
                + text_tokens(content)
                + data.as_ref().map(|d| d.len() / 3).unwrap_or(0)
                + mime_type.as_deref().map(text_tokens).unwrap_or(0)
                + metadata.as_deref().map(text_tokens).unwrap_or(0)
        }
        ContentPart::Binary { data, .. } => data.len() / 3,
        ContentPart::ImageUrl { .. } => IMAGE_TOKENS,
        ContentPart::Finish { .. } => FINISH_TOKENS,
    }
}

pub fn estimate_message(message: &Message) -> usize {
    message.parts.iter().map(estimate_part).sum()
}

pub fn estimate(messages: &[Message]) -> usize {
    messages.iter().map(estimate_message).sum()
}

// ─── Level selection ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CompactionLevel {
    None,
    TruncateToolOutputs,
    DropToolResults,
    KeepRecent,
    Aggressive,
}

/// Map context pressure to a compaction level.  A zero window disables
/// compaction entirely.
pub fn select_level(used_tokens: usize, context_window: usize) -> CompactionLevel {
    if context_window == 0 {
        return CompactionLevel::None;
    }
    let ratio = used_tokens as f64 / context_window as f64;
    if ratio < 0.50 {
        CompactionLevel::None
    } else if ratio < 0.65 {
        CompactionLevel::TruncateToolOutputs
    } else if ratio < 0.75 {
        CompactionLevel::DropToolResults
    } else if ratio < 0.85 {
        CompactionLevel::KeepRecent
    } else {
        CompactionLevel::Aggressive
    }
}

#[derive(Debug, Clone)]
pub struct CompactorConfig {
    pub context_window: usize,
    /// Per-tool-result token budget for TruncateToolOutputs.  0 disables.
    pub tool_result_budget: usize,
    /// Recent-message window protected from tool-result dropping;
    /// KeepRecent retains twice this many messages.
    pub keep_recent: usize,
}

impl Default for CompactorConfig {
    fn default() -> Self {
        Self {
            context_window: 0,
            tool_result_budget: 2000,
            keep_recent: 10,
        }
    }
}

// ─── Compaction ───────────────────────────────────────────────────────────────

/// Apply tiered compaction.  Returns the (possibly shorter) message list and
/// whether any level was applied.
pub fn compact(
    messages: Vec<Message>,
    used_tokens: usize,
    cfg: &CompactorConfig,
) -> (Vec<Message>, bool, CompactionLevel) {
    let level = select_level(used_tokens, cfg.context_window);
    let out = match level {
        CompactionLevel::None => messages,
        CompactionLevel::TruncateToolOutputs => truncate_tool_outputs(messages, cfg),
        CompactionLevel::DropToolResults => {
            let truncated = truncate_tool_outputs(messages, cfg);
            drop_old_tool_results(truncated, cfg.keep_recent)
        }
        CompactionLevel::KeepRecent => keep_recent(messages, cfg.keep_recent * 2),
        CompactionLevel::Aggressive => aggressive(messages),
    };
    (out, level != CompactionLevel::None, level)
}

/// Rewrite every ToolResult whose content exceeds the per-result budget.
fn truncate_tool_outputs(mut messages: Vec<Message>, cfg: &CompactorConfig) -> Vec<Message> {
    if cfg.tool_result_budget == 0 {
        return messages;
    }
    for message in &mut messages {
        for part in &mut message.parts {
            if let ContentPart::ToolResult { content, .. } = part {
                if text_tokens(content) > cfg.tool_result_budget {
                    *content = truncate_at_word_boundary(content, cfg.tool_result_budget * 4);
                    content.push_str(TRUNCATION_NOTICE);
                }
            }
        }
    }
    messages
}

/// Cut `content` to at most `cap_bytes`, preferring a word boundary past the
/// three-quarters mark when one exists.
fn truncate_at_word_boundary(content: &str, cap_bytes: usize) -> String {
    if content.len() <= cap_bytes {
        return content.to_string();
    }
    let mut cap = cap_bytes.min(content.len());
    while cap > 0 && !content.is_char_boundary(cap) {
        cap -= 1;
    }
    let head = &content[..cap];
    let floor = cap * 3 / 4;
    match head.rfind(char::is_whitespace).filter(|pos| *pos >= floor) {
        Some(pos) => head[..pos].to_string(),
        None => head.to_string(),
    }
}

/// Replace tool-result content outside the recent window with a placeholder
/// and clear binary payloads.  A result whose matching call sits inside the
/// recent window is left intact.
fn drop_old_tool_results(mut messages: Vec<Message>, keep_recent: usize) -> Vec<Message> {
    let len = messages.len();
    let recent_start = len.saturating_sub(keep_recent);

    // Call IDs whose ToolCall lives in the recent window.
    let protected: std::collections::HashSet<String> = messages[recent_start..]
        .iter()
        .flat_map(|m| m.parts.iter())
        .filter_map(|p| match p {
            ContentPart::ToolCall { id, .. } => Some(id.clone()),
            _ => None,
        })
        .collect();

    for message in messages.iter_mut().take(recent_start) {
        for part in &mut message.parts {
            if let ContentPart::ToolResult { call_id, content, data, mime_type, .. } = part {
                if protected.contains(call_id) {
                    continue;
                }
                if content.len() > ELIDED_TEXT.len() {
                    *content = ELIDED_TEXT.to_string();
                }
                *data = None;
                *mime_type = None;
            }
        }
    }
    messages
}

/// Walk the tail-window start backwards until no retained ToolResult loses
/// its matching ToolCall.  Keeping a result without its call would violate
/// pairing on the next outgoing request.
pub(crate) fn widen_to_pairing_boundary(messages: &[Message], mut start: usize) -> usize {
    loop {
        let call_ids: std::collections::HashSet<&str> = messages[start..]
            .iter()
            .flat_map(|m| m.parts.iter())
            .filter_map(|p| match p {
                ContentPart::ToolCall { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect();
        let orphaned = messages[start..]
            .iter()
            .flat_map(|m| m.parts.iter())
            .any(|p| matches!(p, ContentPart::ToolResult { call_id, .. } if !call_ids.contains(call_id.as_str())));
        if !orphaned || start == 0 {
            return start;
        }
        start -= 1;
    }
}

/// Retain summary messages, a bridge marker, and the last `keep` messages.
fn keep_recent(messages: Vec<Message>, keep: usize) -> Vec<Message> {
    if messages.len() <= keep {
        return messages;
    }
    let start = widen_to_pairing_boundary(&messages, messages.len() - keep);

    let mut out: Vec<Message> = Vec::with_capacity(keep + 2);
    for m in &messages[..start] {
        if m.is_summary {
            out.push(m.clone());
        }
    }
    if start > 0 {
        let session_id = messages[0].session_id.clone();
        out.push(Message::assistant(session_id, BRIDGE_TEXT));
    }
    out.extend(messages[start..].iter().cloned());
    out
}

/// Retain only the summary (or a synthetic placeholder) plus the last 5
/// messages.
fn aggressive(messages: Vec<Message>) -> Vec<Message> {
    const TAIL: usize = 5;
    if messages.len() <= TAIL {
        return messages;
    }
    let start = widen_to_pairing_boundary(&messages, messages.len() - TAIL);
    let session_id = messages[0].session_id.clone();

    let mut out: Vec<Message> = Vec::with_capacity(TAIL + 1);
    match messages[..start].iter().rev().find(|m| m.is_summary) {
        Some(summary) => out.push(summary.clone()),
        None => {
            let mut placeholder = Message::assistant(session_id, SUMMARY_PLACEHOLDER);
            placeholder.is_summary = true;
            out.push(placeholder);
        }
    }
    out.extend(messages[start..].iter().cloned());
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
