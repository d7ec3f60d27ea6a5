// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Text-format tool-call salvage.
//!
//! Some providers emit tool invocations as plain text instead of structured
//! tool calls: XML-style `<tool_call>` blocks (Qwen), `<function=...>` tags
//! (Hermes/Nous), vendor pseudo-elements (`<|tool_call_begin|>`), or bare
//! bracketed JSON blobs.  When one of these patterns is found the text
//! segment is rewritten into structured ToolCall parts with freshly minted
//! call IDs, and the turn continues as if the provider had emitted real
//! tool calls.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;
use tracing::debug;

use nexora_model::ids::{self, IdProfile};
use nexora_model::sanitize::sanitize_tool_name;

/// A tool call recovered from free text.
#[derive(Debug, Clone, PartialEq)]
pub struct SalvagedCall {
    pub id: String,
    pub name: String,
    /// Canonical JSON argument string.
    pub arguments: String,
}

fn xml_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<tool_call>\s*(\{.*?\})\s*</tool_call>").unwrap())
}

fn function_tag_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)<function=([A-Za-z0-9_-]+)>\s*(\{.*?\})?\s*</function>").unwrap()
    })
}

fn pseudo_element_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)<\|tool_call_begin\|>\s*([^<\s]+)\s*<\|tool_sep\|>\s*(\{.*?\})\s*<\|tool_call_end\|>")
            .unwrap()
    })
}

fn bracketed_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\[TOOL_CALL\]\s*(\{.*?\})(?:\s*\[/TOOL_CALL\])?").unwrap())
}

/// Scan `text` for recognisable tool-call markup.
///
/// Returns the text with the matched segments removed, plus the recovered
/// calls in order of appearance.  `None` when nothing was found.
pub fn salvage(text: &str, profile: IdProfile) -> Option<(String, Vec<SalvagedCall>)> {
    let mut calls: Vec<(usize, SalvagedCall)> = Vec::new();
    let mut spans: Vec<(usize, usize)> = Vec::new();

    for caps in xml_pattern().captures_iter(text) {
        let whole = caps.get(0).unwrap();
        if let Some(call) = call_from_named_json(caps.get(1).unwrap().as_str(), profile) {
            calls.push((whole.start(), call));
            spans.push((whole.start(), whole.end()));
        }
    }
    for caps in function_tag_pattern().captures_iter(text) {
        let whole = caps.get(0).unwrap();
        let name = sanitize_tool_name(caps.get(1).unwrap().as_str());
        if name.is_empty() {
            continue;
        }
        let arguments = caps
            .get(2)
            .and_then(|m| canonical_json(m.as_str()))
            .unwrap_or_else(|| "{}".to_string());
        calls.push((
            whole.start(),
            SalvagedCall {
                id: ids::generate(profile),
                name,
                arguments,
            },
        ));
        spans.push((whole.start(), whole.end()));
    }
    for caps in pseudo_element_pattern().captures_iter(text) {
        let whole = caps.get(0).unwrap();
        let name = sanitize_tool_name(caps.get(1).unwrap().as_str());
        if name.is_empty() {
            continue;
        }
        if let Some(arguments) = canonical_json(caps.get(2).unwrap().as_str()) {
            calls.push((
                whole.start(),
                SalvagedCall {
                    id: ids::generate(profile),
                    name,
                    arguments,
                },
            ));
            spans.push((whole.start(), whole.end()));
        }
    }
    for caps in bracketed_pattern().captures_iter(text) {
        let whole = caps.get(0).unwrap();
        if let Some(call) = call_from_named_json(caps.get(1).unwrap().as_str(), profile) {
            calls.push((whole.start(), call));
            spans.push((whole.start(), whole.end()));
        }
    }

    if calls.is_empty() {
        return None;
    }
    calls.sort_by_key(|(pos, _)| *pos);
    spans.sort_unstable();
    debug!(count = calls.len(), "salvaged tool calls from text output");

    // Remove the matched spans from the text, keeping any surrounding prose.
    let mut remaining = String::with_capacity(text.len());
    let mut cursor = 0;
    for (start, end) in spans {
        if start > cursor {
            remaining.push_str(&text[cursor..start]);
        }
        cursor = cursor.max(end);
    }
    if cursor < text.len() {
        remaining.push_str(&text[cursor..]);
    }

    Some((
        remaining.trim().to_string(),
        calls.into_iter().map(|(_, c)| c).collect(),
    ))
}

/// Parse a `{"name": ..., "arguments"|"parameters": ...}` blob.
fn call_from_named_json(json: &str, profile: IdProfile) -> Option<SalvagedCall> {
    let v: Value = serde_json::from_str(json).ok()?;
    let name = sanitize_tool_name(v.get("name")?.as_str()?);
    if name.is_empty() {
        return None;
    }
    let args = v
        .get("arguments")
        .or_else(|| v.get("parameters"))
        .cloned()
        .unwrap_or_else(|| Value::Object(Default::default()));
    let arguments = match args {
        // Arguments may themselves be a JSON-encoded string.
        Value::String(s) => canonical_json(&s).unwrap_or_else(|| "{}".into()),
        other => other.to_string(),
    };
    Some(SalvagedCall {
        id: ids::generate(profile),
        name,
        arguments,
    })
}

fn canonical_json(raw: &str) -> Option<String> {
    serde_json::from_str::<Value>(raw).ok().map(|v| v.to_string())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
