// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Anthropic Messages API driver.
//!
//! Also carries the MiniMax variant: MiniMax speaks the Anthropic wire
//! protocol but authenticates with `Authorization: Bearer` instead of the
//! `x-api-key` header.

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::{
    provider::ResponseStream, ContentPart, FinishReason, Message, CompletionRequest,
    ResponseEvent, Role, Usage,
};

/// How credentials are presented to the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnthropicAuth {
    /// `x-api-key: <key>` (Anthropic's native scheme).
    XApiKey,
    /// `Authorization: Bearer <key>` with the `x-api-key` header deliberately
    /// emptied.  Used for OAuth JWTs and for MiniMax.
    Bearer,
}

pub struct AnthropicProvider {
    provider_id: String,
    model: String,
    api_key: Option<String>,
    base_url: String,
    auth: AnthropicAuth,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(
        model: String,
        api_key: Option<String>,
        base_url: Option<String>,
    ) -> Self {
        // A JWT credential switches to Bearer auth automatically.
        let auth = match &api_key {
            Some(k) if k.starts_with("eyJ") => AnthropicAuth::Bearer,
            _ => AnthropicAuth::XApiKey,
        };
        Self {
            provider_id: "anthropic".into(),
            model,
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".into()),
            auth,
            client: reqwest::Client::new(),
        }
    }

    /// MiniMax: Anthropic transport, distinct provider id, Bearer auth.
    pub fn minimax(model: String, api_key: Option<String>, base_url: Option<String>) -> Self {
        Self {
            provider_id: "minimax".into(),
            model,
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.minimax.io/anthropic".into()),
            auth: AnthropicAuth::Bearer,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl crate::ModelProvider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.provider_id
    }
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let key = self.api_key.as_deref().context("Anthropic API key not set")?;

        let messages = build_messages(&req.messages);
        let opts = &req.options;

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": opts.max_tokens.unwrap_or(4096),
            "stream": true,
        });
        if let Some(t) = opts.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = opts.top_p {
            body["top_p"] = json!(p);
        }
        if let Some(k) = opts.top_k {
            body["top_k"] = json!(k);
        }
        if let Some(system) = &req.system {
            if !system.is_empty() {
                body["system"] = json!(system);
            }
        }
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }
        // Forward provider-specific extras (thinking block, etc.) verbatim.
        // `anthropic_beta` is a header, not a body field.
        for (k, v) in &opts.extra {
            if k != "anthropic_beta" {
                body[k.as_str()] = v.clone();
            }
        }

        let thinking_active = opts.extra.contains_key("thinking");
        debug!(model = %self.model, thinking = thinking_active, "sending anthropic request");

        let mut request = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("anthropic-version", "2023-06-01");
        request = match self.auth {
            AnthropicAuth::XApiKey => request.header("x-api-key", key),
            AnthropicAuth::Bearer => {
                // ANTHROPIC_API_KEY content must not ride along with a Bearer
                // credential; the header is sent empty on purpose.
                request
                    .header("authorization", format!("Bearer {key}"))
                    .header("x-api-key", "")
            }
        };
        if let Some(beta) = beta_header(&req, thinking_active) {
            request = request.header("anthropic-beta", beta);
        }

        let resp = request
            .json(&body)
            .send()
            .await
            .context("Anthropic request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("Anthropic error {status}: {text}");
        }

        // SSE lines can be split across TCP chunks, so a remainder buffer is
        // carried forward.  Only complete lines are parsed; anything left
        // over is prepended to the next chunk.
        let event_stream = resp
            .bytes_stream()
            .scan(String::new(), |buf, chunk| {
                let text = match chunk {
                    Ok(b) => String::from_utf8_lossy(&b).to_string(),
                    Err(e) => {
                        return futures::future::ready(Some(vec![Err(anyhow::anyhow!(e))]));
                    }
                };
                buf.push_str(&text);
                let mut events = Vec::new();
                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim_end_matches('\r').to_string();
                    buf.drain(..=pos);
                    if let Some(data) = line.strip_prefix("data: ") {
                        if let Ok(v) = serde_json::from_str::<Value>(data.trim()) {
                            events.extend(parse_event(&v).into_iter().map(Ok));
                        }
                    }
                }
                futures::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

/// Build the `anthropic-beta` header value.
///
/// An explicit `anthropic_beta` option is the base; when thinking is active
/// `interleaved-thinking-2025-05-14` is appended (comma-separated) rather
/// than replacing the existing value.
fn beta_header(req: &CompletionRequest, thinking_active: bool) -> Option<String> {
    let existing = req
        .options
        .extra
        .get("anthropic_beta")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    if !thinking_active {
        return existing;
    }
    const INTERLEAVED: &str = "interleaved-thinking-2025-05-14";
    Some(match existing {
        Some(base) if base.split(',').any(|b| b.trim() == INTERLEAVED) => base,
        Some(base) => format!("{base},{INTERLEAVED}"),
        None => INTERLEAVED.to_string(),
    })
}

/// Map part-based messages onto Anthropic's content-block wire format.
fn build_messages(messages: &[Message]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::with_capacity(messages.len());
    for m in messages {
        match m.role {
            // System text travels in the request's top-level `system` field.
            Role::System => continue,
            Role::User => {
                let blocks = user_blocks(&m.parts);
                if !blocks.is_empty() {
                    out.push(json!({ "role": "user", "content": blocks }));
                }
            }
            Role::Assistant => {
                let blocks = assistant_blocks(&m.parts);
                if !blocks.is_empty() {
                    out.push(json!({ "role": "assistant", "content": blocks }));
                }
            }
            // Tool results are user-role tool_result blocks on this wire.
            Role::Tool => {
                let blocks: Vec<Value> = m
                    .parts
                    .iter()
                    .filter_map(tool_result_block)
                    .collect();
                if !blocks.is_empty() {
                    out.push(json!({ "role": "user", "content": blocks }));
                }
            }
        }
    }
    out
}

fn user_blocks(parts: &[ContentPart]) -> Vec<Value> {
    parts
        .iter()
        .filter_map(|p| match p {
            ContentPart::Text { text } if !text.is_empty() => {
                Some(json!({ "type": "text", "text": text }))
            }
            ContentPart::ImageUrl { url, .. } => image_block(url),
            ContentPart::Binary { data, mime_type } => Some(json!({
                "type": "image",
                "source": { "type": "base64", "media_type": mime_type, "data": data },
            })),
            _ => None,
        })
        .collect()
}

fn assistant_blocks(parts: &[ContentPart]) -> Vec<Value> {
    parts
        .iter()
        .filter_map(|p| match p {
            ContentPart::Text { text } if !text.is_empty() => {
                Some(json!({ "type": "text", "text": text }))
            }
            ContentPart::Reasoning { text, signature } => {
                // Unsigned thinking cannot be replayed; the API rejects it.
                signature.as_ref().map(|sig| {
                    json!({ "type": "thinking", "thinking": text, "signature": sig })
                })
            }
            ContentPart::ToolCall { id, name, arguments, .. } => {
                let input: Value =
                    serde_json::from_str(arguments).unwrap_or_else(|_| json!({}));
                Some(json!({ "type": "tool_use", "id": id, "name": name, "input": input }))
            }
            _ => None,
        })
        .collect()
}

fn tool_result_block(part: &ContentPart) -> Option<Value> {
    match part {
        ContentPart::ToolResult { call_id, content, data, mime_type, is_error, .. } => {
            let mut inner = vec![json!({ "type": "text", "text": content })];
            if let (Some(d), Some(mt)) = (data, mime_type) {
                if mt.starts_with("image/") {
                    inner.push(json!({
                        "type": "image",
                        "source": { "type": "base64", "media_type": mt, "data": d },
                    }));
                }
            }
            Some(json!({
                "type": "tool_result",
                "tool_use_id": call_id,
                "content": inner,
                "is_error": is_error,
            }))
        }
        _ => None,
    }
}

/// Data URLs become base64 source blocks; anything else is a remote URL.
fn image_block(url: &str) -> Option<Value> {
    if let Some(rest) = url.strip_prefix("data:") {
        let (meta, b64) = rest.split_once(',')?;
        let media_type = meta.strip_suffix(";base64").unwrap_or(meta);
        Some(json!({
            "type": "image",
            "source": { "type": "base64", "media_type": media_type, "data": b64 },
        }))
    } else {
        Some(json!({ "type": "image", "source": { "type": "url", "url": url } }))
    }
}

fn parse_event(v: &Value) -> Vec<ResponseEvent> {
    match v["type"].as_str().unwrap_or("") {
        "message_start" => {
            let usage = &v["message"]["usage"];
            vec![ResponseEvent::Usage(Usage {
                prompt_tokens: usage["input_tokens"].as_u64().unwrap_or(0),
                completion_tokens: 0,
                cache_read_tokens: usage["cache_read_input_tokens"].as_u64().unwrap_or(0),
                cache_write_tokens: usage["cache_creation_input_tokens"].as_u64().unwrap_or(0),
            })]
        }
        "content_block_start" => {
            let index = v["index"].as_u64().unwrap_or(0) as u32;
            let block = &v["content_block"];
            if block["type"].as_str() == Some("tool_use") {
                vec![ResponseEvent::ToolCallDelta {
                    index,
                    id: block["id"].as_str().unwrap_or("").to_string(),
                    name: block["name"].as_str().unwrap_or("").to_string(),
                    arguments: String::new(),
                }]
            } else {
                vec![]
            }
        }
        "content_block_delta" => {
            let index = v["index"].as_u64().unwrap_or(0) as u32;
            let delta = &v["delta"];
            match delta["type"].as_str().unwrap_or("") {
                "text_delta" => vec![ResponseEvent::TextDelta(
                    delta["text"].as_str().unwrap_or("").to_string(),
                )],
                "input_json_delta" => vec![ResponseEvent::ToolCallDelta {
                    index,
                    id: String::new(),
                    name: String::new(),
                    arguments: delta["partial_json"].as_str().unwrap_or("").to_string(),
                }],
                "thinking_delta" => vec![ResponseEvent::ReasoningDelta {
                    text: delta["thinking"].as_str().unwrap_or("").to_string(),
                    signature: None,
                }],
                "signature_delta" => vec![ResponseEvent::ReasoningDelta {
                    text: String::new(),
                    signature: delta["signature"].as_str().map(str::to_string),
                }],
                other => {
                    warn!(delta_type = other, "unknown anthropic delta type");
                    vec![]
                }
            }
        }
        "message_delta" => {
            let mut events = vec![ResponseEvent::Usage(Usage {
                prompt_tokens: 0,
                completion_tokens: v["usage"]["output_tokens"].as_u64().unwrap_or(0),
                cache_read_tokens: 0,
                cache_write_tokens: 0,
            })];
            if let Some(stop) = v["delta"]["stop_reason"].as_str() {
                events.push(ResponseEvent::Finish(map_stop_reason(stop)));
            }
            events
        }
        "error" => {
            let msg = v["error"]["message"].as_str().unwrap_or("unknown").to_string();
            vec![ResponseEvent::Error(msg)]
        }
        // ping, message_stop, content_block_stop carry nothing we need.
        _ => vec![],
    }
}

fn map_stop_reason(reason: &str) -> FinishReason {
    match reason {
        "end_turn" | "stop_sequence" => FinishReason::Stop,
        "tool_use" => FinishReason::ToolCalls,
        "max_tokens" => FinishReason::Length,
        _ => FinishReason::Unknown,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::CallOptions;

    #[test]
    fn map_stop_reasons() {
        assert_eq!(map_stop_reason("end_turn"), FinishReason::Stop);
        assert_eq!(map_stop_reason("tool_use"), FinishReason::ToolCalls);
        assert_eq!(map_stop_reason("max_tokens"), FinishReason::Length);
        assert_eq!(map_stop_reason("???"), FinishReason::Unknown);
    }

    #[test]
    fn jwt_key_selects_bearer_auth() {
        let p = AnthropicProvider::new(
            "claude-sonnet-4-5".into(),
            Some("eyJhbGciOi.payload.sig".into()),
            None,
        );
        assert_eq!(p.auth, AnthropicAuth::Bearer);
    }

    #[test]
    fn api_key_selects_x_api_key_auth() {
        let p = AnthropicProvider::new("claude-sonnet-4-5".into(), Some("sk-ant-x".into()), None);
        assert_eq!(p.auth, AnthropicAuth::XApiKey);
    }

    #[test]
    fn minimax_uses_bearer_and_distinct_id() {
        let p = AnthropicProvider::minimax("MiniMax-M2".into(), Some("key".into()), None);
        assert_eq!(p.auth, AnthropicAuth::Bearer);
        assert_eq!(crate::ModelProvider::name(&p), "minimax");
    }

    fn req_with_extra(extra: &[(&str, Value)]) -> CompletionRequest {
        let mut options = CallOptions::default();
        for (k, v) in extra {
            options.extra.insert((*k).into(), v.clone());
        }
        CompletionRequest {
            options,
            ..Default::default()
        }
    }

    #[test]
    fn beta_header_absent_without_thinking() {
        let req = req_with_extra(&[]);
        assert_eq!(beta_header(&req, false), None);
    }

    #[test]
    fn beta_header_injected_when_thinking_active() {
        let req = req_with_extra(&[("thinking", json!({"budget_tokens": 2000}))]);
        assert_eq!(
            beta_header(&req, true).as_deref(),
            Some("interleaved-thinking-2025-05-14")
        );
    }

    #[test]
    fn beta_header_appends_to_existing() {
        let req = req_with_extra(&[
            ("anthropic_beta", json!("context-1m-2025-08-07")),
            ("thinking", json!({"budget_tokens": 2000})),
        ]);
        assert_eq!(
            beta_header(&req, true).as_deref(),
            Some("context-1m-2025-08-07,interleaved-thinking-2025-05-14")
        );
    }

    #[test]
    fn beta_header_does_not_duplicate_interleaved() {
        let req = req_with_extra(&[(
            "anthropic_beta",
            json!("interleaved-thinking-2025-05-14"),
        )]);
        assert_eq!(
            beta_header(&req, true).as_deref(),
            Some("interleaved-thinking-2025-05-14")
        );
    }

    // ── Message mapping ───────────────────────────────────────────────────────

    #[test]
    fn tool_result_maps_to_user_role_block() {
        let msgs = vec![Message::tool_result("s1", "toolu_1", "file1\nfile2")];
        let wire = build_messages(&msgs);
        assert_eq!(wire.len(), 1);
        assert_eq!(wire[0]["role"], "user");
        assert_eq!(wire[0]["content"][0]["type"], "tool_result");
        assert_eq!(wire[0]["content"][0]["tool_use_id"], "toolu_1");
    }

    #[test]
    fn assistant_tool_call_maps_to_tool_use() {
        let mut m = Message::assistant_streaming("s1");
        m.add_tool_call("toolu_1", "grep", r#"{"pattern":"x"}"#);
        let wire = build_messages(&[m]);
        assert_eq!(wire[0]["content"][0]["type"], "tool_use");
        assert_eq!(wire[0]["content"][0]["input"]["pattern"], "x");
    }

    #[test]
    fn unsigned_reasoning_is_not_replayed() {
        let mut m = Message::assistant_streaming("s1");
        m.append_reasoning("private thoughts", None);
        m.append_text("answer");
        let wire = build_messages(&[m]);
        let content = wire[0]["content"].as_array().unwrap();
        assert_eq!(content.len(), 1);
        assert_eq!(content[0]["type"], "text");
    }

    #[test]
    fn signed_reasoning_is_replayed() {
        let mut m = Message::assistant_streaming("s1");
        m.append_reasoning("thoughts", Some("sig-xyz"));
        let wire = build_messages(&[m]);
        assert_eq!(wire[0]["content"][0]["type"], "thinking");
        assert_eq!(wire[0]["content"][0]["signature"], "sig-xyz");
    }

    #[test]
    fn finish_parts_are_not_serialised() {
        let mut m = Message::assistant("s1", "done");
        m.set_finish(FinishReason::Stop);
        let wire = build_messages(&[m]);
        assert_eq!(wire[0]["content"].as_array().unwrap().len(), 1);
    }

    // ── SSE parsing ───────────────────────────────────────────────────────────

    #[test]
    fn parse_text_delta() {
        let v = json!({"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hi"}});
        let ev = parse_event(&v);
        assert!(matches!(&ev[0], ResponseEvent::TextDelta(t) if t == "hi"));
    }

    #[test]
    fn parse_tool_use_start_and_args() {
        let start = json!({"type":"content_block_start","index":1,
            "content_block":{"type":"tool_use","id":"toolu_1","name":"bash"}});
        let ev = parse_event(&start);
        assert!(
            matches!(&ev[0], ResponseEvent::ToolCallDelta { index: 1, id, name, .. }
                if id == "toolu_1" && name == "bash")
        );
        let delta = json!({"type":"content_block_delta","index":1,
            "delta":{"type":"input_json_delta","partial_json":"{\"comm"}});
        let ev = parse_event(&delta);
        assert!(
            matches!(&ev[0], ResponseEvent::ToolCallDelta { arguments, .. }
                if arguments == "{\"comm")
        );
    }

    #[test]
    fn parse_message_delta_emits_finish() {
        let v = json!({"type":"message_delta","delta":{"stop_reason":"tool_use"},
            "usage":{"output_tokens":42}});
        let ev = parse_event(&v);
        assert!(matches!(ev[0], ResponseEvent::Usage(u) if u.completion_tokens == 42));
        assert!(matches!(ev[1], ResponseEvent::Finish(FinishReason::ToolCalls)));
    }

    #[test]
    fn parse_signature_delta() {
        let v = json!({"type":"content_block_delta","index":0,
            "delta":{"type":"signature_delta","signature":"abc"}});
        let ev = parse_event(&v);
        assert!(
            matches!(&ev[0], ResponseEvent::ReasoningDelta { signature: Some(s), .. } if s == "abc")
        );
    }
}
