// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Shared driver for OpenAI and every OpenAI-compatible chat endpoint
//! (OpenRouter, Azure, Cerebras, xAI, Z.AI, Synthetic, generic compat).

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    options::openrouter_wire_model, provider::ResponseStream, ContentPart, FinishReason,
    Message, CompletionRequest, ResponseEvent, Role, Usage,
};

/// How the API key is presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStyle {
    Bearer,
    /// Azure's `api-key: <key>` header.
    ApiKeyHeader,
    None,
}

pub struct OpenAICompatProvider {
    provider_id: String,
    model: String,
    api_key: Option<String>,
    /// Full chat-completions URL (base joined at construction time).
    chat_url: String,
    extra_headers: Vec<(String, String)>,
    auth: AuthStyle,
    client: reqwest::Client,
}

impl OpenAICompatProvider {
    pub fn new(
        provider_id: impl Into<String>,
        model: String,
        api_key: Option<String>,
        base_url: &str,
        extra_headers: Vec<(String, String)>,
        auth: AuthStyle,
    ) -> Self {
        Self::with_full_chat_url(
            provider_id,
            model,
            api_key,
            format!("{}/chat/completions", base_url.trim_end_matches('/')),
            extra_headers,
            auth,
        )
    }

    /// For endpoints whose chat URL is not `<base>/chat/completions`
    /// (Azure deployments embed the model in the path).
    pub fn with_full_chat_url(
        provider_id: impl Into<String>,
        model: String,
        api_key: Option<String>,
        chat_url: String,
        extra_headers: Vec<(String, String)>,
        auth: AuthStyle,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            model,
            api_key,
            chat_url,
            extra_headers,
            auth,
            client: reqwest::Client::new(),
        }
    }

    /// Model id actually sent on the wire.  OpenRouter appends the
    /// `:exacto` routing suffix for models on the known list.
    fn wire_model(&self) -> String {
        if self.provider_id == "openrouter" {
            openrouter_wire_model(&self.model)
        } else {
            self.model.clone()
        }
    }
}

#[async_trait]
impl crate::ModelProvider for OpenAICompatProvider {
    fn name(&self) -> &str {
        &self.provider_id
    }
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let messages = build_messages(&req);
        let opts = &req.options;

        let mut body = json!({
            "model": self.wire_model(),
            "messages": messages,
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        if let Some(mt) = opts.max_tokens {
            body["max_tokens"] = json!(mt);
        }
        if let Some(t) = opts.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = opts.top_p {
            body["top_p"] = json!(p);
        }
        if let Some(f) = opts.frequency_penalty {
            body["frequency_penalty"] = json!(f);
        }
        if let Some(p) = opts.presence_penalty {
            body["presence_penalty"] = json!(p);
        }
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        },
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }
        for (k, v) in &opts.extra {
            body[k.as_str()] = v.clone();
        }

        debug!(provider = %self.provider_id, model = %self.model, "sending chat completion");

        let mut request = self.client.post(&self.chat_url);
        match self.auth {
            AuthStyle::Bearer => {
                let key = self
                    .api_key
                    .as_deref()
                    .with_context(|| format!("{} API key not set", self.provider_id))?;
                request = request.header("authorization", format!("Bearer {key}"));
            }
            AuthStyle::ApiKeyHeader => {
                let key = self
                    .api_key
                    .as_deref()
                    .with_context(|| format!("{} API key not set", self.provider_id))?;
                request = request.header("api-key", key);
            }
            AuthStyle::None => {}
        }
        for (k, v) in &self.extra_headers {
            request = request.header(k.as_str(), v.as_str());
        }

        let resp = request.json(&body).send().await.with_context(|| {
            format!("{} request failed", self.provider_id)
        })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("{} error {status}: {text}", self.provider_id);
        }

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
                        let data = data.trim();
                        if data == "[DONE]" {
                            continue;
                        }
                        if let Ok(v) = serde_json::from_str::<Value>(data) {
                            events.extend(parse_chunk(&v).into_iter().map(Ok));
                        }
                    }
                }
                futures::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

/// Map part-based messages onto the chat-completions wire format.
fn build_messages(req: &CompletionRequest) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::with_capacity(req.messages.len() + 1);
    if let Some(system) = &req.system {
        if !system.is_empty() {
            out.push(json!({ "role": "system", "content": system }));
        }
    }
    for m in &req.messages {
        match m.role {
            Role::System => {
                out.push(json!({ "role": "system", "content": m.text() }));
            }
            Role::User => {
                if m.has_images() {
                    let parts: Vec<Value> = m
                        .parts
                        .iter()
                        .filter_map(|p| match p {
                            ContentPart::Text { text } => {
                                Some(json!({ "type": "text", "text": text }))
                            }
                            ContentPart::ImageUrl { url, detail } => {
                                let mut img = json!({ "url": url });
                                if let Some(d) = detail {
                                    img["detail"] = json!(d);
                                }
                                Some(json!({ "type": "image_url", "image_url": img }))
                            }
                            ContentPart::Binary { data, mime_type } => Some(json!({
                                "type": "image_url",
                                "image_url": { "url": format!("data:{mime_type};base64,{data}") },
                            })),
                            _ => None,
                        })
                        .collect();
                    out.push(json!({ "role": "user", "content": parts }));
                } else {
                    out.push(json!({ "role": "user", "content": m.text() }));
                }
            }
            Role::Assistant => {
                let calls: Vec<Value> = m
                    .parts
                    .iter()
                    .filter_map(|p| match p {
                        ContentPart::ToolCall { id, name, arguments, .. } => Some(json!({
                            "id": id,
                            "type": "function",
                            "function": { "name": name, "arguments": arguments },
                        })),
                        _ => None,
                    })
                    .collect();
                let mut msg = json!({ "role": "assistant" });
                let text = m.text();
                // Reasoning is not replayed on this wire; the channel is
                // provider-internal.
                msg["content"] = if text.is_empty() { Value::Null } else { json!(text) };
                if !calls.is_empty() {
                    msg["tool_calls"] = json!(calls);
                }
                out.push(msg);
            }
            Role::Tool => {
                for p in &m.parts {
                    if let ContentPart::ToolResult { call_id, content, .. } = p {
                        out.push(json!({
                            "role": "tool",
                            "tool_call_id": call_id,
                            "content": content,
                        }));
                    }
                }
            }
        }
    }
    out
}

fn parse_chunk(v: &Value) -> Vec<ResponseEvent> {
    let mut events = Vec::new();

    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        events.push(ResponseEvent::Usage(Usage {
            prompt_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
            completion_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
            cache_read_tokens: usage["prompt_tokens_details"]["cached_tokens"]
                .as_u64()
                .unwrap_or(0),
            cache_write_tokens: 0,
        }));
    }

    let Some(choice) = v["choices"].get(0) else {
        return events;
    };
    let delta = &choice["delta"];

    if let Some(text) = delta["content"].as_str() {
        if !text.is_empty() {
            events.push(ResponseEvent::TextDelta(text.to_string()));
        }
    }
    // DeepSeek-style reasoning channel.
    if let Some(reasoning) = delta["reasoning_content"].as_str().or(delta["reasoning"].as_str()) {
        if !reasoning.is_empty() {
            events.push(ResponseEvent::ReasoningDelta {
                text: reasoning.to_string(),
                signature: None,
            });
        }
    }
    if let Some(calls) = delta["tool_calls"].as_array() {
        for tc in calls {
            events.push(ResponseEvent::ToolCallDelta {
                index: tc["index"].as_u64().unwrap_or(0) as u32,
                id: tc["id"].as_str().unwrap_or("").to_string(),
                name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
                arguments: tc["function"]["arguments"].as_str().unwrap_or("").to_string(),
            });
        }
    }
    if let Some(reason) = choice["finish_reason"].as_str() {
        events.push(ResponseEvent::Finish(map_finish_reason(reason)));
    }

    events
}

fn map_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "stop" => FinishReason::Stop,
        "length" => FinishReason::Length,
        "tool_calls" | "function_call" => FinishReason::ToolCalls,
        "content_filter" => FinishReason::Error,
        _ => FinishReason::Unknown,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
