// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! AWS Bedrock driver — Converse API.
//!
//! Uses the non-streaming `POST /model/{modelId}/converse` endpoint and wraps
//! the response into the standard `ResponseStream`.  Authenticates with the
//! `AWS_BEARER_TOKEN_BEDROCK` bearer token (Bedrock API keys); full SigV4
//! signing is intentionally not carried here — operators without a bearer
//! token front the endpoint with a credential-holding proxy.

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::stream;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    ids, provider::ResponseStream, ContentPart, FinishReason, Message, CompletionRequest,
    ResponseEvent, Role, Usage,
};

pub struct BedrockProvider {
    model: String,
    region: String,
    client: reqwest::Client,
}

impl BedrockProvider {
    pub fn new(model: String, region: Option<String>) -> Self {
        let region = region
            .or_else(|| std::env::var("AWS_DEFAULT_REGION").ok())
            .or_else(|| std::env::var("AWS_REGION").ok())
            .unwrap_or_else(|| "us-east-1".into());
        Self {
            model,
            region,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl crate::ModelProvider for BedrockProvider {
    fn name(&self) -> &str {
        "bedrock"
    }
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let token = std::env::var("AWS_BEARER_TOKEN_BEDROCK")
            .context("AWS_BEARER_TOKEN_BEDROCK not set")?;

        let opts = &req.options;
        let mut body = json!({
            "messages": build_messages(&req.messages),
            "inferenceConfig": {
                "maxTokens": opts.max_tokens.unwrap_or(4096),
            },
        });
        if let Some(t) = opts.temperature {
            body["inferenceConfig"]["temperature"] = json!(t);
        }
        if let Some(p) = opts.top_p {
            body["inferenceConfig"]["topP"] = json!(p);
        }
        if let Some(system) = &req.system {
            if !system.is_empty() {
                body["system"] = json!([{ "text": system }]);
            }
        }
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "toolSpec": {
                            "name": t.name,
                            "description": t.description,
                            "inputSchema": { "json": t.parameters },
                        }
                    })
                })
                .collect();
            body["toolConfig"] = json!({ "tools": tools });
        }

        let url = format!(
            "https://bedrock-runtime.{}.amazonaws.com/model/{}/converse",
            self.region,
            urlencoded(&self.model)
        );
        debug!(model = %self.model, region = %self.region, "sending bedrock converse request");

        let resp = self
            .client
            .post(&url)
            .header("authorization", format!("Bearer {token}"))
            .json(&body)
            .send()
            .await
            .context("Bedrock request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("Bedrock error {status}: {text}");
        }

        let parsed: Value = resp.json().await.context("parsing Bedrock response")?;
        let events: Vec<anyhow::Result<ResponseEvent>> =
            parse_converse_response(&parsed).into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(events)))
    }
}

fn build_messages(messages: &[Message]) -> Vec<Value> {
    let mut out = Vec::new();
    for m in messages {
        match m.role {
            Role::System => continue,
            Role::User | Role::Tool => {
                let blocks: Vec<Value> = m
                    .parts
                    .iter()
                    .filter_map(|p| match p {
                        ContentPart::Text { text } if !text.is_empty() => {
                            Some(json!({ "text": text }))
                        }
                        ContentPart::ToolResult { call_id, content, is_error, .. } => Some(json!({
                            "toolResult": {
                                "toolUseId": call_id,
                                "content": [{ "text": content }],
                                "status": if *is_error { "error" } else { "success" },
                            }
                        })),
                        _ => None,
                    })
                    .collect();
                if !blocks.is_empty() {
                    out.push(json!({ "role": "user", "content": blocks }));
                }
            }
            Role::Assistant => {
                let blocks: Vec<Value> = m
                    .parts
                    .iter()
                    .filter_map(|p| match p {
                        ContentPart::Text { text } if !text.is_empty() => {
                            Some(json!({ "text": text }))
                        }
                        ContentPart::ToolCall { id, name, arguments, .. } => {
                            let input: Value =
                                serde_json::from_str(arguments).unwrap_or_else(|_| json!({}));
                            Some(json!({
                                "toolUse": { "toolUseId": id, "name": name, "input": input }
                            }))
                        }
                        _ => None,
                    })
                    .collect();
                if !blocks.is_empty() {
                    out.push(json!({ "role": "assistant", "content": blocks }));
                }
            }
        }
    }
    out
}

/// Convert the synchronous Converse response into the streamed event shape.
fn parse_converse_response(v: &Value) -> Vec<ResponseEvent> {
    let mut events = Vec::new();
    if let Some(blocks) = v["output"]["message"]["content"].as_array() {
        for block in blocks {
            if let Some(text) = block["text"].as_str() {
                events.push(ResponseEvent::TextDelta(text.to_string()));
            }
            if let Some(reasoning) = block["reasoningContent"]["reasoningText"]["text"].as_str() {
                events.push(ResponseEvent::ReasoningDelta {
                    text: reasoning.to_string(),
                    signature: None,
                });
            }
            if let Some(tu) = block.get("toolUse") {
                events.push(ResponseEvent::ToolCallDelta {
                    index: events.len() as u32,
                    id: tu["toolUseId"]
                        .as_str()
                        .map(str::to_string)
                        .unwrap_or_else(|| ids::generate(ids::IdProfile::Standard)),
                    name: tu["name"].as_str().unwrap_or("").to_string(),
                    arguments: tu["input"].to_string(),
                });
            }
        }
    }
    if let Some(usage) = v.get("usage") {
        events.push(ResponseEvent::Usage(Usage {
            prompt_tokens: usage["inputTokens"].as_u64().unwrap_or(0),
            completion_tokens: usage["outputTokens"].as_u64().unwrap_or(0),
            cache_read_tokens: usage["cacheReadInputTokens"].as_u64().unwrap_or(0),
            cache_write_tokens: usage["cacheWriteInputTokens"].as_u64().unwrap_or(0),
        }));
    }
    events.push(ResponseEvent::Finish(
        match v["stopReason"].as_str().unwrap_or("") {
            "end_turn" | "stop_sequence" => FinishReason::Stop,
            "tool_use" => FinishReason::ToolCalls,
            "max_tokens" => FinishReason::Length,
            _ => FinishReason::Unknown,
        },
    ));
    events
}

fn urlencoded(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~') {
                c.to_string()
            } else {
                format!("%{:02X}", c as u32)
            }
        })
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
