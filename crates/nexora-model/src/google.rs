// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Google Gemini driver (Generative Language API and Vertex AI).

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    ids, provider::ResponseStream, ContentPart, FinishReason, Message, CompletionRequest,
    ResponseEvent, Role, Usage,
};

pub struct GeminiProvider {
    provider_id: String,
    model: String,
    api_key: Option<String>,
    base_url: String,
    client: reqwest::Client,
}

impl GeminiProvider {
    pub fn new(model: String, api_key: Option<String>, base_url: Option<String>) -> Self {
        Self {
            provider_id: "gemini".into(),
            model,
            api_key,
            base_url: base_url
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com".into()),
            client: reqwest::Client::new(),
        }
    }

    /// Vertex AI hosts the same generateContent surface under a
    /// project/location-scoped URL.
    pub fn vertex(
        model: String,
        api_key: Option<String>,
        project: &str,
        location: &str,
    ) -> Self {
        Self {
            provider_id: "vertex".into(),
            model,
            api_key,
            base_url: format!(
                "https://{location}-aiplatform.googleapis.com/v1/projects/{project}/locations/{location}/publishers/google"
            ),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl crate::ModelProvider for GeminiProvider {
    fn name(&self) -> &str {
        &self.provider_id
    }
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let key = self
            .api_key
            .as_deref()
            .with_context(|| format!("{} API key not set", self.provider_id))?;

        let opts = &req.options;
        let mut generation_config = json!({});
        if let Some(t) = opts.temperature {
            generation_config["temperature"] = json!(t);
        }
        if let Some(p) = opts.top_p {
            generation_config["topP"] = json!(p);
        }
        if let Some(k) = opts.top_k {
            generation_config["topK"] = json!(k);
        }
        if let Some(mt) = opts.max_tokens {
            generation_config["maxOutputTokens"] = json!(mt);
        }
        if let Some(tc) = opts.extra.get("thinking_config") {
            generation_config["thinkingConfig"] = json!({
                "thinkingBudget": tc["thinking_budget"].clone(),
                "includeThoughts": tc["include_thoughts"].clone(),
            });
        }

        let mut body = json!({
            "contents": build_contents(&req.messages),
            "generationConfig": generation_config,
        });
        if let Some(system) = &req.system {
            if !system.is_empty() {
                body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
            }
        }
        if !req.tools.is_empty() {
            let decls: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    })
                })
                .collect();
            body["tools"] = json!([{ "functionDeclarations": decls }]);
        }

        debug!(provider = %self.provider_id, model = %self.model, "sending gemini request");

        let url = if self.provider_id == "vertex" {
            format!(
                "{}/models/{}:streamGenerateContent?alt=sse",
                self.base_url, self.model
            )
        } else {
            format!(
                "{}/v1beta/models/{}:streamGenerateContent?alt=sse&key={key}",
                self.base_url, self.model
            )
        };

        let mut request = self.client.post(&url);
        if self.provider_id == "vertex" {
            request = request.header("authorization", format!("Bearer {key}"));
        }

        let resp = request
            .json(&body)
            .send()
            .await
            .with_context(|| format!("{} request failed", self.provider_id))?;

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
                        if let Ok(v) = serde_json::from_str::<Value>(data.trim()) {
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

/// Map messages onto Gemini contents.  Gemini has no tool role: function
/// responses are user-role `functionResponse` parts keyed by function name.
fn build_contents(messages: &[Message]) -> Vec<Value> {
    // Tool results reference call IDs, but this wire keys responses by
    // function name; remember the mapping from the preceding calls.
    let mut call_names: std::collections::HashMap<String, String> = std::collections::HashMap::new();
    let mut out = Vec::new();
    for m in messages {
        match m.role {
            Role::System => continue,
            Role::User => {
                let parts: Vec<Value> = m
                    .parts
                    .iter()
                    .filter_map(|p| match p {
                        ContentPart::Text { text } => Some(json!({ "text": text })),
                        ContentPart::ImageUrl { url, .. } => {
                            let rest = url.strip_prefix("data:")?;
                            let (meta, b64) = rest.split_once(',')?;
                            let mime = meta.strip_suffix(";base64").unwrap_or(meta);
                            Some(json!({ "inlineData": { "mimeType": mime, "data": b64 } }))
                        }
                        ContentPart::Binary { data, mime_type } => {
                            Some(json!({ "inlineData": { "mimeType": mime_type, "data": data } }))
                        }
                        _ => None,
                    })
                    .collect();
                if !parts.is_empty() {
                    out.push(json!({ "role": "user", "parts": parts }));
                }
            }
            Role::Assistant => {
                let parts: Vec<Value> = m
                    .parts
                    .iter()
                    .filter_map(|p| match p {
                        ContentPart::Text { text } if !text.is_empty() => {
                            Some(json!({ "text": text }))
                        }
                        ContentPart::ToolCall { id, name, arguments, .. } => {
                            call_names.insert(id.clone(), name.clone());
                            let args: Value =
                                serde_json::from_str(arguments).unwrap_or_else(|_| json!({}));
                            Some(json!({ "functionCall": { "name": name, "args": args } }))
                        }
                        _ => None,
                    })
                    .collect();
                if !parts.is_empty() {
                    out.push(json!({ "role": "model", "parts": parts }));
                }
            }
            Role::Tool => {
                let parts: Vec<Value> = m
                    .parts
                    .iter()
                    .filter_map(|p| match p {
                        ContentPart::ToolResult { call_id, content, .. } => {
                            let name = call_names.get(call_id).cloned().unwrap_or_default();
                            Some(json!({
                                "functionResponse": {
                                    "name": name,
                                    "response": { "output": content },
                                }
                            }))
                        }
                        _ => None,
                    })
                    .collect();
                if !parts.is_empty() {
                    out.push(json!({ "role": "user", "parts": parts }));
                }
            }
        }
    }
    out
}

fn parse_chunk(v: &Value) -> Vec<ResponseEvent> {
    let mut events = Vec::new();

    if let Some(usage) = v.get("usageMetadata") {
        events.push(ResponseEvent::Usage(Usage {
            prompt_tokens: usage["promptTokenCount"].as_u64().unwrap_or(0),
            completion_tokens: usage["candidatesTokenCount"].as_u64().unwrap_or(0),
            cache_read_tokens: usage["cachedContentTokenCount"].as_u64().unwrap_or(0),
            cache_write_tokens: 0,
        }));
    }

    let Some(candidate) = v["candidates"].get(0) else {
        return events;
    };
    if let Some(parts) = candidate["content"]["parts"].as_array() {
        for (i, part) in parts.iter().enumerate() {
            if let Some(text) = part["text"].as_str() {
                if part["thought"].as_bool().unwrap_or(false) {
                    events.push(ResponseEvent::ReasoningDelta {
                        text: text.to_string(),
                        signature: None,
                    });
                } else {
                    events.push(ResponseEvent::TextDelta(text.to_string()));
                }
            }
            if let Some(fc) = part.get("functionCall") {
                // Gemini emits whole calls, never argument deltas, and mints
                // no call IDs of its own.
                events.push(ResponseEvent::ToolCallDelta {
                    index: i as u32,
                    id: ids::generate(ids::IdProfile::Standard),
                    name: fc["name"].as_str().unwrap_or("").to_string(),
                    arguments: fc["args"].to_string(),
                });
            }
        }
    }
    if let Some(reason) = candidate["finishReason"].as_str() {
        events.push(ResponseEvent::Finish(match reason {
            "STOP" => FinishReason::Stop,
            "MAX_TOKENS" => FinishReason::Length,
            _ => FinishReason::Unknown,
        }));
    }

    events
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_results_keyed_by_function_name() {
        let mut call = Message::assistant_streaming("s1");
        call.add_tool_call("call_1", "list_files", "{}");
        let result = Message::tool_result("s1", "call_1", "a.rs");
        let contents = build_contents(&[call, result]);
        assert_eq!(contents[0]["parts"][0]["functionCall"]["name"], "list_files");
        assert_eq!(
            contents[1]["parts"][0]["functionResponse"]["name"],
            "list_files"
        );
    }

    #[test]
    fn assistant_role_maps_to_model() {
        let contents = build_contents(&[Message::assistant("s1", "hello")]);
        assert_eq!(contents[0]["role"], "model");
    }

    #[test]
    fn parse_thought_part_as_reasoning() {
        let v = json!({"candidates":[{"content":{"parts":[
            {"text":"thinking...","thought":true},
            {"text":"answer"}
        ]}}]});
        let ev = parse_chunk(&v);
        assert!(matches!(&ev[0], ResponseEvent::ReasoningDelta { text, .. } if text == "thinking..."));
        assert!(matches!(&ev[1], ResponseEvent::TextDelta(t) if t == "answer"));
    }

    #[test]
    fn parse_function_call_mints_id() {
        let v = json!({"candidates":[{"content":{"parts":[
            {"functionCall":{"name":"grep","args":{"pattern":"x"}}}
        ]}}]});
        let ev = parse_chunk(&v);
        match &ev[0] {
            ResponseEvent::ToolCallDelta { id, name, arguments, .. } => {
                assert!(id.starts_with("call_"));
                assert_eq!(name, "grep");
                assert!(arguments.contains("pattern"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn parse_finish_stop() {
        let v = json!({"candidates":[{"finishReason":"STOP"}]});
        let ev = parse_chunk(&v);
        assert!(matches!(ev[0], ResponseEvent::Finish(FinishReason::Stop)));
    }

    #[test]
    fn vertex_url_contains_project_and_location() {
        let p = GeminiProvider::vertex("gemini-2.5-pro".into(), Some("tok".into()), "proj", "us-central1");
        assert!(p.base_url.contains("/projects/proj/"));
        assert!(p.base_url.contains("us-central1"));
        assert_eq!(crate::ModelProvider::name(&p), "vertex");
    }
}
