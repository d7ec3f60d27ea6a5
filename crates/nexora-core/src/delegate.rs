// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The `delegate` tool: hands a scoped sub-task to the delegation pool.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use nexora_tools::{Tool, ToolCall, ToolContext, ToolOutput};

use crate::pool::DelegationPool;

pub struct DelegateTool {
    pool: Arc<DelegationPool>,
}

impl DelegateTool {
    pub fn new(pool: Arc<DelegationPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Tool for DelegateTool {
    fn name(&self) -> &str {
        "delegate"
    }

    fn description(&self) -> &str {
        "Spawn a sub-agent to handle a scoped sub-task. With background=true \
         the call returns immediately with a task ID; otherwise it blocks \
         until the sub-agent finishes and returns its result. The sub-agent \
         has a reduced tool set (glob, grep, view, bash)."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "What the sub-agent should accomplish"
                },
                "context": {
                    "type": "string",
                    "description": "Extra context the sub-agent needs (optional)"
                },
                "working_dir": {
                    "type": "string",
                    "description": "Working directory for the sub-agent (optional)"
                },
                "max_tokens": {
                    "type": "integer",
                    "description": "Output token hint for the sub-agent (optional)"
                },
                "background": {
                    "type": "boolean",
                    "description": "Queue and return immediately instead of waiting"
                }
            },
            "required": ["task"]
        })
    }

    fn parallel_safe(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: &ToolContext, call: &ToolCall) -> ToolOutput {
        let Some(task) = call.args.get("task").and_then(|v| v.as_str()) else {
            return ToolOutput::err(&call.id, "missing 'task'");
        };
        let context = call
            .args
            .get("context")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let working_dir = call
            .args
            .get("working_dir")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let max_tokens = call
            .args
            .get("max_tokens")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32);
        let background = call
            .args
            .get("background")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let id = self
            .pool
            .submit(task, context, working_dir, max_tokens, &ctx.session_id);
        debug!(task_id = %id, background, "delegate tool submitted task");

        if background {
            return ToolOutput::ok(&call.id, format!("Task queued with ID: {id}"));
        }
        match self.pool.wait(id).await {
            Ok(result) => ToolOutput::ok(&call.id, result),
            Err(e) => ToolOutput::err(&call.id, e.to_string()),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
