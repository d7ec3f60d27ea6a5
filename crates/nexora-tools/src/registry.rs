// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::bail;
use tracing::warn;

use crate::{Tool, ToolCall, ToolContext, ToolOutput};

/// A tool schema as presented to the model.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Central registry holding all available tools.
///
/// Registration rejects duplicate names; the schema listing is sorted by
/// name so the model sees a deterministic tool ordering.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool.  Duplicate names are rejected.
    pub fn register(&mut self, tool: impl Tool + 'static) -> anyhow::Result<()> {
        self.register_arc(Arc::new(tool))
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) -> anyhow::Result<()> {
        let name = tool.name().to_string();
        if name.is_empty() {
            bail!("tool with empty name rejected");
        }
        if self.tools.contains_key(&name) {
            bail!("duplicate tool name: {name}");
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    /// Run a tool constructor inside a panic boundary.
    ///
    /// A factory that panics or returns `None` is logged and dropped; the
    /// remaining catalogue stays usable.
    pub fn register_factory<F>(&mut self, label: &str, factory: F)
    where
        F: FnOnce() -> Option<Arc<dyn Tool>>,
    {
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(factory)) {
            Ok(Some(tool)) => {
                if let Err(e) = self.register_arc(tool) {
                    warn!(tool = label, error = %e, "dropping tool from factory");
                }
            }
            Ok(None) => {
                warn!(tool = label, "tool factory returned nothing; dropping");
            }
            Err(_) => {
                warn!(tool = label, "tool factory panicked; dropping");
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn is_parallel_safe(&self, name: &str) -> bool {
        self.tools.get(name).map(|t| t.parallel_safe()).unwrap_or(false)
    }

    /// Produce schemas for all registered tools, sorted by name.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub async fn execute(&self, ctx: &ToolContext, call: &ToolCall) -> ToolOutput {
        match self.tools.get(&call.name) {
            Some(tool) => tool.execute(ctx, call).await,
            None => ToolOutput::err(&call.id, format!("unknown tool: {}", call.name)),
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Retain only tools whose name passes `keep`.  Used to apply agent
    /// allow-lists after assembly.
    pub fn retain(&mut self, keep: impl Fn(&str) -> bool) {
        self.tools.retain(|name, _| keep(name));
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
