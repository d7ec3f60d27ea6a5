// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Strategy-driven recovery for recoverable errors.
//!
//! Strategies are consulted in registration order.  A successful `recover`
//! yields a retry; an exhausted or unhandled error propagates to the caller.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::debug;

/// Classification of errors the registry may attempt to recover from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoverableKind {
    FileOutdated,
    EditFailed,
    LoopDetected,
    Timeout,
    ResourceLimit,
    Panic,
}

impl std::fmt::Display for RecoverableKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RecoverableKind::FileOutdated => "file_outdated",
            RecoverableKind::EditFailed => "edit_failed",
            RecoverableKind::LoopDetected => "loop_detected",
            RecoverableKind::Timeout => "timeout",
            RecoverableKind::ResourceLimit => "resource_limit",
            RecoverableKind::Panic => "panic",
        };
        write!(f, "{s}")
    }
}

/// An error tagged with its recoverable classification.
#[derive(Debug, Clone)]
pub struct TaggedError {
    pub kind: RecoverableKind,
    pub message: String,
}

impl TaggedError {
    pub fn new(kind: RecoverableKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Mutable execution context a strategy may adjust before the retry.
#[derive(Debug, Default, Clone)]
pub struct RecoveryContext {
    /// Annotation describing the last error, fed back to the model.
    pub last_error_note: Option<String>,
    /// Tool the strategy suggests trying next.
    pub suggested_tool: Option<String>,
    /// Number of recovery attempts consumed this turn (all strategies).
    pub attempts: u32,
}

#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    fn kind(&self) -> RecoverableKind;
    /// Per-strategy retry ceiling.
    fn max_retries(&self) -> u32 {
        3
    }
    fn can_recover(&self, err: &TaggedError) -> bool {
        err.kind == self.kind()
    }
    /// Mutate the context in preparation for a retry.
    async fn recover(&self, err: &TaggedError, ctx: &mut RecoveryContext) -> anyhow::Result<()>;
}

/// The outcome of asking the registry about an error.
#[derive(Debug, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// A strategy prepared the context; the caller should retry.
    Retry,
    /// No strategy covers this error.
    Unhandled,
    /// A ceiling (global or per-strategy) is exhausted.
    Exhausted,
}

pub struct RecoveryRegistry {
    strategies: Vec<Box<dyn RecoveryStrategy>>,
    /// Global ceiling across all strategies for one turn.
    global_max_retries: u32,
    per_strategy_used: HashMap<RecoverableKind, u32>,
}

impl RecoveryRegistry {
    pub fn new(global_max_retries: u32) -> Self {
        Self {
            strategies: Vec::new(),
            global_max_retries,
            per_strategy_used: HashMap::new(),
        }
    }

    pub fn register(&mut self, strategy: impl RecoveryStrategy + 'static) {
        self.strategies.push(Box::new(strategy));
    }

    /// Reset retry accounting at the start of a turn.
    pub fn reset(&mut self) {
        self.per_strategy_used.clear();
    }

    /// Attempt recovery for `err`, enforcing both ceilings.
    pub async fn try_recover(
        &mut self,
        err: &TaggedError,
        ctx: &mut RecoveryContext,
    ) -> RecoveryOutcome {
        if ctx.attempts >= self.global_max_retries {
            return RecoveryOutcome::Exhausted;
        }
        let Some(strategy) = self.strategies.iter().find(|s| s.can_recover(err)) else {
            return RecoveryOutcome::Unhandled;
        };
        let used = self.per_strategy_used.entry(strategy.kind()).or_insert(0);
        if *used >= strategy.max_retries() {
            return RecoveryOutcome::Exhausted;
        }
        match strategy.recover(err, ctx).await {
            Ok(()) => {
                *used += 1;
                ctx.attempts += 1;
                debug!(kind = %err.kind, attempts = ctx.attempts, "recovered; retrying");
                RecoveryOutcome::Retry
            }
            Err(e) => {
                debug!(kind = %err.kind, error = %e, "recovery strategy failed");
                RecoveryOutcome::Unhandled
            }
        }
    }
}

/// Default strategy set: annotate the error and, where a better next step is
/// known, suggest the tool to pivot to.
pub fn default_registry(global_max_retries: u32) -> RecoveryRegistry {
    let mut registry = RecoveryRegistry::new(global_max_retries);
    registry.register(AnnotateStrategy {
        kind: RecoverableKind::FileOutdated,
        suggest: Some("view"),
    });
    registry.register(AnnotateStrategy {
        kind: RecoverableKind::EditFailed,
        suggest: Some("view"),
    });
    registry.register(AnnotateStrategy {
        kind: RecoverableKind::LoopDetected,
        suggest: None,
    });
    registry.register(AnnotateStrategy {
        kind: RecoverableKind::Timeout,
        suggest: None,
    });
    registry.register(AnnotateStrategy {
        kind: RecoverableKind::ResourceLimit,
        suggest: None,
    });
    registry.register(AnnotateStrategy {
        kind: RecoverableKind::Panic,
        suggest: None,
    });
    registry
}

struct AnnotateStrategy {
    kind: RecoverableKind,
    suggest: Option<&'static str>,
}

#[async_trait]
impl RecoveryStrategy for AnnotateStrategy {
    fn kind(&self) -> RecoverableKind {
        self.kind
    }

    async fn recover(&self, err: &TaggedError, ctx: &mut RecoveryContext) -> anyhow::Result<()> {
        ctx.last_error_note = Some(format!("{}: {}", self.kind, err.message));
        if let Some(tool) = self.suggest {
            ctx.suggested_tool = Some(tool.to_string());
        }
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
