// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The session agent: executes one turn end-to-end (user prompt → optional
//! tool rounds → final assistant message), persists messages, tracks busy
//! state, manages the per-session prompt queue, and triggers
//! auto-summarisation.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use nexora_config::AgentConfig;
use nexora_model::{
    ids::{self, IdProfile},
    registry, sanitize, ContentPart, FinishReason, Message, ModelHandle, CompletionRequest,
    ResponseEvent, Role, Usage,
};
use nexora_tools::{ToolCall, ToolContext, ToolRegistry};

use crate::{
    background::BackgroundCompactor,
    compact::{self, compact, CompactorConfig, BRIDGE_TEXT},
    events::AgentEvent,
    prompts::{self, PromptContext},
    recovery::{
        default_registry, RecoverableKind, RecoveryContext, RecoveryOutcome, RecoveryRegistry,
        TaggedError,
    },
    salvage,
    session::{MessageStore, SessionStore},
    state::{AgentState, StateMachine},
};

const MAX_EMPTY_TURN_RETRIES: u32 = 2;

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("session busy: {0}")]
    SessionBusy(String),
    #[error("empty prompt")]
    EmptyPrompt,
    #[error("provider unauthorized: {0}")]
    ProviderUnauthorized(String),
    #[error("context exceeded: {used} tokens do not fit a {window}-token window")]
    ContextExceeded { used: usize, window: usize },
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

// ─── Permissions ──────────────────────────────────────────────────────────────

/// External permission prompt service.  In yolo mode the agent never asks.
#[async_trait::async_trait]
pub trait PermissionService: Send + Sync {
    async fn request(&self, session_id: &str, tool: &str, args: &Value) -> bool;
}

/// Approves everything; the yolo-mode service.
pub struct AutoApprove;

#[async_trait::async_trait]
impl PermissionService for AutoApprove {
    async fn request(&self, _session_id: &str, _tool: &str, _args: &Value) -> bool {
        true
    }
}

// ─── Run surface ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// When false a busy session yields `SessionBusy` instead of queueing.
    pub queue_if_busy: bool,
}

impl RunOptions {
    pub fn queued() -> Self {
        Self {
            queue_if_busy: true,
            ..Default::default()
        }
    }
}

#[derive(Debug)]
pub enum RunOutcome {
    Completed(TurnResult),
    /// The prompt was queued behind an active turn.
    Queued { position: usize },
}

#[derive(Debug, Clone)]
pub struct TurnResult {
    pub message: Message,
    pub usage: Usage,
    pub cost: f64,
}

struct QueuedPrompt {
    prompt: String,
    attachments: Vec<ContentPart>,
    options: RunOptions,
    events: mpsc::Sender<AgentEvent>,
}

struct SessionRuntime {
    busy: bool,
    queue: std::collections::VecDeque<QueuedPrompt>,
    cancel: CancellationToken,
    machine: Arc<StateMachine>,
}

impl SessionRuntime {
    fn new() -> Self {
        Self {
            busy: false,
            queue: std::collections::VecDeque::new(),
            cancel: CancellationToken::new(),
            machine: Arc::new(StateMachine::new()),
        }
    }
}

// ─── The agent ────────────────────────────────────────────────────────────────

pub struct SessionAgent {
    model: RwLock<ModelHandle>,
    /// Summariser model; the coordinator keeps it pointed at the fastest
    /// available provider, falling back to the large model.
    summarizer: RwLock<ModelHandle>,
    tools: RwLock<Arc<ToolRegistry>>,
    sessions: Arc<dyn SessionStore>,
    messages: Arc<dyn MessageStore>,
    permissions: Arc<dyn PermissionService>,
    config: AgentConfig,
    background: Arc<BackgroundCompactor>,
    recovery: tokio::sync::Mutex<RecoveryRegistry>,
    runtimes: Mutex<HashMap<String, SessionRuntime>>,
}

impl SessionAgent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        model: ModelHandle,
        summarizer: ModelHandle,
        tools: Arc<ToolRegistry>,
        sessions: Arc<dyn SessionStore>,
        messages: Arc<dyn MessageStore>,
        permissions: Arc<dyn PermissionService>,
        config: AgentConfig,
        background: Arc<BackgroundCompactor>,
    ) -> Arc<Self> {
        Self::with_recovery(
            model, summarizer, tools, sessions, messages, permissions, config, background,
            default_registry(3),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_recovery(
        model: ModelHandle,
        summarizer: ModelHandle,
        tools: Arc<ToolRegistry>,
        sessions: Arc<dyn SessionStore>,
        messages: Arc<dyn MessageStore>,
        permissions: Arc<dyn PermissionService>,
        config: AgentConfig,
        background: Arc<BackgroundCompactor>,
        recovery: RecoveryRegistry,
    ) -> Arc<Self> {
        Arc::new(Self {
            model: RwLock::new(model),
            summarizer: RwLock::new(summarizer),
            tools: RwLock::new(tools),
            sessions,
            messages,
            permissions,
            config,
            background,
            recovery: tokio::sync::Mutex::new(recovery),
            runtimes: Mutex::new(HashMap::new()),
        })
    }

    /// Swap models without touching any session state.
    pub async fn set_models(&self, model: ModelHandle, summarizer: ModelHandle) {
        *self.model.write().await = model;
        *self.summarizer.write().await = summarizer;
    }

    pub async fn set_tools(&self, tools: Arc<ToolRegistry>) {
        *self.tools.write().await = tools;
    }

    pub fn is_busy(&self) -> bool {
        self.runtimes.lock().values().any(|r| r.busy)
    }

    pub fn is_session_busy(&self, session_id: &str) -> bool {
        self.runtimes
            .lock()
            .get(session_id)
            .map(|r| r.busy)
            .unwrap_or(false)
    }

    pub fn queued_prompts(&self, session_id: &str) -> Vec<String> {
        self.runtimes
            .lock()
            .get(session_id)
            .map(|r| r.queue.iter().map(|q| q.prompt.clone()).collect())
            .unwrap_or_default()
    }

    pub fn clear_queue(&self, session_id: &str) {
        if let Some(rt) = self.runtimes.lock().get_mut(session_id) {
            rt.queue.clear();
        }
    }

    pub fn machine(&self, session_id: &str) -> Arc<StateMachine> {
        Arc::clone(
            &self
                .runtimes
                .lock()
                .entry(session_id.to_string())
                .or_insert_with(SessionRuntime::new)
                .machine,
        )
    }

    /// Abort the in-flight turn (model stream and running tools) and clear
    /// the prompt queue.  Returns immediately; the turn loop observes the
    /// token, writes a `canceled` finish part, and clears the busy flag.
    pub fn cancel(&self, session_id: &str) {
        let mut runtimes = self.runtimes.lock();
        if let Some(rt) = runtimes.get_mut(session_id) {
            rt.queue.clear();
            rt.cancel.cancel();
        }
    }

    pub fn cancel_all(&self) {
        let mut runtimes = self.runtimes.lock();
        for rt in runtimes.values_mut() {
            rt.queue.clear();
            rt.cancel.cancel();
        }
    }

    // ── Run ───────────────────────────────────────────────────────────────────

    /// Execute one turn for `session_id`, or queue the prompt when a turn is
    /// already in flight.
    pub async fn run(
        self: &Arc<Self>,
        session_id: &str,
        prompt: &str,
        attachments: Vec<ContentPart>,
        options: RunOptions,
        events: mpsc::Sender<AgentEvent>,
    ) -> Result<RunOutcome, AgentError> {
        if prompt.trim().is_empty() {
            return Err(AgentError::EmptyPrompt);
        }
        self.sessions
            .get(session_id)
            .await?
            .ok_or_else(|| AgentError::SessionNotFound(session_id.to_string()))?;

        // Busy check + enqueue under one lock so two concurrent runs cannot
        // both claim the session.
        {
            let mut runtimes = self.runtimes.lock();
            let rt = runtimes
                .entry(session_id.to_string())
                .or_insert_with(SessionRuntime::new);
            if rt.busy {
                if !options.queue_if_busy {
                    return Err(AgentError::SessionBusy(session_id.to_string()));
                }
                rt.queue.push_back(QueuedPrompt {
                    prompt: prompt.to_string(),
                    attachments,
                    options,
                    events: events.clone(),
                });
                let position = rt.queue.len();
                let _ = events.try_send(AgentEvent::PromptQueued { position });
                return Ok(RunOutcome::Queued { position });
            }
            rt.busy = true;
            rt.cancel = CancellationToken::new();
        }

        let result = self
            .execute_turn(session_id, prompt, attachments, &options, &events)
            .await;

        // Clear busy, then hand the session to the queue drainer.
        let pending = {
            let mut runtimes = self.runtimes.lock();
            let rt = runtimes
                .get_mut(session_id)
                .expect("runtime created above");
            rt.busy = false;
            rt.machine.reset_to_idle();
            !rt.queue.is_empty()
        };
        if pending {
            let agent = Arc::clone(self);
            let session_id = session_id.to_string();
            tokio::spawn(async move { agent.drain_queue(session_id).await });
        }

        result.map(RunOutcome::Completed)
    }

    /// Process queued prompts strictly FIFO until the queue is empty or the
    /// session is claimed by a direct `run`.
    async fn drain_queue(self: Arc<Self>, session_id: String) {
        loop {
            let next = {
                let mut runtimes = self.runtimes.lock();
                let Some(rt) = runtimes.get_mut(&session_id) else {
                    return;
                };
                if rt.busy {
                    return;
                }
                match rt.queue.pop_front() {
                    Some(next) => {
                        rt.busy = true;
                        rt.cancel = CancellationToken::new();
                        next
                    }
                    None => return,
                }
            };
            let result = self
                .execute_turn(
                    &session_id,
                    &next.prompt,
                    next.attachments,
                    &next.options,
                    &next.events,
                )
                .await;
            if let Err(e) = result {
                warn!(session_id, error = %e, "queued prompt failed");
            }
            let mut runtimes = self.runtimes.lock();
            if let Some(rt) = runtimes.get_mut(&session_id) {
                rt.busy = false;
                rt.machine.reset_to_idle();
            }
        }
    }

    async fn execute_turn(
        self: &Arc<Self>,
        session_id: &str,
        prompt: &str,
        attachments: Vec<ContentPart>,
        options: &RunOptions,
        events: &mpsc::Sender<AgentEvent>,
    ) -> Result<TurnResult, AgentError> {
        let model = self.model.read().await.clone();
        let machine = self.machine(session_id);
        let cancel = self
            .runtimes
            .lock()
            .get(session_id)
            .map(|r| r.cancel.clone())
            .expect("runtime exists");

        // New input invalidates any idle-time shrink for this session.
        self.background.invalidate(session_id);

        // Attachments are dropped silently when the model cannot see them.
        let mut parts = vec![ContentPart::text(prompt)];
        if model.supports_images() {
            parts.extend(attachments);
        } else if !attachments.is_empty() {
            debug!(session_id, "dropping attachments: model does not support images");
        }
        let user_msg = Message::user_with_parts(session_id, parts);
        self.persist(&user_msg, events).await;

        self.transition(&machine, AgentState::ProcessingPrompt, events);

        let result = self
            .run_turn_loop(session_id, &model, &machine, &cancel, options, events)
            .await;

        match &result {
            Ok(turn) => {
                self.finish_turn(session_id, &model, turn).await;
                let _ = events.send(AgentEvent::TurnComplete).await;

                // Auto-summarisation: schedule when the estimate crosses the
                // threshold fraction of the window.
                if self.config.auto_summarize {
                    let history = self.load_history(session_id).await.unwrap_or_default();
                    let used = compact::estimate(&history);
                    let window = model.context_window() as usize;
                    if window > 0
                        && (used as f64 / window as f64) >= self.config.summarize_threshold as f64
                    {
                        let agent = Arc::clone(self);
                        let session_id = session_id.to_string();
                        let events = events.clone();
                        tokio::spawn(async move {
                            if let Err(e) = agent.summarize(&session_id, events).await {
                                warn!(error = %e, "scheduled summarisation failed");
                            }
                        });
                    }
                }
            }
            Err(AgentError::Cancelled) => {
                let _ = events
                    .send(AgentEvent::Canceled {
                        partial_text: String::new(),
                    })
                    .await;
            }
            Err(e) => {
                let _ = events.send(AgentEvent::Error(e.to_string())).await;
            }
        }
        result
    }

    /// The model ↔ tool loop for one turn.
    async fn run_turn_loop(
        self: &Arc<Self>,
        session_id: &str,
        model: &ModelHandle,
        machine: &Arc<StateMachine>,
        cancel: &CancellationToken,
        options: &RunOptions,
        events: &mpsc::Sender<AgentEvent>,
    ) -> Result<TurnResult, AgentError> {
        let system = prompts::system_prompt(
            self.config.system_prompt.as_deref(),
            &PromptContext::default(),
        );
        let window = model.context_window() as usize;
        let compactor_cfg = CompactorConfig {
            context_window: window,
            tool_result_budget: self.config.tool_result_token_cap,
            keep_recent: self.config.keep_recent,
        };

        let mut usage = Usage::default();
        let mut rounds = 0u32;
        let mut empty_turn_retries = 0u32;
        let mut final_message: Option<Message> = None;
        let mut recovery_ctx = RecoveryContext::default();
        self.recovery.lock().await.reset();

        loop {
            if cancel.is_cancelled() {
                self.write_cancel_marker(session_id).await;
                return Err(AgentError::Cancelled);
            }

            rounds += 1;
            if rounds > self.config.max_tool_rounds {
                // One final tool-free turn so the model can summarise what it
                // completed instead of stopping abruptly.
                let wrap = Message::user(
                    session_id,
                    format!(
                        "You have reached the maximum tool-call budget ({} rounds). \
                         Do not call any more tools. Summarise what has been completed, \
                         what remains, and how to continue.",
                        self.config.max_tool_rounds
                    ),
                );
                self.persist(&wrap, events).await;
                let history = self.prepare_context(session_id, &compactor_cfg, events).await?;
                let (message, turn_usage) = self
                    .stream_one_turn(session_id, model, &system, history, false, options, cancel, events)
                    .await?;
                usage.add(&turn_usage);
                self.persist(&message, events).await;
                final_message = Some(message);
                break;
            }

            let history = self.prepare_context(session_id, &compactor_cfg, events).await?;
            self.transition(machine, AgentState::StreamingResponse, events);

            let (mut message, turn_usage) = self
                .stream_one_turn(session_id, model, &system, history, true, options, cancel, events)
                .await?;
            usage.add(&turn_usage);

            // Text-format salvage: rewrite recognisable tool-call markup in
            // the text into structured parts before persistence.
            self.salvage_text_tool_calls(&mut message, model);

            let text = message.text();
            if !text.is_empty() && machine.record_message(&text) {
                debug!(session_id, "suppressing duplicate model reply");
            }

            let tool_calls = extract_tool_calls(&message);

            if tool_calls.is_empty() {
                let reason = message.finish_reason().unwrap_or(FinishReason::Stop);
                // A reasoning-only (or fully empty) turn carries nothing the
                // user can act on; nudge the model to continue, at most twice.
                if text.is_empty()
                    && reason == FinishReason::Stop
                    && empty_turn_retries < MAX_EMPTY_TURN_RETRIES
                {
                    empty_turn_retries += 1;
                    let nudge = Message::user(
                        session_id,
                        "You produced a thinking block but no response or tool call. \
                         Please continue with your next action.",
                    );
                    self.persist(&nudge, events).await;
                    self.transition(machine, AgentState::ProgressCheck, events);
                    continue;
                }
                self.persist(&message, events).await;
                let _ = events.send(AgentEvent::TextComplete(text)).await;
                final_message = Some(message);
                break;
            }

            empty_turn_retries = 0;
            self.persist(&message, events).await;

            // Permission gathering happens before tool execution so denied
            // calls still produce paired error results.
            let approvals = if self.config.yolo_mode {
                vec![true; tool_calls.len()]
            } else {
                self.transition(machine, AgentState::AwaitingPermission, events);
                let mut approvals = Vec::with_capacity(tool_calls.len());
                for call in &tool_calls {
                    approvals.push(
                        self.permissions
                            .request(session_id, &call.name, &call.args)
                            .await,
                    );
                }
                approvals
            };

            self.transition(machine, AgentState::ExecutingTool, events);
            let mut outputs = self
                .execute_tool_batch(session_id, &tool_calls, &approvals, cancel, events)
                .await;

            // Recoverable tool errors are annotated before they are fed back
            // so the model can retry or pivot instead of repeating the
            // failure verbatim.
            for output in &mut outputs {
                if !output.is_error {
                    continue;
                }
                let tool = tool_calls
                    .iter()
                    .find(|c| c.id == output.call_id)
                    .map(|c| c.name.as_str())
                    .unwrap_or("");
                let Some(kind) = classify_tool_error(tool, &output.content) else {
                    continue;
                };
                let err = TaggedError::new(kind, output.content.clone());
                let outcome = self
                    .recovery
                    .lock()
                    .await
                    .try_recover(&err, &mut recovery_ctx)
                    .await;
                if outcome == RecoveryOutcome::Retry {
                    if let Some(tool) = &recovery_ctx.suggested_tool {
                        output
                            .content
                            .push_str(&format!("\n[recovery hint: run `{tool}` first, then retry]"));
                    } else {
                        output
                            .content
                            .push_str("\n[recovery hint: adjust your approach before retrying]");
                    }
                }
            }

            for output in &outputs {
                let mut msg = Message::tool_result(session_id, &output.call_id, &output.content);
                if let Some(ContentPart::ToolResult { data, mime_type, metadata, is_error, .. }) =
                    msg.parts.first_mut()
                {
                    *data = output.data.clone();
                    *mime_type = output.mime_type.clone();
                    *metadata = output.metadata.clone();
                    *is_error = output.is_error;
                }
                self.persist(&msg, events).await;
            }

            self.transition(machine, AgentState::ProgressCheck, events);
            if let Some(reason) = machine.stuck_reason() {
                let _ = events
                    .send(AgentEvent::StuckDetected { reason: reason.clone() })
                    .await;
                // Stuck detection never halts on its own; the loop strategy
                // just annotates the context for the next round.
                let err = TaggedError::new(RecoverableKind::LoopDetected, reason);
                let _ = self
                    .recovery
                    .lock()
                    .await
                    .try_recover(&err, &mut recovery_ctx)
                    .await;
            }

            if cancel.is_cancelled() {
                self.write_cancel_marker(session_id).await;
                return Err(AgentError::Cancelled);
            }
        }

        let message = final_message.expect("loop sets final message before breaking");
        Ok(TurnResult {
            cost: model.cost(&usage),
            message,
            usage,
        })
    }

    /// Load history, apply inline compaction, repair pairing, and fail when
    /// even compaction cannot fit the window.
    async fn prepare_context(
        &self,
        session_id: &str,
        cfg: &CompactorConfig,
        events: &mpsc::Sender<AgentEvent>,
    ) -> Result<Vec<Message>, AgentError> {
        let mut history = self.load_history(session_id).await?;
        repair_unmatched_tool_calls(&mut history, session_id);

        let used = compact::estimate(&history);
        let (compacted, applied, level) = compact(history, used, cfg);
        if applied {
            let after = compact::estimate(&compacted);
            let _ = events
                .send(AgentEvent::ContextCompacted {
                    level,
                    tokens_before: used,
                    tokens_after: after,
                })
                .await;
            if cfg.context_window > 0 && after > cfg.context_window {
                return Err(AgentError::ContextExceeded {
                    used: after,
                    window: cfg.context_window,
                });
            }
        }
        Ok(compacted)
    }

    /// Active context for a session: after a summarisation turn this is the
    /// summary, a bridge marker, and the most recent turns; everything else
    /// stays in storage only.
    async fn load_history(&self, session_id: &str) -> Result<Vec<Message>, AgentError> {
        let all = self.messages.list_by_session(session_id).await?;
        let Some(summary_idx) = all.iter().rposition(|m| m.is_summary) else {
            return Ok(all);
        };
        let pre = &all[..summary_idx];
        let keep = self.config.summary_keep_turns * 2;
        let tail_start =
            compact::widen_to_pairing_boundary(pre, pre.len().saturating_sub(keep));

        let mut active = Vec::with_capacity(keep + 2 + (all.len() - summary_idx));
        active.push(all[summary_idx].clone());
        active.push(Message::assistant(session_id, BRIDGE_TEXT));
        active.extend(pre[tail_start..].iter().cloned());
        // Turns that happened after the summary was written.
        active.extend(all[summary_idx + 1..].iter().cloned());
        Ok(active)
    }

    /// One model call.  Streams deltas into an in-place assistant message,
    /// publishing events as they arrive.
    #[allow(clippy::too_many_arguments)]
    async fn stream_one_turn(
        &self,
        session_id: &str,
        model: &ModelHandle,
        system: &str,
        history: Vec<Message>,
        with_tools: bool,
        options: &RunOptions,
        cancel: &CancellationToken,
        events: &mpsc::Sender<AgentEvent>,
    ) -> Result<(Message, Usage), AgentError> {
        let tools = if with_tools {
            self.tools
                .read()
                .await
                .schemas()
                .into_iter()
                .map(|s| nexora_model::ToolSchema {
                    name: s.name,
                    description: s.description,
                    parameters: s.parameters,
                })
                .collect()
        } else {
            Vec::new()
        };

        let messages =
            sanitize::strip_images_if_unsupported(history, model.supports_images());
        let req = CompletionRequest {
            system: Some(system.to_string()),
            messages,
            tools,
            options: model
                .options
                .clone()
                .with_overrides(options.max_tokens, options.temperature),
        };

        // The request itself is a suspension point; honour cancellation while
        // waiting for the first byte, not just between stream events.
        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.write_cancel_marker(session_id).await;
                return Err(AgentError::Cancelled);
            }
            result = model.provider.complete(req) => result.map_err(map_provider_error)?,
        };

        let mut message = Message::assistant_streaming(session_id);
        message.model = Some(model.entry.id.clone());
        message.provider = Some(model.config.provider.clone());
        let mut usage = Usage::default();
        // Keyed by the parallel-tool-call index from the provider; id/name
        // arrive once, arguments accumulate across deltas.
        let mut pending: HashMap<u32, PendingToolCall> = HashMap::new();

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    message.set_finish(FinishReason::Canceled);
                    self.persist(&message, events).await;
                    return Err(AgentError::Cancelled);
                }
                event = stream.next() => event,
            };
            let Some(event) = event else { break };
            let event = match event.map_err(map_provider_error) {
                Ok(event) => event,
                Err(e) => {
                    // The turn aborts, but the partial message still closes
                    // with a non-stop finish reason.
                    message.set_finish(FinishReason::Error);
                    self.persist(&message, events).await;
                    return Err(e);
                }
            };
            match event {
                ResponseEvent::TextDelta(delta) if !delta.is_empty() => {
                    message.append_text(&delta);
                    let _ = events.send(AgentEvent::TextDelta(delta)).await;
                }
                ResponseEvent::ReasoningDelta { text, signature } => {
                    if !text.is_empty() || signature.is_some() {
                        message.append_reasoning(&text, signature.as_deref());
                        if !text.is_empty() {
                            let _ = events.send(AgentEvent::ReasoningDelta(text)).await;
                        }
                    }
                }
                ResponseEvent::ToolCallDelta { index, id, name, arguments } => {
                    let slot = pending.entry(index).or_default();
                    if !id.is_empty() {
                        slot.id = id;
                    }
                    if !name.is_empty() {
                        slot.name = name;
                    }
                    slot.arguments.push_str(&arguments);
                }
                ResponseEvent::Usage(u) => {
                    usage.add(&u);
                    let _ = events.send(AgentEvent::TokenUsage(u)).await;
                }
                ResponseEvent::Finish(reason) => {
                    message.set_finish(reason);
                }
                ResponseEvent::Error(e) => {
                    warn!(session_id, error = %e, "model stream error");
                    let _ = events.send(AgentEvent::Error(e)).await;
                }
                ResponseEvent::TextDelta(_) => {}
            }
        }

        // Flush accumulated tool calls in provider index order.  Calls with
        // an empty name cannot be dispatched and are dropped; an empty id
        // gets a fresh one so pairing stays intact.
        let profile = self.id_profile(model);
        let mut ordered: Vec<(u32, PendingToolCall)> = pending.into_iter().collect();
        ordered.sort_by_key(|(idx, _)| *idx);
        for (_, slot) in ordered {
            let name = sanitize::sanitize_tool_name(&slot.name);
            if name.is_empty() {
                warn!(call_id = %slot.id, "dropping tool call with empty name from model");
                continue;
            }
            let id = if slot.id.is_empty() {
                ids::generate(profile)
            } else {
                slot.id
            };
            let arguments = canonical_arguments(&slot.arguments, &name, &id);
            message.add_tool_call(id, name, arguments);
        }

        // The finish marker closes the message even when tool-call parts were
        // flushed after the provider's stop event arrived.
        if let Some(pos) = message
            .parts
            .iter()
            .position(|p| matches!(p, ContentPart::Finish { .. }))
        {
            let finish = message.parts.remove(pos);
            message.parts.push(finish);
        } else {
            // Stream ended without an explicit marker; infer from content.
            let reason = if message.tool_calls().is_empty() {
                FinishReason::Stop
            } else {
                FinishReason::ToolCalls
            };
            message.set_finish(reason);
        }

        Ok((message, usage))
    }

    fn id_profile(&self, model: &ModelHandle) -> IdProfile {
        registry::get_provider(&model.config.provider)
            .filter(|meta| meta.strict_tool_call_ids)
            .map(|_| IdProfile::StrictAlphanumeric)
            .unwrap_or(IdProfile::Standard)
    }

    /// Rewrite text-embedded tool-call markup into structured parts.
    fn salvage_text_tool_calls(&self, message: &mut Message, model: &ModelHandle) {
        if !message.tool_calls().is_empty() {
            return;
        }
        let text = message.text();
        if text.is_empty() {
            return;
        }
        let profile = self.id_profile(model);
        if let Some((remaining, calls)) = salvage::salvage(&text, profile) {
            message.parts.retain(|p| !matches!(p, ContentPart::Text { .. }));
            if !remaining.is_empty() {
                message.parts.insert(0, ContentPart::text(remaining));
            }
            for call in calls {
                message.add_tool_call(call.id, call.name, call.arguments);
            }
            // The turn continues as if the provider had emitted tool calls.
            if message.finish_reason() != Some(FinishReason::ToolCalls) {
                message
                    .parts
                    .retain(|p| !matches!(p, ContentPart::Finish { .. }));
                message.set_finish(FinishReason::ToolCalls);
            }
        }
    }

    /// Execute one batch of tool calls.  Parallel-safe tools run
    /// concurrently; the rest run in arrival order.  Results are returned in
    /// completion order.
    async fn execute_tool_batch(
        &self,
        session_id: &str,
        calls: &[ToolCall],
        approvals: &[bool],
        cancel: &CancellationToken,
        events: &mpsc::Sender<AgentEvent>,
    ) -> Vec<nexora_tools::ToolOutput> {
        use nexora_tools::ToolOutput;

        let registry = self.tools.read().await.clone();
        let ctx = ToolContext::for_session(session_id);
        let machine = self.machine(session_id);
        let mut outputs: Vec<ToolOutput> = Vec::with_capacity(calls.len());

        let mut parallel: Vec<ToolCall> = Vec::new();
        let mut serial: Vec<ToolCall> = Vec::new();
        for (call, approved) in calls.iter().zip(approvals) {
            let _ = events.send(AgentEvent::ToolCallStarted(call.clone())).await;
            if !approved {
                outputs.push(ToolOutput::err(&call.id, "permission denied by user"));
                continue;
            }
            if registry.is_parallel_safe(&call.name) {
                parallel.push(call.clone());
            } else {
                serial.push(call.clone());
            }
        }

        let mut join = tokio::task::JoinSet::new();
        for call in parallel {
            let registry = Arc::clone(&registry);
            let ctx = ctx.clone();
            join.spawn(async move {
                let output = registry.execute(&ctx, &call).await;
                (call, output)
            });
        }
        while let Some(joined) = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            joined = join.join_next() => joined,
        } {
            match joined {
                Ok((call, output)) => outputs.push(output_with_call(&machine, &call, output)),
                Err(e) => {
                    // A panicking tool becomes an error result; the id is
                    // unknown after a panic, so the batch is repaired later
                    // by the pairing pass.
                    warn!(error = %e, "tool task panicked");
                }
            }
        }
        if cancel.is_cancelled() {
            join.abort_all();
        }

        for call in serial {
            if cancel.is_cancelled() {
                // Cancelled calls still get a result (empty content, error
                // flag unset) to preserve pairing.
                outputs.push(ToolOutput::ok(&call.id, ""));
                continue;
            }
            let registry = Arc::clone(&registry);
            let ctx = ctx.clone();
            let call_clone = call.clone();
            // Spawned so a panicking handler is intercepted rather than
            // unwinding through the agent loop.
            let result = tokio::spawn(async move { registry.execute(&ctx, &call_clone).await }).await;
            let output = match result {
                Ok(output) => output,
                Err(e) => ToolOutput::err(&call.id, format!("tool panicked: {e}")),
            };
            outputs.push(output_with_call(&machine, &call, output));
        }

        // Pairing repair within the batch: any call whose task died without
        // producing an output still gets a result.  Cancelled calls carry
        // empty content with the error flag unset.
        for call in calls {
            if !outputs.iter().any(|o| o.call_id == call.id) {
                if cancel.is_cancelled() {
                    outputs.push(ToolOutput::ok(&call.id, ""));
                } else {
                    outputs.push(ToolOutput::err(&call.id, "tool execution aborted"));
                }
            }
        }

        for output in &outputs {
            let name = calls
                .iter()
                .find(|c| c.id == output.call_id)
                .map(|c| c.name.clone())
                .unwrap_or_default();
            let _ = events
                .send(AgentEvent::ToolCallFinished {
                    call_id: output.call_id.clone(),
                    tool_name: name,
                    output: output.content.clone(),
                    is_error: output.is_error,
                })
                .await;
        }
        outputs
    }

    // ── Summarisation ─────────────────────────────────────────────────────────

    /// Run a dedicated summarisation turn.  The response is persisted with
    /// the summary flag; subsequent turns load the summary, a bridge marker,
    /// and the recent tail instead of the full history.
    pub async fn summarize(
        self: &Arc<Self>,
        session_id: &str,
        events: mpsc::Sender<AgentEvent>,
    ) -> Result<Message, AgentError> {
        self.sessions
            .get(session_id)
            .await?
            .ok_or_else(|| AgentError::SessionNotFound(session_id.to_string()))?;

        {
            let mut runtimes = self.runtimes.lock();
            let rt = runtimes
                .entry(session_id.to_string())
                .or_insert_with(SessionRuntime::new);
            if rt.busy {
                return Err(AgentError::SessionBusy(session_id.to_string()));
            }
            rt.busy = true;
            rt.cancel = CancellationToken::new();
        }

        let result = self.summarize_inner(session_id, &events).await;

        {
            let mut runtimes = self.runtimes.lock();
            if let Some(rt) = runtimes.get_mut(session_id) {
                rt.busy = false;
            }
        }
        result
    }

    async fn summarize_inner(
        self: &Arc<Self>,
        session_id: &str,
        events: &mpsc::Sender<AgentEvent>,
    ) -> Result<Message, AgentError> {
        let summarizer = self.summarizer.read().await.clone();
        let cancel = self
            .runtimes
            .lock()
            .get(session_id)
            .map(|r| r.cancel.clone())
            .expect("runtime exists");

        let mut history = self.load_history(session_id).await?;
        repair_unmatched_tool_calls(&mut history, session_id);
        history.push(Message::user(session_id, prompts::SUMMARIZE_PROMPT));

        let (message, usage) = self
            .stream_one_turn(
                session_id,
                &summarizer,
                "You compress coding-agent sessions into dense factual recaps.",
                history,
                false,
                &RunOptions::default(),
                &cancel,
                events,
            )
            .await?;

        let mut summary = message;
        summary.is_summary = true;
        self.persist(&summary, events).await;
        self.background.invalidate(session_id);

        // Summarisation is itself a model call; the counters move.
        if let Ok(Some(mut session)) = self.sessions.get(session_id).await {
            session.prompt_tokens += usage.prompt_tokens;
            session.completion_tokens += usage.completion_tokens;
            session.cost += summarizer.cost(&usage);
            if let Err(e) = self.sessions.update(&session).await {
                warn!(error = %e, "failed to update session after summarisation");
            }
        }
        Ok(summary)
    }

    /// Idle hook for the background compactor: cache a structurally-shrunken
    /// history and reduce the session's prompt-token counter by the saving.
    pub async fn on_idle(&self, session_id: &str) {
        let Ok(history) = self.load_history(session_id).await else {
            return;
        };
        if let Some(saved) = self.background.on_idle(session_id, &history) {
            if let Ok(Some(mut session)) = self.sessions.get(session_id).await {
                if session.prompt_tokens >= saved as u64 {
                    session.prompt_tokens -= saved as u64;
                    if let Err(e) = self.sessions.update(&session).await {
                        warn!(error = %e, "failed to update session after idle compaction");
                    }
                }
            }
        }
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    async fn finish_turn(&self, session_id: &str, model: &ModelHandle, turn: &TurnResult) {
        match self.sessions.get(session_id).await {
            Ok(Some(mut session)) => {
                session.prompt_tokens += turn.usage.prompt_tokens + turn.usage.cache_read_tokens;
                session.completion_tokens += turn.usage.completion_tokens;
                session.cost += turn.cost;
                session.message_count = self
                    .messages
                    .list_by_session(session_id)
                    .await
                    .map(|m| m.len() as u64)
                    .unwrap_or(session.message_count);
                if session.title.is_empty() {
                    session.title = derive_title(&turn.message, model);
                }
                if let Err(e) = self.sessions.update(&session).await {
                    warn!(error = %e, "failed to update session counters");
                }
            }
            Ok(None) => warn!(session_id, "session disappeared during turn"),
            Err(e) => warn!(error = %e, "failed to load session at turn end"),
        }
    }

    async fn write_cancel_marker(&self, session_id: &str) {
        let mut marker = Message::assistant_streaming(session_id);
        marker.set_finish(FinishReason::Canceled);
        self.persist(&marker, &mpsc::channel(1).0).await;
    }

    /// Persist a message; storage failures are logged and surfaced as an
    /// error event rather than aborting the turn.
    async fn persist(&self, message: &Message, events: &mpsc::Sender<AgentEvent>) {
        if let Err(e) = self.messages.create(message.clone()).await {
            warn!(error = %e, message_id = %message.id, "failed to persist message");
            let _ = events
                .send(AgentEvent::Error(format!("persistence failed: {e}")))
                .await;
        }
    }

    fn transition(
        &self,
        machine: &Arc<StateMachine>,
        to: AgentState,
        events: &mpsc::Sender<AgentEvent>,
    ) {
        match machine.transition(to) {
            Ok(from) => {
                let _ = events.try_send(AgentEvent::StateChanged { from, to });
            }
            Err(e) => warn!(error = %e, "state transition rejected"),
        }
    }
}

#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Record the action fingerprint for one finished tool call.
fn output_with_call(
    machine: &Arc<StateMachine>,
    call: &ToolCall,
    output: nexora_tools::ToolOutput,
) -> nexora_tools::ToolOutput {
    let target = call
        .args
        .get("path")
        .or_else(|| call.args.get("file_path"))
        .or_else(|| call.args.get("command"))
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let error = output.is_error.then_some(output.content.as_str());
    machine.record_action(&call.name, target, error, !output.is_error);
    if !output.is_error && matches!(call.name.as_str(), "edit" | "multi-edit" | "write") {
        if !target.is_empty() {
            machine.record_file_modified(target);
        }
    }
    output
}

/// Map a tool-error message onto the recoverable taxonomy, when it fits.
fn classify_tool_error(tool: &str, message: &str) -> Option<RecoverableKind> {
    let lower = message.to_lowercase();
    if lower.contains("panicked") {
        return Some(RecoverableKind::Panic);
    }
    if lower.contains("timed out") || lower.contains("timeout") {
        return Some(RecoverableKind::Timeout);
    }
    if lower.contains("modified since read") || lower.contains("file is outdated") {
        return Some(RecoverableKind::FileOutdated);
    }
    if lower.contains("resource limit") || lower.contains("out of memory") {
        return Some(RecoverableKind::ResourceLimit);
    }
    if matches!(tool, "edit" | "multi-edit" | "write" | "apply_patch")
        && (lower.contains("not found") || lower.contains("failed"))
    {
        return Some(RecoverableKind::EditFailed);
    }
    None
}

/// Decode tool-call arguments into canonical JSON, substituting `{}` for
/// anything unparseable.
fn canonical_arguments(raw: &str, name: &str, id: &str) -> String {
    if raw.trim().is_empty() {
        return "{}".to_string();
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(v) if v.is_object() => v.to_string(),
        Ok(_) | Err(_) => {
            warn!(tool = name, call_id = id, "invalid tool-call arguments from model; substituting {{}}");
            "{}".to_string()
        }
    }
}

/// Tool calls of the newest assistant message, as registry-ready calls.
fn extract_tool_calls(message: &Message) -> Vec<ToolCall> {
    message
        .parts
        .iter()
        .filter_map(|p| match p {
            ContentPart::ToolCall { id, name, arguments, .. } => Some(ToolCall {
                id: id.clone(),
                name: name.clone(),
                args: serde_json::from_str(arguments)
                    .unwrap_or_else(|_| Value::Object(Default::default())),
            }),
            _ => None,
        })
        .collect()
}

/// If the last assistant message carries a ToolCall with no matching
/// ToolResult anywhere after it (an interrupted stream), synthesise an
/// explanatory error result so the wire never sees an unpaired call.
pub(crate) fn repair_unmatched_tool_calls(history: &mut Vec<Message>, session_id: &str) {
    let answered: std::collections::HashSet<String> = history
        .iter()
        .flat_map(|m| m.parts.iter())
        .filter_map(|p| match p {
            ContentPart::ToolResult { call_id, .. } => Some(call_id.clone()),
            _ => None,
        })
        .collect();

    let Some(last_assistant) = history.iter().rev().find(|m| m.role == Role::Assistant) else {
        return;
    };
    let unanswered: Vec<String> = last_assistant
        .parts
        .iter()
        .filter_map(|p| match p {
            ContentPart::ToolCall { id, .. } if !answered.contains(id) => Some(id.clone()),
            _ => None,
        })
        .collect();

    for call_id in unanswered {
        let repair = Message::tool_error(
            session_id,
            &call_id,
            "tool execution was interrupted before producing a result",
        );
        history.push(repair);
    }
}

fn map_provider_error(e: anyhow::Error) -> AgentError {
    let text = e.to_string();
    if text.contains("401") || text.to_lowercase().contains("unauthorized") {
        AgentError::ProviderUnauthorized(text)
    } else {
        AgentError::Other(e)
    }
}

/// Short session title derived from the final assistant text (the cheap
/// stand-in until the next turn replaces it with a model-generated one).
fn derive_title(message: &Message, _model: &ModelHandle) -> String {
    let text = message.text();
    let title: String = text.split_whitespace().take(8).collect::<Vec<_>>().join(" ");
    if title.is_empty() {
        "New session".to_string()
    } else {
        title
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repair_synthesises_result_for_orphan_call() {
        let mut call = Message::assistant_streaming("s1");
        call.add_tool_call("call_lost", "bash", "{}");
        let mut history = vec![Message::user("s1", "run it"), call];
        repair_unmatched_tool_calls(&mut history, "s1");
        assert_eq!(history.len(), 3);
        match &history[2].parts[0] {
            ContentPart::ToolResult { call_id, is_error, .. } => {
                assert_eq!(call_id, "call_lost");
                assert!(is_error);
            }
            other => panic!("wrong part: {other:?}"),
        }
    }

    #[test]
    fn repair_leaves_answered_calls_alone() {
        let mut call = Message::assistant_streaming("s1");
        call.add_tool_call("call_ok", "bash", "{}");
        let mut history = vec![call, Message::tool_result("s1", "call_ok", "done")];
        repair_unmatched_tool_calls(&mut history, "s1");
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn repair_handles_multiple_orphans() {
        let mut call = Message::assistant_streaming("s1");
        call.add_tool_call("call_a", "grep", "{}");
        call.add_tool_call("call_b", "view", "{}");
        let mut history = vec![call, Message::tool_result("s1", "call_a", "found")];
        repair_unmatched_tool_calls(&mut history, "s1");
        assert_eq!(history.len(), 3);
        match &history[2].parts[0] {
            ContentPart::ToolResult { call_id, .. } => assert_eq!(call_id, "call_b"),
            other => panic!("wrong part: {other:?}"),
        }
    }

    #[test]
    fn canonical_arguments_passes_objects() {
        assert_eq!(
            canonical_arguments(r#"{"a": 1}"#, "t", "id"),
            r#"{"a":1}"#
        );
    }

    #[test]
    fn canonical_arguments_substitutes_empty_object() {
        assert_eq!(canonical_arguments("", "t", "id"), "{}");
        assert_eq!(canonical_arguments("not json", "t", "id"), "{}");
        assert_eq!(canonical_arguments("[1,2]", "t", "id"), "{}");
    }

    #[test]
    fn classify_tool_errors_by_message_and_tool() {
        assert_eq!(
            classify_tool_error("bash", "tool panicked: boom"),
            Some(RecoverableKind::Panic)
        );
        assert_eq!(
            classify_tool_error("fetch", "request timed out after 600s"),
            Some(RecoverableKind::Timeout)
        );
        assert_eq!(
            classify_tool_error("edit", "old_string not found in file"),
            Some(RecoverableKind::EditFailed)
        );
        assert_eq!(
            classify_tool_error("view", "file was modified since read"),
            Some(RecoverableKind::FileOutdated)
        );
        assert_eq!(classify_tool_error("grep", "no matches"), None);
    }

    #[test]
    fn extract_tool_calls_parses_arguments() {
        let mut m = Message::assistant_streaming("s1");
        m.add_tool_call("call_1", "grep", r#"{"pattern": "x"}"#);
        let calls = extract_tool_calls(&m);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].args["pattern"], "x");
    }
}
