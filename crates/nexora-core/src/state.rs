// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Agent lifecycle state machine.
//!
//! Transitions outside the table fail with [`TransitionError`]; `Halted` is
//! terminal.  Stuck detection publishes callbacks but never halts on its
//! own — that policy belongs to the caller.

use std::sync::Arc;

use chrono::Duration;
use parking_lot::Mutex;
use tracing::debug;

use crate::progress::{PhaseContext, ProgressTracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentState {
    Idle,
    ProcessingPrompt,
    StreamingResponse,
    ExecutingTool,
    AwaitingPermission,
    ErrorRecovery,
    PhaseTransition,
    ProgressCheck,
    ResourcePaused,
    Halted,
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentState::Idle => "idle",
            AgentState::ProcessingPrompt => "processing_prompt",
            AgentState::StreamingResponse => "streaming_response",
            AgentState::ExecutingTool => "executing_tool",
            AgentState::AwaitingPermission => "awaiting_permission",
            AgentState::ErrorRecovery => "error_recovery",
            AgentState::PhaseTransition => "phase_transition",
            AgentState::ProgressCheck => "progress_check",
            AgentState::ResourcePaused => "resource_paused",
            AgentState::Halted => "halted",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid transition: {from} -> {to}")]
pub struct TransitionError {
    pub from: AgentState,
    pub to: AgentState,
}

/// The allowed-transition table.
pub fn transition_allowed(from: AgentState, to: AgentState) -> bool {
    use AgentState::*;
    // Halted is reachable from everywhere except itself.
    if to == Halted {
        return from != Halted;
    }
    matches!(
        (from, to),
        (Idle, ProcessingPrompt)
            | (Idle, PhaseTransition)
            | (ProcessingPrompt, StreamingResponse)
            | (ProcessingPrompt, ErrorRecovery)
            | (ProcessingPrompt, ProcessingPrompt)
            | (StreamingResponse, ExecutingTool)
            | (StreamingResponse, AwaitingPermission)
            | (StreamingResponse, ProgressCheck)
            | (StreamingResponse, Idle)
            | (StreamingResponse, ErrorRecovery)
            | (ExecutingTool, StreamingResponse)
            | (ExecutingTool, ProgressCheck)
            | (ExecutingTool, ErrorRecovery)
            | (AwaitingPermission, StreamingResponse)
            | (AwaitingPermission, ExecutingTool)
            | (AwaitingPermission, Idle)
            | (ErrorRecovery, StreamingResponse)
            | (ErrorRecovery, ExecutingTool)
            | (ErrorRecovery, ProgressCheck)
            | (ErrorRecovery, Idle)
            | (PhaseTransition, ProcessingPrompt)
            | (PhaseTransition, ProgressCheck)
            | (PhaseTransition, PhaseTransition)
            | (PhaseTransition, Idle)
            | (ProgressCheck, StreamingResponse)
            | (ProgressCheck, ExecutingTool)
            | (ProgressCheck, PhaseTransition)
            | (ProgressCheck, ErrorRecovery)
            | (ProgressCheck, Idle)
    )
}

type StuckCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Coordinates lifecycle transitions and wraps the progress tracker and the
/// phase context behind one lock each.
pub struct StateMachine {
    state: Mutex<AgentState>,
    tracker: Mutex<ProgressTracker>,
    phases: Mutex<PhaseContext>,
    stuck_callbacks: Mutex<Vec<StuckCallback>>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(AgentState::Idle),
            tracker: Mutex::new(ProgressTracker::new()),
            phases: Mutex::new(PhaseContext::new()),
            stuck_callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> AgentState {
        *self.state.lock()
    }

    /// Attempt a transition; anything outside the table fails.
    pub fn transition(&self, to: AgentState) -> Result<AgentState, TransitionError> {
        let mut state = self.state.lock();
        let from = *state;
        if !transition_allowed(from, to) {
            return Err(TransitionError { from, to });
        }
        debug!(%from, %to, "state transition");
        *state = to;
        Ok(from)
    }

    /// Force back to Idle at turn boundaries regardless of the intermediate
    /// state, except from the terminal Halted.
    pub fn reset_to_idle(&self) {
        let mut state = self.state.lock();
        if *state != AgentState::Halted {
            *state = AgentState::Idle;
        }
    }

    /// Forced entry into ResourcePaused, bypassing the table.  Used by the
    /// resource monitor's auto-pause; no new tools are invoked until
    /// [`Self::release`].
    pub fn force_pause(&self) {
        let mut state = self.state.lock();
        if *state != AgentState::Halted {
            *state = AgentState::ResourcePaused;
        }
    }

    /// Manual release from ResourcePaused back to Idle.
    pub fn release(&self) {
        let mut state = self.state.lock();
        if *state == AgentState::ResourcePaused {
            *state = AgentState::Idle;
        }
    }

    /// Register a callback invoked (on its own task) when stuck is detected.
    pub fn on_stuck(&self, callback: impl Fn(String) + Send + Sync + 'static) {
        self.stuck_callbacks.lock().push(Arc::new(callback));
    }

    /// Record a tool action; fires stuck callbacks asynchronously when a
    /// rule trips.  Returns the stuck reason, if any.
    pub fn record_action(
        &self,
        tool: &str,
        target: &str,
        error: Option<&str>,
        success: bool,
    ) -> Option<String> {
        let reason = self.tracker.lock().record(tool, target, error, success);
        if let Some(reason) = &reason {
            // Callbacks run detached so a slow consumer cannot deadlock the
            // caller holding this machine's locks.
            let callbacks: Vec<StuckCallback> = self.stuck_callbacks.lock().clone();
            let reason = reason.clone();
            for cb in callbacks {
                let r = reason.clone();
                tokio::spawn(async move { cb(r) });
            }
        }
        reason
    }

    pub fn record_file_modified(&self, path: &str) {
        self.tracker.lock().record_file_modified(path);
    }

    /// Duplicate-reply suppression; true when the message repeats.
    pub fn record_message(&self, text: &str) -> bool {
        self.tracker.lock().record_message(text)
    }

    pub fn is_stuck(&self) -> bool {
        self.tracker.lock().is_stuck()
    }

    pub fn stuck_reason(&self) -> Option<String> {
        self.tracker.lock().stuck_reason()
    }

    pub fn set_total_phases(&self, total: u32) {
        self.phases.lock().total_phases = Some(total);
    }

    /// Declare a new phase: archives the previous one, clears action/error
    /// tracking (file modifications and milestones survive), transitions to
    /// PhaseTransition, and starts a fresh clock.
    pub fn start_phase(
        &self,
        number: u32,
        description: &str,
        expected_duration: Option<Duration>,
    ) -> Result<(), TransitionError> {
        self.transition(AgentState::PhaseTransition)?;
        self.phases
            .lock()
            .start_phase(number, description, expected_duration);
        self.tracker.lock().reset_for_phase();
        Ok(())
    }

    pub fn complete_phase(&self, success: bool) {
        self.phases.lock().complete_phase(success);
    }

    pub fn with_tracker<R>(&self, f: impl FnOnce(&ProgressTracker) -> R) -> R {
        f(&self.tracker.lock())
    }

    pub fn with_phases<R>(&self, f: impl FnOnce(&PhaseContext) -> R) -> R {
        f(&self.phases.lock())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
