// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Progress tracking and stuck-loop detection.

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};

const ACTION_WINDOW: usize = 20;
const ERROR_WINDOW: usize = 10;
const MESSAGE_HASH_WINDOW: usize = 5;

/// Tools whose successes do not count as forward progress.
const OBSERVATION_TOOLS: &[&str] = &["view", "ls", "grep"];

/// One recorded action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionFingerprint {
    pub at: DateTime<Utc>,
    pub tool: String,
    /// Target file or command.
    pub target: String,
    /// 16-hex-character SHA-256 prefix of the error message; empty on success.
    pub error_hash: String,
    pub success: bool,
}

impl ActionFingerprint {
    pub fn new(tool: &str, target: &str, error: Option<&str>, success: bool) -> Self {
        Self {
            at: Utc::now(),
            tool: tool.to_string(),
            target: target.to_string(),
            error_hash: error.map(hash_prefix).unwrap_or_default(),
            success,
        }
    }
}

fn hash_prefix(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    hex::encode(&digest[..8])
}

/// Records actions, detects stuck loops, deduplicates repeated model replies.
///
/// Keeps the last 20 action fingerprints and the last 10 error fingerprints.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    actions: VecDeque<ActionFingerprint>,
    errors: VecDeque<ActionFingerprint>,
    message_hashes: VecDeque<String>,
    files_modified: HashSet<String>,
    milestones: Vec<String>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a tool invocation and return the stuck reason, if any.
    pub fn record(
        &mut self,
        tool: &str,
        target: &str,
        error: Option<&str>,
        success: bool,
    ) -> Option<String> {
        let fp = ActionFingerprint::new(tool, target, error, success);
        if !success {
            self.errors.push_back(fp.clone());
            if self.errors.len() > ERROR_WINDOW {
                self.errors.pop_front();
            }
        }
        self.actions.push_back(fp);
        if self.actions.len() > ACTION_WINDOW {
            self.actions.pop_front();
        }
        self.stuck_reason()
    }

    pub fn record_file_modified(&mut self, path: &str) {
        self.files_modified.insert(path.to_string());
    }

    pub fn record_milestone(&mut self, note: impl Into<String>) {
        self.milestones.push(note.into());
    }

    /// Returns `true` when an identical message was already seen in the
    /// recent window, letting callers suppress repeated model replies.
    pub fn record_message(&mut self, text: &str) -> bool {
        let h = hash_prefix(text);
        let duplicate = self.message_hashes.contains(&h);
        self.message_hashes.push_back(h);
        if self.message_hashes.len() > MESSAGE_HASH_WINDOW {
            self.message_hashes.pop_front();
        }
        duplicate
    }

    pub fn is_stuck(&self) -> bool {
        self.stuck_reason().is_some()
    }

    /// The three stuck-detection rules, checked in order.
    pub fn stuck_reason(&self) -> Option<String> {
        if let Some(reason) = self.same_target_repeat_error() {
            return Some(reason);
        }
        if let Some(reason) = self.oscillation() {
            return Some(reason);
        }
        self.no_meaningful_progress()
    }

    /// Rule 1: the most recent 3 error fingerprints share target and
    /// error-hash.
    fn same_target_repeat_error(&self) -> Option<String> {
        if self.errors.len() < 3 {
            return None;
        }
        let recent: Vec<&ActionFingerprint> = self.errors.iter().rev().take(3).collect();
        let first = recent[0];
        if recent
            .iter()
            .all(|fp| fp.target == first.target && fp.error_hash == first.error_hash)
        {
            return Some(format!(
                "same error repeated 3 times on {target} ({tool})",
                target = first.target,
                tool = first.tool,
            ));
        }
        None
    }

    /// Rule 2: the most recent 4 actions alternate A-B-A-B across two
    /// distinct non-empty targets.
    fn oscillation(&self) -> Option<String> {
        if self.actions.len() < 4 {
            return None;
        }
        let recent: Vec<&ActionFingerprint> = self.actions.iter().rev().take(4).collect();
        let (d, c, b, a) = (recent[0], recent[1], recent[2], recent[3]);
        if !a.target.is_empty()
            && !b.target.is_empty()
            && a.target != b.target
            && a.target == c.target
            && b.target == d.target
        {
            return Some(format!(
                "oscillating between {first} and {second}",
                first = a.target,
                second = b.target,
            ));
        }
        None
    }

    /// Rule 3: plenty of actions, almost nothing to show for them.
    fn no_meaningful_progress(&self) -> Option<String> {
        if self.actions.len() < 15 {
            return None;
        }
        let meaningful_successes = self
            .actions
            .iter()
            .filter(|fp| fp.success && !OBSERVATION_TOOLS.contains(&fp.tool.as_str()))
            .count();
        let unique_targets: HashSet<&str> =
            self.actions.iter().map(|fp| fp.target.as_str()).collect();
        let unique_tools: HashSet<&str> = self.actions.iter().map(|fp| fp.tool.as_str()).collect();
        if meaningful_successes < 2
            && unique_targets.len() < 3
            && unique_tools.len() < 2
            && self.files_modified.is_empty()
        {
            return Some(format!(
                "no meaningful progress after {n} actions",
                n = self.actions.len(),
            ));
        }
        None
    }

    pub fn action_count(&self) -> usize {
        self.actions.len()
    }

    pub fn files_modified(&self) -> &HashSet<String> {
        &self.files_modified
    }

    pub fn milestones(&self) -> &[String] {
        &self.milestones
    }

    /// Clear error/action/message tracking at a phase boundary.  The
    /// historical file-modification set and milestones survive.
    pub fn reset_for_phase(&mut self) {
        self.actions.clear();
        self.errors.clear();
        self.message_hashes.clear();
    }
}

// ─── Phase context ────────────────────────────────────────────────────────────

/// A finished phase.
#[derive(Debug, Clone)]
pub struct PhaseRecord {
    pub number: u32,
    pub description: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
}

#[derive(Debug, Clone)]
pub struct ActivePhase {
    pub number: u32,
    pub description: String,
    pub expected_duration: Option<Duration>,
    pub started_at: DateTime<Utc>,
}

/// Phase bookkeeping for long multi-step tasks.
#[derive(Debug, Default)]
pub struct PhaseContext {
    pub total_phases: Option<u32>,
    current: Option<ActivePhase>,
    completed: Vec<PhaseRecord>,
}

impl PhaseContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin phase `number`.  A still-active previous phase is archived as
    /// unfinished (success = false).
    pub fn start_phase(
        &mut self,
        number: u32,
        description: &str,
        expected_duration: Option<Duration>,
    ) {
        if let Some(prev) = self.current.take() {
            self.completed.push(PhaseRecord {
                number: prev.number,
                description: prev.description,
                started_at: prev.started_at,
                finished_at: Utc::now(),
                success: false,
            });
        }
        self.current = Some(ActivePhase {
            number,
            description: description.to_string(),
            expected_duration,
            started_at: Utc::now(),
        });
    }

    /// Record the active phase as finished.
    pub fn complete_phase(&mut self, success: bool) {
        if let Some(active) = self.current.take() {
            self.completed.push(PhaseRecord {
                number: active.number,
                description: active.description,
                started_at: active.started_at,
                finished_at: Utc::now(),
                success,
            });
        }
    }

    pub fn current(&self) -> Option<&ActivePhase> {
        self.current.as_ref()
    }

    pub fn completed(&self) -> &[PhaseRecord] {
        &self.completed
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Rule 1: same-target repeat error ──────────────────────────────────────

    #[test]
    fn three_identical_errors_on_same_target_is_stuck() {
        let mut t = ProgressTracker::new();
        for _ in 0..3 {
            t.record("edit", "main.go", Some("old_string not found"), false);
        }
        let reason = t.stuck_reason().expect("must be stuck");
        assert!(reason.contains("main.go"), "reason must name the target: {reason}");
    }

    #[test]
    fn two_identical_errors_is_not_stuck() {
        let mut t = ProgressTracker::new();
        t.record("edit", "main.go", Some("bad"), false);
        assert!(t.record("edit", "main.go", Some("bad"), false).is_none());
    }

    #[test]
    fn three_errors_with_different_hashes_not_stuck() {
        let mut t = ProgressTracker::new();
        t.record("edit", "main.go", Some("error one"), false);
        t.record("edit", "main.go", Some("error two"), false);
        t.record("edit", "main.go", Some("error three"), false);
        assert!(!t.is_stuck());
    }

    #[test]
    fn errors_on_different_targets_not_stuck() {
        let mut t = ProgressTracker::new();
        t.record("edit", "a.rs", Some("bad"), false);
        t.record("edit", "b.rs", Some("bad"), false);
        t.record("edit", "c.rs", Some("bad"), false);
        assert!(!t.is_stuck());
    }

    #[test]
    fn successes_between_errors_still_counted_in_error_window() {
        // Successes do not enter the error window, so three matching errors
        // interleaved with successes still trip rule 1.
        let mut t = ProgressTracker::new();
        t.record("edit", "main.go", Some("bad"), false);
        t.record("view", "main.go", None, true);
        t.record("edit", "main.go", Some("bad"), false);
        t.record("view", "main.go", None, true);
        let reason = t.record("edit", "main.go", Some("bad"), false);
        assert!(reason.is_some());
    }

    // ── Rule 2: oscillation ───────────────────────────────────────────────────

    #[test]
    fn abab_pattern_is_stuck() {
        let mut t = ProgressTracker::new();
        t.record("edit", "a.rs", None, true);
        t.record("edit", "b.rs", None, true);
        t.record("edit", "a.rs", None, true);
        let reason = t.record("edit", "b.rs", None, true).expect("oscillation");
        assert!(reason.contains("a.rs") && reason.contains("b.rs"));
    }

    #[test]
    fn abab_with_empty_targets_not_stuck() {
        let mut t = ProgressTracker::new();
        for _ in 0..2 {
            t.record("bash", "", None, true);
            t.record("view", "", None, true);
        }
        assert!(!t.is_stuck());
    }

    #[test]
    fn abcd_pattern_not_stuck() {
        let mut t = ProgressTracker::new();
        for target in ["a", "b", "c", "d"] {
            t.record("edit", target, None, true);
        }
        assert!(!t.is_stuck());
    }

    // ── Rule 3: no meaningful progress ────────────────────────────────────────

    #[test]
    fn fifteen_observation_actions_on_one_target_is_stuck() {
        let mut t = ProgressTracker::new();
        for _ in 0..15 {
            t.record("view", "readme.md", None, true);
        }
        let reason = t.stuck_reason().expect("must be stuck");
        assert!(reason.contains("no meaningful progress"));
    }

    #[test]
    fn no_false_stuck_on_rotating_successful_edits() {
        // 100 successful edits rotating over 5 distinct files: plenty of
        // meaningful successes and unique targets.
        let mut t = ProgressTracker::new();
        for i in 0..100 {
            t.record("edit", &format!("f_{}.go", i % 5), None, true);
        }
        assert!(!t.is_stuck());
    }

    #[test]
    fn file_modification_defeats_rule_three() {
        let mut t = ProgressTracker::new();
        t.record_file_modified("lib.rs");
        for _ in 0..20 {
            t.record("view", "lib.rs", None, true);
        }
        assert!(!t.is_stuck());
    }

    #[test]
    fn under_fifteen_actions_never_rule_three() {
        let mut t = ProgressTracker::new();
        for _ in 0..14 {
            t.record("view", "x.rs", None, true);
        }
        assert!(!t.is_stuck());
    }

    // ── Windows ───────────────────────────────────────────────────────────────

    #[test]
    fn action_window_is_bounded() {
        let mut t = ProgressTracker::new();
        for i in 0..50 {
            t.record("edit", &format!("f{i}"), None, true);
        }
        assert_eq!(t.action_count(), 20);
    }

    // ── Message dedup ─────────────────────────────────────────────────────────

    #[test]
    fn repeated_message_detected() {
        let mut t = ProgressTracker::new();
        assert!(!t.record_message("I will now edit the file."));
        assert!(t.record_message("I will now edit the file."));
    }

    #[test]
    fn message_window_expires_old_hashes() {
        let mut t = ProgressTracker::new();
        t.record_message("first");
        for i in 0..5 {
            t.record_message(&format!("filler {i}"));
        }
        assert!(!t.record_message("first"), "hash must have aged out");
    }

    // ── Phase reset ───────────────────────────────────────────────────────────

    #[test]
    fn phase_reset_clears_actions_keeps_files() {
        let mut t = ProgressTracker::new();
        t.record("edit", "a.rs", Some("x"), false);
        t.record_file_modified("a.rs");
        t.record_milestone("step 1 done");
        t.reset_for_phase();
        assert_eq!(t.action_count(), 0);
        assert_eq!(t.files_modified().len(), 1);
        assert_eq!(t.milestones().len(), 1);
    }

    // ── Phase context ─────────────────────────────────────────────────────────

    #[test]
    fn start_phase_archives_previous_as_unfinished() {
        let mut p = PhaseContext::new();
        p.start_phase(1, "research", None);
        p.start_phase(2, "implement", None);
        assert_eq!(p.completed().len(), 1);
        assert!(!p.completed()[0].success);
        assert_eq!(p.current().unwrap().number, 2);
    }

    #[test]
    fn complete_phase_records_success() {
        let mut p = PhaseContext::new();
        p.start_phase(1, "research", Some(Duration::minutes(10)));
        p.complete_phase(true);
        assert!(p.current().is_none());
        assert!(p.completed()[0].success);
    }

    #[test]
    fn complete_without_active_phase_is_a_no_op() {
        let mut p = PhaseContext::new();
        p.complete_phase(true);
        assert!(p.completed().is_empty());
    }
}
