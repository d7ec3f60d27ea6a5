// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Idle-time background compactor.
//!
//! On idle signals it produces a structurally-shrunken copy of a session's
//! history and caches it keyed by session, so the next turn can start from
//! the smaller list without paying the shrink cost inline.  The cache is
//! invalidated whenever new messages arrive.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use nexora_model::{ContentPart, Message};

use crate::compact::estimate;

const TOOL_RESULT_SHRINK_BYTES: usize = 500;
const REASONING_SHRINK_BYTES: usize = 1000;
/// Messages in the recent tail that are always kept in full.
const KEEP_FULL_TAIL: usize = 10;
const CACHE_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct ShrunkHistory {
    pub messages: Vec<Message>,
    pub tokens_saved: usize,
    pub produced_at: Instant,
}

#[derive(Debug, Clone)]
pub struct BackgroundCompactorConfig {
    /// Minimum gap between compactions of the same session.
    pub compact_interval: Duration,
    /// History length below which compaction is skipped.
    pub max_messages: usize,
}

impl Default for BackgroundCompactorConfig {
    fn default() -> Self {
        Self {
            compact_interval: Duration::from_secs(30),
            max_messages: 20,
        }
    }
}

pub struct BackgroundCompactor {
    config: BackgroundCompactorConfig,
    cache: Mutex<LruCache<String, ShrunkHistory>>,
    last_run: Mutex<std::collections::HashMap<String, Instant>>,
}

impl BackgroundCompactor {
    pub fn new(config: BackgroundCompactorConfig) -> Self {
        Self {
            config,
            cache: Mutex::new(LruCache::new(NonZeroUsize::new(CACHE_CAPACITY).unwrap())),
            last_run: Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Idle hook.  Returns the tokens saved when a shrink was produced, or
    /// `None` when the gates (interval, history size) skip the run.
    pub fn on_idle(&self, session_id: &str, messages: &[Message]) -> Option<usize> {
        if messages.len() <= self.config.max_messages {
            return None;
        }
        {
            let last_run = self.last_run.lock();
            if let Some(last) = last_run.get(session_id) {
                if last.elapsed() < self.config.compact_interval {
                    return None;
                }
            }
        }

        let before = estimate(messages);
        let shrunk = shrink(messages);
        let after = estimate(&shrunk);
        let tokens_saved = before.saturating_sub(after);

        debug!(
            session_id,
            before, after, tokens_saved, "background compaction produced shrunken history"
        );
        self.last_run
            .lock()
            .insert(session_id.to_string(), Instant::now());
        self.cache.lock().put(
            session_id.to_string(),
            ShrunkHistory {
                messages: shrunk,
                tokens_saved,
                produced_at: Instant::now(),
            },
        );
        Some(tokens_saved)
    }

    /// Take the cached shrunken history for a session, consuming the entry.
    pub fn take(&self, session_id: &str) -> Option<ShrunkHistory> {
        self.cache.lock().pop(session_id)
    }

    pub fn peek_tokens_saved(&self, session_id: &str) -> Option<usize> {
        self.cache.lock().peek(session_id).map(|s| s.tokens_saved)
    }

    /// Drop the cached entry; called when new messages arrive for a session.
    pub fn invalidate(&self, session_id: &str) {
        self.cache.lock().pop(session_id);
    }
}

/// Structural shrink: everything after the last summary marker and the last
/// 10 messages stay intact; older tool results are truncated to 500 bytes
/// and reasoning to 1000 bytes.
fn shrink(messages: &[Message]) -> Vec<Message> {
    let summary_idx = messages.iter().rposition(|m| m.is_summary);
    let tail_start = messages.len().saturating_sub(KEEP_FULL_TAIL);

    messages
        .iter()
        .enumerate()
        .map(|(idx, m)| {
            let keep_full =
                idx >= tail_start || summary_idx.map(|s| idx >= s).unwrap_or(false);
            if keep_full {
                m.clone()
            } else {
                shrink_message(m)
            }
        })
        .collect()
}

fn shrink_message(message: &Message) -> Message {
    let mut m = message.clone();
    for part in &mut m.parts {
        match part {
            ContentPart::ToolResult { content, data, mime_type, .. } => {
                truncate_bytes(content, TOOL_RESULT_SHRINK_BYTES);
                *data = None;
                *mime_type = None;
            }
            ContentPart::Reasoning { text, .. } => {
                truncate_bytes(text, REASONING_SHRINK_BYTES);
            }
            _ => {}
        }
    }
    m
}

fn truncate_bytes(s: &mut String, cap: usize) {
    if s.len() <= cap {
        return;
    }
    let mut cut = cap;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
    s.push_str("…");
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
