// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Session records and the persistence seams.
//!
//! The core does not assume a specific database: it talks to
//! [`SessionStore`] / [`MessageStore`] traits and ships in-memory
//! implementations used in tests and by default wiring.  Write errors are
//! logged by callers and surfaced at turn completion.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use nexora_model::Message;

/// A persistent conversation thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    /// Auto-generated after the first turn.
    pub title: String,
    /// Parent session for delegated tasks.
    pub parent_id: Option<String>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost: f64,
    pub message_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            title: String::new(),
            parent_id: None,
            prompt_tokens: 0,
            completion_tokens: 0,
            cost: 0.0,
            message_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Child session spawned by the delegate tool.
    pub fn task_session(parent_id: impl Into<String>, title: impl Into<String>) -> Self {
        let mut s = Self::new();
        s.parent_id = Some(parent_id.into());
        s.title = title.into();
        s
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Persistence traits ───────────────────────────────────────────────────────

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, session: Session) -> anyhow::Result<Session>;
    async fn get(&self, id: &str) -> anyhow::Result<Option<Session>>;
    async fn update(&self, session: &Session) -> anyhow::Result<()>;
    async fn delete(&self, id: &str) -> anyhow::Result<()>;
    async fn list(&self) -> anyhow::Result<Vec<Session>>;
    /// Create a child session for a delegated task.
    async fn create_task_session(
        &self,
        parent_id: &str,
        title: &str,
    ) -> anyhow::Result<Session>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create(&self, message: Message) -> anyhow::Result<Message>;
    async fn update(&self, message: &Message) -> anyhow::Result<()>;
    async fn list_by_session(&self, session_id: &str) -> anyhow::Result<Vec<Message>>;
    async fn delete_session_messages(&self, session_id: &str) -> anyhow::Result<()>;
}

// ─── In-memory implementations ────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl InMemorySessionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, session: Session) -> anyhow::Result<Session> {
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn get(&self, id: &str) -> anyhow::Result<Option<Session>> {
        Ok(self.sessions.read().await.get(id).cloned())
    }

    async fn update(&self, session: &Session) -> anyhow::Result<()> {
        let mut sessions = self.sessions.write().await;
        let mut updated = session.clone();
        updated.updated_at = Utc::now();
        sessions.insert(session.id.clone(), updated);
        Ok(())
    }

    async fn delete(&self, id: &str) -> anyhow::Result<()> {
        self.sessions.write().await.remove(id);
        Ok(())
    }

    async fn list(&self) -> anyhow::Result<Vec<Session>> {
        let mut all: Vec<Session> = self.sessions.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(all)
    }

    async fn create_task_session(&self, parent_id: &str, title: &str) -> anyhow::Result<Session> {
        self.create(Session::task_session(parent_id, title)).await
    }
}

#[derive(Default)]
pub struct InMemoryMessageStore {
    messages: RwLock<Vec<Message>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn create(&self, message: Message) -> anyhow::Result<Message> {
        self.messages.write().await.push(message.clone());
        Ok(message)
    }

    async fn update(&self, message: &Message) -> anyhow::Result<()> {
        let mut messages = self.messages.write().await;
        if let Some(slot) = messages.iter_mut().find(|m| m.id == message.id) {
            *slot = message.clone();
        }
        Ok(())
    }

    async fn list_by_session(&self, session_id: &str) -> anyhow::Result<Vec<Message>> {
        Ok(self
            .messages
            .read()
            .await
            .iter()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn delete_session_messages(&self, session_id: &str) -> anyhow::Result<()> {
        self.messages
            .write()
            .await
            .retain(|m| m.session_id != session_id);
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
