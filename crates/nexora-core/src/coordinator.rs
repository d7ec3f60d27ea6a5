// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The coordinator: builds models and the tool catalogue for a session,
//! refreshes expired credentials, dispatches prompts to the session agent,
//! and owns the delegation pool.

use std::sync::Arc;

use anyhow::Context;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use nexora_config::{AgentConfig, Config, ModelConfig};
use nexora_model::{
    catalog,
    oauth::{OAuthRefresher, OAuthToken},
    ContentPart, Message, ModelHandle,
};
use nexora_tools::{Tool, ToolRegistry};

use crate::{
    agent::{AgentError, AutoApprove, PermissionService, RunOptions, RunOutcome, SessionAgent},
    background::{BackgroundCompactor, BackgroundCompactorConfig},
    delegate::DelegateTool,
    events::AgentEvent,
    monitor::ResourceMonitor,
    pool::{DelegationPool, TaskSpec},
    session::{MessageStore, SessionStore},
};

/// Tool names available to delegated sub-agents.
const SUB_AGENT_TOOLS: &[&str] = &["glob", "grep", "view", "bash"];

/// External collaborators injected at construction time.
pub struct CoordinatorDeps {
    pub sessions: Arc<dyn SessionStore>,
    pub messages: Arc<dyn MessageStore>,
    pub permissions: Arc<dyn PermissionService>,
    /// The intrinsic tool catalogue (bash, view, edit, grep, ...).  Each
    /// entry is a panic-safe factory; one that panics or returns `None` is
    /// logged and dropped.
    pub intrinsic_tools: Vec<ToolFactory>,
    /// Tools contributed by MCP servers, filtered by the per-agent MCP
    /// allow-list during assembly.
    pub mcp_tools: Vec<ToolFactory>,
}

pub struct ToolFactory {
    pub label: String,
    pub build: Box<dyn FnOnce() -> Option<Arc<dyn Tool>> + Send>,
}

impl ToolFactory {
    pub fn from_tool(tool: Arc<dyn Tool>) -> Self {
        let label = tool.name().to_string();
        Self {
            label,
            build: Box::new(move || Some(tool)),
        }
    }
}

struct OAuthState {
    token: OAuthToken,
    refresher: Arc<dyn OAuthRefresher>,
}

pub struct Coordinator {
    config: Config,
    agent: Arc<SessionAgent>,
    pool: Arc<DelegationPool>,
    monitor: Arc<ResourceMonitor>,
    sessions: Arc<dyn SessionStore>,
    messages: Arc<dyn MessageStore>,
    background: Arc<BackgroundCompactor>,
    tools: tokio::sync::RwLock<Arc<ToolRegistry>>,
    models: tokio::sync::RwLock<(ModelHandle, ModelHandle)>,
    oauth: Mutex<Option<OAuthState>>,
}

impl Coordinator {
    /// Build the coordinator: models, tool catalogue, delegation pool, and
    /// the session agent.  Call [`Self::start`] afterwards to launch the
    /// background loops and register the delegation executor.
    pub fn new(config: Config, deps: CoordinatorDeps) -> anyhow::Result<Arc<Self>> {
        let large = build_large_model(&config)?;
        let summarizer = build_summarizer(&config).unwrap_or_else(|| large.clone());

        let pool = DelegationPool::new(config.delegation.clone());
        let tools = assemble_tools(
            &config.agent,
            deps.intrinsic_tools,
            deps.mcp_tools,
            Some(Arc::new(DelegateTool::new(Arc::clone(&pool)))),
        )?;
        let tools = Arc::new(tools);

        let background = Arc::new(BackgroundCompactor::new(BackgroundCompactorConfig::default()));
        let monitor = ResourceMonitor::new(config.resources.clone());
        pool.set_probe(monitor.clone());

        let agent = SessionAgent::with_recovery(
            large.clone(),
            summarizer.clone(),
            Arc::clone(&tools),
            Arc::clone(&deps.sessions),
            Arc::clone(&deps.messages),
            deps.permissions,
            config.agent.clone(),
            Arc::clone(&background),
            crate::recovery::default_registry(config.recovery.max_retries),
        );

        Ok(Arc::new(Self {
            config,
            agent,
            pool,
            monitor,
            sessions: deps.sessions,
            messages: deps.messages,
            background,
            tools: tokio::sync::RwLock::new(tools),
            models: tokio::sync::RwLock::new((large, summarizer)),
            oauth: Mutex::new(None),
        }))
    }

    /// Launch the delegation scheduler and the resource monitor, and wire
    /// the pool's executor to delegated sub-agent runs.
    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.pool.set_executor(Arc::new(move |spec: TaskSpec| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(coordinator) = weak.upgrade() else {
                    anyhow::bail!("coordinator shut down");
                };
                coordinator.run_delegated(spec).await
            })
        }));
        self.pool.start();
        let _ = self.monitor.start();
    }

    /// Stop background machinery.  Queued delegation tasks drain as
    /// cancelled; the resource monitor exits on its next tick.
    pub async fn stop(&self) {
        self.pool.stop().await;
        self.monitor.stop();
    }

    // ── Pass-through session-agent surface ────────────────────────────────────

    pub async fn run(
        self: &Arc<Self>,
        session_id: &str,
        prompt: &str,
        attachments: Vec<ContentPart>,
        options: RunOptions,
        events: mpsc::Sender<AgentEvent>,
    ) -> Result<RunOutcome, AgentError> {
        self.refresh_credentials().await?;
        // Auto-pause acts on the machine of the session being driven.
        self.monitor.attach_machine(self.agent.machine(session_id));
        self.agent
            .run(session_id, prompt, attachments, options, events)
            .await
    }

    /// Idle signal from the host: let the background compactor shrink this
    /// session's history.
    pub async fn on_idle(&self, session_id: &str) {
        self.agent.on_idle(session_id).await;
    }

    pub async fn summarize(
        &self,
        session_id: &str,
        events: mpsc::Sender<AgentEvent>,
    ) -> Result<Message, AgentError> {
        self.agent.summarize(session_id, events).await
    }

    pub fn cancel(&self, session_id: &str) {
        self.agent.cancel(session_id);
    }

    pub fn cancel_all(&self) {
        self.agent.cancel_all();
    }

    pub fn clear_queue(&self, session_id: &str) {
        self.agent.clear_queue(session_id);
    }

    pub fn is_busy(&self) -> bool {
        self.agent.is_busy()
    }

    pub fn is_session_busy(&self, session_id: &str) -> bool {
        self.agent.is_session_busy(session_id)
    }

    pub fn queued_prompts(&self, session_id: &str) -> Vec<String> {
        self.agent.queued_prompts(session_id)
    }

    pub fn agent(&self) -> &Arc<SessionAgent> {
        &self.agent
    }

    pub fn pool(&self) -> &Arc<DelegationPool> {
        &self.pool
    }

    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.monitor
    }

    pub async fn tools(&self) -> Arc<ToolRegistry> {
        self.tools.read().await.clone()
    }

    /// Rebuild both models from config and re-push the tool list, without
    /// losing any session state.
    pub async fn update_models(&self) -> anyhow::Result<()> {
        let large = build_large_model(&self.config)?;
        let summarizer = build_summarizer(&self.config).unwrap_or_else(|| large.clone());
        self.agent.set_models(large.clone(), summarizer.clone()).await;
        *self.models.write().await = (large, summarizer);
        let tools = self.tools.read().await.clone();
        self.agent.set_tools(tools).await;
        Ok(())
    }

    /// Reassemble the tool catalogue from fresh factories (e.g. after an MCP
    /// server change) and hand it to the agent.
    pub async fn update_tools(
        &self,
        intrinsic: Vec<ToolFactory>,
        mcp: Vec<ToolFactory>,
    ) -> anyhow::Result<()> {
        let tools = Arc::new(assemble_tools(
            &self.config.agent,
            intrinsic,
            mcp,
            Some(Arc::new(DelegateTool::new(Arc::clone(&self.pool)))),
        )?);
        *self.tools.write().await = Arc::clone(&tools);
        self.agent.set_tools(tools).await;
        Ok(())
    }

    // ── Credentials ───────────────────────────────────────────────────────────

    /// Install an OAuth credential and its refresher for the active provider.
    pub fn set_oauth(&self, token: OAuthToken, refresher: Arc<dyn OAuthRefresher>) {
        *self.oauth.lock() = Some(OAuthState { token, refresher });
    }

    /// Refresh the stored OAuth token if it has expired, rebuilding the
    /// models on success so the new credential is used.  Returns the refresh
    /// error to the caller on failure.
    async fn refresh_credentials(&self) -> Result<(), AgentError> {
        let (token, refresher) = {
            let state = self.oauth.lock();
            match state.as_ref() {
                Some(s) if s.token.is_expired() => (s.token.clone(), Arc::clone(&s.refresher)),
                _ => return Ok(()),
            }
        };
        debug!("refreshing expired provider credentials");
        let fresh = refresher
            .refresh(&token)
            .await
            .map_err(|e| AgentError::ProviderUnauthorized(e.to_string()))?;

        let access = fresh.access_token.clone();
        {
            let mut state = self.oauth.lock();
            if let Some(s) = state.as_mut() {
                s.token = fresh;
            }
        }
        // Rebuild models against the refreshed credential.
        let mut cfg = self.config.clone();
        cfg.model.api_key = Some(access);
        let large = build_large_model(&cfg).map_err(AgentError::Other)?;
        let summarizer = build_summarizer(&cfg).unwrap_or_else(|| large.clone());
        self.agent.set_models(large.clone(), summarizer.clone()).await;
        *self.models.write().await = (large, summarizer);
        Ok(())
    }

    // ── Delegated sub-agents ──────────────────────────────────────────────────

    /// Run one delegated task: create a child session, spawn a sub-agent
    /// with the reduced tool list, and fold the sub-session's cost into the
    /// parent on success.
    async fn run_delegated(self: &Arc<Self>, spec: TaskSpec) -> anyhow::Result<String> {
        let session = self
            .sessions
            .create_task_session(&spec.parent_session_id, &spec.description)
            .await
            .context("creating delegate session")?;

        let (model, summarizer) = self.models.read().await.clone();
        let sub_tools = self.sub_agent_tools().await?;
        let mut sub_config = self.config.agent.clone();
        // Sub-agents run unattended; the permission prompt has no user.
        sub_config.yolo_mode = true;
        sub_config.auto_summarize = false;

        let sub_agent = SessionAgent::with_recovery(
            model,
            summarizer,
            Arc::new(sub_tools),
            Arc::clone(&self.sessions),
            Arc::clone(&self.messages),
            Arc::new(AutoApprove),
            sub_config,
            Arc::clone(&self.background),
            crate::recovery::default_registry(self.config.recovery.max_retries),
        );

        let prompt = if spec.context.is_empty() {
            spec.description.clone()
        } else {
            format!("{}\n\nContext:\n{}", spec.description, spec.context)
        };
        let options = RunOptions {
            max_tokens: spec.max_tokens,
            ..RunOptions::default()
        };

        // Drain events so the sub-agent never blocks on a full channel.
        let (tx, mut rx) = mpsc::channel::<AgentEvent>(256);
        let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });

        let outcome = sub_agent
            .run(&session.id, &prompt, Vec::new(), options, tx)
            .await;
        drain.abort();

        match outcome {
            Ok(RunOutcome::Completed(turn)) => {
                self.credit_parent(&spec.parent_session_id, &session.id).await;
                Ok(turn.message.text())
            }
            Ok(RunOutcome::Queued { .. }) => {
                anyhow::bail!("delegate session unexpectedly busy")
            }
            Err(e) => Err(anyhow::anyhow!("sub-agent failed: {e}")),
        }
    }

    /// Parent session cost grows by the sub-session's accumulated cost.
    async fn credit_parent(&self, parent_id: &str, child_id: &str) {
        let child = match self.sessions.get(child_id).await {
            Ok(Some(c)) => c,
            _ => return,
        };
        if let Ok(Some(mut parent)) = self.sessions.get(parent_id).await {
            parent.cost += child.cost;
            if let Err(e) = self.sessions.update(&parent).await {
                warn!(error = %e, "failed to credit parent session");
            }
        }
    }

    /// Reduced registry handed to delegated sub-agents.
    async fn sub_agent_tools(&self) -> anyhow::Result<ToolRegistry> {
        let base = self.tools.read().await.clone();
        let mut registry = ToolRegistry::new();
        for name in SUB_AGENT_TOOLS {
            if let Some(tool) = base.get(name) {
                registry.register_arc(tool)?;
            }
        }
        Ok(registry)
    }
}

// ─── Model construction ───────────────────────────────────────────────────────

fn build_large_model(config: &Config) -> anyhow::Result<ModelHandle> {
    ModelHandle::build(&config.model, &provider_level_options(config, &config.model))
}

/// Provider-level options for the option merge: the named provider entry's
/// `provider_options`, when one matches the model's provider id.
fn provider_level_options(config: &Config, model: &ModelConfig) -> serde_json::Value {
    config
        .providers
        .get(&model.provider)
        .map(|p| p.provider_options.clone())
        .unwrap_or(serde_json::Value::Null)
}

/// Pick the fastest available summariser; `None` falls back to the large
/// model.  A provider is available when it is configured (or its canonical
/// key env var is set) and not disabled.
fn build_summarizer(config: &Config) -> Option<ModelHandle> {
    if let Some(small) = &config.small_model {
        if let Ok(handle) = ModelHandle::build(small, &provider_level_options(config, small)) {
            return Some(handle);
        }
    }
    let is_enabled = |provider: &str| -> bool {
        if let Some(p) = config.providers.get(provider) {
            return p.enabled;
        }
        nexora_model::get_provider(provider)
            .and_then(|meta| meta.default_api_key_env)
            .map(|env| std::env::var(env).is_ok())
            .unwrap_or(false)
    };
    let (provider, model) = catalog::pick_fast_summarizer(is_enabled)?;
    let mut cfg = config
        .providers
        .get(provider)
        .cloned()
        .unwrap_or_else(|| ModelConfig {
            provider: provider.to_string(),
            ..ModelConfig::default()
        });
    cfg.provider = provider.to_string();
    cfg.name = model.to_string();
    match ModelHandle::build(&cfg, &provider_level_options(config, &cfg)) {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(provider, error = %e, "fast summariser unavailable; falling back");
            None
        }
    }
}

// ─── Tool assembly ────────────────────────────────────────────────────────────

/// Assemble the tool list: the intrinsic catalogue plus allow-listed MCP
/// tools, all run through panic-safe factories, restricted by the agent's
/// allow-list, with the delegate tool included.  Duplicate names are
/// rejected inside the registry; the final listing is name-sorted.
fn assemble_tools(
    agent_config: &AgentConfig,
    intrinsic: Vec<ToolFactory>,
    mcp: Vec<ToolFactory>,
    delegate: Option<Arc<dyn Tool>>,
) -> anyhow::Result<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    for factory in intrinsic {
        registry.register_factory(&factory.label, factory.build);
    }
    if let Some(delegate) = delegate {
        if let Err(e) = registry.register_arc(delegate) {
            warn!(error = %e, "delegate tool rejected");
        }
    }
    for factory in mcp {
        let allowed = agent_config
            .mcp_allowed_tools
            .as_ref()
            .map(|list| list.iter().any(|n| n == &factory.label))
            .unwrap_or(true);
        if !allowed {
            debug!(tool = %factory.label, "MCP tool excluded by allow-list");
            continue;
        }
        registry.register_factory(&factory.label, factory.build);
    }
    if let Some(allowed) = &agent_config.allowed_tools {
        registry.retain(|name| allowed.iter().any(|n| n == name));
    }
    Ok(registry)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
