// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Delegation pool: a bounded, resource-aware executor for sub-agent tasks.
//!
//! Tasks queue FIFO.  A 100 ms scheduler loop times out stale queued tasks
//! and spawns the head task whenever the admission gate permits.  Results
//! are retrieved move-on-wait: `wait` consumes the completion signal and the
//! stored task, so a result can be claimed exactly once.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use nexora_config::DelegationConfig;

use crate::monitor::ResourceProbe;

const SCHEDULER_TICK: Duration = Duration::from_millis(100);
const MIN_DYNAMIC: usize = 1;
const MAX_DYNAMIC: usize = 10;
const FALLBACK_CONCURRENCY: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

/// A delegated sub-agent task.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: Uuid,
    pub description: String,
    pub context: String,
    pub working_dir: Option<String>,
    pub max_tokens: Option<u32>,
    pub parent_session_id: String,
    pub status: TaskStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// The slice of a task handed to the executor.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub id: Uuid,
    pub description: String,
    pub context: String,
    pub working_dir: Option<String>,
    pub max_tokens: Option<u32>,
    pub parent_session_id: String,
}

pub type TaskExecutor =
    Arc<dyn Fn(TaskSpec) -> BoxFuture<'static, anyhow::Result<String>> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("unknown task: {0}")]
    UnknownTask(Uuid),
    #[error("task failed: {0}")]
    Failed(String),
    #[error("task cancelled")]
    Cancelled,
    #[error("queue timeout after {0:?}")]
    QueueTimeout(Duration),
    #[error("task is running; running tasks are only cancelled by stopping the pool")]
    Running,
}

#[derive(Default)]
struct PoolState {
    queue: VecDeque<Task>,
    running: HashMap<Uuid, Task>,
    completed: HashMap<Uuid, Task>,
    signals_tx: HashMap<Uuid, oneshot::Sender<()>>,
    signals_rx: HashMap<Uuid, oneshot::Receiver<()>>,
}

pub struct DelegationPool {
    config: DelegationConfig,
    state: Mutex<PoolState>,
    executor: Mutex<Option<TaskExecutor>>,
    probe: Mutex<Option<Arc<dyn ResourceProbe>>>,
    cancel: CancellationToken,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl DelegationPool {
    pub fn new(config: DelegationConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(PoolState::default()),
            executor: Mutex::new(None),
            probe: Mutex::new(None),
            cancel: CancellationToken::new(),
            scheduler: Mutex::new(None),
        })
    }

    /// Register the function that actually runs a sub-agent.
    pub fn set_executor(&self, executor: TaskExecutor) {
        *self.executor.lock() = Some(executor);
    }

    /// Attach the resource probe consulted by the spawn gate and the dynamic
    /// concurrency computation.
    pub fn set_probe(&self, probe: Arc<dyn ResourceProbe>) {
        *self.probe.lock() = Some(probe);
    }

    /// Start the scheduler loop.
    pub fn start(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SCHEDULER_TICK);
            loop {
                tokio::select! {
                    _ = pool.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        pool.expire_stale_queued();
                        pool.try_spawn();
                    }
                }
            }
            debug!("delegation scheduler stopped");
        });
        *self.scheduler.lock() = Some(handle);
    }

    /// Enqueue a task.  Returns its ID; retrieve the result with [`wait`].
    ///
    /// [`wait`]: Self::wait
    pub fn submit(
        &self,
        description: impl Into<String>,
        context: impl Into<String>,
        working_dir: Option<String>,
        max_tokens: Option<u32>,
        parent_session_id: impl Into<String>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let task = Task {
            id,
            description: description.into(),
            context: context.into(),
            working_dir,
            max_tokens,
            parent_session_id: parent_session_id.into(),
            status: TaskStatus::Queued,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        state.signals_tx.insert(id, tx);
        state.signals_rx.insert(id, rx);
        state.queue.push_back(task);
        debug!(task_id = %id, "delegation task queued");
        id
    }

    /// Block until the task completes, then hand its result to the caller.
    ///
    /// The task is removed from the completed map on return; a second wait
    /// for the same ID fails with `UnknownTask`.
    pub async fn wait(&self, id: Uuid) -> Result<String, PoolError> {
        let rx = {
            let mut state = self.state.lock();
            state.signals_rx.remove(&id)
        };
        match rx {
            Some(rx) => {
                // The sender side fires (or is dropped) exactly when the task
                // reaches the completed map.
                let _ = rx.await;
            }
            None => {
                // Signal already consumed or never existed; fall through to
                // the completed map for a precise error.
            }
        }
        let task = {
            let mut state = self.state.lock();
            state.completed.remove(&id)
        };
        let task = task.ok_or(PoolError::UnknownTask(id))?;
        match task.status {
            TaskStatus::Completed => Ok(task.result.unwrap_or_default()),
            TaskStatus::Failed => Err(PoolError::Failed(
                task.error.unwrap_or_else(|| "unknown error".into()),
            )),
            TaskStatus::Cancelled => Err(PoolError::Cancelled),
            TaskStatus::Timeout => Err(PoolError::QueueTimeout(Duration::from_secs(
                self.config.queue_timeout_secs,
            ))),
            TaskStatus::Queued | TaskStatus::Running => {
                // Unreachable: the signal fires only after completion.
                Err(PoolError::UnknownTask(id))
            }
        }
    }

    /// Cancel a still-queued task.  Running tasks cannot be cancelled
    /// individually; stop the pool instead.
    pub fn cancel_task(&self, id: Uuid) -> Result<(), PoolError> {
        let mut state = self.state.lock();
        if let Some(pos) = state.queue.iter().position(|t| t.id == id) {
            let mut task = state.queue.remove(pos).expect("position just found");
            task.status = TaskStatus::Cancelled;
            task.completed_at = Some(Utc::now());
            finish(&mut state, task);
            return Ok(());
        }
        if state.running.contains_key(&id) {
            return Err(PoolError::Running);
        }
        Err(PoolError::UnknownTask(id))
    }

    /// Stop the pool: cancel the scheduler, drain the queue (every queued
    /// task becomes Cancelled), and wait for the scheduler task.
    pub async fn stop(&self) {
        self.cancel.cancel();
        {
            let mut state = self.state.lock();
            while let Some(mut task) = state.queue.pop_front() {
                task.status = TaskStatus::Cancelled;
                task.completed_at = Some(Utc::now());
                finish(&mut state, task);
            }
        }
        let handle = self.scheduler.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn queued_count(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn running_count(&self) -> usize {
        self.state.lock().running.len()
    }

    /// Running delegate tasks for one parent session.
    pub fn running_for_parent(&self, parent_session_id: &str) -> usize {
        self.state
            .lock()
            .running
            .values()
            .filter(|t| t.parent_session_id == parent_session_id)
            .count()
    }

    /// Effective concurrency ceiling.  Zero configured selects dynamic
    /// sizing from the resource probe, clamped to [1, 10]; without a probe
    /// the fallback is 3.
    pub fn max_concurrent(&self) -> usize {
        if self.config.max_concurrent > 0 {
            return self.config.max_concurrent;
        }
        let snapshot = self.probe.lock().as_ref().and_then(|p| p.snapshot());
        let Some(snap) = snapshot else {
            return FALLBACK_CONCURRENCY;
        };
        let available_cpu = (100.0 - snap.cpu_percent).max(0.0);
        let by_cpu = (available_cpu / self.config.per_agent_cpu_percent) as usize;
        let available_mb = snap.memory_available / (1024 * 1024);
        let by_mem = available_mb.saturating_sub(self.config.min_free_memory_mb) as usize
            / self.config.per_agent_memory_mb.max(1) as usize;
        by_cpu.min(by_mem).clamp(MIN_DYNAMIC, MAX_DYNAMIC)
    }

    /// Admission gate for spawning one more sub-agent.  Counts are passed in
    /// by the scheduler, which already holds the state lock.
    fn can_spawn(&self, running: usize, running_for_parent: usize) -> bool {
        if running >= self.max_concurrent() {
            return false;
        }
        if running_for_parent >= self.config.per_parent_cap {
            return false;
        }
        let snapshot = self.probe.lock().as_ref().and_then(|p| p.snapshot());
        if let Some(snap) = snapshot {
            let cpu_ceiling =
                100.0 - self.config.min_free_cpu_percent - self.config.per_agent_cpu_percent;
            if snap.cpu_percent > cpu_ceiling {
                return false;
            }
            let needed_mb = self.config.min_free_memory_mb + self.config.per_agent_memory_mb;
            if snap.memory_available / (1024 * 1024) < needed_mb {
                return false;
            }
        }
        true
    }

    fn expire_stale_queued(&self) {
        let timeout = chrono::Duration::seconds(self.config.queue_timeout_secs as i64);
        let now = Utc::now();
        let mut state = self.state.lock();
        let mut idx = 0;
        while idx < state.queue.len() {
            if now - state.queue[idx].created_at > timeout {
                let mut task = state.queue.remove(idx).expect("index in bounds");
                warn!(task_id = %task.id, "delegation task timed out in queue");
                task.status = TaskStatus::Timeout;
                task.error = Some(format!(
                    "queue timeout after {}s",
                    self.config.queue_timeout_secs
                ));
                task.completed_at = Some(now);
                finish(&mut state, task);
            } else {
                idx += 1;
            }
        }
    }

    /// Pop the head task when the gate permits and hand it to the executor.
    fn try_spawn(self: &Arc<Self>) {
        loop {
            let executor = match self.executor.lock().clone() {
                Some(e) => e,
                None => return,
            };
            let spec = {
                let mut state = self.state.lock();
                let Some(head) = state.queue.front() else { return };
                let same_parent = state
                    .running
                    .values()
                    .filter(|t| t.parent_session_id == head.parent_session_id)
                    .count();
                if !self.can_spawn(state.running.len(), same_parent) {
                    return;
                }
                let mut task = state.queue.pop_front().expect("head just observed");
                task.status = TaskStatus::Running;
                task.started_at = Some(Utc::now());
                let spec = TaskSpec {
                    id: task.id,
                    description: task.description.clone(),
                    context: task.context.clone(),
                    working_dir: task.working_dir.clone(),
                    max_tokens: task.max_tokens,
                    parent_session_id: task.parent_session_id.clone(),
                };
                state.running.insert(task.id, task);
                spec
            };

            debug!(task_id = %spec.id, "delegation task spawned");
            let pool = Arc::clone(self);
            let id = spec.id;
            tokio::spawn(async move {
                let outcome = executor(spec).await;
                let mut state = pool.state.lock();
                if let Some(mut task) = state.running.remove(&id) {
                    task.completed_at = Some(Utc::now());
                    match outcome {
                        Ok(result) => {
                            task.status = TaskStatus::Completed;
                            task.result = Some(result);
                        }
                        Err(e) => {
                            task.status = TaskStatus::Failed;
                            task.error = Some(e.to_string());
                        }
                    }
                    finish(&mut state, task);
                }
            });
        }
    }
}

/// Move a task into the completed map and fire its completion signal.
fn finish(state: &mut PoolState, task: Task) {
    let id = task.id;
    state.completed.insert(id, task);
    if let Some(tx) = state.signals_tx.remove(&id) {
        let _ = tx.send(());
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{ResourceProbe, ResourceSnapshot};

    struct FixedProbe(ResourceSnapshot);

    impl ResourceProbe for FixedProbe {
        fn snapshot(&self) -> Option<ResourceSnapshot> {
            Some(self.0)
        }
    }

    fn idle_snapshot() -> ResourceSnapshot {
        ResourceSnapshot {
            cpu_percent: 5.0,
            memory_used: 4 << 30,
            memory_total: 32 << 30,
            memory_percent: 12.5,
            memory_available: 24 << 30,
            disk_free: 100 << 30,
        }
    }

    fn busy_snapshot() -> ResourceSnapshot {
        ResourceSnapshot {
            cpu_percent: 99.0,
            memory_used: 31 << 30,
            memory_total: 32 << 30,
            memory_percent: 97.0,
            memory_available: 256 << 20,
            disk_free: 100 << 30,
        }
    }

    fn config(max_concurrent: usize, queue_timeout_secs: u64) -> DelegationConfig {
        DelegationConfig {
            max_concurrent,
            queue_timeout_secs,
            ..DelegationConfig::default()
        }
    }

    fn echo_executor() -> TaskExecutor {
        Arc::new(|spec: TaskSpec| {
            Box::pin(async move { anyhow::Ok(format!("{} result", spec.description)) })
        })
    }

    #[tokio::test]
    async fn fifo_execution_and_move_on_wait() {
        let pool = DelegationPool::new(config(1, 300));
        pool.set_executor(echo_executor());
        pool.start();

        let a = pool.submit("A", "", None, None, "parent");
        let b = pool.submit("B", "", None, None, "parent");
        let c = pool.submit("C", "", None, None, "parent");

        assert_eq!(pool.wait(a).await.unwrap(), "A result");
        assert_eq!(pool.wait(b).await.unwrap(), "B result");
        assert_eq!(pool.wait(c).await.unwrap(), "C result");

        // Move-on-wait: a second retrieval must fail.
        assert!(matches!(pool.wait(a).await, Err(PoolError::UnknownTask(_))));
        pool.stop().await;
    }

    #[tokio::test]
    async fn never_exceeds_max_concurrent() {
        let pool = DelegationPool::new(config(2, 300));
        let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let live = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let (peak_c, live_c) = (Arc::clone(&peak), Arc::clone(&live));
        pool.set_executor(Arc::new(move |_spec: TaskSpec| {
            let peak = Arc::clone(&peak_c);
            let live = Arc::clone(&live_c);
            Box::pin(async move {
                let now = live.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                peak.fetch_max(now, std::sync::atomic::Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(150)).await;
                live.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                anyhow::Ok("done".to_string())
            })
        }));
        pool.start();

        let ids: Vec<Uuid> = (0..6)
            .map(|i| pool.submit(format!("t{i}"), "", None, None, "parent"))
            .collect();
        for id in ids {
            pool.wait(id).await.unwrap();
        }
        assert!(
            peak.load(std::sync::atomic::Ordering::SeqCst) <= 2,
            "ran more than max_concurrent at once"
        );
        pool.stop().await;
    }

    #[tokio::test]
    async fn queue_timeout_fires_when_gate_blocks() {
        // Dynamic sizing with a saturated machine: the gate never opens.
        let pool = DelegationPool::new(config(0, 0));
        pool.set_executor(echo_executor());
        pool.set_probe(Arc::new(FixedProbe(busy_snapshot())));
        pool.start();

        let id = pool.submit("doomed", "", None, None, "parent");
        let started = std::time::Instant::now();
        let err = pool.wait(id).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(
            err.to_string().contains("queue timeout"),
            "unexpected error: {err}"
        );
        pool.stop().await;
    }

    #[tokio::test]
    async fn cancel_queued_task() {
        let pool = DelegationPool::new(config(1, 300));
        // No executor registered: tasks stay queued.
        pool.start();
        let id = pool.submit("task", "", None, None, "parent");
        pool.cancel_task(id).unwrap();
        assert!(matches!(pool.wait(id).await, Err(PoolError::Cancelled)));
        pool.stop().await;
    }

    #[tokio::test]
    async fn cancel_unknown_task_errors() {
        let pool = DelegationPool::new(config(1, 300));
        assert!(matches!(
            pool.cancel_task(Uuid::new_v4()),
            Err(PoolError::UnknownTask(_))
        ));
    }

    #[tokio::test]
    async fn stop_drains_queue_as_cancelled() {
        let pool = DelegationPool::new(config(1, 300));
        pool.start();
        let a = pool.submit("a", "", None, None, "parent");
        let b = pool.submit("b", "", None, None, "parent");
        pool.stop().await;
        assert!(matches!(pool.wait(a).await, Err(PoolError::Cancelled)));
        assert!(matches!(pool.wait(b).await, Err(PoolError::Cancelled)));
    }

    #[tokio::test]
    async fn executor_failure_surfaces_in_wait() {
        let pool = DelegationPool::new(config(1, 300));
        pool.set_executor(Arc::new(|_spec: TaskSpec| {
            Box::pin(async { anyhow::bail!("sub-agent exploded") })
        }));
        pool.start();
        let id = pool.submit("bad", "", None, None, "parent");
        let err = pool.wait(id).await.unwrap_err();
        assert!(err.to_string().contains("sub-agent exploded"));
        pool.stop().await;
    }

    // ── Dynamic concurrency ───────────────────────────────────────────────────

    #[test]
    fn dynamic_concurrency_without_probe_is_three() {
        let pool = DelegationPool::new(config(0, 300));
        assert_eq!(pool.max_concurrent(), FALLBACK_CONCURRENCY);
    }

    #[test]
    fn dynamic_concurrency_clamped_to_ten() {
        let pool = DelegationPool::new(config(0, 300));
        pool.set_probe(Arc::new(FixedProbe(idle_snapshot())));
        // 95 free cpu / 12 per agent ≈ 7; 24 GiB avail gives far more by
        // memory, so CPU binds.
        assert_eq!(pool.max_concurrent(), 7);
    }

    #[test]
    fn dynamic_concurrency_floors_at_one() {
        let pool = DelegationPool::new(config(0, 300));
        pool.set_probe(Arc::new(FixedProbe(busy_snapshot())));
        assert_eq!(pool.max_concurrent(), 1);
    }

    #[test]
    fn explicit_max_concurrent_wins() {
        let pool = DelegationPool::new(config(4, 300));
        pool.set_probe(Arc::new(FixedProbe(busy_snapshot())));
        assert_eq!(pool.max_concurrent(), 4);
    }

    // ── Per-parent cap ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn per_parent_cap_blocks_same_parent() {
        let mut cfg = config(10, 300);
        cfg.per_parent_cap = 1;
        let pool = DelegationPool::new(cfg);
        pool.set_executor(Arc::new(|_spec: TaskSpec| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                anyhow::Ok("slow".to_string())
            })
        }));
        pool.start();

        let a = pool.submit("a", "", None, None, "parent-1");
        let b = pool.submit("b", "", None, None, "parent-1");
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(
            pool.running_for_parent("parent-1"),
            1,
            "second task must wait for the per-parent slot"
        );
        pool.wait(a).await.unwrap();
        pool.wait(b).await.unwrap();
        pool.stop().await;
    }
}
