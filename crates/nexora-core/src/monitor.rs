// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Resource monitor: periodic CPU / memory / disk polling with threshold
//! violations and optional auto-pause of an attached state machine.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sysinfo::{Disks, System};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use nexora_config::ResourceConfig;

use crate::state::StateMachine;

const VIOLATION_RING: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Cpu,
    Memory,
    Disk,
}

#[derive(Debug, Clone)]
pub struct Violation {
    pub kind: ResourceKind,
    /// Observed value: percent for CPU/memory, free gigabytes for disk.
    pub value: f64,
    pub threshold: f64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceSnapshot {
    pub cpu_percent: f32,
    pub memory_used: u64,
    pub memory_total: u64,
    pub memory_percent: f32,
    pub memory_available: u64,
    pub disk_free: u64,
}

/// Read side consumed by the delegation pool's spawn gate.
pub trait ResourceProbe: Send + Sync {
    /// Latest snapshot, `None` until the first poll completes.
    fn snapshot(&self) -> Option<ResourceSnapshot>;
}

type ViolationCallback = Arc<dyn Fn(Violation) + Send + Sync>;

pub struct ResourceMonitor {
    config: ResourceConfig,
    snapshot: Mutex<Option<ResourceSnapshot>>,
    violations: Mutex<VecDeque<Violation>>,
    total_violations: AtomicUsize,
    callbacks: Mutex<Vec<ViolationCallback>>,
    machine: Mutex<Option<Arc<StateMachine>>>,
    cancel: CancellationToken,
}

impl ResourceMonitor {
    pub fn new(config: ResourceConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            snapshot: Mutex::new(None),
            violations: Mutex::new(VecDeque::new()),
            total_violations: AtomicUsize::new(0),
            callbacks: Mutex::new(Vec::new()),
            machine: Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    /// Attach the state machine auto-pause acts on.
    pub fn attach_machine(&self, machine: Arc<StateMachine>) {
        *self.machine.lock() = Some(machine);
    }

    pub fn on_violation(&self, callback: impl Fn(Violation) + Send + Sync + 'static) {
        self.callbacks.lock().push(Arc::new(callback));
    }

    pub fn violations(&self) -> Vec<Violation> {
        self.violations.lock().iter().cloned().collect()
    }

    pub fn violation_count(&self) -> usize {
        self.total_violations.load(Ordering::Relaxed)
    }

    /// Spawn the polling loop.  Stops when [`Self::stop`] cancels the token.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        let interval = Duration::from_secs(self.config.poll_interval_secs.max(1));
        tokio::spawn(async move {
            let mut system = System::new();
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = monitor.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let snapshot = poll(&mut system);
                        monitor.observe(snapshot);
                    }
                }
            }
            debug!("resource monitor stopped");
        })
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Evaluate one snapshot against the thresholds.  Public so tests can
    /// drive the monitor without a live system.
    pub fn observe(&self, snapshot: ResourceSnapshot) {
        *self.snapshot.lock() = Some(snapshot);

        let mut found: Vec<Violation> = Vec::new();
        if snapshot.cpu_percent > self.config.cpu_threshold {
            found.push(Violation {
                kind: ResourceKind::Cpu,
                value: snapshot.cpu_percent as f64,
                threshold: self.config.cpu_threshold as f64,
                at: Utc::now(),
            });
        }
        if snapshot.memory_percent > self.config.memory_threshold {
            found.push(Violation {
                kind: ResourceKind::Memory,
                value: snapshot.memory_percent as f64,
                threshold: self.config.memory_threshold as f64,
                at: Utc::now(),
            });
        }
        let min_free_bytes = self.config.min_free_disk_gb * 1024 * 1024 * 1024;
        if snapshot.disk_free < min_free_bytes {
            found.push(Violation {
                kind: ResourceKind::Disk,
                value: snapshot.disk_free as f64 / (1024.0 * 1024.0 * 1024.0),
                threshold: self.config.min_free_disk_gb as f64,
                at: Utc::now(),
            });
        }
        if found.is_empty() {
            return;
        }

        {
            let mut ring = self.violations.lock();
            for v in &found {
                warn!(kind = ?v.kind, value = v.value, threshold = v.threshold, "resource violation");
                ring.push_back(v.clone());
                if ring.len() > VIOLATION_RING {
                    ring.pop_front();
                }
            }
        }
        let total = self
            .total_violations
            .fetch_add(found.len(), Ordering::Relaxed)
            + found.len();

        // Callbacks run detached so a slow consumer cannot stall the poll
        // loop or deadlock against this monitor's locks.
        let callbacks: Vec<ViolationCallback> = self.callbacks.lock().clone();
        for v in found {
            for cb in &callbacks {
                let cb = Arc::clone(cb);
                let v = v.clone();
                tokio::spawn(async move { cb(v) });
            }
        }

        if self.config.enable_auto_pause && total >= self.config.max_violations {
            if let Some(machine) = self.machine.lock().clone() {
                warn!(total, "auto-pausing agent after repeated resource violations");
                machine.force_pause();
            }
        }
    }
}

impl ResourceProbe for ResourceMonitor {
    fn snapshot(&self) -> Option<ResourceSnapshot> {
        *self.snapshot.lock()
    }
}

fn poll(system: &mut System) -> ResourceSnapshot {
    system.refresh_cpu_usage();
    system.refresh_memory();
    let memory_total = system.total_memory();
    let memory_used = system.used_memory();
    let disks = Disks::new_with_refreshed_list();
    let disk_free = disks.iter().map(|d| d.available_space()).max().unwrap_or(0);
    ResourceSnapshot {
        cpu_percent: system.global_cpu_usage(),
        memory_used,
        memory_total,
        memory_percent: if memory_total > 0 {
            (memory_used as f64 / memory_total as f64 * 100.0) as f32
        } else {
            0.0
        },
        memory_available: system.available_memory(),
        disk_free,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
