//! Polling loop that runs one agent against the blackboard.

use super::{Agent, AgentContext};
use crate::types::{Task, TaskStatus};
use anyhow::Result;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Recorded on tasks refused because their pipeline stopped or ran out of budget.
pub const SKIPPED_REASON: &str = "skipped: pipeline budget exhausted or pipeline finished";

/// Reported state of one agent runtime.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub name: String,
    pub display_name: String,
    pub running: bool,
    pub capabilities: Vec<String>,
    pub current_task: Option<i64>,
    pub processed: u64,
    pub failed: u64,
}

struct RuntimeState {
    running: AtomicBool,
    /// Bumped by every `start`; only the newest loop clears `running`.
    generation: AtomicU64,
    /// Task being processed, 0 when idle.
    current_task: AtomicI64,
    processed: AtomicU64,
    failed: AtomicU64,
}

/// Drives one agent: poll, claim, process inside a failure boundary.
///
/// Each runtime runs a single loop, so an agent handles one task at a time.
/// Separate runtimes run concurrently and only coordinate through claims.
pub struct AgentRuntime {
    agent: Arc<dyn Agent>,
    cx: Arc<AgentContext>,
    poll_interval: Duration,
    state: Arc<RuntimeState>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AgentRuntime {
    pub fn new(agent: Arc<dyn Agent>, cx: AgentContext, poll_interval: Duration) -> Self {
        Self {
            agent,
            cx: Arc::new(cx),
            poll_interval,
            state: Arc::new(RuntimeState {
                running: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                current_task: AtomicI64::new(0),
                processed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
            shutdown: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.agent.name()
    }

    /// Spawn the polling loop. Calling `start` on a running runtime is a no-op;
    /// after `stop` it spawns a fresh loop even if the old one is still draining.
    pub fn start(&self) {
        let mut shutdown = self.shutdown.lock().unwrap();
        if shutdown.is_some() {
            return;
        }
        let generation = self.state.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.running.store(true, Ordering::SeqCst);

        let (tx, mut rx) = watch::channel(false);
        let agent = self.agent.clone();
        let cx = self.cx.clone();
        let state = self.state.clone();
        let interval = self.poll_interval;

        let handle = tokio::spawn(async move {
            info!(agent = agent.name(), interval_ms = interval.as_millis() as u64, "Agent started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = rx.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = poll(&agent, &cx, &state).await {
                            warn!(agent = agent.name(), error = %e, "Poll failed");
                        }
                    }
                }
                if *rx.borrow() {
                    break;
                }
            }

            if state.generation.load(Ordering::SeqCst) == generation {
                state.running.store(false, Ordering::SeqCst);
            }
            info!(agent = agent.name(), "Agent stopped");
        });

        *shutdown = Some(tx);
        *self.handle.lock().unwrap() = Some(handle);
    }

    /// Cancel the next scheduled wake-up. A task already being processed
    /// runs to completion first.
    pub fn stop(&self) {
        if let Some(tx) = self.shutdown.lock().unwrap().take() {
            let _ = tx.send(true);
        }
    }

    /// Stop and wait for the loop to exit.
    pub async fn shutdown(&self) {
        self.stop();
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            error!(agent = self.agent.name(), error = %e, "Agent loop panicked");
        }
        if self.shutdown.lock().unwrap().is_none() {
            self.state.running.store(false, Ordering::SeqCst);
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    /// Run a single poll iteration. Returns the id of the task processed, if any.
    pub async fn poll_once(&self) -> Result<Option<i64>> {
        poll(&self.agent, &self.cx, &self.state).await
    }

    pub fn status(&self) -> AgentStatus {
        let current = self.state.current_task.load(Ordering::Relaxed);
        AgentStatus {
            name: self.agent.name().to_string(),
            display_name: self.agent.display_name().to_string(),
            running: self.is_running(),
            capabilities: self
                .agent
                .capabilities()
                .iter()
                .map(|c| c.to_string())
                .collect(),
            current_task: (current > 0).then_some(current),
            processed: self.state.processed.load(Ordering::Relaxed),
            failed: self.state.failed.load(Ordering::Relaxed),
        }
    }
}

async fn poll(
    agent: &Arc<dyn Agent>,
    cx: &Arc<AgentContext>,
    state: &RuntimeState,
) -> Result<Option<i64>> {
    let name = agent.name();
    let candidates = cx.services.db.get_pending_tasks_for_agent(name)?;

    for task in candidates.into_iter().filter(|t| agent.can_handle(t)) {
        if !cx.services.db.claim_task(task.id, name)? {
            debug!(agent = name, task_id = task.id, "Claim lost");
            continue;
        }
        let task = cx.services.db.get_task(task.id)?.unwrap_or(task);
        state.current_task.store(task.id, Ordering::Relaxed);
        let ok = run_claimed(agent.clone(), cx.clone(), task.clone()).await;
        state.current_task.store(0, Ordering::Relaxed);
        state.processed.fetch_add(1, Ordering::Relaxed);
        if !ok {
            state.failed.fetch_add(1, Ordering::Relaxed);
        }
        return Ok(Some(task.id));
    }
    Ok(None)
}

/// Process a claimed task. Errors and panics are routed to `fail_task` and
/// the coordinator; they never escape. Returns whether processing succeeded.
async fn run_claimed(agent: Arc<dyn Agent>, cx: Arc<AgentContext>, task: Task) -> bool {
    let name = agent.name();
    let coordinator = cx.services.coordinator.clone();
    let db = cx.services.db.clone();

    if !coordinator.admit(&task) {
        info!(agent = name, task_id = task.id, "Pipeline cannot run more work; closing task");
        if let Err(e) = db.fail_task(task.id, name, SKIPPED_REASON) {
            warn!(agent = name, task_id = task.id, error = %e, "Failed to close refused task");
        }
        return false;
    }

    if let Err(e) = db.start_task(task.id, name) {
        warn!(agent = name, task_id = task.id, error = %e, "Failed to mark task running");
    }
    coordinator.invocation_started(&task);
    info!(agent = name, task_id = task.id, title = %task.title, "Processing task");

    let started = Instant::now();
    let worker = {
        let agent = agent.clone();
        let cx = cx.clone();
        let task = task.clone();
        tokio::spawn(async move { agent.process(&task, &cx).await })
    };
    let outcome = match worker.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(join_err) if join_err.is_panic() => Err("agent panicked while processing".to_string()),
        Err(join_err) => Err(format!("agent task aborted: {}", join_err)),
    };
    let duration_ms = started.elapsed().as_millis() as i64;

    let ok = match outcome {
        Ok(()) => {
            // Agents normally complete their own task; close it if they did not.
            if let Ok(Some(current)) = db.get_task(task.id)
                && current.status.is_owned()
                && let Err(e) = db.complete_task(task.id, name, None)
            {
                warn!(agent = name, task_id = task.id, error = %e, "Failed to complete task");
            }
            info!(agent = name, task_id = task.id, duration_ms, "Task processed");
            true
        }
        Err(reason) => {
            error!(agent = name, task_id = task.id, duration_ms, %reason, "Task failed");
            let still_owned = matches!(
                db.get_task(task.id),
                Ok(Some(ref t)) if t.status == TaskStatus::Claimed || t.status == TaskStatus::Running
            );
            if still_owned && let Err(e) = db.fail_task(task.id, name, &reason) {
                warn!(agent = name, task_id = task.id, error = %e, "Failed to record task failure");
            }
            coordinator.task_failed(&task, &reason);
            false
        }
    };

    coordinator.invocation_finished(&task, duration_ms);
    ok
}
