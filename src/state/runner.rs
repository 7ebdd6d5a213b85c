//! Task dispatch: runs ready tasks concurrently, rolls back failed changes,
//! and handles abort, retry and pruning.

use super::store::{Graph, State};
use super::task::{LogLevel, Status, Task};
use crate::error::{StateError, TaskError};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Executes tasks of one kind.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Perform the task. Must be idempotent: a task interrupted by a daemon
    /// restart runs again from the start.
    async fn run(&self, ctx: TaskContext) -> Result<(), TaskError>;

    /// Revert a completed task. Only called when [`can_undo`] is true.
    ///
    /// [`can_undo`]: TaskHandler::can_undo
    async fn undo(&self, _ctx: TaskContext) -> Result<(), TaskError> {
        Ok(())
    }

    fn can_undo(&self) -> bool {
        false
    }

    /// Tasks with the same key never run at the same time.
    fn exclusive_key(&self, _task: &Task) -> Option<String> {
        None
    }
}

/// What a running handler gets to see of its task.
#[derive(Clone)]
pub struct TaskContext {
    state: State,
    task_id: String,
    change_id: String,
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn change_id(&self) -> &str {
        &self.change_id
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    /// Cancelled when the change is aborted or the runner stops.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn log(&self, message: impl Into<String>) {
        self.state
            .lock()
            .log_task(&self.task_id, LogLevel::Info, message);
    }

    pub fn log_error(&self, message: impl Into<String>) {
        self.state
            .lock()
            .log_task(&self.task_id, LogLevel::Error, message);
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, StateError> {
        let st = self.state.lock();
        let task = st
            .task(&self.task_id)
            .ok_or_else(|| StateError::NoTask(self.task_id.clone()))?;
        task.get(key)
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StateError> {
        self.state.lock().set_task_data(&self.task_id, key, value)
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub prune_interval: Duration,
    /// Ready changes older than this are dropped.
    pub prune_age: Duration,
    /// Changes not ready after this long are aborted.
    pub abort_age: Duration,
    pub max_ready_changes: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            prune_interval: Duration::from_secs(10 * 60),
            prune_age: Duration::from_secs(7 * 24 * 3600),
            abort_age: Duration::from_secs(14 * 24 * 3600),
            max_ready_changes: 500,
        }
    }
}

struct Running {
    key: Option<String>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

pub struct TaskRunner {
    state: State,
    config: RunnerConfig,
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
    running: Mutex<HashMap<String, Running>>,
    stopping: AtomicBool,
}

impl TaskRunner {
    pub fn new(state: State, config: RunnerConfig) -> Self {
        Self {
            state,
            config,
            handlers: HashMap::new(),
            running: Mutex::new(HashMap::new()),
            stopping: AtomicBool::new(false),
        }
    }

    pub fn add_handler(&mut self, kind: &str, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(kind.to_string(), handler);
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    /// Drive tasks until `cancel` fires, then stop running handlers.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut revision = self.state.subscribe();
        let mut prune = tokio::time::interval(self.config.prune_interval);
        prune.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let next = self.dispatch();
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = revision.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(until(next)) => {}
                _ = prune.tick() => self.prune(),
            }
        }
        self.stop().await;
    }

    /// Dispatch tasks until nothing is left to do.
    pub async fn settle(self: &Arc<Self>, timeout: Duration) -> Result<(), StateError> {
        let mut revision = self.state.subscribe();
        let settle = async {
            loop {
                let next = self.dispatch();
                if self.is_quiescent() {
                    return;
                }
                tokio::select! {
                    _ = revision.changed() => {}
                    _ = tokio::time::sleep(until(next)) => {}
                }
            }
        };
        tokio::time::timeout(timeout, settle)
            .await
            .map_err(|_| StateError::SettleTimeout(timeout))
    }

    fn is_quiescent(&self) -> bool {
        if !self.running.lock().expect("runner lock poisoned").is_empty() {
            return false;
        }
        let st = self.state.lock();
        st.task_ids().iter().all(|id| {
            st.task(id).map_or(true, |t| {
                !matches!(
                    t.status,
                    Status::Do | Status::Doing | Status::Undo | Status::Undoing | Status::Wait
                )
            })
        })
    }

    /// Cancel running handlers and wait for them to return. Tasks cut short
    /// this way stay in Doing and are resumed on the next start.
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        let handles: Vec<JoinHandle<()>> = {
            let mut running = self.running.lock().expect("runner lock poisoned");
            running
                .values_mut()
                .filter_map(|r| {
                    r.cancel.cancel();
                    r.handle.take()
                })
                .collect()
        };
        debug!(tasks = handles.len(), "Waiting for running tasks");
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Abort a change: cancel its running tasks, hold pending ones and undo
    /// completed ones.
    pub fn abort(&self, change_id: &str) -> Result<(), StateError> {
        let mut st = self.state.lock();
        let change = st
            .change(change_id)
            .ok_or_else(|| StateError::NoChange(change_id.to_string()))?;
        if change.is_ready() {
            return Err(StateError::AlreadyReady(change_id.to_string()));
        }
        let doing = st.abort_change(change_id)?;
        self.cancel_tasks(&doing);
        info!(change = change_id, "Change aborted");
        Ok(())
    }

    fn cancel_tasks(&self, ids: &[String]) {
        let running = self.running.lock().expect("runner lock poisoned");
        for id in ids {
            if let Some(task) = running.get(id) {
                task.cancel.cancel();
            }
        }
    }

    pub fn prune(&self) {
        let to_abort = self.state.lock().prune(
            Utc::now(),
            self.config.prune_age,
            self.config.abort_age,
            self.config.max_ready_changes,
        );
        for id in to_abort {
            warn!(change = %id, "Aborting change that never finished");
            if let Err(e) = self.abort(&id) {
                warn!(change = %id, "Cannot abort change: {}", e);
            }
        }
    }

    /// Start every task that can run now. Returns when the next waiting task
    /// becomes due, if any.
    fn dispatch(self: &Arc<Self>) -> Option<DateTime<Utc>> {
        if self.stopping.load(Ordering::SeqCst) {
            return None;
        }
        let mut st = self.state.lock();
        let mut running = self.running.lock().expect("runner lock poisoned");
        let mut busy: HashSet<String> = running.values().filter_map(|r| r.key.clone()).collect();
        let now = Utc::now();
        let mut next_wake: Option<DateTime<Utc>> = None;

        for id in st.task_ids() {
            if running.contains_key(&id) {
                continue;
            }
            let Some(task) = st.task(&id).cloned() else {
                continue;
            };
            match task.status {
                Status::Wait => match task.at_time {
                    Some(at) if at > now => {
                        next_wake = Some(next_wake.map_or(at, |t| t.min(at)));
                    }
                    _ => {
                        st.set_status(&id, Status::Do);
                        next_wake = Some(now);
                    }
                },
                Status::Do => {
                    let mut blocked = false;
                    let mut unreachable = false;
                    for wait in &task.wait_tasks {
                        match st.task(wait).map(|t| t.status) {
                            Some(Status::Done) | None => {}
                            Some(s) if s.is_ready() => unreachable = true,
                            Some(_) => blocked = true,
                        }
                    }
                    if unreachable {
                        st.log_task(&id, LogLevel::Info, "Held: a prerequisite did not complete");
                        st.set_status(&id, Status::Hold);
                        continue;
                    }
                    if blocked {
                        continue;
                    }
                    let Some(handler) = self.handlers.get(&task.kind).cloned() else {
                        let message = StateError::NoHandler(task.kind.clone()).to_string();
                        st.fail_task(&id, &message);
                        if let Ok(doing) = st.abort_change(&task.change) {
                            for other in doing {
                                if let Some(r) = running.get(&other) {
                                    r.cancel.cancel();
                                }
                            }
                        }
                        continue;
                    };
                    let key = handler.exclusive_key(&task);
                    if key.as_ref().is_some_and(|k| busy.contains(k)) {
                        continue;
                    }
                    if let Some(key) = &key {
                        busy.insert(key.clone());
                    }
                    self.spawn(&mut st, &mut running, &task, handler, key, false);
                }
                Status::Undo => {
                    if !undo_turn(&st, &task) {
                        continue;
                    }
                    let handler = match self.handlers.get(&task.kind) {
                        Some(handler) if handler.can_undo() => Arc::clone(handler),
                        _ => {
                            st.set_status(&id, Status::Undone);
                            continue;
                        }
                    };
                    let key = handler.exclusive_key(&task);
                    if key.as_ref().is_some_and(|k| busy.contains(k)) {
                        continue;
                    }
                    if let Some(key) = &key {
                        busy.insert(key.clone());
                    }
                    self.spawn(&mut st, &mut running, &task, handler, key, true);
                }
                _ => {}
            }
        }
        next_wake
    }

    fn spawn(
        self: &Arc<Self>,
        st: &mut Graph,
        running: &mut HashMap<String, Running>,
        task: &Task,
        handler: Arc<dyn TaskHandler>,
        key: Option<String>,
        undo: bool,
    ) {
        st.set_status(&task.id, if undo { Status::Undoing } else { Status::Doing });
        debug!(task = %task.id, kind = %task.kind, undo, "Dispatching task");

        let cancel = CancellationToken::new();
        let ctx = TaskContext {
            state: self.state.clone(),
            task_id: task.id.clone(),
            change_id: task.change.clone(),
            cancel: cancel.clone(),
        };
        let runner = Arc::clone(self);
        let task_id = task.id.clone();
        let handle = tokio::spawn(async move {
            let result = if undo {
                handler.undo(ctx).await
            } else {
                handler.run(ctx).await
            };
            runner.finish(&task_id, undo, result);
        });
        running.insert(
            task.id.clone(),
            Running {
                key,
                cancel,
                handle: Some(handle),
            },
        );
    }

    fn finish(&self, task_id: &str, undo: bool, result: Result<(), TaskError>) {
        let mut st = self.state.lock();
        self.running
            .lock()
            .expect("runner lock poisoned")
            .remove(task_id);

        if self.stopping.load(Ordering::SeqCst) && matches!(result, Err(TaskError::Aborted)) {
            return;
        }
        let Some(change_id) = st.task(task_id).map(|t| t.change.clone()) else {
            return;
        };
        let aborting = st.change(&change_id).is_some_and(|c| c.aborting);

        match (undo, result) {
            (false, Ok(())) => {
                st.set_status(task_id, Status::Done);
                if aborting {
                    st.set_status(task_id, Status::Undo);
                }
            }
            (false, Err(TaskError::Retry { after, reason })) => {
                if aborting {
                    st.log_task(task_id, LogLevel::Info, reason);
                    st.set_status(task_id, Status::Hold);
                } else {
                    st.log_task(
                        task_id,
                        LogLevel::Info,
                        format!("{reason}; will retry in {after:?}"),
                    );
                    let after = ChronoDuration::from_std(after).unwrap_or(ChronoDuration::zero());
                    st.set_wait(task_id, Utc::now() + after);
                }
            }
            (false, Err(TaskError::Aborted)) => {
                st.log_task(task_id, LogLevel::Info, "Aborted");
                st.set_status(task_id, Status::Hold);
            }
            (false, Err(TaskError::Failed(e))) => {
                warn!(task = task_id, change = %change_id, "Task failed: {}", e);
                st.fail_task(task_id, &e.to_string());
                if let Ok(doing) = st.abort_change(&change_id) {
                    self.cancel_tasks(&doing);
                }
            }
            (true, Ok(())) => st.set_status(task_id, Status::Undone),
            (true, Err(e)) => {
                warn!(task = task_id, change = %change_id, "Undo failed: {}", e);
                st.fail_task(task_id, &format!("cannot undo: {e}"));
            }
        }
    }
}

/// Undo runs in reverse completion order, once no sibling is still doing.
fn undo_turn(st: &Graph, task: &Task) -> bool {
    st.change_tasks(&task.change).iter().all(|other| {
        if other.id == task.id {
            return true;
        }
        match other.status {
            Status::Doing => false,
            Status::Undo | Status::Undoing => other.done_seq < task.done_seq,
            _ => true,
        }
    })
}

fn until(next: Option<DateTime<Utc>>) -> Duration {
    match next {
        Some(at) => (at - Utc::now()).to_std().unwrap_or(Duration::ZERO),
        None => Duration::from_secs(3600),
    }
}
