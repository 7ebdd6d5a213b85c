//! The task/change graph, its lock, and its on-disk checkpoint.

use super::change::{reduce_status, Change};
use super::task::{LogLevel, Status, Task};
use crate::daemon::notifier::Notifier;
use crate::error::StateError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Shared handle to the engine state. Cloning is cheap.
#[derive(Clone)]
pub struct State {
    shared: Arc<Shared>,
}

struct Shared {
    graph: Mutex<Graph>,
    path: Option<PathBuf>,
    revision: watch::Sender<u64>,
    notifier: Arc<dyn Notifier>,
}

impl State {
    /// State that lives only in memory.
    pub fn in_memory(notifier: Arc<dyn Notifier>) -> Self {
        Self::with_graph(Graph::default(), None, notifier)
    }

    /// Load the state file at `path`, or start empty if it does not exist.
    /// Work left in flight by a previous run is made runnable again.
    pub fn open(path: &Path, notifier: Arc<dyn Notifier>) -> Result<Self, StateError> {
        let mut graph = if path.exists() {
            let bytes = std::fs::read(path).map_err(|source| StateError::Load {
                path: path.to_path_buf(),
                source,
            })?;
            serde_json::from_slice::<Graph>(&bytes).map_err(|source| StateError::Decode {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|source| StateError::Persist {
                    path: path.to_path_buf(),
                    source,
                })?;
            }
            Graph::default()
        };

        let resumed = graph.resume();
        info!(
            path = %path.display(),
            changes = graph.changes.len(),
            resumed,
            "State loaded"
        );
        Ok(Self::with_graph(graph, Some(path.to_path_buf()), notifier))
    }

    fn with_graph(graph: Graph, path: Option<PathBuf>, notifier: Arc<dyn Notifier>) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                graph: Mutex::new(graph),
                path,
                revision,
                notifier,
            }),
        }
    }

    /// Lock the graph. Modifications are checkpointed to disk and announced
    /// when the guard is dropped, so keep the guard away from `.await`.
    pub fn lock(&self) -> StateGuard<'_> {
        StateGuard {
            graph: self.shared.graph.lock().expect("state lock poisoned"),
            shared: &self.shared,
        }
    }

    /// Receiver that ticks after every modification.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.shared.revision.subscribe()
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.shared.notifier
    }

    pub fn path(&self) -> Option<&Path> {
        self.shared.path.as_deref()
    }

    /// Write the current graph to disk regardless of pending modifications.
    pub fn checkpoint(&self) -> Result<(), StateError> {
        let graph = self.shared.graph.lock().expect("state lock poisoned");
        match &self.shared.path {
            Some(path) => write_state(path, &graph),
            None => Ok(()),
        }
    }

    /// Wait until the change is ready, or until `timeout` elapses.
    pub async fn wait_change(
        &self,
        id: &str,
        timeout: Option<Duration>,
    ) -> Result<Change, StateError> {
        let mut revision = self.subscribe();
        let wait = async {
            loop {
                {
                    let st = self.lock();
                    let change = st
                        .change(id)
                        .ok_or_else(|| StateError::NoChange(id.to_string()))?;
                    if change.is_ready() {
                        return Ok(change.clone());
                    }
                }
                if revision.changed().await.is_err() {
                    return Err(StateError::NoChange(id.to_string()));
                }
            }
        };
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, wait)
                .await
                .map_err(|_| StateError::WaitTimeout(id.to_string()))?,
            None => wait.await,
        }
    }
}

pub struct StateGuard<'a> {
    graph: MutexGuard<'a, Graph>,
    shared: &'a Shared,
}

impl Deref for StateGuard<'_> {
    type Target = Graph;

    fn deref(&self) -> &Graph {
        &self.graph
    }
}

impl DerefMut for StateGuard<'_> {
    fn deref_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        if !self.graph.modified {
            return;
        }
        self.graph.modified = false;

        if let Some(path) = &self.shared.path {
            if let Err(e) = write_state(path, &self.graph) {
                error!("Failed to checkpoint state: {}", e);
            }
        }

        let events = std::mem::take(&mut self.graph.events);
        let notifier = &self.shared.notifier;
        for event in &events {
            match event {
                Event::Change(id) => {
                    if let Some(change) = self.graph.changes.get(id) {
                        notifier.change_updated(change);
                    }
                }
                Event::Task(id) => {
                    if let Some(task) = self.graph.tasks.get(id) {
                        notifier.task_updated(task);
                    }
                }
            }
        }

        self.shared.revision.send_modify(|r| *r = r.wrapping_add(1));
    }
}

fn write_state(path: &Path, graph: &Graph) -> Result<(), StateError> {
    let persist = |source| StateError::Persist {
        path: path.to_path_buf(),
        source,
    };
    let bytes = serde_json::to_vec(graph).map_err(StateError::Encode)?;
    let tmp = path.with_extension("json.tmp");
    let mut file = std::fs::File::create(&tmp).map_err(persist)?;
    file.write_all(&bytes).map_err(persist)?;
    file.sync_all().map_err(persist)?;
    std::fs::rename(&tmp, path).map_err(persist)?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Change(String),
    Task(String),
}

/// The task/change graph. Obtained through [`State::lock`].
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Graph {
    last_change_id: u64,
    last_task_id: u64,
    last_done_seq: u64,
    changes: HashMap<String, Change>,
    tasks: HashMap<String, Task>,
    #[serde(skip)]
    modified: bool,
    #[serde(skip)]
    events: Vec<Event>,
}

fn age_limit(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    ChronoDuration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn id_order(id: &str) -> u64 {
    id.parse().unwrap_or(u64::MAX)
}

impl Graph {
    fn touch(&mut self, event: Event) {
        self.modified = true;
        if !self.events.contains(&event) {
            self.events.push(event);
        }
    }

    pub fn new_change(&mut self, kind: &str, summary: &str) -> String {
        self.last_change_id += 1;
        let id = self.last_change_id.to_string();
        self.changes
            .insert(id.clone(), Change::new(id.clone(), kind, summary));
        self.refresh_change(&id);
        self.touch(Event::Change(id.clone()));
        debug!(change = %id, kind, "Change created");
        id
    }

    pub fn new_task(
        &mut self,
        change_id: &str,
        kind: &str,
        summary: &str,
    ) -> Result<String, StateError> {
        let change = self
            .changes
            .get_mut(change_id)
            .ok_or_else(|| StateError::NoChange(change_id.to_string()))?;
        self.last_task_id += 1;
        let id = self.last_task_id.to_string();
        change.task_ids.push(id.clone());
        self.tasks.insert(
            id.clone(),
            Task::new(id.clone(), change_id.to_string(), kind, summary),
        );
        self.refresh_change(change_id);
        self.touch(Event::Task(id.clone()));
        Ok(id)
    }

    /// Declare that `task` runs only after `wait_on` is Done.
    pub fn add_wait(&mut self, task: &str, wait_on: &str) -> Result<(), StateError> {
        if !self.tasks.contains_key(wait_on) {
            return Err(StateError::NoTask(wait_on.to_string()));
        }
        let waiter = self
            .tasks
            .get_mut(task)
            .ok_or_else(|| StateError::NoTask(task.to_string()))?;
        if !waiter.wait_tasks.iter().any(|t| t == wait_on) {
            waiter.wait_tasks.push(wait_on.to_string());
        }
        if let Some(halted) = self.tasks.get_mut(wait_on) {
            if !halted.halt_tasks.iter().any(|t| t == task) {
                halted.halt_tasks.push(task.to_string());
            }
        }
        self.modified = true;
        Ok(())
    }

    pub fn change(&self, id: &str) -> Option<&Change> {
        self.changes.get(id)
    }

    /// All changes, oldest first.
    pub fn changes(&self) -> Vec<&Change> {
        let mut changes: Vec<&Change> = self.changes.values().collect();
        changes.sort_by_key(|c| id_order(&c.id));
        changes
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    /// Tasks of a change, in creation order.
    pub fn change_tasks(&self, change_id: &str) -> Vec<&Task> {
        self.changes
            .get(change_id)
            .map(|c| c.task_ids.iter().filter_map(|t| self.tasks.get(t)).collect())
            .unwrap_or_default()
    }

    /// All task IDs in creation order.
    pub fn task_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tasks.keys().cloned().collect();
        ids.sort_by_key(|id| id_order(id));
        ids
    }

    pub fn set_change_data<T: Serialize>(
        &mut self,
        change_id: &str,
        key: &str,
        value: &T,
    ) -> Result<(), StateError> {
        let value = serde_json::to_value(value).map_err(StateError::Encode)?;
        let change = self
            .changes
            .get_mut(change_id)
            .ok_or_else(|| StateError::NoChange(change_id.to_string()))?;
        change.data.insert(key.to_string(), value);
        self.modified = true;
        Ok(())
    }

    pub fn set_task_data<T: Serialize>(
        &mut self,
        task_id: &str,
        key: &str,
        value: &T,
    ) -> Result<(), StateError> {
        let value = serde_json::to_value(value).map_err(StateError::Encode)?;
        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StateError::NoTask(task_id.to_string()))?;
        task.data.insert(key.to_string(), value);
        self.modified = true;
        Ok(())
    }

    pub fn log_task(&mut self, task_id: &str, level: LogLevel, message: impl Into<String>) {
        if let Some(task) = self.tasks.get_mut(task_id) {
            task.push_log(level, message);
            self.modified = true;
        }
    }

    /// Record a task error and remember it as the change error if it is the
    /// first one.
    pub fn fail_task(&mut self, task_id: &str, message: &str) {
        self.log_task(task_id, LogLevel::Error, message);
        let change_id = match self.tasks.get(task_id) {
            Some(task) => task.change.clone(),
            None => return,
        };
        if let Some(change) = self.changes.get_mut(&change_id) {
            change.err.get_or_insert_with(|| message.to_string());
        }
        self.set_status(task_id, Status::Error);
    }

    pub fn set_status(&mut self, task_id: &str, status: Status) {
        let Some(task) = self.tasks.get_mut(task_id) else {
            return;
        };
        if task.status == status {
            return;
        }
        task.status = status;
        task.at_time = None;
        task.ready_time = status.is_ready().then(Utc::now);
        if status == Status::Done {
            self.last_done_seq += 1;
            task.done_seq = Some(self.last_done_seq);
        }
        let change_id = task.change.clone();
        self.touch(Event::Task(task_id.to_string()));
        self.refresh_change(&change_id);
    }

    /// Park a task in Wait until `at`.
    pub fn set_wait(&mut self, task_id: &str, at: DateTime<Utc>) {
        self.set_status(task_id, Status::Wait);
        if let Some(task) = self.tasks.get_mut(task_id) {
            task.at_time = Some(at);
        }
    }

    fn refresh_change(&mut self, change_id: &str) {
        let Some(change) = self.changes.get(change_id) else {
            return;
        };
        let status = reduce_status(
            change
                .task_ids
                .iter()
                .filter_map(|t| self.tasks.get(t).map(|t| t.status)),
        );
        let was_ready = change.is_ready();
        let changed = change.status != status;

        if let Some(change) = self.changes.get_mut(change_id) {
            change.status = status;
            if status.is_ready() {
                if !was_ready {
                    change.ready_time = Some(Utc::now());
                }
            } else {
                change.ready_time = None;
            }
        }
        if changed || was_ready != status.is_ready() {
            self.touch(Event::Change(change_id.to_string()));
        }
    }

    /// Mark a change as aborting. Pending tasks are held, completed tasks are
    /// queued for undo. Returns the tasks that are currently running and must
    /// be cancelled by the caller.
    pub fn abort_change(&mut self, change_id: &str) -> Result<Vec<String>, StateError> {
        let change = self
            .changes
            .get_mut(change_id)
            .ok_or_else(|| StateError::NoChange(change_id.to_string()))?;
        change.aborting = true;
        let task_ids = change.task_ids.clone();
        self.modified = true;

        let mut running = Vec::new();
        for id in task_ids {
            let Some(status) = self.tasks.get(&id).map(|t| t.status) else {
                continue;
            };
            match status {
                Status::Do | Status::Wait => self.set_status(&id, Status::Hold),
                Status::Done => self.set_status(&id, Status::Undo),
                Status::Doing => running.push(id),
                _ => {}
            }
        }
        Ok(running)
    }

    /// Reset tasks interrupted by a daemon restart so they run again.
    /// Returns the number of unfinished changes.
    fn resume(&mut self) -> usize {
        let interrupted: Vec<(String, Status)> = self
            .tasks
            .values()
            .filter_map(|t| match t.status {
                Status::Doing => Some((t.id.clone(), Status::Do)),
                Status::Undoing => Some((t.id.clone(), Status::Undo)),
                _ => None,
            })
            .collect();
        for (id, status) in interrupted {
            if let Some(task) = self.tasks.get_mut(&id) {
                task.status = status;
                task.push_log(LogLevel::Info, "Resumed after daemon restart");
            }
        }
        self.changes.values().filter(|c| !c.is_ready()).count()
    }

    /// Drop ready changes older than `prune_age`, and the oldest ready
    /// changes beyond `max_ready`. Returns unfinished changes spawned longer
    /// than `abort_age` ago, which the caller should abort.
    pub fn prune(
        &mut self,
        now: DateTime<Utc>,
        prune_age: Duration,
        abort_age: Duration,
        max_ready: usize,
    ) -> Vec<String> {
        let prune_before = age_limit(now, prune_age);
        let abort_before = age_limit(now, abort_age);

        let mut expired = Vec::new();
        let mut ready = Vec::new();
        let mut to_abort = Vec::new();
        for change in self.changes.values() {
            match change.ready_time {
                Some(ready_time) if ready_time < prune_before => expired.push(change.id.clone()),
                Some(ready_time) => ready.push((ready_time, change.id.clone())),
                None if change.spawn_time < abort_before && !change.aborting => {
                    to_abort.push(change.id.clone())
                }
                None => {}
            }
        }

        ready.sort();
        let excess = ready.len().saturating_sub(max_ready);
        expired.extend(ready.into_iter().take(excess).map(|(_, id)| id));

        for id in &expired {
            if let Some(change) = self.changes.remove(id) {
                for task in &change.task_ids {
                    self.tasks.remove(task);
                }
                self.modified = true;
            }
        }
        if !expired.is_empty() {
            debug!(pruned = expired.len(), "Pruned old changes");
        }
        to_abort
    }
}
