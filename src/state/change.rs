use super::task::Status;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A user-visible unit of work made of ordered tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub id: String,
    pub kind: String,
    pub summary: String,
    /// Reduction of the task statuses, refreshed on every task transition.
    pub status: Status,
    #[serde(default)]
    pub task_ids: Vec<String>,
    #[serde(default)]
    pub data: BTreeMap<String, serde_json::Value>,
    pub spawn_time: DateTime<Utc>,
    #[serde(default)]
    pub ready_time: Option<DateTime<Utc>>,
    /// Set once the change is aborted, either on request or because a task
    /// failed. Completed tasks are undone from then on.
    #[serde(default)]
    pub aborting: bool,
    /// First error recorded by any task, for display.
    #[serde(default)]
    pub err: Option<String>,
}

impl Change {
    pub(crate) fn new(id: String, kind: &str, summary: &str) -> Self {
        Self {
            id,
            kind: kind.to_string(),
            summary: summary.to_string(),
            status: Status::Do,
            task_ids: Vec::new(),
            data: BTreeMap::new(),
            spawn_time: Utc::now(),
            ready_time: None,
            aborting: false,
            err: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready_time.is_some()
    }

    pub fn get<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<T, crate::error::StateError> {
        let value = self
            .data
            .get(key)
            .ok_or_else(|| crate::error::StateError::NoState(key.to_string()))?;
        serde_json::from_value(value.clone()).map_err(|source| crate::error::StateError::Data {
            key: key.to_string(),
            source,
        })
    }
}

/// Reduce task statuses to the status of their change.
///
/// Recovery in progress wins over forward progress, which wins over the
/// terminal outcomes. An empty change is Done.
pub fn reduce_status(statuses: impl IntoIterator<Item = Status>) -> Status {
    let mut seen = [false; 9];
    let index = |s: Status| s as usize;
    for status in statuses {
        seen[index(status)] = true;
    }
    const PRIORITY: [Status; 9] = [
        Status::Undoing,
        Status::Undo,
        Status::Doing,
        Status::Do,
        Status::Wait,
        Status::Error,
        Status::Undone,
        Status::Hold,
        Status::Done,
    ];
    PRIORITY
        .iter()
        .copied()
        .find(|s| seen[index(*s)])
        .unwrap_or(Status::Done)
}
