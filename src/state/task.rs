use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Maximum number of log entries kept per task.
pub const MAX_TASK_LOG: usize = 20;

/// Status of a task, and the reduced status of a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Do,
    Doing,
    Done,
    Undo,
    Undoing,
    Undone,
    Hold,
    Error,
    Wait,
}

impl Status {
    /// Terminal statuses; the engine never moves a task out of these.
    pub fn is_ready(&self) -> bool {
        matches!(
            self,
            Status::Done | Status::Undone | Status::Hold | Status::Error
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Do => "Do",
            Status::Doing => "Doing",
            Status::Done => "Done",
            Status::Undo => "Undo",
            Status::Undoing => "Undoing",
            Status::Undone => "Undone",
            Status::Hold => "Hold",
            Status::Error => "Error",
            Status::Wait => "Wait",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub time: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            LogLevel::Info => "INFO",
            LogLevel::Error => "ERROR",
        };
        write!(
            f,
            "{} {} {}",
            self.time.format("%Y-%m-%dT%H:%M:%SZ"),
            level,
            self.message
        )
    }
}

/// One durable step of a change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub kind: String,
    pub summary: String,
    pub status: Status,
    pub change: String,
    #[serde(default)]
    pub log: Vec<LogEntry>,
    #[serde(default)]
    pub data: BTreeMap<String, serde_json::Value>,
    /// Tasks that must be Done before this one runs.
    #[serde(default)]
    pub wait_tasks: Vec<String>,
    /// Tasks waiting on this one.
    #[serde(default)]
    pub halt_tasks: Vec<String>,
    pub spawn_time: DateTime<Utc>,
    #[serde(default)]
    pub ready_time: Option<DateTime<Utc>>,
    /// Earliest time a task in Wait may run again.
    #[serde(default)]
    pub at_time: Option<DateTime<Utc>>,
    /// Position in the order tasks of the change reached Done; undo runs in
    /// reverse of this order.
    #[serde(default)]
    pub done_seq: Option<u64>,
}

impl Task {
    pub(crate) fn new(id: String, change: String, kind: &str, summary: &str) -> Self {
        Self {
            id,
            kind: kind.to_string(),
            summary: summary.to_string(),
            status: Status::Do,
            change,
            log: Vec::new(),
            data: BTreeMap::new(),
            wait_tasks: Vec::new(),
            halt_tasks: Vec::new(),
            spawn_time: Utc::now(),
            ready_time: None,
            at_time: None,
            done_seq: None,
        }
    }

    pub(crate) fn push_log(&mut self, level: LogLevel, message: impl Into<String>) {
        self.log.push(LogEntry {
            time: Utc::now(),
            level,
            message: message.into(),
        });
        if self.log.len() > MAX_TASK_LOG {
            let excess = self.log.len() - MAX_TASK_LOG;
            self.log.drain(..excess);
        }
    }

    /// Decode a typed value stored under `key`.
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_statuses() {
        for status in [Status::Done, Status::Undone, Status::Hold, Status::Error] {
            assert!(status.is_ready(), "{status}");
        }
        for status in [
            Status::Do,
            Status::Doing,
            Status::Undo,
            Status::Undoing,
            Status::Wait,
        ] {
            assert!(!status.is_ready(), "{status}");
        }
    }

    #[test]
    fn log_is_capped() {
        let mut task = Task::new("1".into(), "1".into(), "start", "Start web");
        for i in 0..MAX_TASK_LOG + 5 {
            task.push_log(LogLevel::Info, format!("entry {i}"));
        }
        assert_eq!(task.log.len(), MAX_TASK_LOG);
        assert_eq!(task.log[0].message, "entry 5");
    }

    #[test]
    fn typed_data() {
        let mut task = Task::new("1".into(), "1".into(), "start", "Start web");
        task.data
            .insert("service".into(), serde_json::json!("web"));
        let name: String = task.get("service").unwrap();
        assert_eq!(name, "web");
        assert!(task.get::<String>("missing").is_err());
        assert!(task.get::<u32>("service").is_err());
    }

    #[test]
    fn log_entry_display() {
        let entry = LogEntry {
            time: DateTime::parse_from_rfc3339("2024-01-02T03:04:05Z")
                .unwrap()
                .with_timezone(&Utc),
            level: LogLevel::Error,
            message: "boom".into(),
        };
        assert_eq!(entry.to_string(), "2024-01-02T03:04:05Z ERROR boom");
    }
}
