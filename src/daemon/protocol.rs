//! Control socket protocol.
//!
//! Requests and responses are rkyv archives. On the wire each message is a
//! 4-byte little-endian length followed by the archive bytes.

use crate::state::{Change, Task};
use chrono::{DateTime, SecondsFormat, Utc};
use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize};

/// Request from a client to the daemon.
#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[rkyv(derive(Debug))]
pub enum Request {
    /// Check if the daemon is alive
    Ping,
    /// Stop all services and exit
    Shutdown,

    Start { names: Vec<String> },
    /// Stop the named services, or every running service when `all` is set
    Stop { names: Vec<String>, all: bool },
    Restart { names: Vec<String> },
    Replan,
    Autostart,
    Signal { signal: String, names: Vec<String> },
    /// Service status; an empty list means all services
    Services { names: Vec<String> },
    ServiceLogs { name: String, lines: u32 },

    Checks { names: Vec<String>, level: Option<String> },
    StartChecks { names: Vec<String> },
    StopChecks { names: Vec<String> },

    Changes,
    Change { id: String },
    WaitChange { id: String, timeout_ms: Option<u64> },
    Abort { id: String },
}

/// Response from the daemon.
#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[rkyv(derive(Debug))]
pub enum Response {
    Pong { uptime_secs: u64, version: String },
    Ok,
    Error { message: String },
    /// A change was created for the request
    Accepted { change_id: String },
    Services { list: Vec<ServiceInfo> },
    Checks { list: Vec<CheckInfo> },
    Changes { list: Vec<ChangeInfo> },
    Change { change: ChangeInfo, tasks: Vec<TaskInfo> },
    Logs { lines: Vec<String> },
}

/// Runtime state of a supervised service.
#[derive(Archive, Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub enum ServiceState {
    Inactive,
    Starting,
    Running,
    Stopping,
    Backoff,
    Error,
}

impl ServiceState {
    /// Starting, running or waiting to restart.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ServiceState::Starting | ServiceState::Running | ServiceState::Backoff
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Inactive => "inactive",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
            ServiceState::Backoff => "backoff",
            ServiceState::Error => "error",
        }
    }
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub enum CheckState {
    Up,
    Down,
    Inactive,
}

impl CheckState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckState::Up => "up",
            CheckState::Down => "down",
            CheckState::Inactive => "inactive",
        }
    }
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[rkyv(derive(Debug))]
pub struct ServiceInfo {
    pub name: String,
    pub startup: String,
    pub current: ServiceState,
    /// RFC 3339 time of the last transition
    pub current_since: Option<String>,
    pub starts: u32,
    pub pid: Option<u32>,
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[rkyv(derive(Debug))]
pub struct CheckInfo {
    pub name: String,
    pub level: String,
    pub startup: String,
    pub status: CheckState,
    pub failures: u32,
    pub threshold: u32,
    /// Change whose task is running the check, while it is active
    pub change_id: Option<String>,
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[rkyv(derive(Debug))]
pub struct ChangeInfo {
    pub id: String,
    pub kind: String,
    pub summary: String,
    pub status: String,
    pub ready: bool,
    pub spawn_time: String,
    pub ready_time: Option<String>,
    pub err: Option<String>,
}

impl From<&Change> for ChangeInfo {
    fn from(change: &Change) -> Self {
        Self {
            id: change.id.clone(),
            kind: change.kind.clone(),
            summary: change.summary.clone(),
            status: change.status.to_string(),
            ready: change.is_ready(),
            spawn_time: timestamp(&change.spawn_time),
            ready_time: change.ready_time.as_ref().map(timestamp),
            err: change.err.clone(),
        }
    }
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[rkyv(derive(Debug))]
pub struct TaskInfo {
    pub id: String,
    pub kind: String,
    pub summary: String,
    pub status: String,
    pub log: Vec<String>,
    pub spawn_time: String,
    pub ready_time: Option<String>,
}

impl From<&Task> for TaskInfo {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            kind: task.kind.clone(),
            summary: task.summary.clone(),
            status: task.status.to_string(),
            log: task.log.iter().map(ToString::to_string).collect(),
            spawn_time: timestamp(&task.spawn_time),
            ready_time: task.ready_time.as_ref().map(timestamp),
        }
    }
}

pub fn timestamp(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Message frame for the wire protocol
///
/// Format: [4-byte length (little-endian)][rkyv bytes]
pub struct MessageFrame;

impl MessageFrame {
    pub fn encode_request(request: &Request) -> Result<Vec<u8>, rkyv::rancor::Error> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(request)?;
        Ok(Self::frame(&bytes))
    }

    pub fn encode_response(response: &Response) -> Result<Vec<u8>, rkyv::rancor::Error> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(response)?;
        Ok(Self::frame(&bytes))
    }

    pub fn decode_request(bytes: &[u8]) -> Result<Request, rkyv::rancor::Error> {
        rkyv::from_bytes::<Request, rkyv::rancor::Error>(&aligned(bytes))
    }

    pub fn decode_response(bytes: &[u8]) -> Result<Response, rkyv::rancor::Error> {
        rkyv::from_bytes::<Response, rkyv::rancor::Error>(&aligned(bytes))
    }

    fn frame(bytes: &[u8]) -> Vec<u8> {
        let len = bytes.len() as u32;
        let mut result = Vec::with_capacity(4 + bytes.len());
        result.extend_from_slice(&len.to_le_bytes());
        result.extend_from_slice(bytes);
        result
    }

    /// Read length prefix from buffer
    pub fn read_length(buf: &[u8; 4]) -> usize {
        u32::from_le_bytes(*buf) as usize
    }
}

/// Archives must be read from 16-byte aligned memory.
fn aligned(bytes: &[u8]) -> AlignedVec {
    let mut buf = AlignedVec::with_capacity(bytes.len());
    buf.extend_from_slice(bytes);
    buf
}
