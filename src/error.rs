use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors. These are raised synchronously, before any change
/// is created.
#[derive(Error, Debug)]
pub enum PlanError {
    #[error("service {0:?} does not exist")]
    UnknownService(String),

    #[error("check {0:?} does not exist")]
    UnknownCheck(String),

    #[error("{entity} {name:?} has no {field} field")]
    MissingField {
        entity: &'static str,
        name: String,
        field: &'static str,
    },

    #[error("{entity} {name:?}: {message}")]
    Invalid {
        entity: &'static str,
        name: String,
        message: String,
    },

    #[error("services in dependency cycle: {}", .0.join(", "))]
    Cycle(Vec<String>),

    #[error("invalid duration {0:?}")]
    Duration(String),

    #[error("cannot read plan {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse plan {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Errors raised by the task/change engine.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("change {0:?} not found")]
    NoChange(String),

    #[error("task {0:?} not found")]
    NoTask(String),

    #[error("no state entry for key {0:?}")]
    NoState(String),

    #[error("cannot decode state entry {key:?}: {source}")]
    Data {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("no handler registered for task kind {0:?}")]
    NoHandler(String),

    #[error("cannot write state to {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot load state from {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot encode state: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("cannot decode state from {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("timed out waiting for change {0:?}")]
    WaitTimeout(String),

    #[error("change {0:?} is already finished")]
    AlreadyReady(String),

    #[error("tasks still pending after {0:?}")]
    SettleTimeout(Duration),
}

/// Low-level process launch errors.
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("cannot start {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown user {0:?}")]
    UnknownUser(String),

    #[error("unknown group {0:?}")]
    UnknownGroup(String),

    #[error("cannot look up user or group: {0}")]
    Lookup(String),

    #[error("cannot signal process group {pgid}: {source}")]
    Signal {
        pgid: i32,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid signal name {0:?}")]
    InvalidSignal(String),

    #[error("cannot wait for process: {0}")]
    Wait(#[source] std::io::Error),
}

/// Execution errors produced while starting or stopping a service.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("service {service:?}: {source}")]
    Launch {
        service: String,
        #[source]
        source: LaunchError,
    },

    #[error("service {service:?} exited quickly with code {code}, will {action}")]
    ExitedEarly {
        service: String,
        code: i32,
        action: String,
    },

    #[error("service {service:?} stopped before the {settle:?} settle window elapsed")]
    StoppedDuringStart { service: String, settle: Duration },

    #[error("service {service:?} still running after SIGTERM and SIGKILL")]
    StillRunning { service: String },

    #[error("service {service:?} is not running")]
    NotRunning { service: String },

    #[error("cannot {operation} service {service:?} while {state}")]
    InvalidState {
        service: String,
        operation: &'static str,
        state: String,
    },

    #[error("supervisor for service {0:?} is gone")]
    SupervisorGone(String),
}

/// Probe failures reported by health checks.
#[derive(Error, Debug)]
pub enum CheckError {
    #[error("check {check:?} timed out after {timeout:?}")]
    Timeout { check: String, timeout: Duration },

    #[error("check {check:?}: {source}")]
    Http {
        check: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("check {check:?}: received non-20x status code {status}")]
    Status {
        check: String,
        status: u16,
        details: String,
    },

    #[error("check {check:?}: cannot connect to {address}: {source}")]
    Tcp {
        check: String,
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("check {check:?}: {source}")]
    Exec {
        check: String,
        #[source]
        source: LaunchError,
    },

    #[error("check {check:?}: exit status {code}")]
    ExitStatus {
        check: String,
        code: i32,
        details: String,
    },
}

impl CheckError {
    /// Extra output attached to the failure (response body or command output).
    pub fn details(&self) -> Option<&str> {
        match self {
            Self::Status { details, .. } | Self::ExitStatus { details, .. }
                if !details.is_empty() =>
            {
                Some(details.as_str())
            }
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Check(#[from] CheckError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("daemon is shutting down")]
    ShuttingDown,
}

impl Error {
    /// Configuration errors are rejected before any change is created.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Plan(_))
    }
}

/// Outcome of a task handler that did not complete.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error(transparent)]
    Failed(#[from] Error),

    #[error("will retry in {after:?}: {reason}")]
    Retry { after: Duration, reason: String },

    #[error("aborted")]
    Aborted,
}

impl From<ServiceError> for TaskError {
    fn from(e: ServiceError) -> Self {
        TaskError::Failed(e.into())
    }
}

impl From<StateError> for TaskError {
    fn from(e: StateError) -> Self {
        TaskError::Failed(e.into())
    }
}

impl From<PlanError> for TaskError {
    fn from(e: PlanError) -> Self {
        TaskError::Failed(e.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
