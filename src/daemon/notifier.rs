//! Forwarding of state transitions to the control layer and the log sink.

use super::protocol::{CheckInfo, ServiceState};
use crate::state::{Change, Task};
use tracing::info;

/// Receives every persisted change/task transition and every service or
/// check status change. Implementations must not block: they are called
/// with the engine lock held.
pub trait Notifier: Send + Sync {
    fn change_updated(&self, _change: &Change) {}

    fn task_updated(&self, _task: &Task) {}

    fn service_updated(&self, _service: &str, _current: ServiceState) {}

    fn check_updated(&self, _check: &CheckInfo) {}
}

/// Default notifier writing structured events to the `steward::notify` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn change_updated(&self, change: &Change) {
        info!(
            target: "steward::notify",
            change = %change.id,
            kind = %change.kind,
            status = %change.status,
            "{}",
            change.summary
        );
    }

    fn task_updated(&self, task: &Task) {
        info!(
            target: "steward::notify",
            change = %task.change,
            task = %task.id,
            kind = %task.kind,
            status = %task.status,
            "{}",
            task.summary
        );
    }

    fn service_updated(&self, service: &str, current: ServiceState) {
        info!(
            target: "steward::notify",
            service,
            current = current.as_str(),
            "Service status changed"
        );
    }

    fn check_updated(&self, check: &CheckInfo) {
        info!(
            target: "steward::notify",
            check = %check.name,
            status = check.status.as_str(),
            failures = check.failures,
            threshold = check.threshold,
            "Check status changed"
        );
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records every event as a short string, for assertions.
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub events: Mutex<Vec<String>>,
    }

    impl RecordingNotifier {
        pub fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl Notifier for RecordingNotifier {
        fn change_updated(&self, change: &Change) {
            self.events
                .lock()
                .unwrap()
                .push(format!("change {} {}", change.id, change.status));
        }

        fn task_updated(&self, task: &Task) {
            self.events
                .lock()
                .unwrap()
                .push(format!("task {} {}", task.id, task.status));
        }

        fn service_updated(&self, service: &str, current: ServiceState) {
            self.events
                .lock()
                .unwrap()
                .push(format!("service {service} {}", current.as_str()));
        }

        fn check_updated(&self, check: &CheckInfo) {
            self.events
                .lock()
                .unwrap()
                .push(format!("check {} {}", check.name, check.status.as_str()));
        }
    }
}
