//! Steward daemon - supervises local services in dependency order
//!
//! The daemon owns one [`Daemon`] context built by [`Daemon::init`]:
//! - Service Manager: start/stop/restart/replan as durable changes
//! - Task runner: drives the change engine and undoes failed changes
//! - Check manager: periodic http/tcp/exec probes with failure actions
//! - Control socket: rkyv frames over a local unix socket
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                 steward daemon                 │
//! ├───────────────────────────────────────────────┤
//! │ IPC Server │ ServiceMgr │ TaskRunner │ Checks  │
//! │  (socket)  │  (changes) │  (engine)  │ (probes)│
//! ├───────────────────────────────────────────────┤
//! │   Supervisor  │  Supervisor  │  Supervisor ... │
//! └───────────────────────────────────────────────┘
//! ```

pub mod backoff;
pub mod checkers;
pub mod checks;
pub mod client;
pub mod deps;
pub mod launcher;
pub mod log_buffer;
pub mod notifier;
pub mod protocol;
pub mod server;
pub mod services;
pub mod supervisor;

pub use client::DaemonClient;
pub use protocol::{Request, Response, ServiceInfo, ServiceState};
pub use server::{DaemonConfig, DaemonServer};
pub use services::ServiceManager;

use crate::error::{Error, PlanError};
use crate::plan::Plan;
use crate::state::{Change, State, TaskRunner};
use checks::CheckManager;
use launcher::ProcessLauncher;
use log_buffer::LogBuffer;
use notifier::Notifier;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use supervisor::{ExitReason, ShutdownHandle, ShutdownRequest, SupervisorDeps, KILL_GRACE};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// The running orchestrator: plan, engine and monitors wired together.
pub struct Daemon {
    services: Arc<ServiceManager>,
    checks: Arc<CheckManager>,
    runner: Arc<TaskRunner>,
    shutdown: ShutdownHandle,
    plan_path: Option<PathBuf>,
    stop_timeout: Duration,
    cancel: CancellationToken,
    runner_task: Mutex<Option<JoinHandle<()>>>,
}

impl Daemon {
    /// Open the state, load the plan and start the engine. Changes left
    /// unfinished by a previous run resume immediately. Shutdown requests
    /// from services and checks arrive on the returned receiver.
    pub fn init(
        config: &DaemonConfig,
        launcher: Arc<dyn ProcessLauncher>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ShutdownRequest>), Error> {
        std::fs::create_dir_all(&config.state_dir)?;
        let state = State::open(&config.state_dir.join("state.json"), Arc::clone(&notifier))?;
        let plan = load_plan(config.plan_path.as_deref())?;
        info!(
            services = plan.services.len(),
            checks = plan.checks.len(),
            "Plan ready"
        );

        let (shutdown, requests) = ShutdownHandle::new();
        let deps = SupervisorDeps {
            launcher: Arc::clone(&launcher),
            logs: Arc::new(LogBuffer::default()),
            notifier: Arc::clone(&notifier),
            shutdown: shutdown.clone(),
            settle: config.settle_window,
            kill_grace: KILL_GRACE,
        };
        let services = ServiceManager::new(plan.clone(), state.clone(), deps);
        let on_failure: checks::FailureHook = {
            let services = Arc::clone(&services);
            Arc::new(move |check: &str| services.handle_check_failure(check))
        };
        let checks = CheckManager::new(state.clone(), launcher, notifier, on_failure);

        let mut runner = TaskRunner::new(state, config.runner.clone());
        services.register_handlers(&mut runner);
        checks.register_handlers(&mut runner);
        let runner = Arc::new(runner);
        checks.apply(&plan);

        let cancel = CancellationToken::new();
        let runner_task = tokio::spawn(Arc::clone(&runner).run(cancel.child_token()));

        let daemon = Self {
            services,
            checks,
            runner,
            shutdown,
            plan_path: config.plan_path.clone(),
            stop_timeout: config.stop_timeout,
            cancel,
            runner_task: Mutex::new(Some(runner_task)),
        };
        Ok((daemon, requests))
    }

    pub fn services(&self) -> &Arc<ServiceManager> {
        &self.services
    }

    pub fn checks(&self) -> &Arc<CheckManager> {
        &self.checks
    }

    pub fn runner(&self) -> &Arc<TaskRunner> {
        &self.runner
    }

    pub fn state(&self) -> &State {
        self.services.state()
    }

    /// Ask the daemon to exit through the same path services and checks use.
    pub fn request_shutdown(&self, reason: ExitReason, cause: impl Into<String>) {
        self.shutdown.request(reason, cause);
    }

    /// Reload the plan file, reconcile checks and create the replan change.
    pub fn replan(&self) -> Result<String, Error> {
        if self.plan_path.is_some() {
            let plan = load_plan(self.plan_path.as_deref())?;
            self.apply_plan(plan);
        }
        self.services.replan()
    }

    /// Combine `layer` on top of the running plan. Services pick the new
    /// configuration up on the next replan or restart.
    pub fn add_layer(&self, layer: Plan) -> Result<(), PlanError> {
        let combined = self.services.plan().combine(layer)?;
        self.apply_plan(combined);
        Ok(())
    }

    fn apply_plan(&self, plan: Plan) {
        self.checks.apply(&plan);
        self.services.set_plan(plan);
    }

    pub async fn wait_change(&self, id: &str, timeout: Option<Duration>) -> Result<Change, Error> {
        Ok(self.state().wait_change(id, timeout).await?)
    }

    /// Stop checks and running services, then the engine. The state file is
    /// written one last time before returning.
    pub async fn shutdown(&self) -> Result<(), Error> {
        info!("Shutting down");
        self.checks.stop_all().await;

        match self.services.stop_running() {
            Ok(id) => match self.wait_change(&id, Some(self.stop_timeout)).await {
                Ok(change) => info!(change = %change.id, status = %change.status, "Services stopped"),
                Err(e) => warn!("Services did not stop cleanly: {}", e),
            },
            Err(e) => warn!("Cannot stop running services: {}", e),
        }

        self.cancel.cancel();
        let runner_task = self.runner_task.lock().expect("runner lock poisoned").take();
        if let Some(task) = runner_task {
            let _ = task.await;
        }
        self.state().checkpoint()?;
        Ok(())
    }
}

fn load_plan(path: Option<&std::path::Path>) -> Result<Plan, PlanError> {
    match path {
        Some(path) if path.exists() => Plan::load(path),
        Some(path) => {
            warn!(path = %path.display(), "Plan file not found, starting with an empty plan");
            Ok(Plan::default())
        }
        None => Ok(Plan::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::launcher::testing::{FakeLauncher, Script};
    use crate::daemon::notifier::TracingNotifier;
    use crate::state::Status;

    fn config(dir: &std::path::Path, plan: Option<&str>) -> DaemonConfig {
        let plan_path = dir.join("plan.toml");
        if let Some(plan) = plan {
            std::fs::write(&plan_path, plan).unwrap();
        }
        DaemonConfig {
            socket_path: dir.join("steward.sock"),
            state_dir: dir.join("state"),
            plan_path: Some(plan_path),
            settle_window: Duration::from_millis(30),
            stop_timeout: Duration::from_secs(10),
            ..DaemonConfig::default()
        }
    }

    const PLAN: &str = r#"
[services.db]
command = "postgres"
startup = "enabled"

[services.web]
command = "server"
startup = "enabled"
requires = ["db"]
"#;

    #[tokio::test]
    async fn init_autostart_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(FakeLauncher::new(Script::RunForever { ignore_term: false }));
        let (daemon, _requests) =
            Daemon::init(&config(dir.path(), Some(PLAN)), launcher, Arc::new(TracingNotifier)).unwrap();

        let id = daemon.services().autostart().unwrap();
        let change = daemon.wait_change(&id, Some(Duration::from_secs(10))).await.unwrap();
        assert_eq!(change.status, Status::Done);

        let names: Vec<String> = Vec::new();
        let status = daemon.services().service_status(&names).unwrap();
        assert!(status.iter().all(|s| s.current == ServiceState::Running));

        daemon.shutdown().await.unwrap();
        let status = daemon.services().service_status(&names).unwrap();
        assert!(status.iter().all(|s| s.current == ServiceState::Inactive));
        assert!(dir.path().join("state/state.json").exists());
    }

    #[tokio::test]
    async fn replan_reloads_plan_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), Some(PLAN));
        let launcher = Arc::new(FakeLauncher::new(Script::RunForever { ignore_term: false }));
        let (daemon, _requests) =
            Daemon::init(&config, launcher, Arc::new(TracingNotifier)).unwrap();

        let extra = format!("{PLAN}\n[services.worker]\ncommand = \"work\"\n");
        std::fs::write(config.plan_path.as_ref().unwrap(), extra).unwrap();
        let id = daemon.replan().unwrap();
        daemon.wait_change(&id, Some(Duration::from_secs(10))).await.unwrap();

        let plan = daemon.services().plan();
        assert!(plan.service("worker").is_some());
        daemon.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn add_layer_rejects_invalid_combination() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(FakeLauncher::new(Script::RunForever { ignore_term: false }));
        let (daemon, _requests) =
            Daemon::init(&config(dir.path(), Some(PLAN)), launcher, Arc::new(TracingNotifier)).unwrap();

        let mut layer = Plan::default();
        layer
            .services
            .insert(crate::plan::Service::new("db", "postgres").requires(["web"]));
        assert!(matches!(daemon.add_layer(layer), Err(PlanError::Cycle(_))));
        assert!(daemon.services().plan().service("db").unwrap().requires.is_empty());
        daemon.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn enabled_checks_run_as_changes() {
        let dir = tempfile::tempdir().unwrap();
        let plan = format!("{PLAN}\n[checks.db-up]\nperiod = \"1h\"\ntcp = {{ port = 5432 }}\n");
        let launcher = Arc::new(FakeLauncher::new(Script::RunForever { ignore_term: false }));
        let (daemon, _requests) =
            Daemon::init(&config(dir.path(), Some(&plan)), launcher, Arc::new(TracingNotifier)).unwrap();

        let info = daemon.checks().status(&[], None).unwrap().remove(0);
        let change_id = info.change_id.unwrap();
        assert_eq!(
            daemon.state().lock().change(&change_id).unwrap().kind,
            checks::PERFORM_KIND
        );

        daemon.shutdown().await.unwrap();
        assert_eq!(
            daemon.state().lock().change(&change_id).unwrap().status,
            Status::Done
        );
    }

    #[tokio::test]
    async fn missing_plan_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(FakeLauncher::new(Script::RunForever { ignore_term: false }));
        let (daemon, _requests) =
            Daemon::init(&config(dir.path(), None), launcher, Arc::new(TracingNotifier)).unwrap();
        assert!(daemon.services().plan().services.is_empty());
        daemon.shutdown().await.unwrap();
    }
}
