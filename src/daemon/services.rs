//! Service Manager: turns start/stop/restart/replan requests into changes
//! and runs their tasks against the per-service supervisors.

use super::deps::{self, Direction};
use super::log_buffer::LogBuffer;
use super::protocol::{timestamp, ServiceInfo, ServiceState};
use super::supervisor::{ExitReason, Supervisor, SupervisorDeps};
use crate::error::{Error, PlanError, ServiceError, TaskError};
use crate::plan::{Plan, ServiceAction, Startup};
use crate::state::{State, Task, TaskContext, TaskHandler, TaskRunner};
use async_trait::async_trait;
use nix::sys::signal::Signal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

pub const START_KIND: &str = "start";
pub const STOP_KIND: &str = "stop";

/// Task data key holding the service name.
const SERVICE_KEY: &str = "service";

/// Task data key set when a start task launched the process itself.
const STARTED_KEY: &str = "started";

pub struct ServiceManager {
    plan: RwLock<Plan>,
    supervisors: Mutex<HashMap<String, Supervisor>>,
    state: State,
    deps: SupervisorDeps,
}

impl ServiceManager {
    pub fn new(plan: Plan, state: State, deps: SupervisorDeps) -> Arc<Self> {
        Arc::new(Self {
            plan: RwLock::new(plan),
            supervisors: Mutex::new(HashMap::new()),
            state,
            deps,
        })
    }

    /// Register the `start` and `stop` task handlers.
    pub fn register_handlers(self: &Arc<Self>, runner: &mut TaskRunner) {
        runner.add_handler(START_KIND, Arc::new(StartHandler(Arc::clone(self))));
        runner.add_handler(STOP_KIND, Arc::new(StopHandler(Arc::clone(self))));
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn logs(&self) -> &Arc<LogBuffer> {
        &self.deps.logs
    }

    pub fn plan(&self) -> Plan {
        self.plan.read().expect("plan lock poisoned").clone()
    }

    /// Replace the plan. Running services keep their configuration until the
    /// next replan or restart.
    pub fn set_plan(&self, plan: Plan) {
        *self.plan.write().expect("plan lock poisoned") = plan;
    }

    fn supervisor(&self, name: &str) -> Option<Supervisor> {
        self.supervisors
            .lock()
            .expect("supervisors lock poisoned")
            .get(name)
            .cloned()
    }

    /// Supervisor for a service about to start, carrying its current plan
    /// configuration.
    fn supervisor_for_start(&self, name: &str) -> Result<Supervisor, PlanError> {
        let config = self
            .plan
            .read()
            .expect("plan lock poisoned")
            .service(name)
            .cloned()
            .ok_or_else(|| PlanError::UnknownService(name.to_string()))?;
        let mut supervisors = self.supervisors.lock().expect("supervisors lock poisoned");
        if let Some(supervisor) = supervisors.get(name) {
            supervisor.update(config);
            return Ok(supervisor.clone());
        }
        debug!(service = name, "Creating supervisor");
        let supervisor = Supervisor::spawn(config, self.deps.clone());
        supervisors.insert(name.to_string(), supervisor.clone());
        Ok(supervisor)
    }

    fn current(&self, name: &str) -> ServiceState {
        self.supervisor(name)
            .map_or(ServiceState::Inactive, |s| s.snapshot().current)
    }

    /// Start the named services and everything they require.
    pub fn start(&self, names: &[String]) -> Result<String, Error> {
        let order = deps::order(&self.plan(), names, Direction::Start)?;
        let steps: Vec<(&str, String)> = order.into_iter().map(|n| (START_KIND, n)).collect();
        self.compose("start", &summarize("Start", names), &steps)
    }

    /// Stop the named services and everything that requires them.
    pub fn stop(&self, names: &[String]) -> Result<String, Error> {
        let order = deps::order(&self.plan(), names, Direction::Stop)?;
        let steps: Vec<(&str, String)> = order.into_iter().map(|n| (STOP_KIND, n)).collect();
        self.compose("stop", &summarize("Stop", names), &steps)
    }

    /// Stop and start the named services regardless of configuration drift.
    pub fn restart(&self, names: &[String]) -> Result<String, Error> {
        let plan = self.plan();
        let stops = deps::sort(&plan, names, Direction::Stop)?;
        let starts = deps::order(&plan, names, Direction::Start)?;
        let steps: Vec<(&str, String)> = stops
            .into_iter()
            .map(|n| (STOP_KIND, n))
            .chain(starts.into_iter().map(|n| (START_KIND, n)))
            .collect();
        self.compose("restart", &summarize("Restart", names), &steps)
    }

    /// Start every `startup: enabled` service.
    pub fn autostart(&self) -> Result<String, Error> {
        let plan = self.plan();
        let enabled = plan.enabled_services();
        let order = deps::order(&plan, &enabled, Direction::Start)?;
        let steps: Vec<(&str, String)> = order.into_iter().map(|n| (START_KIND, n)).collect();
        self.compose("autostart", &summarize("Autostart", &enabled), &steps)
    }

    /// Reconcile services with the current plan: restart active services
    /// whose configuration changed, stop services removed from the plan and
    /// start enabled services that are not active.
    pub fn replan(&self) -> Result<String, Error> {
        self.forget_removed();
        let plan = self.plan();
        let mut restart = Vec::new();
        let mut start = Vec::new();
        for service in plan.services.iter() {
            let snapshot = self.supervisor(&service.name).map(|s| s.snapshot());
            let active = snapshot.as_ref().is_some_and(|s| s.current.is_active());
            if active {
                let applied = snapshot.and_then(|s| s.applied);
                if applied.as_deref() != Some(service.fingerprint().as_str()) {
                    restart.push(service.name.clone());
                }
            } else if service.startup == Startup::Enabled {
                start.push(service.name.clone());
            }
        }
        let removed: Vec<String> = self.supervised_outside(&plan);

        let mut steps: Vec<(&str, String)> = removed.iter().map(|n| (STOP_KIND, n.clone())).collect();
        steps.extend(
            deps::sort(&plan, &restart, Direction::Stop)?
                .into_iter()
                .map(|n| (STOP_KIND, n)),
        );
        let wanted: Vec<String> = restart.iter().chain(start.iter()).cloned().collect();
        steps.extend(
            deps::order(&plan, &wanted, Direction::Start)?
                .into_iter()
                .map(|n| (START_KIND, n)),
        );

        let affected: Vec<String> = removed.into_iter().chain(wanted).collect();
        info!(
            restart = restart.len(),
            start = start.len(),
            "Replanning services"
        );
        self.compose("replan", &summarize("Replan", &affected), &steps)
    }

    /// Drop supervisors of services that left the plan once they are no
    /// longer active.
    fn forget_removed(&self) {
        let plan = self.plan.read().expect("plan lock poisoned");
        let mut supervisors = self.supervisors.lock().expect("supervisors lock poisoned");
        supervisors.retain(|name, supervisor| {
            let snapshot = supervisor.snapshot();
            let keep = plan.services.contains(name)
                || snapshot.current.is_active()
                || snapshot.pid.is_some();
            if !keep {
                debug!(service = %name, "Dropping supervisor for removed service");
            }
            keep
        });
    }

    /// Active services no longer in the plan.
    fn supervised_outside(&self, plan: &Plan) -> Vec<String> {
        let supervisors = self.supervisors.lock().expect("supervisors lock poisoned");
        let mut names: Vec<String> = supervisors
            .iter()
            .filter(|(name, s)| {
                !plan.services.contains(name) && s.snapshot().current != ServiceState::Inactive
            })
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Stop every service that is not inactive, in dependency order.
    pub fn stop_running(&self) -> Result<String, Error> {
        let plan = self.plan();
        let mut removed = self.supervised_outside(&plan);
        let running: Vec<String> = plan
            .services
            .names()
            .filter(|name| {
                !matches!(
                    self.current(name),
                    ServiceState::Inactive | ServiceState::Error
                ) || self.supervisor(name).is_some_and(|s| s.snapshot().pid.is_some())
            })
            .map(str::to_string)
            .collect();
        let mut names = deps::sort(&plan, &running, Direction::Stop)?;
        removed.append(&mut names);
        let steps: Vec<(&str, String)> = removed.iter().map(|n| (STOP_KIND, n.clone())).collect();
        self.compose("stop", &summarize("Stop", &removed), &steps)
    }

    /// Create a change whose tasks run one after another.
    fn compose(&self, kind: &str, summary: &str, steps: &[(&str, String)]) -> Result<String, Error> {
        let mut st = self.state.lock();
        let change = st.new_change(kind, summary);
        let names: Vec<&str> = steps.iter().map(|(_, n)| n.as_str()).collect();
        st.set_change_data(&change, "services", &names)?;

        let mut previous: Option<String> = None;
        for (task_kind, name) in steps {
            let verb = if *task_kind == START_KIND { "Start" } else { "Stop" };
            let task = st.new_task(&change, task_kind, &format!("{verb} service {name:?}"))?;
            st.set_task_data(&task, SERVICE_KEY, name)?;
            if let Some(previous) = &previous {
                st.add_wait(&task, previous)?;
            }
            previous = Some(task);
        }
        info!(change = %change, kind, tasks = steps.len(), "{}", summary);
        Ok(change)
    }

    /// Deliver a signal to running services. Fails without signalling
    /// anything if one of them is not running.
    pub async fn signal(&self, names: &[String], signal: Signal) -> Result<(), Error> {
        let plan = self.plan();
        let mut targets = Vec::with_capacity(names.len());
        for name in names {
            if !plan.services.contains(name) {
                return Err(PlanError::UnknownService(name.clone()).into());
            }
            match self.supervisor(name) {
                Some(supervisor) if supervisor.snapshot().pid.is_some() => targets.push(supervisor),
                _ => {
                    return Err(ServiceError::NotRunning {
                        service: name.clone(),
                    }
                    .into())
                }
            }
        }
        for supervisor in targets {
            info!(service = supervisor.name(), ?signal, "Sending signal");
            supervisor.signal(signal).await?;
        }
        Ok(())
    }

    /// Status of the named services, or of every service when `names` is
    /// empty, in plan order.
    pub fn service_status(&self, names: &[String]) -> Result<Vec<ServiceInfo>, PlanError> {
        let plan = self.plan();
        for name in names {
            if !plan.services.contains(name) {
                return Err(PlanError::UnknownService(name.clone()));
            }
        }
        Ok(plan
            .services
            .iter()
            .filter(|s| names.is_empty() || names.contains(&s.name))
            .map(|service| {
                let mut info = ServiceInfo {
                    name: service.name.clone(),
                    startup: service.startup.as_str().to_string(),
                    current: ServiceState::Inactive,
                    current_since: None,
                    starts: 0,
                    pid: None,
                };
                if let Some(supervisor) = self.supervisor(&service.name) {
                    let snapshot = supervisor.snapshot();
                    info.current = snapshot.current;
                    info.current_since = Some(timestamp(&snapshot.since));
                    info.starts = snapshot.starts;
                    info.pid = snapshot.pid;
                }
                info
            })
            .collect())
    }

    /// Apply every service's `on-check-failure` policy for a check that went
    /// down.
    pub fn handle_check_failure(&self, check: &str) {
        let plan = self.plan();
        for service in plan.services.iter() {
            let Some(action) = service.on_check_failure.get(check) else {
                continue;
            };
            let cause = format!(
                "check {check:?} failed (service {:?} on-check-failure: {action})",
                service.name
            );
            match action {
                ServiceAction::Restart => match self.supervisor(&service.name) {
                    Some(supervisor) => supervisor.restart_for_check(check),
                    None => debug!(service = %service.name, check, "Service never started, not restarting"),
                },
                ServiceAction::Shutdown | ServiceAction::FailureShutdown => {
                    self.deps.shutdown.request(ExitReason::Failure, cause)
                }
                ServiceAction::SuccessShutdown => {
                    self.deps.shutdown.request(ExitReason::Success, cause)
                }
                ServiceAction::Ignore => {}
            }
        }
    }

    async fn stop_service(&self, name: &str) -> Result<(), ServiceError> {
        match self.supervisor(name) {
            Some(supervisor) => supervisor.stop().await,
            None => Ok(()),
        }
    }
}

fn summarize(verb: &str, names: &[String]) -> String {
    match names {
        [] => format!("{verb}: nothing to do"),
        [one] => format!("{verb} service {one:?}"),
        [first, rest @ ..] => format!("{verb} service {first:?} and {} more", rest.len()),
    }
}

fn service_key(task: &Task) -> Option<String> {
    task.get::<String>(SERVICE_KEY)
        .ok()
        .map(|name| format!("service/{name}"))
}

struct StartHandler(Arc<ServiceManager>);

#[async_trait]
impl TaskHandler for StartHandler {
    async fn run(&self, ctx: TaskContext) -> Result<(), TaskError> {
        let name: String = ctx.get(SERVICE_KEY)?;
        if ctx.is_cancelled() {
            return Err(TaskError::Aborted);
        }
        let supervisor = self.0.supervisor_for_start(&name)?;
        match supervisor.start().await {
            Ok(true) => {
                ctx.set(STARTED_KEY, &true)?;
                ctx.log(format!("Service {name:?} is running"));
            }
            Ok(false) => ctx.log(format!("Service {name:?} was already running")),
            Err(e) => {
                if let Some(output) = self.0.logs().recent_output(&name) {
                    ctx.log(output);
                }
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Stop the service only if this task started it.
    async fn undo(&self, ctx: TaskContext) -> Result<(), TaskError> {
        let name: String = ctx.get(SERVICE_KEY)?;
        if !ctx.get::<bool>(STARTED_KEY).unwrap_or(false) {
            ctx.log(format!("Service {name:?} left running, this change did not start it"));
            return Ok(());
        }
        self.0.stop_service(&name).await?;
        ctx.log(format!("Service {name:?} stopped"));
        Ok(())
    }

    fn can_undo(&self) -> bool {
        true
    }

    fn exclusive_key(&self, task: &Task) -> Option<String> {
        service_key(task)
    }
}

struct StopHandler(Arc<ServiceManager>);

#[async_trait]
impl TaskHandler for StopHandler {
    async fn run(&self, ctx: TaskContext) -> Result<(), TaskError> {
        let name: String = ctx.get(SERVICE_KEY)?;
        if ctx.is_cancelled() {
            return Err(TaskError::Aborted);
        }
        if let Err(e) = self.0.stop_service(&name).await {
            warn!(service = %name, "Stop failed: {}", e);
            return Err(e.into());
        }
        self.0.forget_removed();
        ctx.log(format!("Service {name:?} stopped"));
        Ok(())
    }

    fn exclusive_key(&self, task: &Task) -> Option<String> {
        service_key(task)
    }
}
