//! Health check monitor.
//!
//! Checks run inside the change engine. A started check gets a
//! `perform-check` change whose single task probes once per period while the
//! check passes. The first failure ends that task in Error and opens a
//! `recover-check` change; its task keeps probing and logs every failure
//! until a probe succeeds, at which point a fresh `perform-check` change
//! takes over. Reaching the threshold marks the check down and reports it
//! once through the failure hook.

use super::checkers::{self, Checker};
use super::launcher::ProcessLauncher;
use super::notifier::Notifier;
use super::protocol::{CheckInfo, CheckState};
use crate::error::{CheckError, PlanError, StateError, TaskError};
use crate::plan::{Check, CheckLevel, Plan, Startup};
use crate::state::{State, Task, TaskContext, TaskHandler, TaskRunner};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const PERFORM_KIND: &str = "perform-check";
pub const RECOVER_KIND: &str = "recover-check";

/// Task data key holding the check name.
const CHECK_KEY: &str = "check";

/// How long `stop_all` waits for each check change to finish.
const STOP_WAIT: Duration = Duration::from_secs(2);

/// Called with the check name when a check goes down.
pub type FailureHook = Arc<dyn Fn(&str) + Send + Sync>;

struct Monitor {
    config: Check,
    /// Fingerprint of the `service-context` service the checker was built from.
    context: Option<String>,
    checker: Arc<dyn Checker>,
    /// Live status; `change_id` names the change whose task drives the check.
    info: Mutex<CheckInfo>,
    cancel: CancellationToken,
}

pub struct CheckManager {
    plan: Mutex<Plan>,
    monitors: Mutex<HashMap<String, Arc<Monitor>>>,
    state: State,
    launcher: Arc<dyn ProcessLauncher>,
    notifier: Arc<dyn Notifier>,
    on_failure: FailureHook,
}

impl CheckManager {
    pub fn new(
        state: State,
        launcher: Arc<dyn ProcessLauncher>,
        notifier: Arc<dyn Notifier>,
        on_failure: FailureHook,
    ) -> Arc<Self> {
        Arc::new(Self {
            plan: Mutex::new(Plan::default()),
            monitors: Mutex::new(HashMap::new()),
            state,
            launcher,
            notifier,
            on_failure,
        })
    }

    /// Register the `perform-check` and `recover-check` task handlers.
    pub fn register_handlers(self: &Arc<Self>, runner: &mut TaskRunner) {
        runner.add_handler(
            PERFORM_KIND,
            Arc::new(CheckHandler {
                manager: Arc::clone(self),
                recovering: false,
            }),
        );
        runner.add_handler(
            RECOVER_KIND,
            Arc::new(CheckHandler {
                manager: Arc::clone(self),
                recovering: true,
            }),
        );
    }

    /// Reconcile running monitors with a new plan. Removed checks stop.
    /// Running checks restart when their configuration or the service they
    /// take their exec context from changed. New or changed checks with
    /// `startup: enabled` start; unchanged checks stay as they are.
    pub fn apply(&self, plan: &Plan) {
        let previous = std::mem::replace(
            &mut *self.plan.lock().expect("plan lock poisoned"),
            plan.clone(),
        );
        let mut monitors = self.monitors.lock().expect("monitors lock poisoned");

        let mut restarting = HashSet::new();
        monitors.retain(|name, monitor| {
            let keep = plan.check(name) == Some(&monitor.config)
                && context_fingerprint(&monitor.config, plan) == monitor.context;
            if !keep {
                debug!(check = %name, "Stopping check for replan");
                monitor.cancel.cancel();
                restarting.insert(name.clone());
            }
            keep
        });

        for check in plan.checks.iter() {
            if monitors.contains_key(&check.name) {
                continue;
            }
            let unchanged = previous.check(&check.name) == Some(check);
            let wanted = restarting.contains(&check.name)
                || (check.startup == Startup::Enabled && !unchanged);
            if wanted {
                self.start_monitor(&mut monitors, check, plan);
            }
        }
    }

    /// Start the named checks. Returns the ones that were not running.
    pub fn start_checks(&self, names: &[String]) -> Result<Vec<String>, PlanError> {
        let plan = self.plan.lock().expect("plan lock poisoned").clone();
        let checks = lookup(&plan, names)?;
        let mut monitors = self.monitors.lock().expect("monitors lock poisoned");
        let mut started = Vec::new();
        for check in checks {
            if monitors.contains_key(&check.name) {
                continue;
            }
            self.start_monitor(&mut monitors, check, &plan);
            started.push(check.name.clone());
        }
        Ok(started)
    }

    /// Stop the named checks. Returns the ones that were running. Their
    /// current change finishes once the task sees the stop.
    pub fn stop_checks(&self, names: &[String]) -> Result<Vec<String>, PlanError> {
        let plan = self.plan.lock().expect("plan lock poisoned").clone();
        let checks = lookup(&plan, names)?;
        let mut monitors = self.monitors.lock().expect("monitors lock poisoned");
        let mut stopped = Vec::new();
        for check in checks {
            if let Some(monitor) = monitors.remove(&check.name) {
                monitor.cancel.cancel();
                info!(check = %check.name, "Check stopped");
                self.notifier.check_updated(&inactive(check));
                stopped.push(check.name.clone());
            }
        }
        Ok(stopped)
    }

    /// Status of the named checks (all when empty) in plan order. A level
    /// filter of `ready` also includes `alive` checks, since a service that
    /// is not alive cannot be ready.
    pub fn status(
        &self,
        names: &[String],
        level: Option<CheckLevel>,
    ) -> Result<Vec<CheckInfo>, PlanError> {
        let plan = self.plan.lock().expect("plan lock poisoned").clone();
        lookup(&plan, names)?;
        let monitors = self.monitors.lock().expect("monitors lock poisoned");
        Ok(plan
            .checks
            .iter()
            .filter(|c| names.is_empty() || names.contains(&c.name))
            .filter(|c| match level {
                None | Some(CheckLevel::Unset) => true,
                Some(CheckLevel::Alive) => c.level == CheckLevel::Alive,
                Some(CheckLevel::Ready) => {
                    matches!(c.level, CheckLevel::Alive | CheckLevel::Ready)
                }
            })
            .map(|c| match monitors.get(&c.name) {
                Some(monitor) => monitor.info.lock().expect("check lock poisoned").clone(),
                None => inactive(c),
            })
            .collect())
    }

    /// Stop every monitor and wait briefly for their changes to finish.
    pub async fn stop_all(&self) {
        let monitors: Vec<Arc<Monitor>> = self
            .monitors
            .lock()
            .expect("monitors lock poisoned")
            .drain()
            .map(|(_, m)| m)
            .collect();
        for monitor in &monitors {
            monitor.cancel.cancel();
        }
        for monitor in monitors {
            let change_id = monitor.info.lock().expect("check lock poisoned").change_id.clone();
            let Some(change_id) = change_id else {
                continue;
            };
            if let Err(e) = self.state.wait_change(&change_id, Some(STOP_WAIT)).await {
                debug!(check = %monitor.config.name, "Check change still open: {}", e);
            }
        }
    }

    fn start_monitor(&self, monitors: &mut HashMap<String, Arc<Monitor>>, check: &Check, plan: &Plan) {
        let checker = checkers::for_check(check, plan, Arc::clone(&self.launcher));
        let context = context_fingerprint(check, plan);
        self.insert_monitor(monitors, check, context, checker);
    }

    fn insert_monitor(
        &self,
        monitors: &mut HashMap<String, Arc<Monitor>>,
        check: &Check,
        context: Option<String>,
        checker: Arc<dyn Checker>,
    ) {
        let mut info = inactive(check);
        info.status = CheckState::Up;
        let monitor = Arc::new(Monitor {
            config: check.clone(),
            context,
            checker,
            info: Mutex::new(info),
            cancel: CancellationToken::new(),
        });
        self.open_change(&monitor, PERFORM_KIND);
        info!(check = %check.name, kind = check.kind(), period = ?check.period, "Check started");
        monitors.insert(check.name.clone(), monitor);
    }

    /// Monitor for `name` if `change_id` is the change driving it.
    fn owner(&self, name: &str, change_id: &str) -> Option<Arc<Monitor>> {
        let monitor = self
            .monitors
            .lock()
            .expect("monitors lock poisoned")
            .get(name)
            .cloned()?;
        let owns = monitor.info.lock().expect("check lock poisoned").change_id.as_deref() == Some(change_id);
        owns.then_some(monitor)
    }

    /// Hand the check over to a new change of `kind`. The check lock is held
    /// while the change is created so its task always finds itself the owner.
    fn open_change(&self, monitor: &Monitor, kind: &str) {
        let mut info = monitor.info.lock().expect("check lock poisoned");
        match self.new_check_change(&monitor.config, kind) {
            Ok(id) => {
                debug!(check = %monitor.config.name, change = %id, kind, "Check change opened");
                info.change_id = Some(id);
            }
            Err(e) => error!(check = %monitor.config.name, kind, "Cannot create check change: {}", e),
        }
    }

    fn new_check_change(&self, check: &Check, kind: &str) -> Result<String, StateError> {
        let verb = if kind == RECOVER_KIND { "Recover" } else { "Perform" };
        let summary = format!("{verb} {} check {:?}", check.kind(), check.name);
        let mut st = self.state.lock();
        let change = st.new_change(kind, &summary);
        let task = st.new_task(&change, kind, &summary)?;
        st.set_task_data(&task, CHECK_KEY, &check.name)?;
        Ok(change)
    }

    fn record_success(&self, monitor: &Monitor) {
        let snapshot = {
            let mut info = monitor.info.lock().expect("check lock poisoned");
            if info.status == CheckState::Down {
                info!(check = %monitor.config.name, "Check up");
            }
            let changed = info.status != CheckState::Up || info.failures != 0;
            info.status = CheckState::Up;
            info.failures = 0;
            changed.then(|| info.clone())
        };
        if let Some(snapshot) = snapshot {
            self.notifier.check_updated(&snapshot);
        }
    }

    fn record_failure(&self, monitor: &Monitor, err: &CheckError) {
        let check = &monitor.config;
        let details = err.details().map(|d| format!("\n{d}")).unwrap_or_default();
        let (snapshot, went_down) = {
            let mut info = monitor.info.lock().expect("check lock poisoned");
            info.failures = info.failures.saturating_add(1);
            let went_down = if info.failures < check.threshold {
                warn!(
                    check = %check.name,
                    failures = info.failures,
                    threshold = check.threshold,
                    "Check failure: {}{}", err, details
                );
                false
            } else if info.status != CheckState::Down {
                error!(
                    check = %check.name,
                    failures = info.failures,
                    "Check down: {}{}", err, details
                );
                info.status = CheckState::Down;
                true
            } else {
                debug!(check = %check.name, failures = info.failures, "Check still down: {}", err);
                false
            };
            (info.clone(), went_down)
        };
        self.notifier.check_updated(&snapshot);
        if went_down {
            (self.on_failure)(&check.name);
        }
    }
}

struct CheckHandler {
    manager: Arc<CheckManager>,
    recovering: bool,
}

impl CheckHandler {
    fn kind(&self) -> &'static str {
        if self.recovering {
            RECOVER_KIND
        } else {
            PERFORM_KIND
        }
    }
}

#[async_trait]
impl TaskHandler for CheckHandler {
    async fn run(&self, ctx: TaskContext) -> Result<(), TaskError> {
        let name: String = ctx.get(CHECK_KEY)?;
        let Some(monitor) = self.manager.owner(&name, ctx.change_id()) else {
            ctx.log(format!("Check {name:?} is no longer driven by this change"));
            return Ok(());
        };
        let period = monitor.config.period;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let result = tokio::select! {
                _ = monitor.cancel.cancelled() => {
                    ctx.log(format!("Check {name:?} stopped"));
                    return Ok(());
                }
                _ = ctx.cancel_token().cancelled() => {
                    // An aborted change must not end the monitoring itself.
                    if !monitor.cancel.is_cancelled() {
                        info!(check = %name, change = ctx.change_id(), "Check change interrupted, reopening");
                        self.manager.open_change(&monitor, self.kind());
                    }
                    return Err(TaskError::Aborted);
                }
                result = probe(&monitor, &mut ticker) => result,
            };

            match result {
                Ok(()) => {
                    self.manager.record_success(&monitor);
                    if self.recovering {
                        ctx.log(format!("Check {name:?} recovered"));
                        self.manager.open_change(&monitor, PERFORM_KIND);
                        return Ok(());
                    }
                }
                Err(e) => {
                    self.manager.record_failure(&monitor, &e);
                    if let Some(details) = e.details() {
                        ctx.log_error(details);
                    }
                    if !self.recovering {
                        self.manager.open_change(&monitor, RECOVER_KIND);
                        return Err(TaskError::Failed(e.into()));
                    }
                    ctx.log_error(e.to_string());
                }
            }
        }
    }

    fn exclusive_key(&self, task: &Task) -> Option<String> {
        task.get::<String>(CHECK_KEY)
            .ok()
            .map(|name| format!("check/{name}"))
    }
}

/// Wait for the next period, then probe with the check's timeout.
async fn probe(monitor: &Monitor, ticker: &mut Interval) -> Result<(), CheckError> {
    ticker.tick().await;
    monitor.checker.check(monitor.config.timeout).await
}

fn context_fingerprint(check: &Check, plan: &Plan) -> Option<String> {
    let service = check.exec.as_ref()?.service_context.as_deref()?;
    plan.service(service).map(|s| s.fingerprint())
}

fn lookup<'a>(plan: &'a Plan, names: &[String]) -> Result<Vec<&'a Check>, PlanError> {
    names
        .iter()
        .map(|name| {
            plan.check(name)
                .ok_or_else(|| PlanError::UnknownCheck(name.clone()))
        })
        .collect()
}

fn inactive(check: &Check) -> CheckInfo {
    CheckInfo {
        name: check.name.clone(),
        level: check.level.as_str().to_string(),
        startup: check.startup.as_str().to_string(),
        status: CheckState::Inactive,
        failures: 0,
        threshold: check.threshold,
        change_id: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::launcher::TokioLauncher;
    use crate::daemon::notifier::testing::RecordingNotifier;
    use crate::daemon::notifier::TracingNotifier;
    use crate::plan::Service;
    use crate::state::{RunnerConfig, Status};
    use std::collections::VecDeque;
    use tokio::net::TcpListener;

    const TEST_PERIOD: Duration = Duration::from_millis(30);

    /// Probe returning scripted results, then succeeding.
    struct Scripted(Mutex<VecDeque<bool>>);

    #[async_trait]
    impl Checker for Scripted {
        async fn check(&self, timeout: Duration) -> Result<(), CheckError> {
            match self.0.lock().unwrap().pop_front() {
                Some(false) => Err(CheckError::Timeout {
                    check: "scripted".into(),
                    timeout,
                }),
                _ => Ok(()),
            }
        }
    }

    struct Fixture {
        manager: Arc<CheckManager>,
        runner: Arc<TaskRunner>,
        state: State,
        notifier: Arc<RecordingNotifier>,
        seen: Arc<Mutex<Vec<String>>>,
        cancel: CancellationToken,
    }

    impl Fixture {
        fn new() -> Self {
            let state = State::in_memory(Arc::new(TracingNotifier));
            let notifier = Arc::new(RecordingNotifier::default());
            let seen = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&seen);
            let hook: FailureHook =
                Arc::new(move |name: &str| sink.lock().unwrap().push(name.to_string()));
            let manager = CheckManager::new(state.clone(), Arc::new(TokioLauncher), notifier.clone(), hook);

            let mut runner = TaskRunner::new(state.clone(), RunnerConfig::default());
            manager.register_handlers(&mut runner);
            let runner = Arc::new(runner);
            let cancel = CancellationToken::new();
            tokio::spawn(Arc::clone(&runner).run(cancel.clone()));
            Self {
                manager,
                runner,
                state,
                notifier,
                seen,
                cancel,
            }
        }

        fn info(&self, name: &str) -> CheckInfo {
            self.manager.status(&[name.to_string()], None).unwrap().remove(0)
        }

        fn changes(&self) -> Vec<(String, Status)> {
            self.state
                .lock()
                .changes()
                .iter()
                .map(|c| (c.kind.clone(), c.status))
                .collect()
        }

        async fn finish(self) {
            self.manager.stop_all().await;
            self.cancel.cancel();
        }
    }

    fn tcp_check(name: &str, port: u16) -> Check {
        Check::tcp(name, Some("127.0.0.1"), port).timing(TEST_PERIOD, Duration::from_millis(20), 2)
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        for _ in 0..300 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test]
    async fn failure_switches_to_recover_change_and_back() {
        let fx = Fixture::new();
        let check = Check::exec("flaky", "true", Vec::<String>::new()).timing(
            TEST_PERIOD,
            Duration::from_millis(10),
            3,
        );
        fx.manager.plan.lock().unwrap().checks.insert(check.clone());
        let checker = Arc::new(Scripted(Mutex::new(VecDeque::from([false, false, false, true]))));
        {
            let mut monitors = fx.manager.monitors.lock().unwrap();
            fx.manager.insert_monitor(&mut monitors, &check, None, checker);
        }
        let first = fx.info("flaky").change_id.unwrap();

        eventually(|| fx.info("flaky").failures == 2).await;
        assert_eq!(fx.info("flaky").status, CheckState::Up);
        assert!(fx.seen.lock().unwrap().is_empty());
        let recovering = fx.info("flaky").change_id.unwrap();
        assert_ne!(recovering, first);

        eventually(|| fx.info("flaky").status == CheckState::Down).await;
        assert_eq!(fx.info("flaky").failures, 3);
        assert_eq!(*fx.seen.lock().unwrap(), vec!["flaky"]);

        eventually(|| fx.info("flaky").status == CheckState::Up).await;
        assert_eq!(fx.info("flaky").failures, 0);
        assert_eq!(fx.seen.lock().unwrap().len(), 1);
        let performing = fx.info("flaky").change_id.unwrap();
        fx.state
            .wait_change(&recovering, Some(Duration::from_secs(5)))
            .await
            .unwrap();

        let changes = fx.changes();
        assert_eq!(changes.len(), 3);
        assert_eq!(changes[0], (PERFORM_KIND.to_string(), Status::Error));
        assert_eq!(changes[1], (RECOVER_KIND.to_string(), Status::Done));
        assert_eq!(changes[2].0, PERFORM_KIND);
        assert!(!fx.state.lock().change(&performing).unwrap().is_ready());

        {
            let st = fx.state.lock();
            let perform = st.change_tasks(&first)[0];
            assert_eq!(perform.summary, "Perform exec check \"flaky\"");
            assert!(perform.log.iter().any(|e| e.message.contains("timed out")));
            let recover = st.change_tasks(&recovering)[0];
            let errors = recover
                .log
                .iter()
                .filter(|e| e.level == crate::state::LogLevel::Error)
                .count();
            assert_eq!(errors, 2);
        }

        let events = fx.notifier.events.lock().unwrap().clone();
        assert!(events.contains(&"check flaky down".to_string()));
        assert!(events.contains(&"check flaky up".to_string()));
        fx.finish().await;
    }

    #[tokio::test]
    async fn stopping_a_check_finishes_its_change() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let fx = Fixture::new();
        let mut plan = Plan::default();
        plan.checks.insert(tcp_check("db-port", port));
        fx.manager.apply(&plan);

        let change = fx.info("db-port").change_id.unwrap();
        eventually(|| fx.state.lock().change_tasks(&change)[0].status == Status::Doing).await;

        fx.manager.stop_checks(&["db-port".into()]).unwrap();
        let done = fx
            .state
            .wait_change(&change, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(done.status, Status::Done);
        assert_eq!(fx.info("db-port").change_id, None);
        fx.finish().await;
    }

    #[tokio::test]
    async fn aborted_check_change_keeps_monitoring() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let fx = Fixture::new();
        let mut plan = Plan::default();
        plan.checks.insert(tcp_check("db-port", port));
        fx.manager.apply(&plan);

        let change = fx.info("db-port").change_id.unwrap();
        eventually(|| fx.state.lock().change_tasks(&change)[0].status == Status::Doing).await;

        fx.runner.abort(&change).unwrap();
        let aborted = fx
            .state
            .wait_change(&change, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(aborted.status, Status::Hold);

        let reopened = fx.info("db-port").change_id.unwrap();
        assert_ne!(reopened, change);
        assert_eq!(fx.state.lock().change(&reopened).unwrap().kind, PERFORM_KIND);
        eventually(|| fx.state.lock().change_tasks(&reopened)[0].status == Status::Doing).await;
        fx.finish().await;
    }

    #[tokio::test]
    async fn manager_starts_enabled_checks_and_reports_status() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let fx = Fixture::new();
        let mut plan = Plan::default();
        plan.checks.insert(tcp_check("db-port", port).level(CheckLevel::Alive));
        plan.checks
            .insert(tcp_check("manual", port).startup(Startup::Disabled).level(CheckLevel::Ready));
        fx.manager.apply(&plan);

        let status = fx.manager.status(&[], None).unwrap();
        assert_eq!(status.len(), 2);
        assert_eq!(status[0].status, CheckState::Up);
        assert!(status[0].change_id.is_some());
        assert_eq!(status[1].status, CheckState::Inactive);
        assert_eq!(status[1].change_id, None);

        let alive = fx.manager.status(&[], Some(CheckLevel::Alive)).unwrap();
        assert_eq!(alive.len(), 1);
        let ready = fx.manager.status(&[], Some(CheckLevel::Ready)).unwrap();
        assert_eq!(ready.len(), 2);

        assert_eq!(fx.manager.start_checks(&["manual".into()]).unwrap(), vec!["manual"]);
        assert!(fx.manager.start_checks(&["manual".into()]).unwrap().is_empty());
        assert_eq!(fx.manager.stop_checks(&["db-port".into()]).unwrap(), vec!["db-port"]);
        let status = fx.info("db-port");
        assert_eq!(status.status, CheckState::Inactive);
        assert_eq!(status.failures, 0);

        assert!(matches!(
            fx.manager.status(&["nope".into()], None),
            Err(PlanError::UnknownCheck(_))
        ));
        fx.finish().await;
    }

    #[tokio::test]
    async fn closed_port_reports_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let fx = Fixture::new();
        let mut plan = Plan::default();
        plan.checks.insert(tcp_check("gone", port));
        fx.manager.apply(&plan);

        eventually(|| !fx.seen.lock().unwrap().is_empty()).await;
        let status = fx.info("gone");
        assert_eq!(status.status, CheckState::Down);
        assert!(status.failures >= 2);
        let change = status.change_id.unwrap();
        assert_eq!(fx.state.lock().change(&change).unwrap().kind, RECOVER_KIND);
        fx.finish().await;
    }

    #[tokio::test]
    async fn replan_restarts_changed_and_stops_removed_checks() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let fx = Fixture::new();
        let mut plan = Plan::default();
        plan.checks.insert(tcp_check("keep", port));
        plan.checks.insert(tcp_check("change", port));
        plan.checks.insert(tcp_check("drop", port));
        fx.manager.apply(&plan);
        fx.manager.stop_checks(&["keep".into()]).unwrap();

        let mut next = Plan::default();
        next.checks.insert(tcp_check("keep", port));
        next.checks
            .insert(tcp_check("change", port).timing(TEST_PERIOD, Duration::from_millis(25), 3));
        fx.manager.apply(&next);

        let status = fx.manager.status(&[], None).unwrap();
        let summary: Vec<(&str, CheckState, u32)> = status
            .iter()
            .map(|c| (c.name.as_str(), c.status, c.threshold))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("keep", CheckState::Inactive, 2),
                ("change", CheckState::Up, 3),
            ]
        );
        fx.finish().await;
    }

    #[tokio::test]
    async fn replan_restarts_check_when_its_service_context_changes() {
        let fx = Fixture::new();
        let mut check = Check::exec("web-ok", "true", Vec::<String>::new()).timing(
            Duration::from_secs(60),
            Duration::from_secs(1),
            3,
        );
        if let Some(exec) = check.exec.as_mut() {
            exec.service_context = Some("web".into());
        }
        let mut plan = Plan::default();
        plan.services.insert(Service::new("web", "web-server").env("PORT", "80"));
        plan.services.insert(Service::new("db", "database"));
        plan.checks.insert(check);
        fx.manager.apply(&plan);
        let first = fx.info("web-ok").change_id.unwrap();

        let mut unrelated = plan.clone();
        unrelated.services.insert(Service::new("db", "database").env("SIZE", "1G"));
        fx.manager.apply(&unrelated);
        assert_eq!(fx.info("web-ok").change_id.as_deref(), Some(first.as_str()));

        let mut changed = unrelated.clone();
        changed
            .services
            .insert(Service::new("web", "web-server").env("PORT", "8080"));
        fx.manager.apply(&changed);
        let second = fx.info("web-ok").change_id.unwrap();
        assert_ne!(second, first);
        assert_eq!(fx.info("web-ok").status, CheckState::Up);

        let done = fx
            .state
            .wait_change(&first, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(done.status, Status::Done);
        fx.finish().await;
    }
}
