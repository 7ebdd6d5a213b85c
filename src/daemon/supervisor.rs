//! Per-service supervisor.
//!
//! Each service gets one actor task that exclusively owns its process
//! handle. Requests arrive over a channel, process exits arrive from a
//! monitor task blocked on `wait`, and timers (settle window, kill delays,
//! backoff) are a single deadline in the actor loop. Only one operation on a
//! service proceeds at a time because the actor handles one message at a
//! time.

use super::backoff::{self, Backoff};
use super::launcher::{LaunchSpec, ProcessHandle, ProcessLauncher};
use super::log_buffer::LogBuffer;
use super::notifier::Notifier;
use super::protocol::ServiceState;
use crate::error::ServiceError;
use crate::plan::{Service, ServiceAction};
use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// How long a new process must stay up for a start to succeed.
pub const SETTLE_WINDOW: Duration = Duration::from_secs(1);

/// How long to wait after SIGKILL before giving up on a stop.
pub const KILL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Success,
    Failure,
}

#[derive(Debug, Clone)]
pub struct ShutdownRequest {
    pub reason: ExitReason,
    pub cause: String,
}

/// Lets services and checks ask the daemon to shut down.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: mpsc::UnboundedSender<ShutdownRequest>,
}

impl ShutdownHandle {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ShutdownRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn request(&self, reason: ExitReason, cause: impl Into<String>) {
        let cause = cause.into();
        warn!(?reason, "Daemon shutdown requested: {}", cause);
        let _ = self.tx.send(ShutdownRequest { reason, cause });
    }
}

/// Collaborators shared by all supervisors.
#[derive(Clone)]
pub struct SupervisorDeps {
    pub launcher: Arc<dyn ProcessLauncher>,
    pub logs: Arc<LogBuffer>,
    pub notifier: Arc<dyn Notifier>,
    pub shutdown: ShutdownHandle,
    pub settle: Duration,
    pub kill_grace: Duration,
}

/// Point-in-time view of a supervised service.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub current: ServiceState,
    pub since: DateTime<Utc>,
    /// Successful starts since the daemon started.
    pub starts: u32,
    pub pid: Option<u32>,
    /// Fingerprint of the configuration the current process was started with.
    pub applied: Option<String>,
    /// Delay the next unplanned exit would wait before restarting.
    pub next_backoff: Duration,
}

type Reply<T = ()> = oneshot::Sender<Result<T, ServiceError>>;

enum Command {
    Start { reply: Reply<bool> },
    Stop { reply: Reply },
    Signal { signal: Signal, reply: Reply },
    CheckRestart { check: String },
    Update(Box<Service>),
}

/// Handle to a service's supervisor actor. Cloning is cheap.
#[derive(Clone)]
pub struct Supervisor {
    name: String,
    tx: mpsc::UnboundedSender<Command>,
    snapshot: Arc<Mutex<Snapshot>>,
}

impl Supervisor {
    pub fn spawn(config: Service, deps: SupervisorDeps) -> Self {
        let (tx, commands) = mpsc::unbounded_channel();
        let (exit_tx, exits) = mpsc::unbounded_channel();
        let backoff = Backoff::for_service(&config);
        let snapshot = Arc::new(Mutex::new(Snapshot {
            current: ServiceState::Inactive,
            since: Utc::now(),
            starts: 0,
            pid: None,
            applied: None,
            next_backoff: backoff.current(),
        }));
        let name = config.name.clone();
        let actor = Actor {
            config,
            deps,
            snapshot: Arc::clone(&snapshot),
            phase: Phase::Inactive,
            process: None,
            generation: 0,
            launched_at: None,
            backoff,
            deadline: None,
            exit_tx,
        };
        tokio::spawn(actor.run(commands, exits));
        Self { name, tx, snapshot }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.lock().expect("snapshot lock poisoned").clone()
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| ServiceError::SupervisorGone(self.name.clone()))?;
        rx.await
            .map_err(|_| ServiceError::SupervisorGone(self.name.clone()))?
    }

    /// Start the service and wait for the settle window. Returns whether
    /// this request launched the process: starting a running service, or
    /// joining a start already in progress, succeeds with `false`.
    pub async fn start(&self) -> Result<bool, ServiceError> {
        self.request(|reply| Command::Start { reply }).await
    }

    /// Stop the service: SIGTERM, then SIGKILL after the kill delay.
    pub async fn stop(&self) -> Result<(), ServiceError> {
        self.request(|reply| Command::Stop { reply }).await
    }

    pub async fn signal(&self, signal: Signal) -> Result<(), ServiceError> {
        self.request(|reply| Command::Signal { signal, reply }).await
    }

    /// Terminate the running process and restart it through one backoff
    /// step. Ignored unless the service is running.
    pub fn restart_for_check(&self, check: &str) {
        let _ = self.tx.send(Command::CheckRestart {
            check: check.to_string(),
        });
    }

    /// Use a new configuration for future launches.
    pub fn update(&self, config: Service) {
        let _ = self.tx.send(Command::Update(Box::new(config)));
    }
}

enum Phase {
    Inactive,
    /// Each waiting start reply carries whether it launched the process.
    Starting {
        replies: Vec<(Reply<bool>, bool)>,
    },
    Running,
    Stopping {
        replies: Vec<Reply>,
        restart: bool,
    },
    Backoff,
    Error,
}

impl Phase {
    fn state(&self) -> ServiceState {
        match self {
            Phase::Inactive => ServiceState::Inactive,
            Phase::Starting { .. } => ServiceState::Starting,
            Phase::Running => ServiceState::Running,
            Phase::Stopping { .. } => ServiceState::Stopping,
            Phase::Backoff => ServiceState::Backoff,
            Phase::Error => ServiceState::Error,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Timer {
    Settle,
    KillDelay,
    KillGrace,
    Restart,
}

struct Actor {
    config: Service,
    deps: SupervisorDeps,
    snapshot: Arc<Mutex<Snapshot>>,
    phase: Phase,
    process: Option<Arc<dyn ProcessHandle>>,
    generation: u64,
    launched_at: Option<Instant>,
    backoff: Backoff,
    deadline: Option<(Instant, Timer)>,
    exit_tx: mpsc::UnboundedSender<(u64, i32)>,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut exits: mpsc::UnboundedReceiver<(u64, i32)>,
    ) {
        loop {
            let deadline = self.deadline.map(|(at, _)| at);
            let wake = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                Some((generation, code)) = exits.recv() => self.on_exit(generation, code),
                _ = tokio::time::sleep_until(wake), if deadline.is_some() => self.on_timer(),
            }
        }
        if let Some(process) = &self.process {
            let _ = process.signal(Signal::SIGKILL);
        }
        debug!(service = %self.config.name, "Supervisor stopped");
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn transition(&mut self, phase: Phase) {
        let current = phase.state();
        self.phase = phase;
        let changed = {
            let mut snapshot = self.snapshot.lock().expect("snapshot lock poisoned");
            snapshot.pid = self.process.as_ref().and_then(|p| p.pid());
            snapshot.next_backoff = self.backoff.current();
            if snapshot.current != current {
                snapshot.current = current;
                snapshot.since = Utc::now();
                true
            } else {
                false
            }
        };
        if changed {
            debug!(service = %self.config.name, current = current.as_str(), "Service transition");
            self.deps.notifier.service_updated(&self.config.name, current);
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Start { reply } => self.on_start(reply),
            Command::Stop { reply } => self.on_stop(reply),
            Command::Signal { signal, reply } => {
                let result = match &self.process {
                    Some(process) => {
                        process
                            .signal(signal)
                            .map_err(|source| ServiceError::Launch {
                                service: self.config.name.clone(),
                                source,
                            })
                    }
                    None => Err(ServiceError::NotRunning {
                        service: self.config.name.clone(),
                    }),
                };
                let _ = reply.send(result);
            }
            Command::CheckRestart { check } => self.on_check_restart(&check),
            Command::Update(config) => {
                if config.backoff_delay != self.config.backoff_delay
                    || config.backoff_factor != self.config.backoff_factor
                    || config.backoff_limit != self.config.backoff_limit
                {
                    self.backoff = Backoff::for_service(&config);
                }
                self.config = *config;
            }
        }
    }

    fn launch(&mut self) -> Result<(), ServiceError> {
        let spec = LaunchSpec::for_service(&self.config)
            .output(Arc::clone(&self.deps.logs), self.config.name.clone());
        let process = self
            .deps
            .launcher
            .launch(&spec)
            .map_err(|source| ServiceError::Launch {
                service: self.config.name.clone(),
                source,
            })?;
        self.generation += 1;
        let generation = self.generation;
        let monitor = Arc::clone(&process);
        let exit_tx = self.exit_tx.clone();
        tokio::spawn(async move {
            let code = monitor.wait().await.unwrap_or(-1);
            let _ = exit_tx.send((generation, code));
        });

        info!(service = %self.config.name, pid = ?process.pid(), "Service process started");
        self.process = Some(process);
        self.launched_at = Some(Instant::now());
        self.deadline = Some((Instant::now() + self.deps.settle, Timer::Settle));
        self.snapshot.lock().expect("snapshot lock poisoned").applied =
            Some(self.config.fingerprint());
        Ok(())
    }

    fn on_start(&mut self, reply: Reply<bool>) {
        match &mut self.phase {
            Phase::Running => {
                let _ = reply.send(Ok(false));
            }
            Phase::Starting { replies } => replies.push((reply, false)),
            Phase::Stopping { .. } => {
                let _ = reply.send(Err(ServiceError::InvalidState {
                    service: self.config.name.clone(),
                    operation: "start",
                    state: "stopping".into(),
                }));
            }
            Phase::Error if self.process.is_some() => {
                let _ = reply.send(Err(ServiceError::InvalidState {
                    service: self.config.name.clone(),
                    operation: "start",
                    state: "an old process is still running".into(),
                }));
            }
            Phase::Inactive | Phase::Backoff | Phase::Error => {
                self.backoff.reset();
                self.deadline = None;
                match self.launch() {
                    Ok(()) => self.transition(Phase::Starting {
                        replies: vec![(reply, true)],
                    }),
                    Err(e) => {
                        error!(service = %self.config.name, "Cannot start service: {}", e);
                        self.transition(Phase::Error);
                        let _ = reply.send(Err(e));
                    }
                }
            }
        }
    }

    fn on_stop(&mut self, reply: Reply) {
        match std::mem::replace(&mut self.phase, Phase::Inactive) {
            Phase::Stopping { mut replies, .. } => {
                replies.push(reply);
                // An explicit stop cancels a pending check restart.
                self.phase = Phase::Stopping {
                    replies,
                    restart: false,
                };
            }
            Phase::Starting { replies } => {
                for (waiting, _) in replies {
                    let _ = waiting.send(Err(ServiceError::StoppedDuringStart {
                        service: self.config.name.clone(),
                        settle: self.deps.settle,
                    }));
                }
                self.terminate(vec![reply], false);
            }
            Phase::Running => self.terminate(vec![reply], false),
            Phase::Error if self.process.is_some() => self.terminate(vec![reply], false),
            Phase::Backoff => {
                self.deadline = None;
                info!(service = %self.config.name, "Pending restart cancelled");
                self.transition(Phase::Inactive);
                let _ = reply.send(Ok(()));
            }
            phase @ (Phase::Inactive | Phase::Error) => {
                self.phase = phase;
                let _ = reply.send(Ok(()));
            }
        }
    }

    fn on_check_restart(&mut self, check: &str) {
        if !matches!(self.phase, Phase::Running) {
            debug!(service = %self.config.name, check, "Ignoring check restart, service not running");
            return;
        }
        info!(service = %self.config.name, check, "Restarting service after check failure");
        self.terminate(Vec::new(), true);
    }

    /// Send SIGTERM to the process group and arm the kill-delay timer.
    fn terminate(&mut self, replies: Vec<Reply>, restart: bool) {
        if let Some(process) = &self.process {
            if let Err(e) = process.signal(Signal::SIGTERM) {
                warn!(service = %self.config.name, "Cannot send SIGTERM: {}", e);
            }
        }
        self.deadline = Some((Instant::now() + self.config.kill_delay, Timer::KillDelay));
        self.transition(Phase::Stopping { replies, restart });
    }

    fn on_timer(&mut self) {
        let Some((_, timer)) = self.deadline.take() else {
            return;
        };
        match (timer, std::mem::replace(&mut self.phase, Phase::Inactive)) {
            (Timer::Settle, Phase::Starting { replies }) => {
                self.snapshot.lock().expect("snapshot lock poisoned").starts += 1;
                self.transition(Phase::Running);
                info!(service = %self.config.name, "Service running");
                for (reply, launched) in replies {
                    let _ = reply.send(Ok(launched));
                }
            }
            (Timer::KillDelay, Phase::Stopping { replies, restart, .. }) => {
                warn!(
                    service = %self.config.name,
                    kill_delay = ?self.config.kill_delay,
                    "Service still running after SIGTERM, sending SIGKILL"
                );
                if let Some(process) = &self.process {
                    if let Err(e) = process.signal(Signal::SIGKILL) {
                        warn!(service = %self.config.name, "Cannot send SIGKILL: {}", e);
                    }
                }
                self.deadline = Some((Instant::now() + self.deps.kill_grace, Timer::KillGrace));
                self.phase = Phase::Stopping { replies, restart };
            }
            (Timer::KillGrace, Phase::Stopping { replies, .. }) => {
                error!(service = %self.config.name, "Service did not exit after SIGKILL");
                self.transition(Phase::Error);
                for reply in replies {
                    let _ = reply.send(Err(ServiceError::StillRunning {
                        service: self.config.name.clone(),
                    }));
                }
            }
            (Timer::Restart, Phase::Backoff) => {
                info!(service = %self.config.name, "Restarting service after backoff");
                self.phase = Phase::Backoff;
                match self.launch() {
                    Ok(()) => self.transition(Phase::Starting {
                        replies: Vec::new(),
                    }),
                    Err(e) => {
                        error!(service = %self.config.name, "Cannot restart service: {}", e);
                        self.transition(Phase::Error);
                    }
                }
            }
            (timer, phase) => {
                debug!(service = %self.config.name, ?timer, "Stale timer");
                self.phase = phase;
            }
        }
    }

    fn on_exit(&mut self, generation: u64, code: i32) {
        if generation != self.generation {
            return;
        }
        self.process = None;
        self.deadline = None;
        let ran_for = self
            .launched_at
            .take()
            .map(|at| at.elapsed())
            .unwrap_or_default();

        match std::mem::replace(&mut self.phase, Phase::Inactive) {
            Phase::Starting { replies } => {
                let (action, _) = self.config.exit_action(code);
                let restart = action == ServiceAction::Restart;
                warn!(service = %self.config.name, code, "Service exited during settle window");
                for (reply, _) in replies {
                    let _ = reply.send(Err(ServiceError::ExitedEarly {
                        service: self.config.name.clone(),
                        code,
                        action: if restart { "restart" } else { "not restart" }.into(),
                    }));
                }
                if restart {
                    self.enter_backoff(ran_for);
                } else {
                    self.transition(Phase::Error);
                }
            }
            Phase::Running => self.on_unplanned_exit(code, ran_for),
            Phase::Stopping {
                replies, restart, ..
            } => {
                info!(service = %self.config.name, code, "Service stopped");
                if restart {
                    self.enter_backoff(ran_for);
                } else {
                    self.transition(Phase::Inactive);
                }
                for reply in replies {
                    let _ = reply.send(Ok(()));
                }
            }
            Phase::Backoff | Phase::Inactive | Phase::Error => self.transition(Phase::Inactive),
        }
    }

    fn on_unplanned_exit(&mut self, code: i32, ran_for: Duration) {
        let (action, field) = self.config.exit_action(code);
        warn!(
            service = %self.config.name,
            code,
            action = action.as_str(),
            "Service exited unexpectedly"
        );
        let cause = format!(
            "service {:?} exited with code {code} ({field}: {action})",
            self.name()
        );
        match action {
            ServiceAction::Restart => self.enter_backoff(ran_for),
            ServiceAction::Ignore => self.transition(Phase::Inactive),
            ServiceAction::Shutdown => {
                let reason = if code == 0 {
                    ExitReason::Success
                } else {
                    ExitReason::Failure
                };
                self.deps.shutdown.request(reason, cause);
                self.transition(Phase::Inactive);
            }
            ServiceAction::SuccessShutdown => {
                self.deps.shutdown.request(ExitReason::Success, cause);
                self.transition(Phase::Inactive);
            }
            ServiceAction::FailureShutdown => {
                self.deps.shutdown.request(ExitReason::Failure, cause);
                self.transition(Phase::Inactive);
            }
        }
    }

    fn enter_backoff(&mut self, ran_for: Duration) {
        let delay = self.backoff.on_exit(ran_for);
        let sleep = backoff::jitter(delay);
        info!(
            service = %self.config.name,
            delay = ?delay,
            restarts = self.backoff.restarts(),
            "Service will restart after backoff"
        );
        self.deadline = Some((Instant::now() + sleep, Timer::Restart));
        self.transition(Phase::Backoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::launcher::testing::{FakeLauncher, Script};
    use crate::daemon::launcher::TokioLauncher;
    use crate::daemon::notifier::TracingNotifier;
    use crate::error::LaunchError;

    fn deps(launcher: Arc<dyn ProcessLauncher>) -> (SupervisorDeps, mpsc::UnboundedReceiver<ShutdownRequest>) {
        let (shutdown, rx) = ShutdownHandle::new();
        (
            SupervisorDeps {
                launcher,
                logs: Arc::new(LogBuffer::default()),
                notifier: Arc::new(TracingNotifier),
                shutdown,
                settle: Duration::from_millis(50),
                kill_grace: Duration::from_millis(100),
            },
            rx,
        )
    }

    fn fast(service: Service) -> Service {
        service
            .backoff(Duration::from_millis(200), 2.0, Duration::from_secs(5))
            .kill_delay(Duration::from_millis(100))
    }

    async fn wait_for(sup: &Supervisor, state: ServiceState) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while sup.snapshot().current != state {
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {state:?}, still {:?}",
                sup.snapshot().current
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn long_running_command_starts() {
        let (mut deps, _rx) = deps(Arc::new(TokioLauncher));
        deps.settle = SETTLE_WINDOW;
        let sup = Supervisor::spawn(Service::new("sleeper", "sleep").args(["300"]), deps);

        assert!(sup.start().await.unwrap());
        let snapshot = sup.snapshot();
        assert_eq!(snapshot.current, ServiceState::Running);
        assert_eq!(snapshot.starts, 1);
        assert!(snapshot.pid.is_some());
        assert!(!sup.start().await.unwrap());
        assert_eq!(sup.snapshot().starts, 1);

        sup.stop().await.unwrap();
        assert_eq!(sup.snapshot().current, ServiceState::Inactive);
    }

    #[tokio::test]
    async fn command_exiting_inside_settle_window_fails_start() {
        let (mut deps, _rx) = deps(Arc::new(TokioLauncher));
        deps.settle = SETTLE_WINDOW;
        let sup = Supervisor::spawn(Service::new("quick", "sleep").args(["0.1"]), deps);

        let err = sup.start().await.unwrap_err();
        assert!(matches!(err, ServiceError::ExitedEarly { code: 0, .. }));
        assert_eq!(sup.snapshot().current, ServiceState::Backoff);

        sup.stop().await.unwrap();
        assert_eq!(sup.snapshot().current, ServiceState::Inactive);
    }

    #[tokio::test]
    async fn early_exit_without_restart_is_an_error() {
        let launcher = Arc::new(FakeLauncher::new(Script::ExitAfter(Duration::from_millis(5), 2)));
        let (deps, _rx) = deps(launcher);
        let service = fast(Service::new("once", "x"))
            .on_exit(ServiceAction::Ignore, ServiceAction::Ignore);
        let sup = Supervisor::spawn(service, deps);

        let err = sup.start().await.unwrap_err();
        assert!(err.to_string().contains("will not restart"));
        assert_eq!(sup.snapshot().current, ServiceState::Error);
    }

    #[tokio::test]
    async fn unplanned_exit_restarts_after_backoff() {
        let launcher = Arc::new(FakeLauncher::new(Script::RunForever { ignore_term: false }));
        launcher.push(Script::ExitAfter(Duration::from_millis(100), 1));
        let (deps, _rx) = deps(launcher.clone());
        let sup = Supervisor::spawn(fast(Service::new("flaky", "x")), deps);

        sup.start().await.unwrap();
        wait_for(&sup, ServiceState::Backoff).await;
        assert_eq!(sup.snapshot().next_backoff, Duration::from_millis(400));
        wait_for(&sup, ServiceState::Running).await;

        assert_eq!(launcher.launches(), 2);
        assert_eq!(sup.snapshot().starts, 2);
    }

    #[tokio::test]
    async fn ignore_action_leaves_service_inactive() {
        let launcher = Arc::new(FakeLauncher::new(Script::ExitAfter(Duration::from_millis(100), 0)));
        let (deps, _rx) = deps(launcher.clone());
        let service = fast(Service::new("job", "x"))
            .on_exit(ServiceAction::Ignore, ServiceAction::Restart);
        let sup = Supervisor::spawn(service, deps);

        sup.start().await.unwrap();
        wait_for(&sup, ServiceState::Inactive).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(launcher.launches(), 1);
    }

    #[tokio::test]
    async fn shutdown_action_requests_daemon_exit() {
        let launcher = Arc::new(FakeLauncher::new(Script::ExitAfter(Duration::from_millis(100), 3)));
        let (deps, mut rx) = deps(launcher);
        let service = fast(Service::new("critical", "x"))
            .on_exit(ServiceAction::Restart, ServiceAction::Shutdown);
        let sup = Supervisor::spawn(service, deps);

        sup.start().await.unwrap();
        let request = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.reason, ExitReason::Failure);
        assert!(request.cause.contains("on-failure"));
    }

    #[tokio::test]
    async fn stop_escalates_to_sigkill() {
        let launcher = Arc::new(FakeLauncher::new(Script::RunForever { ignore_term: true }));
        let (deps, _rx) = deps(launcher.clone());
        let sup = Supervisor::spawn(fast(Service::new("stubborn", "x")), deps);

        sup.start().await.unwrap();
        sup.stop().await.unwrap();
        assert_eq!(sup.snapshot().current, ServiceState::Inactive);
        assert_eq!(
            *launcher.signals.lock().unwrap(),
            vec![Signal::SIGTERM, Signal::SIGKILL]
        );
    }

    #[tokio::test]
    async fn check_restart_goes_through_one_backoff_step() {
        let launcher = Arc::new(FakeLauncher::new(Script::RunForever { ignore_term: false }));
        let (deps, _rx) = deps(launcher.clone());
        let sup = Supervisor::spawn(fast(Service::new("web", "x")), deps);

        sup.start().await.unwrap();
        sup.restart_for_check("web-up");
        wait_for(&sup, ServiceState::Backoff).await;
        wait_for(&sup, ServiceState::Running).await;

        assert_eq!(launcher.launches(), 2);
        assert_eq!(*launcher.signals.lock().unwrap(), vec![Signal::SIGTERM]);
    }

    #[tokio::test]
    async fn start_joining_a_pending_start_did_not_launch() {
        let launcher = Arc::new(FakeLauncher::new(Script::RunForever { ignore_term: false }));
        let (deps, _rx) = deps(launcher.clone());
        let sup = Supervisor::spawn(fast(Service::new("web", "x")), deps);

        let (first, second) = tokio::join!(sup.start(), sup.start());
        let mut launched = vec![first.unwrap(), second.unwrap()];
        launched.sort();
        assert_eq!(launched, vec![false, true]);
        assert_eq!(launcher.launches(), 1);
    }

    #[tokio::test]
    async fn check_restart_ignored_when_not_running() {
        let launcher = Arc::new(FakeLauncher::new(Script::RunForever { ignore_term: false }));
        let (deps, _rx) = deps(launcher.clone());
        let sup = Supervisor::spawn(fast(Service::new("web", "x")), deps);

        sup.restart_for_check("web-up");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sup.snapshot().current, ServiceState::Inactive);
        assert_eq!(launcher.launches(), 0);
    }

    #[tokio::test]
    async fn launch_failure_is_reported() {
        let launcher = Arc::new(FakeLauncher::new(Script::RunForever { ignore_term: false }));
        let (deps, _rx) = deps(launcher);
        let sup = Supervisor::spawn(Service::new("ghost", "missing-binary"), deps);

        let err = sup.start().await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Launch {
                source: LaunchError::Spawn { .. },
                ..
            }
        ));
        assert_eq!(sup.snapshot().current, ServiceState::Error);
    }

    #[tokio::test]
    async fn signal_requires_running_process() {
        let launcher = Arc::new(FakeLauncher::new(Script::RunForever { ignore_term: true }));
        let (deps, _rx) = deps(launcher.clone());
        let sup = Supervisor::spawn(fast(Service::new("web", "x")), deps);

        assert!(matches!(
            sup.signal(Signal::SIGHUP).await,
            Err(ServiceError::NotRunning { .. })
        ));
        sup.start().await.unwrap();
        sup.signal(Signal::SIGHUP).await.unwrap();
        assert_eq!(*launcher.signals.lock().unwrap(), vec![Signal::SIGHUP]);
    }
}
