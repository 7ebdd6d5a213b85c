use super::launcher::{parse_signal, ProcessLauncher, TokioLauncher};
use super::notifier::{Notifier, TracingNotifier};
use super::protocol::{ArchivedRequest, ChangeInfo, MessageFrame, Response, TaskInfo};
use super::supervisor::{ExitReason, ShutdownRequest, SETTLE_WINDOW};
use super::Daemon;
use crate::clienv;
use crate::error::StateError;
use crate::plan::CheckLevel;
use crate::state::RunnerConfig;
use anyhow::{Context, Result};
use rkyv::util::AlignedVec;
use std::fmt::Display;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

use tracing::{debug, error, info, trace, warn};

/// Requests larger than this are rejected without being read.
const MAX_REQUEST_LEN: usize = 1 << 20;

pub struct DaemonConfig {
    pub socket_path: PathBuf,
    pub state_dir: PathBuf,
    pub plan_path: Option<PathBuf>,
    pub runner: RunnerConfig,
    /// How long a new process must stay up before its start succeeds.
    pub settle_window: Duration,
    /// Upper bound on stopping services during daemon shutdown.
    pub stop_timeout: Duration,
    /// Start `startup = "enabled"` services once the socket is up.
    pub autostart: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: clienv::socket_path(),
            state_dir: clienv::state_dir(),
            plan_path: Some(clienv::plan_path()),
            runner: RunnerConfig::default(),
            settle_window: SETTLE_WINDOW,
            stop_timeout: Duration::from_secs(120),
            autostart: true,
        }
    }
}

pub struct DaemonServer {
    config: DaemonConfig,
    daemon: Arc<Daemon>,
    requests: Option<mpsc::UnboundedReceiver<ShutdownRequest>>,
    started_at: Instant,
    version: String,
}

impl DaemonServer {
    pub async fn new(config: DaemonConfig) -> Result<Self> {
        Self::with_launcher(config, Arc::new(TokioLauncher), Arc::new(TracingNotifier)).await
    }

    pub async fn with_launcher(
        config: DaemonConfig,
        launcher: Arc<dyn ProcessLauncher>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        if UnixStream::connect(&config.socket_path).await.is_ok() {
            anyhow::bail!(
                "Daemon already running on {}",
                config.socket_path.display()
            );
        }

        let (daemon, requests) =
            Daemon::init(&config, launcher, notifier).context("Failed to initialize daemon")?;

        Ok(Self {
            config,
            daemon: Arc::new(daemon),
            requests: Some(requests),
            started_at: Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    pub fn daemon(&self) -> &Arc<Daemon> {
        &self.daemon
    }

    /// Serve the control socket until a shutdown is requested, then stop
    /// every service. Returns the reason the daemon exits with.
    pub async fn run(mut self) -> Result<ExitReason> {
        info!("Steward daemon starting...");
        let mut requests = self
            .requests
            .take()
            .context("Daemon server can only run once")?;

        if self.config.socket_path.exists() {
            std::fs::remove_file(&self.config.socket_path)?;
        }

        if let Some(parent) = self.config.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.config.socket_path)?;
        info!(
            "IPC server listening on: {}",
            self.config.socket_path.display()
        );

        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.config.socket_path, perms)?;
        }

        if self.config.autostart {
            match self.daemon.services().autostart() {
                Ok(change) => info!(change = %change, "Autostarting enabled services"),
                Err(e) => warn!("Failed to autostart services: {}", e),
            }
        }

        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        let server = Arc::new(self);
        info!("Steward daemon ready");

        let reason = loop {
            tokio::select! {
                conn = listener.accept() => {
                    match conn {
                        Ok((stream, _)) => {
                            let server = Arc::clone(&server);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream).await {
                                    error!("Connection handler error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                request = requests.recv() => {
                    match request {
                        Some(request) => {
                            info!(cause = %request.cause, "Shutdown requested");
                            break request.reason;
                        }
                        None => break ExitReason::Success,
                    }
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                    break ExitReason::Success;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT");
                    break ExitReason::Success;
                }
            }
        };

        info!("Stopping all services...");
        if let Err(e) = server.daemon.shutdown().await {
            error!("Shutdown incomplete: {}", e);
        }

        if server.config.socket_path.exists() {
            std::fs::remove_file(&server.config.socket_path)?;
        }

        info!(?reason, "Steward daemon stopped");
        Ok(reason)
    }

    async fn handle_connection(&self, mut stream: UnixStream) -> Result<()> {
        trace!("New connection accepted");

        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await?;
        let len = MessageFrame::read_length(&len_buf);
        trace!("Request length: {} bytes", len);
        if len > MAX_REQUEST_LEN {
            anyhow::bail!("Request of {} bytes exceeds limit", len);
        }

        let mut request_buf: AlignedVec = AlignedVec::with_capacity(len);
        request_buf.resize(len, 0);
        stream.read_exact(&mut request_buf).await?;

        let archived = rkyv::access::<ArchivedRequest, rkyv::rancor::Error>(&request_buf)
            .map_err(|e| anyhow::anyhow!("Failed to deserialize request: {}", e))?;

        let response = self.handle_request(archived).await;

        let response_bytes = MessageFrame::encode_response(&response)
            .map_err(|e| anyhow::anyhow!("Failed to encode response: {}", e))?;
        stream.write_all(&response_bytes).await?;
        stream.flush().await?;

        trace!("Response sent");
        Ok(())
    }

    async fn handle_request(&self, request: &ArchivedRequest) -> Response {
        let services = self.daemon.services();
        match request {
            ArchivedRequest::Ping => {
                debug!("Handling: Ping");
                Response::Pong {
                    uptime_secs: self.started_at.elapsed().as_secs(),
                    version: self.version.clone(),
                }
            }

            ArchivedRequest::Shutdown => {
                info!("Handling: Shutdown");
                self.daemon
                    .request_shutdown(ExitReason::Success, "requested over the control socket");
                Response::Ok
            }

            ArchivedRequest::Start { names } => {
                let names = strings(names);
                debug!("Handling: Start({:?})", names);
                accepted(services.start(&names))
            }

            ArchivedRequest::Stop { names, all } => {
                let names = strings(names);
                debug!("Handling: Stop({:?}, all: {})", names, all);
                if *all {
                    accepted(services.stop_running())
                } else {
                    accepted(services.stop(&names))
                }
            }

            ArchivedRequest::Restart { names } => {
                let names = strings(names);
                debug!("Handling: Restart({:?})", names);
                accepted(services.restart(&names))
            }

            ArchivedRequest::Replan => {
                debug!("Handling: Replan");
                accepted(self.daemon.replan())
            }

            ArchivedRequest::Autostart => {
                debug!("Handling: Autostart");
                accepted(services.autostart())
            }

            ArchivedRequest::Signal { signal, names } => {
                let names = strings(names);
                debug!("Handling: Signal({}, {:?})", signal, names);
                let signal = match parse_signal(signal.as_str()) {
                    Ok(signal) => signal,
                    Err(e) => return failure(e),
                };
                match services.signal(&names, signal).await {
                    Ok(()) => Response::Ok,
                    Err(e) => failure(e),
                }
            }

            ArchivedRequest::Services { names } => {
                debug!("Handling: Services");
                match services.service_status(&strings(names)) {
                    Ok(list) => Response::Services { list },
                    Err(e) => failure(e),
                }
            }

            ArchivedRequest::ServiceLogs { name, lines } => {
                let n = lines.to_native() as usize;
                debug!("Handling: ServiceLogs({}, lines: {})", name, n);
                Response::Logs {
                    lines: services.logs().tail(name.as_str(), n),
                }
            }

            ArchivedRequest::Checks { names, level } => {
                debug!("Handling: Checks");
                let level = match level.as_ref() {
                    None => None,
                    Some(level) => match CheckLevel::parse(level.as_str()) {
                        Some(level) => Some(level),
                        None => return failure(format!("invalid check level {:?}", level.as_str())),
                    },
                };
                match self.daemon.checks().status(&strings(names), level) {
                    Ok(list) => Response::Checks { list },
                    Err(e) => failure(e),
                }
            }

            ArchivedRequest::StartChecks { names } => {
                let names = strings(names);
                debug!("Handling: StartChecks({:?})", names);
                match self.daemon.checks().start_checks(&names) {
                    Ok(started) => {
                        info!(checks = ?started, "Checks started");
                        Response::Ok
                    }
                    Err(e) => failure(e),
                }
            }

            ArchivedRequest::StopChecks { names } => {
                let names = strings(names);
                debug!("Handling: StopChecks({:?})", names);
                match self.daemon.checks().stop_checks(&names) {
                    Ok(stopped) => {
                        info!(checks = ?stopped, "Checks stopped");
                        Response::Ok
                    }
                    Err(e) => failure(e),
                }
            }

            ArchivedRequest::Changes => {
                debug!("Handling: Changes");
                let st = self.daemon.state().lock();
                Response::Changes {
                    list: st.changes().into_iter().map(ChangeInfo::from).collect(),
                }
            }

            ArchivedRequest::Change { id } => {
                debug!("Handling: Change({})", id);
                self.change_response(id.as_str())
            }

            ArchivedRequest::WaitChange { id, timeout_ms } => {
                let timeout = timeout_ms
                    .as_ref()
                    .map(|ms| Duration::from_millis(ms.to_native()));
                debug!("Handling: WaitChange({}, timeout: {:?})", id, timeout);
                match self.daemon.wait_change(id.as_str(), timeout).await {
                    Ok(_) => self.change_response(id.as_str()),
                    Err(e) => failure(e),
                }
            }

            ArchivedRequest::Abort { id } => {
                info!("Handling: Abort({})", id);
                match self.daemon.runner().abort(id.as_str()) {
                    Ok(()) => Response::Ok,
                    Err(e) => failure(e),
                }
            }
        }
    }

    fn change_response(&self, id: &str) -> Response {
        let st = self.daemon.state().lock();
        match st.change(id) {
            Some(change) => Response::Change {
                change: ChangeInfo::from(change),
                tasks: st.change_tasks(id).into_iter().map(TaskInfo::from).collect(),
            },
            None => failure(StateError::NoChange(id.to_string())),
        }
    }
}

fn strings(archived: &rkyv::vec::ArchivedVec<rkyv::string::ArchivedString>) -> Vec<String> {
    archived.iter().map(|s| s.to_string()).collect()
}

fn accepted<E: Display>(result: std::result::Result<String, E>) -> Response {
    match result {
        Ok(change_id) => Response::Accepted { change_id },
        Err(e) => failure(e),
    }
}

fn failure(e: impl Display) -> Response {
    Response::Error {
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::client::DaemonClient;
    use crate::daemon::launcher::testing::{FakeLauncher, Script};
    use crate::daemon::protocol::{Request, ServiceState};

    const PLAN: &str = r#"
[services.db]
command = "postgres"

[services.web]
command = "server"
requires = ["db"]

[checks.db-port]
tcp = { port = 1 }
startup = "disabled"
"#;

    fn config(dir: &std::path::Path) -> DaemonConfig {
        let plan_path = dir.join("plan.toml");
        std::fs::write(&plan_path, PLAN).unwrap();
        DaemonConfig {
            socket_path: dir.join("steward.sock"),
            state_dir: dir.join("state"),
            plan_path: Some(plan_path),
            runner: RunnerConfig::default(),
            settle_window: Duration::from_millis(30),
            stop_timeout: Duration::from_secs(10),
            autostart: false,
        }
    }

    async fn serve(dir: &std::path::Path) -> (DaemonClient, tokio::task::JoinHandle<Result<ExitReason>>) {
        let config = config(dir);
        let client = DaemonClient::with_socket(config.socket_path.clone());
        let launcher = Arc::new(FakeLauncher::new(Script::RunForever { ignore_term: false }));
        let server = DaemonServer::with_launcher(config, launcher, Arc::new(TracingNotifier))
            .await
            .unwrap();
        let handle = tokio::spawn(server.run());
        for _ in 0..100 {
            if client.is_running().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        (client, handle)
    }

    #[test]
    fn test_daemon_config_default() {
        let config = DaemonConfig::default();
        assert!(config.socket_path.to_string_lossy().ends_with("steward.sock"));
        assert!(config.autostart);
        assert_eq!(config.runner.max_ready_changes, 500);
    }

    #[tokio::test]
    async fn start_services_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let (client, handle) = serve(dir.path()).await;

        let (_, version) = client.ping().await.unwrap();
        assert_eq!(version, env!("CARGO_PKG_VERSION"));

        let id = client.start(&["web".to_string()]).await.unwrap();
        let (change, tasks) = client
            .wait_change(&id, Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(change.status, "Done");
        assert_eq!(tasks.len(), 2);

        let services = client.services(&[]).await.unwrap();
        assert_eq!(services.len(), 2);
        assert!(services.iter().all(|s| s.current == ServiceState::Running));

        client.shutdown().await.unwrap();
        assert_eq!(handle.await.unwrap().unwrap(), ExitReason::Success);
        assert!(!dir.path().join("steward.sock").exists());
    }

    #[tokio::test]
    async fn errors_are_reported_to_the_client() {
        let dir = tempfile::tempdir().unwrap();
        let (client, handle) = serve(dir.path()).await;

        let err = client.start(&["nope".to_string()]).await.unwrap_err();
        assert!(err.to_string().contains("\"nope\""));

        match client.send(&Request::Checks { names: vec![], level: Some("bogus".into()) }).await.unwrap() {
            Response::Error { message } => assert!(message.contains("bogus")),
            other => panic!("unexpected response {other:?}"),
        }

        let checks = client.checks(&[], None).await.unwrap();
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].status.as_str(), "inactive");

        client.shutdown().await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn second_daemon_refuses_to_start() {
        let dir = tempfile::tempdir().unwrap();
        let (client, handle) = serve(dir.path()).await;

        let launcher = Arc::new(FakeLauncher::new(Script::RunForever { ignore_term: false }));
        let second =
            DaemonServer::with_launcher(config(dir.path()), launcher, Arc::new(TracingNotifier)).await;
        assert!(second.is_err());

        client.shutdown().await.unwrap();
        handle.await.unwrap().unwrap();
    }
}
