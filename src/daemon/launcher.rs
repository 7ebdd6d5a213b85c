//! Process launching for services and exec checks.
//!
//! Every process is started in its own process group so that signals reach
//! the whole tree it spawns.

use super::log_buffer::LogBuffer;
use crate::error::LaunchError;
use crate::plan::{ExecCheck, Service};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{Group, Pid, User};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info};

/// Where captured stdout/stderr lines go.
#[derive(Clone)]
pub struct OutputSink {
    pub buffer: Arc<LogBuffer>,
    pub key: String,
}

/// Everything needed to start a process.
#[derive(Clone, Default)]
pub struct LaunchSpec {
    pub command: String,
    pub args: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub user: Option<String>,
    pub user_id: Option<u32>,
    pub group: Option<String>,
    pub group_id: Option<u32>,
    pub working_dir: Option<PathBuf>,
    pub output: Option<OutputSink>,
}

impl LaunchSpec {
    pub fn for_service(service: &Service) -> Self {
        Self {
            command: service.command.clone(),
            args: service.args.clone(),
            environment: service.environment.clone(),
            user: service.user.clone(),
            user_id: service.user_id,
            group: service.group.clone(),
            group_id: service.group_id,
            working_dir: service.working_dir.clone(),
            output: None,
        }
    }

    /// Exec check context: the named service's identity, directory and
    /// environment, with the check's own settings on top.
    pub fn for_exec_check(exec: &ExecCheck, context: Option<&Service>) -> Self {
        let mut spec = match context {
            Some(service) => Self::for_service(service),
            None => Self::default(),
        };
        spec.command = exec.command.clone();
        spec.args = exec.args.clone();
        spec.environment
            .extend(exec.environment.iter().map(|(k, v)| (k.clone(), v.clone())));
        if exec.user.is_some() || exec.user_id.is_some() {
            spec.user = exec.user.clone();
            spec.user_id = exec.user_id;
        }
        if exec.group.is_some() || exec.group_id.is_some() {
            spec.group = exec.group.clone();
            spec.group_id = exec.group_id;
        }
        if exec.working_dir.is_some() {
            spec.working_dir = exec.working_dir.clone();
        }
        spec
    }

    pub fn output(mut self, buffer: Arc<LogBuffer>, key: impl Into<String>) -> Self {
        self.output = Some(OutputSink {
            buffer,
            key: key.into(),
        });
        self
    }

    /// Resolve user and group names to numeric IDs. A named user without a
    /// group runs with that user's primary group.
    pub fn credentials(&self) -> Result<(Option<u32>, Option<u32>), LaunchError> {
        let mut uid = self.user_id;
        let mut primary_gid = None;
        if uid.is_none() {
            if let Some(name) = &self.user {
                let user = User::from_name(name)
                    .map_err(|e| LaunchError::Lookup(e.to_string()))?
                    .ok_or_else(|| LaunchError::UnknownUser(name.clone()))?;
                uid = Some(user.uid.as_raw());
                primary_gid = Some(user.gid.as_raw());
            }
        }
        let gid = match (self.group_id, &self.group) {
            (Some(gid), _) => Some(gid),
            (None, Some(name)) => {
                let group = Group::from_name(name)
                    .map_err(|e| LaunchError::Lookup(e.to_string()))?
                    .ok_or_else(|| LaunchError::UnknownGroup(name.clone()))?;
                Some(group.gid.as_raw())
            }
            (None, None) => primary_gid,
        };
        Ok((uid, gid))
    }

    pub fn display(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Parse `SIGTERM`, `TERM` or `term` into a signal.
pub fn parse_signal(name: &str) -> Result<Signal, LaunchError> {
    let upper = name.trim().to_ascii_uppercase();
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    Signal::from_str(&full).map_err(|_| LaunchError::InvalidSignal(name.to_string()))
}

/// A running process group.
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Deliver a signal to every process in the group.
    fn signal(&self, signal: Signal) -> Result<(), LaunchError>;

    /// Wait for the group leader to exit and return its exit code. Deaths by
    /// signal are reported as 128 + signal number.
    async fn wait(&self) -> Result<i32, LaunchError>;
}

pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> Result<Arc<dyn ProcessHandle>, LaunchError>;
}

/// Launcher backed by `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioLauncher;

impl ProcessLauncher for TokioLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<Arc<dyn ProcessHandle>, LaunchError> {
        let (uid, gid) = spec.credentials()?;

        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .envs(&spec.environment)
            .stdin(Stdio::null())
            .process_group(0);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        if let Some(gid) = gid {
            cmd.gid(gid);
        }
        if let Some(uid) = uid {
            cmd.uid(uid);
        }
        if spec.output.is_some() {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            command: spec.display(),
            source,
        })?;
        let pid = child.id();
        debug!(command = %spec.display(), ?pid, "Process started");

        if let Some(sink) = &spec.output {
            if let Some(stdout) = child.stdout.take() {
                spawn_reader(stdout, sink.clone());
            }
            if let Some(stderr) = child.stderr.take() {
                spawn_reader(stderr, sink.clone());
            }
        }

        Ok(Arc::new(TokioProcess {
            pid,
            child: tokio::sync::Mutex::new(child),
        }))
    }
}

fn spawn_reader<R>(reader: R, sink: OutputSink)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            sink.buffer.push(&sink.key, line);
        }
    });
}

struct TokioProcess {
    pid: Option<u32>,
    child: tokio::sync::Mutex<Child>,
}

#[async_trait]
impl ProcessHandle for TokioProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn signal(&self, signal: Signal) -> Result<(), LaunchError> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        let pgid = pid as i32;
        match killpg(Pid::from_raw(pgid), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(LaunchError::Signal {
                pgid,
                source: errno.into(),
            }),
        }
    }

    async fn wait(&self) -> Result<i32, LaunchError> {
        let mut child = self.child.lock().await;
        let status = child.wait().await.map_err(LaunchError::Wait)?;
        Ok(exit_code(status))
    }
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => -1,
    }
}

/// Launch `spec`, wait for it to exit within `timeout`, and return its exit
/// code. The process group is killed when the timeout elapses.
pub async fn run_to_completion(
    launcher: &dyn ProcessLauncher,
    spec: &LaunchSpec,
    timeout: std::time::Duration,
) -> Result<Option<i32>, LaunchError> {
    let process = launcher.launch(spec)?;
    match tokio::time::timeout(timeout, process.wait()).await {
        Ok(code) => code.map(Some),
        Err(_) => {
            info!(command = %spec.display(), "Killing process after timeout");
            process.signal(Signal::SIGKILL)?;
            let _ = process.wait().await;
            Ok(None)
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted processes for supervisor tests.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::sync::watch;

    /// How a fake process behaves once launched.
    #[derive(Clone, Copy, Debug)]
    pub enum Script {
        /// Exit with the code after the delay.
        ExitAfter(std::time::Duration, i32),
        /// Run until signalled; SIGTERM exits with 143 unless ignored.
        RunForever { ignore_term: bool },
    }

    pub struct FakeLauncher {
        scripts: Mutex<VecDeque<Script>>,
        fallback: Script,
        pub launched: Mutex<Vec<String>>,
        pub signals: Arc<Mutex<Vec<Signal>>>,
    }

    impl FakeLauncher {
        pub fn new(fallback: Script) -> Self {
            Self {
                scripts: Mutex::new(VecDeque::new()),
                fallback,
                launched: Mutex::new(Vec::new()),
                signals: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub fn push(&self, script: Script) {
            self.scripts.lock().unwrap().push_back(script);
        }

        pub fn launches(&self) -> usize {
            self.launched.lock().unwrap().len()
        }
    }

    impl ProcessLauncher for FakeLauncher {
        fn launch(&self, spec: &LaunchSpec) -> Result<Arc<dyn ProcessHandle>, LaunchError> {
            if spec.command == "missing-binary" {
                return Err(LaunchError::Spawn {
                    command: spec.command.clone(),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                });
            }
            self.launched.lock().unwrap().push(spec.display());
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(self.fallback);
            let (exit_tx, exit_rx) = watch::channel(None);
            if let Script::ExitAfter(delay, code) = script {
                let tx = exit_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    tx.send_if_modified(|exit| {
                        if exit.is_none() {
                            *exit = Some(code);
                            true
                        } else {
                            false
                        }
                    });
                });
            }
            let ignore_term = matches!(script, Script::RunForever { ignore_term: true });
            Ok(Arc::new(FakeProcess {
                exit_tx,
                exit_rx,
                ignore_term,
                signals: Arc::clone(&self.signals),
            }))
        }
    }

    struct FakeProcess {
        exit_tx: watch::Sender<Option<i32>>,
        exit_rx: watch::Receiver<Option<i32>>,
        ignore_term: bool,
        signals: Arc<Mutex<Vec<Signal>>>,
    }

    #[async_trait]
    impl ProcessHandle for FakeProcess {
        fn pid(&self) -> Option<u32> {
            Some(4242)
        }

        fn signal(&self, signal: Signal) -> Result<(), LaunchError> {
            self.signals.lock().unwrap().push(signal);
            let code = match signal {
                Signal::SIGKILL => Some(137),
                Signal::SIGTERM if !self.ignore_term => Some(143),
                _ => None,
            };
            if let Some(code) = code {
                self.exit_tx.send_if_modified(|exit| {
                    if exit.is_none() {
                        *exit = Some(code);
                        true
                    } else {
                        false
                    }
                });
            }
            Ok(())
        }

        async fn wait(&self) -> Result<i32, LaunchError> {
            let mut rx = self.exit_rx.clone();
            let code = *rx
                .wait_for(|exit| exit.is_some())
                .await
                .map_err(|_| LaunchError::Wait(std::io::Error::other("fake process dropped")))?;
            Ok(code.unwrap_or(-1))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn signal_names() {
        assert_eq!(parse_signal("SIGTERM").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("hup").unwrap(), Signal::SIGHUP);
        assert_eq!(parse_signal("USR1").unwrap(), Signal::SIGUSR1);
        assert!(parse_signal("SIGNOPE").is_err());
    }

    #[test]
    fn exec_check_inherits_service_context() {
        let mut service = Service::new("web", "server")
            .env("A", "service")
            .env("B", "service");
        service.user = Some("www".into());
        service.working_dir = Some("/srv/web".into());

        let mut exec = ExecCheck {
            command: "probe".into(),
            args: vec!["--fast".into()],
            ..ExecCheck::default()
        };
        exec.environment.insert("B".into(), "check".into());

        let spec = LaunchSpec::for_exec_check(&exec, Some(&service));
        assert_eq!(spec.display(), "probe --fast");
        assert_eq!(spec.environment["A"], "service");
        assert_eq!(spec.environment["B"], "check");
        assert_eq!(spec.user.as_deref(), Some("www"));
        assert_eq!(spec.working_dir, Some(PathBuf::from("/srv/web")));
    }

    #[test]
    fn unknown_user_is_reported() {
        let spec = LaunchSpec {
            command: "true".into(),
            user: Some("no-such-user-steward".into()),
            ..LaunchSpec::default()
        };
        assert!(matches!(
            spec.credentials(),
            Err(LaunchError::UnknownUser(_))
        ));
    }

    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let buffer = Arc::new(LogBuffer::new(10));
        let spec = LaunchSpec {
            command: "sh".into(),
            args: vec!["-c".into(), "echo hello; echo oops >&2; exit 3".into()],
            ..LaunchSpec::default()
        }
        .output(Arc::clone(&buffer), "probe");

        let code = run_to_completion(&TokioLauncher, &spec, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(code, Some(3));

        // Readers finish shortly after the process exits.
        for _ in 0..50 {
            if buffer.tail("probe", 10).len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let mut lines = buffer.tail("probe", 10);
        lines.sort();
        assert_eq!(lines, vec!["hello", "oops"]);
    }

    #[tokio::test]
    async fn timeout_kills_process_group() {
        let spec = LaunchSpec {
            command: "sleep".into(),
            args: vec!["30".into()],
            ..LaunchSpec::default()
        };
        let code = run_to_completion(&TokioLauncher, &spec, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(code, None);
    }

    #[tokio::test]
    async fn signalling_an_exited_group_is_not_an_error() {
        let spec = LaunchSpec {
            command: "sleep".into(),
            args: vec!["30".into()],
            ..LaunchSpec::default()
        };
        let process = TokioLauncher.launch(&spec).unwrap();
        process.signal(Signal::SIGKILL).unwrap();
        assert_eq!(process.wait().await.unwrap(), 128 + Signal::SIGKILL as i32);

        process.signal(Signal::SIGTERM).unwrap();
    }

    #[tokio::test]
    async fn missing_command_fails_to_spawn() {
        let spec = LaunchSpec {
            command: "/nonexistent/steward-binary".into(),
            ..LaunchSpec::default()
        };
        assert!(matches!(
            TokioLauncher.launch(&spec).err(),
            Some(LaunchError::Spawn { .. })
        ));
    }
}
