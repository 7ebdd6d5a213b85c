//! Control socket client used by the CLI.

use super::protocol::{ChangeInfo, CheckInfo, MessageFrame, Request, Response, ServiceInfo, TaskInfo};
use crate::clienv;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::trace;

pub struct DaemonClient {
    socket_path: PathBuf,
}

impl Default for DaemonClient {
    fn default() -> Self {
        Self::new()
    }
}

impl DaemonClient {
    pub fn new() -> Self {
        Self::with_socket(clienv::socket_path())
    }

    pub fn with_socket(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }

    pub async fn is_running(&self) -> bool {
        self.ping().await.is_ok()
    }

    /// Send one request and read its response.
    pub async fn send(&self, request: &Request) -> Result<Response> {
        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .with_context(|| {
                format!(
                    "Cannot connect to daemon at {} (is `steward run` active?)",
                    self.socket_path.display()
                )
            })?;

        let frame = MessageFrame::encode_request(request)
            .map_err(|e| anyhow::anyhow!("Failed to encode request: {}", e))?;
        stream.write_all(&frame).await?;
        stream.flush().await?;

        let mut len_buf = [0u8; 4];
        stream
            .read_exact(&mut len_buf)
            .await
            .context("Daemon closed the connection")?;
        let len = MessageFrame::read_length(&len_buf);
        trace!("Response length: {} bytes", len);

        let mut response_buf = vec![0u8; len];
        stream.read_exact(&mut response_buf).await?;
        MessageFrame::decode_response(&response_buf)
            .map_err(|e| anyhow::anyhow!("Failed to decode response: {}", e))
    }

    /// Returns uptime in seconds and the daemon version.
    pub async fn ping(&self) -> Result<(u64, String)> {
        match self.send(&Request::Ping).await? {
            Response::Pong {
                uptime_secs,
                version,
            } => Ok((uptime_secs, version)),
            other => unexpected(other),
        }
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.expect_ok(&Request::Shutdown).await
    }

    pub async fn start(&self, names: &[String]) -> Result<String> {
        self.expect_change(&Request::Start {
            names: names.to_vec(),
        })
        .await
    }

    pub async fn stop(&self, names: &[String], all: bool) -> Result<String> {
        self.expect_change(&Request::Stop {
            names: names.to_vec(),
            all,
        })
        .await
    }

    pub async fn restart(&self, names: &[String]) -> Result<String> {
        self.expect_change(&Request::Restart {
            names: names.to_vec(),
        })
        .await
    }

    pub async fn replan(&self) -> Result<String> {
        self.expect_change(&Request::Replan).await
    }

    pub async fn autostart(&self) -> Result<String> {
        self.expect_change(&Request::Autostart).await
    }

    pub async fn signal(&self, signal: &str, names: &[String]) -> Result<()> {
        self.expect_ok(&Request::Signal {
            signal: signal.to_string(),
            names: names.to_vec(),
        })
        .await
    }

    pub async fn services(&self, names: &[String]) -> Result<Vec<ServiceInfo>> {
        match self
            .send(&Request::Services {
                names: names.to_vec(),
            })
            .await?
        {
            Response::Services { list } => Ok(list),
            other => unexpected(other),
        }
    }

    pub async fn service_logs(&self, name: &str, lines: u32) -> Result<Vec<String>> {
        match self
            .send(&Request::ServiceLogs {
                name: name.to_string(),
                lines,
            })
            .await?
        {
            Response::Logs { lines } => Ok(lines),
            other => unexpected(other),
        }
    }

    pub async fn checks(&self, names: &[String], level: Option<&str>) -> Result<Vec<CheckInfo>> {
        match self
            .send(&Request::Checks {
                names: names.to_vec(),
                level: level.map(str::to_string),
            })
            .await?
        {
            Response::Checks { list } => Ok(list),
            other => unexpected(other),
        }
    }

    pub async fn start_checks(&self, names: &[String]) -> Result<()> {
        self.expect_ok(&Request::StartChecks {
            names: names.to_vec(),
        })
        .await
    }

    pub async fn stop_checks(&self, names: &[String]) -> Result<()> {
        self.expect_ok(&Request::StopChecks {
            names: names.to_vec(),
        })
        .await
    }

    pub async fn changes(&self) -> Result<Vec<ChangeInfo>> {
        match self.send(&Request::Changes).await? {
            Response::Changes { list } => Ok(list),
            other => unexpected(other),
        }
    }

    pub async fn change(&self, id: &str) -> Result<(ChangeInfo, Vec<TaskInfo>)> {
        match self.send(&Request::Change { id: id.to_string() }).await? {
            Response::Change { change, tasks } => Ok((change, tasks)),
            other => unexpected(other),
        }
    }

    /// Block until the change is ready. `None` waits forever.
    pub async fn wait_change(
        &self,
        id: &str,
        timeout: Option<Duration>,
    ) -> Result<(ChangeInfo, Vec<TaskInfo>)> {
        let request = Request::WaitChange {
            id: id.to_string(),
            timeout_ms: timeout.map(|t| t.as_millis() as u64),
        };
        match self.send(&request).await? {
            Response::Change { change, tasks } => Ok((change, tasks)),
            other => unexpected(other),
        }
    }

    pub async fn abort(&self, id: &str) -> Result<()> {
        self.expect_ok(&Request::Abort { id: id.to_string() }).await
    }

    async fn expect_ok(&self, request: &Request) -> Result<()> {
        match self.send(request).await? {
            Response::Ok => Ok(()),
            other => unexpected(other),
        }
    }

    async fn expect_change(&self, request: &Request) -> Result<String> {
        match self.send(request).await? {
            Response::Accepted { change_id } => Ok(change_id),
            other => unexpected(other),
        }
    }
}

fn unexpected<T>(response: Response) -> Result<T> {
    match response {
        Response::Error { message } => Err(anyhow::anyhow!(message)),
        other => Err(anyhow::anyhow!("Unexpected response: {:?}", other)),
    }
}
