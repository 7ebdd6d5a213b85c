//! Probes behind health checks.

use super::launcher::{run_to_completion, LaunchSpec, ProcessLauncher};
use super::log_buffer::{LogBuffer, RECENT_OUTPUT_LINES};
use crate::error::CheckError;
use crate::plan::{Check, ExecCheck, HttpCheck, Plan, TcpCheck};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

/// One probe. Implementations enforce `timeout` themselves and report an
/// overrun as [`CheckError::Timeout`].
#[async_trait]
pub trait Checker: Send + Sync {
    async fn check(&self, timeout: Duration) -> Result<(), CheckError>;
}

/// Build the probe for a validated check.
pub fn for_check(check: &Check, plan: &Plan, launcher: Arc<dyn ProcessLauncher>) -> Arc<dyn Checker> {
    if let Some(http) = &check.http {
        return Arc::new(HttpChecker::new(&check.name, http));
    }
    if let Some(tcp) = &check.tcp {
        return Arc::new(TcpChecker::new(&check.name, tcp));
    }
    let exec = check.exec.clone().unwrap_or_default();
    Arc::new(ExecChecker::new(&check.name, &exec, plan, launcher))
}

/// First lines of `text`, indented, with a marker when lines were dropped.
fn first_lines(text: &str, max: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let mut out: Vec<String> = lines.iter().take(max).map(|l| format!("    {l}")).collect();
    if lines.len() > max {
        out.push(format!("    ({} more lines)", lines.len() - max));
    }
    out.join("\n")
}

pub struct HttpChecker {
    name: String,
    url: String,
    headers: Vec<(String, String)>,
    client: reqwest::Client,
}

impl HttpChecker {
    pub fn new(name: &str, http: &HttpCheck) -> Self {
        Self {
            name: name.to_string(),
            url: http.url.clone(),
            headers: http
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Checker for HttpChecker {
    async fn check(&self, timeout: Duration) -> Result<(), CheckError> {
        let mut request = self.client.get(&self.url).timeout(timeout);
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }
        let http_error = |source: reqwest::Error| {
            if source.is_timeout() {
                CheckError::Timeout {
                    check: self.name.clone(),
                    timeout,
                }
            } else {
                CheckError::Http {
                    check: self.name.clone(),
                    source,
                }
            }
        };

        let response = request.send().await.map_err(http_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(CheckError::Status {
            check: self.name.clone(),
            status: status.as_u16(),
            details: first_lines(&body, RECENT_OUTPUT_LINES),
        })
    }
}

pub struct TcpChecker {
    name: String,
    host: String,
    port: u16,
}

impl TcpChecker {
    pub fn new(name: &str, tcp: &TcpCheck) -> Self {
        Self {
            name: name.to_string(),
            host: tcp.host.clone().unwrap_or_else(|| "localhost".to_string()),
            port: tcp.port,
        }
    }
}

#[async_trait]
impl Checker for TcpChecker {
    async fn check(&self, timeout: Duration) -> Result<(), CheckError> {
        let connect = TcpStream::connect((self.host.as_str(), self.port));
        match tokio::time::timeout(timeout, connect).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(source)) => Err(CheckError::Tcp {
                check: self.name.clone(),
                address: format!("{}:{}", self.host, self.port),
                source,
            }),
            Err(_) => Err(CheckError::Timeout {
                check: self.name.clone(),
                timeout,
            }),
        }
    }
}

pub struct ExecChecker {
    name: String,
    spec: LaunchSpec,
    launcher: Arc<dyn ProcessLauncher>,
    output: Arc<LogBuffer>,
}

impl ExecChecker {
    pub fn new(name: &str, exec: &ExecCheck, plan: &Plan, launcher: Arc<dyn ProcessLauncher>) -> Self {
        let context = exec
            .service_context
            .as_deref()
            .and_then(|service| plan.service(service));
        let output = Arc::new(LogBuffer::new(RECENT_OUTPUT_LINES));
        let spec = LaunchSpec::for_exec_check(exec, context).output(Arc::clone(&output), name);
        Self {
            name: name.to_string(),
            spec,
            launcher,
            output,
        }
    }
}

#[async_trait]
impl Checker for ExecChecker {
    async fn check(&self, timeout: Duration) -> Result<(), CheckError> {
        self.output.clear(&self.name);
        let code = run_to_completion(self.launcher.as_ref(), &self.spec, timeout)
            .await
            .map_err(|source| CheckError::Exec {
                check: self.name.clone(),
                source,
            })?;
        match code {
            Some(0) => Ok(()),
            Some(code) => {
                // Output readers may lag the exit by a moment.
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err(CheckError::ExitStatus {
                    check: self.name.clone(),
                    code,
                    details: self.output.tail(&self.name, RECENT_OUTPUT_LINES).join("\n"),
                })
            }
            None => Err(CheckError::Timeout {
                check: self.name.clone(),
                timeout,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::launcher::TokioLauncher;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn exec(name: &str, script: &str) -> Arc<dyn Checker> {
        let check = Check::exec(name, "sh", ["-c", script]);
        for_check(&check, &Plan::default(), Arc::new(TokioLauncher))
    }

    /// Serve one canned HTTP response per connection.
    async fn http_server(status_line: &'static str, body: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {status_line}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        port
    }

    #[tokio::test]
    async fn exec_success_and_failure() {
        assert!(exec("ok", "exit 0").check(Duration::from_secs(5)).await.is_ok());

        let err = exec("bad", "echo broken; exit 2")
            .check(Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, CheckError::ExitStatus { code: 2, .. }));
        assert_eq!(err.details(), Some("broken"));
    }

    #[tokio::test]
    async fn exec_timeout_kills_command() {
        let err = exec("slow", "sleep 30")
            .check(Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, CheckError::Timeout { .. }));
    }

    #[tokio::test]
    async fn exec_inherits_service_environment() {
        let mut plan = Plan::default();
        plan.services
            .insert(crate::plan::Service::new("web", "server").env("PROBE_VALUE", "from-service"));
        let mut check = Check::exec("ctx", "sh", ["-c", "test \"$PROBE_VALUE\" = from-service"]);
        if let Some(exec) = check.exec.as_mut() {
            exec.service_context = Some("web".into());
        }
        let checker = for_check(&check, &plan, Arc::new(TokioLauncher));
        assert!(checker.check(Duration::from_secs(5)).await.is_ok());
    }

    #[tokio::test]
    async fn tcp_connects_to_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let check = Check::tcp("db", Some("127.0.0.1"), port);
        let checker = for_check(&check, &Plan::default(), Arc::new(TokioLauncher));
        assert!(checker.check(Duration::from_secs(1)).await.is_ok());

        drop(listener);
        let err = checker.check(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, CheckError::Tcp { .. }));
    }

    #[tokio::test]
    async fn http_status_codes() {
        let ok = http_server("200 OK", "fine").await;
        let check = Check::http("up", format!("http://127.0.0.1:{ok}/health"));
        let checker = for_check(&check, &Plan::default(), Arc::new(TokioLauncher));
        assert!(checker.check(Duration::from_secs(5)).await.is_ok());

        let failing = http_server("503 Service Unavailable", "line one\nline two").await;
        let check = Check::http("down", format!("http://127.0.0.1:{failing}/health"));
        let checker = for_check(&check, &Plan::default(), Arc::new(TokioLauncher));
        let err = checker.check(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, CheckError::Status { status: 503, .. }));
        assert_eq!(err.details(), Some("    line one\n    line two"));
    }

    #[test]
    fn body_is_truncated() {
        let body: String = (0..25).map(|i| format!("line {i}\n")).collect();
        let details = first_lines(&body, 20);
        assert_eq!(details.lines().count(), 21);
        assert!(details.ends_with("(5 more lines)"));
    }
}
