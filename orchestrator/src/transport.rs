//! Exec transports: how commands reach the tester container.
//!
//! Both transports expose the same logical result so the engine never cares
//! which one is active. The docker transport pays a `docker exec` spawn per
//! command; the http transport talks to the long-lived in-container daemon
//! over its Unix socket and streams output live.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use exec_wire::{ExecRequest, FrameSplitter};
use http_body_util::{BodyExt, Full};
use hyper::http::{header, Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::process::Command;
use tracing::{debug, info};

use crate::retry::RetryPolicy;

/// One command to run inside the tester.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    /// Shell command line, interpreted by `/bin/sh -c` on either transport.
    pub command: String,
    pub user: Option<String>,
    /// Milliseconds.
    pub timeout: Option<u64>,
}

impl ExecSpec {
    pub fn shell(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            user: None,
            timeout: None,
        }
    }

    pub fn as_user(mut self, user: Option<&str>) -> Self {
        self.user = user.map(|u| u.to_string());
        self
    }
}

/// Logical result, identical across transports.
#[derive(Debug, Clone, Copy)]
pub struct ExecStatus {
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

impl ExecStatus {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

#[async_trait]
pub trait ExecTransport: Send + Sync {
    async fn run(&self, spec: ExecSpec) -> Result<ExecStatus>;

    /// Release transport resources; default transports hold none.
    async fn close(&self) {}
}

/// One `docker exec` subprocess per command.
pub struct DockerExec {
    container: String,
}

impl DockerExec {
    pub fn new(container: impl Into<String>) -> Self {
        Self {
            container: container.into(),
        }
    }
}

#[async_trait]
impl ExecTransport for DockerExec {
    async fn run(&self, spec: ExecSpec) -> Result<ExecStatus> {
        info!("docker exec {} /bin/sh -c {:?}", self.container, spec.command);

        let mut command = Command::new("docker");
        command.arg("exec");
        if let Some(user) = &spec.user {
            command.arg("-u").arg(user);
        }
        command
            .arg(&self.container)
            .arg("/bin/sh")
            .arg("-c")
            .arg(&spec.command)
            .stdin(Stdio::null());

        let mut child = command.spawn().context("failed to spawn docker exec")?;
        let status = match spec.timeout.filter(|&ms| ms > 0) {
            Some(ms) => {
                match tokio::time::timeout(Duration::from_millis(ms), child.wait()).await {
                    Ok(status) => status?,
                    Err(_elapsed) => {
                        child.start_kill().ok();
                        child.wait().await?;
                        return Ok(ExecStatus {
                            exit_code: None,
                            timed_out: true,
                        });
                    }
                }
            }
            None => child.wait().await?,
        };

        Ok(ExecStatus {
            exit_code: status.code(),
            timed_out: false,
        })
    }
}

static SOCKET_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""socketId"\s*:\s*"([^"]+)""#).expect("static regex must compile"));

/// Extract the daemon's socket name from container log output.
pub fn find_socket_id(logs: &str) -> Option<String> {
    SOCKET_ID_RE
        .captures(logs)
        .map(|captures| captures[1].to_string())
}

/// Commands tunnelled through the in-container exec daemon.
pub struct HttpExec {
    socket_path: PathBuf,
}

impl HttpExec {
    pub fn from_socket_path(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    /// Learn the socket name from the daemon's startup handshake record in
    /// the container logs. This is the only discovery mechanism; the retry
    /// budget bounds how long startup may take.
    pub async fn discover(
        container: &str,
        socket_dir: &Path,
        retry: &RetryPolicy,
    ) -> Result<Self> {
        let container = container.to_string();
        let socket_name = retry
            .run("exec daemon handshake", || {
                let container = container.clone();
                async move {
                    let output = Command::new("docker")
                        .args(["logs", &container])
                        .output()
                        .await
                        .context("failed to spawn docker logs")?;
                    let stdout = String::from_utf8_lossy(&output.stdout);
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    Ok(find_socket_id(&stdout).or_else(|| find_socket_id(&stderr)))
                }
            })
            .await?;

        let socket_path = socket_dir.join(socket_name);
        debug!(socket = %socket_path.display(), "exec daemon socket resolved");
        Ok(Self::from_socket_path(socket_path))
    }
}

#[async_trait]
impl ExecTransport for HttpExec {
    async fn run(&self, spec: ExecSpec) -> Result<ExecStatus> {
        info!("exec-daemon /bin/sh -c {:?}", spec.command);

        let stream = UnixStream::connect(&self.socket_path)
            .await
            .with_context(|| format!("failed to connect {}", self.socket_path.display()))?;
        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .context("exec daemon http handshake failed")?;
        tokio::spawn(connection);

        let body = ExecRequest {
            file: spec.command.clone(),
            args: None,
            timeout: spec.timeout,
            user: spec.user.clone(),
        };
        let request = Request::builder()
            .method(Method::POST)
            .uri("/exec")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::HOST, "testdock")
            .body(Full::new(Bytes::from(serde_json::to_vec(&body)?)))?;

        let response = sender
            .send_request(request)
            .await
            .context("exec request failed")?;

        if response.status() != StatusCode::OK {
            let status = response.status();
            let bytes = response.into_body().collect().await?.to_bytes();
            anyhow::bail!(
                "exec daemon rejected request ({status}): {}",
                String::from_utf8_lossy(&bytes).trim()
            );
        }

        let mut splitter = FrameSplitter::new();
        let mut body = response.into_body();
        let mut stdout = tokio::io::stdout();
        while let Some(frame) = body.frame().await {
            let frame = frame.context("exec stream frame error")?;
            if let Some(data) = frame.data_ref() {
                let visible = splitter.push(data);
                if !visible.is_empty() {
                    stdout.write_all(&visible).await?;
                    stdout.flush().await?;
                }
            }
        }

        let report = splitter.finish()?;
        if let Some(error) = &report.error {
            anyhow::bail!("exec daemon reported: {error}");
        }
        Ok(ExecStatus {
            exit_code: report.exit_code,
            timed_out: report.timed_out,
        })
    }
}
