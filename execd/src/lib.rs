//! In-container exec daemon.
//!
//! Accepts command-execution requests over `POST /exec` on a Unix domain
//! socket and streams the child's interleaved stdout/stderr back as it is
//! produced, finished by a sentinel-framed terminal report. Each request is
//! isolated: a failing spawn is serialized into the report instead of
//! crashing the daemon.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use bytes::{Bytes, BytesMut};
use exec_wire::{encode_report, validate_request, ExecReport, ExecRequest};
use std::collections::HashMap;
use std::future::Future;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Memoized user-name to UID resolution. A given user is looked up via a
/// subprocess at most once for the daemon's lifetime.
#[derive(Debug, Default)]
pub struct UidCache {
    entries: Mutex<HashMap<String, u32>>,
}

impl UidCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached UID for `user`, running `lookup` only on a miss.
    /// The lock is held across the lookup so concurrent requests for the
    /// same user still resolve it exactly once.
    pub async fn resolve<F, Fut>(&self, user: &str, lookup: F) -> anyhow::Result<u32>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<u32>>,
    {
        let mut entries = self.entries.lock().await;
        if let Some(&uid) = entries.get(user) {
            return Ok(uid);
        }
        let uid = lookup().await?;
        entries.insert(user.to_string(), uid);
        Ok(uid)
    }
}

#[derive(Clone, Default)]
pub struct AppState {
    uid_cache: Arc<UidCache>,
}

pub fn router() -> Router {
    Router::new()
        .route("/exec", post(exec_handler))
        .with_state(AppState::default())
}

async fn exec_handler(State(state): State<AppState>, Json(body): Json<serde_json::Value>) -> Response {
    if let Err(err) = validate_request(&body) {
        return (StatusCode::BAD_REQUEST, err.to_string()).into_response();
    }
    // Schema passed, deserialization cannot fail on shape.
    let request: ExecRequest = match serde_json::from_value(body) {
        Ok(request) => request,
        Err(err) => return (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    };

    debug!(file = %request.file, args = ?request.args, "exec request");

    let uid = match &request.user {
        Some(user) => match state.uid_cache.resolve(user, || lookup_uid(user.clone())).await {
            Ok(uid) => Some(uid),
            Err(err) => {
                // The request was valid; report the failure in-stream so the
                // caller sees it the same way as a failed spawn.
                return report_only_response(ExecReport {
                    exit_code: None,
                    timed_out: false,
                    error: Some(format!("failed to resolve user '{user}': {err}")),
                });
            }
        },
        None => None,
    };

    let mut command = build_command(&request, uid);
    match command.spawn() {
        Ok(child) => {
            let timeout = request.timeout.filter(|&ms| ms > 0).map(Duration::from_millis);
            stream_response(child, timeout)
        }
        Err(err) => report_only_response(ExecReport {
            exit_code: None,
            timed_out: false,
            error: Some(format!("failed to spawn '{}': {err}", request.file)),
        }),
    }
}

/// Argv form when `args` is present (even empty); shell interpretation
/// otherwise.
fn build_command(request: &ExecRequest, uid: Option<u32>) -> Command {
    let mut command = match &request.args {
        Some(args) => {
            let mut command = Command::new(&request.file);
            command.args(args);
            command
        }
        None => {
            let mut command = Command::new("/bin/sh");
            command.arg("-c").arg(&request.file);
            command
        }
    };
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    if let Some(uid) = uid {
        command.uid(uid);
    }
    #[cfg(not(unix))]
    let _ = uid;
    command
}

async fn lookup_uid(user: String) -> anyhow::Result<u32> {
    let output = Command::new("id").arg("-u").arg(&user).output().await?;
    if !output.status.success() {
        anyhow::bail!(
            "id -u exited with {:?}: {}",
            output.status.code(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    let uid = String::from_utf8_lossy(&output.stdout).trim().parse()?;
    Ok(uid)
}

fn plain_stream_response(body: Body) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(body)
        .expect("static response parts are valid")
}

/// A stream carrying only the terminal report: the spawn itself failed, so
/// there is no output to relay.
fn report_only_response(report: ExecReport) -> Response {
    plain_stream_response(Body::from(encode_report(&report)))
}

/// Stream the child's interleaved output chunk-by-chunk, then append the
/// sentinel-framed terminal report once the child has exited (or been
/// killed by the per-request timeout).
fn stream_response(mut child: Child, timeout: Option<Duration>) -> Response {
    let stream = async_stream::stream! {
        let (tx, mut rx) = mpsc::channel::<Bytes>(16);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(copy_chunks(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(copy_chunks(stderr, tx.clone()));
        }
        drop(tx);

        let deadline = timeout.map(|limit| Instant::now() + limit);
        let mut timed_out = false;

        loop {
            let received = match deadline {
                Some(deadline) if !timed_out => {
                    tokio::select! {
                        received = rx.recv() => received,
                        _ = tokio::time::sleep_until(deadline) => {
                            timed_out = true;
                            if let Err(err) = child.start_kill() {
                                warn!(%err, "failed to kill timed out child");
                            }
                            continue;
                        }
                    }
                }
                // After a kill the pipes close shortly; drain what remains.
                _ => rx.recv().await,
            };
            match received {
                Some(chunk) => yield Ok::<_, std::convert::Infallible>(chunk),
                None => break,
            }
        }

        let report = match child.wait().await {
            Ok(status) => ExecReport {
                exit_code: status.code(),
                timed_out,
                error: None,
            },
            Err(err) => ExecReport {
                exit_code: None,
                timed_out,
                error: Some(err.to_string()),
            },
        };
        yield Ok(Bytes::from(encode_report(&report)));
    };

    plain_stream_response(Body::from_stream(stream))
}

async fn copy_chunks<R>(mut reader: R, tx: mpsc::Sender<Bytes>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(8192);
    loop {
        buf.clear();
        match reader.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if tx.send(buf.split().freeze()).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                warn!(%err, "child output read failed");
                break;
            }
        }
    }
}
