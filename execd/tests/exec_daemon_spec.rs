#![cfg(unix)]

use bytes::Bytes;
use exec_wire::{ExecReport, FrameSplitter};
use http_body_util::{BodyExt, Full};
use hyper::http::{header, Request, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnectionBuilder;
use hyper_util::service::TowerToHyperService;
use std::path::{Path, PathBuf};
use tokio::net::{UnixListener, UnixStream};

fn start_daemon(dir: &Path) -> PathBuf {
    let socket_path = dir.join("execd.test.sock");
    let listener = UnixListener::bind(&socket_path).unwrap();
    let app = execd::router();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let service = TowerToHyperService::new(app.clone());
            tokio::spawn(async move {
                let _ = ConnectionBuilder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    socket_path
}

async fn post_exec(socket: &Path, body: serde_json::Value) -> (StatusCode, Vec<u8>) {
    let stream = UnixStream::connect(socket).await.unwrap();
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(connection);

    let request = Request::builder()
        .method("POST")
        .uri("/exec")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::HOST, "localhost")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap();

    let response = sender.send_request(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, bytes.to_vec())
}

fn split(bytes: &[u8]) -> (Vec<u8>, ExecReport) {
    let mut splitter = FrameSplitter::new();
    let output = splitter.push(bytes);
    (output, splitter.finish().unwrap())
}

#[tokio::test]
async fn streams_output_then_terminal_report() {
    let dir = tempfile::tempdir().unwrap();
    let socket = start_daemon(dir.path());

    let (status, body) =
        post_exec(&socket, serde_json::json!({"file": "echo", "args": ["hello"]})).await;

    assert_eq!(status, StatusCode::OK);
    let (output, report) = split(&body);
    assert!(output.starts_with(b"hello\n"));
    assert_eq!(report.exit_code, Some(0));
    assert!(report.success());
}

#[tokio::test]
async fn nonzero_exit_is_reported_not_failed() {
    let dir = tempfile::tempdir().unwrap();
    let socket = start_daemon(dir.path());

    let (status, body) = post_exec(
        &socket,
        serde_json::json!({"file": "sh", "args": ["-c", "exit 3"]}),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let (_, report) = split(&body);
    assert_eq!(report.exit_code, Some(3));
    assert!(!report.timed_out);
}

#[tokio::test]
async fn shell_string_and_argv_forms_agree_on_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let socket = start_daemon(dir.path());

    let (_, shell_body) = post_exec(&socket, serde_json::json!({"file": "exit 4"})).await;
    let (_, argv_body) = post_exec(
        &socket,
        serde_json::json!({"file": "sh", "args": ["-c", "exit 4"]}),
    )
    .await;

    let (_, shell_report) = split(&shell_body);
    let (_, argv_report) = split(&argv_body);
    assert_eq!(shell_report.exit_code, Some(4));
    assert_eq!(argv_report.exit_code, shell_report.exit_code);
}

#[tokio::test]
async fn schema_violations_are_rejected_before_spawn() {
    let dir = tempfile::tempdir().unwrap();
    let socket = start_daemon(dir.path());

    let (status, body) = post_exec(&socket, serde_json::json!({"file": ""})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(String::from_utf8_lossy(&body).contains("rejected"));

    let (status, _) = post_exec(&socket, serde_json::json!({"args": ["x"]})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn spawn_failure_is_serialized_into_the_report() {
    let dir = tempfile::tempdir().unwrap();
    let socket = start_daemon(dir.path());

    let (status, body) = post_exec(
        &socket,
        serde_json::json!({"file": "/definitely/not/a/binary", "args": []}),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let (_, report) = split(&body);
    assert!(report.error.is_some());
    assert_eq!(report.exit_code, None);

    // The daemon is still healthy after a failed spawn.
    let (status, body) = post_exec(&socket, serde_json::json!({"file": "true", "args": []})).await;
    assert_eq!(status, StatusCode::OK);
    let (_, report) = split(&body);
    assert_eq!(report.exit_code, Some(0));
}

#[tokio::test]
async fn timeout_kills_the_child_and_flags_the_report() {
    let dir = tempfile::tempdir().unwrap();
    let socket = start_daemon(dir.path());

    let (status, body) = post_exec(
        &socket,
        serde_json::json!({"file": "sleep", "args": ["5"], "timeout": 200}),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let (_, report) = split(&body);
    assert!(report.timed_out);
    assert!(!report.success());
}
