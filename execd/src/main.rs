use anyhow::{Context, Result};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnectionBuilder;
use hyper_util::service::TowerToHyperService;
use std::env;
use std::fs;
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use tokio::net::UnixListener;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

/// Directory the socket is created in; must be bind-mounted so the host
/// side can connect.
fn socket_dir() -> PathBuf {
    env::var("EXECD_SOCKET_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/run"))
}

fn init_tracing() {
    // stdout is reserved for the handshake record the orchestrator polls
    // container logs for.
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let socket_name = format!("execd.{}.sock", Uuid::new_v4().simple());
    let socket_path = socket_dir().join(&socket_name);

    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("failed to bind {}", socket_path.display()))?;

    // The caller connects from outside the container's user namespace.
    #[cfg(unix)]
    fs::set_permissions(&socket_path, fs::Permissions::from_mode(0o666))
        .with_context(|| format!("failed to chmod {}", socket_path.display()))?;

    // Startup handshake: the orchestrator polls container logs for this
    // record to learn the socket name. Emitted exactly once.
    let handshake = serde_json::json!({ "socketId": socket_name });
    let mut stdout = std::io::stdout();
    writeln!(stdout, "{handshake}").context("failed to write handshake record")?;
    stdout.flush().ok();

    info!(socket = %socket_path.display(), "exec daemon listening");

    let app = execd::router();
    let serve = async {
        loop {
            let (stream, _addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    error!(%err, "accept failed");
                    continue;
                }
            };
            let service = TowerToHyperService::new(app.clone());
            tokio::spawn(async move {
                if let Err(err) = ConnectionBuilder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    error!(%err, "connection error");
                }
            });
        }
    };

    tokio::select! {
        _ = serve => {}
        _ = shutdown_signal() => {
            info!("shutting down");
        }
    }

    let _ = fs::remove_file(&socket_path);
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
