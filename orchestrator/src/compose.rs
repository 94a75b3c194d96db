//! Compose tooling resolution and stack lifecycle.
//!
//! The controlling binary is resolved exactly once per run; teardown is
//! guaranteed to happen exactly once regardless of how the process
//! terminates, via a shutdown coordinator subscribed to termination signals.

use anyhow::{Context, Result};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::process::Command;
use tracing::{info, warn};

use crate::process::run_host_command;

/// The compose implementations we know how to drive, in resolution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposeTool {
    /// `mutagen-compose`: file-sync-aware wrapper.
    Mutagen,
    /// Standalone `docker-compose`.
    Standalone,
    /// The engine's built-in `docker compose` subcommand.
    Builtin,
}

impl ComposeTool {
    pub fn program(&self) -> &'static str {
        match self {
            ComposeTool::Mutagen => "mutagen-compose",
            ComposeTool::Standalone => "docker-compose",
            ComposeTool::Builtin => "docker",
        }
    }

    pub fn base_args(&self) -> &'static [&'static str] {
        match self {
            ComposeTool::Builtin => &["compose"],
            _ => &[],
        }
    }

    pub fn stack(&self, files: Vec<PathBuf>) -> ComposeStack {
        ComposeStack {
            program: self.program().to_string(),
            base_args: self.base_args().iter().map(|s| s.to_string()).collect(),
            files,
        }
    }
}

/// Resolve the controlling compose binary, once per run.
///
/// mutagen-compose is only eligible when file sync was requested; a
/// pnpm-hardlinked install disables it with a warning since mutagen sync
/// and hardlinks are known to be incompatible.
pub fn resolve_tool(want_mutagen: bool, project_dir: &Path) -> (ComposeTool, bool) {
    if want_mutagen && which::which("mutagen-compose").is_ok() {
        if hardlinked_pnpm_install(project_dir) {
            warn!("pnpm hardlinked install detected, disabling mutagen file sync");
        } else {
            return (ComposeTool::Mutagen, true);
        }
    }
    if which::which("docker-compose").is_ok() {
        return (ComposeTool::Standalone, false);
    }
    (ComposeTool::Builtin, false)
}

/// pnpm installs packages as hardlinks into a content-addressable store.
pub fn hardlinked_pnpm_install(project_dir: &Path) -> bool {
    if env::var_os("PNPM_SCRIPT_SRC_DIR").is_some() {
        return true;
    }
    if matches!(env::var("npm_config_package_import_method"), Ok(v) if v == "hardlink") {
        return true;
    }
    project_dir.join("node_modules/.pnpm").is_dir()
}

/// Ordered compose file arguments: explicit multi-file overrides first, then
/// the generated auto-compose file, then the user's compose file when it was
/// explicitly requested to layer on top. Without auto-compose the user file
/// stands alone.
pub fn assemble_files(
    multi: &[PathBuf],
    generated: Option<&Path>,
    explicit: &Path,
    with_local: bool,
) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = multi.to_vec();
    match generated {
        Some(generated) => {
            files.push(generated.to_path_buf());
            if with_local {
                files.push(explicit.to_path_buf());
            }
        }
        None => files.push(explicit.to_path_buf()),
    }
    files
}

/// A resolved compose invocation: program, base arguments and the ordered
/// `-f` file list. Immutable for the rest of the run.
#[derive(Debug, Clone)]
pub struct ComposeStack {
    program: String,
    base_args: Vec<String>,
    files: Vec<PathBuf>,
}

impl ComposeStack {
    /// Constructor used by tests to substitute a harmless program.
    pub fn with_program(program: &str, files: Vec<PathBuf>) -> Self {
        Self {
            program: program.to_string(),
            base_args: Vec::new(),
            files,
        }
    }

    /// Base command with file arguments applied; callers append the verb.
    pub fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.base_args);
        for file in &self.files {
            command.arg("-f").arg(file);
        }
        command
    }

    /// Printable form of the invocation for operator messages.
    pub fn render(&self, trailing: &[&str]) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.base_args.iter().cloned());
        for file in &self.files {
            parts.push("-f".to_string());
            parts.push(file.display().to_string());
        }
        parts.extend(trailing.iter().map(|s| s.to_string()));
        parts.join(" ")
    }

    /// Run a compose verb with inherited stdio, failing on non-zero exit.
    pub async fn run(&self, args: &[&str]) -> Result<()> {
        info!("{}", self.render(args));
        let status = self
            .command()
            .args(args)
            .status()
            .await
            .with_context(|| format!("failed to spawn {}", self.program))?;
        if !status.success() {
            anyhow::bail!("{} {} exited with {:?}", self.program, args.join(" "), status.code());
        }
        Ok(())
    }

    /// Run a compose verb and capture stdout.
    pub async fn capture(&self, args: &[&str]) -> Result<String> {
        let output = self
            .command()
            .args(args)
            .output()
            .await
            .with_context(|| format!("failed to spawn {}", self.program))?;
        if !output.status.success() {
            anyhow::bail!(
                "{} {} exited with {:?}: {}",
                self.program,
                args.join(" "),
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ShutdownReason {
    Signal(&'static str),
    Exit { code: i32 },
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownReason::Signal(name) => write!(f, "{name}"),
            ShutdownReason::Exit { code } => write!(f, "exit ({code})"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CleanupOptions {
    /// Print the manual teardown command instead of acting.
    pub disabled: bool,
    /// `down -v`; retained/external volumes suppress this.
    pub remove_volumes: bool,
    /// Host command executed first when terminating with a non-zero code.
    pub on_fail: Option<String>,
    /// Generated auto-compose file to delete after teardown.
    pub generated_file: Option<PathBuf>,
}

/// Owns teardown of the compose stack and generated files. `shutdown` is
/// idempotent: signal plus normal exit may both invoke it.
#[derive(Clone)]
pub struct CleanupCoordinator {
    inner: Arc<CleanupInner>,
}

struct CleanupInner {
    stack: ComposeStack,
    options: CleanupOptions,
    fired: AtomicBool,
}

impl CleanupCoordinator {
    pub fn new(stack: ComposeStack, options: CleanupOptions) -> Self {
        Self {
            inner: Arc::new(CleanupInner {
                stack,
                options,
                fired: AtomicBool::new(false),
            }),
        }
    }

    pub fn down_args(&self) -> Vec<&'static str> {
        if self.inner.options.remove_volumes {
            vec!["down", "-v"]
        } else {
            vec!["down"]
        }
    }

    pub fn manual_down_command(&self) -> String {
        self.inner.stack.render(&self.down_args())
    }

    /// Tear the stack down exactly once. Later invocations return
    /// immediately; teardown errors are logged, never propagated, so the
    /// process can still exit with the originating code.
    pub async fn shutdown(&self, reason: ShutdownReason) {
        if self.inner.fired.swap(true, Ordering::SeqCst) {
            return;
        }

        if let ShutdownReason::Exit { code } = reason {
            if code != 0 {
                if let Some(on_fail) = &self.inner.options.on_fail {
                    info!(command = %on_fail, "running on-fail command");
                    match run_host_command(on_fail).await {
                        Ok(status) if !status.success() => {
                            warn!(code = ?status.code(), "on-fail command exited non-zero");
                        }
                        Ok(_) => {}
                        Err(err) => warn!(%err, "on-fail command failed"),
                    }
                }
            }
        }

        if self.inner.options.disabled {
            info!(
                "cleanup disabled; to stop containers run:\n\n{}\n",
                self.manual_down_command()
            );
            return;
        }

        info!("automatically cleaning up after {reason}");
        if let Err(err) = self.inner.stack.run(&self.down_args()).await {
            warn!(%err, "compose down failed");
        }

        if let Some(file) = &self.inner.options.generated_file {
            match fs::remove_file(file) {
                Ok(()) => info!(file = %file.display(), "removed generated compose file"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!(%err, file = %file.display(), "failed to remove compose file"),
            }
        }
    }

    /// Subscribe once to process termination signals. On delivery the
    /// teardown sequence runs to completion, then the process exits 128.
    pub fn register_signal_handlers(&self) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let name = wait_for_termination().await;
            coordinator.shutdown(ShutdownReason::Signal(name)).await;
            std::process::exit(128);
        });
    }
}

async fn wait_for_termination() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut hangup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT",
            _ = term.recv() => "SIGTERM",
            _ = hangup.recv() => "SIGHUP",
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "interrupt"
    }
}
