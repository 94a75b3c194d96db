//! In-container user reconciliation.
//!
//! Test artifacts written inside the container must stay owned by the host
//! user, and setup/test commands may need to run as specific non-root
//! identities, so the UIDs of interest must exist in the container's passwd
//! database. Skipped entirely under rootless runtimes where UID namespace
//! remapping applies.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, info};

/// Shell access into the tester container, always as the privileged
/// in-container user.
#[async_trait]
pub trait ContainerShell: Send + Sync {
    async fn exec(&self, args: &[&str]) -> Result<Output>;
}

pub struct DockerShell {
    container: String,
}

impl DockerShell {
    pub fn new(container: impl Into<String>) -> Self {
        Self {
            container: container.into(),
        }
    }
}

#[async_trait]
impl ContainerShell for DockerShell {
    async fn exec(&self, args: &[&str]) -> Result<Output> {
        Command::new("docker")
            .arg("exec")
            .arg("-u")
            .arg("root")
            .arg(&self.container)
            .args(args)
            .output()
            .await
            .context("failed to spawn docker exec")
    }
}

/// Memoized reconciliation: any UID is looked up and, if needed, created at
/// most once per run.
pub struct UserReconciler<S> {
    shell: S,
    resolved_names: HashMap<String, u32>,
    ensured_uids: HashSet<u32>,
}

impl<S: ContainerShell> UserReconciler<S> {
    pub fn new(shell: S) -> Self {
        Self {
            shell,
            resolved_names: HashMap::new(),
            ensured_uids: HashSet::new(),
        }
    }

    /// Make sure every identity in `users` (names or numeric UIDs) plus the
    /// invoking host user exists inside the container.
    pub async fn reconcile(&mut self, users: &[String]) -> Result<()> {
        let mut uids = vec![host_euid()];
        for user in users {
            uids.push(self.resolve_uid(user).await?);
        }
        for uid in uids {
            self.ensure_uid(uid).await?;
        }
        Ok(())
    }

    async fn resolve_uid(&mut self, user: &str) -> Result<u32> {
        if let Ok(uid) = user.parse::<u32>() {
            return Ok(uid);
        }
        if let Some(&uid) = self.resolved_names.get(user) {
            return Ok(uid);
        }

        let output = self.shell.exec(&["id", "-u", user]).await?;
        if !output.status.success() {
            anyhow::bail!(
                "failed to resolve user '{}' in container: {}",
                user,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let uid: u32 = String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse()
            .with_context(|| format!("unexpected id -u output for '{user}'"))?;

        self.resolved_names.insert(user.to_string(), uid);
        Ok(uid)
    }

    async fn ensure_uid(&mut self, uid: u32) -> Result<()> {
        if !self.ensured_uids.insert(uid) {
            return Ok(());
        }

        let uid_arg = uid.to_string();
        let exists = self
            .shell
            .exec(&["getent", "passwd", &uid_arg])
            .await?
            .status
            .success();
        if exists {
            debug!(uid, "container user already present");
            return Ok(());
        }

        info!(uid, "creating container user");
        let name = format!("u{uid}");
        let output = self
            .shell
            .exec(&["adduser", "-u", &uid_arg, "-D", "-H", &name])
            .await?;
        if !output.status.success() {
            anyhow::bail!(
                "failed to create container user uid {}: {}",
                uid,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

/// Effective UID of the invoking host user.
pub fn host_euid() -> u32 {
    #[cfg(unix)]
    unsafe {
        libc::geteuid()
    }
    #[cfg(not(unix))]
    {
        0
    }
}

/// Whether the container runtime runs rootless.
pub async fn runtime_is_rootless() -> Result<bool> {
    let output = Command::new("docker")
        .args(["info", "--format", "{{json .SecurityOptions}}"])
        .output()
        .await
        .context("failed to spawn docker info")?;
    Ok(parse_rootless(&String::from_utf8_lossy(&output.stdout)))
}

/// `docker info` reports security options like `name=rootless` when UID
/// remapping is in effect.
pub fn parse_rootless(security_options: &str) -> bool {
    security_options.contains("rootless")
}
