//! Test execution engine: drives a prepared compose stack from `up -d`
//! through the test matrix to the final outcome.
//!
//! The phases are strictly linear; only the test matrix itself fans out, and
//! only as far as the configured concurrency.

use anyhow::{Context, Result};
use futures_util::stream::{self, StreamExt};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::compose::ComposeStack;
use crate::config::RunConfig;
use crate::process::{run_host_command, run_host_command_quiet};
use crate::retry::RetryPolicy;
use crate::transport::{DockerExec, ExecSpec, ExecTransport, HttpExec};
use crate::users::{runtime_is_rootless, DockerShell, UserReconciler};

/// Final result of a run, after cleanup considerations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    /// The test glob matched nothing.
    NoTests,
    /// At least one test or in-container command failed.
    Failed,
}

impl RunOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            RunOutcome::Success => 0,
            RunOutcome::NoTests => 1,
            RunOutcome::Failed => 128,
        }
    }
}

pub struct TestExecutionEngine {
    config: RunConfig,
    stack: ComposeStack,
    retry: RetryPolicy,
}

impl TestExecutionEngine {
    pub fn new(config: RunConfig, stack: ComposeStack) -> Self {
        Self {
            config,
            stack,
            retry: RetryPolicy::default(),
        }
    }

    /// Run the whole pipeline. `Err` means an infrastructure fault; test
    /// failures come back as `RunOutcome::Failed`.
    pub async fn run(&self) -> Result<RunOutcome> {
        if self.config.pull {
            self.stack.run(&["pull"]).await?;
        }
        self.stack.run(&["up", "-d"]).await?;

        let container = self.tester_container().await?;
        info!(%container, "tester container up");

        let transport = self.establish_transport(&container).await?;

        let rootless = match runtime_is_rootless().await {
            Ok(rootless) => rootless,
            Err(err) => {
                warn!(%err, "could not determine runtime rootlessness, reconciling anyway");
                false
            }
        };
        if rootless {
            info!("rootless runtime detected, skipping user reconciliation");
        } else {
            UserReconciler::new(DockerShell::new(&container))
                .reconcile(&self.configured_users())
                .await?;
        }

        for module in &self.config.rebuild {
            self.exec_fatal(
                &transport,
                format!("cd /src && npm rebuild {module}"),
                self.config.exec_user.as_deref(),
            )
            .await?;
        }
        if self.config.gyp {
            self.exec_fatal(
                &transport,
                "cd /src && node-gyp configure && node-gyp build".to_string(),
                self.config.exec_user.as_deref(),
            )
            .await?;
        }

        if self.config.sleep > 0 {
            info!(seconds = self.config.sleep, "waiting before tests");
            tokio::time::sleep(Duration::from_secs(self.config.sleep)).await;
        }
        if self.config.only_prepare {
            info!("environment prepared, skipping tests as requested");
            transport.close().await;
            return Ok(RunOutcome::Success);
        }

        for command in &self.config.pre {
            let status = run_host_command(command).await?;
            if !status.success() {
                anyhow::bail!("pre command failed: {command}");
            }
        }

        for command in &self.config.arbitrary_exec {
            self.exec_fatal(&transport, command.clone(), self.config.exec_user.as_deref())
                .await?;
        }

        let files = discover_tests(&self.config.tests)?;
        if files.is_empty() {
            warn!(glob = %self.config.tests, "no test files matched");
            transport.close().await;
            return Ok(RunOutcome::NoTests);
        }
        info!(count = files.len(), "discovered test files");

        let specs = self.test_specs(&files);
        let parallel = effective_parallel(self.config.parallel, self.config.sort);
        let all_passed = run_matrix(Arc::clone(&transport), specs, parallel).await;

        self.finish_run(&transport, all_passed).await
    }

    /// Post-matrix phases: post-exec commands always run (they commonly
    /// collect artifacts or tear down fixtures), but coverage from a failed
    /// run is never uploaded.
    async fn finish_run(
        &self,
        transport: &Arc<dyn ExecTransport>,
        mut all_passed: bool,
    ) -> Result<RunOutcome> {
        for command in &self.config.post_exec {
            let status = transport
                .run(ExecSpec::shell(command).as_user(self.config.exec_user.as_deref()))
                .await?;
            if !status.success() {
                warn!(%command, "post-exec command failed");
                all_passed = false;
            }
        }

        if all_passed {
            if let Some(coverage) = &self.config.coverage {
                info!("uploading coverage");
                // Reports land on the host through the source mount; output
                // is suppressed so upload tokens never reach CI logs.
                let status = run_host_command_quiet(coverage).await?;
                if !status.success() {
                    warn!("coverage upload failed");
                }
            }
        }

        transport.close().await;
        Ok(if all_passed {
            RunOutcome::Success
        } else {
            RunOutcome::Failed
        })
    }

    /// Setup and test identities that must exist in the container (the
    /// invoking host user is always added by the reconciler itself).
    fn configured_users(&self) -> Vec<String> {
        self.config
            .exec_user
            .iter()
            .chain(self.config.test_user.iter())
            .cloned()
            .collect()
    }

    async fn exec_fatal(
        &self,
        transport: &Arc<dyn ExecTransport>,
        command: String,
        user: Option<&str>,
    ) -> Result<()> {
        let status = transport
            .run(ExecSpec::shell(&command).as_user(user))
            .await?;
        if !status.success() {
            anyhow::bail!("command failed in container: {command}");
        }
        Ok(())
    }

    /// The tester service may take a moment to show up in `ps` output after
    /// `up -d` returns.
    async fn tester_container(&self) -> Result<String> {
        let flavour = self.config.tester_flavour.clone();
        self.retry
            .run("tester container id", || {
                let flavour = flavour.clone();
                async move {
                    let output = self.stack.capture(&["ps", "-q", &flavour]).await?;
                    Ok(output.lines().next().map(|line| line.trim().to_string()).filter(|id| !id.is_empty()))
                }
            })
            .await
    }

    async fn establish_transport(&self, container: &str) -> Result<Arc<dyn ExecTransport>> {
        if self.config.http && cfg!(unix) {
            let socket_dir =
                env::var_os("EXECD_SOCKET_DIR").map_or_else(|| PathBuf::from("/var/run"), PathBuf::from);
            let transport = HttpExec::discover(container, &socket_dir, &self.retry).await?;
            return Ok(Arc::new(transport));
        }
        if self.config.http {
            warn!("exec daemon transport requires unix sockets, falling back to docker exec");
        }
        Ok(Arc::new(DockerExec::new(container)))
    }

    fn test_specs(&self, files: &[String]) -> Vec<ExecSpec> {
        if self.config.in_one {
            let dir = self
                .config
                .nyc_coverage
                .then(|| self.config.report_dir.clone());
            vec![self.test_spec(files, dir.as_deref())]
        } else {
            files
                .iter()
                .map(|file| {
                    let dir = self.config.nyc_coverage.then(|| {
                        coverage_dir(&self.config.report_dir, file, &self.config.tests)
                    });
                    self.test_spec(std::slice::from_ref(file), dir.as_deref())
                })
                .collect()
        }
    }

    fn test_spec(&self, files: &[String], coverage_dir: Option<&str>) -> ExecSpec {
        let root = &self.config.root;
        let framework = match coverage_dir {
            Some(dir) => self
                .config
                .test_framework
                .replace("<coverageDirectory>", dir),
            None => self.config.test_framework.clone(),
        };

        let mut parts = Vec::new();
        if let Some(custom) = &self.config.custom_run {
            parts.push(custom.clone());
        }
        parts.push(format!("{root}/cross-env"));
        parts.push("NODE_ENV=test".to_string());
        if let Some(dir) = coverage_dir {
            parts.push(format!("{root}/nyc --report-dir {dir}"));
        }
        parts.push(format!("{root}/{framework}"));
        parts.extend(self.config.test_args.iter().cloned());
        parts.extend(files.iter().cloned());

        ExecSpec::shell(parts.join(" ")).as_user(self.config.test_user.as_deref())
    }
}

/// Sorted order requires sequential execution to mean anything.
pub fn effective_parallel(parallel: usize, sort: bool) -> usize {
    if sort {
        1
    } else {
        parallel.max(1)
    }
}

/// Expand the test glob; results are sorted for deterministic scheduling.
pub fn discover_tests(pattern: &str) -> Result<Vec<String>> {
    let mut files: Vec<String> = glob::glob(pattern)
        .with_context(|| format!("invalid test glob '{pattern}'"))?
        .filter_map(|entry| entry.ok())
        .filter(|path| path.is_file())
        .map(|path| path.to_string_lossy().into_owned())
        .collect();
    files.sort();
    Ok(files)
}

/// Longest shared leading run of `from` and `compare_with`, removed from
/// `from`. Used to turn a test file path into a path relative to its glob.
pub fn remove_common_prefix(from: &str, compare_with: &str) -> String {
    let shared = from
        .bytes()
        .zip(compare_with.bytes())
        .take_while(|(a, b)| a == b)
        .count();
    let mut idx = shared;
    while !from.is_char_boundary(idx) {
        idx -= 1;
    }
    from[idx..].to_string()
}

/// Per-file coverage directory: report dir plus the file path minus the glob
/// prefix, extension stripped.
pub fn coverage_dir(report_dir: &str, file: &str, pattern: &str) -> String {
    let suffix = remove_common_prefix(file, pattern);
    let suffix = suffix.trim_start_matches('/');
    let stem = Path::new(suffix)
        .with_extension("")
        .to_string_lossy()
        .into_owned();
    format!("{}/{}", report_dir.trim_end_matches('/'), stem)
}

/// Run the matrix with bounded concurrency. A failure stops new invocations
/// from being scheduled; anything already in flight drains naturally.
/// Returns whether every scheduled invocation succeeded.
pub async fn run_matrix(
    transport: Arc<dyn ExecTransport>,
    specs: Vec<ExecSpec>,
    parallel: usize,
) -> bool {
    let failed = Arc::new(AtomicBool::new(false));

    let results: Vec<bool> = stream::iter(specs.into_iter().map(|spec| {
        let transport = Arc::clone(&transport);
        let failed = Arc::clone(&failed);
        async move {
            if failed.load(Ordering::SeqCst) {
                return true;
            }
            let command = spec.command.clone();
            match transport.run(spec).await {
                Ok(status) if status.success() => true,
                Ok(status) => {
                    warn!(%command, exit_code = ?status.exit_code, timed_out = status.timed_out, "test invocation failed");
                    failed.store(true, Ordering::SeqCst);
                    false
                }
                Err(err) => {
                    warn!(%command, %err, "test invocation errored");
                    failed.store(true, Ordering::SeqCst);
                    false
                }
            }
        }
    }))
    .buffer_unordered(parallel.max(1))
    .collect()
    .await;

    results.into_iter().all(|passed| passed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ExecStatus;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    struct MockTransport {
        current: AtomicUsize,
        peak: AtomicUsize,
        calls: Mutex<Vec<String>>,
        fail_contains: Option<&'static str>,
        delay: Duration,
    }

    impl MockTransport {
        fn new(fail_contains: Option<&'static str>, delay: Duration) -> Self {
            Self {
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                calls: Mutex::new(Vec::new()),
                fail_contains,
                delay,
            }
        }
    }

    #[async_trait]
    impl ExecTransport for MockTransport {
        async fn run(&self, spec: ExecSpec) -> Result<ExecStatus> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.calls.lock().unwrap().push(spec.command.clone());
            tokio::time::sleep(self.delay).await;
            self.current.fetch_sub(1, Ordering::SeqCst);

            let failed = self
                .fail_contains
                .is_some_and(|needle| spec.command.contains(needle));
            Ok(ExecStatus {
                exit_code: Some(if failed { 1 } else { 0 }),
                timed_out: false,
            })
        }
    }

    fn specs(names: &[&str]) -> Vec<ExecSpec> {
        names.iter().map(|name| ExecSpec::shell(*name)).collect()
    }

    #[tokio::test]
    async fn matrix_concurrency_stays_within_bounds() {
        let transport = Arc::new(MockTransport::new(None, Duration::from_millis(20)));
        let passed = run_matrix(
            transport.clone(),
            specs(&["a", "b", "c", "d", "e", "f"]),
            3,
        )
        .await;

        assert!(passed);
        assert_eq!(transport.calls.lock().unwrap().len(), 6);
        assert!(transport.peak.load(Ordering::SeqCst) <= 3);
        assert!(transport.peak.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn failure_stops_scheduling_later_invocations() {
        let transport = Arc::new(MockTransport::new(Some("boom"), Duration::from_millis(1)));
        let passed = run_matrix(
            transport.clone(),
            specs(&["first", "boom", "third", "fourth"]),
            1,
        )
        .await;

        assert!(!passed);
        let calls = transport.calls.lock().unwrap();
        assert_eq!(*calls, vec!["first".to_string(), "boom".to_string()]);
    }

    #[tokio::test]
    async fn sequential_execution_preserves_sorted_order() {
        let transport = Arc::new(MockTransport::new(None, Duration::from_millis(1)));
        run_matrix(transport.clone(), specs(&["a", "b", "c"]), 1).await;
        assert_eq!(
            *transport.calls.lock().unwrap(),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
    }

    #[tokio::test]
    async fn failed_runs_skip_the_coverage_upload() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("uploaded");
        let config = RunConfig {
            coverage: Some(format!("touch {}", marker.display())),
            post_exec: vec!["collect-artifacts".to_string()],
            ..Default::default()
        };
        let engine = TestExecutionEngine::new(config, ComposeStack::with_program("true", vec![]));
        let mock = Arc::new(MockTransport::new(None, Duration::from_millis(1)));
        let transport: Arc<dyn ExecTransport> = mock.clone();

        let outcome = engine.finish_run(&transport, false).await.unwrap();

        assert_eq!(outcome, RunOutcome::Failed);
        assert!(!marker.exists(), "coverage from a failed run must not upload");
        // Post-exec still ran.
        assert_eq!(
            *mock.calls.lock().unwrap(),
            vec!["collect-artifacts".to_string()]
        );
    }

    #[tokio::test]
    async fn successful_runs_upload_coverage() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("uploaded");
        let config = RunConfig {
            coverage: Some(format!("touch {}", marker.display())),
            ..Default::default()
        };
        let engine = TestExecutionEngine::new(config, ComposeStack::with_program("true", vec![]));
        let transport: Arc<dyn ExecTransport> =
            Arc::new(MockTransport::new(None, Duration::from_millis(1)));

        let outcome = engine.finish_run(&transport, true).await.unwrap();

        assert_eq!(outcome, RunOutcome::Success);
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn failing_post_exec_marks_the_run_failed() {
        let config = RunConfig {
            post_exec: vec!["boom".to_string()],
            ..Default::default()
        };
        let engine = TestExecutionEngine::new(config, ComposeStack::with_program("true", vec![]));
        let transport: Arc<dyn ExecTransport> =
            Arc::new(MockTransport::new(Some("boom"), Duration::from_millis(1)));

        let outcome = engine.finish_run(&transport, true).await.unwrap();
        assert_eq!(outcome, RunOutcome::Failed);
    }

    #[test]
    fn reconciliation_covers_both_configured_identities() {
        let config = RunConfig {
            exec_user: Some("root".to_string()),
            test_user: Some("node".to_string()),
            ..Default::default()
        };
        let engine = TestExecutionEngine::new(config, ComposeStack::with_program("true", vec![]));
        assert_eq!(engine.configured_users(), vec!["root", "node"]);

        let engine =
            TestExecutionEngine::new(RunConfig::default(), ComposeStack::with_program("true", vec![]));
        assert!(engine.configured_users().is_empty());
    }

    #[test]
    fn sort_forces_sequential_execution() {
        assert_eq!(effective_parallel(4, true), 1);
        assert_eq!(effective_parallel(4, false), 4);
        assert_eq!(effective_parallel(0, false), 1);
    }

    #[test]
    fn glob_prefix_is_stripped_from_coverage_paths() {
        assert_eq!(
            remove_common_prefix("./test/suites/unit/a.js", "./test/suites/**/*.js"),
            "unit/a.js"
        );
        assert_eq!(
            coverage_dir("./coverage", "./test/suites/unit/a.js", "./test/suites/**/*.js"),
            "./coverage/unit/a"
        );
        assert_eq!(
            coverage_dir("./coverage/", "./test/suites/oauth/facebook.js", "./test/suites/**/*.js"),
            "./coverage/oauth/facebook"
        );
    }

    #[test]
    fn test_command_assembles_coverage_and_custom_prefix() {
        let config = RunConfig {
            nyc_coverage: true,
            test_args: vec!["--timeout".to_string(), "5000".to_string()],
            ..Default::default()
        };
        let engine = TestExecutionEngine::new(config, ComposeStack::with_program("true", vec![]));

        let spec = &engine.test_specs(&["./test/suites/unit/a.js".to_string()])[0];
        assert_eq!(
            spec.command,
            "/src/node_modules/.bin/cross-env NODE_ENV=test \
             /src/node_modules/.bin/nyc --report-dir ./coverage/unit/a \
             /src/node_modules/.bin/mocha --timeout 5000 ./test/suites/unit/a.js"
        );

        let config = RunConfig {
            nyc_coverage: false,
            custom_run: Some("yarn".to_string()),
            ..Default::default()
        };
        let engine = TestExecutionEngine::new(config, ComposeStack::with_program("true", vec![]));
        let spec = &engine.test_specs(&["./test/suites/unit/a.js".to_string()])[0];
        assert!(spec.command.starts_with("yarn /src/node_modules/.bin/cross-env NODE_ENV=test"));
        assert!(!spec.command.contains("nyc"));
    }

    #[test]
    fn in_one_mode_produces_a_single_combined_invocation() {
        let config = RunConfig {
            in_one: true,
            ..Default::default()
        };
        let engine = TestExecutionEngine::new(config, ComposeStack::with_program("true", vec![]));
        let files = vec!["./test/a.js".to_string(), "./test/b.js".to_string()];

        let specs = engine.test_specs(&files);
        assert_eq!(specs.len(), 1);
        assert!(specs[0].command.ends_with("./test/a.js ./test/b.js"));
        assert!(specs[0].command.contains("--report-dir ./coverage "));
    }

    #[test]
    fn coverage_directory_placeholder_is_substituted() {
        let config = RunConfig {
            test_framework: "jest --coverageDirectory <coverageDirectory>".to_string(),
            nyc_coverage: true,
            ..Default::default()
        };
        let engine = TestExecutionEngine::new(config, ComposeStack::with_program("true", vec![]));
        let spec = &engine.test_specs(&["./test/suites/a.js".to_string()])[0];
        assert!(spec
            .command
            .contains("jest --coverageDirectory ./coverage/a"));
    }
}
