use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use orchestrator::{
    assemble_files, resolve_tool, CleanupCoordinator, CleanupOptions, RunConfig, RunOutcome,
    ShutdownReason, TestExecutionEngine,
};
use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use tracing_subscriber::{fmt, EnvFilter};

mod config_file;

/// Coverage upload command used when none is configured and `CI=true`.
const DEFAULT_COVERAGE_COMMAND: &str = "./node_modules/.bin/codecov";

#[derive(Parser)]
#[command(name = "testdock", version, about = "Containerized test runs for node.js projects")]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Test environment operations
    #[command(subcommand)]
    Test(TestCommands),
    /// Print version and exit
    Version,
}

#[derive(Subcommand)]
enum TestCommands {
    /// Bring the environment up and run the test suite
    Run(RunArgs),
    /// Generate the compose file and print its path
    Compose(RunArgs),
}

#[derive(Args, Default)]
struct RunArgs {
    /// Explicit config file instead of upward discovery
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Project name (also the generated-file directory)
    #[arg(long)]
    project: Option<String>,

    /// Service to declare in the generated compose file (repeatable)
    #[arg(long = "service", value_name = "NAME")]
    services: Vec<String>,

    /// JSON object of per-service override descriptors
    #[arg(long, value_name = "JSON")]
    extras: Option<String>,

    /// Generate the compose file from the service registry
    #[arg(long)]
    auto_compose: bool,

    /// Compose file format version for generated files
    #[arg(long, value_name = "VERSION")]
    auto_compose_version: Option<String>,

    /// Explicit compose file
    #[arg(long, value_name = "FILE")]
    docker_compose: Option<PathBuf>,

    /// Additional compose override file, highest precedence first (repeatable)
    #[arg(long = "docker-compose-multi", value_name = "FILE")]
    docker_compose_multi: Vec<PathBuf>,

    /// Layer the explicit compose file on top of the generated one
    #[arg(long)]
    with_local_compose: bool,

    /// Node.js major version for the default tester image
    #[arg(long)]
    node: Option<String>,

    /// Compose service name of the tester
    #[arg(long)]
    tester_flavour: Option<String>,

    /// Full tester image reference, overriding the node-based default
    #[arg(long)]
    tester_image: Option<String>,

    /// Glob selecting test files
    #[arg(long, value_name = "GLOB")]
    tests: Option<String>,

    /// Coverage report root
    #[arg(long, value_name = "DIR")]
    report_dir: Option<String>,

    /// Runner binary name under the binary root
    #[arg(long)]
    test_framework: Option<String>,

    /// Coverage upload command (defaults from CI=true)
    #[arg(long, value_name = "CMD")]
    coverage: Option<String>,

    /// Disable the nyc coverage wrapper
    #[arg(long)]
    no_nyc_coverage: bool,

    /// Binary root inside the tester
    #[arg(long, value_name = "DIR")]
    root: Option<String>,

    /// Native module to npm-rebuild before tests (repeatable)
    #[arg(long = "rebuild", value_name = "MODULE")]
    rebuild: Vec<String>,

    /// Run node-gyp configure and build before tests
    #[arg(long)]
    gyp: bool,

    /// Seconds to wait after the environment is up
    #[arg(long, value_name = "SECONDS")]
    sleep: Option<u64>,

    /// Host command to run before anything touches the container (repeatable)
    #[arg(long = "pre", value_name = "CMD")]
    pre: Vec<String>,

    /// In-container setup command, run as the exec user (repeatable)
    #[arg(long = "exec", value_name = "CMD")]
    arbitrary_exec: Vec<String>,

    /// In-container command to run after the tests (repeatable)
    #[arg(long = "post-exec", value_name = "CMD")]
    post_exec: Vec<String>,

    /// Host command to run when terminating with a non-zero code
    #[arg(long, value_name = "CMD")]
    on_fail: Option<String>,

    /// Prefix prepended to every test invocation
    #[arg(long, value_name = "CMD")]
    custom_run: Option<String>,

    /// Concurrent test invocations
    #[arg(long, value_name = "N")]
    parallel: Option<usize>,

    /// Run files in lexicographic order (forces --parallel 1)
    #[arg(long)]
    sort: bool,

    /// One combined invocation covering every test file
    #[arg(long)]
    in_one: bool,

    /// Use the in-container exec daemon instead of docker exec
    #[arg(long)]
    http: bool,

    /// User for setup and post-exec commands
    #[arg(long, value_name = "USER")]
    exec_user: Option<String>,

    /// User for test invocations
    #[arg(long, value_name = "USER")]
    test_user: Option<String>,

    /// Sync sources through mutagen instead of a bind mount
    #[arg(long)]
    mutagen: bool,

    /// Host directory synchronized into the mutagen volume
    #[arg(long, value_name = "DIR")]
    mutagen_dir: Option<PathBuf>,

    /// Name of the mutagen-backed source volume
    #[arg(long, value_name = "NAME")]
    mutagen_volume_name: Option<String>,

    /// Treat the mutagen volume as externally managed (never removed)
    #[arg(long)]
    mutagen_volume_external: bool,

    /// Leave the environment running and print the teardown command
    #[arg(long)]
    no_cleanup: bool,

    /// Pull images before bringing the environment up
    #[arg(long)]
    pull: bool,

    /// Bring the environment up, then return without running tests
    #[arg(long)]
    only_prepare: bool,

    /// Arguments forwarded to the test framework
    #[arg(last = true, value_name = "ARGS")]
    test_args: Vec<String>,
}

impl RunArgs {
    /// Lay the flags over the file-derived configuration. Absent flags leave
    /// file values untouched; repeatable flags replace, never append.
    fn apply(self, mut config: RunConfig) -> Result<RunConfig> {
        macro_rules! set_if_some {
            ($($field:ident),+ $(,)?) => {
                $(if let Some(value) = self.$field { config.$field = value; })+
            };
        }
        macro_rules! set_if_flag {
            ($($field:ident),+ $(,)?) => {
                $(if self.$field { config.$field = true; })+
            };
        }

        set_if_some!(
            project,
            auto_compose_version,
            docker_compose,
            node,
            tester_flavour,
            tests,
            report_dir,
            test_framework,
            root,
            sleep,
            parallel,
        );
        set_if_flag!(
            auto_compose,
            with_local_compose,
            gyp,
            sort,
            in_one,
            http,
            mutagen,
            mutagen_volume_external,
            no_cleanup,
            pull,
            only_prepare,
        );

        if !self.services.is_empty() {
            config.services = self.services;
        }
        if !self.docker_compose_multi.is_empty() {
            config.docker_compose_multi = self.docker_compose_multi;
        }
        if !self.rebuild.is_empty() {
            config.rebuild = self.rebuild;
        }
        if !self.pre.is_empty() {
            config.pre = self.pre;
        }
        if !self.arbitrary_exec.is_empty() {
            config.arbitrary_exec = self.arbitrary_exec;
        }
        if !self.post_exec.is_empty() {
            config.post_exec = self.post_exec;
        }
        if !self.test_args.is_empty() {
            config.test_args = self.test_args;
        }

        if self.tester_image.is_some() {
            config.tester_image = self.tester_image;
        }
        if self.coverage.is_some() {
            config.coverage = self.coverage;
        }
        if self.on_fail.is_some() {
            config.on_fail = self.on_fail;
        }
        if self.custom_run.is_some() {
            config.custom_run = self.custom_run;
        }
        if self.exec_user.is_some() {
            config.exec_user = self.exec_user;
        }
        if self.test_user.is_some() {
            config.test_user = self.test_user;
        }
        if self.mutagen_dir.is_some() {
            config.mutagen_dir = self.mutagen_dir;
        }
        if let Some(name) = self.mutagen_volume_name {
            config.mutagen_volume_name = name;
        }
        if self.no_nyc_coverage {
            config.nyc_coverage = false;
        }
        if let Some(extras) = self.extras {
            config.extras = parse_extras(&extras)?;
        }

        Ok(config)
    }
}

/// Extras arrive as a JSON object keyed by service identifier.
fn parse_extras(raw: &str) -> Result<BTreeMap<String, serde_yaml::Value>> {
    let parsed: serde_json::Value =
        serde_json::from_str(raw).context("--extras must be valid JSON")?;
    let object = parsed
        .as_object()
        .context("--extras must be a JSON object keyed by service")?;

    let mut extras = BTreeMap::new();
    for (key, value) in object {
        let value =
            serde_yaml::to_value(value).context("unrepresentable value in --extras")?;
        extras.insert(key.clone(), value);
    }
    Ok(extras)
}

fn init_tracing() {
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .try_init();
}

/// Resolve the effective configuration: file values, flags on top, then
/// environment-driven defaults.
fn resolve_config(args: RunArgs) -> Result<RunConfig> {
    let base = config_file::load(args.config.as_deref())?.unwrap_or_default();
    let mut config = args.apply(base)?;

    if config.coverage.is_none() && matches!(env::var("CI"), Ok(v) if v == "true") {
        config.coverage = Some(DEFAULT_COVERAGE_COMMAND.to_string());
    }
    Ok(config)
}

fn generate_compose_file(config: &RunConfig) -> Result<PathBuf> {
    anyhow::ensure!(
        !config.services.is_empty(),
        "auto-compose requires at least one service (use --service or the config file)"
    );
    let opts = config.compose_options();
    let spec = compose_gen::build_spec(&config.services, &opts)?;
    let path = compose_gen::write_spec(&spec, &opts)?;
    Ok(path)
}

async fn run_tests(args: RunArgs) -> Result<i32> {
    let mut config = resolve_config(args)?;

    let project_dir = env::current_dir().context("cannot resolve working directory")?;
    let (tool, mutagen_active) = resolve_tool(config.mutagen, &project_dir);
    // The generated tester descriptor must match the tool actually driving
    // the stack; a disabled mutagen request falls back to the bind mount.
    config.mutagen = mutagen_active;

    let generated = if config.auto_compose {
        Some(generate_compose_file(&config)?)
    } else {
        None
    };

    let files = assemble_files(
        &config.docker_compose_multi,
        generated.as_deref(),
        &config.docker_compose,
        config.with_local_compose,
    );
    let stack = tool.stack(files);

    let cleanup = CleanupCoordinator::new(
        stack.clone(),
        CleanupOptions {
            disabled: config.no_cleanup || config.only_prepare,
            remove_volumes: !(config.mutagen && config.mutagen_volume_external),
            on_fail: config.on_fail.clone(),
            generated_file: generated,
        },
    );
    cleanup.register_signal_handlers();

    let engine = TestExecutionEngine::new(config, stack);
    let code = match engine.run().await {
        Ok(outcome) => {
            if outcome == RunOutcome::NoTests {
                eprintln!("no test files matched; nothing to run");
            }
            outcome.exit_code()
        }
        Err(err) => {
            eprintln!("run failed: {err:?}");
            128
        }
    };

    cleanup.shutdown(ShutdownReason::Exit { code }).await;
    Ok(code)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.cmd {
        Commands::Test(TestCommands::Run(args)) => {
            let code = run_tests(args).await?;
            std::process::exit(code);
        }
        Commands::Test(TestCommands::Compose(args)) => {
            let config = resolve_config(args)?;
            let path = generate_compose_file(&config)?;
            println!("{}", path.display());
        }
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
        }
    }
    Ok(())
}
