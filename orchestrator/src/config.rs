//! Run configuration consumed by the orchestrator.
//!
//! The CLI assembles this from flags, the discovered project config file and
//! environment defaults; nothing here touches the filesystem.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Everything a `test run` invocation needs. Field defaults mirror the
/// project config file schema.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct RunConfig {
    /// Project name; also the temp subdirectory for generated compose files.
    pub project: String,
    pub services: Vec<String>,
    /// Per-service override descriptors, keyed by service identifier plus
    /// `tester`.
    pub extras: BTreeMap<String, serde_yaml::Value>,
    pub auto_compose: bool,
    pub auto_compose_version: String,
    pub docker_compose: PathBuf,
    pub docker_compose_multi: Vec<PathBuf>,
    pub with_local_compose: bool,
    pub node: String,
    pub tester_flavour: String,
    pub tester_image: Option<String>,
    /// Glob for test files.
    pub tests: String,
    pub report_dir: String,
    pub test_framework: String,
    /// Coverage upload command; defaulted from `CI` by the CLI layer.
    pub coverage: Option<String>,
    pub nyc_coverage: bool,
    /// Binary root on the tester.
    pub root: String,
    pub rebuild: Vec<String>,
    pub gyp: bool,
    /// Seconds to wait after `up` before running anything.
    pub sleep: u64,
    /// Host-side commands, run before anything touches the container.
    pub pre: Vec<String>,
    /// In-container setup commands, run as the exec user.
    pub arbitrary_exec: Vec<String>,
    /// In-container commands run after the test matrix.
    pub post_exec: Vec<String>,
    /// Host command executed when terminating with a non-zero code.
    pub on_fail: Option<String>,
    pub custom_run: Option<String>,
    pub test_args: Vec<String>,
    pub parallel: usize,
    /// Lexicographic order, concurrency forced to 1.
    pub sort: bool,
    /// One combined invocation covering every discovered file.
    pub in_one: bool,
    /// Exec-daemon-over-socket transport instead of per-command docker exec.
    pub http: bool,
    pub exec_user: Option<String>,
    pub test_user: Option<String>,
    pub mutagen: bool,
    pub mutagen_dir: Option<PathBuf>,
    pub mutagen_volume_name: String,
    pub mutagen_volume_external: bool,
    pub no_cleanup: bool,
    pub pull: bool,
    /// Bring the environment up, then return without running tests.
    pub only_prepare: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            project: "testdock".to_string(),
            services: Vec::new(),
            extras: BTreeMap::new(),
            auto_compose: false,
            auto_compose_version: "3".to_string(),
            docker_compose: PathBuf::from("./test/docker-compose.yml"),
            docker_compose_multi: Vec::new(),
            with_local_compose: false,
            node: "20".to_string(),
            tester_flavour: "tester".to_string(),
            tester_image: None,
            tests: "./test/suites/**/*.js".to_string(),
            report_dir: "./coverage".to_string(),
            test_framework: "mocha".to_string(),
            coverage: None,
            nyc_coverage: true,
            root: "/src/node_modules/.bin".to_string(),
            rebuild: Vec::new(),
            gyp: false,
            sleep: 0,
            pre: Vec::new(),
            arbitrary_exec: Vec::new(),
            post_exec: Vec::new(),
            on_fail: None,
            custom_run: None,
            test_args: Vec::new(),
            parallel: 1,
            sort: false,
            in_one: false,
            http: false,
            exec_user: None,
            test_user: None,
            mutagen: false,
            mutagen_dir: None,
            mutagen_volume_name: "testdock-src".to_string(),
            mutagen_volume_external: false,
            no_cleanup: false,
            pull: false,
            only_prepare: false,
        }
    }
}

impl RunConfig {
    pub fn compose_options(&self) -> compose_gen::ComposeOptions {
        compose_gen::ComposeOptions {
            project: self.project.clone(),
            version: self.auto_compose_version.clone(),
            node: self.node.clone(),
            tester_flavour: self.tester_flavour.clone(),
            tester_image: self.tester_image.clone(),
            http_exec: self.http,
            mutagen: self.mutagen.then(|| compose_gen::MutagenOptions {
                volume_name: self.mutagen_volume_name.clone(),
                external: self.mutagen_volume_external,
                alpha_dir: self
                    .mutagen_dir
                    .clone()
                    .unwrap_or_else(|| std::env::current_dir().unwrap_or_default()),
            }),
            extras: self.extras.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_file_fields_deserialize_with_defaults() {
        let config: RunConfig = serde_yaml::from_str(
            r#"
            auto_compose: true
            services: [redisCluster, postgres]
            in_one: true
            mutagen_volume_external: true
            mutagen_volume_name: app-src
            exec_user: root
            test_user: node
            arbitrary_exec:
              - apk add git
            "#,
        )
        .unwrap();

        assert!(config.auto_compose);
        assert_eq!(config.services, vec!["redisCluster", "postgres"]);
        assert_eq!(config.parallel, 1);
        assert_eq!(config.tests, "./test/suites/**/*.js");
        assert_eq!(config.exec_user.as_deref(), Some("root"));
        assert!(config.mutagen_volume_external);
    }

    #[test]
    fn mutagen_options_only_materialize_when_requested() {
        let config = RunConfig::default();
        assert!(config.compose_options().mutagen.is_none());

        let config = RunConfig {
            mutagen: true,
            mutagen_volume_external: true,
            ..Default::default()
        };
        let opts = config.compose_options();
        let mutagen = opts.mutagen.unwrap();
        assert_eq!(mutagen.volume_name, "testdock-src");
        assert!(mutagen.external);
    }
}
