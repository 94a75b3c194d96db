//! Auto-compose generation: builds a docker-compose topology from a
//! declarative service list plus per-service overrides, synthesizes the
//! `tester` service, and writes the result to a collision-free temp path.

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::env;
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

mod merge;
mod registry;

pub use merge::deep_merge;
pub use registry::KNOWN_SERVICES;

/// Idle command the tester runs when nothing else is configured. The http
/// exec daemon only replaces the command while it is still this placeholder.
pub const DEFAULT_TESTER_COMMAND: &str = "tail -f /dev/null";

/// Container path the daemon binary is bound to in http exec mode.
pub const EXECD_CONTAINER_PATH: &str = "/usr/local/bin/testdock-execd";

#[derive(Debug, Error)]
pub enum ComposeGenError {
    #[error("no support for service '{identifier}', known services: {known}",
        known = KNOWN_SERVICES.join(", "))]
    UnknownService { identifier: String },

    #[error("failed to serialize compose spec: {0}")]
    Serialize(#[from] serde_yaml::Error),

    #[error("failed to write compose file at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// The generated topology. Written once, never mutated after write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposeSpec {
    pub version: String,
    pub networks: Mapping,
    pub services: Mapping,
    pub volumes: Mapping,
    #[serde(rename = "x-mutagen", skip_serializing_if = "Option::is_none")]
    pub mutagen: Option<Value>,
}

/// File-sync mode: the tester working dir becomes a named volume kept in
/// sync by mutagen instead of a host bind.
#[derive(Debug, Clone)]
pub struct MutagenOptions {
    pub volume_name: String,
    /// Externally managed volumes survive between runs and are never removed
    /// by cleanup.
    pub external: bool,
    /// Host directory synchronized into the volume.
    pub alpha_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ComposeOptions {
    /// Project name, used as the temp subdirectory for generated files.
    pub project: String,
    /// Compose file format version (`auto_compose_version`).
    pub version: String,
    pub node: String,
    pub tester_flavour: String,
    pub tester_image: Option<String>,
    /// Replace the tester idle command with the exec daemon launch command
    /// and bind the daemon binary plus its socket directory.
    pub http_exec: bool,
    pub mutagen: Option<MutagenOptions>,
    /// Per-service override descriptors, keyed by requested identifier
    /// (plus `tester`), deep-merged onto the registry defaults.
    pub extras: BTreeMap<String, Value>,
}

impl Default for ComposeOptions {
    fn default() -> Self {
        Self {
            project: "testdock".to_string(),
            version: "3".to_string(),
            node: "20".to_string(),
            tester_flavour: "tester".to_string(),
            tester_image: None,
            http_exec: false,
            mutagen: None,
            extras: BTreeMap::new(),
        }
    }
}

/// Build the in-memory compose spec for the requested services.
///
/// Service identifiers must exist in the static registry; the synthesized
/// `tester` service is always present and depends on every other declared
/// service.
pub fn build_spec(
    services: &[String],
    opts: &ComposeOptions,
) -> Result<ComposeSpec, ComposeGenError> {
    let mut spec = ComposeSpec {
        version: opts.version.clone(),
        networks: Mapping::new(),
        services: Mapping::new(),
        volumes: Mapping::new(),
        mutagen: None,
    };

    if let Some(mutagen) = &opts.mutagen {
        declare_mutagen(&mut spec, mutagen);
    }

    let sentinel = template_path("redis-sentinel.sh");
    for identifier in services {
        for template in registry::resolve(identifier, &sentinel.to_string_lossy())? {
            let mut descriptor = template.descriptor;
            // Overrides are keyed by the produced service key, so an
            // identifier that expands to several services takes a distinct
            // overlay per service instead of smearing one across all of them.
            if let Some(overlay) = opts.extras.get(template.key) {
                deep_merge(&mut descriptor, overlay);
            }
            spec.services.insert(Value::from(template.key), descriptor);
        }
    }

    let wants_cluster = services.iter().any(|s| s == "redisCluster");
    tester_service(&mut spec, opts, wants_cluster);

    Ok(spec)
}

/// Serialize the spec to `<tmpdir>/<project>/docker-compose.<id>.yml`.
///
/// The directory is created recursively (idempotent, 0o755) and the file
/// name carries a random URL-safe identifier so concurrent invocations on
/// the same host never collide.
pub fn write_spec(spec: &ComposeSpec, opts: &ComposeOptions) -> Result<PathBuf, ComposeGenError> {
    let dir = env::temp_dir().join(&opts.project);
    fs::create_dir_all(&dir).map_err(|source| ComposeGenError::Io {
        path: dir.clone(),
        source,
    })?;
    #[cfg(unix)]
    fs::set_permissions(&dir, fs::Permissions::from_mode(0o755)).map_err(|source| {
        ComposeGenError::Io {
            path: dir.clone(),
            source,
        }
    })?;

    let path = dir.join(format!("docker-compose.{}.yml", Uuid::new_v4().simple()));
    let rendered = serde_yaml::to_string(spec)?;
    fs::write(&path, rendered).map_err(|source| ComposeGenError::Io {
        path: path.clone(),
        source,
    })?;

    debug!(path = %path.display(), "wrote auto-compose file");
    Ok(path)
}

fn declare_mutagen(spec: &mut ComposeSpec, mutagen: &MutagenOptions) {
    let mut volume = Mapping::new();
    if mutagen.external {
        volume.insert(Value::from("external"), Value::from(true));
    }
    spec.volumes
        .insert(Value::from(mutagen.volume_name.clone()), Value::Mapping(volume));

    let session: Value = serde_yaml::from_str(&format!(
        r#"
        sync:
          defaults:
            ignore:
              vcs: true
            mode: two-way-resolved
          code:
            alpha: {alpha}
            beta: volume://{volume}
        "#,
        alpha = mutagen.alpha_dir.display(),
        volume = mutagen.volume_name,
    ))
    .expect("static mutagen session template must parse");

    spec.mutagen = Some(session);
}

/// Synthesize the tester service and append it to the spec.
fn tester_service(spec: &mut ComposeSpec, opts: &ComposeOptions, wants_cluster: bool) {
    let image = opts.tester_image.clone().unwrap_or_else(|| {
        format!("makeomatic/node:{}-{}", opts.node, opts.tester_flavour)
    });

    let mut descriptor: Value = serde_yaml::from_str(&format!(
        r#"
        image: {image}
        hostname: tester
        working_dir: /src
        volumes: []
        environment:
          NODE_ENV: test
        command: {DEFAULT_TESTER_COMMAND}
        "#,
    ))
    .expect("static tester template must parse");

    if let Some(overlay) = opts.extras.get("tester") {
        deep_merge(&mut descriptor, overlay);
    }

    let map = descriptor
        .as_mapping_mut()
        .expect("tester descriptor is a mapping");

    // Working-dir mount: either the host bind or the sync volume, never both.
    let mut volumes: Vec<Value> = map
        .get(Value::from("volumes"))
        .and_then(Value::as_sequence)
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .filter(|v| v.as_str().map(|s| !s.contains("${PWD}:/src")).unwrap_or(true))
        .collect();

    match &opts.mutagen {
        Some(mutagen) => volumes.push(Value::from(format!("{}:/src", mutagen.volume_name))),
        None => volumes.push(Value::from("${PWD}:/src")),
    }

    if opts.http_exec {
        volumes.push(Value::from("/var/run:/var/run"));
        volumes.push(Value::from(format!(
            "{}:{}:ro",
            execd_binary_path().display(),
            EXECD_CONTAINER_PATH
        )));

        let still_default = map
            .get(Value::from("command"))
            .and_then(Value::as_str)
            .map(|cmd| cmd == DEFAULT_TESTER_COMMAND)
            .unwrap_or(false);
        if still_default {
            map.insert(Value::from("command"), Value::from(EXECD_CONTAINER_PATH));
        }
    }

    if wants_cluster {
        let script = wait_for_cluster_script();
        volumes.push(Value::from(format!(
            "{}:/wait-for-cluster.sh:ro",
            script.display()
        )));
        let current = map
            .get(Value::from("command"))
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_TESTER_COMMAND)
            .to_string();
        map.insert(
            Value::from("command"),
            Value::from(format!("/bin/sh /wait-for-cluster.sh {current}")),
        );
    }

    map.insert(Value::from("volumes"), Value::Sequence(volumes));

    let depends_on: Vec<Value> = spec.services.keys().cloned().collect();
    if !depends_on.is_empty() {
        map.insert(Value::from("depends_on"), Value::Sequence(depends_on));
    }

    spec.services.insert(Value::from("tester"), descriptor);
}

/// Host path for a packaged template script. `TESTDOCK_TEMPLATES_DIR`
/// overrides the install-relative default.
fn template_path(name: &str) -> PathBuf {
    if let Ok(dir) = env::var("TESTDOCK_TEMPLATES_DIR") {
        return Path::new(&dir).join(name);
    }
    env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|d| d.join("templates").join(name)))
        .unwrap_or_else(|| Path::new("templates").join(name))
}

/// Path of the cluster readiness guard script bound into the tester.
fn wait_for_cluster_script() -> PathBuf {
    match env::var("TESTDOCK_WAIT_CLUSTER_SCRIPT") {
        Ok(path) => PathBuf::from(path),
        Err(_) => template_path("wait-for-cluster.sh"),
    }
}

/// Host path of the exec daemon binary bound into the tester in http mode.
fn execd_binary_path() -> PathBuf {
    if let Ok(path) = env::var("TESTDOCK_EXECD_BIN") {
        return PathBuf::from(path);
    }
    env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|d| d.join("testdock-execd")))
        .unwrap_or_else(|| PathBuf::from("testdock-execd"))
}
