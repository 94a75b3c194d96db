//! Project configuration file discovery.
//!
//! The config file is looked up in the working directory and then upward
//! through its ancestors, so invocations from a subdirectory of the project
//! still find it. Values from the file sit beneath command-line flags.

use anyhow::{Context, Result};
use orchestrator::RunConfig;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Recognized file names, in precedence order within a directory.
pub const CONFIG_FILE_NAMES: &[&str] = &[".testdock.yml", ".testdock.yaml", ".testdock.json"];

/// Nearest config file at or above `start`.
pub fn discover(start: &Path) -> Option<PathBuf> {
    let mut dir = Some(start);
    while let Some(current) = dir {
        for name in CONFIG_FILE_NAMES {
            let candidate = current.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        dir = current.parent();
    }
    None
}

/// Load the explicit config file, or the discovered one, or nothing.
///
/// JSON parses as YAML, so one parser covers every recognized extension.
pub fn load(explicit: Option<&Path>) -> Result<Option<RunConfig>> {
    let path = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => discover(&env::current_dir().context("cannot resolve working directory")?),
    };
    let Some(path) = path else {
        return Ok(None);
    };

    debug!(path = %path.display(), "loading project config");
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: RunConfig = serde_yaml::from_str(&raw)
        .with_context(|| format!("invalid config file {}", path.display()))?;
    Ok(Some(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nearest_config_file_wins() {
        let root = tempfile::tempdir().unwrap();
        let nested = root.path().join("packages/app");
        fs::create_dir_all(&nested).unwrap();
        fs::write(root.path().join(".testdock.yml"), "project: outer\n").unwrap();

        let found = discover(&nested).unwrap();
        assert_eq!(found, root.path().join(".testdock.yml"));

        fs::write(nested.join(".testdock.json"), "{\"project\": \"inner\"}").unwrap();
        let found = discover(&nested).unwrap();
        assert_eq!(found, nested.join(".testdock.json"));
    }

    #[test]
    fn json_config_files_parse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".testdock.json");
        fs::write(&path, r#"{"project": "demo", "services": ["redis"], "parallel": 3}"#).unwrap();

        let config = load(Some(&path)).unwrap().unwrap();
        assert_eq!(config.project, "demo");
        assert_eq!(config.services, vec!["redis"]);
        assert_eq!(config.parallel, 3);
    }
}
