//! Session and local sandbox configuration.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const REGISTRY_FLAG: &str = "--registry=";

/// A command line to spawn inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// The command as a single display string.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// What `dispose()` does to the boot-once flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootPolicy {
    /// Clear the flag on dispose so a later epoch may boot again.
    #[default]
    ResetOnDispose,
    /// Never clear the flag: one boot per page lifetime, full stop.
    Once,
}

/// Controller configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub install: CommandSpec,
    pub server: CommandSpec,
    pub boot_policy: BootPolicy,
    pub dispose_wait_ms: u64,
    pub sweep_processes: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            install: CommandSpec::new(
                "npm",
                &["install", "--registry=https://registry.npmmirror.com"],
            ),
            server: CommandSpec::new("npm", &["run", "dev"]),
            boot_policy: BootPolicy::default(),
            dispose_wait_ms: 5000,
            sweep_processes: true,
        }
    }
}

impl SessionConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Replace (or add) the registry override of the install command.
    pub fn with_registry(mut self, registry: &str) -> Self {
        self.install.args.retain(|a| !a.starts_with(REGISTRY_FLAG));
        self.install.args.push(format!("{REGISTRY_FLAG}{registry}"));
        self
    }

    pub fn dispose_wait(&self) -> Duration {
        Duration::from_millis(self.dispose_wait_ms)
    }
}

/// Settings for the host-backed sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalSandboxConfig {
    pub base_dir: PathBuf,
    pub kill_grace_ms: u64,
    pub probe_attempts: u32,
    pub probe_interval_ms: u64,
}

impl Default for LocalSandboxConfig {
    fn default() -> Self {
        Self {
            base_dir: std::env::temp_dir(),
            kill_grace_ms: 2000,
            probe_attempts: 50,
            probe_interval_ms: 100,
        }
    }
}

impl LocalSandboxConfig {
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_npm_workflow() {
        let config = SessionConfig::default();
        assert_eq!(
            config.install.display(),
            "npm install --registry=https://registry.npmmirror.com"
        );
        assert_eq!(config.server.display(), "npm run dev");
        assert_eq!(config.boot_policy, BootPolicy::ResetOnDispose);
        assert!(config.sweep_processes);
    }

    #[test]
    fn registry_override_replaces_existing_flag() {
        let config = SessionConfig::default().with_registry("https://registry.npmjs.org");
        assert_eq!(
            config.install.args,
            vec!["install", "--registry=https://registry.npmjs.org"]
        );
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"boot_policy": "once", "server": {{"program": "pnpm", "args": ["dev"]}}}}"#
        )
        .unwrap();

        let config = SessionConfig::load(file.path()).unwrap();
        assert_eq!(config.boot_policy, BootPolicy::Once);
        assert_eq!(config.server, CommandSpec::new("pnpm", &["dev"]));
        assert_eq!(config.install, SessionConfig::default().install);
        assert_eq!(config.dispose_wait_ms, 5000);
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();

        let err = SessionConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
