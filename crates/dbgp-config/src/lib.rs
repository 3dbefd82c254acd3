//! Configuration for the DBGp session engine.
//!
//! Values are layered, lowest precedence first:
//!
//! 1. built-in defaults,
//! 2. a TOML file (`--config` / `DBGP_CONFIG`),
//! 3. `XDEBUG_MCP_*` environment variables,
//! 4. command-line flags (applied by the binary).
//!
//! Path-mapping rules are resolved here and handed to the engine as plain
//! data; the engine never parses configuration formats itself.

mod logging;
mod mappings;

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use logging::{init_tracing, LoggingConfig};
pub use mappings::{
    mappings_from_docker_compose, mappings_from_launch_json, order_by_specificity,
    parse_mapping_object, strip_jsonc,
};

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 9003;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_HISTORY_ENTRIES: usize = 100;

pub const ENV_CONFIG: &str = "DBGP_CONFIG";
pub const ENV_PORT: &str = "XDEBUG_MCP_PORT";
pub const ENV_CONNECT_TIMEOUT: &str = "XDEBUG_MCP_CONNECT_TIMEOUT";
pub const ENV_PROJECT_ROOT: &str = "XDEBUG_MCP_PROJECT_ROOT";
pub const ENV_PATH_MAPPINGS: &str = "XDEBUG_MCP_PATH_MAPPINGS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid value for {var}: {message}")]
    Env { var: &'static str, message: String },
}

/// One prefix-translation rule between the local project tree and the
/// debuggee's filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathMapping {
    /// Local prefix; relative prefixes are resolved against the project root.
    pub local: String,
    /// Prefix as seen by the debuggee (e.g. `/var/www/html`).
    pub remote: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ListenConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_secs: u64,
}

impl ListenConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProjectConfig {
    /// Project root; defaults to the current working directory.
    pub root: Option<PathBuf>,
    /// Explicit rules. Resolution orders them most specific first.
    pub path_mappings: Vec<PathMapping>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HistoryConfig {
    /// Oldest snapshots of a variable are evicted beyond this count.
    pub max_entries_per_variable: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_entries_per_variable: DEFAULT_HISTORY_ENTRIES,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DebugConfig {
    pub listen: ListenConfig,
    pub project: ProjectConfig,
    pub history: HistoryConfig,
    pub logging: LoggingConfig,
}

impl DebugConfig {
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::load_from_str(&text)
    }

    pub fn load_from_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Overlay `XDEBUG_MCP_*` variables from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|var| std::env::var(var).ok())
    }

    /// Overlay environment-style settings from an arbitrary lookup.
    pub fn apply_env_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let get = |var: &str| {
            lookup(var)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(port) = get(ENV_PORT) {
            self.listen.port = port.parse().map_err(|err| ConfigError::Env {
                var: ENV_PORT,
                message: format!("{port:?} is not a port number: {err}"),
            })?;
        }
        if let Some(secs) = get(ENV_CONNECT_TIMEOUT) {
            self.listen.connect_timeout_secs = secs.parse().map_err(|err| ConfigError::Env {
                var: ENV_CONNECT_TIMEOUT,
                message: format!("{secs:?} is not a number of seconds: {err}"),
            })?;
        }
        if let Some(root) = get(ENV_PROJECT_ROOT) {
            self.project.root = Some(PathBuf::from(root));
        }
        if let Some(raw) = get(ENV_PATH_MAPPINGS) {
            self.project.path_mappings =
                parse_mapping_object(&raw).map_err(|message| ConfigError::Env {
                    var: ENV_PATH_MAPPINGS,
                    message,
                })?;
        }
        Ok(())
    }

    pub fn project_root(&self) -> PathBuf {
        match &self.project.root {
            Some(root) => root.clone(),
            None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Effective mapping rules, most specific local prefix first.
    ///
    /// The first source that yields rules wins: explicit configuration, then
    /// `.vscode/launch.json`, then the bind mounts in the compose file under
    /// the project root.
    pub fn resolve_path_mappings(&self) -> Vec<PathMapping> {
        let root = self.project_root();
        let mut rules = if !self.project.path_mappings.is_empty() {
            self.project.path_mappings.clone()
        } else if let Some(rules) = mappings_from_launch_json(&root) {
            tracing::info!(
                target = "dbgp.config",
                count = rules.len(),
                root = %root.display(),
                "inferred path mappings from .vscode/launch.json"
            );
            rules
        } else if let Some(rules) = mappings_from_docker_compose(&root) {
            tracing::info!(
                target = "dbgp.config",
                count = rules.len(),
                root = %root.display(),
                "inferred path mappings from compose bind mounts"
            );
            rules
        } else {
            Vec::new()
        };
        order_by_specificity(&mut rules, &root);
        rules
    }
}
