//! Configuration file for the Flix bridge.
//!
//! Lives at `~/.flix-bridge/config.toml` unless `FLIX_BRIDGE_CONFIG` points
//! elsewhere. A missing file is not an error; every field has a default.

use std::path::{Path, PathBuf};
use std::{env, fs};

use flix_bridge::BridgeConfig;
use serde::Deserialize;
use thiserror::Error;

/// Environment variable that overrides the config file location.
pub const CONFIG_PATH_ENV: &str = "FLIX_BRIDGE_CONFIG";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FlixConfig {
    pub bridge: BridgeConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset (e.g. "info", "flix_bridge=debug").
    pub level: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub fn path(&self) -> &PathBuf {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

/// Replace `${VAR}` with the variable's value. Unset variables become empty.
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        let Some(end_rel) = rest[start + 2..].find('}') else {
            break;
        };
        let end = start + 2 + end_rel;
        out.push_str(&rest[..start]);
        let var = &rest[start + 2..end];
        if !var.is_empty() {
            out.push_str(&env::var(var).unwrap_or_default());
        }
        rest = &rest[end + 1..];
    }

    out.push_str(rest);
    out
}

fn expand_all(values: &mut [String]) {
    for value in values {
        *value = expand_env_vars(value);
    }
}

impl FlixConfig {
    pub fn load() -> Result<Option<Self>, ConfigError> {
        let Some(path) = config_path() else {
            return Ok(None);
        };
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file");
            return Ok(None);
        }
        Self::load_from(&path).map(Some)
    }

    /// Read and parse a specific file, then expand `${VAR}` references.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| {
            tracing::warn!("Failed to read config at {}: {source}", path.display());
            ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }
        })?;

        let mut config: Self = toml::from_str(&content).map_err(|source| {
            tracing::warn!("Failed to parse config at {}: {source}", path.display());
            ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }
        })?;
        config.expand_env();
        Ok(config)
    }

    #[must_use]
    pub fn path() -> Option<PathBuf> {
        config_path()
    }

    fn expand_env(&mut self) {
        let worker = &mut self.bridge.worker;
        worker.program = expand_env_vars(&worker.program);
        if let Some(jar) = worker.jar.take() {
            worker.jar = Some(PathBuf::from(expand_env_vars(&jar.to_string_lossy())));
        }
        expand_all(&mut worker.jvm_args);
        expand_all(&mut worker.server_args);
        expand_all(&mut worker.extra_args);
    }
}

pub fn config_path() -> Option<PathBuf> {
    if let Some(path) = env::var_os(CONFIG_PATH_ENV).filter(|p| !p.is_empty()) {
        return Some(PathBuf::from(path));
    }
    dirs::home_dir().map(|home| home.join(".flix-bridge").join("config.toml"))
}
