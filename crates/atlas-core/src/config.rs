//! Run configuration.
//!
//! A run is configured from a TOML file, then `ATLAS_*` environment
//! variables override individual fields:
//!
//! ```toml
//! start_url = "https://app.example/"
//! atlas_root = "./atlas"
//! edge_strategy = "auto"   # auto | symlink | json
//!
//! [limits]
//! max_nodes = 50
//! max_depth = 5
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use atlas_explore::ExplorationLimits;
use atlas_store::EdgeStrategy;

/// Config files larger than this are rejected.
const MAX_CONFIG_FILE_SIZE: u64 = 1024 * 1024; // 1 MB

pub const ENV_START_URL: &str = "ATLAS_START_URL";
pub const ENV_ROOT: &str = "ATLAS_ROOT";
pub const ENV_MAX_NODES: &str = "ATLAS_MAX_NODES";
pub const ENV_MAX_DEPTH: &str = "ATLAS_MAX_DEPTH";
pub const ENV_MAX_ITERATIONS: &str = "ATLAS_MAX_ITERATIONS";

/// Every environment variable [`RunConfig::apply_env_overrides`] reads.
pub const ENV_OVERRIDES: [&str; 5] = [
    ENV_START_URL,
    ENV_ROOT,
    ENV_MAX_NODES,
    ENV_MAX_DEPTH,
    ENV_MAX_ITERATIONS,
];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Config file {} too large ({size} bytes, max {max})", path.display())]
    TooLarge { path: PathBuf, size: u64, max: u64 },

    #[error("Invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid value for {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    /// Absolute URL exploration starts from.
    pub start_url: String,
    /// Directory holding the atlas.
    pub atlas_root: PathBuf,
    #[serde(default)]
    pub limits: ExplorationLimits,
    #[serde(default)]
    pub edge_strategy: EdgeStrategy,
}

impl RunConfig {
    pub fn new(start_url: impl Into<String>, atlas_root: impl Into<PathBuf>) -> Self {
        Self {
            start_url: start_url.into(),
            atlas_root: atlas_root.into(),
            limits: ExplorationLimits::default(),
            edge_strategy: EdgeStrategy::default(),
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Read a config file, apply process environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        let size = std::fs::metadata(path).map_err(io_err)?.len();
        if size > MAX_CONFIG_FILE_SIZE {
            return Err(ConfigError::TooLarge {
                path: path.to_path_buf(),
                size,
                max: MAX_CONFIG_FILE_SIZE,
            });
        }
        let raw = std::fs::read_to_string(path).map_err(io_err)?;

        let mut config = Self::from_toml_str(&raw)?;
        let applied = config.apply_env_overrides(|var| std::env::var(var).ok())?;
        if !applied.is_empty() {
            tracing::debug!(?applied, "applied environment overrides");
        }
        config.validate()?;
        tracing::debug!(path = %path.display(), start_url = %config.start_url, "loaded run config");
        Ok(config)
    }

    /// Override fields from `ATLAS_*` variables, looked up through
    /// `lookup`. Returns the variables that were applied.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<Vec<&'static str>, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut applied = Vec::new();
        for var in ENV_OVERRIDES {
            let Some(raw) = lookup(var) else {
                continue;
            };
            match var {
                ENV_START_URL => self.start_url = raw,
                ENV_ROOT => self.atlas_root = PathBuf::from(raw),
                ENV_MAX_NODES => self.limits.max_nodes = parse_env(var, &raw)?,
                ENV_MAX_DEPTH => self.limits.max_depth = parse_env(var, &raw)?,
                ENV_MAX_ITERATIONS => self.limits.max_iterations = parse_env(var, &raw)?,
                _ => continue,
            }
            applied.push(var);
        }
        Ok(applied)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.start_url.trim().is_empty() {
            return Err(ConfigError::Invalid("start_url is empty".into()));
        }
        Url::parse(&self.start_url).map_err(|e| {
            ConfigError::Invalid(format!("start_url {:?} is not an absolute URL: {e}", self.start_url))
        })?;
        if self.atlas_root.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("atlas_root is empty".into()));
        }

        let limits = &self.limits;
        let bounds = [
            ("max_iterations", limits.max_iterations),
            ("max_nodes", limits.max_nodes),
            ("max_depth", u64::from(limits.max_depth)),
            ("action_timeout_secs", limits.action_timeout_secs),
            ("page_load_timeout_secs", limits.page_load_timeout_secs),
            ("max_wall_secs", limits.max_wall_secs),
        ];
        for (name, value) in bounds {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("limits.{name} must be > 0")));
            }
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var,
        value: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_toml_uses_defaults() {
        let config = RunConfig::from_toml_str(
            r#"
            start_url = "https://app.test/"
            atlas_root = "/tmp/atlas"
            "#,
        )
        .unwrap();
        assert_eq!(config.limits, ExplorationLimits::default());
        assert_eq!(config.edge_strategy, EdgeStrategy::Auto);
        config.validate().unwrap();
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = RunConfig::from_toml_str(
            r#"
            start_url = "https://app.test/"
            atlas_root = "/tmp/atlas"
            max_nodes = 3
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
    }

    #[test]
    fn test_parse_env_reports_variable() {
        let err = parse_env::<u64>(ENV_MAX_NODES, "lots").unwrap_err();
        assert!(err.to_string().contains("ATLAS_MAX_NODES"));
        assert_eq!(parse_env::<u32>(ENV_MAX_DEPTH, " 4 ").unwrap(), 4);
    }
}
