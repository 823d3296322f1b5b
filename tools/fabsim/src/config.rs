//! Simulator settings
//!
//! Layered with figment: built-in defaults, then `fabsim.yaml` (optional),
//! then `FABSIM_*` environment variables. CLI flags are applied last by the caller.

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "fabsim.yaml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FabsimConfig {
    /// Rule catalog (JSON or YAML)
    #[serde(default)]
    pub catalog: Option<PathBuf>,

    #[serde(default = "default_total_wafers")]
    pub total_wafers: usize,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enables the per-catalog rule log files
    #[serde(default)]
    pub rule_log_dir: Option<PathBuf>,

    /// Submit transfers to the simulated scheduler instead of commanding robots
    #[serde(default)]
    pub use_scheduler: bool,
}

fn default_total_wafers() -> usize {
    25
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for FabsimConfig {
    fn default() -> Self {
        Self {
            catalog: None,
            total_wafers: default_total_wafers(),
            log_level: default_log_level(),
            rule_log_dir: None,
            use_scheduler: false,
        }
    }
}

impl FabsimConfig {
    pub fn load(path: &Path) -> Result<Self> {
        Self::figment(path)
            .merge(Env::prefixed("FABSIM_"))
            .extract()
            .with_context(|| format!("Failed to load configuration from {}", path.display()))
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(FabsimConfig::default())).merge(Yaml::file(path))
    }
}
