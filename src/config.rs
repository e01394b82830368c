use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::channels::NumberingScheme;

/// Top-level configuration for the streaming engine.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Physical channel numbering scheme. Default: one-based with signed
    /// inversion for falling edges.
    #[serde(default = "default_scheme")]
    pub scheme: NumberingScheme,

    /// Number of physical input channels. Default: 18.
    #[serde(default = "default_input_channels")]
    pub input_channels: u32,

    /// Upper bound on outstanding fences; allocation blocks at the bound.
    /// Default: 16.
    #[serde(default = "default_max_pending_fences")]
    pub max_pending_fences: u32,

    /// Worker threads for parallel block dispatch. 0 selects the available
    /// hardware parallelism. Default: 0.
    #[serde(default)]
    pub dispatch_workers: usize,

    /// How often the dispatch loop logs stream statistics. Default: 60s.
    #[serde(default = "default_stats_log_interval", with = "humantime_serde")]
    pub stats_log_interval: Duration,
}

fn default_scheme() -> NumberingScheme {
    NumberingScheme::OneBased
}

fn default_input_channels() -> u32 {
    18
}

fn default_max_pending_fences() -> u32 {
    16
}

fn default_stats_log_interval() -> Duration {
    Duration::from_secs(60)
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scheme: default_scheme(),
            input_channels: default_input_channels(),
            max_pending_fences: default_max_pending_fences(),
            dispatch_workers: 0,
            stats_log_interval: default_stats_log_interval(),
        }
    }
}

impl EngineConfig {
    /// Loads and validates a configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;

        let cfg: Self = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing config from {}", path.display()))?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Validates field ranges.
    pub fn validate(&self) -> Result<()> {
        if self.input_channels == 0 {
            bail!("input_channels must be > 0");
        }

        if self.max_pending_fences == 0 {
            bail!("max_pending_fences must be > 0");
        }

        Ok(())
    }

    /// Resolved dispatch worker count.
    pub fn workers(&self) -> usize {
        if self.dispatch_workers > 0 {
            self.dispatch_workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}
