//! Configuration loading and parsing

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use trampoline_registry::BridgeConfig;

/// Main application configuration (loaded from a TOML file)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub workload: WorkloadConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// Shape of the soak workload
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkloadConfig {
    /// Number of simulated objects that emit signals
    #[serde(default = "default_objects")]
    pub objects: usize,
    /// Signal names connected on every object
    #[serde(default = "default_signals")]
    pub signals: Vec<String>,
    /// Distinct closures shared across all connections
    #[serde(default = "default_shared_closures")]
    pub shared_closures: usize,
    /// One-shot sources (half idle, half timeout)
    #[serde(default = "default_once_sources")]
    pub once_sources: usize,
    /// Repeating idle sources
    #[serde(default = "default_idle_sources")]
    pub idle_sources: usize,
    /// Repeating timeout sources
    #[serde(default = "default_timeout_sources")]
    pub timeout_sources: usize,
    /// Sources backed directly by one of the shared closures
    #[serde(default = "default_callback_sources")]
    pub callback_sources: usize,
    /// How often a repeating source runs before asking to be removed
    #[serde(default = "default_source_repeats")]
    pub source_repeats: usize,
    #[serde(default = "default_timeout_interval")]
    pub timeout_interval_ms: u32,
    /// Virtual time advanced per main-loop iteration
    #[serde(default = "default_tick")]
    pub tick_ms: u64,
    /// Main-loop iterations to run before teardown
    #[serde(default = "default_iterations")]
    pub iterations: usize,
    /// Worker threads used to connect and schedule
    #[serde(default = "default_threads")]
    pub threads: usize,
}

fn default_objects() -> usize {
    8
}

fn default_signals() -> Vec<String> {
    vec!["clicked".to_string(), "changed".to_string(), "destroy".to_string()]
}

fn default_shared_closures() -> usize {
    4
}

fn default_once_sources() -> usize {
    2000
}

fn default_idle_sources() -> usize {
    200
}

fn default_timeout_sources() -> usize {
    200
}

fn default_callback_sources() -> usize {
    4
}

fn default_source_repeats() -> usize {
    5
}

fn default_timeout_interval() -> u32 {
    10
}

fn default_tick() -> u64 {
    10
}

fn default_iterations() -> usize {
    20
}

fn default_threads() -> usize {
    4
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            objects: default_objects(),
            signals: default_signals(),
            shared_closures: default_shared_closures(),
            once_sources: default_once_sources(),
            idle_sources: default_idle_sources(),
            timeout_sources: default_timeout_sources(),
            callback_sources: default_callback_sources(),
            source_repeats: default_source_repeats(),
            timeout_interval_ms: default_timeout_interval(),
            tick_ms: default_tick(),
            iterations: default_iterations(),
            threads: default_threads(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OutputConfig {
    #[serde(default)]
    pub format: OutputFormat,
    /// Report file (default: stdout)
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Txt,
    Json,
}

impl AppConfig {
    /// Check the configuration before running anything
    pub fn validate(&self) -> Result<()> {
        self.bridge
            .validate()
            .context("Invalid [bridge] section")?;

        let workload = &self.workload;
        if workload.threads == 0 {
            bail!("workload.threads must be at least 1");
        }
        if workload.shared_closures == 0 && (workload.objects > 0 || workload.callback_sources > 0) {
            bail!("workload.shared_closures must be at least 1 when signals or callback sources are used");
        }
        if workload.source_repeats == 0 {
            bail!("workload.source_repeats must be at least 1");
        }
        Ok(())
    }
}

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    config
        .validate()
        .with_context(|| format!("Invalid config file: {:?}", path))?;
    Ok(config)
}
