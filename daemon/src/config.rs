use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Context, Result};
use std::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    /// Worker and renderer process cap; 0 picks one from the CPU count.
    #[serde(default)]
    pub max_parallel: usize,
}

fn default_socket_path() -> PathBuf { PathBuf::from(common::DEFAULT_SOCKET_PATH) }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            max_parallel: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderConfig {
    #[serde(default = "default_program")]
    pub program: PathBuf,
    /// Arguments placed before the per-job arguments (wrappers such as xvfb-run).
    #[serde(default)]
    pub base_args: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_template_dir")]
    pub template_dir: PathBuf,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    #[serde(default)]
    pub keep_intermediate_files: bool,
}

fn default_program() -> PathBuf { PathBuf::from("glabels-3-batch") }
fn default_timeout_secs() -> u64 { 600 }
fn default_template_dir() -> PathBuf { PathBuf::from("templates") }
fn default_output_dir() -> PathBuf { PathBuf::from("output") }
fn default_temp_dir() -> PathBuf { PathBuf::from("temp") }

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            base_args: Vec::new(),
            timeout_secs: default_timeout_secs(),
            template_dir: default_template_dir(),
            output_dir: default_output_dir(),
            temp_dir: default_temp_dir(),
            keep_intermediate_files: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_retention_hours")]
    pub hours: u64,
    #[serde(default = "default_auto_cleanup_output")]
    pub auto_cleanup_output: bool,
    /// Idle-time sweep period; 0 leaves only the sweep after each job.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_retention_hours() -> u64 { 24 }
fn default_auto_cleanup_output() -> bool { true }
fn default_sweep_interval_secs() -> u64 { 300 }

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            hours: default_retention_hours(),
            auto_cleanup_output: default_auto_cleanup_output(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    pub output: Option<PathBuf>,
}

fn default_log_level() -> String { "info".to_string() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            output: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub render: RenderConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(config)
    }

    /// Detect file type by extension and load
    pub fn from_file(path: &Path) -> Result<Self> {
        let ext = path.extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");

        match ext {
            "yaml" | "yml" => Self::from_yaml_file(path),
            "toml" => Self::from_toml_file(path),
            _ => Err(anyhow::anyhow!("Unsupported config file format. Use .yaml, .yml, or .toml")),
        }
    }

    /// Load `path` if it exists, otherwise start from defaults; then apply
    /// `LABELQ_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => Self::from_file(path)?,
            Some(path) => {
                log::warn!("Config file {:?} not found, using defaults", path);
                Config::default()
            }
            None => Config::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Override fields from environment-style variables supplied by `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("LABELQ_SOCKET") {
            self.server.socket_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("LABELQ_MAX_PARALLEL") {
            self.server.max_parallel = v.parse()
                .with_context(|| format!("Invalid LABELQ_MAX_PARALLEL: {}", v))?;
        }
        if let Some(v) = lookup("LABELQ_RENDER_TIMEOUT") {
            self.render.timeout_secs = v.parse()
                .with_context(|| format!("Invalid LABELQ_RENDER_TIMEOUT: {}", v))?;
        }
        if let Some(v) = lookup("LABELQ_KEEP_CSV") {
            self.render.keep_intermediate_files = parse_bool(&v)
                .with_context(|| format!("Invalid LABELQ_KEEP_CSV: {}", v))?;
        }
        if let Some(v) = lookup("LABELQ_RETENTION_HOURS") {
            self.retention.hours = v.parse()
                .with_context(|| format!("Invalid LABELQ_RETENTION_HOURS: {}", v))?;
        }
        if let Some(v) = lookup("LABELQ_AUTO_CLEANUP_PDF") {
            self.retention.auto_cleanup_output = parse_bool(&v)
                .with_context(|| format!("Invalid LABELQ_AUTO_CLEANUP_PDF: {}", v))?;
        }
        if let Some(v) = lookup("LABELQ_LOG_LEVEL") {
            self.logging.level = v.to_lowercase();
        }
        if let Some(v) = lookup("LABELQ_LOG") {
            self.logging.output = Some(PathBuf::from(v));
        }
        Ok(())
    }

    /// Effective worker count: explicit value, or CPUs minus one (at least one).
    pub fn max_parallel(&self) -> usize {
        resolve_max_parallel(self.server.max_parallel)
    }

    pub fn render_timeout(&self) -> Duration {
        Duration::from_secs(self.render.timeout_secs)
    }

    pub fn retention_window(&self) -> Duration {
        Duration::from_secs(self.retention.hours * 3600)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        match self.retention.sweep_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

pub fn resolve_max_parallel(configured: usize) -> usize {
    if configured > 0 {
        return configured;
    }
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2);
    cpus.saturating_sub(1).max(1)
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(anyhow::anyhow!("expected a boolean")),
    }
}
