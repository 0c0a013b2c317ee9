use anyhow::{bail, Context};
use serde::Deserialize;
use std::{collections::BTreeMap, fs, path::Path};

/// Where the supervisor reads its tunables from.
///
/// Queried at the point of use, so an implementation backed by a live
/// settings store is picked up without restarting the supervisor.
pub trait ConfigSource: Send + Sync {
    /// Environment used when `start` is called without one.
    fn default_environment(&self) -> Vec<String>;
    /// Capacity of each service's log buffer.
    fn max_log_lines(&self) -> usize;
}

fn default_max_log_lines() -> usize { 1000 }
fn default_log_dir() -> String { String::from("logs") }
fn default_log_level() -> String { String::from("info") }


#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub executable: String,
    #[serde(default)]
    pub environment: Vec<String>,
    #[serde(default)]
    pub autostart: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_max_log_lines")]
    pub max_log_lines: usize,
    #[serde(default)]
    pub default_environment: Vec<String>,
    #[serde(default)]
    pub spawn_timeout_ms: Option<u64>,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_log_lines: default_max_log_lines(),
            default_environment: Vec::new(),
            spawn_timeout_ms: None,
            log_dir: default_log_dir(),
            log_level: default_log_level(),
            services: BTreeMap::new(),
        }
    }
}

impl ConfigSource for Config {
    fn default_environment(&self) -> Vec<String> {
        self.default_environment.clone()
    }

    fn max_log_lines(&self) -> usize {
        self.max_log_lines
    }
}

impl Config {
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let cfg: Config = serde_yaml::from_str(yaml).context("malformed config yaml")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /*
        @@@
        @validate();
        . A zero log capacity is refused here rather than on the first log line.
        . Every environment entry, global or per service, must be KEY=VALUE.
    */
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_log_lines == 0 {
            bail!("max_log_lines must be a positive integer");
        }
        for entry in &self.default_environment {
            split_env_entry(entry).with_context(|| "in default_environment")?;
        }
        for (name, svc) in &self.services {
            if svc.executable.trim().is_empty() {
                bail!("service `{}` has an empty executable", name);
            }
            for entry in &svc.environment {
                split_env_entry(entry).with_context(|| format!("in service `{}`", name))?;
            }
        }
        Ok(())
    }

    pub fn level(&self) -> tracing::Level {
        self.log_level.parse().unwrap_or(tracing::Level::INFO)
    }
}

/// Split a `KEY=VALUE` entry. The value may itself contain `=`.
pub fn split_env_entry(entry: &str) -> anyhow::Result<(&str, &str)> {
    match entry.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key, value)),
        _ => bail!("invalid environment entry `{}`, expected KEY=VALUE", entry),
    }
}



/*
    @@@
    @parser();
    . Reads the YAML config file; I/O errors carry the path as context.
    . Deserializes and validates it before anything gets registered.
*/
pub fn parser(path: impl AsRef<Path>) -> anyhow::Result<Config> {
    let path = path.as_ref();
    let yaml_file = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    Config::from_yaml_str(&yaml_file)
}
