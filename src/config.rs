use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::constants;

#[derive(Debug, Deserialize, Default)]
pub struct Bootstrap {
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub logger: Logger,
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub cache: Cache,
    #[serde(default)]
    pub upstream: Upstream,
}

impl Bootstrap {
    pub fn validate(&self) -> Result<()> {
        if self.cache.dir.as_os_str().is_empty() {
            return Err(anyhow!("cache.dir is required"));
        }
        if !(0.0..=1.0).contains(&self.cache.no_cache_barrier) {
            return Err(anyhow!("cache.no_cache_barrier must be within [0, 1]"));
        }
        if self.server.workers == 0 {
            return Err(anyhow!("server.workers must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct Logger {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub caller: bool,
    #[serde(default)]
    pub traceid: bool,
    #[serde(default)]
    pub max_size: u64,
    #[serde(default)]
    pub max_backups: u64,
    #[serde(default)]
    pub nopid: bool,
}

#[derive(Debug, Deserialize)]
pub struct Server {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_ping_attempts")]
    pub ping_attempts: u32,
    #[serde(default = "default_ping_timeout", with = "humantime_serde")]
    pub ping_timeout: Duration,
    #[serde(default)]
    pub access_log: Option<ServerAccessLog>,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            ping_attempts: default_ping_attempts(),
            ping_timeout: default_ping_timeout(),
            access_log: None,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct ServerAccessLog {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct Cache {
    #[serde(default)]
    pub dir: PathBuf,
    #[serde(default = "default_max_size")]
    pub max_size: u64,
    #[serde(default)]
    pub max_files: usize,
    #[serde(default = "default_no_cache_barrier")]
    pub no_cache_barrier: f64,
    #[serde(default)]
    pub index_path: Option<PathBuf>,
}

impl Default for Cache {
    fn default() -> Self {
        Self {
            dir: PathBuf::new(),
            max_size: default_max_size(),
            max_files: 0,
            no_cache_barrier: default_no_cache_barrier(),
            index_path: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Upstream {
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub insecure_skip_verify: bool,
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// `http://host:port` proxy for origin traffic.
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub no_proxy: String,
}

impl Default for Upstream {
    fn default() -> Self {
        Self {
            headers: HashMap::new(),
            insecure_skip_verify: false,
            connect_timeout: default_connect_timeout(),
            proxy: None,
            no_proxy: String::new(),
        }
    }
}

fn default_workers() -> usize {
    constants::DEFAULT_WORKERS
}

fn default_ping_attempts() -> u32 {
    constants::DEFAULT_PING_ATTEMPTS
}

fn default_ping_timeout() -> Duration {
    Duration::from_millis(constants::DEFAULT_PING_TIMEOUT_MS)
}

fn default_max_size() -> u64 {
    constants::DEFAULT_MAX_CACHE_SIZE
}

fn default_no_cache_barrier() -> f64 {
    constants::DEFAULT_NO_CACHE_BARRIER
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(constants::DEFAULT_CONNECT_TIMEOUT_SECS)
}

/// Parses the YAML file at `path`, returning the config and any unknown keys.
pub fn load(path: &Path) -> Result<(Bootstrap, Vec<String>)> {
    let raw = fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    parse(&raw).with_context(|| format!("parse config {}", path.display()))
}

pub fn parse(raw: &str) -> Result<(Bootstrap, Vec<String>)> {
    let mut ignored = Vec::new();
    let de = serde_yaml::Deserializer::from_str(raw);
    let cfg: Bootstrap = serde_ignored::deserialize(de, |path| {
        ignored.push(path.to_string());
    })?;
    if cfg.strict && !ignored.is_empty() {
        return Err(anyhow!("unknown config fields: {}", ignored.join(", ")));
    }
    Ok((cfg, ignored))
}
