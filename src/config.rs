use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::http::connection::ConnectionLimits;
use crate::http::parser::{MAX_HEADERS, MAX_LINE_BYTES, ParseLimits};
use crate::server::monitor::{MIN_SWEEP_INTERVAL, sweep_interval_for};

/// Names the optional YAML file read before the environment.
pub const CONFIG_PATH_ENV: &str = "IDLEGATE_CONFIG";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_addr: String,
    /// Zero disables idle reclamation.
    pub idle_timeout_ms: u64,
    /// Defaults to half the idle timeout.
    pub sweep_interval_ms: Option<u64>,
    /// Handlers allowed to run at once.
    pub worker_threads: usize,
    pub max_line_bytes: usize,
    pub max_headers: usize,
    pub max_body_bytes: u64,
    pub read_chunk_bytes: usize,
    pub max_reads_per_turn: usize,
    pub max_drain_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        let conn = ConnectionLimits::default();
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            idle_timeout_ms: 30_000,
            sweep_interval_ms: None,
            worker_threads: 8,
            max_line_bytes: MAX_LINE_BYTES,
            max_headers: MAX_HEADERS,
            max_body_bytes: conn.max_body_bytes,
            read_chunk_bytes: conn.read_chunk_bytes,
            max_reads_per_turn: conn.max_reads_per_turn,
            max_drain_bytes: conn.max_drain_bytes,
        }
    }
}

impl Config {
    /// Defaults, then the file named by `IDLEGATE_CONFIG`, then `LISTEN`,
    /// `IDLE_TIMEOUT_MS`, `SWEEP_INTERVAL_MS` and `WORKER_THREADS`.
    pub fn load() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = match lookup(CONFIG_PATH_ENV) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };

        if let Some(addr) = lookup("LISTEN") {
            cfg.listen_addr = addr;
        }
        if let Some(ms) = lookup("IDLE_TIMEOUT_MS") {
            cfg.idle_timeout_ms = ms
                .trim()
                .parse()
                .with_context(|| format!("IDLE_TIMEOUT_MS is not a number: {ms:?}"))?;
        }
        if let Some(ms) = lookup("SWEEP_INTERVAL_MS") {
            let ms = ms
                .trim()
                .parse()
                .with_context(|| format!("SWEEP_INTERVAL_MS is not a number: {ms:?}"))?;
            cfg.sweep_interval_ms = Some(ms);
        }
        if let Some(n) = lookup("WORKER_THREADS") {
            cfg.worker_threads = n
                .trim()
                .parse()
                .with_context(|| format!("WORKER_THREADS is not a number: {n:?}"))?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_yaml(raw: &str) -> anyhow::Result<Self> {
        let cfg: Config = serde_yaml::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.worker_threads > 0, "worker_threads must be at least 1");
        anyhow::ensure!(self.read_chunk_bytes > 0, "read_chunk_bytes must be at least 1");
        anyhow::ensure!(self.max_reads_per_turn > 0, "max_reads_per_turn must be at least 1");
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Explicit interval (floored at 10ms), else half the idle timeout.
    pub fn sweep_interval(&self) -> Duration {
        match self.sweep_interval_ms {
            Some(ms) => Duration::from_millis(ms).max(MIN_SWEEP_INTERVAL),
            None => sweep_interval_for(self.idle_timeout()),
        }
    }

    pub fn parse_limits(&self) -> ParseLimits {
        ParseLimits {
            max_line_bytes: self.max_line_bytes,
            max_headers: self.max_headers,
        }
    }

    pub fn connection_limits(&self) -> ConnectionLimits {
        ConnectionLimits {
            read_chunk_bytes: self.read_chunk_bytes,
            max_reads_per_turn: self.max_reads_per_turn,
            max_body_bytes: self.max_body_bytes,
            max_drain_bytes: self.max_drain_bytes,
        }
    }
}
