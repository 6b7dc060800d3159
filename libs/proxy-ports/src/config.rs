//! Proxy port manager configuration.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

/// Configuration for the proxy port manager (env-driven).
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Lower bound of the allocatable port range (inclusive).
    pub min_port: u16,

    /// Upper bound of the allocatable port range (exclusive).
    pub max_port: u16,

    /// Directory holding the proxy ports checkpoint file.
    pub state_dir: PathBuf,

    /// Checkpoints older than this are ignored on restore.
    pub restore_age_limit: Duration,

    /// Minimum interval between two checkpoint writes.
    pub checkpoint_min_interval: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            min_port: 10000,
            max_port: 20000,
            state_dir: PathBuf::from("/var/run/npa"),
            restore_age_limit: Duration::from_secs(15 * 60),
            checkpoint_min_interval: Duration::from_secs(10),
        }
    }
}

impl ProxyConfig {
    /// Load configuration from environment variables, falling back to
    /// the defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let min_port: u16 = std::env::var("NPA_PROXY_PORT_MIN")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("NPA_PROXY_PORT_MIN must be a port number.")?
            .unwrap_or(defaults.min_port);

        let max_port: u16 = std::env::var("NPA_PROXY_PORT_MAX")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("NPA_PROXY_PORT_MAX must be a port number.")?
            .unwrap_or(defaults.max_port);

        anyhow::ensure!(
            min_port < max_port,
            "Proxy port range is empty: [{min_port}, {max_port})"
        );

        let state_dir = std::env::var("NPA_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.state_dir);

        let restore_age_limit_secs: u64 = std::env::var("NPA_RESTORED_PROXY_PORTS_AGE_LIMIT_SECS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("NPA_RESTORED_PROXY_PORTS_AGE_LIMIT_SECS must be an integer (seconds).")?
            .unwrap_or(defaults.restore_age_limit.as_secs());

        let checkpoint_min_interval_ms: u64 = std::env::var("NPA_PROXY_PORTS_CHECKPOINT_MIN_INTERVAL_MS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("NPA_PROXY_PORTS_CHECKPOINT_MIN_INTERVAL_MS must be an integer (milliseconds).")?
            .unwrap_or(defaults.checkpoint_min_interval.as_millis() as u64);

        Ok(Self {
            min_port,
            max_port,
            state_dir,
            restore_age_limit: Duration::from_secs(restore_age_limit_secs),
            checkpoint_min_interval: Duration::from_millis(checkpoint_min_interval_ms),
        })
    }
}
