use std::{fs::read_to_string, io::ErrorKind, path::Path, time::Duration};

use anyhow::{bail, Result};
use log::info;
use serde::{Deserialize, Serialize};
use toml::from_str;

pub const CONFIG_PATH: &str = if cfg!(debug_assertions) {
    "edge/config.toml"
} else {
    "config.toml"
};

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct Configuration {
    pub listen_port: u16,
    pub tunnel: TunnelConfig,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            listen_port: 3000,
            tunnel: TunnelConfig::default(),
        }
    }
}

/// Process-wide tunnel settings, shared read-only by every tunnel.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct TunnelConfig {
    /// Lower bound (inclusive) for dynamically allocated tunnel ports.
    pub min_port: u16,
    /// Upper bound (exclusive). `max_port - min_port` is the tunnel capacity.
    pub max_port: u16,
    /// Overrides the origin host when building public URLs.
    pub base_domain: String,
    pub max_conns_per_client: usize,
    pub inactive_hours_timeout: u64,
    pub no_active_sockets_minutes_timeout: u64,
    pub no_active_sockets_checks: u32,
    /// When set, a non-empty pool observation resets the idle counter.
    pub reset_idle_checks_on_activity: bool,
    pub proxy_io_timeout_ms: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            min_port: 30000,
            max_port: 30100,
            base_domain: String::new(),
            max_conns_per_client: 10,
            inactive_hours_timeout: 12,
            no_active_sockets_minutes_timeout: 10,
            no_active_sockets_checks: 6,
            reset_idle_checks_on_activity: false,
            proxy_io_timeout_ms: 100,
        }
    }
}

impl TunnelConfig {
    pub fn max_clients(&self) -> usize {
        usize::from(self.max_port.saturating_sub(self.min_port))
    }

    pub fn inactive_timeout(&self) -> Duration {
        Duration::from_secs(self.inactive_hours_timeout.saturating_mul(60 * 60))
    }

    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_secs(self.no_active_sockets_minutes_timeout.saturating_mul(60))
    }

    pub fn proxy_io_timeout(&self) -> Duration {
        Duration::from_millis(self.proxy_io_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_port >= self.max_port {
            bail!(
                "min_port ({}) must be lower than max_port ({})",
                self.min_port,
                self.max_port
            );
        }

        if self.max_conns_per_client == 0 {
            bail!("max_conns_per_client must be at least 1");
        }

        if self.no_active_sockets_checks == 0 {
            bail!("no_active_sockets_checks must be at least 1");
        }

        if self.no_active_sockets_minutes_timeout == 0 {
            bail!("no_active_sockets_minutes_timeout must be at least 1");
        }

        Ok(())
    }
}

/// Loads the configuration file, falling back to defaults when it does not exist.
pub fn load_config(path: &Path) -> Result<Configuration> {
    match read_to_string(path) {
        Ok(file) => {
            let config: Configuration = from_str(&file)?;
            Ok(config)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            info!("no config at {}, using defaults", path.display());
            Ok(Configuration::default())
        }
        Err(e) => Err(e.into()),
    }
}
