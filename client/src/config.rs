use std::{
    fs::read_to_string,
    net::{SocketAddr, ToSocketAddrs},
};

use anyhow::{anyhow, Result};
use log::info;
use serde::{Deserialize, Serialize};
use toml::from_str;

const CONFIG_PATH: &str = if cfg!(debug_assertions) {
    "client/config.toml"
} else {
    "config.toml"
};

#[derive(Deserialize, Serialize, Debug)]
pub struct Configuration {
    /// Base URL of the edge API, e.g. `http://tunnels.example.com:3000`
    pub edge: String,
    /// Host the per-tunnel ports are dialled on.
    pub edge_ip: String,
    /// Requested subdomain; the edge picks one when absent or taken.
    pub name: Option<String>,
    /// Local service requests are forwarded to.
    pub target: String,
    #[serde(default = "default_idle_workers")]
    pub idle_workers: usize,
}

fn default_idle_workers() -> usize {
    4
}

pub fn load_config() -> Result<Configuration> {
    let file = read_to_string(CONFIG_PATH)?;
    parse_config(&file)
}

fn parse_config(file: &str) -> Result<Configuration> {
    let mut config: Configuration = from_str(file)?;

    // we have to resolve the target to an IP address
    let target = match config.target.parse::<SocketAddr>() {
        Ok(target) => target,
        Err(_) => {
            let resolved = config
                .target
                .to_socket_addrs()
                .map_err(|e| anyhow!("unable to resolve target {}: {e}", config.target))?
                .collect::<Vec<SocketAddr>>();

            let target = resolved
                .iter()
                .find(|&addr| addr.is_ipv4())
                .or_else(|| resolved.first())
                .ok_or_else(|| anyhow!("unable to resolve target {}", config.target))?;

            info!("resolved target {} to {}", config.target, target);
            *target
        }
    };

    config.target = target.to_string();

    Ok(config)
}
