use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::{Configuration, CONFIG_PATH};

pub mod serve;
pub mod show_config;

#[derive(Parser, Debug)]
#[command(name = "burrow-edge")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Expose local HTTP services through per-tunnel ports and public subdomains")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, global = true, default_value = CONFIG_PATH)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the edge server and accept tunnel registrations
    Serve(Overrides),
    /// Print the effective configuration after applying overrides
    ShowConfig(Overrides),
}

#[derive(Args, Debug, Default)]
pub struct Overrides {
    /// Minimal port to allocate tunnel listeners on
    #[arg(long)]
    pub min_port: Option<u16>,
    /// Max port (exclusive) to allocate tunnel listeners on
    #[arg(long)]
    pub max_port: Option<u16>,
    /// Domain override for tunnel URLs
    #[arg(long)]
    pub domain: Option<String>,
    /// Port for the API to listen on
    #[arg(long)]
    pub listen_port: Option<u16>,
}

impl Overrides {
    pub fn apply(self, cfg: &mut Configuration) {
        if let Some(min_port) = self.min_port {
            cfg.tunnel.min_port = min_port;
        }
        if let Some(max_port) = self.max_port {
            cfg.tunnel.max_port = max_port;
        }
        if let Some(domain) = self.domain {
            cfg.tunnel.base_domain = domain;
        }
        if let Some(listen_port) = self.listen_port {
            cfg.listen_port = listen_port;
        }
    }
}
