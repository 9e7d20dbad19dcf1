use anyhow::Result;
use clap::Parser;
use cli::{serve::serve, show_config::show_config, Commands};
use config::load_config;

use crate::cli::Cli;

pub mod api;
pub mod cli;
pub mod config;
pub mod state;
pub mod tunnel;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let mut cfg = load_config(&cli.config)?;

    match cli.command {
        Commands::Serve(overrides) => {
            overrides.apply(&mut cfg);
            serve(cfg).await
        }
        Commands::ShowConfig(overrides) => {
            overrides.apply(&mut cfg);
            show_config(&cfg)
        }
    }
}

fn init_logging() {
    if cfg!(debug_assertions) {
        std::env::set_var("RUST_LOG", "debug");
    } else if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }

    env_logger::init();
}
