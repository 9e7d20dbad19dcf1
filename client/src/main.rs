use anyhow::Result;
use config::load_config;
use log::{info, warn};
use tokio::{signal::ctrl_c, sync::oneshot::channel};

pub mod api;
pub mod config;
pub mod worker;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cfg = load_config()?;

    info!("contacting edge server at {}...", cfg.edge);

    let tunnel = api::create_tunnel(&cfg).await?;
    let workers = cfg.idle_workers.min(tunnel.max_conn_count);

    info!(
        "tunnel {} created: {} -> {} ({} workers on port {})",
        tunnel.id, tunnel.url, cfg.target, workers, tunnel.port
    );

    let (tx, rx) = channel();
    worker::start_workers(&cfg.edge_ip, tunnel.port, &cfg.target, workers, rx);

    ctrl_c().await?;

    info!("shutting down...");

    let _ = tx.send(());
    if let Err(e) = api::delete_tunnel(&cfg, &tunnel.id).await {
        warn!("failed to delete tunnel {}: {e}", tunnel.id);
    }

    Ok(())
}

fn init_logging() {
    if cfg!(debug_assertions) {
        std::env::set_var("RUST_LOG", "debug");
    } else if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }

    env_logger::init();
}
