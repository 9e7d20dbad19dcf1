use std::time::Duration;

use actix_web::{http::KeepAlive, middleware::Logger, web, App, HttpServer};
use anyhow::Result;
use log::info;

use crate::{api, config::Configuration, state::State, tunnel::TunnelManager};

/// Largest request body relayed through a tunnel.
const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

pub async fn serve(cfg: Configuration) -> Result<()> {
    cfg.tunnel.validate()?;

    let manager = TunnelManager::new(cfg.tunnel.clone());
    let tunnels = manager.config();

    info!(
        "booting with tunnel ports {}-{} ({} tunnels max, {} connections each)...",
        tunnels.min_port,
        tunnels.max_port,
        tunnels.max_clients(),
        tunnels.max_conns_per_client
    );
    let state = web::Data::new(State {
        manager: manager.clone(),
    });

    info!("starting api: [::]:{}", cfg.listen_port);

    HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .app_data(state.clone())
            .app_data(web::PayloadConfig::new(MAX_PAYLOAD))
            .service(api::health)
            .service(api::stats)
            .service(api::tunnel::create_tunnel)
            .service(api::tunnel::delete_tunnel)
            .default_service(web::to(api::tunnel::try_proxy))
    })
    .keep_alive(KeepAlive::Timeout(Duration::from_secs(900)))
    .bind(("0.0.0.0", cfg.listen_port))?
    .run()
    .await?;

    info!("shutting down, closing {} tunnels...", manager.running().await);
    manager.close_all().await;

    Ok(())
}
