use actix_web::{
    get,
    web::{Data, Json},
    Responder, Result,
};
use serde::Serialize;
use serde_json::json;

use crate::{state::State, tunnel::ConnectionStats};

pub mod tunnel;
pub mod wire;

#[derive(Serialize)]
pub struct StatsResponse {
    proxies_running: usize,
    stats: Vec<ConnectionStats>,
}

#[get("/api/v1/health")]
pub async fn health() -> Result<impl Responder> {
    Ok(Json(json!({"status": "ok"})))
}

#[get("/api/v1/admin/stats")]
pub async fn stats(data: Data<State>) -> Result<impl Responder> {
    let stats = data.manager.connections_stats().await;

    Ok(Json(StatsResponse {
        proxies_running: stats.len(),
        stats,
    }))
}
