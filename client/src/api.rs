use anyhow::{bail, Result};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use crate::config::Configuration;

#[derive(Deserialize, Debug)]
pub struct TunnelResponse {
    pub id: String,
    pub port: u16,
    pub url: String,
    pub max_conn_count: usize,
}

#[derive(Deserialize)]
struct StatusResponse {
    status: String,
}

pub async fn create_tunnel(cfg: &Configuration) -> Result<TunnelResponse> {
    let url = format!("{}/api/v1/tunnel", cfg.edge);

    let response = Client::new()
        .post(&url)
        .json(&json!({ "name": cfg.name }))
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status();
        let reason = response
            .json::<StatusResponse>()
            .await
            .map_or_else(|_| status.to_string(), |r| r.status);
        bail!("edge refused tunnel: {reason}");
    }

    Ok(response.json().await?)
}

pub async fn delete_tunnel(cfg: &Configuration, id: &str) -> Result<()> {
    let url = format!("{}/api/v1/tunnel/{id}", cfg.edge);

    Client::new()
        .delete(&url)
        .send()
        .await?
        .error_for_status()?;

    Ok(())
}
