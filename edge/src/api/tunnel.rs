use std::collections::HashMap;

use actix_web::{
    delete,
    error::{
        ErrorBadGateway, ErrorBadRequest, ErrorGatewayTimeout, ErrorInternalServerError,
        ErrorNotFound, ErrorTooManyRequests,
    },
    http::Method,
    post,
    web::{Bytes, Data, Json, Path, Query},
    HttpRequest, HttpResponse, Responder, Result,
};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    api::wire,
    state::State,
    tunnel::{
        error::TunnelError,
        instance::{TunnelInstance, TunnelState},
        name,
        origin::OriginMeta,
    },
};

#[derive(Deserialize, Default)]
pub struct CreateRequestData {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct TunnelResponse {
    pub id: String,
    pub port: u16,
    pub url: String,
    pub max_conn_count: usize,
}

impl From<&TunnelInstance> for TunnelResponse {
    fn from(tunnel: &TunnelInstance) -> Self {
        Self {
            id: tunnel.id().to_string(),
            port: tunnel.port(),
            url: tunnel.url(),
            max_conn_count: tunnel.max_conns(),
        }
    }
}

#[post("/api/v1/tunnel")]
pub async fn create_tunnel(
    req: HttpRequest,
    data: Data<State>,
    body: Bytes,
) -> Result<HttpResponse> {
    let form = if body.is_empty() {
        CreateRequestData::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| {
            error!("create tunnel: failed to parse input json: {e}");
            ErrorBadRequest(Json(json!({"status": "invalid request body"})))
        })?
    };

    create(&req, &data, form.name.as_deref()).await
}

#[delete("/api/v1/tunnel/{id}")]
pub async fn delete_tunnel(
    req: HttpRequest,
    data: Data<State>,
    id: Path<String>,
) -> Result<impl Responder> {
    // a tunnel owned by someone else is indistinguishable from a missing one
    let not_found = || ErrorNotFound(Json(json!({"status": "not found"})));

    let tunnel = data.manager.get(&id).await.ok_or_else(not_found)?;

    let is_creator = req
        .peer_addr()
        .map_or(false, |addr| tunnel.origin().allows(addr.ip()));
    if !is_creator {
        warn!("refusing to delete tunnel {id} for {:?}", req.peer_addr());
        return Err(not_found());
    }

    if tunnel.state() == TunnelState::Listening {
        info!("tunnel {id} close requested by its creator");
    }
    tunnel.request_close();

    Ok(Json(json!({})))
}

/// Catch-all for every other route: `GET ?new=<name>` creates a tunnel, any
/// other request is relayed to the tunnel named by the Host subdomain.
pub async fn try_proxy(req: HttpRequest, data: Data<State>, body: Bytes) -> Result<HttpResponse> {
    if req.method() == Method::GET {
        if let Ok(query) = Query::<HashMap<String, String>>::from_query(req.query_string()) {
            if let Some(name) = query.get("new") {
                return create(&req, &data, Some(name.as_str())).await;
            }
        }
    }

    proxy(&req, &data, &body).await
}

async fn create(req: &HttpRequest, state: &State, name: Option<&str>) -> Result<HttpResponse> {
    match state.manager.create_unique(name, origin_of(req)).await {
        Ok(tunnel) => Ok(HttpResponse::Ok().json(TunnelResponse::from(tunnel.as_ref()))),

        Err(TunnelError::CapacityExceeded { limit }) => {
            warn!("refusing tunnel creation, {limit} tunnels already running");
            Err(ErrorTooManyRequests(Json(
                json!({"status": "too many tunnels"}),
            )))
        }

        Err(e) => {
            error!("failed to create tunnel: {e}");
            Err(ErrorInternalServerError(Json(
                json!({"status": "failed to create tunnel"}),
            )))
        }
    }
}

async fn proxy(req: &HttpRequest, state: &State, body: &[u8]) -> Result<HttpResponse> {
    let id = name::from_host(req.connection_info().host()).to_ascii_lowercase();

    let tunnel = state
        .manager
        .get(&id)
        .await
        .ok_or_else(|| ErrorNotFound("not found"))?;

    let request = wire::dump_request(req, body);

    let raw = tunnel.proxy(&request).await.map_err(|e| match e {
        TunnelError::NoAvailableConnection => {
            warn!("tunnel {id}: {e}");
            ErrorGatewayTimeout("no tunnel connection available")
        }
        e => {
            error!("tunnel {id}: failed to proxy request: {e}");
            ErrorBadGateway("failed to proxy request")
        }
    })?;

    let response = wire::parse_response(&raw).map_err(|e| {
        error!("tunnel {id}: invalid response from client: {e}");
        ErrorBadGateway("invalid response from tunnel")
    })?;

    Ok(response.into_http_response())
}

fn origin_of(req: &HttpRequest) -> OriginMeta {
    let info = req.connection_info();
    OriginMeta::new(
        info.scheme(),
        info.host(),
        req.peer_addr().map(|addr| addr.ip()),
    )
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, time::Duration};

    use actix_web::{
        http::StatusCode,
        test::{self, TestRequest},
        web, App,
    };
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
        sync::oneshot,
        time::sleep,
    };

    use super::*;
    use crate::{
        api,
        config::TunnelConfig,
        tunnel::{free_port_range, TunnelManager},
    };

    const CREATOR: &str = "127.0.0.1:40000";
    const STRANGER: &str = "192.0.2.10:40000";

    async fn state(len: u16) -> Data<State> {
        let (min_port, max_port) = free_port_range(len).await;
        Data::new(State {
            manager: TunnelManager::new(TunnelConfig {
                min_port,
                max_port,
                ..Default::default()
            }),
        })
    }

    macro_rules! app {
        ($data:expr) => {
            test::init_service(
                App::new()
                    .app_data($data.clone())
                    .service(api::stats)
                    .service(create_tunnel)
                    .service(delete_tunnel)
                    .default_service(web::to(try_proxy)),
            )
            .await
        };
    }

    fn peer(addr: &str) -> SocketAddr {
        addr.parse().unwrap()
    }

    fn create_request(body: &str) -> TestRequest {
        TestRequest::post()
            .uri("/api/v1/tunnel")
            .peer_addr(peer(CREATOR))
            .insert_header(("host", "tunnels.test:3000"))
            .set_payload(body.to_string())
    }

    /// Plays the tunnel client for one request: hands the raw request back
    /// through `seen` and answers with `response`.
    async fn serve_once(port: u16, response: &'static [u8]) -> oneshot::Receiver<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

        tokio::spawn(async move {
            let mut request = vec![];
            let mut buf = [0; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                request.extend_from_slice(&buf[..n]);
            }

            stream.write_all(response).await.unwrap();
            let _ = tx.send(request);

            // hold the socket until the edge closes it
            let _ = stream.read(&mut buf).await;
        });

        rx
    }

    async fn wait_for_connections(data: &Data<State>, id: &str, n: usize) {
        let tunnel = data.manager.get(id).await.unwrap();
        for _ in 0..100 {
            if tunnel.connections() == n {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("tunnel {id} never reached {n} connections");
    }

    #[actix_web::test]
    async fn creates_named_tunnel() {
        let data = state(4).await;
        let app = app!(data);

        let resp: TunnelResponse =
            test::call_and_read_body_json(&app, create_request(r#"{"name": "demo"}"#).to_request())
                .await;

        assert_eq!(resp.id, "demo");
        assert_eq!(resp.url, "http://demo.tunnels.test");
        assert_eq!(resp.max_conn_count, 10);

        let cfg = data.manager.config();
        assert!((cfg.min_port..cfg.max_port).contains(&resp.port));
        assert!(data.manager.exists("demo").await);
    }

    #[actix_web::test]
    async fn empty_body_gets_random_name() {
        let data = state(4).await;
        let app = app!(data);

        let resp: TunnelResponse =
            test::call_and_read_body_json(&app, create_request("").to_request()).await;

        assert_eq!(resp.id.len(), 10);
        assert!(resp.id.bytes().all(|c| c.is_ascii_lowercase()));
    }

    #[actix_web::test]
    async fn malformed_body_is_rejected() {
        let data = state(4).await;
        let app = app!(data);

        let resp = test::call_service(&app, create_request("{name").to_request()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(data.manager.running().await, 0);
    }

    #[actix_web::test]
    async fn full_registry_answers_too_many_requests() {
        let data = state(1).await;
        let app = app!(data);

        let first = test::call_service(&app, create_request("").to_request()).await;
        assert!(first.status().is_success());

        let second = test::call_service(&app, create_request("").to_request()).await;
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(data.manager.running().await, 1);
    }

    #[actix_web::test]
    async fn get_with_new_query_creates_tunnel() {
        let data = state(4).await;
        let app = app!(data);

        let req = TestRequest::get()
            .uri("/?new=web")
            .peer_addr(peer(CREATOR))
            .insert_header(("host", "tunnels.test"))
            .to_request();
        let resp: TunnelResponse = test::call_and_read_body_json(&app, req).await;

        assert_eq!(resp.id, "web");
        assert_eq!(resp.url, "http://web.tunnels.test");
    }

    #[actix_web::test]
    async fn relays_request_through_tunnel() {
        let data = state(4).await;
        let app = app!(data);

        let tunnel: TunnelResponse =
            test::call_and_read_body_json(&app, create_request(r#"{"name": "demo"}"#).to_request())
                .await;

        let seen = serve_once(
            tunnel.port,
            b"HTTP/1.1 201 Created\r\nX-From: client\r\nContent-Length: 5\r\n\r\nhello",
        )
        .await;
        wait_for_connections(&data, "demo", 1).await;

        let req = TestRequest::post()
            .uri("/items?page=2")
            .insert_header(("host", "demo.tunnels.test"))
            .set_payload("payload")
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(resp.headers().get("x-from").unwrap(), "client");
        assert_eq!(&test::read_body(resp).await[..], b"hello");

        let request = String::from_utf8(seen.await.unwrap()).unwrap();
        assert!(request.starts_with("POST /items?page=2 HTTP/1.1\r\n"));
    }

    #[actix_web::test]
    async fn unknown_tunnel_is_not_found() {
        let data = state(4).await;
        let app = app!(data);

        let req = TestRequest::get()
            .uri("/")
            .insert_header(("host", "missing.tunnels.test"))
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn tunnel_without_sockets_times_out() {
        let data = state(4).await;
        let app = app!(data);

        test::call_service(&app, create_request(r#"{"name": "lonely"}"#).to_request()).await;

        let req = TestRequest::get()
            .uri("/")
            .insert_header(("host", "lonely.tunnels.test"))
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[actix_web::test]
    async fn only_creator_can_delete() {
        let data = state(4).await;
        let app = app!(data);

        test::call_service(&app, create_request(r#"{"name": "mine"}"#).to_request()).await;
        let tunnel = data.manager.get("mine").await.unwrap();
        let closed = tunnel.subscribe_on_close();

        let req = TestRequest::delete()
            .uri("/api/v1/tunnel/mine")
            .peer_addr(peer(STRANGER))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(tunnel.state(), TunnelState::Listening);

        let req = TestRequest::delete()
            .uri("/api/v1/tunnel/mine")
            .peer_addr(peer(CREATOR))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(&test::read_body(resp).await[..], b"{}");

        closed.await.unwrap();
        assert_eq!(tunnel.state(), TunnelState::Closed);
    }

    #[actix_web::test]
    async fn stats_list_every_tunnel() {
        let data = state(4).await;
        let app = app!(data);

        test::call_service(&app, create_request(r#"{"name": "one"}"#).to_request()).await;
        test::call_service(&app, create_request(r#"{"name": "two"}"#).to_request()).await;

        let req = TestRequest::get().uri("/api/v1/admin/stats").to_request();
        let stats: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(stats["proxies_running"], 2);
        assert_eq!(stats["stats"].as_array().unwrap().len(), 2);
        assert_eq!(stats["stats"][0]["connections"], 0);
    }
}
