// src/http_proxy.rs
use crate::{balancer::Balancer, discovery::Discovery, middleware::DiscoveryLayer};
use axum::{
    body::{to_bytes, Body},
    http::{header, Request, Response, StatusCode},
    Router,
};
use reqwest::Client;
use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Duration};
use tower::{service_fn, Layer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};

/// Largest request body forwarded upstream.
const MAX_BODY: usize = 1024 * 1024;

/// Shared reqwest client
pub fn make_client() -> Client {
    Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_default()
}

fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    let mut resp = Response::new(Body::from(message.to_string()));
    *resp.status_mut() = status;
    resp
}

/// Final handler: sends the request to whatever absolute URI the discovery
/// layer rewrote it to.
pub async fn forward_request(req: Request<Body>, client: Client) -> Response<Body> {
    let (parts, body) = req.into_parts();
    if parts.uri.authority().is_none() {
        return error_response(StatusCode::BAD_GATEWAY, "No upstream target");
    }

    let bytes = match to_bytes(body, MAX_BODY).await {
        Ok(bytes) => bytes,
        Err(_) => return error_response(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large"),
    };

    let url = parts.uri.to_string();
    let result = client
        .request(parts.method, &url)
        .headers(parts.headers)
        .body(bytes)
        .send()
        .await;

    match result {
        Ok(res) => {
            let mut resp = Response::new(Body::empty());
            *resp.status_mut() = res.status();
            *resp.headers_mut() = res.headers().clone();
            // Body is buffered below, so the upstream framing no longer applies.
            resp.headers_mut().remove(header::TRANSFER_ENCODING);
            resp.headers_mut().remove(header::CONNECTION);
            match res.bytes().await {
                Ok(body) => {
                    *resp.body_mut() = Body::from(body);
                    resp
                }
                Err(e) => {
                    log::warn!("failed reading upstream body from {}: {}", url, e);
                    error_response(StatusCode::BAD_GATEWAY, "Bad gateway")
                }
            }
        }
        Err(e) => {
            log::warn!("upstream {} failed: {}", url, e);
            error_response(StatusCode::BAD_GATEWAY, "Bad gateway")
        }
    }
}

/// One discovered service mounted on a path prefix.
#[derive(Clone)]
pub struct GatewayRoute {
    pub path: String,
    pub discovery: Discovery,
    pub balancer: Option<Arc<dyn Balancer>>,
}

/// Router sending each route's requests to a node discovered for its service.
/// A `/` route catches everything no other prefix matches. Prefixes are not
/// stripped before forwarding.
pub fn gateway_app(routes: Vec<GatewayRoute>, client: Client) -> Router {
    let trace = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().include_headers(true))
        .on_response(DefaultOnResponse::new());

    let mut router = Router::new();
    for route in routes {
        let client = client.clone();
        let forward = service_fn(move |req: Request<Body>| {
            let client = client.clone();
            async move { Ok::<_, Infallible>(forward_request(req, client).await) }
        });
        let svc = DiscoveryLayer::new(route.discovery.clone())
            .with_shared_balancer(route.balancer)
            .layer(forward);

        log::info!("routing {} to service '{}'", route.path, route.discovery.config().service);
        let prefix = route.path.trim_end_matches('/');
        router = if prefix.is_empty() {
            router.fallback_service(svc)
        } else {
            router
                .route_service(prefix, svc.clone())
                .route_service(&format!("{}/*rest", prefix), svc)
        };
    }
    router.layer(trace)
}

/// Run HTTP proxy
pub async fn run_http_gateway(listen_addr: SocketAddr, routes: Vec<GatewayRoute>) -> std::io::Result<()> {
    let app = gateway_app(routes, make_client());
    log::info!("HTTP proxy on http://{}", listen_addr);
    axum_server::bind(listen_addr).serve(app.into_make_service()).await
}
