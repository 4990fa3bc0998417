// src/middleware.rs

use crate::balancer::{Balancer, BalancerError, RoundRobin};
use crate::discovery::Discovery;
use axum::body::Body;
use futures_core::future::BoxFuture;
use http::{
    header::HOST,
    uri::{Authority, PathAndQuery, Scheme},
    HeaderValue, Request, Response, StatusCode, Uri,
};
use std::{
    sync::Arc,
    task::{Context, Poll},
};
use tower::{Layer, Service};

/// Routes every request to a node discovered for the configured service.
///
/// - discovery disabled (no registry endpoints): request passes through untouched
/// - no nodes within the wait ceiling: `502 Bad Gateway`, inner service not called
/// - balancer error: request passes through untouched
/// - otherwise: URI authority and `Host` header are rewritten to the chosen node
#[derive(Clone)]
pub struct DiscoveryLayer {
    discovery: Discovery,
    balancer: Option<Arc<dyn Balancer>>,
}

impl DiscoveryLayer {
    /// Layer balancing round-robin across the discovered nodes.
    pub fn new(discovery: Discovery) -> Self {
        DiscoveryLayer {
            discovery,
            balancer: Some(Arc::new(RoundRobin::new())),
        }
    }

    pub fn with_balancer<B: Balancer + 'static>(mut self, balancer: B) -> Self {
        self.balancer = Some(Arc::new(balancer));
        self
    }

    pub fn with_shared_balancer(mut self, balancer: Option<Arc<dyn Balancer>>) -> Self {
        self.balancer = balancer;
        self
    }

    /// Without a balancer the first discovered node is always used.
    pub fn without_balancer(mut self) -> Self {
        self.balancer = None;
        self
    }
}

impl<S> Layer<S> for DiscoveryLayer {
    type Service = DiscoveryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        DiscoveryService {
            inner,
            discovery: self.discovery.clone(),
            balancer: self.balancer.clone(),
        }
    }
}

#[derive(Clone)]
pub struct DiscoveryService<S> {
    inner: S,
    discovery: Discovery,
    balancer: Option<Arc<dyn Balancer>>,
}

impl<S, B> Service<Request<B>> for DiscoveryService<S>
where
    S: Service<Request<B>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        // Keep the service that was driven to readiness for this call.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let discovery = self.discovery.clone();
        let balancer = self.balancer.clone();

        Box::pin(async move {
            if !discovery.is_enabled() {
                return inner.call(req).await;
            }

            let nodes = match discovery.get_nodes().await {
                Ok(nodes) => nodes,
                Err(e) => {
                    log::warn!("no upstream for {}: {}", req.uri(), e);
                    return Ok(bad_gateway(e.to_string()));
                }
            };

            let target = match select_target(balancer.as_deref(), &nodes) {
                Ok(target) => target,
                Err(e) => {
                    log::warn!("balancer failed, passing {} through: {}", req.uri(), e);
                    return inner.call(req).await;
                }
            };

            if let Err(e) = rewrite_target(&mut req, &target) {
                log::warn!("cannot route {} to '{}': {}", req.uri(), target, e);
            }
            inner.call(req).await
        })
    }
}

fn select_target(balancer: Option<&dyn Balancer>, nodes: &[String]) -> Result<String, BalancerError> {
    match balancer {
        Some(balancer) => balancer.balance(nodes),
        None => nodes.first().cloned().ok_or(BalancerError::Empty),
    }
}

/// Point the request at `target` (`host:port`). The request is left as is on error.
fn rewrite_target<B>(req: &mut Request<B>, target: &str) -> Result<(), http::Error> {
    let authority: Authority = target.parse()?;
    let host = HeaderValue::from_str(target)?;

    let mut parts = req.uri().clone().into_parts();
    parts.scheme = Some(parts.scheme.unwrap_or(Scheme::HTTP));
    parts.authority = Some(authority);
    if parts.path_and_query.is_none() {
        parts.path_and_query = Some(PathAndQuery::from_static("/"));
    }
    let uri = Uri::from_parts(parts)?;

    *req.uri_mut() = uri;
    req.headers_mut().insert(HOST, host);
    Ok(())
}

fn bad_gateway(message: String) -> Response<Body> {
    let mut resp = Response::new(Body::from(message));
    *resp.status_mut() = StatusCode::BAD_GATEWAY;
    resp
}
