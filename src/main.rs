use anyhow::Context;
use consul_router::{
    balancer::balancer_for,
    http_proxy::{self, GatewayRoute},
    Discovery, GatewayConfig,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // 1) Load the gateway config (first argument, defaults to ./config.yaml).
    let path = std::env::args().nth(1).unwrap_or_else(|| "config.yaml".into());
    let gateway = GatewayConfig::from_file(&path).with_context(|| format!("loading {}", path))?;

    // 2) One discovery engine per route; each starts on its first request.
    let mut routes = Vec::new();
    for route in gateway.routes()? {
        let config = gateway
            .discovery(&route)
            .with_context(|| format!("route {}", route.path))?;
        let discovery = Discovery::with_retrier(config, gateway.retry.retrier());
        if !discovery.is_enabled() {
            log::warn!(
                "no registry servers for '{}', requests on {} pass through",
                discovery.config().service,
                route.path
            );
        }
        routes.push(GatewayRoute {
            path: route.path,
            discovery,
            balancer: balancer_for(&gateway.balancer),
        });
    }
    let engines: Vec<Discovery> = routes.iter().map(|r| r.discovery.clone()).collect();

    // 3) Serve until Ctrl-C, then stop the refresh tasks.
    let server = http_proxy::run_http_gateway(gateway.listen, routes);
    tokio::select! {
        res = server => res.context("HTTP gateway failed")?,
        _ = tokio::signal::ctrl_c() => log::info!("shutting down"),
    }
    for discovery in &engines {
        discovery.shutdown().await;
    }
    Ok(())
}
