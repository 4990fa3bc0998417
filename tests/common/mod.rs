#![allow(dead_code)]

use axum::{
    extract::{Path, RawQuery, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use parking_lot::Mutex;
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

/// In-process stand-in for a Consul agent's health endpoint.
pub struct MockRegistry {
    pub addr: SocketAddr,
    hits: AtomicUsize,
    status: StatusCode,
    body: String,
    delay: Duration,
    last_query: Mutex<Option<String>>,
    last_token: Mutex<Option<String>>,
    last_service: Mutex<Option<String>>,
}

impl MockRegistry {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn last_query(&self) -> Option<String> {
        self.last_query.lock().clone()
    }

    pub fn last_token(&self) -> Option<String> {
        self.last_token.lock().clone()
    }

    pub fn last_service(&self) -> Option<String> {
        self.last_service.lock().clone()
    }

    pub fn uri(&self) -> String {
        format!("http://{}", self.addr)
    }
}

async fn health(
    State(state): State<Arc<MockRegistry>>,
    Path(service): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    *state.last_service.lock() = Some(service);
    *state.last_query.lock() = query;
    *state.last_token.lock() = headers
        .get("x-consul-token")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if !state.delay.is_zero() {
        tokio::time::sleep(state.delay).await;
    }
    (
        state.status,
        [
            (header::CONTENT_TYPE, "application/json"),
            (header::HeaderName::from_static("x-consul-index"), "42"),
        ],
        state.body.clone(),
    )
        .into_response()
}

pub async fn spawn_registry(status: StatusCode, body: String, delay: Duration) -> Arc<MockRegistry> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(MockRegistry {
        addr,
        hits: AtomicUsize::new(0),
        status,
        body,
        delay,
        last_query: Mutex::new(None),
        last_token: Mutex::new(None),
        last_service: Mutex::new(None),
    });

    let app = Router::new()
        .route("/v1/health/service/:service", get(health))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    state
}

/// Health payload with one passing entry per `(address, port)`.
pub fn health_body(nodes: &[(&str, u16)]) -> String {
    let entries: Vec<serde_json::Value> = nodes
        .iter()
        .enumerate()
        .map(|(i, (addr, port))| {
            serde_json::json!({
                "Node": { "Node": format!("node-{}", i), "Address": addr },
                "Service": {
                    "ID": format!("web-{}", i),
                    "Service": "web",
                    "Tags": null,
                    "Address": "",
                    "Port": port
                },
                "Checks": [{ "CheckID": "serfHealth", "Status": "passing" }]
            })
        })
        .collect();
    serde_json::Value::Array(entries).to_string()
}

/// The exact payload Consul returns for a single `web` instance on `foo`.
pub const CONSUL_RESPONSE: &str = r#"
[
  {
    "Node":{
      "Node":"foo",
      "Address":"127.0.0.1",
      "TaggedAddresses":{ "wan":"127.0.0.1" },
      "CreateIndex":7,
      "ModifyIndex":375588
    },
    "Service":{
      "ID":"web",
      "Service":"web",
      "Tags":null,
      "Address":"",
      "Port":80,
      "EnableTagOverride":false,
      "CreateIndex":13,
      "ModifyIndex":13
    }
  }
]"#;
