// src/registry_client.rs
//! Consul health API client. One instance talks to exactly one registry endpoint.

use crate::config::ServiceEndpoint;
use async_trait::async_trait;
use reqwest::{header::HeaderMap, Client};
use serde::Deserialize;
use std::{collections::HashMap, time::Duration};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("registry returned error: {status} - {message}")]
    Status { status: u16, message: String },

    #[error("malformed registry response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Catalog node a service instance runs on.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Node {
    #[serde(default)]
    pub node: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub datacenter: String,
}

/// Service definition as registered on the node.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentService {
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub port: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HealthCheck {
    #[serde(rename = "CheckID", default)]
    pub check_id: String,
    #[serde(default)]
    pub status: String,
}

/// One entry of `/v1/health/service/:service`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeRecord {
    pub node: Node,
    pub service: AgentService,
    #[serde(default)]
    pub checks: Vec<HealthCheck>,
}

impl NodeRecord {
    /// True when every attached check reports `passing`.
    pub fn is_passing(&self) -> bool {
        self.checks.iter().all(|c| c.status == "passing")
    }
}

/// Per-query knobs forwarded to the health endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    pub datacenter: Option<String>,
    pub token: Option<String>,
    pub allow_stale: bool,
    pub require_consistent: bool,
    pub wait_index: Option<u64>,
    #[serde(skip)]
    pub wait_time: Option<Duration>,
    pub near: Option<String>,
    pub node_meta: HashMap<String, String>,
}

/// Metadata Consul attaches to blocking-query responses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryMeta {
    pub last_index: u64,
    pub known_leader: bool,
    pub last_contact: Duration,
}

impl QueryMeta {
    fn from_headers(headers: &HeaderMap) -> Self {
        let get = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
        QueryMeta {
            last_index: get("x-consul-index").and_then(|v| v.parse().ok()).unwrap_or(0),
            known_leader: get("x-consul-knownleader") == Some("true"),
            last_contact: get("x-consul-lastcontact")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or_default(),
        }
    }
}

/// Narrow view of the registry used by the discovery engine.
#[async_trait]
pub trait HealthClient: Send + Sync {
    async fn health(
        &self,
        service: &str,
        tag: Option<&str>,
        opts: Option<&QueryOptions>,
    ) -> Result<(Vec<NodeRecord>, QueryMeta), RegistryError>;
}

/// HTTP client bound to a single `ServiceEndpoint`.
#[derive(Debug, Clone)]
pub struct ConsulClient {
    client: Client,
    endpoint: ServiceEndpoint,
}

impl ConsulClient {
    pub fn new(endpoint: ServiceEndpoint) -> Self {
        let client = match &endpoint.http_client {
            Some(client) => client.clone(),
            None => Client::builder()
                .timeout(endpoint.timeout)
                .build()
                .unwrap_or_default(),
        };
        Self { client, endpoint }
    }

    fn base_url(&self) -> String {
        format!("{}://{}", self.endpoint.scheme, self.endpoint.address)
    }

    /// Query string for a health call. Per-query options win over endpoint defaults.
    fn query_params(&self, tag: Option<&str>, opts: Option<&QueryOptions>) -> Vec<(String, String)> {
        let mut params = vec![("passing".to_string(), "1".to_string())];
        if let Some(tag) = tag.filter(|t| !t.is_empty()) {
            params.push(("tag".into(), tag.into()));
        }

        let dc = opts
            .and_then(|o| o.datacenter.clone())
            .or_else(|| self.endpoint.datacenter.clone());
        if let Some(dc) = dc {
            params.push(("dc".into(), dc));
        }

        let wait = opts.and_then(|o| o.wait_time).or(self.endpoint.wait_time);
        if let Some(o) = opts {
            if o.allow_stale {
                params.push(("stale".into(), String::new()));
            }
            if o.require_consistent {
                params.push(("consistent".into(), String::new()));
            }
            if let Some(index) = o.wait_index {
                params.push(("index".into(), index.to_string()));
            }
            if let Some(near) = &o.near {
                params.push(("near".into(), near.clone()));
            }
            for (k, v) in &o.node_meta {
                params.push(("node-meta".into(), format!("{}:{}", k, v)));
            }
        }
        if let Some(wait) = wait {
            params.push(("wait".into(), format!("{}ms", wait.as_millis())));
        }
        params
    }
}

#[async_trait]
impl HealthClient for ConsulClient {
    async fn health(
        &self,
        service: &str,
        tag: Option<&str>,
        opts: Option<&QueryOptions>,
    ) -> Result<(Vec<NodeRecord>, QueryMeta), RegistryError> {
        let url = format!("{}/v1/health/service/{}", self.base_url(), service);
        let mut request = self.client.get(&url).query(&self.query_params(tag, opts));

        let token = opts
            .and_then(|o| o.token.as_deref())
            .or(self.endpoint.token.as_deref());
        if let Some(token) = token {
            request = request.header("X-Consul-Token", token);
        }
        if let Some(auth) = &self.endpoint.http_auth {
            request = request.basic_auth(&auth.username, auth.password.as_deref());
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(RegistryError::Status { status, message });
        }

        let meta = QueryMeta::from_headers(response.headers());
        let body = response.bytes().await?;
        let records: Option<Vec<NodeRecord>> = serde_json::from_slice(&body)?;
        Ok((records.unwrap_or_default(), meta))
    }
}
