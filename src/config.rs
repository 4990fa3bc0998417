use crate::mapper::{map_consul_entries, NodeMapper};
use crate::registry_client::QueryOptions;
use crate::retry::Retrier;
use reqwest::{Client, Url};
use serde::Deserialize;
use std::{fmt, fs::File, io::BufReader, net::SocketAddr, path::Path, sync::Arc, time::Duration};
use thiserror::Error;

/// Default interval between two registry refreshes.
pub const DEFAULT_REFRESH_TIME: Duration = Duration::from_secs(5 * 60);

/// Poll interval used while waiting for the first node list.
pub const DEFAULT_WAIT_INTERVAL: Duration = Duration::from_millis(100);

/// Ceiling on how long a request waits for the first node list.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-call timeout applied to the default registry HTTP client.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to open config file '{path}' : {source}")]
    Io { path: String, source: std::io::Error },

    #[error("failed to parse YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid registry endpoint '{uri}': {reason}")]
    InvalidEndpoint { uri: String, reason: String },

    #[error("{field} must be greater than zero")]
    ZeroDuration { field: &'static str },

    #[error("invalid route '{path}': {reason}")]
    InvalidRoute { path: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HttpBasicAuth {
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
}

/// One registry location. Built from a URI plus the parent config defaults.
#[derive(Debug, Clone)]
pub struct ServiceEndpoint {
    /// `host[:port]`
    pub address: String,
    pub scheme: String,
    pub datacenter: Option<String>,
    pub token: Option<String>,
    pub http_auth: Option<HttpBasicAuth>,
    pub http_client: Option<Client>,
    pub wait_time: Option<Duration>,
    pub timeout: Duration,
}

impl ServiceEndpoint {
    /// Parse a registry URI such as `http://consul.service:8500`.
    pub fn from_uri(uri: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidEndpoint { uri: uri.to_string(), reason };

        let url = Url::parse(uri).map_err(|e| invalid(e.to_string()))?;
        let host = url.host_str().ok_or_else(|| invalid("missing host".into()))?;
        let address = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        Ok(ServiceEndpoint {
            address,
            scheme: url.scheme().to_string(),
            datacenter: None,
            token: None,
            http_auth: None,
            http_client: None,
            wait_time: None,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }
}

/// Everything the discovery engine needs to find one service.
#[derive(Clone)]
pub struct DiscoveryConfig {
    pub service: String,
    pub tag: Option<String>,
    pub query_options: Option<QueryOptions>,
    pub endpoints: Vec<ServiceEndpoint>,

    // Defaults copied into every endpoint by `set_servers`.
    pub datacenter: Option<String>,
    pub token: Option<String>,
    pub http_client: Option<Client>,
    pub http_auth: Option<HttpBasicAuth>,
    pub wait_time: Option<Duration>,

    pub refresh_time: Duration,
    pub wait_interval: Duration,
    pub wait_timeout: Duration,

    /// Turns raw registry entries into routable `host:port` strings.
    pub mapper: Arc<dyn NodeMapper>,
}

impl fmt::Debug for DiscoveryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveryConfig")
            .field("service", &self.service)
            .field("tag", &self.tag)
            .field("endpoints", &self.endpoints)
            .field("datacenter", &self.datacenter)
            .field("refresh_time", &self.refresh_time)
            .field("wait_interval", &self.wait_interval)
            .field("wait_timeout", &self.wait_timeout)
            .finish_non_exhaustive()
    }
}

impl DiscoveryConfig {
    /// Config for `service` discovered through the given registry servers.
    /// No servers means discovery is disabled and requests pass straight through.
    pub fn new(service: impl Into<String>, servers: &[&str]) -> Result<Self, ConfigError> {
        let mut config = DiscoveryConfig {
            service: service.into(),
            tag: None,
            query_options: None,
            endpoints: Vec::new(),
            datacenter: None,
            token: None,
            http_client: None,
            http_auth: None,
            wait_time: None,
            refresh_time: DEFAULT_REFRESH_TIME,
            wait_interval: DEFAULT_WAIT_INTERVAL,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            mapper: Arc::new(map_consul_entries),
        };
        config.set_servers(servers)?;
        Ok(config)
    }

    /// Replace the endpoint list. Defaults currently set on `self` are applied
    /// to each new endpoint; later changes to them do not propagate.
    pub fn set_servers<S: AsRef<str>>(&mut self, servers: &[S]) -> Result<(), ConfigError> {
        let endpoints = servers
            .iter()
            .map(|uri| self.endpoint_for(uri.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        self.endpoints = endpoints;
        Ok(())
    }

    fn endpoint_for(&self, uri: &str) -> Result<ServiceEndpoint, ConfigError> {
        let mut endpoint = ServiceEndpoint::from_uri(uri)?;
        if self.datacenter.is_some() {
            endpoint.datacenter = self.datacenter.clone();
        }
        if self.http_client.is_some() {
            endpoint.http_client = self.http_client.clone();
        }
        if self.http_auth.is_some() {
            endpoint.http_auth = self.http_auth.clone();
        }
        if self.wait_time.is_some() {
            endpoint.wait_time = self.wait_time;
        }
        if self.token.is_some() {
            endpoint.token = self.token.clone();
        }
        Ok(endpoint)
    }

    pub fn with_mapper<M: NodeMapper + 'static>(mut self, mapper: M) -> Self {
        self.mapper = Arc::new(mapper);
        self
    }

    /// Rejects timings that would spin the refresh loop or the wait poll.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let timings = [
            ("refresh_time", self.refresh_time),
            ("wait_interval", self.wait_interval),
            ("wait_timeout", self.wait_timeout),
        ];
        for (field, value) in timings {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration { field });
            }
        }
        Ok(())
    }
}

/// Retry strategy selectable from the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryKind {
    #[default]
    Constant,
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancerKind {
    #[default]
    RoundRobin,
    Random,
    /// Always the first discovered node.
    First,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    #[serde(default)]
    pub strategy: RetryKind,
    #[serde(default = "default_retry_times")]
    pub times: usize,
    #[serde(default = "default_retry_wait_ms")]
    pub wait_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            strategy: RetryKind::default(),
            times: default_retry_times(),
            wait_ms: default_retry_wait_ms(),
        }
    }
}

impl RetrySettings {
    pub fn retrier(&self) -> Retrier {
        let wait = Duration::from_millis(self.wait_ms);
        match self.strategy {
            RetryKind::Constant => Retrier::constant(self.times, wait),
            RetryKind::Exponential => Retrier::exponential(self.times, wait),
        }
    }
}

fn default_retry_times() -> usize {
    crate::retry::RETRY_TIMES
}

fn default_retry_wait_ms() -> u64 {
    crate::retry::RETRY_WAIT.as_millis() as u64
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 3100))
}

fn default_refresh_secs() -> u64 {
    DEFAULT_REFRESH_TIME.as_secs()
}

fn default_wait_timeout_ms() -> u64 {
    DEFAULT_WAIT_TIMEOUT.as_millis() as u64
}

fn default_wait_interval_ms() -> u64 {
    DEFAULT_WAIT_INTERVAL.as_millis() as u64
}

fn default_route_path() -> String {
    "/".to_string()
}

/// One service mounted on a path prefix of the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RouteConfig {
    #[serde(default = "default_route_path")]
    pub path: String,
    pub service: String,
    #[serde(default)]
    pub tag: Option<String>,
    /// Registry servers for this route; the gateway-wide list when absent.
    #[serde(default)]
    pub servers: Option<Vec<String>>,
}

/// On-disk gateway configuration.
///
/// Either a `routes` list, or a single `service` (plus `tag`) served on `/`.
/// Registry settings at the top level are shared by every route.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default)]
    pub datacenter: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub http_auth: Option<HttpBasicAuth>,
    #[serde(default)]
    pub wait_time_secs: Option<u64>,
    #[serde(default = "default_refresh_secs")]
    pub refresh_secs: u64,
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
    #[serde(default = "default_wait_interval_ms")]
    pub wait_interval_ms: u64,
    #[serde(default)]
    pub query: Option<QueryOptions>,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub balancer: BalancerKind,
}

impl GatewayConfig {
    /// Load and parse configuration from the given YAML file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let p = path.as_ref();
        let file = File::open(p)
            .map_err(|e| ConfigError::Io { path: p.display().to_string(), source: e })?;
        let reader = BufReader::new(file);
        let cfg = serde_yaml::from_reader(reader)?;
        Ok(cfg)
    }

    /// Routes to mount, checked for a leading `/` and duplicate prefixes.
    pub fn routes(&self) -> Result<Vec<RouteConfig>, ConfigError> {
        let routes = if self.routes.is_empty() {
            let service = self.service.clone().ok_or_else(|| ConfigError::InvalidRoute {
                path: default_route_path(),
                reason: "neither `service` nor `routes` is set".into(),
            })?;
            vec![RouteConfig { path: default_route_path(), service, tag: self.tag.clone(), servers: None }]
        } else {
            self.routes.clone()
        };

        let mut seen = Vec::with_capacity(routes.len());
        for route in &routes {
            if !route.path.starts_with('/') {
                return Err(ConfigError::InvalidRoute {
                    path: route.path.clone(),
                    reason: "path must start with '/'".into(),
                });
            }
            let prefix = route.path.trim_end_matches('/');
            if seen.contains(&prefix) {
                return Err(ConfigError::InvalidRoute {
                    path: route.path.clone(),
                    reason: "path is mounted twice".into(),
                });
            }
            seen.push(prefix);
        }
        Ok(routes)
    }

    /// Build the discovery config for one route, inheriting the shared
    /// registry settings.
    pub fn discovery(&self, route: &RouteConfig) -> Result<DiscoveryConfig, ConfigError> {
        let mut config = DiscoveryConfig::new(route.service.clone(), &[])?;
        config.tag = route.tag.clone();
        config.query_options = self.query.clone();
        config.datacenter = self.datacenter.clone();
        config.token = self.token.clone();
        config.http_auth = self.http_auth.clone();
        config.wait_time = self.wait_time_secs.map(Duration::from_secs);
        config.refresh_time = Duration::from_secs(self.refresh_secs);
        config.wait_timeout = Duration::from_millis(self.wait_timeout_ms);
        config.wait_interval = Duration::from_millis(self.wait_interval_ms);
        config.validate()?;
        config.set_servers(route.servers.as_deref().unwrap_or(&self.servers))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn new_config_defaults() {
        let config = DiscoveryConfig::new("web", &["http://foo.com", "http://bar.com:8500"]).unwrap();

        assert_eq!(config.service, "web");
        assert_eq!(config.refresh_time, DEFAULT_REFRESH_TIME);
        assert_eq!(config.tag, None);
        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(config.endpoints[0].address, "foo.com");
        assert_eq!(config.endpoints[0].scheme, "http");
        assert_eq!(config.endpoints[1].address, "bar.com:8500");
    }

    #[test]
    fn endpoints_inherit_defaults_set_before_servers() {
        let mut config = DiscoveryConfig::new("web", &["http://foo.com"]).unwrap();
        assert_eq!(config.endpoints[0].token, None);
        assert_eq!(config.endpoints[0].datacenter, None);

        config.token = Some("foo".into());
        config.datacenter = Some("dc1".into());
        config.wait_time = Some(Duration::from_secs(3));
        config.set_servers(&["https://foo.com", "http://bar.com"]).unwrap();

        for ep in &config.endpoints {
            assert_eq!(ep.token.as_deref(), Some("foo"));
            assert_eq!(ep.datacenter.as_deref(), Some("dc1"));
            assert_eq!(ep.wait_time, Some(Duration::from_secs(3)));
        }
        assert_eq!(config.endpoints[0].scheme, "https");
    }

    #[test]
    fn zero_servers_disables_discovery() {
        let config = DiscoveryConfig::new("web", &[]).unwrap();
        assert!(config.endpoints.is_empty());
    }

    #[test]
    fn malformed_endpoint_is_rejected_immediately() {
        let err = DiscoveryConfig::new("web", &["consul.io"]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEndpoint { .. }));
    }

    #[test]
    fn gateway_config_from_yaml_file() {
        let path = std::env::temp_dir().join(format!("consul-router-{}.yaml", std::process::id()));
        let mut file = File::create(&path).unwrap();
        writeln!(
            file,
            "listen: 127.0.0.1:8080\n\
             service: web\n\
             tag: primary\n\
             servers:\n  - http://10.0.0.1:8500\n  - http://10.0.0.2:8500\n\
             token: secret\n\
             refresh_secs: 30\n\
             retry:\n  strategy: exponential\n  times: 3\n\
             balancer: random"
        )
        .unwrap();

        let gateway = GatewayConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(gateway.listen, "127.0.0.1:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(gateway.retry.strategy, RetryKind::Exponential);
        assert_eq!(gateway.retry.times, 3);
        assert_eq!(gateway.retry.wait_ms, 100);
        assert_eq!(gateway.balancer, BalancerKind::Random);

        let routes = gateway.routes().unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].path, "/");
        assert_eq!(routes[0].service, "web");

        let config = gateway.discovery(&routes[0]).unwrap();
        assert_eq!(config.tag.as_deref(), Some("primary"));
        assert_eq!(config.refresh_time, Duration::from_secs(30));
        assert_eq!(config.wait_timeout, DEFAULT_WAIT_TIMEOUT);
        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(config.endpoints[1].address, "10.0.0.2:8500");
        assert_eq!(config.endpoints[1].token.as_deref(), Some("secret"));
    }

    #[test]
    fn missing_config_file_is_io_error() {
        let err = GatewayConfig::from_file("/nonexistent/consul-router.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    fn gateway(yaml: &str) -> GatewayConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn routes_mount_services_on_prefixes() {
        let gateway = gateway(
            "servers: [\"http://10.0.0.1:8500\"]\n\
             token: secret\n\
             routes:\n\
             \x20 - path: /\n\
             \x20   service: web\n\
             \x20 - path: /consul\n\
             \x20   service: consul\n\
             \x20   tag: api\n\
             \x20   servers: [\"http://10.0.0.9:8500\"]\n",
        );

        let routes = gateway.routes().unwrap();
        assert_eq!(routes.len(), 2);

        let web = gateway.discovery(&routes[0]).unwrap();
        assert_eq!(web.service, "web");
        assert_eq!(web.endpoints[0].address, "10.0.0.1:8500");
        assert_eq!(web.endpoints[0].token.as_deref(), Some("secret"));

        let consul = gateway.discovery(&routes[1]).unwrap();
        assert_eq!(consul.service, "consul");
        assert_eq!(consul.tag.as_deref(), Some("api"));
        assert_eq!(consul.endpoints[0].address, "10.0.0.9:8500");
        assert_eq!(consul.endpoints[0].token.as_deref(), Some("secret"));
    }

    #[test]
    fn bad_routes_are_rejected() {
        let relative = gateway("routes:\n  - path: api\n    service: web\n");
        assert!(matches!(relative.routes(), Err(ConfigError::InvalidRoute { .. })));

        let twice = gateway(
            "routes:\n  - path: /api\n    service: a\n  - path: /api/\n    service: b\n",
        );
        assert!(matches!(twice.routes(), Err(ConfigError::InvalidRoute { .. })));

        let nothing = gateway("servers: []\n");
        assert!(matches!(nothing.routes(), Err(ConfigError::InvalidRoute { .. })));
    }

    #[test]
    fn zero_durations_are_rejected() {
        let gateway = gateway("service: web\nrefresh_secs: 0\n");
        let routes = gateway.routes().unwrap();
        assert!(matches!(
            gateway.discovery(&routes[0]),
            Err(ConfigError::ZeroDuration { field: "refresh_time" })
        ));

        let mut config = DiscoveryConfig::new("web", &[]).unwrap();
        assert!(config.validate().is_ok());
        config.wait_interval = Duration::ZERO;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroDuration { field: "wait_interval" })
        ));
    }
}
