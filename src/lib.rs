// src/lib.rs

// Consul-backed request routing: discover healthy instances of a service,
// keep them cached, and point each request at one of them.
pub mod balancer;
pub mod config;
pub mod discovery;
pub mod http_proxy;
pub mod mapper;
pub mod middleware;
pub mod registry_client;
pub mod retry;

pub use balancer::{Balancer, BalancerError, Random, RoundRobin};
pub use config::{ConfigError, DiscoveryConfig, GatewayConfig, RouteConfig, ServiceEndpoint};
pub use discovery::{Discovery, DiscoveryError, NodeList};
pub use mapper::{map_consul_entries, FilterMapper, NodeMapper};
pub use middleware::{DiscoveryLayer, DiscoveryService};
pub use registry_client::{ConsulClient, HealthClient, NodeRecord, QueryOptions, RegistryError};
pub use retry::Retrier;
