// src/mapper.rs
use crate::registry_client::NodeRecord;

/// Turns raw registry entries into routable `host:port` strings.
///
/// Any `Fn(&[NodeRecord]) -> Vec<String>` is a mapper, so callers can plug in
/// validation or filtering without a new type.
pub trait NodeMapper: Send + Sync {
    fn map(&self, records: &[NodeRecord]) -> Vec<String>;
}

impl<F> NodeMapper for F
where
    F: Fn(&[NodeRecord]) -> Vec<String> + Send + Sync,
{
    fn map(&self, records: &[NodeRecord]) -> Vec<String> {
        self(records)
    }
}

fn host_port(record: &NodeRecord) -> String {
    let addr = if record.service.address.is_empty() {
        &record.node.address
    } else {
        &record.service.address
    };
    format!("{}:{}", addr, record.service.port)
}

/// Default mapper: service address when set, node address otherwise.
pub fn map_consul_entries(records: &[NodeRecord]) -> Vec<String> {
    records.iter().map(host_port).collect()
}

/// Mapper that drops records failing `keep` before formatting.
pub struct FilterMapper<P> {
    keep: P,
}

impl<P> FilterMapper<P>
where
    P: Fn(&NodeRecord) -> bool + Send + Sync,
{
    pub fn new(keep: P) -> Self {
        Self { keep }
    }
}

impl<P> NodeMapper for FilterMapper<P>
where
    P: Fn(&NodeRecord) -> bool + Send + Sync,
{
    fn map(&self, records: &[NodeRecord]) -> Vec<String> {
        records
            .iter()
            .filter(|r| (self.keep)(*r))
            .map(host_port)
            .collect()
    }
}
