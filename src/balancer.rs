// src/balancer.rs
use crate::config::BalancerKind;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BalancerError {
    #[error("no nodes to balance across")]
    Empty,

    #[error("balancer failed: {0}")]
    Other(String),
}

/// Picks one target out of a candidate node list.
pub trait Balancer: Send + Sync {
    fn balance(&self, nodes: &[String]) -> Result<String, BalancerError>;
}

/// Cycles through the list in order.
#[derive(Debug, Default)]
pub struct RoundRobin {
    index: Mutex<usize>,
}

impl RoundRobin {
    pub fn new() -> Self {
        RoundRobin { index: Mutex::new(0) }
    }
}

impl Balancer for RoundRobin {
    fn balance(&self, nodes: &[String]) -> Result<String, BalancerError> {
        if nodes.is_empty() {
            return Err(BalancerError::Empty);
        }
        let mut idx = self.index.lock();
        let choice = nodes[*idx % nodes.len()].clone();
        *idx = (*idx + 1) % nodes.len();
        Ok(choice)
    }
}

/// Uniformly random choice.
#[derive(Debug, Default, Clone, Copy)]
pub struct Random;

impl Balancer for Random {
    fn balance(&self, nodes: &[String]) -> Result<String, BalancerError> {
        if nodes.is_empty() {
            return Err(BalancerError::Empty);
        }
        let idx = rand::thread_rng().gen_range(0..nodes.len());
        Ok(nodes[idx].clone())
    }
}

/// Balancer selected by name in the gateway config. `None` means first node.
pub fn balancer_for(kind: &BalancerKind) -> Option<Arc<dyn Balancer>> {
    match kind {
        BalancerKind::RoundRobin => Some(Arc::new(RoundRobin::new())),
        BalancerKind::Random => Some(Arc::new(Random)),
        BalancerKind::First => None,
    }
}
