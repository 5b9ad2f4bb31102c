//! Mesh configuration (§2).
//!
//! A plain builder, not a file/env loader — this crate is a library
//! embedded into a host application, which owns configuration sourcing
//! the way `freeq-sdk::ClientConfig` leaves environment and file parsing
//! to its caller.

use std::sync::Arc;
use std::time::Duration;

use crate::clock::{system_clock, SharedClock};
use crate::dedup::DEFAULT_CAPACITY as DEFAULT_DEDUP_CAPACITY;
use crate::outbound::DEFAULT_CAPACITY as DEFAULT_OUTBOUND_CAPACITY;
use crate::pool::DEFAULT_MAX_CONNECTIONS;
use crate::signaling::{LocalDiscovery, SignalingConnector};
use crate::transport::TransportFactory;
use crate::wire::{generate_node_id, NodeId};

/// Construction parameters for a [`crate::facade::Mesh`] instance.
pub struct MeshConfig {
    pub node_id: NodeId,
    pub signaling_urls: Vec<String>,
    pub max_connections: usize,
    pub dedup_capacity: usize,
    pub outbound_capacity: usize,
    pub route_ttl: Duration,
    pub rreq_validity: Duration,
    pub hop_limit: u32,
    pub maintenance_interval: Duration,
    pub idle_eviction_interval: Duration,
    pub health_check_interval: Duration,
    pub quality_reassessment_interval: Duration,
    pub transport_factory: Arc<dyn TransportFactory>,
    pub signaling_connector: Arc<dyn SignalingConnector>,
    pub local_discovery: Option<Arc<dyn LocalDiscovery>>,
    pub clock: SharedClock,
}

impl MeshConfig {
    /// Start from the required seams (a transport factory and a
    /// signaling connector can't have a sane default) and layer spec
    /// defaults on top; override fields directly before calling
    /// [`crate::facade::Mesh::initialize`].
    pub fn new(
        signaling_urls: Vec<String>,
        transport_factory: Arc<dyn TransportFactory>,
        signaling_connector: Arc<dyn SignalingConnector>,
    ) -> Self {
        Self {
            node_id: generate_node_id(),
            signaling_urls,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            route_ttl: crate::routing::table::ROUTE_TTL,
            rreq_validity: Duration::from_millis(crate::wire::RREQ_VALIDITY_MS),
            hop_limit: crate::wire::HOP_LIMIT,
            maintenance_interval: Duration::from_secs(60),
            idle_eviction_interval: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(60),
            quality_reassessment_interval: Duration::from_secs(5),
            transport_factory,
            signaling_connector,
            local_discovery: None,
            clock: system_clock(),
        }
    }

    pub fn with_node_id(mut self, node_id: NodeId) -> Self {
        self.node_id = node_id;
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_local_discovery(mut self, discovery: Arc<dyn LocalDiscovery>) -> Self {
        self.local_discovery = Some(discovery);
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }
}
