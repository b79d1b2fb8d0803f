use sentinel_consensus::ConsensusConfig;
use sentinel_network::{BootstrapPeer, DiscoveryConfig, NetworkConfig};
use sentinel_privacy::SharingConfig;

/// Settings for every layer of one node.
#[derive(Debug, Clone)]
pub struct FederationConfig {
    pub node_id: String,
    pub region: String,
    pub network: NetworkConfig,
    pub discovery: DiscoveryConfig,
    pub consensus: ConsensusConfig,
    pub sharing: SharingConfig,
}

impl FederationConfig {
    pub fn new<I: Into<String>, R: Into<String>>(node_id: I, region: R) -> Self {
        Self {
            node_id: node_id.into(),
            region: region.into(),
            network: NetworkConfig::default(),
            discovery: DiscoveryConfig::default(),
            consensus: ConsensusConfig::default(),
            sharing: SharingConfig::default(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.network.port = port;
        self
    }

    pub fn with_bootstrap<A: Into<String>>(mut self, address: A) -> Self {
        self.discovery
            .bootstrap_peers
            .push(BootstrapPeer::new(address));
        self
    }
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self::new("sentinel-node", "default")
    }
}
