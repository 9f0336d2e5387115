//! Manager configuration: capabilities, ICE settings, and timeouts.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use tether_ice::{default_route_ip, AddressCache, IceEngine, IceOptions, IceRole, TurnServer};
use tether_session::{CertificateStore, DeviceIdentity, MuxConfig};

use crate::dht::DhtRunner;

/// UPnP IGD controller capability
pub trait UpnpController: Send + Sync {
    /// Whether a port mapping is currently active
    fn is_active(&self) -> bool;
}

/// Stage deadlines for a connect attempt
#[derive(Debug, Clone)]
pub struct Timeouts {
    /// Waiting for the DHT-delivered answer
    pub dht_answer: Duration,
    /// ICE connectivity checks
    pub ice_negotiation: Duration,
    /// TLS handshake over the negotiated stream
    pub tls_handshake: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            dht_answer: Duration::from_secs(30),
            ice_negotiation: Duration::from_secs(30),
            tls_handshake: Duration::from_secs(30),
        }
    }
}

/// Everything a `ConnectionManager` needs, fixed at construction
pub struct ManagerConfig {
    /// This device's key pair and certificate
    pub identity: DeviceIdentity,
    /// DHT transport
    pub dht: Arc<dyn DhtRunner>,
    /// Trust policy for inbound certificate chains
    pub cert_store: Arc<dyn CertificateStore>,
    /// NAT-traversal engine
    pub ice_engine: Arc<dyn IceEngine>,
    /// Whether STUN resolution is enabled
    pub stun_enabled: bool,
    /// STUN server hostnames
    pub stun_servers: Vec<String>,
    /// Whether TURN relaying is enabled
    pub turn_enabled: bool,
    /// TURN servers with credentials
    pub turn_servers: Vec<TurnServer>,
    /// Whether TCP candidates are gathered
    pub tcp_enabled: bool,
    /// Optional UPnP controller
    pub upnp: Option<Arc<dyn UpnpController>>,
    /// Published/resolved address cache
    pub address_cache: AddressCache,
    /// Stage deadlines
    pub timeouts: Timeouts,
    /// Multiplexed socket tuning
    pub mux: MuxConfig,
}

impl ManagerConfig {
    /// Configuration with defaults around the four required capabilities
    pub fn new(
        identity: DeviceIdentity,
        dht: Arc<dyn DhtRunner>,
        cert_store: Arc<dyn CertificateStore>,
        ice_engine: Arc<dyn IceEngine>,
    ) -> Self {
        Self {
            identity,
            dht,
            cert_store,
            ice_engine,
            stun_enabled: false,
            stun_servers: Vec::new(),
            turn_enabled: false,
            turn_servers: Vec::new(),
            tcp_enabled: true,
            upnp: None,
            address_cache: AddressCache::new(),
            timeouts: Timeouts::default(),
            mux: MuxConfig::default(),
        }
    }

    /// Whether UPnP is enabled and able to map ports
    pub fn upnp_active(&self) -> bool {
        self.upnp.as_ref().map(|u| u.is_active()).unwrap_or(false)
    }

    /// Assemble an ICE options snapshot for a session
    pub fn ice_options(&self, role: IceRole) -> IceOptions {
        IceOptions {
            role,
            components: 2,
            tcp_enabled: self.tcp_enabled,
            stun_servers: if self.stun_enabled {
                self.stun_servers.clone()
            } else {
                Vec::new()
            },
            turn_servers: if self.turn_enabled {
                self.turn_servers.clone()
            } else {
                Vec::new()
            },
            upnp_active: self.upnp_active(),
            published: self.address_cache.snapshot(),
        }
    }

    /// Record a published address for later snapshots
    pub fn set_published_address(&self, addr: IpAddr) {
        debug!("published address set to {}", addr);
        self.address_cache.set_published(addr);
    }

    /// Published address, preferring IPv4
    pub fn published_ip_address(&self) -> Option<IpAddr> {
        self.address_cache.published()
    }

    /// Store the address of the default-route interface as published
    pub async fn store_active_ip_address(&self) {
        if let Some(ip) = default_route_ip().await {
            self.set_published_address(ip);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::MemoryDhtBus;
    use tether_ice::{MemoryEngine, MemoryIceBus};
    use tether_session::AllowAllStore;

    fn config() -> ManagerConfig {
        let identity = DeviceIdentity::generate().unwrap();
        let dht = MemoryDhtBus::new().handle(identity.device_id());
        ManagerConfig::new(
            identity,
            Arc::new(dht),
            Arc::new(AllowAllStore),
            Arc::new(MemoryEngine::new(MemoryIceBus::new())),
        )
    }

    #[test]
    fn test_ice_options_respect_toggles() {
        let mut cfg = config();
        cfg.stun_servers = vec!["stun.example.org:3478".to_string()];
        cfg.turn_servers = vec![TurnServer {
            uri: "turn.example.org:3478".to_string(),
            username: "user".to_string(),
            password: "pw".to_string(),
            realm: "realm".to_string(),
        }];

        // Disabled toggles suppress the server lists
        let opts = cfg.ice_options(IceRole::Initiator);
        assert!(opts.stun_servers.is_empty());
        assert!(opts.turn_servers.is_empty());

        cfg.stun_enabled = true;
        cfg.turn_enabled = true;
        let opts = cfg.ice_options(IceRole::Responder);
        assert_eq!(opts.stun_servers.len(), 1);
        assert_eq!(opts.turn_servers.len(), 1);
    }

    #[test]
    fn test_published_address_flows_into_options() {
        let cfg = config();
        assert!(cfg.published_ip_address().is_none());
        cfg.set_published_address("192.0.2.7".parse().unwrap());
        let opts = cfg.ice_options(IceRole::Initiator);
        assert_eq!(opts.published, vec!["192.0.2.7".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn test_upnp_active_consults_controller() {
        struct FixedUpnp(bool);
        impl UpnpController for FixedUpnp {
            fn is_active(&self) -> bool {
                self.0
            }
        }

        let mut cfg = config();
        assert!(!cfg.upnp_active());
        cfg.upnp = Some(Arc::new(FixedUpnp(true)));
        assert!(cfg.upnp_active());
        assert!(cfg.ice_options(IceRole::Initiator).upnp_active);
    }
}
