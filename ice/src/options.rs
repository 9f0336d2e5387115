//! ICE options snapshot and the shared published-address cache.
//!
//! `IceOptions` is a value-type snapshot handed to the engine when a
//! session is created; the mutable state (published addresses, resolved
//! TURN addresses) lives in `AddressCache` behind its own mutex and is
//! copied into each snapshot.

use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;

/// Which side of the rendezvous this session plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceRole {
    /// Sent the offer; acts as TLS client afterwards
    Initiator,
    /// Answered the offer; acts as TLS server afterwards
    Responder,
}

/// One TURN server with credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnServer {
    /// Server URI, e.g. `turn.example.org:3478`
    pub uri: String,
    /// TURN username
    pub username: String,
    /// TURN password
    pub password: String,
    /// TURN realm
    pub realm: String,
}

/// Snapshot of everything an engine needs to gather and negotiate
#[derive(Debug, Clone)]
pub struct IceOptions {
    /// Session role
    pub role: IceRole,
    /// Component count: 1 for datagram only, 2 with a reliable fallback
    pub components: u8,
    /// Whether TCP candidates are gathered
    pub tcp_enabled: bool,
    /// STUN server hostnames
    pub stun_servers: Vec<String>,
    /// TURN servers with credentials
    pub turn_servers: Vec<TurnServer>,
    /// Whether a UPnP mapping is currently active
    pub upnp_active: bool,
    /// Addresses this device is published under
    pub published: Vec<IpAddr>,
}

impl IceOptions {
    /// Options for a given role with defaults suitable for tests
    pub fn for_role(role: IceRole) -> Self {
        Self {
            role,
            components: 2,
            tcp_enabled: true,
            stun_servers: Vec::new(),
            turn_servers: Vec::new(),
            upnp_active: false,
            published: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct CachedAddrs {
    published_v4: Option<IpAddr>,
    published_v6: Option<IpAddr>,
    turn_v4: Option<SocketAddr>,
    turn_v6: Option<SocketAddr>,
}

/// Read-mostly cache of published and resolved addresses.
///
/// Updated by `set_published_address`; visible to every later
/// `IceOptions` snapshot. The lock is never held across await points.
#[derive(Debug, Default)]
pub struct AddressCache {
    inner: Mutex<CachedAddrs>,
}

impl AddressCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a published address, replacing the previous one of the
    /// same family
    pub fn set_published(&self, addr: IpAddr) {
        let mut inner = self.inner.lock().unwrap();
        match addr {
            IpAddr::V4(_) => inner.published_v4 = Some(addr),
            IpAddr::V6(_) => inner.published_v6 = Some(addr),
        }
    }

    /// Published address, preferring IPv4
    pub fn published(&self) -> Option<IpAddr> {
        let inner = self.inner.lock().unwrap();
        inner.published_v4.or(inner.published_v6)
    }

    /// Published address for a specific family
    pub fn published_for(&self, want_v4: bool) -> Option<IpAddr> {
        let inner = self.inner.lock().unwrap();
        if want_v4 {
            inner.published_v4
        } else {
            inner.published_v6
        }
    }

    /// Record a resolved TURN server address
    pub fn set_turn(&self, addr: SocketAddr) {
        let mut inner = self.inner.lock().unwrap();
        if addr.is_ipv4() {
            inner.turn_v4 = Some(addr);
        } else {
            inner.turn_v6 = Some(addr);
        }
    }

    /// Resolved TURN server address, preferring IPv4
    pub fn resolved_turn(&self) -> Option<SocketAddr> {
        let inner = self.inner.lock().unwrap();
        inner.turn_v4.or(inner.turn_v6)
    }

    /// Every published address, for candidate synthesis
    pub fn snapshot(&self) -> Vec<IpAddr> {
        let inner = self.inner.lock().unwrap();
        inner
            .published_v4
            .iter()
            .chain(inner.published_v6.iter())
            .copied()
            .collect()
    }
}
