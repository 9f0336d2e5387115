//! DHT runner capability and the in-memory bus.
//!
//! The real runner encrypts values to the recipient and verifies the
//! sender before delivery; the manager only sees plaintext rendezvous
//! maps plus the verified sender id. `MemoryDht` wires several manager
//! instances over one in-process bus for tests and local demos.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use tether_wire::DeviceId;

/// DHT transport errors
#[derive(Error, Debug)]
pub enum DhtError {
    /// The DHT cannot take publishes or listens right now
    #[error("dht unavailable")]
    Unavailable,
}

/// Cancels a listen when dropped
pub struct ListenToken {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl ListenToken {
    /// Wrap a cancel closure
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }
}

impl Drop for ListenToken {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// DHT transport capability provided by the host.
///
/// Values are encrypted to the recipient on put and decrypted plus
/// sender-verified on delivery; listeners receive `(sender, plaintext)`.
#[async_trait]
pub trait DhtRunner: Send + Sync {
    /// Publish a value under a key, encrypted to `to`
    async fn put_encrypted(
        &self,
        key: &str,
        to: &DeviceId,
        value: Bytes,
    ) -> Result<(), DhtError>;

    /// Subscribe to values published under a key
    fn listen_encrypted(
        &self,
        key: &str,
        tx: mpsc::UnboundedSender<(DeviceId, Bytes)>,
    ) -> ListenToken;
}

type Subscribers = HashMap<String, Vec<(u64, mpsc::UnboundedSender<(DeviceId, Bytes)>)>>;

/// Shared in-process rendezvous bus
#[derive(Default)]
pub struct MemoryDhtBus {
    subs: Mutex<Subscribers>,
    next_token: AtomicU64,
}

impl MemoryDhtBus {
    /// Create a shared bus
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A node-local handle publishing as `own`
    pub fn handle(self: &Arc<Self>, own: DeviceId) -> MemoryDht {
        MemoryDht {
            bus: self.clone(),
            own,
        }
    }
}

/// Per-node handle onto the in-memory bus
pub struct MemoryDht {
    bus: Arc<MemoryDhtBus>,
    own: DeviceId,
}

#[async_trait]
impl DhtRunner for MemoryDht {
    async fn put_encrypted(
        &self,
        key: &str,
        _to: &DeviceId,
        value: Bytes,
    ) -> Result<(), DhtError> {
        let subs = self.bus.subs.lock().unwrap();
        if let Some(listeners) = subs.get(key) {
            debug!("bus put on {} reaches {} listeners", key, listeners.len());
            for (_, tx) in listeners {
                tx.send((self.own, value.clone())).ok();
            }
        } else {
            debug!("bus put on {} with no listeners", key);
        }
        Ok(())
    }

    fn listen_encrypted(
        &self,
        key: &str,
        tx: mpsc::UnboundedSender<(DeviceId, Bytes)>,
    ) -> ListenToken {
        let token = self.bus.next_token.fetch_add(1, Ordering::Relaxed);
        self.bus
            .subs
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .push((token, tx));

        let bus = self.bus.clone();
        let key = key.to_string();
        ListenToken::new(move || {
            let mut subs = bus.subs.lock().unwrap();
            if let Some(listeners) = subs.get_mut(&key) {
                listeners.retain(|(id, _)| *id != token);
                if listeners.is_empty() {
                    subs.remove(&key);
                }
            }
        })
    }
}
