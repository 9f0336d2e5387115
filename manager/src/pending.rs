//! Book-keeping for in-flight connect attempts.
//!
//! Outbound attempts are deduplicated by device id; inbound attempts by
//! (device id, request id). Each outbound attempt carries the list of
//! channel waiters to resolve exactly once, and the table lock is never
//! held across a suspension point or a callback.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::time::Instant;

use tether_session::{ChannelSocket, Error};
use tether_wire::{DeviceId, PeerConnectionRequest};

/// Callback resolved with exactly one of a channel or an error
pub type ConnectCallback = Box<dyn FnOnce(Option<Arc<ChannelSocket>>, Option<Error>) + Send>;

/// One registered channel request waiting on a connect attempt
pub(crate) struct ChannelWaiter {
    pub name: String,
    pub cb: ConnectCallback,
}

/// Outbound attempt towards one device
pub(crate) struct OutboundAttempt {
    pub request_id: u64,
    pub answer_tx: Option<oneshot::Sender<PeerConnectionRequest>>,
    pub waiters: Vec<ChannelWaiter>,
    pub started: Instant,
}

/// Inbound attempt driven by a DHT offer
pub(crate) struct InboundAttempt {
    pub started: Instant,
}

/// Both pending tables behind the manager's single pending lock
#[derive(Default)]
pub(crate) struct PendingTable {
    pub outbound: HashMap<DeviceId, OutboundAttempt>,
    pub inbound: HashMap<(DeviceId, u64), InboundAttempt>,
}

impl PendingTable {
    /// Whether an outbound attempt carries a waiter with this name
    pub fn is_connecting(&self, device: &DeviceId, name: &str) -> bool {
        self.outbound
            .get(device)
            .map(|attempt| attempt.waiters.iter().any(|w| w.name == name))
            .unwrap_or(false)
    }

    /// Drain every outbound waiter, for shutdown
    pub fn drain_all_waiters(&mut self) -> Vec<ChannelWaiter> {
        let mut waiters = Vec::new();
        for (_, mut attempt) in self.outbound.drain() {
            waiters.append(&mut attempt.waiters);
        }
        self.inbound.clear();
        waiters
    }
}
