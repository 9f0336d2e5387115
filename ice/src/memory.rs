//! In-process engine for tests and loopback wiring.
//!
//! Two sessions negotiating over the same `MemoryIceBus` are paired by
//! their ufrag pair and handed the two halves of a duplex stream plus a
//! datagram queue pair, with no sockets involved.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::debug;

use crate::description::{Candidate, IceDescription};
use crate::engine::{DatagramHalf, EngineSession, IceConduit, IceEngine, IceStream};
use crate::options::IceOptions;
use crate::IceError;

const DUPLEX_CAPACITY: usize = 256 * 1024;

/// Rendezvous point pairing memory sessions by ufrag
#[derive(Default)]
pub struct MemoryIceBus {
    waiting: Mutex<HashMap<String, oneshot::Sender<IceConduit>>>,
}

impl MemoryIceBus {
    /// Create a shared bus
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn rendezvous(&self, key: &str) -> Rendezvous {
        let mut waiting = self.waiting.lock().unwrap();
        if let Some(tx) = waiting.remove(key) {
            Rendezvous::Second(tx)
        } else {
            let (tx, rx) = oneshot::channel();
            waiting.insert(key.to_string(), tx);
            Rendezvous::First(rx)
        }
    }

    fn abandon(&self, key: &str) {
        self.waiting.lock().unwrap().remove(key);
    }
}

enum Rendezvous {
    First(oneshot::Receiver<IceConduit>),
    Second(oneshot::Sender<IceConduit>),
}

/// Engine whose sessions pair up over a shared in-process bus
pub struct MemoryEngine {
    bus: Arc<MemoryIceBus>,
}

impl MemoryEngine {
    /// Create an engine bound to a bus
    pub fn new(bus: Arc<MemoryIceBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl IceEngine for MemoryEngine {
    async fn create_session(
        &self,
        name: &str,
        _opts: &IceOptions,
    ) -> Result<Box<dyn EngineSession>, IceError> {
        Ok(Box::new(MemorySession {
            name: name.to_string(),
            bus: self.bus.clone(),
            closed: false,
        }))
    }
}

struct MemorySession {
    name: String,
    bus: Arc<MemoryIceBus>,
    closed: bool,
}

fn pair_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{a}|{b}")
    } else {
        format!("{b}|{a}")
    }
}

fn conduit_pair() -> (IceConduit, IceConduit) {
    let (stream_a, stream_b) = tokio::io::duplex(DUPLEX_CAPACITY);
    let (tx_ab, rx_ab) = mpsc::unbounded_channel();
    let (tx_ba, rx_ba) = mpsc::unbounded_channel();

    let a = IceConduit {
        reliable: Some(IceStream::Mem(stream_a)),
        datagram: Some(DatagramHalf::Mem {
            tx: tx_ab,
            rx: Mutex::new(rx_ba),
        }),
    };
    let b = IceConduit {
        reliable: Some(IceStream::Mem(stream_b)),
        datagram: Some(DatagramHalf::Mem {
            tx: tx_ba,
            rx: Mutex::new(rx_ab),
        }),
    };
    (a, b)
}

#[async_trait]
impl EngineSession for MemorySession {
    async fn gather(&mut self) -> Result<Vec<Candidate>, IceError> {
        if self.closed {
            return Err(IceError::Closed);
        }
        Ok(vec![Candidate {
            proto: "mem".to_string(),
            addr: "local".to_string(),
        }])
    }

    async fn establish(
        &mut self,
        local: &IceDescription,
        remote: &IceDescription,
        deadline: Duration,
    ) -> Result<IceConduit, IceError> {
        if self.closed {
            return Err(IceError::Closed);
        }

        let key = pair_key(&local.ufrag, &remote.ufrag);
        match self.bus.rendezvous(&key) {
            Rendezvous::Second(tx) => {
                let (ours, theirs) = conduit_pair();
                tx.send(theirs).map_err(|_| {
                    IceError::NegotiationFailed("peer abandoned rendezvous".to_string())
                })?;
                debug!("[{}] paired as second arrival", self.name);
                Ok(ours)
            }
            Rendezvous::First(rx) => match timeout(deadline, rx).await {
                Ok(Ok(conduit)) => {
                    debug!("[{}] paired as first arrival", self.name);
                    Ok(conduit)
                }
                Ok(Err(_)) => Err(IceError::NegotiationFailed(
                    "bus dropped rendezvous".to_string(),
                )),
                Err(_) => {
                    self.bus.abandon(&key);
                    Err(IceError::Timeout)
                }
            },
        }
    }

    async fn shutdown(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::IceRole;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn desc(ufrag: &str) -> IceDescription {
        IceDescription {
            ufrag: ufrag.to_string(),
            pwd: "pw".to_string(),
            candidates: vec![],
        }
    }

    #[tokio::test]
    async fn test_memory_pairing() {
        let bus = MemoryIceBus::new();
        let engine = MemoryEngine::new(bus.clone());

        let mut a = engine
            .create_session("a", &IceOptions::for_role(IceRole::Initiator))
            .await
            .unwrap();
        let mut b = engine
            .create_session("b", &IceOptions::for_role(IceRole::Responder))
            .await
            .unwrap();

        let desc_aa = desc("aa");
        let desc_bb = desc("bb");
        let (left, right) = tokio::join!(
            a.establish(&desc_aa, &desc_bb, Duration::from_secs(1)),
            b.establish(&desc_bb, &desc_aa, Duration::from_secs(1)),
        );
        let mut left = left.unwrap();
        let mut right = right.unwrap();

        let mut sa = left.reliable.take().unwrap();
        let mut sb = right.reliable.take().unwrap();
        sa.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        sb.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        // Datagram queue pair crosses over too
        let da = left.datagram.take().unwrap();
        let db = right.datagram.take().unwrap();
        da.send(b"dgram").await.unwrap();
        tokio::task::yield_now().await;
        let mut dbuf = [0u8; 16];
        let n = db.try_recv(&mut dbuf).unwrap();
        assert_eq!(&dbuf[..n], b"dgram");
    }

    #[tokio::test]
    async fn test_memory_establish_times_out_alone() {
        let bus = MemoryIceBus::new();
        let engine = MemoryEngine::new(bus);
        let mut session = engine
            .create_session("lonely", &IceOptions::for_role(IceRole::Initiator))
            .await
            .unwrap();

        let result = session
            .establish(&desc("x"), &desc("y"), Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(IceError::Timeout)));
    }
}
