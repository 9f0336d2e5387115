//! ICE session handle driving one rendezvous attempt.
//!
//! State machine:
//! `Created → Initializing → Initialized → Started → Running | Failed → Closed`.
//! `Failed` and `Closed` are terminal; `Closed` is reachable from every
//! state via `shutdown()`.

use std::sync::Arc;
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::description::IceDescription;
use crate::engine::{EngineSession, IceConduit, IceEngine, IceStream};
use crate::options::IceOptions;
use crate::IceError;

const UFRAG_LEN: usize = 8;
const PWD_LEN: usize = 24;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    /// Constructed, nothing gathered yet
    Created,
    /// Gathering candidates
    Initializing,
    /// Local description available
    Initialized,
    /// Remote description consumed, checks may run
    Started,
    /// A candidate pair validated; transport usable
    Running,
    /// Negotiation failed; terminal
    Failed,
    /// Shut down; terminal
    Closed,
}

/// Outcome of waiting on negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationStatus {
    /// A candidate pair validated
    Running,
    /// Every pair failed
    Failed,
    /// The deadline elapsed first
    TimedOut,
}

/// Transport component addressed by send/recv
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    /// Lossy datagram component, MTU 1200
    Datagram,
    /// Reliable component; owned by TLS once the stream is taken
    Reliable,
}

/// Handle over one engine session: gathering, negotiation, I/O surface
pub struct IceSession {
    name: String,
    opts: IceOptions,
    engine: Arc<dyn IceEngine>,
    state: IceState,
    session: Option<Box<dyn EngineSession>>,
    local: Option<IceDescription>,
    remote: Option<IceDescription>,
    conduit: Option<IceConduit>,
}

impl IceSession {
    /// Create a session in `Created` state
    pub fn new(name: impl Into<String>, opts: IceOptions, engine: Arc<dyn IceEngine>) -> Self {
        Self {
            name: name.into(),
            opts,
            engine,
            state: IceState::Created,
            session: None,
            local: None,
            remote: None,
            conduit: None,
        }
    }

    /// Diagnostic name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state
    pub fn state(&self) -> IceState {
        self.state
    }

    /// Gather candidates and build the local description
    pub async fn initialize(&mut self) -> Result<(), IceError> {
        match self.state {
            IceState::Created => {}
            IceState::Closed => return Err(IceError::Closed),
            _ => return Err(IceError::InvalidState("initialize after start")),
        }
        self.state = IceState::Initializing;

        let mut session = match self.engine.create_session(&self.name, &self.opts).await {
            Ok(session) => session,
            Err(e) => {
                self.state = IceState::Failed;
                return Err(e);
            }
        };
        let candidates = match session.gather().await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("[{}] gathering failed: {}", self.name, e);
                self.state = IceState::Failed;
                return Err(IceError::GatherFailed(e.to_string()));
            }
        };

        self.local = Some(IceDescription {
            ufrag: random_token(UFRAG_LEN),
            pwd: random_token(PWD_LEN),
            candidates,
        });
        self.session = Some(session);
        self.state = IceState::Initialized;
        debug!("[{}] initialized", self.name);
        Ok(())
    }

    /// Local description; available once initialized
    pub fn local_description(&self) -> Result<&IceDescription, IceError> {
        self.local.as_ref().ok_or(IceError::NotInitialized)
    }

    /// Consume the remote description and arm connectivity checks.
    ///
    /// Fails synchronously with `NotInitialized` when preconditions are
    /// unmet.
    pub fn start(&mut self, remote: IceDescription) -> Result<(), IceError> {
        match self.state {
            IceState::Initialized => {}
            IceState::Closed => return Err(IceError::Closed),
            _ => return Err(IceError::NotInitialized),
        }
        self.remote = Some(remote);
        self.state = IceState::Started;
        Ok(())
    }

    /// Run connectivity checks until a pair validates or the deadline
    /// elapses
    pub async fn wait_for_negotiation(&mut self, deadline: Duration) -> NegotiationStatus {
        if self.state != IceState::Started {
            return if self.state == IceState::Running {
                NegotiationStatus::Running
            } else {
                NegotiationStatus::Failed
            };
        }

        let (Some(session), Some(local), Some(remote)) =
            (self.session.as_mut(), self.local.as_ref(), self.remote.as_ref())
        else {
            self.state = IceState::Failed;
            return NegotiationStatus::Failed;
        };

        match timeout(deadline, session.establish(local, remote, deadline)).await {
            Ok(Ok(conduit)) => {
                self.conduit = Some(conduit);
                self.state = IceState::Running;
                debug!("[{}] negotiation complete", self.name);
                NegotiationStatus::Running
            }
            Ok(Err(IceError::Timeout)) | Err(_) => {
                warn!("[{}] negotiation timed out", self.name);
                self.state = IceState::Failed;
                NegotiationStatus::TimedOut
            }
            Ok(Err(e)) => {
                warn!("[{}] negotiation failed: {}", self.name, e);
                self.state = IceState::Failed;
                NegotiationStatus::Failed
            }
        }
    }

    /// Send on a component. Reliable sends are ordered; datagram sends
    /// are lossy and MTU-capped.
    pub async fn send(&mut self, component: Component, data: &[u8]) -> Result<(), IceError> {
        if self.state != IceState::Running {
            return Err(IceError::Closed);
        }
        let conduit = self.conduit.as_mut().ok_or(IceError::Closed)?;
        match component {
            Component::Datagram => {
                conduit
                    .datagram
                    .as_ref()
                    .ok_or(IceError::Closed)?
                    .send(data)
                    .await
            }
            Component::Reliable => {
                use tokio::io::AsyncWriteExt;
                let stream = conduit.reliable.as_mut().ok_or(IceError::Closed)?;
                stream.write_all(data).await?;
                Ok(())
            }
        }
    }

    /// Receive from a component without blocking
    pub fn recv(&mut self, component: Component, buf: &mut [u8]) -> Result<usize, IceError> {
        if self.state != IceState::Running {
            return Err(IceError::Closed);
        }
        let conduit = self.conduit.as_mut().ok_or(IceError::Closed)?;
        match component {
            Component::Datagram => conduit
                .datagram
                .as_ref()
                .ok_or(IceError::Closed)?
                .try_recv(buf),
            Component::Reliable => Err(IceError::WouldBlock),
        }
    }

    /// Move the reliable stream out for the TLS layer.
    ///
    /// Subsequent reliable send/recv on this handle fail with `Closed`.
    pub fn take_reliable_stream(&mut self) -> Result<IceStream, IceError> {
        if self.state != IceState::Running {
            return Err(IceError::Closed);
        }
        self.conduit
            .as_mut()
            .and_then(|c| c.reliable.take())
            .ok_or(IceError::Closed)
    }

    /// Cancel everything; reachable from any state
    pub async fn shutdown(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.shutdown().await;
        }
        self.conduit = None;
        self.state = IceState::Closed;
    }
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryEngine, MemoryIceBus};
    use crate::options::IceRole;

    fn session(role: IceRole, bus: &Arc<MemoryIceBus>) -> IceSession {
        IceSession::new(
            format!("{role:?}"),
            IceOptions::for_role(role),
            Arc::new(MemoryEngine::new(bus.clone())),
        )
    }

    #[tokio::test]
    async fn test_start_before_initialize_fails() {
        let bus = MemoryIceBus::new();
        let mut s = session(IceRole::Initiator, &bus);
        let remote = IceDescription {
            ufrag: "u".to_string(),
            pwd: "p".to_string(),
            candidates: vec![],
        };
        assert!(matches!(s.start(remote), Err(IceError::NotInitialized)));
        assert!(matches!(
            s.local_description(),
            Err(IceError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_full_negotiation_over_memory_engine() {
        let bus = MemoryIceBus::new();
        let mut a = session(IceRole::Initiator, &bus);
        let mut b = session(IceRole::Responder, &bus);

        a.initialize().await.unwrap();
        b.initialize().await.unwrap();

        let desc_a = a.local_description().unwrap().clone();
        let desc_b = b.local_description().unwrap().clone();
        a.start(desc_b).unwrap();
        b.start(desc_a).unwrap();

        let (ra, rb) = tokio::join!(
            a.wait_for_negotiation(Duration::from_secs(1)),
            b.wait_for_negotiation(Duration::from_secs(1)),
        );
        assert_eq!(ra, NegotiationStatus::Running);
        assert_eq!(rb, NegotiationStatus::Running);

        // Datagram surface works both ways
        a.send(Component::Datagram, b"probe").await.unwrap();
        tokio::task::yield_now().await;
        let mut buf = [0u8; 32];
        let n = b.recv(Component::Datagram, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"probe");

        // Reliable stream can be taken exactly once
        assert!(a.take_reliable_stream().is_ok());
        assert!(matches!(a.take_reliable_stream(), Err(IceError::Closed)));
    }

    #[tokio::test]
    async fn test_shutdown_from_any_state() {
        let bus = MemoryIceBus::new();

        let mut fresh = session(IceRole::Initiator, &bus);
        fresh.shutdown().await;
        assert_eq!(fresh.state(), IceState::Closed);
        assert!(matches!(fresh.initialize().await, Err(IceError::Closed)));

        let mut initialized = session(IceRole::Initiator, &bus);
        initialized.initialize().await.unwrap();
        initialized.shutdown().await;
        assert_eq!(initialized.state(), IceState::Closed);
        assert!(matches!(
            initialized.send(Component::Datagram, b"x").await,
            Err(IceError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_negotiation_timeout_marks_failed() {
        let bus = MemoryIceBus::new();
        let mut lonely = session(IceRole::Initiator, &bus);
        lonely.initialize().await.unwrap();
        lonely
            .start(IceDescription {
                ufrag: "other".to_string(),
                pwd: "pw".to_string(),
                candidates: vec![],
            })
            .unwrap();

        let status = lonely.wait_for_negotiation(Duration::from_millis(50)).await;
        assert_eq!(status, NegotiationStatus::TimedOut);
        assert_eq!(lonely.state(), IceState::Failed);
    }
}
