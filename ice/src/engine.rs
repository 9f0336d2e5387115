//! Engine contract and the host-candidate engine.
//!
//! The NAT-traversal engine is a library dependency: the session drives
//! it through `IceEngine`/`EngineSession` and only consumes the
//! negotiated conduit. `HostEngine` implements the contract with host
//! candidates over plain TCP and UDP sockets, which is sufficient for
//! LAN and loopback deployments and for integration tests against real
//! sockets.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use crate::description::{Candidate, IceDescription};
use crate::options::{IceOptions, IceRole};
use crate::IceError;

/// MTU for the datagram component
pub const MAX_DATAGRAM: usize = 1200;

/// Unified stream type for the reliable component
pub enum IceStream {
    /// TCP candidate pair
    Tcp(TcpStream),
    /// In-process pair used by the memory engine
    Mem(DuplexStream),
}

impl AsyncRead for IceStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IceStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            IceStream::Mem(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IceStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            IceStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            IceStream::Mem(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IceStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            IceStream::Mem(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IceStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            IceStream::Mem(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Lossy datagram surface of a negotiated session
pub enum DatagramHalf {
    /// UDP candidate pair
    Udp {
        /// Bound local socket
        socket: Arc<UdpSocket>,
        /// Selected remote address
        peer: SocketAddr,
    },
    /// In-process queue pair used by the memory engine
    Mem {
        /// Outgoing datagrams
        tx: mpsc::UnboundedSender<Bytes>,
        /// Incoming datagrams
        rx: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    },
}

impl DatagramHalf {
    /// Send one datagram; lossy, MTU-capped
    pub async fn send(&self, data: &[u8]) -> Result<(), IceError> {
        if data.len() > MAX_DATAGRAM {
            return Err(IceError::TooLarge(data.len()));
        }
        match self {
            DatagramHalf::Udp { socket, peer } => {
                socket.send_to(data, peer).await?;
                Ok(())
            }
            DatagramHalf::Mem { tx, .. } => tx
                .send(Bytes::copy_from_slice(data))
                .map_err(|_| IceError::Closed),
        }
    }

    /// Receive one datagram without blocking
    pub fn try_recv(&self, buf: &mut [u8]) -> Result<usize, IceError> {
        match self {
            DatagramHalf::Udp { socket, .. } => match socket.try_recv_from(buf) {
                Ok((n, _from)) => Ok(n),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(IceError::WouldBlock),
                Err(e) => Err(e.into()),
            },
            DatagramHalf::Mem { rx, .. } => {
                let mut rx = rx.lock().unwrap();
                match rx.try_recv() {
                    Ok(data) => {
                        let n = data.len().min(buf.len());
                        buf[..n].copy_from_slice(&data[..n]);
                        Ok(n)
                    }
                    Err(mpsc::error::TryRecvError::Empty) => Err(IceError::WouldBlock),
                    Err(mpsc::error::TryRecvError::Disconnected) => Err(IceError::Closed),
                }
            }
        }
    }
}

/// Negotiated transport handed back by the engine
pub struct IceConduit {
    /// Reliable byte stream (TLS runs over this)
    pub reliable: Option<IceStream>,
    /// Lossy datagram component, when one was negotiated
    pub datagram: Option<DatagramHalf>,
}

/// Factory for engine sessions
#[async_trait]
pub trait IceEngine: Send + Sync {
    /// Create one engine session for a rendezvous attempt
    async fn create_session(
        &self,
        name: &str,
        opts: &IceOptions,
    ) -> Result<Box<dyn EngineSession>, IceError>;
}

/// Per-attempt engine state: gathering and connectivity checks
#[async_trait]
pub trait EngineSession: Send {
    /// Gather candidates for the local description
    async fn gather(&mut self) -> Result<Vec<Candidate>, IceError>;

    /// Run connectivity checks against the remote description
    async fn establish(
        &mut self,
        local: &IceDescription,
        remote: &IceDescription,
        deadline: Duration,
    ) -> Result<IceConduit, IceError>;

    /// Cancel everything; later calls fail with `Closed`
    async fn shutdown(&mut self);
}

/// Host-candidate engine over plain TCP and UDP sockets
#[derive(Debug, Default)]
pub struct HostEngine;

impl HostEngine {
    /// Create the engine
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl IceEngine for HostEngine {
    async fn create_session(
        &self,
        name: &str,
        opts: &IceOptions,
    ) -> Result<Box<dyn EngineSession>, IceError> {
        Ok(Box::new(HostSession {
            name: name.to_string(),
            opts: opts.clone(),
            listener: None,
            udp: None,
            closed: false,
        }))
    }
}

struct HostSession {
    name: String,
    opts: IceOptions,
    listener: Option<TcpListener>,
    udp: Option<Arc<UdpSocket>>,
    closed: bool,
}

#[async_trait]
impl EngineSession for HostSession {
    async fn gather(&mut self) -> Result<Vec<Candidate>, IceError> {
        if self.closed {
            return Err(IceError::Closed);
        }

        let listener = if self.opts.tcp_enabled {
            Some(
                TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))
                    .await
                    .map_err(|e| IceError::GatherFailed(e.to_string()))?,
            )
        } else {
            None
        };
        let udp = Arc::new(
            UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
                .await
                .map_err(|e| IceError::GatherFailed(e.to_string()))?,
        );

        let mut addrs: Vec<IpAddr> = Vec::new();
        if let Some(ip) = default_route_ip().await {
            addrs.push(ip);
        }
        addrs.push(IpAddr::V4(Ipv4Addr::LOCALHOST));
        for ip in &self.opts.published {
            addrs.push(*ip);
        }
        addrs.dedup();

        let mut candidates = Vec::new();
        for ip in &addrs {
            if let Some(listener) = &listener {
                let port = listener.local_addr()?.port();
                candidates.push(Candidate {
                    proto: "tcp".to_string(),
                    addr: SocketAddr::new(*ip, port).to_string(),
                });
            }
            let port = udp.local_addr()?.port();
            candidates.push(Candidate {
                proto: "udp".to_string(),
                addr: SocketAddr::new(*ip, port).to_string(),
            });
        }

        debug!("[{}] gathered {} host candidates", self.name, candidates.len());
        self.listener = listener;
        self.udp = Some(udp);
        Ok(candidates)
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

        let started = Instant::now();
        let stream = match self.opts.role {
            IceRole::Initiator => {
                let mut last_err = None;
                let mut connected = None;
                for candidate in remote.candidates.iter().filter(|c| c.proto == "tcp") {
                    let Ok(addr) = candidate.addr.parse::<SocketAddr>() else {
                        continue;
                    };
                    let left = deadline.saturating_sub(started.elapsed());
                    if left.is_zero() {
                        return Err(IceError::Timeout);
                    }
                    let per_pair = left.min(Duration::from_secs(5));
                    match timeout(per_pair, check_pair_outbound(addr, local, remote)).await {
                        Ok(Ok(stream)) => {
                            connected = Some(stream);
                            break;
                        }
                        Ok(Err(e)) => {
                            debug!("[{}] pair {} failed: {}", self.name, addr, e);
                            last_err = Some(e);
                        }
                        Err(_) => last_err = Some(IceError::Timeout),
                    }
                }
                connected.ok_or_else(|| {
                    last_err.unwrap_or_else(|| {
                        IceError::NegotiationFailed("no usable candidate pair".to_string())
                    })
                })?
            }
            IceRole::Responder => {
                let listener = self
                    .listener
                    .as_ref()
                    .ok_or(IceError::NotInitialized)?;
                loop {
                    let left = deadline.saturating_sub(started.elapsed());
                    if left.is_zero() {
                        return Err(IceError::Timeout);
                    }
                    let (stream, peer) = timeout(left, listener.accept())
                        .await
                        .map_err(|_| IceError::Timeout)??;
                    match check_pair_inbound(stream, local, remote).await {
                        Ok(stream) => break stream,
                        Err(e) => {
                            warn!("[{}] rejected check from {}: {}", self.name, peer, e);
                        }
                    }
                }
            }
        };

        stream.set_nodelay(true).ok();
        let peer_ip = stream.peer_addr()?.ip();
        let datagram = self.udp.take().and_then(|socket| {
            select_udp_peer(remote, peer_ip).map(|peer| DatagramHalf::Udp { socket, peer })
        });

        debug!("[{}] candidate pair selected: {}", self.name, stream.peer_addr()?);
        Ok(IceConduit {
            reliable: Some(IceStream::Tcp(stream)),
            datagram,
        })
    }

    async fn shutdown(&mut self) {
        self.listener = None;
        self.udp = None;
        self.closed = true;
    }
}

/// Pick the remote datagram address, preferring the IP the reliable
/// pair validated
fn select_udp_peer(remote: &IceDescription, validated_ip: IpAddr) -> Option<SocketAddr> {
    let mut first = None;
    for candidate in remote.candidates.iter().filter(|c| c.proto == "udp") {
        let Ok(addr) = candidate.addr.parse::<SocketAddr>() else {
            continue;
        };
        if addr.ip() == validated_ip {
            return Some(addr);
        }
        first.get_or_insert(addr);
    }
    first
}

const CHECK_PREAMBLE: &str = "tether-ice/1";

async fn check_pair_outbound(
    addr: SocketAddr,
    local: &IceDescription,
    remote: &IceDescription,
) -> Result<TcpStream, IceError> {
    let mut stream = TcpStream::connect(addr).await?;
    send_check(&mut stream, local).await?;
    verify_check(&mut stream, remote).await?;
    Ok(stream)
}

async fn check_pair_inbound(
    mut stream: TcpStream,
    local: &IceDescription,
    remote: &IceDescription,
) -> Result<TcpStream, IceError> {
    verify_check(&mut stream, remote).await?;
    send_check(&mut stream, local).await?;
    Ok(stream)
}

async fn send_check(stream: &mut TcpStream, local: &IceDescription) -> Result<(), IceError> {
    let line = format!("{CHECK_PREAMBLE} {} {}\n", local.ufrag, local.pwd);
    stream.write_all(line.as_bytes()).await?;
    Ok(())
}

async fn verify_check(stream: &mut TcpStream, remote: &IceDescription) -> Result<(), IceError> {
    let line = read_check_line(stream).await?;
    let expected = format!("{CHECK_PREAMBLE} {} {}", remote.ufrag, remote.pwd);
    if line != expected {
        return Err(IceError::NegotiationFailed(
            "connectivity check credentials mismatch".to_string(),
        ));
    }
    Ok(())
}

async fn read_check_line(stream: &mut TcpStream) -> Result<String, IceError> {
    let mut line = Vec::with_capacity(64);
    loop {
        let byte = stream.read_u8().await?;
        if byte == b'\n' {
            break;
        }
        line.push(byte);
        if line.len() > 512 {
            return Err(IceError::NegotiationFailed(
                "oversized connectivity check".to_string(),
            ));
        }
    }
    String::from_utf8(line)
        .map_err(|_| IceError::NegotiationFailed("non-utf8 connectivity check".to_string()))
}

/// Best-effort guess of the interface used for the default route
pub async fn default_route_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await.ok()?;
    socket.connect("198.51.100.1:9").await.ok()?;
    let ip = socket.local_addr().ok()?.ip();
    if ip.is_unspecified() {
        None
    } else {
        Some(ip)
    }
}
