//! Connection manager: accepts connect requests, deduplicates attempts,
//! listens for inbound rendezvous, drives the ICE/TLS pipeline, and
//! vends channels.
//!
//! Locking discipline: the pending table and the connections table each
//! sit behind their own mutex; neither lock is held across a suspension
//! point or a callback, and nesting always orders pending before
//! connections.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use tether_ice::{IceDescription, IceRole, IceSession, IceStream, NegotiationStatus};
use tether_session::{
    connect_tls, peer_uri_from_cert, ChannelSocket, Error, MultiplexedSocket, MuxHooks,
    TlsSession, DEVICE_URI_PREFIX,
};
use tether_session::{accept_tls, device_id_from_cert};
use tether_wire::{listen_key, DeviceId, PeerConnectionRequest, MAX_NAME_LEN};

use crate::config::ManagerConfig;
use crate::dht::ListenToken;
use crate::pending::{ChannelWaiter, InboundAttempt, OutboundAttempt, PendingTable};

pub use crate::pending::ConnectCallback;

/// Accepts or declines an inbound ICE request from a device
pub type IceRequestHook = Arc<dyn Fn(&DeviceId) -> bool + Send + Sync>;

/// Accepts or declines an inbound channel: (peer cert DER, name)
pub type ChannelRequestHook = Arc<dyn Fn(&[u8], &str) -> bool + Send + Sync>;

/// Observes a remotely-opened channel becoming ready
pub type ConnectionReadyHook = Arc<dyn Fn(&DeviceId, &str, Arc<ChannelSocket>) + Send + Sync>;

/// Lets the host defer an inbound wake/push connection: (conn type,
/// peer). Returning true suspends the normal answer path.
pub type IosConnectedHook = Arc<dyn Fn(&str, &DeviceId) -> bool + Send + Sync>;

/// Options for `connect_device_with`
#[derive(Debug, Clone, Default)]
pub struct ConnectOpts {
    /// Do not negotiate a new socket if none exists
    pub no_new_socket: bool,
    /// Negotiate a new socket even if one exists
    pub force_new_socket: bool,
    /// Connection-type tag carried in the rendezvous offer
    pub conn_type: String,
}

#[derive(Default)]
struct Hooks {
    ice_request: Option<IceRequestHook>,
    channel_request: Option<ChannelRequestHook>,
    connection_ready: Option<ConnectionReadyHook>,
    ios_connected: Option<IosConnectedHook>,
}

struct ConnectionRecord {
    socket: MultiplexedSocket,
}

struct Inner {
    config: ManagerConfig,
    pending: Mutex<PendingTable>,
    connections: Mutex<std::collections::HashMap<DeviceId, ConnectionRecord>>,
    /// Duplicate-losers held open until their committed channels close
    draining: Mutex<Vec<MultiplexedSocket>>,
    hooks: Mutex<Hooks>,
    listen: Mutex<Option<ListenToken>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// Manages authenticated connections to other devices
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create a manager around its configuration
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                pending: Mutex::new(PendingTable::default()),
                connections: Mutex::new(std::collections::HashMap::new()),
                draining: Mutex::new(Vec::new()),
                hooks: Mutex::new(Hooks::default()),
                listen: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// This device's id
    pub fn device_id(&self) -> DeviceId {
        self.inner.config.identity.device_id()
    }

    /// Manager configuration
    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Open a channel to a device, negotiating a connection if needed
    pub fn connect_device(&self, device: DeviceId, name: &str, cb: ConnectCallback) {
        self.connect_device_with(device, name, ConnectOpts::default(), cb);
    }

    /// Open a channel to the device identified by a certificate
    pub fn connect_device_cert(
        &self,
        cert_der: &[u8],
        name: &str,
        opts: ConnectOpts,
        cb: ConnectCallback,
    ) {
        match device_id_from_cert(cert_der) {
            Ok(device) => self.connect_device_with(device, name, opts, cb),
            Err(_) => cb(None, Some(Error::Malformed)),
        }
    }

    /// Open a channel with full options; the callback fires with
    /// exactly one of a channel or an error
    pub fn connect_device_with(
        &self,
        device: DeviceId,
        name: &str,
        opts: ConnectOpts,
        cb: ConnectCallback,
    ) {
        if opts.no_new_socket && opts.force_new_socket {
            cb(None, Some(Error::Malformed));
            return;
        }
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            cb(None, Some(Error::Malformed));
            return;
        }
        if self.inner.closed.load(Ordering::SeqCst) {
            cb(None, Some(Error::Cancelled));
            return;
        }

        let inner = self.inner.clone();
        let name = name.to_string();
        Inner::spawn_tracked(&self.inner, async move {
            Inner::connect_pipeline(&inner, device, name, opts, cb).await;
        });
    }

    /// Whether a connect with this channel name is currently in flight
    pub fn is_connecting(&self, device: &DeviceId, name: &str) -> bool {
        self.inner.pending.lock().unwrap().is_connecting(device, name)
    }

    /// Tear down every connection whose peer certificate carries this
    /// URI, and cancel pending attempts to that device
    pub fn close_connections_with(&self, peer_uri: &str) {
        let victims: Vec<MultiplexedSocket> = {
            let mut conns = self.inner.connections.lock().unwrap();
            let matching: Vec<DeviceId> = conns
                .iter()
                .filter(|(_, record)| {
                    peer_uri_from_cert(record.socket.peer_certificate()).as_deref()
                        == Some(peer_uri)
                })
                .map(|(device, _)| *device)
                .collect();
            matching
                .into_iter()
                .filter_map(|device| conns.remove(&device))
                .map(|record| record.socket)
                .collect()
        };
        let draining: Vec<MultiplexedSocket> = {
            let mut draining = self.inner.draining.lock().unwrap();
            let mut out = Vec::new();
            draining.retain(|socket| {
                if peer_uri_from_cert(socket.peer_certificate()).as_deref() == Some(peer_uri) {
                    out.push(socket.clone());
                    false
                } else {
                    true
                }
            });
            out
        };

        let waiters = {
            let device = peer_uri
                .strip_prefix(DEVICE_URI_PREFIX)
                .and_then(|hex| hex.parse::<DeviceId>().ok());
            let mut out = Vec::new();
            if let Some(device) = device {
                let mut pending = self.inner.pending.lock().unwrap();
                if let Some(mut attempt) = pending.outbound.remove(&device) {
                    out.append(&mut attempt.waiters);
                }
                pending.inbound.retain(|(d, _), _| *d != device);
            }
            out
        };

        for waiter in waiters {
            (waiter.cb)(None, Some(Error::Cancelled));
        }
        for socket in victims.into_iter().chain(draining) {
            info!("closing connection with {}", peer_uri);
            socket.shutdown();
        }
    }

    /// Subscribe to inbound rendezvous requests for this device key
    pub fn on_dht_connected(&self, device_pk_der: &[u8]) {
        let own = DeviceId::from_public_key_der(device_pk_der);
        let key = listen_key(&own);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let token = self.inner.config.dht.listen_encrypted(&key, tx);
        *self.inner.listen.lock().unwrap() = Some(token);

        let inner = self.inner.clone();
        Inner::spawn_tracked(&self.inner, async move {
            while let Some((from, value)) = rx.recv().await {
                Inner::handle_rendezvous(&inner, from, value);
            }
        });
        info!("listening for peer requests on {}", key);
    }

    /// Gate inbound ICE requests
    pub fn on_ice_request(&self, cb: IceRequestHook) {
        self.inner.hooks.lock().unwrap().ice_request = Some(cb);
    }

    /// Gate inbound channel opens
    pub fn on_channel_request(&self, cb: ChannelRequestHook) {
        self.inner.hooks.lock().unwrap().channel_request = Some(cb);
    }

    /// Observe remotely-opened channels becoming ready
    pub fn on_connection_ready(&self, cb: ConnectionReadyHook) {
        self.inner.hooks.lock().unwrap().connection_ready = Some(cb);
    }

    /// Let the host defer wake/push connections
    pub fn on_ios_connected(&self, cb: IosConnectedHook) {
        self.inner.hooks.lock().unwrap().ios_connected = Some(cb);
    }

    /// Probe every connection immediately
    pub fn connectivity_changed(&self) {
        let sockets: Vec<MultiplexedSocket> = {
            let conns = self.inner.connections.lock().unwrap();
            conns.values().map(|r| r.socket.clone()).collect()
        };
        let draining: Vec<MultiplexedSocket> =
            self.inner.draining.lock().unwrap().clone();
        for socket in sockets.into_iter().chain(draining) {
            socket.trigger_beacon();
        }
    }

    /// Number of live connections
    pub fn active_sockets(&self) -> usize {
        self.inner.connections.lock().unwrap().len()
    }

    /// Log one line per live connection
    pub fn monitor(&self) {
        let (outbound, inbound) = {
            let pending = self.inner.pending.lock().unwrap();
            (pending.outbound.len(), pending.inbound.len())
        };
        let lines: Vec<String> = {
            let conns = self.inner.connections.lock().unwrap();
            conns.values().map(|r| r.socket.describe()).collect()
        };
        info!(
            "monitor: {} connections, {} outbound pending, {} inbound pending",
            lines.len(),
            outbound,
            inbound
        );
        for line in lines {
            info!("monitor: {}", line);
        }
    }

    /// Cancel everything: pending waiters fire with `cancelled`, live
    /// connections close, background tasks stop
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("connection manager shutting down");
        *self.inner.listen.lock().unwrap() = None;

        let waiters = self.inner.pending.lock().unwrap().drain_all_waiters();
        for waiter in waiters {
            (waiter.cb)(None, Some(Error::Cancelled));
        }

        let sockets: Vec<MultiplexedSocket> = {
            let mut conns = self.inner.connections.lock().unwrap();
            conns.drain().map(|(_, record)| record.socket).collect()
        };
        let draining: Vec<MultiplexedSocket> = {
            let mut draining = self.inner.draining.lock().unwrap();
            draining.drain(..).collect()
        };
        for socket in sockets.into_iter().chain(draining) {
            socket.shutdown();
        }

        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.inner.tasks.lock().unwrap();
            tasks.drain(..).collect()
        };
        for task in tasks {
            task.abort();
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    fn spawn_tracked(inner: &Arc<Inner>, fut: impl std::future::Future<Output = ()> + Send + 'static) {
        let handle = tokio::spawn(fut);
        let mut tasks = inner.tasks.lock().unwrap();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    /// Outbound connect: reuse, attach, or start a fresh attempt
    async fn connect_pipeline(
        inner: &Arc<Inner>,
        device: DeviceId,
        name: String,
        opts: ConnectOpts,
        cb: ConnectCallback,
    ) {
        // Step 1: try the live connection unless a fresh one is forced
        if !opts.force_new_socket {
            let existing = {
                let conns = inner.connections.lock().unwrap();
                conns.get(&device).map(|record| record.socket.clone())
            };
            match existing {
                Some(socket) => match socket.open_channel(&name).await {
                    Ok(channel) => {
                        debug!("reused connection to {} for \"{}\"", device.short(), name);
                        cb(Some(channel), None);
                        return;
                    }
                    Err(err @ (Error::PeerRefused | Error::Timeout | Error::Malformed)) => {
                        cb(None, Some(err));
                        return;
                    }
                    Err(_) if opts.no_new_socket => {
                        cb(None, Some(Error::NoSocket));
                        return;
                    }
                    Err(err) => {
                        // Open raced the socket's teardown; negotiate anew
                        debug!(
                            "connection to {} unusable ({}); negotiating a new one",
                            device.short(),
                            err
                        );
                    }
                },
                None if opts.no_new_socket => {
                    cb(None, Some(Error::NoSocket));
                    return;
                }
                None => {}
            }
        }

        // Step 2: attach to an in-flight attempt, or start one
        let (request_id, answer_rx) = {
            let mut pending = inner.pending.lock().unwrap();
            if let Some(attempt) = pending.outbound.get_mut(&device) {
                debug!("attaching \"{}\" to pending attempt for {}", name, device.short());
                attempt.waiters.push(ChannelWaiter { name, cb });
                return;
            }
            let request_id = loop {
                let id: u64 = rand::thread_rng().gen();
                if id != 0 {
                    break id;
                }
            };
            let (answer_tx, answer_rx) = oneshot::channel();
            pending.outbound.insert(
                device,
                OutboundAttempt {
                    request_id,
                    answer_tx: Some(answer_tx),
                    waiters: vec![ChannelWaiter { name, cb }],
                    started: Instant::now(),
                },
            );
            (request_id, answer_rx)
        };

        info!(
            "connecting to {} (request {:x})",
            device.short(),
            request_id
        );
        let result =
            Inner::run_outbound_attempt(inner, device, request_id, answer_rx, &opts.conn_type)
                .await;
        Inner::resolve_outbound(inner, device, result).await;
    }

    async fn run_outbound_attempt(
        inner: &Arc<Inner>,
        device: DeviceId,
        request_id: u64,
        answer_rx: oneshot::Receiver<PeerConnectionRequest>,
        conn_type: &str,
    ) -> Result<MultiplexedSocket, Error> {
        let mut ice = IceSession::new(
            format!("out:{}:{:x}", device.short(), request_id),
            inner.config.ice_options(IceRole::Initiator),
            inner.config.ice_engine.clone(),
        );
        let result =
            Inner::drive_outbound(inner, device, request_id, answer_rx, conn_type, &mut ice).await;
        if result.is_err() {
            ice.shutdown().await;
        }
        result
    }

    async fn drive_outbound(
        inner: &Arc<Inner>,
        device: DeviceId,
        request_id: u64,
        answer_rx: oneshot::Receiver<PeerConnectionRequest>,
        conn_type: &str,
        ice: &mut IceSession,
    ) -> Result<MultiplexedSocket, Error> {
        let timeouts = &inner.config.timeouts;

        ice.initialize().await.map_err(Error::from)?;
        let offer = PeerConnectionRequest {
            id: request_id,
            ice_msg: ice.local_description().map_err(Error::from)?.encode(),
            is_answer: false,
            conn_type: conn_type.to_string(),
        };
        let value = offer.encode().map_err(|_| Error::Malformed)?;
        inner
            .config
            .dht
            .put_encrypted(&listen_key(&device), &device, value)
            .await
            .map_err(|_| Error::DhtUnavailable)?;
        debug!("offer {:x} published for {}", request_id, device.short());

        let answer = match timeout(timeouts.dht_answer, answer_rx).await {
            Ok(Ok(answer)) => answer,
            Ok(Err(_)) => return Err(Error::Cancelled),
            Err(_) => return Err(Error::Timeout),
        };

        let remote = IceDescription::decode(&answer.ice_msg).map_err(|_| Error::Malformed)?;
        ice.start(remote).map_err(Error::from)?;
        match ice.wait_for_negotiation(timeouts.ice_negotiation).await {
            NegotiationStatus::Running => {}
            NegotiationStatus::Failed => return Err(Error::IceNegotiationFailed),
            NegotiationStatus::TimedOut => return Err(Error::Timeout),
        }

        let stream = ice.take_reliable_stream().map_err(Error::from)?;
        let tls = timeout(
            timeouts.tls_handshake,
            connect_tls(&inner.config.identity, device, stream),
        )
        .await
        .map_err(|_| Error::Timeout)??;

        Ok(Inner::register_connection(
            inner,
            Inner::make_socket(inner, tls, true),
        ))
    }

    /// Resolve the attempt's waiters exactly once, clearing the entry
    /// before anything user-visible runs
    async fn resolve_outbound(
        inner: &Arc<Inner>,
        device: DeviceId,
        result: Result<MultiplexedSocket, Error>,
    ) {
        let (waiters, started) = {
            let mut pending = inner.pending.lock().unwrap();
            match pending.outbound.remove(&device) {
                Some(attempt) => (attempt.waiters, Some(attempt.started)),
                None => (Vec::new(), None),
            }
        };

        match result {
            Ok(socket) => {
                info!(
                    "connection with {} ready after {:?} ({} waiters)",
                    device.short(),
                    started.map(|s| s.elapsed()).unwrap_or_default(),
                    waiters.len()
                );
                for waiter in waiters {
                    let socket = socket.clone();
                    Inner::spawn_tracked(inner, async move {
                        match socket.open_channel(&waiter.name).await {
                            Ok(channel) => (waiter.cb)(Some(channel), None),
                            Err(err) => (waiter.cb)(None, Some(err)),
                        }
                    });
                }
            }
            Err(err) => {
                warn!("connect to {} failed: {}", device.short(), err);
                for waiter in waiters {
                    (waiter.cb)(None, Some(err));
                }
            }
        }
    }

    /// Insert a fresh connection, arbitrating a simultaneous-connect
    /// race with the exporter tie-break
    fn register_connection(inner: &Arc<Inner>, socket: MultiplexedSocket) -> MultiplexedSocket {
        let device = socket.device_id();
        let (winner, loser) = {
            let mut conns = inner.connections.lock().unwrap();
            match conns.get_mut(&device) {
                None => {
                    conns.insert(
                        device,
                        ConnectionRecord {
                            socket: socket.clone(),
                        },
                    );
                    (socket, None)
                }
                Some(record) => {
                    let existing = record.socket.clone();
                    if Inner::tie_key(inner, &socket) < Inner::tie_key(inner, &existing) {
                        record.socket = socket.clone();
                        (socket, Some(existing))
                    } else {
                        (existing, Some(socket))
                    }
                }
            }
        };

        if let Some(loser) = loser {
            info!(
                "duplicate connection with {}; draining the loser",
                device.short()
            );
            Inner::migrate_and_drain(inner, loser, winner.clone());
        }
        winner
    }

    /// Deterministic ordering key shared by both endpoints: exporter
    /// token, then the ordered device-id pair
    fn tie_key(inner: &Arc<Inner>, socket: &MultiplexedSocket) -> Vec<u8> {
        let own = inner.config.identity.device_id();
        let peer = socket.device_id();
        let (lo, hi) = if own <= peer { (own, peer) } else { (peer, own) };
        let mut key = socket.tie_break().to_vec();
        key.extend_from_slice(lo.as_bytes());
        key.extend_from_slice(hi.as_bytes());
        key
    }

    fn migrate_and_drain(inner: &Arc<Inner>, loser: MultiplexedSocket, winner: MultiplexedSocket) {
        // Opens not yet acked migrate to the winner; acked channels are
        // committed and hold the loser open until they close
        for pending in loser.take_pending_opens() {
            let winner = winner.clone();
            Inner::spawn_tracked(inner, async move {
                let result = winner.open_channel(&pending.name).await;
                pending.tx.send(result).ok();
            });
        }
        if loser.channel_count() == 0 {
            loser.shutdown_with(Error::Duplicate);
        } else {
            inner.draining.lock().unwrap().push(loser);
        }
    }

    fn make_socket(
        inner: &Arc<Inner>,
        tls: TlsSession<IceStream>,
        initiator: bool,
    ) -> MultiplexedSocket {
        let device = tls.peer_id;
        let hooks = MuxHooks {
            on_channel_request: Some({
                let inner = inner.clone();
                Arc::new(move |cert: &[u8], name: &str| {
                    let hook = inner.hooks.lock().unwrap().channel_request.clone();
                    match hook {
                        Some(hook) => hook(cert, name),
                        None => true,
                    }
                })
            }),
            on_channel_opened: Some({
                let inner = inner.clone();
                Arc::new(move |channel: Arc<ChannelSocket>| {
                    let hook = inner.hooks.lock().unwrap().connection_ready.clone();
                    if let Some(hook) = hook {
                        let name = channel.name().to_string();
                        hook(&device, &name, channel);
                    }
                })
            }),
            on_closed: Some({
                let inner = inner.clone();
                Arc::new(move |err: Error| {
                    Inner::handle_closed(&inner, device, err);
                })
            }),
            on_idle: Some({
                let inner = inner.clone();
                Arc::new(move || {
                    Inner::handle_idle(&inner, device);
                })
            }),
        };
        MultiplexedSocket::start(tls, initiator, inner.config.mux.clone(), hooks)
    }

    /// A socket died: drop its table entry and any dead drainers
    fn handle_closed(inner: &Arc<Inner>, device: DeviceId, err: Error) {
        info!("connection with {} ended: {}", device.short(), err);
        {
            let mut conns = inner.connections.lock().unwrap();
            if let Some(record) = conns.get(&device) {
                if record.socket.closed_reason().is_some() {
                    conns.remove(&device);
                }
            }
        }
        inner
            .draining
            .lock()
            .unwrap()
            .retain(|socket| socket.closed_reason().is_none());
    }

    /// A socket's last channel closed: tear it down unless something
    /// still references it
    fn handle_idle(inner: &Arc<Inner>, device: DeviceId) {
        let mut finished_drainers = Vec::new();
        {
            let mut draining = inner.draining.lock().unwrap();
            draining.retain(|socket| {
                if socket.channel_count() == 0 && socket.pending_open_count() == 0 {
                    finished_drainers.push(socket.clone());
                    false
                } else {
                    true
                }
            });
        }
        for socket in finished_drainers {
            socket.shutdown_with(Error::Duplicate);
        }

        let victim = {
            let pending = inner.pending.lock().unwrap();
            if pending.outbound.contains_key(&device) {
                None
            } else {
                let mut conns = inner.connections.lock().unwrap();
                match conns.get(&device) {
                    Some(record)
                        if record.socket.channel_count() == 0
                            && record.socket.pending_open_count() == 0 =>
                    {
                        let socket = record.socket.clone();
                        conns.remove(&device);
                        Some(socket)
                    }
                    _ => None,
                }
            }
        };
        if let Some(socket) = victim {
            debug!("last channel with {} closed; releasing socket", device.short());
            socket.shutdown();
        }
    }

    /// One rendezvous value arrived on our listen key
    fn handle_rendezvous(inner: &Arc<Inner>, from: DeviceId, value: Bytes) {
        if inner.closed.load(Ordering::SeqCst) {
            return;
        }
        let request = match PeerConnectionRequest::decode(&value) {
            Ok(request) => request,
            Err(e) => {
                warn!("malformed peer request from {}: {}", from.short(), e);
                return;
            }
        };

        if request.is_answer {
            let answer_tx = {
                let mut pending = inner.pending.lock().unwrap();
                pending
                    .outbound
                    .get_mut(&from)
                    .filter(|attempt| attempt.request_id == request.id)
                    .and_then(|attempt| attempt.answer_tx.take())
            };
            match answer_tx {
                Some(tx) => {
                    debug!("answer {:x} from {}", request.id, from.short());
                    tx.send(request).ok();
                }
                None => debug!("unexpected answer {:x} from {}", request.id, from.short()),
            }
            return;
        }

        let (ios_hook, ice_hook) = {
            let hooks = inner.hooks.lock().unwrap();
            (hooks.ios_connected.clone(), hooks.ice_request.clone())
        };
        if !request.conn_type.is_empty() {
            if let Some(hook) = ios_hook {
                if hook(&request.conn_type, &from) {
                    debug!(
                        "offer {:x} ({}) deferred to host wake flow",
                        request.id, request.conn_type
                    );
                    return;
                }
            }
        }
        if let Some(hook) = ice_hook {
            if !hook(&from) {
                debug!("offer {:x} from {} declined by policy", request.id, from.short());
                return;
            }
        }

        {
            let mut pending = inner.pending.lock().unwrap();
            if pending.inbound.contains_key(&(from, request.id)) {
                return;
            }
            pending.inbound.insert(
                (from, request.id),
                InboundAttempt {
                    started: Instant::now(),
                },
            );
        }

        let inner = inner.clone();
        Inner::spawn_tracked(&inner.clone(), async move {
            let id = request.id;
            let result = Inner::run_inbound_attempt(&inner, from, request).await;
            let started = {
                let mut pending = inner.pending.lock().unwrap();
                pending.inbound.remove(&(from, id)).map(|a| a.started)
            };
            match result {
                Ok(()) => info!(
                    "inbound connection with {} ready after {:?}",
                    from.short(),
                    started.map(|s| s.elapsed()).unwrap_or_default()
                ),
                Err(err) => warn!("inbound attempt from {} failed: {}", from.short(), err),
            }
        });
    }

    async fn run_inbound_attempt(
        inner: &Arc<Inner>,
        from: DeviceId,
        request: PeerConnectionRequest,
    ) -> Result<(), Error> {
        let remote = IceDescription::decode(&request.ice_msg).map_err(|_| Error::Malformed)?;
        let mut ice = IceSession::new(
            format!("in:{}:{:x}", from.short(), request.id),
            inner.config.ice_options(IceRole::Responder),
            inner.config.ice_engine.clone(),
        );
        let result = Inner::drive_inbound(inner, from, request.id, remote, &mut ice).await;
        if result.is_err() {
            ice.shutdown().await;
        }
        result
    }

    async fn drive_inbound(
        inner: &Arc<Inner>,
        from: DeviceId,
        request_id: u64,
        remote: IceDescription,
        ice: &mut IceSession,
    ) -> Result<(), Error> {
        let timeouts = &inner.config.timeouts;

        ice.initialize().await.map_err(Error::from)?;
        let answer = PeerConnectionRequest {
            id: request_id,
            ice_msg: ice.local_description().map_err(Error::from)?.encode(),
            is_answer: true,
            conn_type: String::new(),
        };
        let value = answer.encode().map_err(|_| Error::Malformed)?;
        inner
            .config
            .dht
            .put_encrypted(&listen_key(&from), &from, value)
            .await
            .map_err(|_| Error::DhtUnavailable)?;

        ice.start(remote).map_err(Error::from)?;
        match ice.wait_for_negotiation(timeouts.ice_negotiation).await {
            NegotiationStatus::Running => {}
            NegotiationStatus::Failed => return Err(Error::IceNegotiationFailed),
            NegotiationStatus::TimedOut => return Err(Error::Timeout),
        }

        let stream = ice.take_reliable_stream().map_err(Error::from)?;
        let tls = timeout(
            timeouts.tls_handshake,
            accept_tls(&inner.config.identity, inner.config.cert_store.clone(), stream),
        )
        .await
        .map_err(|_| Error::Timeout)??;

        // The answering device must be the one that sent the offer
        if tls.peer_id != from {
            return Err(Error::PeerIdentity);
        }

        Inner::register_connection(inner, Inner::make_socket(inner, tls, false));
        Ok(())
    }
}
