//! Multiplexed socket: many named channels over one authenticated
//! stream.
//!
//! One reader task deserializes frames and dispatches to per-channel
//! buffers; one writer task drains a queue guarded by a byte budget.
//! Channel 0 carries control payloads (open/accept/reject/close,
//! beacons, version). Control handling runs on the reader task and
//! never blocks on application callbacks; policy decisions are
//! dispatched to the runtime.
//!
//! Flow control: per-channel read buffers are capped at 64 KiB; when a
//! buffer is full the reader stops pulling from the TLS stream, so a
//! slow channel head-of-line blocks its connection. Writers block once
//! 256 KiB of encoded frames are queued.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use tether_wire::{ControlMsg, DeviceId, Frame, FrameDecoder, WireError, MAX_NAME_LEN};

use crate::channel::ChannelSocket;
use crate::tls::TlsSession;
use crate::Error;

/// Protocol version announced on session start
pub const MUX_PROTOCOL_VERSION: u32 = 1;

/// Data is chunked into frames of at most this size
pub(crate) const DATA_CHUNK: usize = 16 * 1024;

/// Per-channel buffered frames; with `DATA_CHUNK` this caps the read
/// buffer at 64 KiB
const CHANNEL_BUFFER_FRAMES: usize = 4;

/// Accepts or declines a remote channel-open: (peer cert DER, name)
pub type ChannelRequestHook = Arc<dyn Fn(&[u8], &str) -> bool + Send + Sync>;

/// Receives a remotely-opened channel once accepted
pub type ChannelOpenedHook = Arc<dyn Fn(Arc<ChannelSocket>) + Send + Sync>;

/// Observes the terminal failure of the socket
pub type SocketClosedHook = Arc<dyn Fn(Error) + Send + Sync>;

/// Observes the last channel closing while the socket stays up
pub type SocketIdleHook = Arc<dyn Fn() + Send + Sync>;

/// Callbacks wired in by the connection manager before start
#[derive(Clone, Default)]
pub struct MuxHooks {
    /// Gate for remote channel opens; absent means accept
    pub on_channel_request: Option<ChannelRequestHook>,
    /// Delivery of accepted remote channels
    pub on_channel_opened: Option<ChannelOpenedHook>,
    /// Terminal failure notification
    pub on_closed: Option<SocketClosedHook>,
    /// Channel count returned to zero
    pub on_idle: Option<SocketIdleHook>,
}

/// Tunables for one multiplexed socket
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Interval between liveness beacons
    pub beacon_interval: Duration,
    /// How long to wait for a beacon ack
    pub beacon_ack_timeout: Duration,
    /// Consecutive missed acks before the peer counts as unreachable
    pub beacon_max_misses: u32,
    /// Deadline for the channel-open ack
    pub open_timeout: Duration,
    /// Encoded bytes allowed in the outbound queue before writers block
    pub write_budget: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            beacon_interval: Duration::from_secs(25),
            beacon_ack_timeout: Duration::from_secs(10),
            beacon_max_misses: 3,
            open_timeout: Duration::from_secs(20),
            write_budget: 256 * 1024,
        }
    }
}

/// A local open waiting for the remote accept/reject
pub struct PendingOpen {
    /// Requested channel name
    pub name: String,
    /// Waiter resolved with the channel or the failure
    pub tx: oneshot::Sender<Result<Arc<ChannelSocket>, Error>>,
}

pub(crate) struct ChannelEntry {
    name: String,
    data_tx: mpsc::Sender<Bytes>,
}

pub(crate) struct MuxState {
    channels: HashMap<u16, ChannelEntry>,
    pending_open: HashMap<u16, PendingOpen>,
    next_id: u32,
    closed: Option<Error>,
    peer_version: Option<u32>,
}

#[derive(Default)]
pub(crate) struct Stats {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    frames_in: AtomicU64,
    frames_out: AtomicU64,
}

struct WriteCmd {
    bytes: Bytes,
    permit: Option<OwnedSemaphorePermit>,
}

pub(crate) struct Shared {
    device: DeviceId,
    peer_cert: Vec<u8>,
    tie_break: [u8; 32],
    initiator: bool,
    cfg: MuxConfig,
    created: Instant,
    writer_tx: mpsc::UnboundedSender<WriteCmd>,
    budget: Arc<Semaphore>,
    state: Mutex<MuxState>,
    hooks: MuxHooks,
    beacon_kick: Notify,
    ack_tx: Mutex<Option<mpsc::UnboundedSender<()>>>,
    closed_tx: watch::Sender<bool>,
    stats: Stats,
}

/// One authenticated peer connection carrying many named channels
#[derive(Clone)]
pub struct MultiplexedSocket {
    shared: Arc<Shared>,
}

impl MultiplexedSocket {
    /// Wrap an authenticated session and start the reader, writer, and
    /// beacon tasks
    pub fn start<S>(tls: TlsSession<S>, initiator: bool, cfg: MuxConfig, hooks: MuxHooks) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let TlsSession {
            stream,
            peer_cert,
            peer_id,
            tie_break,
        } = tls;
        let (read_half, write_half) = tokio::io::split(stream);

        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            device: peer_id,
            peer_cert,
            tie_break,
            initiator,
            budget: Arc::new(Semaphore::new(cfg.write_budget)),
            cfg,
            created: Instant::now(),
            writer_tx,
            state: Mutex::new(MuxState {
                channels: HashMap::new(),
                pending_open: HashMap::new(),
                next_id: if initiator { 1 } else { 2 },
                closed: None,
                peer_version: None,
            }),
            hooks,
            beacon_kick: Notify::new(),
            ack_tx: Mutex::new(Some(ack_tx)),
            closed_tx,
            stats: Stats::default(),
        });

        tokio::spawn(writer_task(write_half, writer_rx, shared.clone(), closed_rx.clone()));
        tokio::spawn(reader_task(read_half, shared.clone(), closed_rx.clone()));
        tokio::spawn(beacon_task(shared.clone(), ack_rx, closed_rx));

        let socket = Self { shared };
        socket
            .send_control(ControlMsg::Version {
                version: MUX_PROTOCOL_VERSION,
            })
            .ok();
        socket
    }

    /// Remote device id
    pub fn device_id(&self) -> DeviceId {
        self.shared.device
    }

    /// Remote certificate in DER form
    pub fn peer_certificate(&self) -> &[u8] {
        &self.shared.peer_cert
    }

    /// Exporter token used for the simultaneous-connect tie-break
    pub fn tie_break(&self) -> [u8; 32] {
        self.shared.tie_break
    }

    /// Whether this side ran the TLS client role
    pub fn is_initiator(&self) -> bool {
        self.shared.initiator
    }

    /// Protocol version announced by the peer, once seen
    pub fn peer_version(&self) -> Option<u32> {
        self.shared.state.lock().unwrap().peer_version
    }

    /// Number of live channels
    pub fn channel_count(&self) -> usize {
        self.shared.state.lock().unwrap().channels.len()
    }

    /// Number of opens still waiting for an ack
    pub fn pending_open_count(&self) -> usize {
        self.shared.state.lock().unwrap().pending_open.len()
    }

    /// Terminal failure reason, once the socket is dead
    pub fn closed_reason(&self) -> Option<Error> {
        self.shared.state.lock().unwrap().closed
    }

    /// One log line per connection for `monitor()`
    pub fn describe(&self) -> String {
        let state = self.shared.state.lock().unwrap();
        let names: Vec<&str> = state.channels.values().map(|e| e.name.as_str()).collect();
        format!(
            "device={} channels={:?} age={:?} in={}B/{}f out={}B/{}f",
            self.shared.device.short(),
            names,
            self.shared.created.elapsed(),
            self.shared.stats.bytes_in.load(Ordering::Relaxed),
            self.shared.stats.frames_in.load(Ordering::Relaxed),
            self.shared.stats.bytes_out.load(Ordering::Relaxed),
            self.shared.stats.frames_out.load(Ordering::Relaxed),
        )
    }

    /// Open a named channel and wait for the remote ack
    pub async fn open_channel(&self, name: &str) -> Result<Arc<ChannelSocket>, Error> {
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(Error::Malformed);
        }

        let (tx, rx) = oneshot::channel();
        let id = {
            let mut state = self.shared.state.lock().unwrap();
            if let Some(err) = state.closed {
                return Err(err);
            }
            if state.next_id > u16::MAX as u32 {
                return Err(Error::NoSocket);
            }
            let id = state.next_id as u16;
            state.next_id += 2;
            state.pending_open.insert(
                id,
                PendingOpen {
                    name: name.to_string(),
                    tx,
                },
            );
            id
        };

        if let Err(e) = self.send_control(ControlMsg::Open {
            channel: id,
            name: name.to_string(),
        }) {
            self.shared.state.lock().unwrap().pending_open.remove(&id);
            return Err(e);
        }

        match timeout(self.shared.cfg.open_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.closed_reason().unwrap_or(Error::Cancelled)),
            Err(_) => {
                self.shared.state.lock().unwrap().pending_open.remove(&id);
                Err(Error::Timeout)
            }
        }
    }

    /// Take every open still waiting for an ack, for migration to a
    /// surviving connection
    pub fn take_pending_opens(&self) -> Vec<PendingOpen> {
        let mut state = self.shared.state.lock().unwrap();
        state.pending_open.drain().map(|(_, p)| p).collect()
    }

    /// Request an immediate beacon round
    pub fn trigger_beacon(&self) {
        self.shared.beacon_kick.notify_one();
    }

    /// Close every channel and tear the socket down with the given
    /// reason
    pub fn shutdown_with(&self, err: Error) {
        let ids: Vec<u16> = {
            let state = self.shared.state.lock().unwrap();
            state.channels.keys().copied().collect()
        };
        for id in ids {
            self.send_control(ControlMsg::Close { channel: id }).ok();
        }
        terminate(&self.shared, err, false);
    }

    /// Graceful local teardown
    pub fn shutdown(&self) {
        self.shutdown_with(Error::ChannelClosed);
    }

    fn send_control(&self, msg: ControlMsg) -> Result<(), Error> {
        send_control(&self.shared, msg)
    }
}

fn send_control(shared: &Arc<Shared>, msg: ControlMsg) -> Result<(), Error> {
    let data = msg.encode()?;
    let bytes = Frame::control(data).encode()?;
    shared
        .writer_tx
        .send(WriteCmd {
            bytes,
            permit: None,
        })
        .map_err(|_| shared.state.lock().unwrap().closed.unwrap_or(Error::ChannelClosed))
}

/// Write channel data, chunked and budget-limited
pub(crate) async fn write_channel(shared: &Arc<Shared>, id: u16, data: &[u8]) -> Result<(), Error> {
    if data.is_empty() {
        return Ok(());
    }
    for chunk in data.chunks(DATA_CHUNK) {
        {
            let state = shared.state.lock().unwrap();
            if let Some(err) = state.closed {
                return Err(err);
            }
            if !state.channels.contains_key(&id) {
                return Err(Error::ChannelClosed);
            }
        }
        let permit = shared
            .budget
            .clone()
            .acquire_many_owned(chunk.len() as u32)
            .await
            .map_err(|_| {
                shared
                    .state
                    .lock()
                    .unwrap()
                    .closed
                    .unwrap_or(Error::ChannelClosed)
            })?;
        let bytes = Frame::data(id, Bytes::copy_from_slice(chunk)).encode()?;
        shared
            .writer_tx
            .send(WriteCmd {
                bytes,
                permit: Some(permit),
            })
            .map_err(|_| {
                shared
                    .state
                    .lock()
                    .unwrap()
                    .closed
                    .unwrap_or(Error::ChannelClosed)
            })?;
    }
    Ok(())
}

/// Local close of one channel: drop the entry, notify the peer, fire
/// the idle hook when this was the last one
pub(crate) fn close_channel(shared: &Arc<Shared>, id: u16) {
    let (existed, now_idle) = {
        let mut state = shared.state.lock().unwrap();
        if state.closed.is_some() {
            return;
        }
        let existed = state.channels.remove(&id).is_some();
        (existed, existed && state.channels.is_empty())
    };
    if existed {
        send_control(shared, ControlMsg::Close { channel: id }).ok();
        debug!("channel {} closed locally", id);
        if now_idle {
            // Invoked inline: close_channel holds no locks here, and the
            // caller may be outside the runtime
            if let Some(hook) = &shared.hooks.on_idle {
                hook();
            }
        }
    }
}

pub(crate) fn channel_closed_reason(shared: &Shared) -> Option<Error> {
    shared.state.lock().unwrap().closed
}

fn terminate(shared: &Arc<Shared>, err: Error, emit_hook: bool) {
    let pending = {
        let mut state = shared.state.lock().unwrap();
        if state.closed.is_some() {
            return;
        }
        state.closed = Some(err);
        // Dropping the senders lets channel readers drain and hit eof
        state.channels.clear();
        state
            .pending_open
            .drain()
            .map(|(_, p)| p)
            .collect::<Vec<_>>()
    };
    for open in pending {
        open.tx.send(Err(err)).ok();
    }
    shared.budget.close();
    shared.ack_tx.lock().unwrap().take();
    shared.closed_tx.send(true).ok();
    info!("socket to {} closed: {}", shared.device.short(), err);
    if emit_hook {
        if let Some(hook) = shared.hooks.on_closed.clone() {
            tokio::spawn(async move { hook(err) });
        }
    }
}

fn install_channel(shared: &Arc<Shared>, id: u16, name: &str) -> Option<Arc<ChannelSocket>> {
    let (data_tx, data_rx) = mpsc::channel(CHANNEL_BUFFER_FRAMES);
    let mut state = shared.state.lock().unwrap();
    if state.closed.is_some() || state.channels.contains_key(&id) {
        return None;
    }
    state.channels.insert(
        id,
        ChannelEntry {
            name: name.to_string(),
            data_tx,
        },
    );
    drop(state);
    Some(Arc::new(ChannelSocket::new(
        shared.clone(),
        id,
        name.to_string(),
        data_rx,
    )))
}

async fn reader_task<R>(mut read_half: R, shared: Arc<Shared>, mut closed_rx: watch::Receiver<bool>)
where
    R: AsyncRead + Unpin,
{
    let mut decoder = FrameDecoder::new();
    let mut buf = BytesMut::with_capacity(64 * 1024);

    loop {
        loop {
            match decoder.decode(&mut buf) {
                Ok(Some(frame)) => {
                    shared.stats.frames_in.fetch_add(1, Ordering::Relaxed);
                    if handle_frame(&shared, frame).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("framing error from {}: {}", shared.device.short(), e);
                    terminate(&shared, Error::ProtocolError, true);
                    return;
                }
            }
        }

        tokio::select! {
            _ = closed_rx.changed() => return,
            read = read_half.read_buf(&mut buf) => match read {
                Ok(0) => {
                    debug!("stream from {} reached eof", shared.device.short());
                    terminate(&shared, Error::ChannelClosed, true);
                    return;
                }
                Ok(n) => {
                    shared.stats.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!("read error from {}: {}", shared.device.short(), e);
                    terminate(&shared, Error::ChannelClosed, true);
                    return;
                }
            }
        }
    }
}

async fn handle_frame(shared: &Arc<Shared>, frame: Frame) -> Result<(), ()> {
    if frame.is_control() {
        return handle_control(shared, frame);
    }

    let data_tx = {
        let state = shared.state.lock().unwrap();
        state.channels.get(&frame.channel).map(|e| e.data_tx.clone())
    };
    match data_tx {
        Some(tx) => {
            // A full buffer suspends the reader here: head-of-line
            // blocking by design
            if tx.send(frame.data).await.is_err() {
                // Receiver dropped without close; clean up our side
                close_channel(shared, frame.channel);
            }
        }
        None => {
            debug!("data for unknown channel {} dropped", frame.channel);
        }
    }
    Ok(())
}

fn handle_control(shared: &Arc<Shared>, frame: Frame) -> Result<(), ()> {
    let msg = match ControlMsg::decode(&frame.data) {
        Ok(msg) => msg,
        Err(WireError::Op(op)) if !frame.is_critical() => {
            debug!("ignoring unknown control op {}", op);
            return Ok(());
        }
        Err(e) => {
            warn!("bad control payload from {}: {}", shared.device.short(), e);
            terminate(shared, Error::ProtocolError, true);
            return Err(());
        }
    };

    match msg {
        ControlMsg::Open { channel, name } => {
            // Remote-initiated ids live in the opposite parity space
            let expected_odd = !shared.initiator;
            if channel == 0 || (channel % 2 == 1) != expected_odd {
                warn!("open with bad channel id {} from {}", channel, shared.device.short());
                terminate(shared, Error::ProtocolError, true);
                return Err(());
            }
            let socket = match install_channel(shared, channel, &name) {
                Some(socket) => socket,
                None => {
                    warn!("open for duplicate channel id {}", channel);
                    terminate(shared, Error::ProtocolError, true);
                    return Err(());
                }
            };
            // Policy and delivery run off the reader task
            let shared = shared.clone();
            tokio::spawn(async move {
                let allowed = shared
                    .hooks
                    .on_channel_request
                    .as_ref()
                    .map(|hook| hook(&shared.peer_cert, &name))
                    .unwrap_or(true);
                if allowed {
                    if send_control(&shared, ControlMsg::Accept { channel }).is_ok() {
                        debug!("channel {} \"{}\" accepted", channel, name);
                        if let Some(hook) = shared.hooks.on_channel_opened.clone() {
                            hook(socket);
                        }
                    }
                } else {
                    debug!("channel {} \"{}\" rejected by policy", channel, name);
                    // Dropping the socket after removing the entry keeps
                    // its Drop from emitting a Close for a dead id
                    shared.state.lock().unwrap().channels.remove(&channel);
                    drop(socket);
                    send_control(&shared, ControlMsg::Reject { channel }).ok();
                }
            });
        }
        ControlMsg::Accept { channel } => {
            let pending = {
                let mut state = shared.state.lock().unwrap();
                state.pending_open.remove(&channel)
            };
            if let Some(pending) = pending {
                match install_channel(shared, channel, &pending.name) {
                    Some(socket) => {
                        pending.tx.send(Ok(socket)).ok();
                    }
                    None => {
                        pending.tx.send(Err(Error::ProtocolError)).ok();
                    }
                }
            } else {
                debug!("accept for unknown pending channel {}", channel);
            }
        }
        ControlMsg::Reject { channel } => {
            let pending = {
                let mut state = shared.state.lock().unwrap();
                state.pending_open.remove(&channel)
            };
            if let Some(pending) = pending {
                pending.tx.send(Err(Error::PeerRefused)).ok();
            }
        }
        ControlMsg::Close { channel } => {
            let (existed, now_idle) = {
                let mut state = shared.state.lock().unwrap();
                let existed = state.channels.remove(&channel).is_some();
                (existed, existed && state.channels.is_empty())
            };
            if existed {
                debug!("channel {} closed by peer", channel);
                if now_idle {
                    if let Some(hook) = shared.hooks.on_idle.clone() {
                        tokio::spawn(async move { hook() });
                    }
                }
            }
        }
        ControlMsg::Beacon => {
            send_control(shared, ControlMsg::BeaconAck).ok();
        }
        ControlMsg::BeaconAck => {
            let ack_tx = shared.ack_tx.lock().unwrap().clone();
            if let Some(tx) = ack_tx {
                tx.send(()).ok();
            }
        }
        ControlMsg::Version { version } => {
            if version == 0 {
                terminate(shared, Error::ProtocolError, true);
                return Err(());
            }
            debug!("peer {} speaks mux version {}", shared.device.short(), version);
            shared.state.lock().unwrap().peer_version = Some(version);
        }
    }
    Ok(())
}

async fn writer_task<W>(
    mut write_half: W,
    mut rx: mpsc::UnboundedReceiver<WriteCmd>,
    shared: Arc<Shared>,
    mut closed_rx: watch::Receiver<bool>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let cmd = tokio::select! {
            _ = closed_rx.changed() => {
                // Flush whatever was queued (close notifications from a
                // graceful teardown) before shutting the stream down
                while let Ok(cmd) = rx.try_recv() {
                    if write_one(&mut write_half, &shared, cmd).await.is_err() {
                        break;
                    }
                }
                write_half.flush().await.ok();
                write_half.shutdown().await.ok();
                return;
            }
            cmd = rx.recv() => match cmd {
                Some(cmd) => cmd,
                None => return,
            },
        };

        if let Err(e) = write_one(&mut write_half, &shared, cmd).await {
            warn!("write to {} failed: {}", shared.device.short(), e);
            terminate(&shared, Error::ChannelClosed, true);
            return;
        }
        // Drain whatever queued up, then flush once
        loop {
            match rx.try_recv() {
                Ok(cmd) => {
                    if let Err(e) = write_one(&mut write_half, &shared, cmd).await {
                        warn!("write to {} failed: {}", shared.device.short(), e);
                        terminate(&shared, Error::ChannelClosed, true);
                        return;
                    }
                }
                Err(_) => break,
            }
        }
        if let Err(e) = write_half.flush().await {
            warn!("flush to {} failed: {}", shared.device.short(), e);
            terminate(&shared, Error::ChannelClosed, true);
            return;
        }
    }
}

async fn write_one<W>(
    write_half: &mut W,
    shared: &Arc<Shared>,
    cmd: WriteCmd,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_half.write_all(&cmd.bytes).await?;
    shared
        .stats
        .bytes_out
        .fetch_add(cmd.bytes.len() as u64, Ordering::Relaxed);
    shared.stats.frames_out.fetch_add(1, Ordering::Relaxed);
    drop(cmd.permit);
    Ok(())
}

async fn beacon_task(
    shared: Arc<Shared>,
    mut ack_rx: mpsc::UnboundedReceiver<()>,
    mut closed_rx: watch::Receiver<bool>,
) {
    let mut misses = 0u32;
    let mut ticker = tokio::time::interval_at(
        Instant::now() + shared.cfg.beacon_interval,
        shared.cfg.beacon_interval,
    );
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = closed_rx.changed() => return,
            _ = ticker.tick() => {}
            _ = shared.beacon_kick.notified() => {}
        }

        if send_control(&shared, ControlMsg::Beacon).is_err() {
            return;
        }
        match timeout(shared.cfg.beacon_ack_timeout, ack_rx.recv()).await {
            Ok(Some(())) => {
                misses = 0;
                // Acks may pile up after a kick; absorb extras
                while ack_rx.try_recv().is_ok() {}
            }
            Ok(None) => return,
            Err(_) => {
                misses += 1;
                warn!(
                    "beacon to {} unanswered ({}/{})",
                    shared.device.short(),
                    misses,
                    shared.cfg.beacon_max_misses
                );
                if misses >= shared.cfg.beacon_max_misses {
                    terminate(&shared, Error::PeerUnreachable, true);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
impl MultiplexedSocket {
    /// Move the id allocator, to exercise exhaustion without opening
    /// thirty thousand channels
    pub(crate) fn set_next_id_for_test(&self, next: u32) {
        self.shared.state.lock().unwrap().next_id = next;
    }
}
