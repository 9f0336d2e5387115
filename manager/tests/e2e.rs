//! End-to-end connection manager scenarios over the in-memory DHT bus
//! and ICE engine.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use tether_manager::{
    AllowAllStore, ChannelSocket, ConnectOpts, ConnectionManager, DeviceId, DeviceIdentity, Error,
    ManagerConfig, MemoryDhtBus, MemoryEngine, MemoryIceBus, Timeouts,
};

struct World {
    dht: Arc<tether_manager::MemoryDhtBus>,
    ice: Arc<tether_manager::MemoryIceBus>,
}

impl World {
    fn new() -> Self {
        Self {
            dht: MemoryDhtBus::new(),
            ice: MemoryIceBus::new(),
        }
    }

    fn node(&self, timeouts: Timeouts) -> Node {
        let identity = DeviceIdentity::generate().unwrap();
        let device_id = identity.device_id();
        let pk_der = identity.public_key_der();

        let dht = self.dht.handle(device_id);
        let engine = MemoryEngine::new(self.ice.clone());
        let mut config = ManagerConfig::new(
            identity,
            Arc::new(dht),
            Arc::new(AllowAllStore),
            Arc::new(engine),
        );
        config.timeouts = timeouts;

        let manager = ConnectionManager::new(config);
        manager.on_dht_connected(&pk_der);
        Node {
            manager,
            device_id,
            pk_der,
        }
    }
}

struct Node {
    manager: ConnectionManager,
    device_id: DeviceId,
    pk_der: Vec<u8>,
}

fn fast_timeouts() -> Timeouts {
    Timeouts {
        dht_answer: Duration::from_secs(5),
        ice_negotiation: Duration::from_secs(5),
        tls_handshake: Duration::from_secs(5),
    }
}

async fn connect(
    manager: &ConnectionManager,
    device: DeviceId,
    name: &str,
) -> Result<Arc<ChannelSocket>, Error> {
    connect_with(manager, device, name, ConnectOpts::default()).await
}

async fn connect_with(
    manager: &ConnectionManager,
    device: DeviceId,
    name: &str,
    opts: ConnectOpts,
) -> Result<Arc<ChannelSocket>, Error> {
    let (tx, rx) = oneshot::channel();
    manager.connect_device_with(
        device,
        name,
        opts,
        Box::new(move |channel, err| {
            tx.send((channel, err)).ok();
        }),
    );
    let (channel, err) = timeout(Duration::from_secs(10), rx)
        .await
        .expect("connect callback never fired")
        .unwrap();
    match channel {
        Some(channel) => Ok(channel),
        None => Err(err.expect("callback carried neither channel nor error")),
    }
}

/// Scenario 1: two managers over a shared DHT; A opens "git" on B,
/// policy hooks fire, bytes round-trip
#[tokio::test]
async fn test_simple_connect() {
    let world = World::new();
    let a = world.node(fast_timeouts());
    let b = world.node(fast_timeouts());

    let ice_requests = Arc::new(AtomicUsize::new(0));
    let channel_names = Arc::new(std::sync::Mutex::new(Vec::new()));
    let (ready_tx, mut ready_rx) = mpsc::unbounded_channel();

    b.manager.on_ice_request({
        let ice_requests = ice_requests.clone();
        Arc::new(move |_device| {
            ice_requests.fetch_add(1, Ordering::SeqCst);
            true
        })
    });
    b.manager.on_channel_request({
        let channel_names = channel_names.clone();
        Arc::new(move |_cert, name| {
            channel_names.lock().unwrap().push(name.to_string());
            true
        })
    });
    b.manager.on_connection_ready(Arc::new(move |device, name, channel| {
        ready_tx.send((*device, name.to_string(), channel)).ok();
    }));

    let channel = connect(&a.manager, b.device_id, "git").await.unwrap();
    assert_eq!(channel.name(), "git");

    let (from, name, remote) = timeout(Duration::from_secs(5), ready_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(from, a.device_id);
    assert_eq!(name, "git");
    assert_eq!(ice_requests.load(Ordering::SeqCst), 1);
    assert_eq!(channel_names.lock().unwrap().as_slice(), &["git".to_string()]);

    channel.write(b"hello").await.unwrap();
    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(5), remote.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"hello");

    assert_eq!(a.manager.active_sockets(), 1);
    assert_eq!(b.manager.active_sockets(), 1);
}

/// Scenario 2: a second channel reuses the existing connection
#[tokio::test]
async fn test_channel_reuse() {
    let world = World::new();
    let a = world.node(fast_timeouts());
    let b = world.node(fast_timeouts());

    let _first = connect(&a.manager, b.device_id, "git").await.unwrap();
    assert_eq!(a.manager.active_sockets(), 1);

    let second = connect(&a.manager, b.device_id, "git2").await.unwrap();
    assert_eq!(second.name(), "git2");
    assert_eq!(a.manager.active_sockets(), 1);
    assert_eq!(b.manager.active_sockets(), 1);
}

/// Scenario 3: simultaneous connect in both directions; both callbacks
/// succeed and exactly one connection survives per side
#[tokio::test]
async fn test_simultaneous_connect() {
    let world = World::new();
    let a = world.node(fast_timeouts());
    let b = world.node(fast_timeouts());

    let (from_a, from_b) = tokio::join!(
        connect(&a.manager, b.device_id, "sync"),
        connect(&b.manager, a.device_id, "sync"),
    );
    let from_a = from_a.unwrap();
    let from_b = from_b.unwrap();

    from_a.write(b"ping").await.unwrap();
    from_b.write(b"pong").await.unwrap();

    // Losing connections drain once their channels close; the live
    // table converges to one entry on each side
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if a.manager.active_sockets() == 1 && b.manager.active_sockets() == 1 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "connection tables never converged"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Scenario 4: the answer never arrives; the callback times out and
/// both tables end up empty
#[tokio::test]
async fn test_answer_timeout() {
    let world = World::new();
    let a = world.node(Timeouts {
        dht_answer: Duration::from_millis(300),
        ..fast_timeouts()
    });
    // B never comes online; the offer lands on an unwatched key
    let ghost = DeviceIdentity::generate().unwrap().device_id();

    let started = tokio::time::Instant::now();
    let result = connect(&a.manager, ghost, "git").await;
    assert_eq!(result.unwrap_err(), Error::Timeout);
    assert!(started.elapsed() >= Duration::from_millis(300));

    assert!(!a.manager.is_connecting(&ghost, "git"));
    assert_eq!(a.manager.active_sockets(), 0);
}

/// Scenario 5: the responder answers for a key whose identity it does
/// not hold; the initiator aborts with a peer-identity failure
#[tokio::test]
async fn test_peer_identity_mismatch() {
    let world = World::new();
    let a = world.node(fast_timeouts());
    let b = world.node(fast_timeouts());

    // B answers offers addressed to a device it has no key for
    let imposter_target = DeviceIdentity::generate().unwrap();
    b.manager.on_dht_connected(&imposter_target.public_key_der());

    let result = connect(&a.manager, imposter_target.device_id(), "git").await;
    assert_eq!(result.unwrap_err(), Error::PeerIdentity);
    assert_eq!(a.manager.active_sockets(), 0);
}

/// Scenario 6: shutdown cancels in-flight connects and fails open
/// channels without leaking work
#[tokio::test]
async fn test_graceful_shutdown() {
    let world = World::new();
    let a = world.node(fast_timeouts());
    let b = world.node(fast_timeouts());

    let one = connect(&a.manager, b.device_id, "one").await.unwrap();
    let two = connect(&a.manager, b.device_id, "two").await.unwrap();
    assert_eq!(a.manager.active_sockets(), 1);

    // Park a read on an open channel
    let reader = tokio::spawn(async move {
        let mut buf = [0u8; 8];
        one.read(&mut buf).await
    });

    // Park a connect towards a device that will never answer
    let ghost = DeviceIdentity::generate().unwrap().device_id();
    let (pending_tx, pending_rx) = oneshot::channel();
    a.manager.connect_device(
        ghost,
        "never",
        Box::new(move |channel, err| {
            pending_tx.send((channel.is_some(), err)).ok();
        }),
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(a.manager.is_connecting(&ghost, "never"));

    a.manager.shutdown();

    let (got_channel, err) = timeout(Duration::from_secs(2), pending_rx)
        .await
        .expect("pending connect was never resolved")
        .unwrap();
    assert!(!got_channel);
    assert_eq!(err, Some(Error::Cancelled));

    let read_result = timeout(Duration::from_secs(2), reader)
        .await
        .expect("in-flight read never returned")
        .unwrap();
    match read_result {
        Ok(0) | Err(Error::ChannelClosed) | Err(Error::Cancelled) => {}
        other => panic!("unexpected read outcome: {other:?}"),
    }

    assert_eq!(a.manager.active_sockets(), 0);
    assert!(matches!(two.write(b"x").await, Err(_)));
}

/// Shutdown landing after the attempt resolved but while the waiter's
/// channel open is still awaiting its ack: the waiter settles promptly
/// instead of running against the torn-down socket for the full open
/// timeout
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_during_waiter_channel_open() {
    let world = World::new();
    let a = world.node(fast_timeouts());
    let b = world.node(fast_timeouts());

    // Hold the accept back long enough for shutdown to land first
    b.manager.on_channel_request(Arc::new(|_cert, _name| {
        std::thread::sleep(Duration::from_millis(500));
        true
    }));

    let (tx, rx) = oneshot::channel();
    a.manager.connect_device(
        b.device_id,
        "slow",
        Box::new(move |channel, err| {
            tx.send((channel.is_some(), err)).ok();
        }),
    );

    // Wait until the attempt has moved into the connection table; the
    // waiter is now inside its spawned channel open, gated on B's hook
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while a.manager.is_connecting(&b.device_id, "slow") || a.manager.active_sockets() == 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "attempt never resolved"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    a.manager.shutdown();

    // Well inside the 20 s open deadline the waiter is gone: either its
    // callback fired, or the aborted task dropped the sender
    let outcome = timeout(Duration::from_secs(5), rx)
        .await
        .expect("waiter leaked past shutdown");
    if let Ok((got_channel, err)) = outcome {
        assert!(got_channel != err.is_some());
    }
    assert_eq!(a.manager.active_sockets(), 0);
}

/// Contradictory socket flags are rejected at the API boundary
#[tokio::test]
async fn test_invalid_flag_combination() {
    let world = World::new();
    let a = world.node(fast_timeouts());
    let b = world.node(fast_timeouts());

    let result = connect_with(
        &a.manager,
        b.device_id,
        "git",
        ConnectOpts {
            no_new_socket: true,
            force_new_socket: true,
            conn_type: String::new(),
        },
    )
    .await;
    assert_eq!(result.unwrap_err(), Error::Malformed);
}

/// `no_new_socket` fails fast when no connection exists
#[tokio::test]
async fn test_no_new_socket_without_connection() {
    let world = World::new();
    let a = world.node(fast_timeouts());
    let b = world.node(fast_timeouts());

    let result = connect_with(
        &a.manager,
        b.device_id,
        "git",
        ConnectOpts {
            no_new_socket: true,
            ..Default::default()
        },
    )
    .await;
    assert_eq!(result.unwrap_err(), Error::NoSocket);
    assert_eq!(a.manager.active_sockets(), 0);
}

/// Closing by peer URI tears down the connection and cancels waiters
#[tokio::test]
async fn test_close_connections_with_uri() {
    let world = World::new();
    let a = world.node(fast_timeouts());
    let b = world.node(fast_timeouts());

    let channel = connect(&a.manager, b.device_id, "git").await.unwrap();
    assert_eq!(a.manager.active_sockets(), 1);

    let uri = format!("tether://device/{}", b.device_id);
    a.manager.close_connections_with(&uri);
    assert_eq!(a.manager.active_sockets(), 0);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if channel.write(b"x").await.is_err() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Inbound offers can be declined by the ICE policy hook
#[tokio::test]
async fn test_ice_request_declined() {
    let world = World::new();
    let a = world.node(Timeouts {
        dht_answer: Duration::from_millis(300),
        ..fast_timeouts()
    });
    let b = world.node(fast_timeouts());

    b.manager.on_ice_request(Arc::new(|_device| false));

    let result = connect(&a.manager, b.device_id, "git").await;
    // The offer is ignored, so the initiator waits out the answer
    assert_eq!(result.unwrap_err(), Error::Timeout);
    assert_eq!(b.manager.active_sockets(), 0);
}

/// A rejected channel surfaces `peer-refused` while the connection
/// itself still comes up
#[tokio::test]
async fn test_channel_request_refused() {
    let world = World::new();
    let a = world.node(fast_timeouts());
    let b = world.node(fast_timeouts());

    b.manager.on_channel_request(Arc::new(|_cert, name| name != "blocked"));

    let result = connect(&a.manager, b.device_id, "blocked").await;
    assert_eq!(result.unwrap_err(), Error::PeerRefused);

    // The negotiated socket is still usable for an allowed name
    let ok = connect(&a.manager, b.device_id, "allowed").await.unwrap();
    assert_eq!(ok.name(), "allowed");
}

/// Wake-type offers are deferred when the host claims them
#[tokio::test]
async fn test_ios_connected_defers_offer() {
    let world = World::new();
    let a = world.node(Timeouts {
        dht_answer: Duration::from_millis(300),
        ..fast_timeouts()
    });
    let b = world.node(fast_timeouts());

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    b.manager.on_ios_connected({
        let seen = seen.clone();
        Arc::new(move |conn_type, _peer| {
            seen.lock().unwrap().push(conn_type.to_string());
            true
        })
    });

    let result = connect_with(
        &a.manager,
        b.device_id,
        "git",
        ConnectOpts {
            conn_type: "push".to_string(),
            ..Default::default()
        },
    )
    .await;
    assert_eq!(result.unwrap_err(), Error::Timeout);
    assert_eq!(seen.lock().unwrap().as_slice(), &["push".to_string()]);
}

/// The listen key is derived from the same public key the identity
/// hashes into its device id
#[tokio::test]
async fn test_listen_key_follows_public_key() {
    let world = World::new();
    let a = world.node(fast_timeouts());
    assert_eq!(DeviceId::from_public_key_der(&a.pk_der), a.device_id);
}
