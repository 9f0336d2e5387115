//! Tether node binary.
//!
//! Wires two connection managers over the in-process rendezvous bus
//! and the host-candidate ICE engine, then opens a channel and echoes
//! traffic across it. The full pipeline runs for real: offer/answer
//! exchange, candidate checks over loopback TCP, the pinned TLS
//! handshake, and the multiplexed socket.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::oneshot;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tether_manager::{
    AllowAllStore, ChannelSocket, ConnectionManager, DeviceIdentity, HostEngine, ManagerConfig,
    MemoryDhtBus,
};

mod config;

use config::NodeConfig;

/// Tether connectivity node (loopback demo)
#[derive(Parser, Debug)]
#[command(name = "tether-node", version, about = "Authenticated p2p channels over DHT + ICE + TLS")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long, default_value = "tether.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config
    #[arg(long)]
    log_level: Option<String>,

    /// Channel name to open
    #[arg(long, default_value = "demo")]
    channel: String,

    /// Message to send across the channel
    #[arg(long, default_value = "hello from tether")]
    message: String,

    /// How many echo round trips to run
    #[arg(long, default_value = "3")]
    count: u32,

    /// Deadline for the whole connect pipeline, e.g. 10s
    #[arg(long, default_value = "10s")]
    connect_timeout: humantime::Duration,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let node_config = NodeConfig::load_from_file(&args.config)?;
    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| node_config.log_level.clone());
    init_logging(&level);

    run_demo(args, node_config).await
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_manager(
    dht_bus: &Arc<MemoryDhtBus>,
    engine: Arc<HostEngine>,
    node_config: &NodeConfig,
) -> Result<(ConnectionManager, Vec<u8>)> {
    let identity = DeviceIdentity::generate()
        .map_err(|e| anyhow::anyhow!("identity generation failed: {e}"))?;
    let pk_der = identity.public_key_der();
    let dht = dht_bus.handle(identity.device_id());

    let mut config = ManagerConfig::new(
        identity,
        Arc::new(dht),
        Arc::new(AllowAllStore),
        engine,
    );
    config.stun_enabled = node_config.stun_enabled;
    config.stun_servers = node_config.stun_servers.clone();
    config.turn_enabled = node_config.turn_enabled;
    if node_config.turn_enabled {
        config.turn_servers = vec![tether_manager::TurnServer {
            uri: node_config.turn_server.clone(),
            username: node_config.turn_username.clone(),
            password: node_config.turn_password.clone(),
            realm: node_config.turn_realm.clone(),
        }];
    }
    config.mux.beacon_interval = Duration::from_secs(node_config.beacon_interval_secs);

    Ok((ConnectionManager::new(config), pk_der))
}

async fn run_demo(args: Args, node_config: NodeConfig) -> Result<()> {
    let dht_bus = MemoryDhtBus::new();
    let engine = Arc::new(HostEngine::new());

    let (alice, alice_pk) = build_manager(&dht_bus, engine.clone(), &node_config)?;
    let (bob, bob_pk) = build_manager(&dht_bus, engine, &node_config)?;
    alice.on_dht_connected(&alice_pk);
    bob.on_dht_connected(&bob_pk);

    info!("node A is {}", alice.device_id());
    info!("node B is {}", bob.device_id());

    // B echoes every channel opened towards it
    bob.on_connection_ready(Arc::new(|device, name, channel| {
        info!("B: channel \"{}\" from {} ready", name, device);
        tokio::spawn(echo_loop(channel));
    }));

    let (tx, rx) = oneshot::channel();
    alice.connect_device(
        bob.device_id(),
        &args.channel,
        Box::new(move |channel, err| {
            tx.send((channel, err)).ok();
        }),
    );
    let (channel, err) = tokio::time::timeout(*args.connect_timeout, rx)
        .await
        .context("connect timed out")?
        .context("connect callback dropped")?;
    let channel = match channel {
        Some(channel) => channel,
        None => anyhow::bail!("connect failed: {}", err.map(|e| e.to_string()).unwrap_or_default()),
    };
    info!("A: channel \"{}\" open (id {})", channel.name(), channel.id());

    for round in 1..=args.count {
        let started = Instant::now();
        channel
            .write(args.message.as_bytes())
            .await
            .map_err(|e| anyhow::anyhow!("write failed: {e}"))?;

        let mut buf = vec![0u8; args.message.len()];
        let mut read = 0;
        while read < buf.len() {
            let n = channel
                .read(&mut buf[read..])
                .await
                .map_err(|e| anyhow::anyhow!("read failed: {e}"))?;
            if n == 0 {
                anyhow::bail!("channel closed mid-echo");
            }
            read += n;
        }
        info!(
            "round {}/{}: echoed {} bytes in {:?}",
            round,
            args.count,
            read,
            started.elapsed()
        );
    }

    alice.monitor();
    channel.close();
    alice.shutdown();
    bob.shutdown();
    Ok(())
}

async fn echo_loop(channel: Arc<ChannelSocket>) {
    let mut buf = [0u8; 4096];
    loop {
        match channel.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = channel.write(&buf[..n]).await {
                    warn!("echo write failed: {}", e);
                    break;
                }
            }
            Err(e) => {
                warn!("echo read failed: {}", e);
                break;
            }
        }
    }
}
