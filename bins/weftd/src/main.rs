//! Weft Mesh VPN Daemon
//!
//! Wires the datapath to the real world: the TAP device, the UDP socket
//! set, TCP control connections, probe timers and the key-lifetime clock.
//! Everything runs on one cooperative reactor task; I/O tasks only shuttle
//! bytes into and out of channels.

mod config;

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use weft_core::{ConnHandle, Connection, Datapath, DatapathHooks, Node, NodeHandle};
use weft_network::tcp::{drain_frames, CONTROL_CHANNEL_DEPTH};
use weft_network::{
    ControlChannel, Datagram, FrameDecoder, ListenSocketSet, OsTap, TapDevice, VpnPacket,
};

use crate::config::{DaemonConfig, PeerConfig};

/// Weft mesh VPN daemon
#[derive(Parser)]
#[command(name = "weftd")]
#[command(author, version, about)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "/etc/weft/weftd.json")]
    config: PathBuf,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

type Dp = Datapath<ListenSocketSet, DaemonHooks>;

/// Datapath collaborators wired to daemon channels.
///
/// Routing decisions are queued and drained by the reactor after each
/// event, so the routing delegate can call back into the datapath without
/// re-entrancy.
struct DaemonHooks {
    routes: VecDeque<(NodeHandle, VpnPacket)>,
    device_tx: mpsc::Sender<VpnPacket>,
    rekey_wanted: bool,
    key_requests: Vec<NodeHandle>,
}

impl DatapathHooks for DaemonHooks {
    fn route(&mut self, from: NodeHandle, packet: &VpnPacket) {
        self.routes.push_back((from, packet.clone()));
    }

    fn regenerate_key(&mut self) {
        self.rekey_wanted = true;
    }

    fn send_req_key(&mut self, node: NodeHandle) {
        self.key_requests.push(node);
    }

    fn terminate_connection(&mut self, conn: ConnHandle) {
        warn!("Control connection {:?} closed after a failed write", conn);
    }

    fn write_packet(&mut self, packet: &VpnPacket) {
        if self.device_tx.try_send(packet.clone()).is_err() {
            debug!("Device queue full, dropping {} byte frame", packet.len());
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting weftd...");
    let config = DaemonConfig::load(&cli.config)?;
    run(config).await
}

async fn run(config: DaemonConfig) -> Result<()> {
    let (udp_tx, mut udp_rx) = mpsc::channel::<Datagram>(256);
    let (dev_in_tx, mut dev_in_rx) = mpsc::channel::<VpnPacket>(256);
    let (dev_out_tx, mut dev_out_rx) = mpsc::channel::<VpnPacket>(256);
    let (tcp_tx, mut tcp_rx) = mpsc::channel::<(ConnHandle, Vec<u8>)>(256);
    let (accept_tx, mut accept_rx) = mpsc::channel::<(SocketAddr, TcpStream)>(16);

    // UDP sockets
    let sockets = ListenSocketSet::bind(&config.listen, config.priority_inheritance)
        .await
        .context("binding UDP sockets")?;
    sockets.spawn_receivers(udp_tx);

    // TAP device plus its reader/writer tasks
    let tap = Arc::new(
        OsTap::create(config.tap.clone().into())
            .await
            .context("creating TAP device")?,
    );
    {
        let tap = tap.clone();
        tokio::spawn(async move {
            loop {
                match tap.read_packet().await {
                    Ok(packet) => {
                        if dev_in_tx.send(packet).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("TAP read error: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }
    {
        let tap = tap.clone();
        tokio::spawn(async move {
            while let Some(packet) = dev_out_rx.recv().await {
                if let Err(e) = tap.write_packet(&packet).await {
                    warn!("TAP write error: {}", e);
                }
            }
        });
    }

    // Datapath around the real seams
    let hooks = DaemonHooks {
        routes: VecDeque::new(),
        device_tx: dev_out_tx,
        rekey_wanted: false,
        key_requests: Vec::new(),
    };
    let mut dp = Datapath::new(config.datapath_config()?, sockets, hooks)?;

    // Static peer table; the configured key material is the keyring the
    // handshake layer would otherwise negotiate.
    let mut peers: Vec<(NodeHandle, PeerConfig)> = Vec::new();
    for peer in &config.peers {
        let mut node = Node::new(peer.name.clone(), peer.address.ip().to_string());
        node.address = Some(peer.address);
        node.tcp_only = peer.tcp_only;
        node.pmtu_discovery = peer.pmtu_discovery;
        let handle = dp.nodes.add(node);
        dp.nodes[handle].nexthop = Some(handle);
        dp.nodes[handle].via = Some(handle);
        dp.nodes[handle].install_session(peer.session()?)?;
        dp.set_reachable(handle, true, Instant::now());
        peers.push((handle, peer.clone()));
        info!("Configured peer {} at {}", peer.name, peer.address);
    }
    dp.reset_key_timer(Instant::now());

    // Control plane: accept inbound connections and dial every peer.
    let listener = TcpListener::bind(config.listen[0])
        .await
        .context("binding control listener")?;
    {
        let accept_tx = accept_tx.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, from)) => {
                        if accept_tx.send((from, stream)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Control accept failed: {}", e),
                }
            }
        });
    }
    for (_, peer) in &peers {
        let accept_tx = accept_tx.clone();
        let addr = peer.address;
        tokio::spawn(async move {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    let _ = accept_tx.send((addr, stream)).await;
                }
                Err(e) => debug!("Control connect to {} failed: {}", addr, e),
            }
        });
    }

    info!(
        "weftd running: {} peers, {} listen sockets, device {}",
        peers.len(),
        config.listen.len(),
        tap.name()
    );

    let mut decoders: HashMap<ConnHandle, FrameDecoder> = HashMap::new();

    loop {
        let wake = [dp.next_mtu_deadline(), dp.key_expires()]
            .into_iter()
            .flatten()
            .min()
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            Some(dgram) = udp_rx.recv() => {
                dp.handle_incoming_datagram(dgram.from, &dgram.data);
            }
            Some(frame) = dev_in_rx.recv() => {
                dp.handle_device_packet(frame);
            }
            Some((from, stream)) = accept_rx.recv() => {
                install_connection(&mut dp, &tcp_tx, &mut decoders, from, stream);
            }
            Some((conn, chunk)) = tcp_rx.recv() => {
                feed_control_data(&mut dp, &mut decoders, conn, &chunk);
            }
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(wake)) => {
                let now = Instant::now();
                dp.run_mtu_timers(now);
                if dp.key_expired(now) {
                    dp.hooks_mut().rekey_wanted = true;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }

        service_hooks(&mut dp, &peers);
    }

    Ok(())
}

/// Bind an established control stream to its peer and spawn its I/O tasks
fn install_connection(
    dp: &mut Dp,
    tcp_tx: &mpsc::Sender<(ConnHandle, Vec<u8>)>,
    decoders: &mut HashMap<ConnHandle, FrameDecoder>,
    from: SocketAddr,
    stream: TcpStream,
) {
    let node = dp
        .nodes
        .handles()
        .find(|&h| dp.nodes[h].address.is_some_and(|a| a.ip() == from.ip()));
    let Some(node) = node else {
        debug!("Control connection from unknown host {}", from);
        return;
    };
    if dp.nodes[node].connection.is_some() {
        debug!("Duplicate control connection from {}", from);
        return;
    }

    let (mut read_half, write_half) = stream.into_split();
    let (channel, rx) = ControlChannel::new(CONTROL_CHANNEL_DEPTH);
    let conn = dp.conns.add(Connection {
        node,
        active: true,
        mst: true,
        tcp_only: dp.nodes[node].tcp_only,
        channel,
    });
    dp.nodes[node].connection = Some(conn);
    decoders.insert(conn, FrameDecoder::new());

    tokio::spawn(async move {
        if let Err(e) = drain_frames(rx, write_half).await {
            debug!("Control writer for {} ended: {}", from, e);
        }
    });

    let tcp_tx = tcp_tx.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if tcp_tx.send((conn, buf[..n].to_vec())).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("Control read from {} failed: {}", from, e);
                    break;
                }
            }
        }
    });

    info!(
        "Control connection established with {} ({})",
        dp.nodes[node].name, from
    );
}

/// Deframe control bytes and feed complete packets to the datapath
fn feed_control_data(
    dp: &mut Dp,
    decoders: &mut HashMap<ConnHandle, FrameDecoder>,
    conn: ConnHandle,
    chunk: &[u8],
) {
    let Some(decoder) = decoders.get_mut(&conn) else {
        return;
    };
    decoder.extend(chunk);
    loop {
        match decoder.next_frame() {
            Ok(Some(frame)) => dp.receive_tcp_packet(conn, &frame),
            Ok(None) => break,
            Err(e) => {
                warn!("Bad control frame: {}", e);
                dp.conns[conn].active = false;
                break;
            }
        }
    }
}

/// Drain queued routing decisions and key requests after each event.
///
/// Hub routing: frames from the device flood the mesh along the spanning
/// tree, frames from peers go to the device. Finer routing belongs to the
/// routing layer, not the datapath.
fn service_hooks(dp: &mut Dp, peers: &[(NodeHandle, PeerConfig)]) {
    while let Some((from, packet)) = dp.hooks_mut().routes.pop_front() {
        if from == dp.myself() {
            dp.broadcast_packet(from, &packet);
        } else {
            let myself = dp.myself();
            dp.send_packet(myself, &packet);
        }
    }

    let requests: Vec<NodeHandle> = dp.hooks_mut().key_requests.drain(..).collect();
    for node in requests {
        reinstall_sessions(dp, peers, Some(node));
    }

    if std::mem::take(&mut dp.hooks_mut().rekey_wanted) {
        reinstall_sessions(dp, peers, None);
        dp.reset_key_timer(Instant::now());
        info!("Session keys regenerated");
    }
}

/// The static keyring stands in for the handshake layer: a key request
/// reinstalls the configured material, which also resets sequencing state
fn reinstall_sessions(dp: &mut Dp, peers: &[(NodeHandle, PeerConfig)], only: Option<NodeHandle>) {
    for (handle, peer) in peers {
        if only.is_some_and(|wanted| wanted != *handle) {
            continue;
        }
        match peer.session() {
            Ok(session) => {
                if let Err(e) = dp.nodes[*handle].install_session(session) {
                    warn!("Could not reinstall session for {}: {}", peer.name, e);
                }
            }
            Err(e) => warn!("Could not rebuild session for {}: {}", peer.name, e),
        }
    }
}
