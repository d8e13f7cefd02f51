//! Lifecycle: wires up the peer table, transport, TAP pump, and control
//! protocol; owns the stop signal and SIGINT handling.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::time::interval;
use tracing::{info, warn};

use crate::config::Config;
use crate::control::{self, ControlMessage};
use crate::error::Result;
use crate::forwarding::{Action, ForwardingEngine};
use crate::peer_table::PeerTable;
use crate::tap::{self, TapWriter};
use crate::transport::{self, Inbound, Transport};

const SWEEP_PERIOD: Duration = Duration::from_secs(5);
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(5);
const QUERY_PEER_INFO_PERIOD: Duration = Duration::from_secs(30);
const QUERY_PEERS_PERIOD: Duration = Duration::from_secs(60);
const PUNCH_RETRY_INTERVAL: Duration = Duration::from_secs(1);
const PUNCH_RETRY_ATTEMPTS: u32 = 10;

struct Shared {
    config: Config,
    peer_table: Arc<PeerTable>,
    transport: Arc<Transport>,
    engine: ForwardingEngine,
}

/// Runs the switch until SIGINT. Fatal startup errors (TAP open, UDP
/// bind) are returned; everything after that point is handled in place.
pub async fn run(config: Config) -> Result<()> {
    let peer_table = Arc::new(PeerTable::new(config.core_endpoint));
    let transport = Arc::new(Transport::bind(config.local_udp_port, config.mtu).await?);
    let (tap_reader, tap_writer) = tap::open(&config)?;
    let tap_writer = Arc::new(Mutex::new(tap_writer));
    let engine = ForwardingEngine::new(config.local_mac, config.send_ttl);

    let shared = Arc::new(Shared {
        config,
        peer_table,
        transport,
        engine,
    });

    let (stop_tx, stop_rx) = watch::channel(false);

    spawn_udp_reader(shared.clone(), tap_writer.clone());
    tokio::spawn(run_tap_pump(shared.clone(), tap_reader, stop_rx.clone()));
    spawn_scheduled_tasks(shared.clone(), stop_rx.clone());

    info!(
        interface = %shared.config.interface_name,
        local_udp_port = shared.config.local_udp_port,
        core_endpoint = %shared.config.core_endpoint,
        "switch started"
    );

    tokio::signal::ctrl_c()
        .await
        .map_err(crate::error::SwitchError::Io)?;
    info!("received ctrl-c, shutting down");
    let _ = stop_tx.send(true);

    Ok(())
}

fn spawn_udp_reader(shared: Arc<Shared>, tap_writer: Arc<Mutex<TapWriter>>) {
    let socket = shared.transport.socket();
    tokio::spawn(async move {
        transport::run_reader(socket, move |inbound: Inbound| {
            let shared = shared.clone();
            let tap_writer = tap_writer.clone();
            async move { handle_inbound(&shared, &tap_writer, inbound).await }
        })
        .await;
    });
}

async fn handle_inbound(shared: &Shared, tap_writer: &Mutex<TapWriter>, inbound: Inbound) {
    let Inbound {
        frame,
        source,
        ttl,
        is_control,
    } = inbound;

    let actions = shared
        .engine
        .ingress(&shared.peer_table, &frame, source, ttl, is_control);
    dispatch_actions(shared, tap_writer, actions).await;

    if is_control {
        if let Some(message) = control::parse_payload(&frame) {
            handle_control_message(shared, message, source, ttl).await;
        } else {
            warn!(%source, "malformed control payload, dropping");
        }
    }
}

async fn dispatch_actions(shared: &Shared, tap_writer: &Mutex<TapWriter>, actions: Vec<Action>) {
    for action in actions {
        match action {
            Action::WriteTap(frame) => {
                let mut writer = tap_writer.lock().await;
                if let Err(e) = writer.write_frame(&frame).await {
                    warn!(error = %e, "tap write failed");
                }
            }
            Action::Send {
                frame,
                endpoint,
                ttl,
            } => {
                shared.transport.send(frame, endpoint, ttl);
            }
        }
    }
}

async fn handle_control_message(
    shared: &Shared,
    message: ControlMessage,
    source: SocketAddr,
    ttl: u8,
) {
    match message {
        ControlMessage::QueryPeers => {
            let peers: Vec<(u64, IpAddr, u16)> = shared
                .peer_table
                .snapshot()
                .into_iter()
                .filter(|(mac, _)| *mac != crate::mac::BROADCAST)
                .map(|(mac, ep)| (mac, ep.ip(), ep.port()))
                .collect();
            for datagram in control::build_requery_peers(shared.config.local_mac, &peers) {
                shared.transport.send(datagram, source, ttl);
            }
        }
        ControlMessage::ReQueryPeers(peers) => {
            for (mac, ip, port) in peers {
                if mac == shared.config.local_mac {
                    continue;
                }
                let advertised = SocketAddr::new(ip, port);
                let (current, _found) = shared.peer_table.lookup(mac);
                if crate::peer_table::endpoints_equal(current, shared.config.core_endpoint) {
                    spawn_punch(shared.clone_handles(), mac, advertised);
                }
            }
        }
        ControlMessage::QueryPeerInfo => {
            let local_ip = shared
                .config
                .local_ip
                .map(IpAddr::V4)
                .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));
            let datagram = control::build_requery_peer_info(shared.config.local_mac, local_ip);
            shared
                .transport
                .send(datagram, source, shared.config.send_ttl);
        }
        ControlMessage::ReQueryPeerInfo { local_mac, .. } => {
            shared.peer_table.learn(local_mac, source, ttl);
        }
    }
}

/// Sends a 10-attempt, 1-second-interval punch toward `advertised` to
/// establish a direct P2P mapping, per `spec.md` §4.F.
fn spawn_punch(handles: SwitchHandles, mac: u64, advertised: SocketAddr) {
    tokio::spawn(async move {
        let mut ticker = interval(PUNCH_RETRY_INTERVAL);
        for _ in 0..PUNCH_RETRY_ATTEMPTS {
            ticker.tick().await;
            let frame = control::build_keepalive(mac, handles.local_mac);
            handles.transport.send(frame, advertised, 0);
        }
    });
}

/// Cheap clone of just what `spawn_punch` needs, kept separate from
/// `Shared` so the punch task does not hold the whole switch alive
/// longer than necessary.
#[derive(Clone)]
struct SwitchHandles {
    transport: Arc<Transport>,
    local_mac: u64,
}

impl Shared {
    fn clone_handles(&self) -> SwitchHandles {
        SwitchHandles {
            transport: self.transport.clone(),
            local_mac: self.config.local_mac,
        }
    }
}

async fn run_tap_pump(shared: Arc<Shared>, tap_reader: tap::TapReader, stop_rx: watch::Receiver<bool>) {
    tap::pump(tap_reader, stop_rx, move |frame| {
        let actions = shared.engine.egress(&shared.peer_table, &frame);
        for action in actions {
            if let Action::Send {
                frame,
                endpoint,
                ttl,
            } = action
            {
                shared.transport.send(frame, endpoint, ttl);
            }
        }
    })
    .await;
}

fn spawn_scheduled_tasks(shared: Arc<Shared>, mut stop_rx: watch::Receiver<bool>) {
    tokio::spawn(run_periodic(shared.clone(), stop_rx.clone(), SWEEP_PERIOD, sweep_tick));
    tokio::spawn(run_periodic(
        shared.clone(),
        stop_rx.clone(),
        KEEPALIVE_PERIOD,
        keepalive_tick,
    ));
    tokio::spawn(run_periodic(
        shared.clone(),
        stop_rx.clone(),
        QUERY_PEER_INFO_PERIOD,
        query_peer_info_tick,
    ));

    if shared.config.enable_p2p {
        let shared = shared.clone();
        tokio::spawn(async move {
            query_peers_tick(&shared);
            let mut ticker = interval(QUERY_PEERS_PERIOD);
            ticker.tick().await; // consume the immediate first tick
            loop {
                tokio::select! {
                    _ = ticker.tick() => query_peers_tick(&shared),
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }
}

async fn run_periodic<F>(shared: Arc<Shared>, mut stop_rx: watch::Receiver<bool>, period: Duration, tick: F)
where
    F: Fn(&Shared),
{
    let mut ticker = interval(period);
    loop {
        tokio::select! {
            _ = ticker.tick() => tick(&shared),
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
        }
    }
}

fn sweep_tick(shared: &Shared) {
    let evicted = shared.peer_table.sweep_expired();
    if !evicted.is_empty() {
        info!(count = evicted.len(), "evicted aged peer-table entries");
    }
}

fn keepalive_tick(shared: &Shared) {
    for (mac, endpoint) in shared.peer_table.snapshot() {
        if endpoint.port() != 0 {
            let frame = control::build_keepalive(mac, shared.config.local_mac);
            shared.transport.send(frame, endpoint, 0);
        }
    }
}

fn query_peer_info_tick(shared: &Shared) {
    if shared.config.core_endpoint.port() == 0 {
        return;
    }
    let datagram = control::build_query_peer_info(shared.config.local_mac);
    shared
        .transport
        .send(datagram, shared.config.core_endpoint, shared.config.send_ttl);
}

fn query_peers_tick(shared: &Shared) {
    if shared.config.core_endpoint.port() == 0 {
        return;
    }
    let datagram = control::build_query_peers(shared.config.local_mac);
    shared
        .transport
        .send(datagram, shared.config.core_endpoint, shared.config.send_ttl);
}
