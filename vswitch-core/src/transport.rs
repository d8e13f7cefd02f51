//! Single bound UDP socket: dual-stack bind, one writer task draining an
//! ordered per-destination send queue, and a decode-inline receive loop.

use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::codec;
use crate::control;
use crate::error::{Result, SwitchError};

const SEND_QUEUE_DEPTH: usize = 1024;

struct Outgoing {
    frame: Vec<u8>,
    endpoint: SocketAddr,
    ttl: u8,
}

/// One decoded inbound datagram, handed to the forwarding engine.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub frame: Vec<u8>,
    pub source: SocketAddr,
    pub ttl: u8,
    pub is_control: bool,
}

pub struct Transport {
    socket: Arc<UdpSocket>,
    sender: mpsc::Sender<Outgoing>,
}

impl Transport {
    /// Binds the socket and spawns its writer task. `mtu` is used only to
    /// decide whether an outgoing datagram warrants a size warning.
    pub async fn bind(port: u16, mtu: u16) -> Result<Self> {
        let socket = bind_dual_stack(port).map_err(SwitchError::Bind)?;
        let socket = Arc::new(socket);
        let (sender, receiver) = mpsc::channel(SEND_QUEUE_DEPTH);
        tokio::spawn(run_writer(socket.clone(), receiver, mtu));
        Ok(Self { socket, sender })
    }

    /// Hands out a clone of the bound socket for the receive loop. Kept
    /// separate from `Transport` itself so the reader can run as its own
    /// task without borrowing `Transport`.
    pub fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }

    /// Enqueues `frame` for transmission to `endpoint` with the given TTL.
    /// Submissions for the same destination are transmitted in submission
    /// order, since a single writer task drains the queue.
    pub fn send(&self, frame: Vec<u8>, endpoint: SocketAddr, ttl: u8) {
        if self
            .sender
            .try_send(Outgoing { frame, endpoint, ttl })
            .is_err()
        {
            warn!(%endpoint, "send queue full or writer gone, dropping frame");
        }
    }
}

/// Runs the receive loop until cancelled. Decodes each datagram inline and
/// awaits `on_datagram`; a decode failure is logged and the datagram
/// dropped, it never reaches the callback. The handler is async because
/// an ingress decision may need to write to the TAP device.
pub async fn run_reader<F, Fut>(socket: Arc<UdpSocket>, mut on_datagram: F)
where
    F: FnMut(Inbound) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut buf = vec![0u8; 65536];
    loop {
        let (n, source) = match socket.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "udp recv error");
                continue;
            }
        };
        match codec::decode(&buf[..n]) {
            Ok((frame, ttl)) => {
                let is_control = control::is_control_frame(&frame);
                on_datagram(Inbound {
                    frame,
                    source,
                    ttl,
                    is_control,
                })
                .await;
            }
            Err(e) => {
                debug!(%source, error = %e, "failed to decode datagram");
            }
        }
    }
}

async fn run_writer(socket: Arc<UdpSocket>, mut receiver: mpsc::Receiver<Outgoing>, mtu: u16) {
    while let Some(Outgoing {
        frame,
        endpoint,
        ttl,
    }) = receiver.recv().await
    {
        match codec::encode(&frame, ttl) {
            Ok(datagram) => {
                if datagram.len() > mtu as usize {
                    warn!(
                        len = datagram.len(),
                        mtu, %endpoint, "encoded datagram exceeds configured mtu, sending anyway"
                    );
                }
                if let Err(e) = socket.send_to(&datagram, endpoint).await {
                    debug!(%endpoint, error = %e, "udp send failed");
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to encode outgoing frame");
            }
        }
    }
}

fn bind_dual_stack(port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    let _ = socket.set_only_v6(false);
    let addr: SocketAddr = format!("[::]:{port}").parse().expect("static bind template");
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}
