//! Tunnel-based forward backend.
//!
//! Each accepted local connection becomes one `Tunnel` RPC stream: the
//! first frame names the guest target, and bytes flow in frames until
//! either side reaches EOF. UDP forwards use one tunnel per peer address,
//! one datagram per frame.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use vmbridge_common::error::{Result, VmbridgeError};
use vmbridge_common::types::{IpPort, Protocol};
use vmbridge_proto::pb;

use crate::forwarder::rules::ForwardPlan;
use crate::guestwatch::GuestClientPool;

static TUNNEL_SEQ: AtomicU64 = AtomicU64::new(0);

fn next_tunnel_id(guest: &IpPort) -> String {
    let seq = TUNNEL_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{guest}#{seq}")
}

/// gRPC forward backend over the shared client pool.
pub struct GrpcBackend {
    pool: Arc<GuestClientPool>,
}

impl GrpcBackend {
    /// Creates the backend.
    #[must_use]
    pub fn new(pool: Arc<GuestClientPool>) -> Self {
        Self { pool }
    }

    /// Installs a forward for the plan; the returned task owns the local
    /// listener and is aborted to tear the forward down.
    ///
    /// # Errors
    ///
    /// Returns an error when the local bind fails.
    pub async fn install(&self, plan: &ForwardPlan) -> Result<tokio::task::JoinHandle<()>> {
        match plan.guest.protocol {
            Protocol::Tcp => self.install_tcp(plan).await,
            Protocol::Udp => self.install_udp(plan).await,
        }
    }

    async fn install_tcp(&self, plan: &ForwardPlan) -> Result<tokio::task::JoinHandle<()>> {
        let listener = TcpListener::bind((plan.host_ip, plan.host_port))
            .await
            .map_err(|e| {
                VmbridgeError::transport(format!("binding {}: {e}", plan.local_addr()))
            })?;
        let pool = Arc::clone(&self.pool);
        let guest = plan.guest;

        Ok(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        tracing::debug!(%peer, target = %guest, "tunnel connection accepted");
                        let pool = Arc::clone(&pool);
                        let _ = tokio::spawn(async move {
                            if let Err(e) = run_tcp_tunnel(&pool, guest, stream).await {
                                tracing::warn!(target = %guest, error = %e, "tunnel failed");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(target = %guest, error = %e, "tunnel accept failed");
                        break;
                    }
                }
            }
        }))
    }

    async fn install_udp(&self, plan: &ForwardPlan) -> Result<tokio::task::JoinHandle<()>> {
        let socket = UdpSocket::bind((plan.host_ip, plan.host_port))
            .await
            .map_err(|e| {
                VmbridgeError::transport(format!("binding {}: {e}", plan.local_addr()))
            })?;
        let pool = Arc::clone(&self.pool);
        let guest = plan.guest;

        Ok(tokio::spawn(async move {
            if let Err(e) = run_udp_forward(&pool, guest, socket).await {
                tracing::warn!(target = %guest, error = %e, "udp forward failed");
            }
        }))
    }
}

/// Opens a tunnel stream with the mandatory open frame and returns both
/// directions.
async fn open_tunnel(
    pool: &GuestClientPool,
    guest: IpPort,
) -> Result<(mpsc::Sender<pb::TunnelMessage>, tonic::Streaming<pb::TunnelMessage>, String)> {
    let mut client = pool.client().await?;
    let id = next_tunnel_id(&guest);
    let (tx, rx) = mpsc::channel::<pb::TunnelMessage>(16);

    tx.send(pb::TunnelMessage {
        id: id.clone(),
        guest_addr: guest.host_port(),
        protocol: guest.protocol.as_str().to_owned(),
        data: Vec::new(),
    })
    .await
    .map_err(|_| VmbridgeError::transport("tunnel channel closed"))?;

    let inbound = client
        .tunnel(tonic::Request::new(ReceiverStream::new(rx)))
        .await
        .map_err(|e| VmbridgeError::transport(format!("Tunnel: {e}")))?
        .into_inner();
    Ok((tx, inbound, id))
}

async fn run_tcp_tunnel(
    pool: &GuestClientPool,
    guest: IpPort,
    stream: tokio::net::TcpStream,
) -> Result<()> {
    let (tx, mut inbound, id) = open_tunnel(pool, guest).await?;
    let (mut read_half, mut write_half) = stream.into_split();

    let outbound_id = id.clone();
    let local_to_guest = tokio::spawn(async move {
        let mut buf = vec![0u8; 32 * 1024];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let frame = pb::TunnelMessage {
                        id: outbound_id.clone(),
                        data: buf[..n].to_vec(),
                        ..pb::TunnelMessage::default()
                    };
                    if tx.send(frame).await.is_err() {
                        break;
                    }
                }
            }
        }
        // Dropping the sender closes the outbound stream: EOF to the
        // guest side.
    });

    while let Ok(Some(frame)) = inbound.message().await {
        if write_half.write_all(&frame.data).await.is_err() {
            break;
        }
    }
    let _ = write_half.shutdown().await;
    local_to_guest.abort();
    Ok(())
}

async fn run_udp_forward(
    pool: &GuestClientPool,
    guest: IpPort,
    socket: UdpSocket,
) -> Result<()> {
    let socket = Arc::new(socket);
    let mut peers: HashMap<SocketAddr, mpsc::Sender<pb::TunnelMessage>> = HashMap::new();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let (n, peer) = socket
            .recv_from(&mut buf)
            .await
            .map_err(|e| VmbridgeError::transport(format!("udp recv: {e}")))?;
        let datagram = buf[..n].to_vec();

        if let Some(tx) = peers.get(&peer) {
            if tx
                .send(pb::TunnelMessage { data: datagram, ..pb::TunnelMessage::default() })
                .await
                .is_ok()
            {
                continue;
            }
            // The tunnel died; open a fresh one below.
            let _ = peers.remove(&peer);
            continue;
        }

        match open_tunnel(pool, guest).await {
            Ok((tx, mut inbound, id)) => {
                let frame = pb::TunnelMessage {
                    id,
                    data: datagram,
                    ..pb::TunnelMessage::default()
                };
                if tx.send(frame).await.is_err() {
                    continue;
                }
                let _ = peers.insert(peer, tx);

                let reply_socket = Arc::clone(&socket);
                let _ = tokio::spawn(async move {
                    while let Ok(Some(frame)) = inbound.message().await {
                        if reply_socket.send_to(&frame.data, peer).await.is_err() {
                            break;
                        }
                    }
                });
            }
            Err(e) => tracing::warn!(target = %guest, error = %e, "udp tunnel open failed"),
        }
    }
}
