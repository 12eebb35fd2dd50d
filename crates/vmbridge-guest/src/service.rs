//! The guest-agent RPC service.
//!
//! Implements the five operations of the `GuestService` protobuf service
//! over whatever transport the daemon selected. The service holds the
//! shared [`GuestAgent`] and translates between wire messages and the
//! in-memory types.

use std::pin::Pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};
use tonic::{Request, Response, Status, Streaming};

use vmbridge_proto::pb::guest_service_server::{GuestService, GuestServiceServer};
use vmbridge_proto::{PROTOCOL_VERSION, ip_port_to_pb, pb, system_time_from_nanos};

use crate::agent::{GuestAgent, GuestEvent};
use crate::timesync;

/// Bytes read from a tunneled socket per frame.
const TUNNEL_CHUNK: usize = 32 * 1024;

/// tonic service wrapper around the agent.
pub struct GuestAgentService {
    agent: Arc<GuestAgent>,
}

impl GuestAgentService {
    /// Creates the service.
    #[must_use]
    pub fn new(agent: Arc<GuestAgent>) -> Self {
        Self { agent }
    }

    /// Wraps the service for registration with a tonic server.
    #[must_use]
    pub fn into_server(self) -> GuestServiceServer<Self> {
        GuestServiceServer::new(self)
    }
}

fn event_to_pb(event: &GuestEvent) -> pb::Event {
    pb::Event {
        time: event.time.timestamp_nanos_opt().unwrap_or_default(),
        added_local_ports: event.delta.added.iter().map(ip_port_to_pb).collect(),
        removed_local_ports: event.delta.removed.iter().map(ip_port_to_pb).collect(),
        errors: event.errors.clone(),
    }
}

/// Applies one inotify message: bump both timestamps of the path iff it
/// exists. Failures are logged and never abort the stream.
fn apply_inotify(message: &pb::Inotify) {
    let path = std::path::Path::new(&message.mount_path);
    if !path.exists() {
        return;
    }
    let time = system_time_from_nanos(message.time);
    if let Err(e) = set_file_times(path, time) {
        tracing::warn!(path = %path.display(), error = %e, "utimensat failed");
    }
}

fn set_file_times(path: &std::path::Path, to: std::time::SystemTime) -> std::io::Result<()> {
    use std::os::unix::ffi::OsStrExt;

    let since_epoch = to
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let spec = libc::timespec {
        tv_sec: i64::try_from(since_epoch.as_secs())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?,
        tv_nsec: i64::from(since_epoch.subsec_nanos()),
    };
    let times = [spec, spec];
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    // SAFETY: c_path and times outlive the call; utimensat reads both and
    // touches nothing else.
    let rc = unsafe { libc::utimensat(libc::AT_FDCWD, c_path.as_ptr(), times.as_ptr(), 0) };
    if rc == 0 { Ok(()) } else { Err(std::io::Error::last_os_error()) }
}

type EventStream = Pin<Box<dyn Stream<Item = Result<pb::Event, Status>> + Send>>;
type TunnelFrames = Pin<Box<dyn Stream<Item = Result<pb::TunnelMessage, Status>> + Send>>;

#[tonic::async_trait]
impl GuestService for GuestAgentService {
    async fn get_info(&self, _request: Request<pb::Empty>) -> Result<Response<pb::Info>, Status> {
        let (snapshot, _) = self.agent.scan_snapshot().await;
        Ok(Response::new(pb::Info {
            local_ports: snapshot.ports.iter().map(ip_port_to_pb).collect(),
            protocol_version: PROTOCOL_VERSION.to_owned(),
        }))
    }

    type GetEventsStream = EventStream;

    async fn get_events(
        &self,
        _request: Request<pb::Empty>,
    ) -> Result<Response<Self::GetEventsStream>, Status> {
        tracing::info!("event subscriber connected");
        let stream = BroadcastStream::new(self.agent.subscribe()).filter_map(|item| async {
            match item {
                Ok(event) => Some(Ok(event_to_pb(&event))),
                Err(e) => {
                    // A lagging subscriber loses deltas; the host resyncs
                    // through GetInfo on reconnect.
                    tracing::warn!(error = %e, "event subscriber lagged");
                    None
                }
            }
        });
        Ok(Response::new(Box::pin(stream)))
    }

    async fn post_inotify(
        &self,
        request: Request<Streaming<pb::Inotify>>,
    ) -> Result<Response<pb::Empty>, Status> {
        let mut stream = request.into_inner();
        while let Some(message) = stream.message().await? {
            apply_inotify(&message);
        }
        Ok(Response::new(pb::Empty {}))
    }

    type TunnelStream = TunnelFrames;

    async fn tunnel(
        &self,
        request: Request<Streaming<pb::TunnelMessage>>,
    ) -> Result<Response<Self::TunnelStream>, Status> {
        let mut inbound = request.into_inner();
        let first = inbound
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument("tunnel stream closed before open frame"))?;
        if first.guest_addr.is_empty() {
            return Err(Status::invalid_argument("open frame carries no guest address"));
        }

        match first.protocol.as_str() {
            "udp" => tunnel_udp(first, inbound).await,
            _ => tunnel_tcp(first, inbound).await,
        }
    }

    async fn sync_time(
        &self,
        request: Request<pb::TimeSyncRequest>,
    ) -> Result<Response<pb::TimeSyncResponse>, Status> {
        let host_time = system_time_from_nanos(request.into_inner().host_time);
        let outcome = timesync::sync_to_host(host_time);
        Ok(Response::new(pb::TimeSyncResponse {
            adjusted: outcome.adjusted,
            drift_ms: outcome.drift_ms,
            error: outcome.error.unwrap_or_default(),
        }))
    }
}

async fn tunnel_tcp(
    first: pb::TunnelMessage,
    mut inbound: Streaming<pb::TunnelMessage>,
) -> Result<Response<TunnelFrames>, Status> {
    let stream = tokio::net::TcpStream::connect(&first.guest_addr)
        .await
        .map_err(|e| Status::unavailable(format!("dialing {}: {e}", first.guest_addr)))?;
    tracing::debug!(id = %first.id, target = %first.guest_addr, "tcp tunnel open");

    let (mut read_half, mut write_half) = stream.into_split();
    let id = first.id.clone();

    // Client → guest: any bytes carried by the open frame, then the rest
    // of the inbound stream.
    let _ = tokio::spawn(async move {
        if !first.data.is_empty() {
            if write_half.write_all(&first.data).await.is_err() {
                return;
            }
        }
        while let Ok(Some(message)) = inbound.message().await {
            if write_half.write_all(&message.data).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    // Guest → client: chunked reads until EOF; dropping the sender closes
    // the response stream.
    let (tx, rx) = mpsc::channel::<Result<pb::TunnelMessage, Status>>(16);
    let _ = tokio::spawn(async move {
        let mut buf = vec![0u8; TUNNEL_CHUNK];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let frame = pb::TunnelMessage {
                        id: id.clone(),
                        data: buf[..n].to_vec(),
                        ..pb::TunnelMessage::default()
                    };
                    if tx.send(Ok(frame)).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
}

async fn tunnel_udp(
    first: pb::TunnelMessage,
    mut inbound: Streaming<pb::TunnelMessage>,
) -> Result<Response<TunnelFrames>, Status> {
    let socket = tokio::net::UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| Status::unavailable(format!("udp bind: {e}")))?;
    socket
        .connect(&first.guest_addr)
        .await
        .map_err(|e| Status::unavailable(format!("dialing {}: {e}", first.guest_addr)))?;
    tracing::debug!(id = %first.id, target = %first.guest_addr, "udp tunnel open");

    let socket = Arc::new(socket);
    let id = first.id.clone();

    let sender = Arc::clone(&socket);
    let _ = tokio::spawn(async move {
        if !first.data.is_empty() && sender.send(&first.data).await.is_err() {
            return;
        }
        while let Ok(Some(message)) = inbound.message().await {
            // One frame is one datagram.
            if sender.send(&message.data).await.is_err() {
                break;
            }
        }
    });

    let (tx, rx) = mpsc::channel::<Result<pb::TunnelMessage, Status>>(16);
    let _ = tokio::spawn(async move {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match socket.recv(&mut buf).await {
                Err(_) => break,
                Ok(n) => {
                    let frame = pb::TunnelMessage {
                        id: id.clone(),
                        data: buf[..n].to_vec(),
                        ..pb::TunnelMessage::default()
                    };
                    if tx.send(Ok(frame)).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
}
