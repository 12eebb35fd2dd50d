//! Listener and dialer plumbing for the three RPC transports.
//!
//! The server side produces an `incoming` stream of connections for tonic;
//! the client side produces a [`Channel`] whose connector dials whichever
//! transport the driver offers. Server parameters are tuned for bulk tunnel
//! throughput rather than many small calls.

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{UnixListener, UnixStream};
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::server::Connected;
use tonic::transport::{Channel, Endpoint, Server};

/// HTTP/2 window size for the event and tunnel streams: 512 MiB.
pub const WINDOW_SIZE: u32 = 512 * 1024 * 1024;

/// HTTP/2 frame size cap: 8 MiB.
pub const FRAME_SIZE: u32 = 8 * 1024 * 1024;

/// Concurrent stream budget of one agent connection.
pub const MAX_CONCURRENT_STREAMS: u32 = 2048;

/// A connection from a transport tonic has no built-in support for.
///
/// Wraps any bidirectional byte stream and reports no connect info; the
/// transport itself is the authentication boundary.
#[derive(Debug)]
pub struct IoStream<T>(pub T);

impl<T: Send + Sync> Connected for IoStream<T> {
    type ConnectInfo = ();

    fn connect_info(&self) -> Self::ConnectInfo {}
}

impl<T: AsyncRead + Unpin> AsyncRead for IoStream<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for IoStream<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }
}

/// Returns a [`Server`] builder tuned for the agent stream: large windows,
/// large frames, many concurrent streams, HTTP/2 keep-alive off.
#[must_use]
pub fn server_builder() -> Server {
    Server::builder()
        .initial_stream_window_size(Some(WINDOW_SIZE))
        .initial_connection_window_size(Some(WINDOW_SIZE))
        .max_frame_size(Some(FRAME_SIZE))
        .max_concurrent_streams(Some(MAX_CONCURRENT_STREAMS))
        .http2_keepalive_interval(None)
}

/// Binds the guest-agent Unix socket, removing a stale one first, and opens
/// it to all users (the socket sits in the guest's root-owned runtime
/// directory; host-side access goes through the SSH forward).
///
/// # Errors
///
/// Returns an error when the socket cannot be bound or chmodded.
pub fn unix_incoming(path: &Path) -> io::Result<UnixListenerStream> {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "removed stale socket"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    let listener = UnixListener::bind(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777))?;
    }
    Ok(UnixListenerStream::new(listener))
}

/// Accepts connections on a vsock port (any CID).
///
/// # Errors
///
/// Returns an error when the vsock listener cannot be bound.
#[cfg(target_os = "linux")]
pub fn vsock_incoming(
    port: u32,
) -> io::Result<impl Stream<Item = io::Result<IoStream<tokio_vsock::VsockStream>>>> {
    use tokio_vsock::{VMADDR_CID_ANY, VsockAddr, VsockListener};

    let mut listener = VsockListener::bind(VsockAddr::new(VMADDR_CID_ANY, port))?;
    Ok(async_stream::stream! {
        loop {
            yield listener.accept().await.map(|(stream, _addr)| IoStream(stream));
        }
    })
}

/// Treats a virtio serial character device as a single long-lived
/// connection: the stream yields the opened device once and then stays
/// pending, so the server keeps serving it until shutdown.
///
/// # Errors
///
/// Returns an error when the device cannot be opened read-write.
pub async fn serial_incoming(
    path: PathBuf,
) -> io::Result<impl Stream<Item = io::Result<IoStream<tokio::fs::File>>>> {
    let device = tokio::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&path)
        .await?;
    Ok(async_stream::stream! {
        yield Ok(IoStream(device));
        futures::future::pending::<()>().await;
    })
}

/// Connects a channel over the forwarded guest-agent Unix socket.
///
/// # Errors
///
/// Returns an error when the socket cannot be dialed.
pub async fn connect_unix(path: &Path) -> Result<Channel, tonic::transport::Error> {
    let path: PathBuf = path.to_path_buf();
    // The URI is required by the HTTP/2 layer but never resolved.
    Endpoint::try_from("http://guest.invalid")?
        .connect_with_connector(tower::service_fn(move |_| {
            let path = path.clone();
            async move { Ok::<_, io::Error>(TokioIo::new(UnixStream::connect(path).await?)) }
        }))
        .await
}

/// Connects a channel over an already-established byte stream, as handed
/// out by a driver. The stream is consumed by the first (and only)
/// connection attempt.
///
/// # Errors
///
/// Returns an error when the HTTP/2 handshake over the stream fails.
pub async fn connect_stream<T>(io: T) -> Result<Channel, tonic::transport::Error>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let slot = std::sync::Arc::new(tokio::sync::Mutex::new(Some(io)));
    Endpoint::try_from("http://guest.invalid")?
        .connect_with_connector(tower::service_fn(move |_| {
            let slot = std::sync::Arc::clone(&slot);
            async move {
                slot.lock().await.take().map(TokioIo::new).ok_or_else(|| {
                    io::Error::new(io::ErrorKind::BrokenPipe, "driver stream already consumed")
                })
            }
        }))
        .await
}

/// Connects a channel to a vsock CID and port.
///
/// # Errors
///
/// Returns an error when the vsock connection fails.
#[cfg(target_os = "linux")]
pub async fn connect_vsock(cid: u32, port: u32) -> Result<Channel, tonic::transport::Error> {
    use tokio_vsock::{VsockAddr, VsockStream};

    Endpoint::try_from("http://guest.invalid")?
        .connect_with_connector(tower::service_fn(move |_| async move {
            Ok::<_, io::Error>(TokioIo::new(VsockStream::connect(VsockAddr::new(cid, port)).await?))
        }))
        .await
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[tokio::test]
    async fn unix_incoming_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("agent.sock");

        let first = unix_incoming(&sock).unwrap();
        drop(first);
        // A dead socket file is left behind; binding again must succeed.
        assert!(sock.exists());
        let _second = unix_incoming(&sock).unwrap();
    }

    #[tokio::test]
    async fn unix_socket_is_world_accessible() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("agent.sock");
        let _incoming = unix_incoming(&sock).unwrap();

        let mode = std::fs::metadata(&sock).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o777);
    }
}
