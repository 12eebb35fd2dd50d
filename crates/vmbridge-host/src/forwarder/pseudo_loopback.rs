//! Pseudo-loopback listener for privileged ports on macOS.
//!
//! macOS refuses a loopback bind of ports below 1024 for unprivileged
//! processes, but allows the wildcard bind. The workaround listens on
//! `0.0.0.0:port`, accepts only connections whose peer really is
//! loopback, and tunnels each accepted stream into the Unix socket ssh
//! bound for the forward. The effect is a loopback-only privileged port
//! without elevated rights.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use tokio::net::{TcpListener, UnixStream};

/// True when a peer address may use the pseudo-loopback listener.
#[must_use]
pub fn peer_allowed(peer: SocketAddr) -> bool {
    match peer.ip() {
        IpAddr::V4(ip) => ip.is_loopback(),
        IpAddr::V6(ip) => ip.is_loopback() || ip.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback()),
    }
}

/// A running pseudo-loopback forward.
#[derive(Debug)]
pub struct PseudoLoopback {
    port: u16,
    task: tokio::task::JoinHandle<()>,
}

impl PseudoLoopback {
    /// Binds `0.0.0.0:port` and starts relaying loopback connections into
    /// the Unix socket.
    ///
    /// # Errors
    ///
    /// Returns an error when the wildcard bind fails.
    pub async fn spawn(port: u16, unix_sock: PathBuf) -> std::io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        tracing::info!(port, sock = %unix_sock.display(), "pseudo-loopback listener up");

        let task = tokio::spawn(async move {
            loop {
                let (mut stream, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "pseudo-loopback accept failed");
                        break;
                    }
                };
                if !peer_allowed(peer) {
                    tracing::warn!(%peer, "pseudo-loopback rejected non-loopback peer");
                    continue;
                }
                let sock = unix_sock.clone();
                let _ = tokio::spawn(async move {
                    match UnixStream::connect(&sock).await {
                        Ok(mut unix) => {
                            let _ = tokio::io::copy_bidirectional(&mut stream, &mut unix).await;
                        }
                        Err(e) => {
                            tracing::warn!(sock = %sock.display(), error = %e, "pseudo-loopback dial failed");
                        }
                    }
                });
            }
        });

        Ok(Self { port, task })
    }

    /// The forwarded port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PseudoLoopback {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn loopback_peers_are_allowed() {
        assert!(peer_allowed("127.0.0.1:52000".parse().unwrap()));
        assert!(peer_allowed("[::1]:52000".parse().unwrap()));
        assert!(peer_allowed("[::ffff:127.0.0.1]:52000".parse().unwrap()));
    }

    #[test]
    fn remote_peers_are_rejected() {
        assert!(!peer_allowed("192.168.0.2:52000".parse().unwrap()));
        assert!(!peer_allowed("10.0.0.1:1".parse().unwrap()));
        assert!(!peer_allowed("[fe80::1]:52000".parse().unwrap()));
    }

    #[tokio::test]
    async fn loopback_connection_reaches_the_unix_socket() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("fwd.sock");

        // Stand-in for the ssh-bound socket: an echo server.
        let unix_listener = tokio::net::UnixListener::bind(&sock).unwrap();
        let _ = tokio::spawn(async move {
            if let Ok((mut stream, _)) = unix_listener.accept().await {
                let mut buf = [0u8; 16];
                if let Ok(n) = stream.read(&mut buf).await {
                    let _ = stream.write_all(&buf[..n]).await;
                }
            }
        });

        // Port 0 picks a free (unprivileged) port; the mechanism is the
        // same as for privileged ones.
        let listener = TcpListener::bind(("0.0.0.0", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let pseudo = PseudoLoopback::spawn(port, sock).await.unwrap();

        let mut client =
            tokio::net::TcpStream::connect(("127.0.0.1", pseudo.port())).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }
}
