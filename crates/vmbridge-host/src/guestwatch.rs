//! Guest-agent connection upkeep and event consumption.
//!
//! The watcher keeps one RPC client alive against the guest agent
//! (through whatever transport the driver offers, falling back to the
//! SSH-forwarded Unix socket) and pumps the `GetEvents` stream into the
//! port forwarder. Transport failures are never fatal: the watcher backs
//! off and redials for as long as the agent runs.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tonic::transport::Channel;

use vmbridge_common::constants::GUEST_AGENT_SOCK;
use vmbridge_common::error::{Result, VmbridgeError};
use vmbridge_common::instance::Instance;
use vmbridge_proto::pb;
use vmbridge_proto::pb::guest_service_client::GuestServiceClient;
use vmbridge_proto::transport;

use crate::forwarder::Forwarder;
use crate::ssh::SshSession;

/// Redial backoff after a transport failure.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// How long the agent waits for the guest agent before declaring the
/// instance degraded.
pub const ALIVE_TIMEOUT: Duration = Duration::from_secs(60);

/// Async factory producing a connected channel.
pub type ChannelDialer =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Channel>> + Send + Sync>;

/// Lazily-connected, cached RPC client shared by the watcher and the
/// gRPC forward backend.
pub struct GuestClientPool {
    dialer: ChannelDialer,
    cached: Mutex<Option<GuestServiceClient<Channel>>>,
}

impl GuestClientPool {
    /// Pool over an arbitrary dialer (driver-provided transports).
    #[must_use]
    pub fn new(dialer: ChannelDialer) -> Self {
        Self { dialer, cached: Mutex::new(None) }
    }

    /// Pool over the forwarded Unix socket in the instance directory.
    #[must_use]
    pub fn unix(path: PathBuf) -> Self {
        Self::new(Arc::new(move || {
            let path = path.clone();
            Box::pin(async move {
                transport::connect_unix(&path)
                    .await
                    .map_err(|e| VmbridgeError::transport(format!("dialing {}: {e}", path.display())))
            })
        }))
    }

    /// Returns the cached client, dialing on first use.
    ///
    /// # Errors
    ///
    /// Returns a transport error when dialing fails.
    pub async fn client(&self) -> Result<GuestServiceClient<Channel>> {
        let mut cached = self.cached.lock().await;
        if let Some(client) = cached.as_ref() {
            return Ok(client.clone());
        }
        let channel = (self.dialer)().await?;
        let client = GuestServiceClient::new(channel);
        *cached = Some(client.clone());
        Ok(client)
    }

    /// Drops the cached client so the next call redials.
    pub async fn invalidate(&self) {
        let _ = self.cached.lock().await.take();
    }

    /// True when a client is currently cached.
    pub async fn is_connected(&self) -> bool {
        self.cached.lock().await.is_some()
    }
}

/// The long-running watcher loop.
pub struct GuestAgentWatcher {
    pool: Arc<GuestClientPool>,
    forwarder: Arc<Forwarder>,
    session: SshSession,
    instance: Arc<Instance>,
    forward_socket: bool,
    alive_tx: std::sync::Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
}

impl GuestAgentWatcher {
    /// Creates the watcher. `forward_socket` mirrors the driver's
    /// `forward_guest_agent` flag.
    #[must_use]
    pub fn new(
        pool: Arc<GuestClientPool>,
        forwarder: Arc<Forwarder>,
        session: SshSession,
        instance: Arc<Instance>,
        forward_socket: bool,
    ) -> (Self, tokio::sync::oneshot::Receiver<()>) {
        let (alive_tx, alive_rx) = tokio::sync::oneshot::channel();
        let watcher = Self {
            pool,
            forwarder,
            session,
            instance,
            forward_socket,
            alive_tx: std::sync::Mutex::new(Some(alive_tx)),
        };
        (watcher, alive_rx)
    }

    fn signal_alive(&self) {
        if let Ok(mut slot) = self.alive_tx.lock() {
            if let Some(tx) = slot.take() {
                let _ = tx.send(());
                tracing::info!("guest agent is alive");
            }
        }
    }

    async fn ensure_socket_forward(&self) {
        if !self.forward_socket || self.pool.is_connected().await {
            return;
        }
        let local = self.instance.guest_agent_sock();
        if let Err(e) = self
            .session
            .forward_guest_agent_sock(&local, GUEST_AGENT_SOCK)
            .await
        {
            tracing::warn!(error = %e, "guest agent socket forward failed");
        }
    }

    async fn watch_once(&self) -> Result<()> {
        self.ensure_socket_forward().await;

        let mut client = self.pool.client().await?;
        let info = client
            .get_info(pb::Empty {})
            .await
            .map_err(|e| VmbridgeError::transport(format!("GetInfo: {e}")))?
            .into_inner();
        tracing::info!(
            ports = info.local_ports.len(),
            version = %info.protocol_version,
            "guest agent info"
        );
        self.signal_alive();

        // Every (re)connect follows a boot or a host sleep, the two
        // moments the guest clock is most likely to be off.
        match client
            .sync_time(pb::TimeSyncRequest { host_time: vmbridge_proto::unix_nanos_now() })
            .await
        {
            Ok(response) => {
                let response = response.into_inner();
                if response.adjusted {
                    tracing::info!(drift_ms = response.drift_ms, "guest clock stepped");
                } else if !response.error.is_empty() {
                    tracing::warn!(error = %response.error, "guest clock adjustment failed");
                }
            }
            Err(e) => tracing::debug!(error = %e, "SyncTime unavailable"),
        }

        let mut events = client
            .get_events(pb::Empty {})
            .await
            .map_err(|e| VmbridgeError::transport(format!("GetEvents: {e}")))?
            .into_inner();

        loop {
            match events.message().await {
                Ok(Some(event)) => {
                    tracing::debug!(
                        added = event.added_local_ports.len(),
                        removed = event.removed_local_ports.len(),
                        "guest event"
                    );
                    self.forwarder.on_event(&event).await;
                }
                Ok(None) => {
                    return Err(VmbridgeError::transport("event stream closed"));
                }
                Err(e) => {
                    return Err(VmbridgeError::transport(format!("event stream: {e}")));
                }
            }
        }
    }

    /// Runs until the surrounding task is cancelled.
    pub async fn run(&self) {
        loop {
            if let Err(e) = self.watch_once().await {
                tracing::warn!(error = %e, "guest agent watch interrupted");
                self.pool.invalidate().await;
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[tokio::test]
    async fn pool_dials_lazily_and_invalidates() {
        let counter = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let dial_count = Arc::clone(&counter);
        let pool = GuestClientPool::new(Arc::new(move || {
            let _ = dial_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Box::pin(async { Err(VmbridgeError::transport("nobody home".to_owned())) })
        }));

        assert!(!pool.is_connected().await);
        assert!(pool.client().await.is_err());
        assert!(pool.client().await.is_err());
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 2);

        pool.invalidate().await;
        assert!(!pool.is_connected().await);
    }

    #[tokio::test]
    async fn unix_pool_fails_cleanly_on_missing_socket() {
        let pool = GuestClientPool::unix(PathBuf::from("/nonexistent/ga.sock"));
        let err = pool.client().await.unwrap_err();
        assert!(matches!(err, VmbridgeError::Transport { .. }));
    }
}
