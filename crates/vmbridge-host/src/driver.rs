//! The driver contract.
//!
//! A driver is the only per-hypervisor code the host agent touches: it
//! starts and stops the VM process and optionally hands the agent a
//! transport to the guest agent. Everything else (readiness, forwarding,
//! mounts) is hypervisor-independent and lives in this crate.
//!
//! Drivers that probe for in-guest SSH over vsock report their decision
//! through the [`EventSink`] handle installed at configure time; the weak
//! handle avoids a reference cycle between the agent and the driver it
//! owns.

use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;

use vmbridge_common::error::{Result, VmbridgeError};
use vmbridge_common::events::VsockEvent;
use vmbridge_common::instance::Instance;

/// A bidirectional byte stream to the guest agent.
pub type GuestConn = Pin<Box<dyn AsyncReadWrite + Send>>;

/// Marker trait for the boxed guest connection.
pub trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite + ?Sized> AsyncReadWrite for T {}

/// Receiver of driver-originated events.
pub trait EventSink: Send + Sync {
    /// Reports a vsock SSH fallback decision.
    fn vsock_event(&self, event: VsockEvent);
}

/// Weak handle to the agent's sink, installed at configure time.
pub type EventSinkHandle = Weak<dyn EventSink>;

/// Feature flags a driver advertises.
#[derive(Debug, Clone, Copy, Default)]
pub struct DriverFeatures {
    /// The SSH address is only known after the VM starts.
    pub dynamic_ssh_address: bool,
    /// The driver forwards the guest sockets itself.
    pub skip_socket_forwarding: bool,
    /// The driver can attach a display.
    pub can_run_gui: bool,
    /// Rosetta is mounted into the guest.
    pub rosetta_enabled: bool,
    /// Rosetta binfmt handlers are registered.
    pub rosetta_bin_fmt: bool,
    /// The guest image boots without cloud-init.
    pub no_cloud_init: bool,
}

/// Static facts about a configured driver.
#[derive(Debug, Clone, Default)]
pub struct DriverInfo {
    /// Vsock port of the guest agent, zero when unavailable.
    pub vsock_port: u32,
    /// Virtio serial port name of the guest agent, if any.
    pub virtio_port: Option<String>,
    /// Advertised features.
    pub features: DriverFeatures,
}

/// Result of a finished VM: `Ok` for a clean exit, the error otherwise.
pub type VmExit = std::result::Result<(), VmbridgeError>;

/// The per-hypervisor lifecycle implementation.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Short driver name for logs.
    fn name(&self) -> &'static str;

    /// Binds the instance and the event sink to the driver. Must not
    /// perform I/O.
    fn configure(&mut self, instance: Arc<Instance>, sink: EventSinkHandle);

    /// Lets the driver fill defaults and migrate legacy fields in the
    /// instance configuration.
    async fn fill_config(&self, instance: &mut Instance) -> Result<()>;

    /// Precondition check before any resource is created.
    async fn validate(&self) -> Result<()>;

    /// Creates persistent artefacts (identifiers, network attachments).
    async fn create(&self) -> Result<()>;

    /// Materialises the primary disk in whatever format the hypervisor
    /// requires.
    async fn create_disk(&self) -> Result<()>;

    /// Starts the VM. The returned channel resolves exactly once, when
    /// the VM process stops.
    async fn start(&self) -> Result<oneshot::Receiver<VmExit>>;

    /// Graceful shutdown with a driver-chosen timeout. Idempotent.
    async fn stop(&self) -> Result<()>;

    /// Opens the driver's own transport to the guest agent, or `None` to
    /// have the agent use the forwarded Unix socket in the instance
    /// directory. The second element names the transport for logs.
    async fn guest_agent_conn(&self) -> Result<Option<(GuestConn, &'static str)>>;

    /// Static driver facts.
    fn info(&self) -> DriverInfo;

    /// Current SSH address; only meaningful when
    /// [`DriverFeatures::dynamic_ssh_address`] is set.
    async fn ssh_address(&self) -> Result<String>;

    /// Whether the agent must forward the guest-agent Unix socket over
    /// SSH.
    fn forward_guest_agent(&self) -> bool;

    /// Extension point invoked after start, before the requirement
    /// phases.
    async fn additional_setup_for_ssh(&self) -> Result<()>;
}

/// Instantiates the driver for an instance's VM type.
///
/// Real hypervisor drivers register here; the stub driver backs tests and
/// dry runs.
///
/// # Errors
///
/// Returns an error for unknown VM types.
pub fn create_driver(vm_type: &str) -> Result<Box<dyn Driver>> {
    match vm_type {
        "stub" => Ok(Box::new(StubDriver::default())),
        other => Err(VmbridgeError::NotFound { kind: "driver", id: other.to_owned() }),
    }
}

/// A driver that manages no VM at all.
///
/// `start` succeeds immediately and the exit channel stays pending until
/// `stop`; every other operation is a no-op. Used by unit tests and as a
/// harness for agent development.
#[derive(Default)]
pub struct StubDriver {
    instance: Option<Arc<Instance>>,
    sink: Option<EventSinkHandle>,
    exit_tx: Mutex<Option<oneshot::Sender<VmExit>>>,
}

#[async_trait]
impl Driver for StubDriver {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn configure(&mut self, instance: Arc<Instance>, sink: EventSinkHandle) {
        self.instance = Some(instance);
        self.sink = Some(sink);
    }

    async fn fill_config(&self, _instance: &mut Instance) -> Result<()> {
        Ok(())
    }

    async fn validate(&self) -> Result<()> {
        if self.instance.is_none() {
            return Err(VmbridgeError::config("stub driver not configured"));
        }
        Ok(())
    }

    async fn create(&self) -> Result<()> {
        Ok(())
    }

    async fn create_disk(&self) -> Result<()> {
        Ok(())
    }

    async fn start(&self) -> Result<oneshot::Receiver<VmExit>> {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut slot) = self.exit_tx.lock() {
            *slot = Some(tx);
        }
        if let Some(sink) = self.sink.as_ref().and_then(Weak::upgrade) {
            sink.vsock_event(VsockEvent {
                state: vmbridge_common::events::VsockState::Skipped,
                message: Some("stub driver has no vsock".into()),
            });
        }
        Ok(rx)
    }

    async fn stop(&self) -> Result<()> {
        if let Ok(mut slot) = self.exit_tx.lock() {
            if let Some(tx) = slot.take() {
                let _ = tx.send(Ok(()));
            }
        }
        Ok(())
    }

    async fn guest_agent_conn(&self) -> Result<Option<(GuestConn, &'static str)>> {
        Ok(None)
    }

    fn info(&self) -> DriverInfo {
        DriverInfo::default()
    }

    async fn ssh_address(&self) -> Result<String> {
        self.instance
            .as_ref()
            .map(|i| i.ssh_address.clone())
            .ok_or_else(|| VmbridgeError::config("stub driver not configured"))
    }

    fn forward_guest_agent(&self) -> bool {
        false
    }

    async fn additional_setup_for_ssh(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn instance() -> Arc<Instance> {
        Arc::new(Instance {
            name: "default".into(),
            dir: PathBuf::from("/tmp/instance"),
            vm_type: "stub".into(),
            ssh_address: "127.0.0.1".into(),
            ssh_local_port: 60022,
            config: vmbridge_common::instance::InstanceConfig::default(),
            driver_options: serde_json::Value::Null,
        })
    }

    struct CountingSink(AtomicUsize);
    impl EventSink for CountingSink {
        fn vsock_event(&self, _event: VsockEvent) {
            let _ = self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn unknown_vm_type_is_rejected() {
        assert!(create_driver("warp-drive").is_err());
    }

    #[tokio::test]
    async fn stub_exit_channel_fires_once_on_stop() {
        let mut driver = StubDriver::default();
        let sink: Arc<dyn EventSink> = Arc::new(CountingSink(AtomicUsize::new(0)));
        driver.configure(instance(), Arc::downgrade(&sink));
        driver.validate().await.unwrap();

        let exit = driver.start().await.unwrap();
        driver.stop().await.unwrap();
        assert!(exit.await.unwrap().is_ok());

        // Stop is idempotent.
        driver.stop().await.unwrap();
    }

    #[tokio::test]
    async fn dropped_sink_does_not_break_start() {
        let mut driver = StubDriver::default();
        let sink: Arc<dyn EventSink> = Arc::new(CountingSink(AtomicUsize::new(0)));
        driver.configure(instance(), Arc::downgrade(&sink));
        drop(sink);
        let _exit = driver.start().await.unwrap();
    }
}
