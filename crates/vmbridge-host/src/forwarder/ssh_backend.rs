//! SSH forward backend.
//!
//! Forwards are installed against the multiplexed control master with
//! `-O forward` and removed with `-O cancel`, so installation is
//! synchronous and leaves no child process behind. On macOS, privileged
//! loopback ports cannot be bound directly; those forwards go through a
//! Unix socket bound by ssh plus a pseudo-loopback listener.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use vmbridge_common::error::Result;

use crate::forwarder::pseudo_loopback::PseudoLoopback;
use crate::forwarder::rules::ForwardPlan;
use crate::ssh::{ForwardSpec, SshSession};

/// Decides whether a plan needs the pseudo-loopback detour: a privileged
/// loopback port on a macOS host.
#[must_use]
pub fn wants_pseudo_loopback(plan: &ForwardPlan, host_is_macos: bool) -> bool {
    host_is_macos && plan.host_port < 1024 && plan.host_ip.is_loopback()
}

/// SSH forward backend bound to one instance's control master.
pub struct SshBackend {
    session: SshSession,
    instance_dir: PathBuf,
    pseudo: Mutex<HashMap<String, PseudoLoopback>>,
}

impl SshBackend {
    /// Creates the backend.
    #[must_use]
    pub fn new(session: SshSession, instance_dir: PathBuf) -> Self {
        Self { session, instance_dir, pseudo: Mutex::new(HashMap::new()) }
    }

    fn pseudo_sock(&self, plan: &ForwardPlan) -> PathBuf {
        self.instance_dir.join(format!("pseudo-{}.sock", plan.host_port))
    }

    fn spec_for(&self, plan: &ForwardPlan) -> ForwardSpec {
        if plan.reverse {
            return ForwardSpec::Reverse {
                remote: plan.guest.host_port(),
                local: plan.local_addr(),
            };
        }
        if wants_pseudo_loopback(plan, cfg!(target_os = "macos")) {
            return ForwardSpec::Local {
                local: self.pseudo_sock(plan).display().to_string(),
                remote: plan.guest.host_port(),
            };
        }
        ForwardSpec::Local {
            local: plan.local_addr(),
            remote: plan.guest.host_port(),
        }
    }

    /// Installs the forward.
    ///
    /// # Errors
    ///
    /// Returns an error when the control master refuses the forward or
    /// the pseudo-loopback listener cannot bind.
    pub async fn install(&self, plan: &ForwardPlan) -> Result<()> {
        let spec = self.spec_for(plan);

        if let ForwardSpec::Local { local, .. } = &spec {
            // ssh refuses to listen on an existing socket file.
            if local.starts_with('/') {
                let _ = std::fs::remove_file(local);
            }
        }
        self.session.set_forward(&spec, true).await?;

        if wants_pseudo_loopback(plan, cfg!(target_os = "macos")) {
            let listener =
                PseudoLoopback::spawn(plan.host_port, self.pseudo_sock(plan)).await.map_err(
                    |e| {
                        vmbridge_common::error::VmbridgeError::transport(format!(
                            "pseudo-loopback {}: {e}",
                            plan.host_port
                        ))
                    },
                )?;
            if let Ok(mut pseudo) = self.pseudo.lock() {
                let _ = pseudo.insert(plan.local_addr(), listener);
            }
        }
        Ok(())
    }

    /// Cancels the forward and stops any pseudo-loopback listener.
    ///
    /// # Errors
    ///
    /// Returns an error when the control master rejects the cancel.
    pub async fn cancel(&self, plan: &ForwardPlan) -> Result<()> {
        if let Ok(mut pseudo) = self.pseudo.lock() {
            let _ = pseudo.remove(&plan.local_addr());
        }
        let spec = self.spec_for(plan);
        self.session.set_forward(&spec, false).await?;
        if let ForwardSpec::Local { local, .. } = &spec {
            if local.starts_with('/') {
                let _ = std::fs::remove_file(local);
            }
        }
        Ok(())
    }

    /// Drops every pseudo-loopback listener; forward cancellation happens
    /// per-plan during shutdown.
    pub fn clear_pseudo_loopbacks(&self) {
        if let Ok(mut pseudo) = self.pseudo.lock() {
            pseudo.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::net::IpAddr;
    use vmbridge_common::types::{IpPort, Protocol};

    fn plan(host_ip: &str, host_port: u16) -> ForwardPlan {
        ForwardPlan {
            guest: IpPort::new("0.0.0.0".parse().unwrap(), 80, Protocol::Tcp),
            host_ip: host_ip.parse::<IpAddr>().unwrap(),
            host_port,
            reverse: false,
        }
    }

    #[test]
    fn privileged_loopback_detection() {
        assert!(wants_pseudo_loopback(&plan("127.0.0.1", 80), true));
        assert!(!wants_pseudo_loopback(&plan("127.0.0.1", 80), false));
        assert!(!wants_pseudo_loopback(&plan("127.0.0.1", 8080), true));
        assert!(!wants_pseudo_loopback(&plan("0.0.0.0", 80), true));
    }

    #[test]
    fn reverse_plans_render_reverse_specs() {
        let session = {
            use vmbridge_common::instance::{Instance, InstanceConfig};
            let instance = std::sync::Arc::new(Instance {
                name: "default".into(),
                dir: PathBuf::from("/tmp/inst"),
                vm_type: "stub".into(),
                ssh_address: "127.0.0.1".into(),
                ssh_local_port: 60022,
                config: InstanceConfig::default(),
                driver_options: serde_json::Value::Null,
            });
            SshSession::new(&instance)
        };
        let backend = SshBackend::new(session, PathBuf::from("/tmp/inst"));

        let mut reverse = plan("127.0.0.1", 9000);
        reverse.reverse = true;
        assert!(matches!(backend.spec_for(&reverse), ForwardSpec::Reverse { .. }));

        let forward = plan("127.0.0.1", 9000);
        assert!(matches!(backend.spec_for(&forward), ForwardSpec::Local { .. }));
    }
}
