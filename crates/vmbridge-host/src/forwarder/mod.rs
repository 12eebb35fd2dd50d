//! Port forwarder.
//!
//! Consumes the guest agent's delta events and maintains the set of live
//! forwards: one per observed guest endpoint with a matching rule. Two
//! backends exist, SSH control-master forwards and gRPC tunnels, and the
//! protocol dispatch table deciding between them is validated at startup,
//! never at first event.

pub mod grpc_backend;
pub mod pseudo_loopback;
pub mod rules;
pub mod ssh_backend;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use vmbridge_common::constants::ENV_SSH_PORT_FORWARDER;
use vmbridge_common::error::{Result, VmbridgeError};
use vmbridge_common::events::{ForwardAction, PortForwardEvent};
use vmbridge_common::instance::{Instance, PortRule};
use vmbridge_common::types::{IpPort, Protocol};
use vmbridge_proto::pb;

use crate::events::EventEmitter;
use crate::guestwatch::GuestClientPool;
use crate::ssh::{ForwardSpec, SshSession};

use self::grpc_backend::GrpcBackend;
use self::rules::{ForwardPlan, RuleMatch};
use self::ssh_backend::SshBackend;

/// Which mechanism carries a forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// `ssh -O forward` against the control master.
    Ssh,
    /// A `Tunnel` RPC stream per connection.
    Grpc,
}

/// Protocol scope of a backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoScope {
    /// Applies to both protocols.
    Any,
    /// TCP only.
    Tcp,
    /// UDP only.
    Udp,
}

/// The validated protocol→backend dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchTable {
    /// Backend for TCP forwards, `None` when TCP forwarding is disabled.
    pub tcp: Option<BackendKind>,
    /// Backend for UDP forwards, `None` when UDP forwarding is disabled.
    pub udp: Option<BackendKind>,
}

impl DispatchTable {
    /// Builds the table from explicit selections, refusing conflicting
    /// assignments at startup.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when two selections disagree about a
    /// protocol or when UDP is asked to ride SSH.
    pub fn build(selections: &[(ProtoScope, BackendKind)]) -> Result<Self> {
        fn assign(slot: &mut Option<BackendKind>, kind: BackendKind) -> Result<()> {
            match slot {
                Some(existing) if *existing != kind => Err(VmbridgeError::config(
                    "conflicting port forwarder selection; choose one backend per protocol",
                )),
                _ => {
                    *slot = Some(kind);
                    Ok(())
                }
            }
        }

        let mut tcp: Option<BackendKind> = None;
        let mut udp: Option<BackendKind> = None;

        for (scope, kind) in selections {
            match scope {
                ProtoScope::Tcp => assign(&mut tcp, *kind)?,
                ProtoScope::Udp => {
                    if *kind == BackendKind::Ssh {
                        return Err(VmbridgeError::config("UDP cannot be forwarded over SSH"));
                    }
                    assign(&mut udp, *kind)?;
                }
                ProtoScope::Any => {
                    assign(&mut tcp, *kind)?;
                    // any→ssh means tcp→ssh; UDP has no SSH path.
                    if *kind != BackendKind::Ssh {
                        assign(&mut udp, *kind)?;
                    }
                }
            }
        }
        Ok(Self { tcp, udp })
    }

    /// The default table plus the environment override
    /// (`VMBRIDGE_SSH_PORT_FORWARDER`) and the ignore-all rules, which
    /// remove a protocol from the table entirely.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the override value is not a
    /// boolean.
    pub fn for_instance(rules: &[PortRule]) -> Result<Self> {
        Self::for_instance_with_env(rules, std::env::var(ENV_SSH_PORT_FORWARDER).ok().as_deref())
    }

    /// Same as [`Self::for_instance`] with the override value supplied
    /// explicitly. The configured selections are collected and passed
    /// through [`Self::build`], so a conflicting combination is refused
    /// here, before any VM work.
    ///
    /// # Errors
    ///
    /// See [`Self::for_instance`].
    pub fn for_instance_with_env(rules: &[PortRule], env: Option<&str>) -> Result<Self> {
        let selections: Vec<(ProtoScope, BackendKind)> = match env {
            // The override replaces the default assignment rather than
            // adding a second one; UDP is left without a backend because
            // it cannot ride SSH.
            Some("true" | "1") => {
                tracing::info!("SSH port forwarder forced by environment");
                vec![(ProtoScope::Tcp, BackendKind::Ssh)]
            }
            Some("false" | "0" | "") | None => vec![(ProtoScope::Any, BackendKind::Grpc)],
            Some(other) => {
                return Err(VmbridgeError::config(format!(
                    "{ENV_SSH_PORT_FORWARDER} must be a boolean, got {other:?}"
                )));
            }
        };
        let mut table = Self::build(&selections)?;

        for rule in rules {
            if rules::disables_protocol(rule) {
                match rule.proto {
                    Protocol::Tcp => table.tcp = None,
                    Protocol::Udp => table.udp = None,
                }
                tracing::info!(proto = %rule.proto, "event-driven forwarding disabled by rule");
            }
        }
        Ok(table)
    }

    /// Backend for a protocol, if any.
    #[must_use]
    pub const fn backend_for(&self, proto: Protocol) -> Option<BackendKind> {
        match proto {
            Protocol::Tcp => self.tcp,
            Protocol::Udp => self.udp,
        }
    }
}

struct ActiveForward {
    backend: BackendKind,
    plan: ForwardPlan,
    task: Option<tokio::task::JoinHandle<()>>,
    is_static: bool,
}

/// The forward table and its two backends.
pub struct Forwarder {
    rules: Vec<PortRule>,
    dispatch: DispatchTable,
    ssh_local_port: u16,
    ssh: SshBackend,
    grpc: GrpcBackend,
    session: SshSession,
    emitter: Arc<EventEmitter>,
    active: Mutex<HashMap<String, ActiveForward>>,
    socket_statics: Mutex<Vec<SocketStatic>>,
}

struct SocketStatic {
    spec: ForwardSpec,
    guest_sock_to_clean: Option<String>,
}

impl Forwarder {
    /// Creates the forwarder for an instance. The rules get the loopback
    /// sentinel appended; the dispatch table must already be validated.
    #[must_use]
    pub fn new(
        instance: &Arc<Instance>,
        dispatch: DispatchTable,
        session: SshSession,
        pool: Arc<GuestClientPool>,
        emitter: Arc<EventEmitter>,
    ) -> Self {
        Self {
            rules: rules::with_default_rules(instance.config.port_rules.clone()),
            dispatch,
            ssh_local_port: instance.ssh_local_port,
            ssh: SshBackend::new(session.clone(), instance.dir.clone()),
            grpc: GrpcBackend::new(pool),
            session,
            emitter,
            active: Mutex::new(HashMap::new()),
            socket_statics: Mutex::new(Vec::new()),
        }
    }

    /// Applies one guest delta event. Added-before-removed is not
    /// guaranteed and not required: endpoints are uniquely keyed and both
    /// operations are idempotent.
    pub async fn on_event(&self, event: &pb::Event) {
        for wire in &event.removed_local_ports {
            match vmbridge_proto::ip_port_from_pb(wire) {
                Ok(endpoint) => self.remove_forward(&endpoint).await,
                Err(e) => tracing::warn!(error = %e, "bad endpoint in event"),
            }
        }
        for wire in &event.added_local_ports {
            match vmbridge_proto::ip_port_from_pb(wire) {
                Ok(endpoint) => self.add_forward(&endpoint).await,
                Err(e) => tracing::warn!(error = %e, "bad endpoint in event"),
            }
        }
        for error in &event.errors {
            tracing::warn!(guest_error = %error, "guest agent reported a scan problem");
        }
    }

    async fn install_plan(&self, backend: BackendKind, plan: &ForwardPlan) -> Result<Option<tokio::task::JoinHandle<()>>> {
        match backend {
            BackendKind::Ssh => {
                self.ssh.install(plan).await?;
                Ok(None)
            }
            BackendKind::Grpc => Ok(Some(self.grpc.install(plan).await?)),
        }
    }

    async fn add_forward(&self, endpoint: &IpPort) {
        let Some(mut backend) = self.dispatch.backend_for(endpoint.protocol) else {
            tracing::debug!(endpoint = %endpoint, "no backend for protocol; skipping");
            return;
        };
        let plan = match rules::match_rules(&self.rules, endpoint, self.ssh_local_port) {
            RuleMatch::Ignore => return,
            RuleMatch::Forward(plan) => plan,
        };
        if plan.reverse {
            // Guest-listen forwards only exist on the control master.
            backend = BackendKind::Ssh;
        }

        let key = endpoint.to_string();
        let mut active = self.active.lock().await;
        if active.contains_key(&key) {
            return;
        }

        match self.install_plan(backend, &plan).await {
            Ok(task) => {
                tracing::info!(endpoint = %endpoint, local = %plan.local_addr(), "forward installed");
                self.emitter.emit_port_forward(PortForwardEvent {
                    action: ForwardAction::Added,
                    guest: *endpoint,
                    local: plan.local_addr(),
                    protocol: endpoint.protocol,
                    message: None,
                });
                let _ = active.insert(
                    key,
                    ActiveForward { backend, plan, task, is_static: false },
                );
            }
            Err(e) => {
                tracing::warn!(endpoint = %endpoint, error = %e, "forward installation failed");
                self.emitter.emit_port_forward(PortForwardEvent {
                    action: ForwardAction::Failed,
                    guest: *endpoint,
                    local: plan.local_addr(),
                    protocol: endpoint.protocol,
                    message: Some(e.to_string()),
                });
            }
        }
    }

    async fn remove_forward(&self, endpoint: &IpPort) {
        let key = endpoint.to_string();
        let mut active = self.active.lock().await;
        let Some(entry) = active.get(&key) else { return };
        if entry.is_static {
            // Statics outlive events by definition.
            return;
        }
        let Some(forward) = active.remove(&key) else { return };
        drop(active);

        self.teardown(&forward).await;
        tracing::info!(endpoint = %endpoint, "forward removed");
        self.emitter.emit_port_forward(PortForwardEvent {
            action: ForwardAction::Removed,
            guest: *endpoint,
            local: forward.plan.local_addr(),
            protocol: endpoint.protocol,
            message: None,
        });
    }

    async fn teardown(&self, forward: &ActiveForward) {
        match forward.backend {
            BackendKind::Ssh => {
                if let Err(e) = self.ssh.cancel(&forward.plan).await {
                    tracing::warn!(error = %e, "forward cancel failed");
                }
            }
            BackendKind::Grpc => {
                if let Some(task) = &forward.task {
                    task.abort();
                }
            }
        }
    }

    /// Installs the static rules unconditionally. Returned errors feed the
    /// degraded status; they never abort startup.
    pub async fn install_static(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let static_rules: Vec<PortRule> =
            self.rules.iter().filter(|r| r.static_ && !r.ignore).cloned().collect();

        for rule in static_rules {
            if let Err(e) = self.install_static_rule(&rule).await {
                errors.push(format!("static forward: {e}"));
            }
        }
        errors
    }

    async fn install_static_rule(&self, rule: &PortRule) -> Result<()> {
        // Socket-to-socket forwards only exist as statics.
        if let (Some(guest_sock), Some(host_sock)) = (&rule.guest_socket, &rule.host_socket) {
            let guest_sock = guest_sock.display().to_string();
            let (spec, cleanup) = if rule.reverse {
                // The guest-side listener path must be free before ssh
                // binds it, and freed again when we cancel.
                let _ = self
                    .session
                    .run_script(&format!("#!/bin/sh\nrm -f '{guest_sock}'\n"), true)
                    .await?;
                (
                    ForwardSpec::Reverse {
                        remote: guest_sock.clone(),
                        local: host_sock.display().to_string(),
                    },
                    Some(guest_sock),
                )
            } else {
                let _ = std::fs::remove_file(host_sock);
                (
                    ForwardSpec::Local {
                        local: host_sock.display().to_string(),
                        remote: guest_sock,
                    },
                    None,
                )
            };
            self.session.set_forward(&spec, true).await?;
            self.socket_statics
                .lock()
                .await
                .push(SocketStatic { spec, guest_sock_to_clean: cleanup });
            return Ok(());
        }

        let Some(backend) = self.dispatch.backend_for(rule.proto) else {
            return Err(VmbridgeError::config(format!(
                "static rule needs a {} backend but none is configured",
                rule.proto
            )));
        };

        let mut active = self.active.lock().await;
        for (offset, guest_port) in (rule.guest_range.lo..=rule.guest_range.hi).enumerate() {
            let endpoint = IpPort::new(
                rule.guest_ip
                    .unwrap_or(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)),
                guest_port,
                rule.proto,
            );
            let plan = ForwardPlan {
                guest: endpoint,
                host_ip: rule.host_ip,
                host_port: rule.host_range.lo.saturating_add(u16::try_from(offset).unwrap_or(0)),
                reverse: rule.reverse,
            };
            let key = endpoint.to_string();
            if active.contains_key(&key) {
                continue;
            }
            let task = self.install_plan(backend, &plan).await?;
            let _ = active.insert(key, ActiveForward { backend, plan, task, is_static: true });
        }
        Ok(())
    }

    /// Number of live forwards, statics included.
    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    /// Tears down every forward, statics included. One loop over the
    /// table; used at shutdown.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, ActiveForward)> =
            self.active.lock().await.drain().collect();
        for (key, forward) in drained {
            tracing::debug!(forward = %key, "cancelling forward");
            self.teardown(&forward).await;
        }

        let statics: Vec<SocketStatic> =
            self.socket_statics.lock().await.drain(..).collect();
        for static_forward in statics {
            if let Err(e) = self.session.set_forward(&static_forward.spec, false).await {
                tracing::warn!(error = %e, "socket forward cancel failed");
            }
            // Reverse socket forwards leave a guest-side socket file
            // behind.
            if let Some(guest_sock) = static_forward.guest_sock_to_clean {
                let _ = self
                    .session
                    .run_script(&format!("#!/bin/sh\nrm -f '{guest_sock}'\n"), true)
                    .await;
            }
        }
        self.ssh.clear_pseudo_loopbacks();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use vmbridge_common::instance::PortRange;

    fn ignore_all(proto: Protocol) -> PortRule {
        PortRule {
            guest_ip: None,
            guest_range: PortRange::all(),
            guest_socket: None,
            host_ip: "127.0.0.1".parse().unwrap(),
            host_range: PortRange::all(),
            host_socket: None,
            proto,
            reverse: false,
            ignore: true,
            static_: false,
            must_be_zero: false,
        }
    }

    #[test]
    fn default_table_uses_grpc_for_both() {
        let table = DispatchTable::for_instance_with_env(&[], None).unwrap();
        assert_eq!(table.tcp, Some(BackendKind::Grpc));
        assert_eq!(table.udp, Some(BackendKind::Grpc));
    }

    #[test]
    fn env_override_forces_ssh_and_drops_udp() {
        let table = DispatchTable::for_instance_with_env(&[], Some("true")).unwrap();
        assert_eq!(table.tcp, Some(BackendKind::Ssh));
        assert_eq!(table.udp, None);
    }

    #[test]
    fn garbage_env_override_is_a_startup_error() {
        assert!(DispatchTable::for_instance_with_env(&[], Some("maybe")).is_err());
    }

    #[test]
    fn ignore_all_tcp_empties_the_tcp_slot() {
        let table =
            DispatchTable::for_instance_with_env(&[ignore_all(Protocol::Tcp)], None).unwrap();
        assert_eq!(table.tcp, None);
        assert_eq!(table.udp, Some(BackendKind::Grpc));
        assert_eq!(table.backend_for(Protocol::Tcp), None);
    }

    #[test]
    fn conflicting_selections_fail_at_startup() {
        let err = DispatchTable::build(&[
            (ProtoScope::Any, BackendKind::Grpc),
            (ProtoScope::Tcp, BackendKind::Ssh),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("conflicting"));
    }

    #[test]
    fn udp_over_ssh_is_rejected() {
        assert!(DispatchTable::build(&[(ProtoScope::Udp, BackendKind::Ssh)]).is_err());
    }

    #[test]
    fn any_ssh_leaves_udp_unconfigured() {
        let table = DispatchTable::build(&[(ProtoScope::Any, BackendKind::Ssh)]).unwrap();
        assert_eq!(table.tcp, Some(BackendKind::Ssh));
        assert_eq!(table.udp, None);
    }
}
