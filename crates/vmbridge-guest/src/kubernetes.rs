//! Kubernetes service watcher.
//!
//! When `kubectl` is present and authorized, a child process streams watch
//! events for services in all namespaces. The watcher keeps the current
//! service specs in a map keyed by `namespace/name` and expands them into
//! additional listening endpoints: the node port for `NodePort` services,
//! the service port for `LoadBalancer` services. `ClusterIP` services are
//! not reachable from outside the node and are skipped.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use vmbridge_common::types::{IpPort, Protocol};

/// Seconds to wait before respawning a dead kubectl child.
const RESPAWN_DELAY: Duration = Duration::from_secs(10);

/// One entry of a kubectl `--output-watch-events` stream.
#[derive(Debug, Deserialize)]
pub struct WatchEvent {
    #[serde(rename = "type")]
    kind: String,
    object: ServiceObject,
}

#[derive(Debug, Deserialize)]
struct ServiceObject {
    metadata: ServiceMetadata,
    #[serde(default)]
    spec: ServiceSpec,
}

#[derive(Debug, Deserialize)]
struct ServiceMetadata {
    name: String,
    #[serde(default)]
    namespace: String,
}

/// The subset of a service spec the watcher cares about.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceSpec {
    #[serde(rename = "type", default)]
    service_type: String,
    #[serde(default)]
    ports: Vec<ServicePort>,
}

#[derive(Debug, Clone, Deserialize)]
struct ServicePort {
    #[serde(default)]
    port: Option<u16>,
    #[serde(rename = "nodePort", default)]
    node_port: Option<u16>,
    #[serde(default = "default_protocol")]
    protocol: String,
}

fn default_protocol() -> String {
    "TCP".to_owned()
}

/// Service map shared between the watch task and snapshot queries.
pub type ServiceMap = Arc<Mutex<HashMap<String, ServiceSpec>>>;

/// Applies one watch line to the map. Lines that are not valid watch
/// events are ignored (kubectl may pretty-print objects over several
/// lines; see [`LineAssembler`]).
pub fn apply_watch_event(map: &mut HashMap<String, ServiceSpec>, event: &WatchEvent) {
    let key = format!(
        "{}/{}",
        event.object.metadata.namespace, event.object.metadata.name
    );
    match event.kind.as_str() {
        "ADDED" | "MODIFIED" => {
            tracing::debug!(service = %key, kind = %event.kind, "service update");
            let _ = map.insert(key, event.object.spec.clone());
        }
        "DELETED" => {
            tracing::debug!(service = %key, "service removed");
            let _ = map.remove(&key);
        }
        other => tracing::debug!(service = %key, kind = other, "ignored watch event"),
    }
}

/// Expands the current service map into listening endpoints. The bound IP
/// is always the IPv4 unspecified address; kube-proxy answers on every
/// node address.
#[must_use]
pub fn collect_ports(map: &HashMap<String, ServiceSpec>) -> Vec<IpPort> {
    let mut ports = Vec::new();
    for spec in map.values() {
        for service_port in &spec.ports {
            let port = match spec.service_type.as_str() {
                "NodePort" => service_port.node_port,
                "LoadBalancer" => service_port.port,
                _ => None,
            };
            let Some(port) = port else { continue };
            let protocol = match service_port.protocol.as_str() {
                "TCP" => Protocol::Tcp,
                "UDP" => Protocol::Udp,
                _ => continue,
            };
            ports.push(IpPort::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                port,
                protocol,
            ));
        }
    }
    ports
}

/// Reassembles JSON documents from a line stream.
///
/// `kubectl --output json` emits one document per event but may spread it
/// over many lines; the assembler buffers until the buffered text parses.
#[derive(Debug, Default)]
pub struct LineAssembler {
    buffer: String,
}

impl LineAssembler {
    /// Feeds one line; returns a parsed event when the buffer completes a
    /// document.
    pub fn push(&mut self, line: &str) -> Option<WatchEvent> {
        self.buffer.push_str(line);
        self.buffer.push('\n');
        match serde_json::from_str::<WatchEvent>(&self.buffer) {
            Ok(event) => {
                self.buffer.clear();
                Some(event)
            }
            // An unexpected-EOF error means the document is still
            // incomplete; anything else means the buffer holds a complete
            // non-event document and will never parse.
            Err(e) if e.is_eof() => None,
            Err(e) => {
                tracing::debug!(error = %e, "dropping unparseable watch output");
                self.buffer.clear();
                None
            }
        }
    }
}

/// Handle of the running watcher.
pub struct ServiceWatcher {
    map: ServiceMap,
    task: tokio::task::JoinHandle<()>,
}

impl ServiceWatcher {
    /// Probes for a usable kubectl and starts the watch task, or returns
    /// `None` when Kubernetes is not in play on this guest.
    pub async fn start() -> Option<Self> {
        let kubectl = which::which("kubectl").ok()?;

        let authorized = Command::new(&kubectl)
            .args(["auth", "can-i", "get", "service"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await
            .ok()
            .is_some_and(|out| out.status.success());
        if !authorized {
            tracing::info!("kubectl present but not authorized; skipping service watch");
            return None;
        }

        let map: ServiceMap = Arc::new(Mutex::new(HashMap::new()));
        let watch_map = Arc::clone(&map);
        let task = tokio::spawn(async move {
            loop {
                if let Err(e) = watch_once(&kubectl, &watch_map).await {
                    tracing::warn!(error = %e, "kubectl watch ended");
                }
                tokio::time::sleep(RESPAWN_DELAY).await;
            }
        });

        tracing::info!("kubernetes service watcher started");
        Some(Self { map, task })
    }

    /// Current endpoints derived from the watched services.
    #[must_use]
    pub fn ports(&self) -> Vec<IpPort> {
        self.map
            .lock()
            .map(|map| collect_ports(&map))
            .unwrap_or_default()
    }
}

impl Drop for ServiceWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn watch_once(
    kubectl: &std::path::Path,
    map: &ServiceMap,
) -> std::io::Result<()> {
    let mut child = Command::new(kubectl)
        .args([
            "get",
            "--all-namespaces",
            "service",
            "--watch",
            "--output-watch-events",
            "--output",
            "json",
        ])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;

    let stdout = child.stdout.take().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::BrokenPipe, "kubectl stdout missing")
    })?;
    let mut lines = BufReader::new(stdout).lines();
    let mut assembler = LineAssembler::default();

    while let Some(line) = lines.next_line().await? {
        if let Some(event) = assembler.push(&line) {
            if let Ok(mut map) = map.lock() {
                apply_watch_event(&mut map, &event);
            }
        }
    }

    let status = child.wait().await?;
    tracing::debug!(?status, "kubectl exited");
    Ok(())
}
