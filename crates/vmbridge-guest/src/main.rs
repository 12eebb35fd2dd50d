//! # vmbridge-guestd
//!
//! Root daemon running inside the guest. Scans for listening sockets,
//! serves the guest-agent RPC, and keeps the clock aligned with the host.

#![allow(clippy::print_stderr)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use vmbridge_common::constants::{DEFAULT_VSOCK_PORT, GUEST_AGENT_SOCK, GUEST_RUNTIME_DIR};
use vmbridge_ebpf::BindWatchConfig;
use vmbridge_guest::agent::{AgentConfig, GuestAgent};
use vmbridge_guest::audit::AuditWatcher;
use vmbridge_guest::iptables::IptablesScanner;
use vmbridge_guest::kubernetes::ServiceWatcher;
use vmbridge_guest::service::GuestAgentService;
use vmbridge_guest::ticker::Ticker;
use vmbridge_guest::timesync;
use vmbridge_proto::transport;

/// Guest agent daemon for vmbridge-managed VMs.
#[derive(Debug, Parser)]
#[command(name = "vmbridge-guestd", version)]
struct Args {
    /// Interval between port scans, e.g. "3s" or "500ms".
    #[arg(long, default_value = "3s", value_parser = parse_duration)]
    tick: Duration,

    /// Listen on a vsock port instead of the Unix socket.
    #[arg(long, conflicts_with = "virtio_port")]
    vsock_port: Option<u32>,

    /// Listen on a virtio serial port instead of the Unix socket.
    #[arg(long, conflicts_with = "vsock_port")]
    virtio_port: Option<String>,

    /// Unix socket path for the default transport.
    #[arg(long, default_value = GUEST_AGENT_SOCK)]
    socket: PathBuf,

    /// Runtime directory for the persisted port snapshot.
    #[arg(long, default_value = GUEST_RUNTIME_DIR)]
    state_dir: PathBuf,
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    if let Some(ms) = value.strip_suffix("ms") {
        let n: u64 = ms.parse().map_err(|_| format!("invalid duration: {value}"))?;
        return Ok(Duration::from_millis(n));
    }
    let secs = value.strip_suffix('s').unwrap_or(value);
    let n: u64 = secs.parse().map_err(|_| format!("invalid duration: {value}"))?;
    Ok(Duration::from_secs(n))
}

async fn shutdown_signal() {
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                let _ = signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                futures::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        () = terminate => {}
    }
    tracing::info!("shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if !nix::unistd::geteuid().is_root() {
        anyhow::bail!("vmbridge-guestd must run as root");
    }

    let iptables = Arc::new(IptablesScanner::new(args.tick));
    let kubernetes = ServiceWatcher::start().await;
    let agent = Arc::new(GuestAgent::new(
        AgentConfig {
            runtime_dir: args.state_dir.clone(),
            proc_root: PathBuf::from("/proc"),
        },
        kubernetes,
        iptables,
    ));

    match vmbridge_guest::procnet::list_unix_listeners(std::path::Path::new("/proc")) {
        Ok(unix_listeners) => {
            tracing::debug!(count = unix_listeners.len(), "unix listeners at startup");
        }
        Err(e) => tracing::debug!(error = %e, "unix socket table unavailable"),
    }

    // Keep the audit subscription alive for the daemon's lifetime; without
    // it the iptables scanner simply runs every tick.
    let audit = match AuditWatcher::start(agent.iptables()) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            tracing::info!(error = %e, "audit watch unavailable");
            None
        }
    };

    let _ = tokio::spawn(timesync::fix_system_time_skew());

    let ticker = Ticker::with_bind_watch(args.tick, &BindWatchConfig::default());
    let event_agent = Arc::clone(&agent);
    let _ = tokio::spawn(async move { event_agent.run_event_loop(ticker).await });

    let service = GuestAgentService::new(agent).into_server();
    let server = transport::server_builder().add_service(service);

    if let Some(port) = args.vsock_port {
        let port = if port == 0 { DEFAULT_VSOCK_PORT } else { port };
        tracing::info!(port, "serving on vsock");
        let incoming = transport::vsock_incoming(port).context("binding vsock listener")?;
        server
            .serve_with_incoming_shutdown(incoming, shutdown_signal())
            .await
            .context("vsock server failed")?;
    } else if let Some(name) = args.virtio_port {
        let device = PathBuf::from(format!("/dev/virtio-ports/{name}"));
        tracing::info!(device = %device.display(), "serving on virtio serial");
        let incoming = transport::serial_incoming(device)
            .await
            .context("opening virtio serial port")?;
        server
            .serve_with_incoming_shutdown(incoming, shutdown_signal())
            .await
            .context("virtio serial server failed")?;
    } else {
        tracing::info!(socket = %args.socket.display(), "serving on unix socket");
        let incoming =
            transport::unix_incoming(&args.socket).context("binding unix socket")?;
        server
            .serve_with_incoming_shutdown(incoming, shutdown_signal())
            .await
            .context("unix socket server failed")?;
        let _ = std::fs::remove_file(&args.socket);
    }

    drop(audit);
    Ok(())
}
