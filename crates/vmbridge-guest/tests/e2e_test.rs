//! End-to-end tests for the guest agent: the real RPC service served over
//! the real Unix-socket fabric, exercised with the real client.
//!
//! The guest's proc tables are simulated with fixture files so the full
//! pipeline (scan, diff, persist, stream, tunnel) runs without root or
//! a VM.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_stream::wrappers::ReceiverStream;

use vmbridge_guest::agent::{AgentConfig, GuestAgent};
use vmbridge_guest::iptables::IptablesScanner;
use vmbridge_guest::service::GuestAgentService;
use vmbridge_proto::pb;
use vmbridge_proto::pb::guest_service_client::GuestServiceClient;
use vmbridge_proto::transport;

const TCP_HEADER: &str =
    "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt uid timeout inode\n";

const LISTEN_8080: &str =
    "   0: 00000000:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000 0 0 1 1\n";

fn write_proc_tables(proc_root: &Path, tcp_rows: &[&str]) {
    let net = proc_root.join("net");
    std::fs::create_dir_all(&net).expect("mkdir proc/net");
    let mut tcp = String::from(TCP_HEADER);
    for row in tcp_rows {
        tcp.push_str(row);
    }
    std::fs::write(net.join("tcp"), tcp).expect("write tcp");
    // The remaining tables exist but are empty, so scans are warning-free.
    for table in ["tcp6", "udp", "udp6"] {
        std::fs::write(net.join(table), TCP_HEADER).expect("write table");
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    proc_root: PathBuf,
    agent: Arc<GuestAgent>,
    client: GuestServiceClient<tonic::transport::Channel>,
    _server: tokio::task::JoinHandle<()>,
}

async fn start_harness() -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let proc_root = dir.path().join("proc");
    write_proc_tables(&proc_root, &[]);

    let agent = Arc::new(GuestAgent::new(
        AgentConfig {
            runtime_dir: dir.path().join("run"),
            proc_root: proc_root.clone(),
        },
        None,
        Arc::new(IptablesScanner::disabled()),
    ));

    let sock = dir.path().join("agent.sock");
    let incoming = transport::unix_incoming(&sock).expect("bind unix socket");
    let service = GuestAgentService::new(Arc::clone(&agent)).into_server();
    let server = tokio::spawn(async move {
        let _ = transport::server_builder()
            .add_service(service)
            .serve_with_incoming(incoming)
            .await;
    });

    // The listener is bound synchronously, so the client can dial at
    // once.
    let channel = transport::connect_unix(&sock).await.expect("connect");
    let client = GuestServiceClient::new(channel);

    Harness { _dir: dir, proc_root, agent, client, _server: server }
}

#[tokio::test]
async fn get_info_reports_listening_ports() {
    let mut harness = start_harness().await;
    write_proc_tables(&harness.proc_root, &[LISTEN_8080]);

    let info = harness
        .client
        .get_info(pb::Empty {})
        .await
        .expect("GetInfo")
        .into_inner();
    assert_eq!(info.local_ports.len(), 1);
    assert_eq!(info.local_ports[0].port, 8080);
    assert_eq!(info.local_ports[0].protocol, "tcp");
    assert!(!info.protocol_version.is_empty());
}

#[tokio::test]
async fn quiet_guest_emits_no_events() {
    let mut harness = start_harness().await;
    let mut events = harness
        .client
        .get_events(pb::Empty {})
        .await
        .expect("GetEvents")
        .into_inner();

    // Two ticks over an unchanged table: the stream must stay silent.
    let _ = harness.agent.tick_once().await;
    let _ = harness.agent.tick_once().await;

    let silence =
        tokio::time::timeout(Duration::from_millis(200), events.message()).await;
    assert!(silence.is_err(), "no event may arrive for an empty delta");
}

#[tokio::test]
async fn bind_and_close_stream_as_delta_events() {
    let mut harness = start_harness().await;
    let _ = harness.agent.tick_once().await;

    let mut events = harness
        .client
        .get_events(pb::Empty {})
        .await
        .expect("GetEvents")
        .into_inner();

    write_proc_tables(&harness.proc_root, &[LISTEN_8080]);
    let _ = harness.agent.tick_once().await;

    let added = tokio::time::timeout(Duration::from_secs(2), events.message())
        .await
        .expect("event within deadline")
        .expect("stream healthy")
        .expect("one event");
    assert_eq!(added.added_local_ports.len(), 1);
    assert_eq!(added.added_local_ports[0].port, 8080);
    assert_eq!(added.added_local_ports[0].ip, "0.0.0.0");
    assert!(added.removed_local_ports.is_empty());

    write_proc_tables(&harness.proc_root, &[]);
    let _ = harness.agent.tick_once().await;

    let removed = tokio::time::timeout(Duration::from_secs(2), events.message())
        .await
        .expect("event within deadline")
        .expect("stream healthy")
        .expect("one event");
    assert!(removed.added_local_ports.is_empty());
    assert_eq!(removed.removed_local_ports.len(), 1);
    assert_eq!(removed.removed_local_ports[0].port, 8080);
}

#[tokio::test]
async fn tunnel_pipes_bytes_to_guest_target() {
    let mut harness = start_harness().await;

    // A "guest" service: TCP echo on loopback.
    let echo = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind echo");
    let echo_addr = echo.local_addr().expect("addr");
    let _ = tokio::spawn(async move {
        while let Ok((mut stream, _)) = echo.accept().await {
            let _ = tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while let Ok(n) = stream.read(&mut buf).await {
                    if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    let (tx, rx) = tokio::sync::mpsc::channel::<pb::TunnelMessage>(8);
    tx.send(pb::TunnelMessage {
        id: "t1".into(),
        guest_addr: echo_addr.to_string(),
        protocol: "tcp".into(),
        data: Vec::new(),
    })
    .await
    .expect("open frame");

    let mut inbound = harness
        .client
        .tunnel(tonic::Request::new(ReceiverStream::new(rx)))
        .await
        .expect("Tunnel")
        .into_inner();

    tx.send(pb::TunnelMessage {
        id: "t1".into(),
        data: b"round trip".to_vec(),
        ..pb::TunnelMessage::default()
    })
    .await
    .expect("data frame");

    let frame = tokio::time::timeout(Duration::from_secs(2), inbound.message())
        .await
        .expect("reply within deadline")
        .expect("stream healthy")
        .expect("one frame");
    assert_eq!(frame.data, b"round trip");

    // Closing the outbound stream ends the tunnel.
    drop(tx);
    let eof = tokio::time::timeout(Duration::from_secs(2), inbound.message())
        .await
        .expect("EOF within deadline")
        .expect("stream healthy");
    assert!(eof.is_none());
}

#[tokio::test]
async fn tunnel_to_dead_target_fails_cleanly() {
    let mut harness = start_harness().await;

    let (tx, rx) = tokio::sync::mpsc::channel::<pb::TunnelMessage>(1);
    tx.send(pb::TunnelMessage {
        id: "t2".into(),
        guest_addr: "127.0.0.1:1".into(),
        protocol: "tcp".into(),
        data: Vec::new(),
    })
    .await
    .expect("open frame");

    let status = harness
        .client
        .tunnel(tonic::Request::new(ReceiverStream::new(rx)))
        .await
        .expect_err("dialing a closed port must fail");
    assert_eq!(status.code(), tonic::Code::Unavailable);
}

#[tokio::test]
async fn sync_time_within_threshold_does_not_adjust() {
    let mut harness = start_harness().await;

    let response = harness
        .client
        .sync_time(pb::TimeSyncRequest { host_time: vmbridge_proto::unix_nanos_now() })
        .await
        .expect("SyncTime")
        .into_inner();
    assert!(!response.adjusted);
    assert!(response.error.is_empty());
    assert!(response.drift_ms.abs() <= 100);
}

#[tokio::test]
async fn post_inotify_restamps_files() {
    let mut harness = start_harness().await;

    let dir = tempfile::tempdir().expect("tempdir");
    let file = dir.path().join("shared.txt");
    std::fs::write(&file, b"content").expect("write");
    let target_nanos: i64 = 1_650_000_000_000_000_000;

    let (tx, rx) = tokio::sync::mpsc::channel::<pb::Inotify>(4);
    tx.send(pb::Inotify {
        mount_path: file.to_string_lossy().into_owned(),
        time: target_nanos,
    })
    .await
    .expect("send inotify");
    tx.send(pb::Inotify {
        mount_path: "/not/a/real/path".into(),
        time: target_nanos,
    })
    .await
    .expect("missing paths are tolerated");
    drop(tx);

    let _ = harness
        .client
        .post_inotify(tonic::Request::new(ReceiverStream::new(rx)))
        .await
        .expect("PostInotify");

    let mtime = std::fs::metadata(&file).expect("stat").modified().expect("mtime");
    assert_eq!(mtime, vmbridge_proto::system_time_from_nanos(target_nanos));
}

#[tokio::test]
async fn event_state_survives_agent_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let proc_root = dir.path().join("proc");
    write_proc_tables(&proc_root, &[LISTEN_8080]);

    let config = AgentConfig {
        runtime_dir: dir.path().join("run"),
        proc_root: proc_root.clone(),
    };

    {
        let agent = GuestAgent::new(
            config.clone(),
            None,
            Arc::new(IptablesScanner::disabled()),
        );
        let event = agent.tick_once().await;
        assert_eq!(event.delta.added.len(), 1);
    }

    // Same runtime dir, fresh process: the port must not be re-announced.
    let agent = GuestAgent::new(
        config,
        None,
        Arc::new(IptablesScanner::disabled()),
    );
    let event = agent.tick_once().await;
    assert!(event.delta.is_empty());
    assert!(event.errors.is_empty());
}
