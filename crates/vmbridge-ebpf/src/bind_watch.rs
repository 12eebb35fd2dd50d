//! Tick source driven by bind syscalls.

use std::path::PathBuf;
use std::time::Instant;

use tokio::sync::mpsc;

use vmbridge_common::error::{Result, VmbridgeError};

/// Default location of the prebuilt tracepoint object.
pub const DEFAULT_OBJECT_PATH: &str = "/usr/lib/vmbridge/bind_watch.bpf.o";

/// Ring-buffer map name exported by the program.
#[cfg(all(target_os = "linux", feature = "ebpf"))]
const EVENTS_MAP: &str = "BIND_EVENTS";

/// Config array map; index 0 holds the PID the program must ignore.
#[cfg(all(target_os = "linux", feature = "ebpf"))]
const CONFIG_MAP: &str = "BIND_CONFIG";

/// Configuration for [`BindWatch::load`].
#[derive(Debug, Clone)]
pub struct BindWatchConfig {
    /// Path of the compiled BPF object.
    pub object_path: PathBuf,
    /// Maximum ticks emitted per second; extra bind records are coalesced.
    pub ticks_per_second: u32,
}

impl Default for BindWatchConfig {
    fn default() -> Self {
        Self {
            object_path: PathBuf::from(DEFAULT_OBJECT_PATH),
            ticks_per_second: 8,
        }
    }
}

/// A loaded bind watcher.
///
/// Dropping the watcher detaches the tracepoints and releases the maps;
/// the tick channel closes once the reader task observes the shutdown.
#[derive(Debug)]
pub struct BindWatch {
    rx: mpsc::Receiver<Instant>,
    _shutdown: tokio::sync::oneshot::Sender<()>,
}

impl BindWatch {
    /// Receives the next tick; `None` once the watcher is shut down.
    pub async fn recv(&mut self) -> Option<Instant> {
        self.rx.recv().await
    }

    /// Loads the program, attaches the bind tracepoints, and starts the
    /// ring-buffer reader.
    ///
    /// # Errors
    ///
    /// Returns [`VmbridgeError::Unsupported`] when built without the
    /// `ebpf` feature or on non-Linux targets, and a config error when the
    /// object is missing, the kernel refuses the program, or attachment
    /// fails. Callers degrade to the interval ticker on any error.
    #[cfg(all(target_os = "linux", feature = "ebpf"))]
    pub fn load(config: &BindWatchConfig) -> Result<Self> {
        use aya::maps::{Array, RingBuf};
        use aya::programs::TracePoint;

        let mut ebpf = aya::Ebpf::load_file(&config.object_path).map_err(|e| {
            VmbridgeError::config(format!(
                "loading {} failed: {e}",
                config.object_path.display()
            ))
        })?;

        // The program filters its own emitter out by PID, otherwise the
        // agent's sockets would tick the agent.
        let own_pid = std::process::id();
        let mut pid_filter: Array<_, u32> = Array::try_from(
            ebpf.take_map(CONFIG_MAP)
                .ok_or_else(|| VmbridgeError::config(format!("map {CONFIG_MAP} missing")))?,
        )
        .map_err(|e| VmbridgeError::config(format!("map {CONFIG_MAP}: {e}")))?;
        pid_filter
            .set(0, own_pid, 0)
            .map_err(|e| VmbridgeError::config(format!("setting pid filter: {e}")))?;

        for tracepoint in ["sys_enter_bind", "sys_exit_bind"] {
            let program: &mut TracePoint = ebpf
                .program_mut(tracepoint)
                .ok_or_else(|| VmbridgeError::config(format!("program {tracepoint} missing")))?
                .try_into()
                .map_err(|e| VmbridgeError::config(format!("program {tracepoint}: {e}")))?;
            program
                .load()
                .map_err(|e| VmbridgeError::config(format!("loading {tracepoint}: {e}")))?;
            let _ = program
                .attach("syscalls", tracepoint)
                .map_err(|e| VmbridgeError::config(format!("attaching {tracepoint}: {e}")))?;
        }

        let mut ring = RingBuf::try_from(
            ebpf.take_map(EVENTS_MAP)
                .ok_or_else(|| VmbridgeError::config(format!("map {EVENTS_MAP} missing")))?,
        )
        .map_err(|e| VmbridgeError::config(format!("map {EVENTS_MAP}: {e}")))?;

        let (tx, rx) = mpsc::channel(1);
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let min_gap = std::time::Duration::from_secs(1) / config.ticks_per_second.max(1);

        let _ = tokio::task::spawn_blocking(move || {
            // Keep the loaded programs alive for as long as the reader runs.
            let _ebpf = ebpf;
            let mut last_tick: Option<Instant> = None;
            loop {
                match shutdown_rx.try_recv() {
                    Err(tokio::sync::oneshot::error::TryRecvError::Empty) => {}
                    _ => break,
                }
                let mut saw_bind = false;
                while ring.next().is_some() {
                    saw_bind = true;
                }
                let now = Instant::now();
                let due = last_tick.is_none_or(|t| now.duration_since(t) >= min_gap);
                if saw_bind && due {
                    last_tick = Some(now);
                    if tx.blocking_send(now).is_err() {
                        break;
                    }
                }
                std::thread::sleep(std::time::Duration::from_millis(20));
            }
            tracing::debug!("bind watcher stopped");
        });

        tracing::info!("bind watcher attached");
        Ok(Self { rx, _shutdown: shutdown_tx })
    }

    /// Stub for builds without BPF support.
    ///
    /// # Errors
    ///
    /// Always returns [`VmbridgeError::Unsupported`].
    #[cfg(not(all(target_os = "linux", feature = "ebpf")))]
    pub fn load(_config: &BindWatchConfig) -> Result<Self> {
        Err(VmbridgeError::Unsupported {
            message: "bind watcher requires Linux and the ebpf feature".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[cfg(not(all(target_os = "linux", feature = "ebpf")))]
    #[test]
    fn load_is_unsupported_without_feature() {
        let err = BindWatch::load(&BindWatchConfig::default()).unwrap_err();
        assert!(matches!(err, VmbridgeError::Unsupported { .. }));
    }

    #[test]
    fn default_config_points_at_shipped_object() {
        let config = BindWatchConfig::default();
        assert_eq!(config.object_path, PathBuf::from(DEFAULT_OBJECT_PATH));
        assert!(config.ticks_per_second > 0);
    }
}
