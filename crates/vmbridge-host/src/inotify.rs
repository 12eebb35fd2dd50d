//! Host→guest file event bridge.
//!
//! Guests cache attributes of reverse-SSHFS mounts, so a file edited on
//! the host can look stale inside the VM until the cache expires. The
//! bridge watches every writable mount recursively and pushes the new
//! modification time of each changed file into the guest agent's
//! `PostInotify` stream, which re-stamps the file inside the guest.
//!
//! Editors fire bursts of events for one save; a per-path dampener drops
//! repeats within a 10 ms window and caps its memory at 10 000 paths.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::{RecursiveMode, Watcher};
use tokio_stream::wrappers::ReceiverStream;

use vmbridge_common::error::{Result, VmbridgeError};
use vmbridge_common::instance::Mount;
use vmbridge_proto::pb;

use crate::guestwatch::GuestClientPool;

/// Repeat-suppression window.
pub const DAMPENER_WINDOW: Duration = Duration::from_millis(10);

/// Maximum dampener entries before a full flush.
pub const DAMPENER_CAP: usize = 10_000;

/// Per-path repeat suppressor.
#[derive(Debug)]
pub struct Dampener {
    window: Duration,
    cap: usize,
    entries: HashMap<PathBuf, Instant>,
}

impl Dampener {
    /// Creates a dampener with the given window and capacity.
    #[must_use]
    pub fn new(window: Duration, cap: usize) -> Self {
        Self { window, cap, entries: HashMap::new() }
    }

    /// Returns true when an event for `path` at `now` should be
    /// forwarded, recording it either way.
    pub fn admit(&mut self, path: &Path, now: Instant) -> bool {
        if self.entries.len() >= self.cap {
            self.entries.clear();
        }
        match self.entries.insert(path.to_path_buf(), now) {
            Some(previous) => now.duration_since(previous) >= self.window,
            None => true,
        }
    }
}

impl Default for Dampener {
    fn default() -> Self {
        Self::new(DAMPENER_WINDOW, DAMPENER_CAP)
    }
}

/// One entry of the host→guest path translation table.
#[derive(Debug, Clone)]
pub struct MountMapping {
    /// Host location, symlinks resolved.
    pub host: PathBuf,
    /// Guest mount point.
    pub guest: PathBuf,
}

/// Builds the translation table for the writable mounts, resolving
/// host-side symlinks once up front.
#[must_use]
pub fn build_mappings(mounts: &[Mount]) -> Vec<MountMapping> {
    mounts
        .iter()
        .filter(|m| m.writable)
        .map(|m| MountMapping {
            host: std::fs::canonicalize(&m.location).unwrap_or_else(|_| m.location.clone()),
            guest: m.mount_point.clone(),
        })
        .collect()
}

/// Translates a host path to its guest-visible form through the mount
/// table; the longest matching mount wins.
#[must_use]
pub fn translate_path(mappings: &[MountMapping], host_path: &Path) -> Option<PathBuf> {
    let mut best: Option<(&MountMapping, usize)> = None;
    for mapping in mappings {
        if host_path.starts_with(&mapping.host) {
            let depth = mapping.host.components().count();
            if best.is_none_or(|(_, d)| depth > d) {
                best = Some((mapping, depth));
            }
        }
    }
    let (mapping, _) = best?;
    let relative = host_path.strip_prefix(&mapping.host).ok()?;
    Some(mapping.guest.join(relative))
}

/// The running bridge.
pub struct InotifyBridge {
    pool: Arc<GuestClientPool>,
    mappings: Vec<MountMapping>,
}

impl InotifyBridge {
    /// Creates a bridge for the writable mounts of an instance.
    #[must_use]
    pub fn new(pool: Arc<GuestClientPool>, mounts: &[Mount]) -> Self {
        Self { pool, mappings: build_mappings(mounts) }
    }

    /// True when there is nothing to watch.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Watches the mounts and streams timestamp updates to the guest
    /// until the stream or the watcher fails.
    ///
    /// # Errors
    ///
    /// Returns an error when the watcher cannot be created or the
    /// `PostInotify` stream cannot be opened.
    pub async fn run(&self) -> Result<()> {
        if self.mappings.is_empty() {
            return Ok(());
        }

        let (event_tx, event_rx) = tokio::sync::mpsc::channel::<PathBuf>(256);
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
            match result {
                Ok(event) => {
                    for path in event.paths {
                        // Dropped events under pressure are fine; the
                        // guest cache expires on its own eventually.
                        let _ = event_tx.blocking_send(path);
                    }
                }
                Err(e) => tracing::warn!(error = %e, "file watcher error"),
            }
        })
        .map_err(|e| VmbridgeError::config(format!("creating file watcher: {e}")))?;

        for mapping in &self.mappings {
            watcher
                .watch(&mapping.host, RecursiveMode::Recursive)
                .map_err(|e| {
                    VmbridgeError::config(format!("watching {}: {e}", mapping.host.display()))
                })?;
            tracing::info!(path = %mapping.host.display(), "watching mount");
        }

        let mut client = self.pool.client().await?;
        let (inotify_tx, inotify_rx) = tokio::sync::mpsc::channel::<pb::Inotify>(256);
        let post = client.post_inotify(tonic::Request::new(ReceiverStream::new(inotify_rx)));
        tokio::pin!(post);

        let mut dampener = Dampener::default();
        let mut event_rx = event_rx;

        loop {
            tokio::select! {
                result = &mut post => {
                    return match result {
                        Ok(_) => Ok(()),
                        Err(e) => Err(VmbridgeError::transport(format!("PostInotify: {e}"))),
                    };
                }
                maybe_path = event_rx.recv() => {
                    let Some(path) = maybe_path else {
                        return Ok(());
                    };
                    if !dampener.admit(&path, Instant::now()) {
                        continue;
                    }
                    let Ok(metadata) = std::fs::metadata(&path) else { continue };
                    let Ok(modified) = metadata.modified() else { continue };
                    let Some(guest_path) = translate_path(&self.mappings, &path) else {
                        continue;
                    };
                    let nanos = modified
                        .duration_since(std::time::UNIX_EPOCH)
                        .ok()
                        .and_then(|d| i64::try_from(d.as_nanos()).ok())
                        .unwrap_or_default();
                    let message = pb::Inotify {
                        mount_path: guest_path.to_string_lossy().into_owned(),
                        time: nanos,
                    };
                    if inotify_tx.send(message).await.is_err() {
                        return Err(VmbridgeError::transport("inotify stream closed"));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn dampener_blocks_rapid_repeats() {
        let mut dampener = Dampener::new(Duration::from_millis(10), 100);
        let now = Instant::now();
        let path = Path::new("/src/main.rs");

        assert!(dampener.admit(path, now));
        assert!(!dampener.admit(path, now + Duration::from_millis(5)));
        assert!(dampener.admit(path, now + Duration::from_millis(20)));
    }

    #[test]
    fn dampener_distinguishes_paths() {
        let mut dampener = Dampener::new(Duration::from_millis(10), 100);
        let now = Instant::now();
        assert!(dampener.admit(Path::new("/a"), now));
        assert!(dampener.admit(Path::new("/b"), now));
    }

    #[test]
    fn dampener_flushes_when_full() {
        let mut dampener = Dampener::new(Duration::from_millis(10), 2);
        let now = Instant::now();
        assert!(dampener.admit(Path::new("/a"), now));
        assert!(dampener.admit(Path::new("/b"), now));
        // Cache full: flush, so /a is admitted again immediately.
        assert!(dampener.admit(Path::new("/a"), now + Duration::from_millis(1)));
    }

    #[test]
    fn translation_picks_longest_mount() {
        let mappings = vec![
            MountMapping { host: PathBuf::from("/home/user"), guest: PathBuf::from("/home/user") },
            MountMapping {
                host: PathBuf::from("/home/user/src"),
                guest: PathBuf::from("/workspace"),
            },
        ];
        assert_eq!(
            translate_path(&mappings, Path::new("/home/user/src/lib.rs")),
            Some(PathBuf::from("/workspace/lib.rs"))
        );
        assert_eq!(
            translate_path(&mappings, Path::new("/home/user/notes.txt")),
            Some(PathBuf::from("/home/user/notes.txt"))
        );
        assert_eq!(translate_path(&mappings, Path::new("/etc/passwd")), None);
    }

    #[test]
    fn only_writable_mounts_are_mapped() {
        let mounts = vec![
            Mount {
                location: PathBuf::from("/tmp"),
                mount_point: PathBuf::from("/tmp"),
                writable: false,
                sftp_driver: None,
                cache: false,
                follow_symlinks: false,
            },
        ];
        assert!(build_mappings(&mounts).is_empty());
    }
}
