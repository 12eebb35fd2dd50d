//! Cloud-init progress streaming.
//!
//! While the guest boots, the agent tails cloud-init's output over SSH
//! (`journalctl` on systemd guests, the output log otherwise) and emits
//! one progress event per line so the launching CLI can show live boot
//! output. Completion is recognised from the log text itself; a hard
//! timeout bounds guests whose cloud-init never settles.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use vmbridge_common::error::{Result, VmbridgeError};
use vmbridge_common::events::CloudInitProgress;

use crate::events::EventEmitter;
use crate::ssh::SshSession;

/// Upper bound for the whole watch.
pub const WATCH_TIMEOUT: Duration = Duration::from_secs(600);

/// Tracks completion across the streamed lines.
#[derive(Debug, Default)]
pub struct CompletionTracker {
    saw_service_start: bool,
}

impl CompletionTracker {
    /// Feeds one line; returns true once the line completes the boot.
    pub fn observe(&mut self, line: &str) -> bool {
        if line.contains("cloud-init finished") {
            return true;
        }
        if line.contains("Started cloud-init-main.service") {
            self.saw_service_start = true;
            return false;
        }
        self.saw_service_start && line.contains("cloud-init-main.service: Consumed")
    }
}

/// The remote command used to follow cloud-init output.
#[must_use]
pub fn tail_command(has_systemd: bool) -> &'static str {
    if has_systemd {
        "journalctl -u cloud-init-main.service -b -f"
    } else {
        "tail -f /var/log/cloud-init-output.log"
    }
}

/// Follows cloud-init in the guest and emits one progress event per line
/// until completion or timeout.
///
/// # Errors
///
/// Returns an error when the tail process cannot be spawned; a timeout is
/// reported as a final not-completed event, not an error.
pub async fn watch(session: &SshSession, emitter: &Arc<EventEmitter>) -> Result<()> {
    let probe = session
        .run_script("#!/bin/sh\ntest -d /run/systemd/system\n", true)
        .await?;
    let command = tail_command(probe.success());

    let ssh = which::which("ssh").map_err(|e| VmbridgeError::NotFound {
        kind: "binary",
        id: format!("ssh: {e}"),
    })?;
    let mut args = session.base_args(true);
    args.push("--".to_owned());
    args.push(command.to_owned());

    let mut child = Command::new(ssh)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| VmbridgeError::transport(format!("spawning cloud-init tail: {e}")))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| VmbridgeError::transport("cloud-init tail has no stdout"))?;

    let emitter = Arc::clone(emitter);
    let emitter_timeout = Arc::clone(&emitter);
    let stream = async move {
        let mut lines = BufReader::new(stdout).lines();
        let mut tracker = CompletionTracker::default();
        while let Ok(Some(line)) = lines.next_line().await {
            let completed = tracker.observe(&line);
            emitter.emit_cloud_init(CloudInitProgress {
                active: !completed,
                log_line: Some(line),
                completed,
            });
            if completed {
                tracing::info!("cloud-init finished");
                return true;
            }
        }
        false
    };

    match tokio::time::timeout(WATCH_TIMEOUT, stream).await {
        Ok(_completed) => {}
        Err(_) => {
            tracing::warn!(timeout = ?WATCH_TIMEOUT, "cloud-init watch timed out");
            emitter_timeout.emit_cloud_init(CloudInitProgress {
                active: false,
                log_line: None,
                completed: false,
            });
        }
    }
    let _ = child.kill().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finished_substring_completes() {
        let mut tracker = CompletionTracker::default();
        assert!(!tracker.observe("Starting network..."));
        assert!(tracker.observe("[  12.3] cloud-init finished, took 8.2 seconds"));
    }

    #[test]
    fn systemd_pair_completes_in_order() {
        let mut tracker = CompletionTracker::default();
        assert!(!tracker.observe("cloud-init-main.service: Consumed 2s CPU time"));
        assert!(!tracker.observe("systemd[1]: Started cloud-init-main.service."));
        assert!(tracker.observe("cloud-init-main.service: Consumed 3.4s CPU time"));
    }

    #[test]
    fn tail_command_matches_init_system() {
        assert!(tail_command(true).starts_with("journalctl"));
        assert!(tail_command(false).starts_with("tail"));
    }
}
