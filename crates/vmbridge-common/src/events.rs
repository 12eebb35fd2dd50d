//! Host-side event model.
//!
//! The host agent reports progress as a stream of JSON-encoded [`Event`]
//! lines on stdout. Consumers (typically the CLI that launched the agent)
//! tail this stream and treat it as the source of truth for instance state:
//! a `running=true` status means the VM is usable, `exiting=true` terminates
//! the stream.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{IpPort, Protocol};

/// One line of the host agent's stdout stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Time the event was composed.
    pub time: DateTime<Utc>,
    /// Status payload.
    pub status: Status,
}

impl Event {
    /// Wraps a status with the current timestamp.
    #[must_use]
    pub fn now(status: Status) -> Self {
        Self { time: Utc::now(), status }
    }

    /// Encodes the event as a single JSON line with an RFC 3339 nanosecond
    /// timestamp.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json_line(&self) -> crate::error::Result<String> {
        // chrono serializes DateTime<Utc> with nanosecond precision already;
        // keep the representation pinned regardless of serde defaults.
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Wire<'a> {
            time: String,
            status: &'a Status,
        }
        let wire = Wire {
            time: self.time.to_rfc3339_opts(SecondsFormat::Nanos, true),
            status: &self.status,
        };
        Ok(serde_json::to_string(&wire)?)
    }
}

/// Boot lifecycle and per-subsystem progress of one instance.
///
/// `running` transitions false→true exactly once per agent lifetime and
/// `exiting` is terminal; the emitter in the host agent enforces this.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    /// The instance finished its boot phases and is usable.
    pub running: bool,
    /// The instance is usable but some optional setup failed.
    pub degraded: bool,
    /// The agent is shutting down; no further events follow.
    pub exiting: bool,
    /// Human-readable errors accumulated while degraded.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    /// Host-side SSH port of the instance.
    pub ssh_local_port: u16,
    /// Port-forward lifecycle transition, if this event carries one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_forward: Option<PortForwardEvent>,
    /// Vsock SSH fallback decision, if this event carries one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vsock: Option<VsockEvent>,
    /// Live cloud-init output line, if this event carries one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_init_progress: Option<CloudInitProgress>,
}

/// What happened to a single forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardAction {
    /// The forward was installed.
    Added,
    /// The forward was torn down.
    Removed,
    /// The forward could not be installed; the next matching event retries.
    Failed,
}

/// Per-forward lifecycle transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortForwardEvent {
    /// Transition kind.
    pub action: ForwardAction,
    /// Guest-side endpoint the forward targets.
    pub guest: IpPort,
    /// Host-side bind address (`host:port` or a Unix socket path).
    pub local: String,
    /// Transport protocol.
    pub protocol: Protocol,
    /// Failure detail for [`ForwardAction::Failed`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Outcome of a driver's attempt to reach in-guest SSH over vsock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VsockState {
    /// The vsock SSH path was established.
    Started,
    /// The vsock SSH path was attempted and failed.
    Failed,
    /// The driver decided not to attempt vsock SSH.
    Skipped,
}

/// Vsock SSH fallback decision emitted by a driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VsockEvent {
    /// Decision outcome.
    pub state: VsockState,
    /// Optional detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// One line of cloud-init output, streamed live during boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudInitProgress {
    /// Cloud-init is still running.
    pub active: bool,
    /// The observed output line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_line: Option<String>,
    /// Cloud-init reported completion.
    pub completed: bool,
}
