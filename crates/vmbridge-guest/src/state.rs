//! Persisted port snapshot.
//!
//! The last emitted snapshot is written to `event-state.json` in the guest
//! runtime directory after every diff. A crashed-and-restarted agent loads
//! it and computes its first delta against the prior view instead of
//! re-announcing every port; a host reboot clears the runtime directory
//! and with it the state.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use vmbridge_common::constants::EVENT_STATE_FILE;
use vmbridge_common::error::{Result, VmbridgeError};
use vmbridge_common::types::PortSnapshot;

/// On-disk form of the persisted snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventState {
    /// Ports visible at the last completed diff.
    #[serde(flatten)]
    pub snapshot: PortSnapshot,
}

/// Path of the state file inside a runtime directory.
#[must_use]
pub fn state_path(runtime_dir: &Path) -> PathBuf {
    runtime_dir.join(EVENT_STATE_FILE)
}

/// Loads the persisted snapshot; a missing or unreadable file is treated
/// as an empty prior view.
#[must_use]
pub fn load(runtime_dir: &Path) -> PortSnapshot {
    let path = state_path(runtime_dir);
    match std::fs::read_to_string(&path) {
        Ok(data) => match serde_json::from_str::<EventState>(&data) {
            Ok(state) => state.snapshot,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "event state corrupt; starting fresh");
                PortSnapshot::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => PortSnapshot::default(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "event state unreadable; starting fresh");
            PortSnapshot::default()
        }
    }
}

/// Persists the snapshot atomically (write-then-rename within the runtime
/// directory).
///
/// # Errors
///
/// Returns an error when the directory cannot be created or the file
/// cannot be written.
pub fn save(runtime_dir: &Path, snapshot: &PortSnapshot) -> Result<()> {
    std::fs::create_dir_all(runtime_dir).map_err(|e| VmbridgeError::io(runtime_dir, e))?;

    let state = EventState { snapshot: snapshot.clone() };
    let data = serde_json::to_vec(&state)?;

    let tmp = runtime_dir.join(format!("{EVENT_STATE_FILE}.tmp"));
    std::fs::write(&tmp, data).map_err(|e| VmbridgeError::io(&tmp, e))?;
    let path = state_path(runtime_dir);
    std::fs::rename(&tmp, &path).map_err(|e| VmbridgeError::io(&path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use vmbridge_common::types::IpPort;

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = PortSnapshot::new(vec![
            IpPort::tcp_any(8080),
            IpPort::tcp_any(22),
        ]);

        save(dir.path(), &snapshot).unwrap();
        let loaded = load(dir.path());
        assert_eq!(loaded, snapshot);
    }

    #[test]
    fn missing_state_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(dir.path()).is_empty());
    }

    #[test]
    fn corrupt_state_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(state_path(dir.path()), b"{not json").unwrap();
        assert!(load(dir.path()).is_empty());
    }

    #[test]
    fn wire_format_is_a_ports_object() {
        let dir = tempfile::tempdir().unwrap();
        save(dir.path(), &PortSnapshot::new(vec![IpPort::tcp_any(80)])).unwrap();

        let raw = std::fs::read_to_string(state_path(dir.path())).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(value["ports"].is_array());
    }
}
