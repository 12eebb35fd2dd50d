//! Guest agent core: scan, diff, publish.
//!
//! On every tick the agent composes a snapshot from the kernel tables and
//! the service watchers, diffs it against the previous snapshot, persists
//! the new snapshot, and publishes the delta to every connected event
//! stream. An event is only published when it carries information: at
//! least one addition, removal, or scan error.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use vmbridge_common::types::{PortDelta, PortSnapshot, compare_ports};

use crate::iptables::IptablesScanner;
use crate::kubernetes::ServiceWatcher;
use crate::{procnet, state, ticker::Ticker};

/// One port-set delta, as published to event subscribers.
#[derive(Debug, Clone)]
pub struct GuestEvent {
    /// When the diff was computed.
    pub time: DateTime<Utc>,
    /// Added and removed endpoints.
    pub delta: PortDelta,
    /// Scan problems observed on this tick.
    pub errors: Vec<String>,
}

impl GuestEvent {
    /// True when the event carries no additions, removals, or errors; the
    /// timestamp alone does not make an event.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.delta.is_empty() && self.errors.is_empty()
    }
}

/// Construction parameters for [`GuestAgent`].
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Directory holding `event-state.json`.
    pub runtime_dir: PathBuf,
    /// Root of the proc filesystem; overridable for tests.
    pub proc_root: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            runtime_dir: PathBuf::from(vmbridge_common::constants::GUEST_RUNTIME_DIR),
            proc_root: PathBuf::from("/proc"),
        }
    }
}

/// Long-lived agent state shared by the event loop and the RPC service.
pub struct GuestAgent {
    config: AgentConfig,
    kubernetes: Option<ServiceWatcher>,
    iptables: Arc<IptablesScanner>,
    last_snapshot: Mutex<PortSnapshot>,
    events_tx: broadcast::Sender<GuestEvent>,
}

impl GuestAgent {
    /// Creates the agent, loading the persisted snapshot so a restart
    /// diffs against the prior view instead of re-announcing every port.
    #[must_use]
    pub fn new(
        config: AgentConfig,
        kubernetes: Option<ServiceWatcher>,
        iptables: Arc<IptablesScanner>,
    ) -> Self {
        let initial = state::load(&config.runtime_dir);
        let (events_tx, _) = broadcast::channel(128);
        Self {
            config,
            kubernetes,
            iptables,
            last_snapshot: Mutex::new(initial),
            events_tx,
        }
    }

    /// The iptables scanner, shared with the audit watcher.
    #[must_use]
    pub fn iptables(&self) -> Arc<IptablesScanner> {
        Arc::clone(&self.iptables)
    }

    /// Subscribes to the event stream.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<GuestEvent> {
        self.events_tx.subscribe()
    }

    /// Composes a fresh snapshot from all sources. Unreadable sources
    /// degrade to warnings, never to a failed scan.
    pub async fn scan_snapshot(&self) -> (PortSnapshot, Vec<String>) {
        let mut ports = Vec::new();
        let mut errors = Vec::new();

        match procnet::scan(&self.config.proc_root) {
            Ok(result) => {
                ports.extend(result.listeners);
                errors.extend(result.warnings);
            }
            Err(e) => errors.push(e.to_string()),
        }

        if let Some(watcher) = &self.kubernetes {
            ports.extend(watcher.ports());
        }

        ports.extend(self.iptables.scan().await);

        (PortSnapshot::new(ports), errors)
    }

    /// Runs one tick: scan, diff, persist, publish. Returns the event
    /// whether or not it was worth publishing; callers and tests can
    /// inspect it.
    pub async fn tick_once(&self) -> GuestEvent {
        let (snapshot, mut errors) = self.scan_snapshot().await;

        let delta = {
            let Ok(mut last) = self.last_snapshot.lock() else {
                return GuestEvent {
                    time: Utc::now(),
                    delta: PortDelta::default(),
                    errors: vec!["snapshot lock poisoned".into()],
                };
            };
            let delta = compare_ports(&last, &snapshot);
            *last = snapshot.clone();
            delta
        };

        if let Err(e) = state::save(&self.config.runtime_dir, &snapshot) {
            errors.push(format!("persisting event state: {e}"));
        }

        let event = GuestEvent { time: Utc::now(), delta, errors };
        if !event.is_empty() {
            tracing::info!(
                added = event.delta.added.len(),
                removed = event.delta.removed.len(),
                errors = event.errors.len(),
                "port delta"
            );
            // No receiver connected yet is fine; the host catches up via
            // GetInfo when it attaches.
            let _ = self.events_tx.send(event.clone());
        }
        event
    }

    /// Drives [`Self::tick_once`] from the ticker until it closes.
    pub async fn run_event_loop(&self, mut ticker: Ticker) {
        while let Some(_at) = ticker.tick().await {
            let _ = self.tick_once().await;
        }
        tracing::info!("event loop stopped");
    }
}
