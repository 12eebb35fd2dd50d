//! Status event emitter.
//!
//! All host-agent progress flows through one emitter that serialises
//! events as JSON lines and enforces the stream invariants: statuses are
//! totally ordered (one encoder, one lock), `running` rises exactly once,
//! and `exiting` is terminal: nothing is emitted after it.

use std::io::Write;
use std::sync::Mutex;

use vmbridge_common::error::Result;
use vmbridge_common::events::{
    CloudInitProgress, Event, PortForwardEvent, Status, VsockEvent,
};

use crate::driver::EventSink;

struct Inner {
    writer: Box<dyn Write + Send>,
    running: bool,
    degraded: bool,
    errors: Vec<String>,
    exited: bool,
}

/// Serialising emitter for the stdout event stream.
pub struct EventEmitter {
    ssh_local_port: u16,
    inner: Mutex<Inner>,
}

impl EventEmitter {
    /// Creates an emitter writing JSON lines to `writer`.
    #[must_use]
    pub fn new(writer: Box<dyn Write + Send>, ssh_local_port: u16) -> Self {
        Self {
            ssh_local_port,
            inner: Mutex::new(Inner {
                writer,
                running: false,
                degraded: false,
                errors: Vec::new(),
                exited: false,
            }),
        }
    }

    /// Emitter for the agent's stdout.
    #[must_use]
    pub fn stdout(ssh_local_port: u16) -> Self {
        Self::new(Box::new(std::io::stdout()), ssh_local_port)
    }

    fn base_status(&self, inner: &Inner) -> Status {
        Status {
            running: inner.running,
            degraded: inner.degraded,
            exiting: inner.exited,
            errors: inner.errors.clone(),
            ssh_local_port: self.ssh_local_port,
            port_forward: None,
            vsock: None,
            cloud_init_progress: None,
        }
    }

    fn write_event(inner: &mut Inner, event: &Event) {
        match event.to_json_line() {
            Ok(line) => {
                if writeln!(inner.writer, "{line}").and_then(|()| inner.writer.flush()).is_err() {
                    tracing::warn!("event stream writer failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "event encoding failed"),
        }
    }

    /// Emits a boot-lifecycle status. `running` can only rise; a stray
    /// false after true is kept true. Ignored entirely after exit.
    pub fn emit_status(&self, running: bool, degraded: bool, errors: Vec<String>) {
        let Ok(mut inner) = self.inner.lock() else { return };
        if inner.exited {
            return;
        }
        inner.running = inner.running || running;
        inner.degraded = degraded;
        inner.errors = errors;
        let event = Event::now(self.base_status(&inner));
        Self::write_event(&mut inner, &event);
    }

    /// Emits the terminal status and seals the stream.
    pub fn emit_exiting(&self) {
        let Ok(mut inner) = self.inner.lock() else { return };
        if inner.exited {
            return;
        }
        inner.exited = true;
        let event = Event::now(self.base_status(&inner));
        Self::write_event(&mut inner, &event);
    }

    /// Emits a per-forward lifecycle transition on top of the current
    /// status.
    pub fn emit_port_forward(&self, forward: PortForwardEvent) {
        let Ok(mut inner) = self.inner.lock() else { return };
        if inner.exited {
            return;
        }
        let mut status = self.base_status(&inner);
        status.port_forward = Some(forward);
        let event = Event::now(status);
        Self::write_event(&mut inner, &event);
    }

    /// Emits a driver vsock decision on top of the current status.
    pub fn emit_vsock(&self, vsock: VsockEvent) {
        let Ok(mut inner) = self.inner.lock() else { return };
        if inner.exited {
            return;
        }
        let mut status = self.base_status(&inner);
        status.vsock = Some(vsock);
        let event = Event::now(status);
        Self::write_event(&mut inner, &event);
    }

    /// Emits one line of cloud-init progress on top of the current
    /// status.
    pub fn emit_cloud_init(&self, progress: CloudInitProgress) {
        let Ok(mut inner) = self.inner.lock() else { return };
        if inner.exited {
            return;
        }
        let mut status = self.base_status(&inner);
        status.cloud_init_progress = Some(progress);
        let event = Event::now(status);
        Self::write_event(&mut inner, &event);
    }

    /// True once the terminal status went out.
    #[must_use]
    pub fn exited(&self) -> bool {
        self.inner.lock().map(|i| i.exited).unwrap_or(true)
    }
}

impl EventSink for EventEmitter {
    fn vsock_event(&self, event: VsockEvent) {
        self.emit_vsock(event);
    }
}

/// Test helper: a writer that shares its buffer.
#[cfg(test)]
#[derive(Clone, Default)]
pub(crate) struct SharedBuf(pub std::sync::Arc<Mutex<Vec<u8>>>);

#[cfg(test)]
impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().map_or(Ok(buf.len()), |mut b| {
            b.extend_from_slice(buf);
            Ok(buf.len())
        })
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
impl SharedBuf {
    pub(crate) fn lines(&self) -> Vec<serde_json::Value> {
        let Ok(buf) = self.0.lock() else { return Vec::new() };
        String::from_utf8_lossy(&buf)
            .lines()
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect()
    }
}

/// Decodes one line of the emitted stream back into an [`Event`].
///
/// # Errors
///
/// Returns an error when the line is not a valid event.
pub fn parse_event_line(line: &str) -> Result<Event> {
    Ok(serde_json::from_str(line)?)
}
