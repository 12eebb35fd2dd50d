//! Kernel audit subscription feeding the iptables gate.
//!
//! Subscribes to the `NETLINK_AUDIT` read-log multicast group and watches
//! for `AUDIT_NETFILTER_CFG` records, which the kernel emits whenever a
//! netfilter table is replaced. Each sighting opens the iptables scanner's
//! gate (see [`crate::iptables::IptablesScanner::note_netfilter_change`]).
//!
//! Requires CAP_AUDIT_READ; the daemon runs as root so this normally
//! holds, but kernels without audit support simply fail the subscription
//! and the scanner falls back to scanning every tick.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use vmbridge_common::error::{Result, VmbridgeError};

use crate::iptables::IptablesScanner;

/// Audit record type for netfilter configuration changes.
pub const AUDIT_NETFILTER_CFG: u16 = 1325;

/// Multicast group carrying the audit log.
const AUDIT_NLGRP_READLOG: u32 = 1;

const NLMSG_HDRLEN: usize = 16;

/// Extracts the message types from a datagram of netlink messages.
#[must_use]
pub fn parse_message_types(buf: &[u8]) -> Vec<u16> {
    let mut types = Vec::new();
    let mut offset = 0;
    while offset + NLMSG_HDRLEN <= buf.len() {
        let len =
            u32::from_ne_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
                as usize;
        if len < NLMSG_HDRLEN || offset + len > buf.len() {
            break;
        }
        types.push(u16::from_ne_bytes([buf[offset + 4], buf[offset + 5]]));
        // Messages are aligned to 4 bytes.
        offset += len.div_ceil(4) * 4;
    }
    types
}

struct AuditSocket(libc::c_int);

impl AuditSocket {
    fn open() -> std::io::Result<Self> {
        // SAFETY: plain socket(2); the fd is owned by the returned value.
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                libc::NETLINK_AUDIT,
            )
        };
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let socket = Self(fd);

        // SAFETY: sockaddr_nl is a plain C struct; zero is a valid
        // initial state for every field.
        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::sa_family_t::try_from(libc::AF_NETLINK).unwrap_or_default();
        addr.nl_groups = 1 << (AUDIT_NLGRP_READLOG - 1);

        // SAFETY: addr is a valid sockaddr_nl for the length passed.
        let rc = unsafe {
            libc::bind(
                socket.0,
                std::ptr::from_ref(&addr).cast::<libc::sockaddr>(),
                u32::try_from(std::mem::size_of::<libc::sockaddr_nl>()).unwrap_or_default(),
            )
        };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(socket)
    }

    fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        // SAFETY: buf is valid for buf.len() bytes for the duration of
        // the call.
        let n = unsafe { libc::recv(self.0, buf.as_mut_ptr().cast(), buf.len(), 0) };
        if n < 0 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(usize::try_from(n).unwrap_or_default())
        }
    }
}

impl Drop for AuditSocket {
    fn drop(&mut self) {
        // SAFETY: the fd is owned and closed exactly once.
        let _ = unsafe { libc::close(self.0) };
    }
}

// SAFETY: the wrapped fd is just an integer handle.
unsafe impl Send for AuditSocket {}

/// Running audit subscription.
pub struct AuditWatcher {
    stop: Arc<AtomicBool>,
}

impl AuditWatcher {
    /// Opens the audit socket, joins the read-log group, and starts the
    /// reader. Marks the scanner audit-active on success.
    ///
    /// # Errors
    ///
    /// Returns an error when the kernel refuses the subscription; the
    /// caller then leaves the scanner ungated.
    pub fn start(scanner: Arc<IptablesScanner>) -> Result<Self> {
        let socket = AuditSocket::open().map_err(|e| VmbridgeError::Unsupported {
            message: format!("audit subscription failed: {e}"),
        })?;

        scanner.set_audit_active();
        let stop = Arc::new(AtomicBool::new(false));
        let reader_stop = Arc::clone(&stop);

        let _ = std::thread::Builder::new()
            .name("audit-watch".into())
            .spawn(move || {
                let mut buf = [0u8; 32 * 1024];
                while !reader_stop.load(Ordering::Relaxed) {
                    match socket.recv(&mut buf) {
                        Ok(n) => {
                            let seen_netfilter = parse_message_types(&buf[..n])
                                .iter()
                                .any(|t| *t == AUDIT_NETFILTER_CFG);
                            if seen_netfilter {
                                tracing::debug!("netfilter configuration changed");
                                scanner.note_netfilter_change();
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            std::thread::sleep(Duration::from_millis(200));
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "audit read failed; stopping watcher");
                            break;
                        }
                    }
                }
            });

        tracing::info!("audit netfilter watcher started");
        Ok(Self { stop })
    }
}

impl Drop for AuditWatcher {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(kind: u16, payload: &[u8]) -> Vec<u8> {
        let len = NLMSG_HDRLEN + payload.len();
        let mut buf = Vec::new();
        buf.extend_from_slice(&u32::try_from(len).unwrap_or(0).to_ne_bytes());
        buf.extend_from_slice(&kind.to_ne_bytes());
        buf.extend_from_slice(&0u16.to_ne_bytes()); // flags
        buf.extend_from_slice(&0u32.to_ne_bytes()); // seq
        buf.extend_from_slice(&0u32.to_ne_bytes()); // pid
        buf.extend_from_slice(payload);
        // Pad to 4-byte alignment.
        while buf.len() % 4 != 0 {
            buf.push(0);
        }
        buf
    }

    #[test]
    fn parses_multiple_messages_per_datagram() {
        let mut datagram = message(1300, b"syscall");
        datagram.extend(message(AUDIT_NETFILTER_CFG, b"table=nat family=2 entries=10"));
        datagram.extend(message(1320, b""));

        let types = parse_message_types(&datagram);
        assert_eq!(types, vec![1300, AUDIT_NETFILTER_CFG, 1320]);
    }

    #[test]
    fn truncated_message_stops_parsing() {
        let mut datagram = message(1300, b"ok");
        datagram.extend_from_slice(&100u32.to_ne_bytes()); // claims 100 bytes
        datagram.extend_from_slice(&1u16.to_ne_bytes());

        let types = parse_message_types(&datagram);
        assert_eq!(types, vec![1300]);
    }

    #[test]
    fn empty_datagram_has_no_types() {
        assert!(parse_message_types(&[]).is_empty());
    }
}
