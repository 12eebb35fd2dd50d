//! Kernel socket-table scanner.
//!
//! Parses the tables the kernel exports under `/proc/net` to enumerate
//! locally-bound TCP and UDP endpoints. The kernel writes local address
//! fields as hex dumps of in-memory words, so the fields are in host byte
//! order; this parser only supports little-endian hosts and refuses to run
//! elsewhere rather than emit reversed addresses.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;

use vmbridge_common::error::{Result, VmbridgeError};
use vmbridge_common::types::{IpPort, Protocol};

/// TCP socket in the LISTEN state.
pub const TCP_LISTEN: u8 = 0x0A;

/// UDP socket with no peer (the state UDP listeners sit in).
pub const UDP_UNCONNECTED: u8 = 0x07;

/// Which kernel table a row came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    /// `/proc/net/tcp`
    Tcp4,
    /// `/proc/net/tcp6`
    Tcp6,
    /// `/proc/net/udp`
    Udp4,
    /// `/proc/net/udp6`
    Udp6,
}

impl TableKind {
    /// Path of the table under the given proc root.
    #[must_use]
    pub fn path(self, proc_root: &Path) -> std::path::PathBuf {
        let name = match self {
            Self::Tcp4 => "net/tcp",
            Self::Tcp6 => "net/tcp6",
            Self::Udp4 => "net/udp",
            Self::Udp6 => "net/udp6",
        };
        proc_root.join(name)
    }

    /// Transport protocol of this table.
    #[must_use]
    pub const fn protocol(self) -> Protocol {
        match self {
            Self::Tcp4 | Self::Tcp6 => Protocol::Tcp,
            Self::Udp4 | Self::Udp6 => Protocol::Udp,
        }
    }

    /// The socket state that means "listening" for this table.
    #[must_use]
    pub const fn listen_state(self) -> u8 {
        match self {
            Self::Tcp4 | Self::Tcp6 => TCP_LISTEN,
            Self::Udp4 | Self::Udp6 => UDP_UNCONNECTED,
        }
    }

    const ALL: [Self; 4] = [Self::Tcp4, Self::Tcp6, Self::Udp4, Self::Udp6];
}

/// One parsed socket-table row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketEntry {
    /// Table the row came from.
    pub kind: TableKind,
    /// Raw kernel socket state.
    pub state: u8,
    /// Decoded local endpoint.
    pub endpoint: IpPort,
}

/// A listening Unix socket, enumerated for diagnostics only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnixSocketEntry {
    /// Bound filesystem (or abstract) path.
    pub path: String,
    /// Raw kernel socket state.
    pub state: u8,
}

fn ensure_little_endian() -> Result<()> {
    if cfg!(target_endian = "big") {
        return Err(VmbridgeError::Unsupported {
            message: "socket tables are host-endian; big-endian hosts are not supported".into(),
        });
    }
    Ok(())
}

fn parse_hex_u32(s: &str) -> Option<u32> {
    u32::from_str_radix(s, 16).ok()
}

/// Decodes the kernel's hex form of a local address.
///
/// IPv4 is one 32-bit host-order word; IPv6 is four of them. The word's
/// little-endian byte order recovers the network-order address bytes.
fn parse_address(hex: &str) -> Option<IpAddr> {
    match hex.len() {
        8 => {
            let word = parse_hex_u32(hex)?;
            Some(IpAddr::V4(Ipv4Addr::from(word.to_le_bytes())))
        }
        32 => {
            let mut bytes = [0u8; 16];
            for (i, chunk) in hex.as_bytes().chunks(8).enumerate() {
                let word = parse_hex_u32(std::str::from_utf8(chunk).ok()?)?;
                bytes[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
            }
            Some(IpAddr::V6(Ipv6Addr::from(bytes)))
        }
        _ => None,
    }
}

/// Parses one table's content into entries, skipping the header row and
/// any malformed line.
///
/// # Errors
///
/// Returns an error on big-endian hosts.
pub fn parse_table(kind: TableKind, content: &str) -> Result<Vec<SocketEntry>> {
    ensure_little_endian()?;

    let mut entries = Vec::new();
    for line in content.lines().skip(1) {
        let mut fields = line.split_whitespace();
        let _slot = fields.next();
        let Some(local) = fields.next() else { continue };
        let _remote = fields.next();
        let Some(state_hex) = fields.next() else { continue };

        let Some((addr_hex, port_hex)) = local.split_once(':') else {
            continue;
        };
        let Some(ip) = parse_address(addr_hex) else {
            tracing::warn!(?kind, field = local, "unparseable local address");
            continue;
        };
        // Ports are already converted to host order by the kernel.
        let Some(port) = u16::from_str_radix(port_hex, 16).ok() else {
            continue;
        };
        let Some(state) = u8::from_str_radix(state_hex, 16).ok() else {
            continue;
        };

        entries.push(SocketEntry {
            kind,
            state,
            endpoint: IpPort::new(ip, port, kind.protocol()),
        });
    }
    Ok(entries)
}

/// Result of one pass over all four tables.
#[derive(Debug, Default)]
pub struct ScanResult {
    /// Listening endpoints.
    pub listeners: Vec<IpPort>,
    /// Per-table warnings; a missing table never aborts the scan.
    pub warnings: Vec<String>,
}

/// Scans all four tables under the given proc root and keeps only
/// listening endpoints.
///
/// # Errors
///
/// Returns an error only on big-endian hosts; unreadable tables are
/// reported as warnings with an empty contribution.
pub fn scan(proc_root: &Path) -> Result<ScanResult> {
    ensure_little_endian()?;

    let mut result = ScanResult::default();
    for kind in TableKind::ALL {
        let path = kind.path(proc_root);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "socket table unreadable");
                result.warnings.push(format!("{}: {e}", path.display()));
                continue;
            }
        };
        for entry in parse_table(kind, &content)? {
            if entry.state == kind.listen_state() {
                result.listeners.push(entry.endpoint);
            }
        }
    }
    Ok(result)
}

/// Scans the default `/proc` root.
///
/// # Errors
///
/// See [`scan`].
pub fn scan_proc() -> Result<ScanResult> {
    scan(Path::new("/proc"))
}

/// Enumerates listening Unix sockets from `/proc/net/unix`, for
/// diagnostics. Not merged into port snapshots.
///
/// # Errors
///
/// Returns an error when the table cannot be read.
pub fn list_unix_listeners(proc_root: &Path) -> Result<Vec<UnixSocketEntry>> {
    const SO_ACCEPTCON: u32 = 0x0001_0000;

    let path = proc_root.join("net/unix");
    let content =
        std::fs::read_to_string(&path).map_err(|e| VmbridgeError::io(&path, e))?;

    let mut entries = Vec::new();
    for line in content.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        // Num RefCount Protocol Flags Type St Inode [Path]
        if fields.len() < 8 {
            continue;
        }
        let Some(flags) = parse_hex_u32(fields[3]) else { continue };
        if flags & SO_ACCEPTCON == 0 {
            continue;
        }
        let Some(state) = u8::from_str_radix(fields[5], 16).ok() else {
            continue;
        };
        entries.push(UnixSocketEntry { path: fields[7].to_owned(), state });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    const TCP4_SAMPLE: &str = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 0100007F:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 12345 1 0000000000000000 100 0 0 10 0
   1: 00000000:0016 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 23456 1 0000000000000000 100 0 0 10 0
   2: 0100007F:8124 0101A8C0:0050 01 00000000:00000000 00:00000000 00000000  1000        0 34567 1 0000000000000000 100 0 0 10 0
";

    const TCP6_SAMPLE: &str = "\
  sl  local_address                         rem_address                            st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000000000000000000000000000:1BB8 00000000000000000000000000000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 45678 1 0000000000000000 100 0 0 10 0
   1: 00000000000000000000000001000000:0277 00000000000000000000000000000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 56789 1 0000000000000000 100 0 0 10 0
";

    const UDP4_SAMPLE: &str = "\
   sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode ref pointer drops
  100: 00000000:0044 00000000:0000 07 00000000:00000000 00:00000000 00000000     0        0 67890 2 0000000000000000 0
  101: 0100007F:0035 00000000:0000 01 00000000:00000000 00:00000000 00000000     0        0 78901 2 0000000000000000 0
";

    #[test]
    fn tcp4_listeners_decode_host_endian_addresses() {
        let entries = parse_table(TableKind::Tcp4, TCP4_SAMPLE).unwrap();
        assert_eq!(entries.len(), 3);

        let listeners: Vec<_> =
            entries.iter().filter(|e| e.state == TCP_LISTEN).collect();
        assert_eq!(listeners.len(), 2);
        assert_eq!(
            listeners[0].endpoint,
            IpPort::new("127.0.0.1".parse().unwrap(), 8080, Protocol::Tcp)
        );
        assert_eq!(
            listeners[1].endpoint,
            IpPort::new("0.0.0.0".parse().unwrap(), 22, Protocol::Tcp)
        );
    }

    #[test]
    fn tcp6_addresses_decode_word_by_word() {
        let entries = parse_table(TableKind::Tcp6, TCP6_SAMPLE).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[0].endpoint,
            IpPort::new("::".parse().unwrap(), 7096, Protocol::Tcp)
        );
        // 00000000000000000000000001000000 is ::1 in kernel word dumps.
        assert_eq!(
            entries[1].endpoint,
            IpPort::new("::1".parse().unwrap(), 631, Protocol::Tcp)
        );
    }

    #[test]
    fn udp_keeps_only_unconnected_sockets() {
        let entries = parse_table(TableKind::Udp4, UDP4_SAMPLE).unwrap();
        let listening: Vec<_> = entries
            .iter()
            .filter(|e| e.state == TableKind::Udp4.listen_state())
            .collect();
        assert_eq!(listening.len(), 1);
        assert_eq!(listening[0].endpoint.port, 68);
        assert_eq!(listening[0].endpoint.protocol, Protocol::Udp);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let content = "header\ngarbage line\n   0: ZZZZZZZZ:0016 00000000:0000 0A\n";
        let entries = parse_table(TableKind::Tcp4, content).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn scan_tolerates_missing_tables() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("net")).unwrap();
        std::fs::write(dir.path().join("net/tcp"), TCP4_SAMPLE).unwrap();
        // tcp6, udp, udp6 missing entirely.

        let result = scan(dir.path()).unwrap();
        assert_eq!(result.listeners.len(), 2);
        assert_eq!(result.warnings.len(), 3);
    }

    #[test]
    fn unix_listing_filters_on_accept_flag() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("net")).unwrap();
        let content = "\
Num       RefCount Protocol Flags    Type St Inode Path
ffff0001: 00000002 00000000 00010000 0001 01 10001 /run/agent.sock
ffff0002: 00000002 00000000 00000000 0001 03 10002 /run/client.sock
ffff0003: 00000002 00000000 00010000 0001 01 10003 @abstract-listener
";
        std::fs::write(dir.path().join("net/unix"), content).unwrap();

        let entries = list_unix_listeners(dir.path()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path, "/run/agent.sock");
        assert_eq!(entries[1].path, "@abstract-listener");
    }
}
