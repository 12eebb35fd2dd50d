//! # vmbridge-proto
//!
//! Protobuf schema and transport fabric of the guest-agent RPC.
//!
//! The wire protocol is a single bidirectional-streaming gRPC service
//! ([`pb::guest_service_server::GuestService`]) carried over one of three
//! transports: a Unix socket inside the guest (forwarded to the host over
//! SSH), a vsock port, or a virtio serial character device. The channel is
//! authenticated by the transport itself (Unix permissions, vsock VM
//! identity, or device ownership), so no TLS is layered on top.

use std::net::IpAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use vmbridge_common::error::{Result, VmbridgeError};
use vmbridge_common::types::{IpPort, Protocol};

pub mod transport;

/// Generated protobuf types and service stubs.
#[allow(
    missing_docs,
    unused_results,
    clippy::pedantic,
    clippy::nursery,
    clippy::missing_errors_doc
)]
pub mod pb {
    tonic::include_proto!("vmbridge.guest.v1");
}

/// Protocol version reported by `GetInfo`.
pub const PROTOCOL_VERSION: &str = "1";

/// Converts a wire endpoint into the in-memory form.
///
/// # Errors
///
/// Returns an error when the IP does not parse, the port is out of range,
/// or the protocol is unknown.
pub fn ip_port_from_pb(pb: &pb::IpPort) -> Result<IpPort> {
    let ip: IpAddr = pb
        .ip
        .parse()
        .map_err(|_| VmbridgeError::config(format!("invalid IP in RPC message: {}", pb.ip)))?;
    let port = u16::try_from(pb.port)
        .map_err(|_| VmbridgeError::config(format!("invalid port in RPC message: {}", pb.port)))?;
    let protocol: Protocol = pb.protocol.parse()?;
    Ok(IpPort::new(ip, port, protocol))
}

/// Converts an in-memory endpoint into the wire form.
#[must_use]
pub fn ip_port_to_pb(ep: &IpPort) -> pb::IpPort {
    pb::IpPort {
        ip: ep.ip.to_string(),
        port: i32::from(ep.port),
        protocol: ep.protocol.as_str().to_owned(),
    }
}

/// Current wall clock as unix nanoseconds, saturating at zero before the
/// epoch.
#[must_use]
pub fn unix_nanos_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
}

/// Converts unix nanoseconds back into a [`SystemTime`].
#[must_use]
pub fn system_time_from_nanos(nanos: i64) -> SystemTime {
    if nanos >= 0 {
        UNIX_EPOCH + Duration::from_nanos(nanos.unsigned_abs())
    } else {
        UNIX_EPOCH - Duration::from_nanos(nanos.unsigned_abs())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn ip_port_conversion_roundtrip() {
        let ep = IpPort::new("::".parse().unwrap(), 30080, Protocol::Udp);
        let wire = ip_port_to_pb(&ep);
        assert_eq!(wire.protocol, "udp");
        let back = ip_port_from_pb(&wire).unwrap();
        assert_eq!(back, ep);
    }

    #[test]
    fn bad_wire_endpoint_is_rejected() {
        let wire = pb::IpPort { ip: "not-an-ip".into(), port: 80, protocol: "tcp".into() };
        assert!(ip_port_from_pb(&wire).is_err());

        let wire = pb::IpPort { ip: "10.0.0.1".into(), port: 70000, protocol: "tcp".into() };
        assert!(ip_port_from_pb(&wire).is_err());
    }

    #[test]
    fn nanos_roundtrip() {
        let now = unix_nanos_now();
        let t = system_time_from_nanos(now);
        let back = i64::try_from(t.duration_since(UNIX_EPOCH).unwrap().as_nanos()).unwrap();
        assert_eq!(now, back);
    }
}
