//! # vmbridge-guest
//!
//! The guest half of the coordination plane: a root daemon that enumerates
//! listening sockets (kernel tables, Kubernetes services, iptables DNAT
//! rules), streams port-set deltas to the host, proxies host-initiated
//! tunnels, and keeps the guest clock aligned with the host.
//!
//! The binary entry point is `vmbridge-guestd`; the modules here are its
//! building blocks and are exercised directly by the workspace tests.

pub mod agent;
pub mod audit;
pub mod iptables;
pub mod kubernetes;
pub mod procnet;
pub mod service;
pub mod state;
pub mod ticker;
pub mod timesync;
