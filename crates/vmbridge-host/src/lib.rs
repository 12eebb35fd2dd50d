//! # vmbridge-host
//!
//! The host half of the coordination plane: a supervisor that owns one VM
//! process through a pluggable driver, drives it from "started" to "fully
//! usable" with a phased requirements engine, and keeps it usable by
//! forwarding ports, supervising reverse mounts, bridging file events, and
//! emitting a JSON-Lines status stream.
//!
//! The binary entry point is `vmbridge-hostd`; everything else is library
//! code so the pieces can be exercised in isolation.

pub mod agent;
pub mod cloudinit;
pub mod driver;
pub mod events;
pub mod forwarder;
pub mod guestwatch;
pub mod inotify;
pub mod mounts;
pub mod requirements;
pub mod script;
pub mod ssh;
