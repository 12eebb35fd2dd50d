//! # vmbridge-common
//!
//! Shared vocabulary of the vmbridge workspace: endpoint and snapshot
//! types, the host-side event model, the instance configuration record,
//! error definitions, and system-wide constants.
//!
//! Everything here is plain data. The host agent (`vmbridge-host`) and the
//! guest agent (`vmbridge-guest`) both depend on this crate; it depends on
//! nothing else in the workspace.

pub mod constants;
pub mod error;
pub mod events;
pub mod instance;
pub mod types;
