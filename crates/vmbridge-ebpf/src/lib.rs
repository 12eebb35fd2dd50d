//! # vmbridge-ebpf
//!
//! Bind-syscall watcher for the guest agent's ticker.
//!
//! Loads a small tracepoint program attached to `sys_enter_bind` /
//! `sys_exit_bind` that pushes one record per bind into a ring buffer; the
//! userspace reader turns each record into a rescan tick. This lets the
//! agent react to new listeners within milliseconds instead of waiting for
//! the next interval.
//!
//! The `ebpf` feature flag must be enabled and the host must support BPF
//! (CAP_BPF, a recent kernel, and the prebuilt program object) for this to
//! be available; every failure path degrades to the interval ticker.

pub mod bind_watch;

pub use bind_watch::{BindWatch, BindWatchConfig};
