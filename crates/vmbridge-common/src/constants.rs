//! System-wide constants and default paths.

/// Resolved instance configuration file inside the instance directory.
pub const INSTANCE_CONFIG_FILE: &str = "instance.json";

/// Guest-agent RPC socket inside the guest.
pub const GUEST_AGENT_SOCK: &str = "/run/vmbridge-agent.sock";

/// Host-side forward of the guest-agent socket, inside the instance
/// directory.
pub const HOST_AGENT_GUEST_SOCK: &str = "ga.sock";

/// SSH control-master socket, inside the instance directory.
pub const SSH_CONTROL_SOCK: &str = "ssh.sock";

/// Host agent PID file, inside the instance directory.
pub const HOST_AGENT_PID_FILE: &str = "ha.pid";

/// Guest runtime directory for agent state.
pub const GUEST_RUNTIME_DIR: &str = "/run/vmbridge";

/// Persisted port snapshot, inside the guest runtime directory.
pub const EVENT_STATE_FILE: &str = "event-state.json";

/// Parameter environment delivered on the cidata volume.
pub const CIDATA_PARAM_ENV: &str = "/mnt/vmbridge-cidata/param.env";

/// Marker the boot scripts write when they finish.
pub const BOOT_DONE_MARKER: &str = "/run/vmbridge-boot-done";

/// Cidata copy of the boot-done marker content, for comparison.
pub const CIDATA_BOOT_DONE: &str = "/mnt/vmbridge-cidata/vmbridge.env";

/// Default scan interval of the guest agent.
pub const DEFAULT_TICK_SECS: u64 = 3;

/// Idle window, in ticks, after which iptables scanning is paused again.
pub const IPTABLES_IDLE_TICKS: u32 = 20;

/// Guest clock is stepped when host/guest drift exceeds this.
pub const TIME_SYNC_THRESHOLD_MS: i64 = 100;

/// Guest clock is stepped to the RTC when they diverge by more than this.
pub const RTC_SKEW_THRESHOLD_SECS: i64 = 2;

/// Seconds between RTC skew checks.
pub const RTC_CHECK_INTERVAL_SECS: u64 = 10;

/// Environment variable forcing the SSH backend for TCP forwards.
pub const ENV_SSH_PORT_FORWARDER: &str = "VMBRIDGE_SSH_PORT_FORWARDER";

/// Default vsock port of the guest-agent RPC listener.
pub const DEFAULT_VSOCK_PORT: u32 = 2222;

/// Application name used in logs and state files.
pub const APP_NAME: &str = "vmbridge";
