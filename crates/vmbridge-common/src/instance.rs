//! The instance record and its cloud configuration.
//!
//! An [`Instance`] is immutable after the host agent starts: it captures the
//! on-disk directory, the SSH endpoint, and the declarative configuration
//! (mounts, port-forward rules, probes) the agent enforces for the lifetime
//! of the VM. Configuration loading itself (YAML parsing, defaults) happens
//! outside this workspace; the agent consumes the already-resolved JSON form
//! from `instance.json` in the instance directory.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, VmbridgeError};
use crate::types::Protocol;

/// Immutable-after-start record of one managed VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    /// Instance identifier.
    pub name: String,
    /// Instance directory holding sockets, logs, and disks.
    pub dir: PathBuf,
    /// VM type label, interpreted by the driver registry.
    pub vm_type: String,
    /// SSH address of the guest. Drivers with a dynamic SSH address
    /// overwrite this after start.
    pub ssh_address: String,
    /// Host-side SSH port of the guest.
    pub ssh_local_port: u16,
    /// Declarative cloud configuration.
    #[serde(default)]
    pub config: InstanceConfig,
    /// Driver-specific options, passed through opaquely.
    #[serde(default)]
    pub driver_options: serde_json::Value,
}

impl Instance {
    /// Loads and validates an instance record from `instance.json` in the
    /// given directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, malformed, or fails
    /// validation.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(crate::constants::INSTANCE_CONFIG_FILE);
        let data = std::fs::read_to_string(&path)
            .map_err(|e| VmbridgeError::io(&path, e))?;
        let mut instance: Self = serde_json::from_str(&data)?;
        instance.dir = dir.to_path_buf();
        instance.validate()?;
        Ok(instance)
    }

    /// Validates the record.
    ///
    /// # Errors
    ///
    /// Returns an error on an empty name, a zero SSH port, or an invalid
    /// port-forward rule.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(VmbridgeError::config("instance name must not be empty"));
        }
        if self.ssh_local_port == 0 {
            return Err(VmbridgeError::config("sshLocalPort must not be zero"));
        }
        for rule in &self.config.port_rules {
            rule.validate()?;
        }
        Ok(())
    }

    /// Path of the forwarded guest-agent socket in the instance directory.
    #[must_use]
    pub fn guest_agent_sock(&self) -> PathBuf {
        self.dir.join(crate::constants::HOST_AGENT_GUEST_SOCK)
    }

    /// Path of the SSH control-master socket in the instance directory.
    #[must_use]
    pub fn ssh_control_sock(&self) -> PathBuf {
        self.dir.join(crate::constants::SSH_CONTROL_SOCK)
    }
}

/// Declarative configuration the host agent enforces.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstanceConfig {
    /// Reverse-SSHFS mounts.
    pub mounts: Vec<Mount>,
    /// Ordered port-forward rules; first match wins.
    pub port_rules: Vec<PortRule>,
    /// User-defined readiness probes, run in the optional phase.
    pub probes: Vec<Probe>,
    /// Provisioning scripts run after mounts are up.
    pub provision: Vec<ProvisionScript>,
    /// Files copied from the guest once the final phase is done.
    pub copy_to_host: Vec<CopyToHostRule>,
    /// Containerd readiness checks to include in the optional phase.
    pub containerd: ContainerdConfig,
    /// Link the host ssh-agent into the guest user session.
    pub ssh_forward_agent: bool,
    /// Stream cloud-init output while the guest boots.
    pub cloud_init_progress: bool,
    /// VNC display requested for the VM, if any.
    pub video_vnc: bool,
}

/// Containerd flags from the instance configuration.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContainerdConfig {
    /// Wait for the system-wide containerd socket.
    pub system: bool,
    /// Wait for the rootless containerd socket.
    pub user: bool,
}

/// One reverse-SSHFS mount.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mount {
    /// Host directory to expose.
    pub location: PathBuf,
    /// Guest path to mount at.
    pub mount_point: PathBuf,
    /// Allow the guest to write through the mount.
    #[serde(default)]
    pub writable: bool,
    /// SFTP server driver binary, resolved on the host.
    #[serde(default)]
    pub sftp_driver: Option<String>,
    /// Enable the sshfs cache.
    #[serde(default)]
    pub cache: bool,
    /// Pass `follow_symlinks` to sshfs.
    #[serde(default)]
    pub follow_symlinks: bool,
}

/// A user-defined readiness probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Probe {
    /// Short description shown in logs.
    pub description: String,
    /// Shell script whose zero exit code means ready.
    pub script: String,
    /// Hint logged when the probe keeps failing.
    #[serde(default)]
    pub hint: Option<String>,
}

/// A provisioning script.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionScript {
    /// Script body, shebang included.
    pub script: String,
    /// Run as root instead of the configured user.
    #[serde(default)]
    pub system: bool,
}

/// Copy a guest file to the host when boot completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyToHostRule {
    /// Guest path, read with sudo.
    pub guest: PathBuf,
    /// Host destination path.
    pub host: PathBuf,
    /// Remove the host file when the agent stops.
    #[serde(default)]
    pub delete_on_stop: bool,
}

/// An inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    /// First port of the range.
    pub lo: u16,
    /// Last port of the range.
    pub hi: u16,
}

impl PortRange {
    /// Single-port range.
    #[must_use]
    pub const fn single(port: u16) -> Self {
        Self { lo: port, hi: port }
    }

    /// The full 1–65535 range.
    #[must_use]
    pub const fn all() -> Self {
        Self { lo: 1, hi: 65535 }
    }

    /// Returns true when `port` falls inside the range.
    #[must_use]
    pub const fn contains(self, port: u16) -> bool {
        self.lo <= port && port <= self.hi
    }

    /// Number of ports covered.
    #[must_use]
    pub const fn len(self) -> u32 {
        self.hi as u32 - self.lo as u32 + 1
    }

    /// Always false; a range covers at least one port.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        false
    }
}

/// Declarative mapping from a matching guest endpoint to a host endpoint.
///
/// Rules are ordered; the forwarder applies the first rule whose guest side
/// matches an observed endpoint. The implicit final rule forwards loopback
/// guest endpoints to the same loopback port on the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortRule {
    /// Guest IP to match; `None` matches any address (unless
    /// [`Self::must_be_zero`] restricts it).
    #[serde(default)]
    pub guest_ip: Option<IpAddr>,
    /// Guest port range to match.
    pub guest_range: PortRange,
    /// Guest Unix socket path, for socket forwards.
    #[serde(default)]
    pub guest_socket: Option<PathBuf>,
    /// Host IP to bind.
    #[serde(default = "default_host_ip")]
    pub host_ip: IpAddr,
    /// Host port range; must be the same length as the guest range.
    pub host_range: PortRange,
    /// Host Unix socket path, for socket forwards.
    #[serde(default)]
    pub host_socket: Option<PathBuf>,
    /// Protocol the rule applies to.
    #[serde(default = "default_proto")]
    pub proto: Protocol,
    /// Forward host→guest instead of guest→host.
    #[serde(default)]
    pub reverse: bool,
    /// Block matching endpoints instead of forwarding them.
    #[serde(default)]
    pub ignore: bool,
    /// Install unconditionally at start; never torn down by events.
    #[serde(default, rename = "static")]
    pub static_: bool,
    /// Match only guest endpoints bound exactly to `0.0.0.0`.
    #[serde(default)]
    pub must_be_zero: bool,
}

const fn default_host_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

const fn default_proto() -> Protocol {
    Protocol::Tcp
}

impl PortRule {
    /// Validates range lengths and modifier combinations.
    ///
    /// # Errors
    ///
    /// Returns an error when the host and guest ranges differ in length,
    /// when `mustBeZero` is combined with a concrete guest IP, or when a
    /// reverse rule ignores.
    pub fn validate(&self) -> Result<()> {
        if self.guest_socket.is_none()
            && !self.ignore
            && self.guest_range.len() != self.host_range.len()
        {
            return Err(VmbridgeError::config(format!(
                "guest range {}-{} and host range {}-{} differ in length",
                self.guest_range.lo, self.guest_range.hi, self.host_range.lo, self.host_range.hi
            )));
        }
        if self.must_be_zero {
            if let Some(ip) = self.guest_ip {
                if !ip.is_unspecified() {
                    return Err(VmbridgeError::config(format!(
                        "mustBeZero requires an unspecified guest IP, got {ip}"
                    )));
                }
            }
        }
        if self.reverse && self.ignore {
            return Err(VmbridgeError::config(
                "a rule cannot be both reverse and ignore",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn base_rule() -> PortRule {
        PortRule {
            guest_ip: None,
            guest_range: PortRange::single(8080),
            guest_socket: None,
            host_ip: default_host_ip(),
            host_range: PortRange::single(8080),
            host_socket: None,
            proto: Protocol::Tcp,
            reverse: false,
            ignore: false,
            static_: false,
            must_be_zero: false,
        }
    }

    #[test]
    fn range_len_mismatch_is_rejected() {
        let rule = PortRule {
            guest_range: PortRange { lo: 8080, hi: 8089 },
            host_range: PortRange { lo: 18080, hi: 18085 },
            ..base_rule()
        };
        assert!(rule.validate().is_err());
    }

    #[test]
    fn must_be_zero_with_concrete_ip_is_rejected() {
        let rule = PortRule {
            guest_ip: Some("192.168.5.1".parse().unwrap()),
            must_be_zero: true,
            ..base_rule()
        };
        assert!(rule.validate().is_err());
    }

    #[test]
    fn instance_validation_rejects_zero_ssh_port() {
        let instance = Instance {
            name: "default".into(),
            dir: PathBuf::from("/tmp/x"),
            vm_type: "stub".into(),
            ssh_address: "127.0.0.1".into(),
            ssh_local_port: 0,
            config: InstanceConfig::default(),
            driver_options: serde_json::Value::Null,
        };
        assert!(instance.validate().is_err());
    }

    #[test]
    fn instance_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let instance = Instance {
            name: "default".into(),
            dir: dir.path().to_path_buf(),
            vm_type: "stub".into(),
            ssh_address: "127.0.0.1".into(),
            ssh_local_port: 60022,
            config: InstanceConfig::default(),
            driver_options: serde_json::Value::Null,
        };
        let json = serde_json::to_string_pretty(&instance).unwrap();
        std::fs::write(
            dir.path().join(crate::constants::INSTANCE_CONFIG_FILE),
            json,
        )
        .unwrap();

        let loaded = Instance::load(dir.path()).unwrap();
        assert_eq!(loaded.name, "default");
        assert_eq!(loaded.ssh_local_port, 60022);
        assert_eq!(loaded.dir, dir.path());
    }
}
