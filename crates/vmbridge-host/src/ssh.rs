//! SSH plumbing shared by the requirements engine, the forwarder, and the
//! mount supervisor.
//!
//! All guest interaction multiplexes over one control master per instance;
//! the master socket lives in the instance directory and is torn down once
//! at shutdown. Forward installation and cancellation go through the
//! master with `-O forward` / `-O cancel`, so they are synchronous and do
//! not spawn long-lived children.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use vmbridge_common::error::{Result, VmbridgeError};
use vmbridge_common::instance::Instance;

/// Output of a remote script run.
#[derive(Debug, Clone)]
pub struct RemoteOutput {
    /// Exit code, `None` when killed by a signal.
    pub code: Option<i32>,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

impl RemoteOutput {
    /// True on a zero exit code.
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// One side of a forwarding specification, already rendered for ssh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardSpec {
    /// `-L local:remote`: listen on the host, dial in the guest.
    Local {
        /// Host bind, `ip:port` or a socket path.
        local: String,
        /// Guest target, `ip:port` or a socket path.
        remote: String,
    },
    /// `-R remote:local`: listen in the guest, dial on the host.
    Reverse {
        /// Guest bind, `ip:port` or a socket path.
        remote: String,
        /// Host target, `ip:port` or a socket path.
        local: String,
    },
}

impl ForwardSpec {
    fn flag_and_value(&self) -> (&'static str, String) {
        match self {
            Self::Local { local, remote } => ("-L", format!("{local}:{remote}")),
            Self::Reverse { remote, local } => ("-R", format!("{remote}:{local}")),
        }
    }
}

/// The per-instance SSH session. Clones share the address, so a driver
/// with a dynamic SSH address updates every user at once.
#[derive(Debug, Clone)]
pub struct SshSession {
    address: Arc<std::sync::RwLock<String>>,
    port: u16,
    control_sock: PathBuf,
}

impl SshSession {
    /// Builds the session for an instance.
    #[must_use]
    pub fn new(instance: &Arc<Instance>) -> Self {
        Self {
            address: Arc::new(std::sync::RwLock::new(instance.ssh_address.clone())),
            port: instance.ssh_local_port,
            control_sock: instance.ssh_control_sock(),
        }
    }

    /// Overrides the address, for drivers with dynamic SSH addresses.
    pub fn set_address(&self, address: String) {
        if let Ok(mut slot) = self.address.write() {
            *slot = address;
        }
    }

    fn target(&self) -> String {
        self.address.read().map(|a| a.clone()).unwrap_or_default()
    }

    /// Common flags. With `use_master`, traffic multiplexes over the
    /// control socket; without, a fresh connection is made (needed before
    /// the master exists or where multiplexing is unreliable).
    #[must_use]
    pub fn base_args(&self, use_master: bool) -> Vec<String> {
        let mut args = vec![
            "-o".to_owned(),
            "StrictHostKeyChecking=no".to_owned(),
            "-o".to_owned(),
            "UserKnownHostsFile=/dev/null".to_owned(),
            "-o".to_owned(),
            "BatchMode=yes".to_owned(),
            "-p".to_owned(),
            self.port.to_string(),
        ];
        if use_master {
            args.push("-o".to_owned());
            args.push(format!("ControlPath={}", self.control_sock.display()));
        }
        args.push(self.target());
        args
    }

    /// Starts the control master in the background.
    ///
    /// # Errors
    ///
    /// Returns an error when ssh cannot be spawned or refuses the
    /// connection.
    pub async fn start_master(&self) -> Result<()> {
        let mut args = vec![
            "-o".to_owned(),
            "ControlMaster=yes".to_owned(),
            "-o".to_owned(),
            format!("ControlPath={}", self.control_sock.display()),
            "-o".to_owned(),
            "ControlPersist=yes".to_owned(),
            "-N".to_owned(),
            "-f".to_owned(),
        ];
        args.extend(self.base_args(false));
        // base_args(false) re-appends the target with no ControlPath; the
        // explicit ControlPath above wins because ssh takes the first
        // occurrence of an option.
        let output = run_ssh(&args).await?;
        if output.success() {
            tracing::info!(sock = %self.control_sock.display(), "ssh control master started");
            Ok(())
        } else {
            Err(VmbridgeError::transport(format!(
                "control master failed: {}",
                output.stderr.trim()
            )))
        }
    }

    /// Tears down the control master. Called once at shutdown.
    pub async fn exit_master(&self) {
        let mut args = vec![
            "-o".to_owned(),
            format!("ControlPath={}", self.control_sock.display()),
            "-O".to_owned(),
            "exit".to_owned(),
        ];
        args.push(self.target());
        match run_ssh(&args).await {
            Ok(output) if output.success() => {
                tracing::info!("ssh control master stopped");
            }
            Ok(output) => {
                tracing::warn!(stderr = %output.stderr.trim(), "ssh -O exit failed");
            }
            Err(e) => tracing::warn!(error = %e, "ssh -O exit failed"),
        }
    }

    /// Runs a script in the guest by piping it to a remote shell.
    ///
    /// # Errors
    ///
    /// Returns an error when ssh cannot be spawned or its pipes break;
    /// script failure is reported through [`RemoteOutput::code`].
    pub async fn run_script(&self, script: &str, use_master: bool) -> Result<RemoteOutput> {
        let mut args = self.base_args(use_master);
        args.push("--".to_owned());
        args.push("/bin/sh".to_owned());

        let ssh = which_ssh()?;
        let mut child = Command::new(ssh)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| VmbridgeError::transport(format!("spawning ssh: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(script.as_bytes())
                .await
                .map_err(|e| VmbridgeError::transport(format!("writing script: {e}")))?;
            drop(stdin);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| VmbridgeError::transport(format!("waiting for ssh: {e}")))?;
        Ok(RemoteOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Installs or cancels a forwarding on the control master.
    ///
    /// # Errors
    ///
    /// Returns an error when the master refuses the request.
    pub async fn set_forward(&self, spec: &ForwardSpec, install: bool) -> Result<()> {
        let (flag, value) = spec.flag_and_value();
        let op = if install { "forward" } else { "cancel" };
        let mut args = vec![
            "-o".to_owned(),
            format!("ControlPath={}", self.control_sock.display()),
            "-O".to_owned(),
            op.to_owned(),
            flag.to_owned(),
            value,
        ];
        args.push(self.target());

        let output = run_ssh(&args).await?;
        if output.success() {
            Ok(())
        } else {
            Err(VmbridgeError::transport(format!(
                "ssh -O {op} {flag} failed: {}",
                output.stderr.trim()
            )))
        }
    }

    /// Forwards the guest-agent Unix socket to the instance directory.
    ///
    /// # Errors
    ///
    /// Returns an error when the forward cannot be installed.
    pub async fn forward_guest_agent_sock(
        &self,
        local_sock: &std::path::Path,
        guest_sock: &str,
    ) -> Result<()> {
        // A stale local socket makes ssh refuse the listen.
        let _ = std::fs::remove_file(local_sock);
        self.set_forward(
            &ForwardSpec::Local {
                local: local_sock.display().to_string(),
                remote: guest_sock.to_owned(),
            },
            true,
        )
        .await
    }
}

fn which_ssh() -> Result<PathBuf> {
    which::which("ssh").map_err(|e| VmbridgeError::NotFound {
        kind: "binary",
        id: format!("ssh: {e}"),
    })
}

async fn run_ssh(args: &[String]) -> Result<RemoteOutput> {
    let ssh = which_ssh()?;
    let output = Command::new(ssh)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| VmbridgeError::transport(format!("spawning ssh: {e}")))?;
    Ok(RemoteOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmbridge_common::instance::InstanceConfig;

    fn session() -> SshSession {
        let instance = Arc::new(Instance {
            name: "default".into(),
            dir: PathBuf::from("/tmp/inst"),
            vm_type: "stub".into(),
            ssh_address: "127.0.0.1".into(),
            ssh_local_port: 60022,
            config: InstanceConfig::default(),
            driver_options: serde_json::Value::Null,
        });
        SshSession::new(&instance)
    }

    #[test]
    fn base_args_include_port_and_target() {
        let args = session().base_args(false);
        assert!(args.contains(&"-p".to_owned()));
        assert!(args.contains(&"60022".to_owned()));
        assert_eq!(args.last(), Some(&"127.0.0.1".to_owned()));
        assert!(!args.iter().any(|a| a.starts_with("ControlPath=")));
    }

    #[test]
    fn master_args_carry_control_path() {
        let args = session().base_args(true);
        assert!(
            args.iter()
                .any(|a| a == "ControlPath=/tmp/inst/ssh.sock")
        );
    }

    #[test]
    fn forward_spec_renders_ssh_flags() {
        let local = ForwardSpec::Local {
            local: "127.0.0.1:18085".into(),
            remote: "127.0.0.1:8085".into(),
        };
        assert_eq!(
            local.flag_and_value(),
            ("-L", "127.0.0.1:18085:127.0.0.1:8085".to_owned())
        );

        let reverse = ForwardSpec::Reverse {
            remote: "/run/guest.sock".into(),
            local: "/tmp/host.sock".into(),
        };
        assert_eq!(
            reverse.flag_and_value(),
            ("-R", "/run/guest.sock:/tmp/host.sock".to_owned())
        );
    }
}
