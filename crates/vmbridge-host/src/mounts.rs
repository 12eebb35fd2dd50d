//! Reverse-SSHFS mount supervision.
//!
//! For each configured mount the host runs an SFTP server whose stdio is
//! piped through the SSH channel into an `sshfs` process inside the guest
//! (`-o slave`): the guest mounts a host directory without the host ever
//! exposing a network filesystem. Sessions are closed in reverse order at
//! shutdown so nested mount points unwind cleanly.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use vmbridge_common::error::{Result, VmbridgeError};
use vmbridge_common::instance::Mount;

use crate::ssh::SshSession;

/// Well-known sftp-server locations, probed in order.
const SFTP_SERVER_CANDIDATES: &[&str] = &[
    "/usr/libexec/sftp-server",
    "/usr/libexec/openssh/sftp-server",
    "/usr/lib/openssh/sftp-server",
    "/usr/lib/ssh/sftp-server",
];

/// Renders the sshfs option string for a mount: always `slave` and
/// `allow_other`, `cache=no` unless caching was requested,
/// `follow_symlinks` when set.
#[must_use]
pub fn sshfs_options(mount: &Mount) -> String {
    let mut options = String::from("slave,allow_other");
    if !mount.cache {
        options.push_str(",cache=no");
    }
    if mount.follow_symlinks {
        options.push_str(",follow_symlinks");
    }
    options
}

/// The guest-side command mounting the piped SFTP stream.
#[must_use]
pub fn guest_mount_command(mount: &Mount, options: &str, nonempty: bool) -> String {
    let mount_point = mount.mount_point.display();
    let nonempty_opt = if nonempty { " -o nonempty" } else { "" };
    format!(
        "mkdir -p '{mount_point}' && exec sshfs ':{location}' '{mount_point}' -o {options}{nonempty_opt}",
        location = mount.location.display(),
    )
}

fn find_sftp_server(mount: &Mount) -> Result<PathBuf> {
    if let Some(driver) = &mount.sftp_driver {
        return which::which(driver).map_err(|e| VmbridgeError::NotFound {
            kind: "binary",
            id: format!("{driver}: {e}"),
        });
    }
    SFTP_SERVER_CANDIDATES
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
        .or_else(|| which::which("sftp-server").ok())
        .ok_or(VmbridgeError::NotFound { kind: "binary", id: "sftp-server".to_owned() })
}

struct MountSession {
    mount_point: PathBuf,
    sftp: Child,
    ssh: Child,
}

/// Supervisor owning every reverse-SSHFS session of one instance.
pub struct MountSupervisor {
    session: SshSession,
    active: Mutex<Vec<MountSession>>,
}

impl MountSupervisor {
    /// Creates an empty supervisor.
    #[must_use]
    pub fn new(session: SshSession) -> Self {
        Self { session, active: Mutex::new(Vec::new()) }
    }

    /// Sets up all mounts in order. Each failed mount is retried once
    /// with `-o nonempty` for libfuse2 guests; persistent failures are
    /// returned for the degraded status.
    pub async fn setup_all(self: &Arc<Self>, mounts: &[Mount]) -> Vec<String> {
        let mut errors = Vec::new();
        for mount in mounts {
            if let Err(e) = self.setup_one(mount).await {
                errors.push(format!("mount {}: {e}", mount.mount_point.display()));
            }
        }
        errors
    }

    async fn setup_one(self: &Arc<Self>, mount: &Mount) -> Result<()> {
        // The exported directory must exist before sftp-server serves it.
        create_private_dir(&mount.location)?;

        match self.spawn_session(mount, false).await {
            Ok(()) => Ok(()),
            Err(first_error) => {
                tracing::warn!(
                    mount = %mount.mount_point.display(),
                    error = %first_error,
                    "mount failed; retrying with -o nonempty"
                );
                self.spawn_session(mount, true).await
            }
        }
    }

    async fn spawn_session(self: &Arc<Self>, mount: &Mount, nonempty: bool) -> Result<()> {
        let sftp_server = find_sftp_server(mount)?;
        let options = sshfs_options(mount);
        let command = guest_mount_command(mount, &options, nonempty);

        let mut sftp = Command::new(&sftp_server)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| VmbridgeError::io(&sftp_server, e))?;

        let ssh_bin = which::which("ssh").map_err(|e| VmbridgeError::NotFound {
            kind: "binary",
            id: format!("ssh: {e}"),
        })?;
        let mut args = self.session.base_args(true);
        args.push("--".to_owned());
        args.push("/bin/sh".to_owned());
        args.push("-c".to_owned());
        args.push(command);

        let mut ssh = Command::new(ssh_bin)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| VmbridgeError::transport(format!("spawning ssh for mount: {e}")))?;

        // Cross-wire the two stdios; the SFTP protocol flows through the
        // SSH channel.
        let mut sftp_out = sftp.stdout.take().ok_or_else(pipe_error)?;
        let mut sftp_in = sftp.stdin.take().ok_or_else(pipe_error)?;
        let mut ssh_out = ssh.stdout.take().ok_or_else(pipe_error)?;
        let mut ssh_in = ssh.stdin.take().ok_or_else(pipe_error)?;

        let _ = tokio::spawn(async move {
            let _ = tokio::io::copy(&mut sftp_out, &mut ssh_in).await;
        });
        let _ = tokio::spawn(async move {
            let _ = tokio::io::copy(&mut ssh_out, &mut sftp_in).await;
        });

        // Give sshfs a moment to mount or fail; an immediate exit means
        // the guest rejected the mount.
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        if let Ok(Some(status)) = ssh.try_wait() {
            let _ = sftp.kill().await;
            return Err(VmbridgeError::transport(format!(
                "sshfs exited immediately with {status}"
            )));
        }

        tracing::info!(
            location = %mount.location.display(),
            mount_point = %mount.mount_point.display(),
            writable = mount.writable,
            "reverse sshfs mounted"
        );
        self.active.lock().await.push(MountSession {
            mount_point: mount.mount_point.clone(),
            sftp,
            ssh,
        });
        Ok(())
    }

    /// Closes every session in reverse setup order.
    pub async fn shutdown(&self) {
        let mut active = self.active.lock().await;
        while let Some(mut session) = active.pop() {
            tracing::info!(mount_point = %session.mount_point.display(), "closing mount");
            let _ = session.ssh.kill().await;
            let _ = session.sftp.kill().await;
        }
    }
}

fn pipe_error() -> VmbridgeError {
    VmbridgeError::transport("child process pipe missing".to_owned())
}

fn create_private_dir(path: &std::path::Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    let mut builder = std::fs::DirBuilder::new();
    let _ = builder.recursive(true).mode(0o750);
    builder.create(path).or_else(|e| {
        if e.kind() == std::io::ErrorKind::AlreadyExists {
            Ok(())
        } else {
            Err(VmbridgeError::io(path, e))
        }
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn mount(cache: bool, follow: bool) -> Mount {
        Mount {
            location: PathBuf::from("/home/user/src"),
            mount_point: PathBuf::from("/home/user/src"),
            writable: true,
            sftp_driver: None,
            cache,
            follow_symlinks: follow,
        }
    }

    #[test]
    fn default_options_disable_cache() {
        assert_eq!(sshfs_options(&mount(false, false)), "slave,allow_other,cache=no");
    }

    #[test]
    fn cache_true_drops_cache_no() {
        assert_eq!(sshfs_options(&mount(true, false)), "slave,allow_other");
    }

    #[test]
    fn follow_symlinks_is_appended() {
        assert_eq!(
            sshfs_options(&mount(false, true)),
            "slave,allow_other,cache=no,follow_symlinks"
        );
    }

    #[test]
    fn guest_command_quotes_paths_and_retries_nonempty() {
        let m = mount(false, false);
        let plain = guest_mount_command(&m, "slave,allow_other,cache=no", false);
        assert!(plain.contains("mkdir -p '/home/user/src'"));
        assert!(plain.contains("sshfs ':/home/user/src'"));
        assert!(!plain.contains("nonempty"));

        let retry = guest_mount_command(&m, "slave,allow_other,cache=no", true);
        assert!(retry.ends_with("-o nonempty"));
    }

    #[test]
    fn location_directory_is_created_with_0750() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let location = dir.path().join("exported/code");
        create_private_dir(&location).unwrap();

        let mode = std::fs::metadata(&location).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o750);
    }
}
