//! Boot-readiness phases.
//!
//! The agent drives the guest through three ordered phases (essential,
//! optional, final), each a list of probe scripts run over SSH. A step
//! retries with a fixed backoff until its script exits zero; fatal steps
//! abort their phase when they run out of retries, other failures are
//! collected and surface as a degraded status.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use vmbridge_common::constants::{BOOT_DONE_MARKER, CIDATA_BOOT_DONE, CIDATA_PARAM_ENV};
use vmbridge_common::error::Result;
use vmbridge_common::instance::InstanceConfig;

use crate::script::prefix_export_param;
use crate::ssh::{RemoteOutput, SshSession};

/// Default retry budget per step.
pub const DEFAULT_RETRIES: u32 = 60;

/// Default sleep between retries.
pub const DEFAULT_SLEEP: Duration = Duration::from_secs(10);

/// One readiness probe.
#[derive(Debug, Clone)]
pub struct RequirementStep {
    /// Short description for logs and errors.
    pub description: String,
    /// Script whose zero exit code satisfies the step.
    pub script: String,
    /// Debugging hint attached to the failure message.
    pub hint: Option<String>,
    /// Exhausted retries abort the phase.
    pub fatal: bool,
    /// Bypass the SSH control master (it may not exist yet).
    pub no_master: bool,
}

/// An ordered list of steps.
#[derive(Debug, Clone)]
pub struct Phase {
    /// Phase name for logs.
    pub name: &'static str,
    /// Steps, run sequentially.
    pub steps: Vec<RequirementStep>,
}

/// Abstraction over "run this script in the guest", so the engine can be
/// exercised without a VM.
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    /// Runs a prepared script; transport failures are errors, script
    /// failures are reported through the output.
    async fn run_script(&self, script: &str, use_master: bool) -> Result<RemoteOutput>;
}

#[async_trait]
impl ScriptRunner for SshSession {
    async fn run_script(&self, script: &str, use_master: bool) -> Result<RemoteOutput> {
        Self::run_script(self, script, use_master).await
    }
}

/// The retry/fatal state machine.
pub struct RequirementsEngine {
    runner: Arc<dyn ScriptRunner>,
    retries: u32,
    sleep: Duration,
}

impl RequirementsEngine {
    /// Engine with the production retry budget (60 × 10 s).
    #[must_use]
    pub fn new(runner: Arc<dyn ScriptRunner>) -> Self {
        Self { runner, retries: DEFAULT_RETRIES, sleep: DEFAULT_SLEEP }
    }

    /// Overrides the retry budget; tests shrink it.
    #[must_use]
    pub fn with_retry(mut self, retries: u32, sleep: Duration) -> Self {
        self.retries = retries.max(1);
        self.sleep = sleep;
        self
    }

    async fn run_step(&self, step: &RequirementStep) -> std::result::Result<(), String> {
        let script = prefix_export_param(&step.script);
        let mut last_failure = String::new();

        for attempt in 1..=self.retries {
            match self.runner.run_script(&script, !step.no_master).await {
                Ok(output) if output.success() => {
                    tracing::debug!(step = %step.description, attempt, "requirement satisfied");
                    return Ok(());
                }
                Ok(output) => {
                    last_failure = format!(
                        "exit {:?}: {}",
                        output.code,
                        output.stderr.trim()
                    );
                }
                Err(e) => last_failure = e.to_string(),
            }
            tracing::debug!(
                step = %step.description,
                attempt,
                retries = self.retries,
                failure = %last_failure,
                "requirement not yet satisfied"
            );
            if attempt < self.retries {
                tokio::time::sleep(self.sleep).await;
            }
        }

        let mut message = format!("requirement \"{}\" failed: {last_failure}", step.description);
        if let Some(hint) = &step.hint {
            message.push_str(&format!(" (hint: {hint})"));
        }
        Err(message)
    }

    /// Runs one phase. Non-fatal failures are returned for the degraded
    /// status; a fatal failure aborts with the errors joined so far.
    ///
    /// # Errors
    ///
    /// Returns the joined phase error when a fatal step exhausts its
    /// retries.
    pub async fn run_phase(&self, phase: &Phase) -> std::result::Result<Vec<String>, String> {
        tracing::info!(phase = phase.name, steps = phase.steps.len(), "running phase");
        let mut errors = Vec::new();

        for step in &phase.steps {
            if let Err(message) = self.run_step(step).await {
                tracing::warn!(phase = phase.name, error = %message, "requirement failed");
                errors.push(message);
                if step.fatal {
                    return Err(format!(
                        "phase {} aborted: {}",
                        phase.name,
                        errors.join("; ")
                    ));
                }
            }
        }
        tracing::info!(phase = phase.name, errors = errors.len(), "phase finished");
        Ok(errors)
    }
}

/// The essential phase: the guest answers SSH and the cidata volume is
/// where the scripts expect it. The agent starts the SSH control master
/// immediately after this phase succeeds.
#[must_use]
pub fn essential_phase() -> Phase {
    Phase {
        name: "essential",
        steps: vec![
            RequirementStep {
                description: "ssh is reachable".into(),
                script: "#!/bin/sh\ntrue\n".into(),
                hint: Some("the guest sshd may still be starting".into()),
                fatal: true,
                no_master: true,
            },
            RequirementStep {
                description: "cidata parameters are mounted".into(),
                script: format!("#!/bin/sh\ntest -r {CIDATA_PARAM_ENV}\n"),
                hint: Some("the cidata volume did not mount; check the serial log".into()),
                fatal: true,
                no_master: true,
            },
        ],
    }
}

/// The optional phase: containerd readiness and user-defined probes.
/// Failures degrade the instance but never abort it.
#[must_use]
pub fn optional_phase(config: &InstanceConfig) -> Phase {
    let mut steps = Vec::new();
    if config.containerd.system {
        steps.push(RequirementStep {
            description: "system containerd is running".into(),
            script: "#!/bin/sh\ntest -S /run/containerd/containerd.sock\n".into(),
            hint: None,
            fatal: false,
            no_master: false,
        });
    }
    if config.containerd.user {
        steps.push(RequirementStep {
            description: "rootless containerd is running".into(),
            script: "#!/bin/sh\ntest -S \"${XDG_RUNTIME_DIR:-/run/user/$(id -u)}/containerd/containerd.sock\"\n"
                .into(),
            hint: None,
            fatal: false,
            no_master: false,
        });
    }
    for probe in &config.probes {
        steps.push(RequirementStep {
            description: probe.description.clone(),
            script: probe.script.clone(),
            hint: probe.hint.clone(),
            fatal: false,
            no_master: false,
        });
    }
    Phase { name: "optional", steps }
}

/// The final phase: the boot scripts have finished, detected by the
/// boot-done marker matching its cidata copy.
#[must_use]
pub fn final_phase() -> Phase {
    Phase {
        name: "final",
        steps: vec![RequirementStep {
            description: "boot scripts have finished".into(),
            script: format!("#!/bin/sh\ncmp -s {BOOT_DONE_MARKER} {CIDATA_BOOT_DONE}\n"),
            hint: Some("boot scripts are still running; check the serial log".into()),
            fatal: false,
            no_master: false,
        }],
    }
}
