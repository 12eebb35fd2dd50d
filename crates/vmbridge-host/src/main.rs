//! # vmbridge-hostd
//!
//! Host agent for one vmbridge instance. Loads the resolved instance
//! configuration from the instance directory, creates the driver for its
//! VM type, and supervises the VM until it stops. Progress is reported as
//! JSON lines on stdout; diagnostics go to stderr.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use vmbridge_common::constants::HOST_AGENT_PID_FILE;
use vmbridge_common::instance::Instance;
use vmbridge_host::agent::HostAgent;
use vmbridge_host::driver::create_driver;
use vmbridge_host::events::EventEmitter;

/// Host agent daemon for vmbridge-managed VMs.
#[derive(Debug, Parser)]
#[command(name = "vmbridge-hostd", version)]
struct Args {
    /// Instance directory containing instance.json.
    #[arg(long)]
    instance_dir: PathBuf,

    /// Log at debug level regardless of RUST_LOG.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env()
    };
    // stdout is reserved for the event stream.
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let instance = Arc::new(
        Instance::load(&args.instance_dir)
            .with_context(|| format!("loading instance from {}", args.instance_dir.display()))?,
    );
    tracing::info!(name = %instance.name, vm_type = %instance.vm_type, "instance loaded");

    let pid_path = instance.dir.join(HOST_AGENT_PID_FILE);
    std::fs::write(&pid_path, std::process::id().to_string())
        .with_context(|| format!("writing {}", pid_path.display()))?;

    let driver = create_driver(&instance.vm_type).context("creating driver")?;
    let emitter = Arc::new(EventEmitter::stdout(instance.ssh_local_port));
    let agent =
        Arc::new(HostAgent::new(Arc::clone(&instance), driver, emitter).context("starting agent")?);

    let result = agent.run().await;

    let _ = std::fs::remove_file(&pid_path);
    result.context("instance failed")
}
