//! Command line interface
//!
//! `plan` shows what an environment resolves to, `up` keeps its forwards
//! running until SIGINT/SIGTERM.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use crate::cluster::ClusterSessionFactory;
use crate::config::{ConfigFile, ConfigStorage, EngineSettings};
use crate::forwarding::{
    effective_environment, resolve, ForwardSpec, ForwardSupervisor, RunReport, SupervisorConfig,
};
use crate::shutdown;

#[derive(Parser, Debug)]
#[command(
    name = "kubeforward",
    version,
    about = "Keeps the Kubernetes port-forwards of an environment alive"
)]
pub struct CliArgs {
    /// Configuration file (YAML, or JSON by extension).
    #[arg(global = true, short = 'f', long = "config", env = "KUBEFORWARD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Path to kubeconfig file, overrides the one set in the configuration.
    #[arg(global = true, long)]
    pub kubeconfig: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the forwards an environment resolves to.
    Plan {
        /// Environment name from the configuration.
        environment: String,
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Run the forwards of an environment until interrupted.
    Up(UpArgs),
}

#[derive(Args, Debug)]
pub struct UpArgs {
    /// Environment name from the configuration.
    pub environment: String,

    /// Backoff base before the first reconnect, e.g. "500ms".
    #[arg(long)]
    pub initial_delay: Option<humantime::Duration>,

    /// Backoff cap, e.g. "30s".
    #[arg(long)]
    pub max_delay: Option<humantime::Duration>,

    /// Consecutive failed attempts before a forward gives up.
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// How long shutdown waits for forwards to close.
    #[arg(long)]
    pub shutdown_grace: Option<humantime::Duration>,

    /// Print a status table at this interval.
    #[arg(long)]
    pub status_interval: Option<humantime::Duration>,
}

impl UpArgs {
    /// Settings from the file with command line overrides applied
    fn settings(&self, base: &EngineSettings) -> EngineSettings {
        let mut settings = base.clone();
        if let Some(delay) = self.initial_delay {
            settings.initial_delay_ms = millis(delay.into());
        }
        if let Some(delay) = self.max_delay {
            settings.max_delay_ms = millis(delay.into());
        }
        if let Some(retries) = self.max_retries {
            settings.max_retries = Some(retries);
        }
        if let Some(grace) = self.shutdown_grace {
            settings.shutdown_grace_ms = millis(grace.into());
        }
        settings
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Run the parsed command
pub async fn execute(args: CliArgs) -> anyhow::Result<ExitCode> {
    let storage = match &args.config {
        Some(path) => ConfigStorage::with_path(path),
        None => ConfigStorage::new(),
    };
    let config = storage
        .load()
        .await
        .with_context(|| format!("failed to load {}", storage.path().display()))?;

    match args.command {
        Command::Plan { environment, json } => {
            let specs = resolve(&config, &environment)?;
            print!("{}", render_plan(&specs, json)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Up(up_args) => {
            let env = effective_environment(&config, &up_args.environment)?;
            let factory = session_factory(args.kubeconfig.or(env.kubeconfig))?;
            let report = up(&config, &up_args, factory).await?;
            Ok(ExitCode::from(report.exit_code()))
        }
    }
}

#[cfg(feature = "kube-client")]
fn session_factory(kubeconfig: Option<PathBuf>) -> anyhow::Result<Arc<dyn ClusterSessionFactory>> {
    use crate::cluster::kube::KubeSessionFactory;

    let factory = match kubeconfig {
        Some(path) => KubeSessionFactory::with_kubeconfig(path),
        None => KubeSessionFactory::new(),
    };
    Ok(Arc::new(factory))
}

#[cfg(not(feature = "kube-client"))]
fn session_factory(_kubeconfig: Option<PathBuf>) -> anyhow::Result<Arc<dyn ClusterSessionFactory>> {
    anyhow::bail!("built without Kubernetes support, enable the kube-client feature")
}

/// Resolve `args.environment` and supervise it until a shutdown signal
pub async fn up(
    config: &ConfigFile,
    args: &UpArgs,
    factory: Arc<dyn ClusterSessionFactory>,
) -> anyhow::Result<RunReport> {
    let specs = resolve(config, &args.environment)?;
    let settings = args.settings(&config.settings);
    let supervisor = ForwardSupervisor::new(factory, SupervisorConfig::from(&settings));
    let reporter = supervisor.reporter();

    info!(
        "Forwarding {} ports for environment {}",
        specs.len(),
        args.environment
    );
    let run = supervisor.run(specs, shutdown::wait());

    let interval = args
        .status_interval
        .map(Duration::from)
        .filter(|every| !every.is_zero());
    let report = match interval {
        Some(every) => {
            tokio::pin!(run);
            let mut ticker = tokio::time::interval(every);
            // The first tick fires immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    report = &mut run => break report,
                    _ = ticker.tick() => println!("{}", reporter.snapshot()),
                }
            }
        }
        None => run.await,
    };

    println!("{}", report.snapshot);
    if !report.shutdown_timeouts.is_empty() {
        warn!(
            "{} forwards did not close within the grace period",
            report.shutdown_timeouts.len()
        );
    }
    for failed in report.snapshot.failed() {
        warn!(
            "Forward {} failed: {}",
            failed.spec.id(),
            failed
                .last_error_message
                .as_deref()
                .unwrap_or("never became active")
        );
    }
    Ok(report)
}

/// Resolved forwards as a table or JSON
pub fn render_plan(specs: &[ForwardSpec], json: bool) -> anyhow::Result<String> {
    if json {
        let mut out = serde_json::to_string_pretty(specs)?;
        out.push('\n');
        return Ok(out);
    }

    let mut out = format!(
        "{:<16} {:<16} {:<40} {:<22} {}\n",
        "CONTEXT", "NAMESPACE", "TARGET", "LOCAL", "REMOTE PORT"
    );
    for spec in specs {
        out.push_str(&format!(
            "{:<16} {:<16} {:<40} {:<22} {}\n",
            spec.context,
            spec.namespace,
            format!("{}/{}", spec.kind, spec.name),
            spec.local_addr().to_string(),
            spec.remote_port
        ));
    }
    Ok(out)
}
