//! GitLab Runner custom executor backed by ephemeral KubeVirt virtual
//! machines.
//!
//! The runner drives each job through four invocations of this binary —
//! `config`, `prepare`, `run`, `cleanup` — plus a cluster-wide `gc` sweep.
//! Each invocation is a fresh process; continuity between them lives entirely
//! on the cluster, in labels and annotations on the job's virtual machine and
//! in its credentials Secret.

use clap::{Parser, Subcommand};
use color_eyre::{eyre::Context as _, Report, Result};

mod cleanup;
mod cluster;
mod context;
mod credentials;
mod gc;
mod prepare;
mod run;
mod secrets;
mod ssh;
mod vmi;

use context::JobContext;

/// Exit status for a failing job script, unless overridden by
/// `BUILD_FAILURE_EXIT_CODE`.
const BUILD_FAILURE_DEFAULT: i32 = 1;

/// Exit status for executor/system errors, unless overridden by
/// `SYSTEM_FAILURE_EXIT_CODE`.
const SYSTEM_FAILURE_DEFAULT: i32 = 2;

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[command(flatten)]
    job: context::JobArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Emit the executor configuration document expected by the runner
    Config,
    /// Provision credentials and a fresh virtual machine for the job
    Prepare(prepare::PrepareOpts),
    /// Execute one job stage script inside the job's virtual machine
    Run(run::RunOpts),
    /// Tear down the job's virtual machine and credentials
    Cleanup(cleanup::CleanupOpts),
    /// Garbage collect expired virtual machines in the namespace
    Gc(gc::GcOpts),
}

/// Install the tracing/logging stack: environment-filtered, compact, and on
/// stderr — stdout belongs to the `config` document.
fn install_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let format = fmt::format().without_time().with_target(false).compact();

    let fmt_layer = fmt::layer()
        .event_format(format)
        .with_writer(std::io::stderr);
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

fn main() -> Result<(), Report> {
    install_tracing();
    color_eyre::install()?;

    let cli = Cli::parse();
    let jctx = JobContext::from_args(&cli.job);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Init tokio runtime")?;

    let result = match cli.command {
        Commands::Config => emit_config(),
        Commands::Prepare(opts) => rt.block_on(prepare::run(opts, &jctx)),
        Commands::Run(opts) => rt.block_on(run::run(opts, &jctx)),
        Commands::Cleanup(opts) => rt.block_on(cleanup::run(opts, &jctx)),
        Commands::Gc(opts) => rt.block_on(gc::run(opts, &jctx)),
    };
    rt.shutdown_background();

    if let Err(err) = result {
        eprintln!("kubevirt-executor: {err:#}");
        std::process::exit(exit_status_for(&err));
    }
    Ok(())
}

/// The runner's contract lets the executor adjust its configuration between
/// invocations; we have nothing to override.
fn emit_config() -> Result<()> {
    println!("{}", serde_json::json!({}));
    Ok(())
}

/// Map a failure onto the exit statuses the runner understands: job-script
/// failures are "build failures", everything else is the executor's fault.
fn exit_status_for(err: &Report) -> i32 {
    if err.downcast_ref::<run::BuildFailed>().is_some() {
        exit_status_from_env("BUILD_FAILURE_EXIT_CODE", BUILD_FAILURE_DEFAULT)
    } else {
        exit_status_from_env("SYSTEM_FAILURE_EXIT_CODE", SYSTEM_FAILURE_DEFAULT)
    }
}

fn exit_status_from_env(var: &str, default: i32) -> i32 {
    match std::env::var(var) {
        Ok(code) if !code.is_empty() => code.parse().unwrap_or_else(|err| {
            eprintln!("{var}={code} is not a valid exit code: {err}");
            default
        }),
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_every_phase() {
        Cli::parse_from(["kubevirt-executor", "config"]);
        Cli::parse_from([
            "kubevirt-executor",
            "--runner-id",
            "r1",
            "prepare",
            "--shell",
            "bash",
            "--ssh-user",
            "runner",
        ]);
        Cli::parse_from(["kubevirt-executor", "run", "/tmp/script", "build_script"]);
        Cli::parse_from(["kubevirt-executor", "cleanup", "--skip-if", "Failed"]);
        Cli::parse_from(["kubevirt-executor", "gc", "--dry-run", "--max-age", "5h"]);
    }

    #[test]
    fn test_global_job_flags_may_follow_the_subcommand() {
        let cli = Cli::parse_from([
            "kubevirt-executor",
            "gc",
            "--namespace",
            "ci-vms",
        ]);
        assert_eq!(cli.job.namespace, "ci-vms");
    }

    #[test]
    fn test_build_failure_maps_to_exit_one() {
        let report = Report::from(run::BuildFailed { status: 7 });
        assert_eq!(exit_status_for(&report), BUILD_FAILURE_DEFAULT);

        let system = color_eyre::eyre::eyre!("cluster unreachable");
        assert_eq!(exit_status_for(&system), SYSTEM_FAILURE_DEFAULT);
    }
}
