//! The *run* phase: execute one stage script inside the job's machine.
//!
//! The runner invokes this once per stage with the path of a generated
//! script. We find the machine by its id label, recover the SSH credentials
//! through the Secret referenced from the machine's run configuration, and
//! stream the script to the guest shell. The remote exit status becomes our
//! own, classified as a build failure so the runner can tell "the job's
//! script failed" apart from "the executor broke".

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::{bail, eyre, Result};
use tracing::debug;

use crate::context::JobContext;
use crate::{cluster, secrets, ssh};

/// Connection timeout for the execution session.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The job's own script failed on the guest.
#[derive(Debug, thiserror::Error)]
#[error("job script exited with status {status}")]
pub struct BuildFailed {
    pub status: i32,
}

#[derive(Debug, Parser)]
pub struct RunOpts {
    /// Path of the generated stage script to execute
    pub script: PathBuf,

    /// Name of the stage being executed (e.g. build_script)
    pub stage: String,
}

pub async fn run(opts: RunOpts, jctx: &JobContext) -> Result<()> {
    let client = cluster::client().await?;
    let vmi_api = cluster::vmi_api(client.clone(), &jctx.namespace);

    let vm = cluster::find_job_vm(&vmi_api, jctx).await?;
    let run_config = cluster::run_config_of(&vm)?;
    if run_config.ssh.secret_ref.is_empty() {
        bail!("virtual machine instance has no credentials secret reference");
    }

    let secret_api = secrets::secret_api(client, &jctx.namespace);
    let credentials = secrets::get_ssh_credentials(&secret_api, &run_config.ssh.secret_ref).await?;

    let ip = vm
        .ip_address()
        .ok_or_else(|| eyre!("virtual machine instance has no address"))?;

    debug!(stage = %opts.stage, %ip, "executing stage script");
    let status = ssh::exec_script(
        ip,
        &credentials,
        &run_config.shell,
        &opts.script,
        CONNECT_TIMEOUT,
    )
    .await?;

    match classify_exit(status) {
        StageOutcome::Success => Ok(()),
        StageOutcome::BuildFailure(status) => Err(BuildFailed { status }.into()),
        StageOutcome::TransportFailure => {
            bail!("lost the ssh connection while the stage script was running")
        }
    }
}

#[derive(Debug, Eq, PartialEq)]
enum StageOutcome {
    Success,
    /// The script itself failed; the runner reports it as a job failure.
    BuildFailure(i32),
    /// The transport failed, so the script's fate is unknown; the runner
    /// reports it as a system failure.
    TransportFailure,
}

fn classify_exit(code: Option<i32>) -> StageOutcome {
    match code {
        Some(0) => StageOutcome::Success,
        Some(ssh::TRANSPORT_FAILURE_STATUS) | None => StageOutcome::TransportFailure,
        Some(status) => StageOutcome::BuildFailure(status),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_exit() {
        assert_eq!(classify_exit(Some(0)), StageOutcome::Success);
        assert_eq!(classify_exit(Some(1)), StageOutcome::BuildFailure(1));
        assert_eq!(classify_exit(Some(137)), StageOutcome::BuildFailure(137));
        assert_eq!(classify_exit(Some(255)), StageOutcome::TransportFailure);
        assert_eq!(classify_exit(None), StageOutcome::TransportFailure);
    }

    #[test]
    fn test_build_failure_is_downcastable() {
        let report = color_eyre::eyre::Report::from(BuildFailed { status: 3 });
        let failure = report.downcast_ref::<BuildFailed>().unwrap();
        assert_eq!(failure.status, 3);
    }
}
