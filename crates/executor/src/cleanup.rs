//! The *cleanup* phase: tear down the job's machine and credentials.
//!
//! Cleanup runs whether the job succeeded, failed or was cancelled, and may
//! race a retry of itself, so every step tolerates the object already being
//! gone. The Secret goes first: a post-crash state where only a Secret
//! remains is cheap to reap by label, while a machine without its Secret
//! would still be a live workload.

use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::{eyre, Context as _, Result};
use kube::api::{DeleteParams, WatchEvent};
use kube::ResourceExt as _;
use tracing::{info, warn};

use crate::cluster::{self, FindVmError, WatchFlow};
use crate::context::JobContext;
use crate::secrets;

#[derive(Debug, Parser)]
pub struct CleanupOpts {
    /// Deadline for the machine to go away after deletion
    #[arg(long, default_value = "1h", value_parser = humantime::parse_duration)]
    pub timeout: Duration,

    /// Skip teardown when the VM phase matches (`Phase` or `!Phase`)
    #[arg(long = "skip-if", value_delimiter = ',')]
    pub skip_if: Vec<String>,
}

pub async fn run(opts: CleanupOpts, jctx: &JobContext) -> Result<()> {
    let client = cluster::client().await?;
    let vmi_api = cluster::vmi_api(client.clone(), &jctx.namespace);

    let vm = match cluster::find_job_vm(&vmi_api, jctx).await {
        Ok(vm) => vm,
        Err(FindVmError::Disappeared) => {
            info!("skipping cleanup of virtual machine instance because none were found");
            return Ok(());
        }
        Err(err) => return Err(err).context("cleanup error"),
    };

    if let Some(rule) = matching_skip_rule(vm.phase(), &opts.skip_if) {
        info!(vm = %vm.name_any(), rule, "skipping cleanup of virtual machine instance");
        return Ok(());
    }

    info!(vm = %vm.name_any(), "deleting virtual machine instance");

    match cluster::run_config_of(&vm) {
        Ok(run_config) if !run_config.ssh.secret_ref.is_empty() => {
            let secret_api = secrets::secret_api(client, &jctx.namespace);
            match secrets::delete_credentials_secret(&secret_api, &run_config.ssh.secret_ref).await
            {
                Ok(()) => {
                    info!(secret = %run_config.ssh.secret_ref, "deleted credentials secret");
                }
                Err(err) => warn!(error = %err, "failed to delete credentials secret"),
            }
        }
        Ok(_) => {}
        Err(err) => warn!(error = %err, "failed to read run configuration for secret cleanup"),
    }

    vmi_api
        .delete(&vm.name_any(), &DeleteParams::default())
        .await
        .context("deleting virtual machine instance")?;

    // Unlike prepare we do not retry on watch errors: the machine may already
    // be gone, in which case waiting for a Deleted event would block forever.
    let wait = cluster::watch_job_vm(&vmi_api, jctx, Some(&vm), |event| {
        Ok(match event {
            WatchEvent::Error(_) => {
                warn!("couldn't wait for virtual machine instance to go away, abandoning it");
                WatchFlow::Done
            }
            WatchEvent::Deleted(_) => WatchFlow::Done,
            _ => WatchFlow::Continue,
        })
    });

    match tokio::time::timeout(opts.timeout, wait).await {
        Ok(result) => result,
        Err(_) => Err(eyre!(
            "timed out waiting for virtual machine instance to go away"
        )),
    }
}

/// First `--skip-if` rule matching the machine's phase, if any. A bare
/// `Phase` matches equality; `!Phase` matches any other phase.
fn matching_skip_rule<'a>(phase: &str, rules: &'a [String]) -> Option<&'a str> {
    rules
        .iter()
        .map(String::as_str)
        .find(|rule| match rule.strip_prefix('!') {
            Some(wanted) => phase != wanted,
            None => phase == *rule,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skip_on_matching_phase() {
        let rules = vec!["Failed".to_string()];
        assert_eq!(matching_skip_rule("Failed", &rules), Some("Failed"));
        assert_eq!(matching_skip_rule("Running", &rules), None);
    }

    #[test]
    fn test_negated_rule_skips_everything_else() {
        let rules = vec!["!Running".to_string()];
        assert_eq!(matching_skip_rule("Failed", &rules), Some("!Running"));
        assert_eq!(matching_skip_rule("Succeeded", &rules), Some("!Running"));
        assert_eq!(matching_skip_rule("Running", &rules), None);
    }

    #[test]
    fn test_any_matching_rule_wins() {
        let rules = vec!["Succeeded".to_string(), "Failed".to_string()];
        assert_eq!(matching_skip_rule("Failed", &rules), Some("Failed"));
        assert_eq!(matching_skip_rule("Pending", &rules), None);
        assert_eq!(matching_skip_rule("Failed", &[]), None);
    }

    #[test]
    fn test_skip_if_flag_splits_on_commas() {
        let opts = CleanupOpts::parse_from(["cleanup", "--skip-if", "Failed,!Running"]);
        assert_eq!(opts.skip_if, ["Failed", "!Running"]);
    }
}
