//! The *gc* command: a stateless sweep of expired machines.
//!
//! Nothing but object metadata drives this: the `created-at` and `ttl`
//! labels stamped at provisioning are the sole source of truth for expiry,
//! so gc can run from anywhere — a cron job, an operator's shell — without
//! any knowledge of the jobs that created the machines. Secrets are only
//! reaped through their machine's run configuration; an orphan Secret whose
//! machine is already gone belongs to the cleanup path that deleted it.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::Parser;
use color_eyre::eyre::{Context as _, Result};
use kube::api::{DeleteParams, ListParams};
use kube::ResourceExt as _;
use tracing::{info, warn};

use crate::cluster::{self, label, RUN_CONFIG_ANNOTATION};
use crate::context::JobContext;
use crate::secrets;
use crate::vmi::VirtualMachineInstance;

#[derive(Debug, Parser)]
pub struct GcOpts {
    /// Report what would be deleted without deleting anything
    #[arg(long)]
    pub dry_run: bool,

    /// Maximum age for machines without a usable ttl label
    #[arg(long, default_value = "3h", value_parser = humantime::parse_duration)]
    pub max_age: Duration,
}

pub async fn run(opts: GcOpts, jctx: &JobContext) -> Result<()> {
    let client = cluster::client().await?;
    let vmi_api = cluster::vmi_api(client.clone(), &jctx.namespace);
    let secret_api = secrets::secret_api(client, &jctx.namespace);

    // Every machine this executor ever created carries the id label;
    // machines without it belong to someone else and are not touched.
    let machines = vmi_api
        .list(&ListParams::default().labels(&label("id")))
        .await
        .context("listing virtual machine instances")?;

    let now = Utc::now();
    let mut deleted = 0_usize;
    let mut skipped = 0_usize;

    info!(
        count = machines.items.len(),
        "scanning virtual machine instances for garbage collection"
    );

    for vm in &machines.items {
        let name = vm.name_any();
        match assess(vm.labels(), now, opts.max_age) {
            Verdict::Unassessable { reason } => {
                warn!(vm = %name, reason, "skipping virtual machine instance");
                skipped += 1;
            }
            Verdict::Expired { age, ttl } => {
                if opts.dry_run {
                    info!(
                        vm = %name,
                        age = %format_age(age),
                        ttl = %format_age(ttl),
                        "[dry-run] would delete virtual machine instance"
                    );
                } else {
                    info!(
                        vm = %name,
                        age = %format_age(age),
                        ttl = %format_age(ttl),
                        "deleting expired virtual machine instance"
                    );
                    if !delete_machine(&vmi_api, &secret_api, vm).await {
                        continue;
                    }
                }
                deleted += 1;
            }
            Verdict::Alive { age, remaining } => {
                info!(
                    vm = %name,
                    age = %format_age(age),
                    expires_in = %format_age(remaining),
                    "virtual machine instance still valid"
                );
            }
        }
    }

    if opts.dry_run {
        info!(would_delete = deleted, skipped, "garbage collection dry-run complete");
    } else {
        info!(deleted, skipped, "garbage collection complete");
    }
    Ok(())
}

/// Delete one expired machine, reaping its credentials Secret first. Returns
/// whether the machine itself was deleted; failures are logged and the sweep
/// moves on.
async fn delete_machine(
    vmi_api: &kube::api::Api<VirtualMachineInstance>,
    secret_api: &kube::api::Api<k8s_openapi::api::core::v1::Secret>,
    vm: &VirtualMachineInstance,
) -> bool {
    match cluster::run_config_of(vm) {
        Ok(run_config) if !run_config.ssh.secret_ref.is_empty() => {
            match secrets::delete_credentials_secret(secret_api, &run_config.ssh.secret_ref).await {
                Ok(()) => {
                    info!(secret = %run_config.ssh.secret_ref, "deleted credentials secret");
                }
                Err(err) => warn!(error = %err, "failed to delete credentials secret"),
            }
        }
        Ok(_) => {}
        Err(err) if vm.annotations().contains_key(RUN_CONFIG_ANNOTATION) => {
            warn!(error = %err, "failed to read run configuration for secret cleanup");
        }
        Err(_) => {}
    }

    if let Err(err) = vmi_api.delete(&vm.name_any(), &DeleteParams::default()).await {
        warn!(vm = %vm.name_any(), error = %err, "failed to delete virtual machine instance");
        return false;
    }
    true
}

/// Per-machine verdict of one sweep.
#[derive(Debug, Eq, PartialEq)]
enum Verdict {
    /// No usable created-at metadata; warn and leave the machine alone.
    Unassessable { reason: &'static str },
    Expired { age: Duration, ttl: Duration },
    Alive { age: Duration, remaining: Duration },
}

/// Decide a machine's fate from its labels alone.
///
/// The ttl label is honored when it parses; otherwise `max_age` applies.
/// A machine created "in the future" (clock skew between writers) counts as
/// age zero rather than wrapping.
fn assess(labels: &BTreeMap<String, String>, now: DateTime<Utc>, max_age: Duration) -> Verdict {
    let created_at = match labels.get(&label("created-at")) {
        Some(raw) => match DateTime::parse_from_rfc3339(raw) {
            Ok(parsed) => parsed.with_timezone(&Utc),
            Err(_) => {
                return Verdict::Unassessable {
                    reason: "invalid created-at timestamp",
                }
            }
        },
        None => {
            return Verdict::Unassessable {
                reason: "missing created-at label",
            }
        }
    };

    let ttl = labels
        .get(&label("ttl"))
        .and_then(|raw| humantime::parse_duration(raw).ok())
        .unwrap_or(max_age);

    let age = (now - created_at).to_std().unwrap_or(Duration::ZERO);
    if age > ttl {
        Verdict::Expired { age, ttl }
    } else {
        Verdict::Alive {
            age,
            remaining: ttl - age,
        }
    }
}

fn format_age(duration: Duration) -> String {
    humantime::format_duration(Duration::from_secs(duration.as_secs())).to_string()
}
