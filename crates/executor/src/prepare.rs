//! The *prepare* phase: provision credentials and a fresh virtual machine,
//! then wait until the guest is reachable over SSH.
//!
//! Ordering matters: the Secret is created before the VM so the guest's
//! cloud-init can resolve it on first boot, and a VM creation failure rolls
//! the Secret back so nothing lingers for the garbage collector.

use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::{eyre, Context as _, Result};
use kube::api::WatchEvent;
use kube::ResourceExt as _;
use tracing::{info, warn};

use crate::cluster::{self, RunConfig, SshRunConfig, WatchFlow};
use crate::context::JobContext;
use crate::secrets::{self, SshCredentials};
use crate::{credentials, ssh, vmi};

/// Options for provisioning the job's virtual machine.
#[derive(Debug, Parser)]
pub struct PrepareOpts {
    /// Containerdisk image used when the job does not name one
    #[arg(long, default_value = "")]
    pub default_image: String,

    #[arg(long, default_value = "")]
    pub default_image_pull_policy: String,

    #[arg(long, default_value = "")]
    pub default_image_pull_secret: String,

    /// QEMU machine type (e.g. 'q35', 'microvm', 'virt')
    #[arg(long, default_value = "")]
    pub default_machine_type: String,

    /// VM architecture (e.g. 'x86_64', 'aarch64')
    #[arg(long, default_value = "")]
    pub default_architecture: String,

    #[arg(long, default_value = "1")]
    pub default_cpu_request: String,

    #[arg(long, default_value = "1")]
    pub default_cpu_limit: String,

    #[arg(long, default_value = "1Gi")]
    pub default_memory_request: String,

    #[arg(long, default_value = "1Gi")]
    pub default_memory_limit: String,

    #[arg(long, default_value = "")]
    pub default_ephemeral_storage_request: String,

    #[arg(long, default_value = "")]
    pub default_ephemeral_storage_limit: String,

    /// Guest clock timezone
    #[arg(long, default_value = "Etc/UTC")]
    pub default_timezone: String,

    /// Overall deadline for the machine to become reachable
    #[arg(long, default_value = "1h", value_parser = humantime::parse_duration)]
    pub timeout: Duration,

    /// Per-attempt SSH connection timeout
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    pub dial_timeout: Duration,

    /// Shell the job's stage scripts are written for (bash or pwsh)
    #[arg(long, default_value = "bash")]
    pub shell: String,

    /// Login user created on the guest
    #[arg(long, default_value = "gitlab-runner")]
    pub ssh_user: String,
}

pub async fn run(opts: PrepareOpts, jctx: &JobContext) -> Result<()> {
    let mut jctx = jctx.clone();
    apply_defaults(&mut jctx, &opts);

    let password = credentials::generate_password(32);
    let user_data = credentials::generate_user_data(&opts.shell, &opts.ssh_user, &password)
        .context("generating cloud-init user-data")?;

    let client = cluster::client().await?;
    let secret_api = secrets::secret_api(client.clone(), &jctx.namespace);
    let secret =
        secrets::create_credentials_secret(&secret_api, &jctx, &opts.ssh_user, &password, &user_data)
            .await?;
    let secret_name = secret.name_any();
    info!(secret = %secret_name, "created VM credentials secret");

    let run_config = RunConfig {
        shell: opts.shell.clone(),
        ssh: SshRunConfig {
            user: opts.ssh_user.clone(),
            // Only the secret reference is persisted on the VM.
            password: String::new(),
            secret_ref: secret_name.clone(),
        },
    };

    info!("creating virtual machine instance");
    let vmi_api = cluster::vmi_api(client, &jctx.namespace);
    let vm = match vmi::create_job_vm(&vmi_api, &jctx, &run_config, &secret_name).await {
        Ok(vm) => vm,
        Err(err) => {
            // A Secret without its machine is dead weight; reap it now
            // rather than waiting for gc.
            if let Err(rollback) =
                secrets::delete_credentials_secret(&secret_api, &secret_name).await
            {
                warn!(error = %rollback, "failed to roll back credentials secret");
            }
            return Err(err);
        }
    };

    info!(vm = %vm.name_any(), "waiting for virtual machine instance to be ready");

    let credentials = SshCredentials {
        user: opts.ssh_user.clone(),
        password,
        port: 22,
    };

    tokio::time::timeout(opts.timeout, async {
        let mut latest = vm.clone();
        cluster::watch_job_vm(&vmi_api, &jctx, Some(&vm), |event| {
            Ok(match event {
                // Watch hiccups are survivable while provisioning; retry.
                WatchEvent::Error(_) => WatchFlow::Continue,
                event => match cluster::event_vm(event) {
                    Some(seen) if seen.is_reachable() => {
                        latest = seen.clone();
                        WatchFlow::Done
                    }
                    Some(seen) => {
                        latest = seen.clone();
                        WatchFlow::Continue
                    }
                    None => WatchFlow::Continue,
                },
            })
        })
        .await?;

        let ip = latest
            .ip_address()
            .ok_or_else(|| eyre!("virtual machine instance became ready without an address"))?
            .to_string();

        info!(
            vm = %latest.name_any(),
            image = %jctx.image,
            machine_type = %jctx.machine_type,
            architecture = %jctx.architecture,
            node = %latest.status.as_ref().map(|s| s.node_name.as_str()).unwrap_or_default(),
            %ip,
            "virtual machine instance is ready"
        );
        info!("waiting for virtual machine to become reachable via ssh");

        ssh::dial(&ip, &credentials, opts.dial_timeout).await
    })
    .await
    .map_err(|_| eyre!("timed out waiting for the virtual machine to become reachable"))?
}

/// Fill job fields the runner left empty with this deployment's defaults.
fn apply_defaults(jctx: &mut JobContext, opts: &PrepareOpts) {
    let defaults = [
        (&mut jctx.cpu_request, &opts.default_cpu_request),
        (&mut jctx.cpu_limit, &opts.default_cpu_limit),
        (&mut jctx.memory_request, &opts.default_memory_request),
        (&mut jctx.memory_limit, &opts.default_memory_limit),
        (
            &mut jctx.ephemeral_storage_request,
            &opts.default_ephemeral_storage_request,
        ),
        (
            &mut jctx.ephemeral_storage_limit,
            &opts.default_ephemeral_storage_limit,
        ),
        (&mut jctx.image, &opts.default_image),
        (&mut jctx.image_pull_policy, &opts.default_image_pull_policy),
        (&mut jctx.image_pull_secret, &opts.default_image_pull_secret),
        (&mut jctx.timezone, &opts.default_timezone),
        (&mut jctx.machine_type, &opts.default_machine_type),
        (&mut jctx.architecture, &opts.default_architecture),
    ];
    for (field, default) in defaults {
        if field.is_empty() {
            *field = default.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> PrepareOpts {
        PrepareOpts::parse_from(["prepare"])
    }

    #[test]
    fn test_defaults_fill_empty_fields_only() {
        let mut jctx = JobContext {
            image: "registry/custom:1".into(),
            ..Default::default()
        };
        apply_defaults(&mut jctx, &opts());
        // Explicit job settings win over defaults.
        assert_eq!(jctx.image, "registry/custom:1");
        assert_eq!(jctx.cpu_request, "1");
        assert_eq!(jctx.memory_request, "1Gi");
        assert_eq!(jctx.memory_limit, "1Gi");
        assert_eq!(jctx.timezone, "Etc/UTC");
        // Storage has no default; stays omitted.
        assert_eq!(jctx.ephemeral_storage_request, "");
    }

    #[test]
    fn test_flag_defaults() {
        let opts = opts();
        assert_eq!(opts.timeout, Duration::from_secs(3600));
        assert_eq!(opts.dial_timeout, Duration::from_secs(10));
        assert_eq!(opts.shell, "bash");
        assert_eq!(opts.ssh_user, "gitlab-runner");
    }

    #[test]
    fn test_duration_flags_parse_human_values() {
        let opts = PrepareOpts::parse_from(["prepare", "--timeout", "90s", "--dial-timeout", "2s"]);
        assert_eq!(opts.timeout, Duration::from_secs(90));
        assert_eq!(opts.dial_timeout, Duration::from_secs(2));
    }
}
