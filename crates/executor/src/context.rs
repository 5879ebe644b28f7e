//! Per-invocation job identity.
//!
//! The host runner executes this binary afresh for every phase, so nothing
//! survives in memory between *prepare*, *run* and *cleanup*. Continuity is
//! carried by the job id computed here: it is stamped on the virtual machine
//! and its credentials Secret as a label, and later phases find those objects
//! by selecting on it.

use chrono::{SecondsFormat, Utc};
use clap::Args;
use sha1::{Digest, Sha1};

/// Fallback time-to-live stamped on the VM when the job does not set one.
const DEFAULT_VM_TTL: &str = "3h";

/// Job identity and per-job overrides propagated by the GitLab runner.
///
/// Every flag falls back to the corresponding environment variable exported
/// by the runner's custom executor protocol, so the binary works both under
/// the runner and when invoked by hand for debugging.
#[derive(Args, Clone, Debug, Default)]
pub struct JobArgs {
    #[arg(long, global = true, env = "CUSTOM_ENV_CI_RUNNER_ID", default_value = "")]
    pub runner_id: String,

    #[arg(long, global = true, env = "CUSTOM_ENV_CI_PROJECT_ID", default_value = "")]
    pub project_id: String,

    #[arg(long, global = true, env = "CUSTOM_ENV_CI_CONCURRENT_PROJECT_ID", default_value = "")]
    pub concurrent_id: String,

    #[arg(long, global = true, env = "CUSTOM_ENV_CI_JOB_ID", default_value = "")]
    pub job_id: String,

    #[arg(long, global = true, env = "CUSTOM_ENV_CI_JOB_NAME", default_value = "")]
    pub job_name: String,

    #[arg(long, global = true, env = "CUSTOM_ENV_CI_COMMIT_REF_NAME", default_value = "")]
    pub job_ref: String,

    #[arg(long, global = true, env = "CUSTOM_ENV_CI_COMMIT_SHA", default_value = "")]
    pub job_sha: String,

    #[arg(long, global = true, env = "CUSTOM_ENV_CI_COMMIT_BEFORE_SHA", default_value = "")]
    pub job_before_sha: String,

    #[arg(long, global = true, env = "CUSTOM_ENV_CI_JOB_URL", default_value = "")]
    pub job_url: String,

    /// Containerdisk image the job asked for
    #[arg(long, global = true, env = "CUSTOM_ENV_CI_JOB_IMAGE", default_value = "")]
    pub image: String,

    /// QEMU machine type (e.g. 'q35', 'microvm', 'virt')
    #[arg(long, global = true, env = "CUSTOM_ENV_VM_MACHINE_TYPE", default_value = "")]
    pub machine_type: String,

    /// VM architecture (e.g. 'x86_64', 'aarch64')
    #[arg(long, global = true, env = "CUSTOM_ENV_VM_ARCHITECTURE", default_value = "")]
    pub architecture: String,

    /// Namespace holding every object this executor creates
    #[arg(long, global = true, env = "KUBEVIRT_NAMESPACE", default_value = "gitlab-runner")]
    pub namespace: String,

    /// VM time-to-live for garbage collection (e.g. '3h', '24h')
    #[arg(long, global = true, env = "CUSTOM_ENV_VM_TTL", default_value = "")]
    pub vm_ttl: String,

    /// CPU request (e.g. '1', '2', '500m')
    #[arg(long, global = true, env = "CUSTOM_ENV_VM_CPU_REQUEST", default_value = "")]
    pub cpu_request: String,

    /// CPU limit (e.g. '2', '4')
    #[arg(long, global = true, env = "CUSTOM_ENV_VM_CPU_LIMIT", default_value = "")]
    pub cpu_limit: String,

    /// Memory request (e.g. '1Gi', '512Mi')
    #[arg(long, global = true, env = "CUSTOM_ENV_VM_MEMORY_REQUEST", default_value = "")]
    pub memory_request: String,

    /// Memory limit (e.g. '2Gi', '4Gi')
    #[arg(long, global = true, env = "CUSTOM_ENV_VM_MEMORY_LIMIT", default_value = "")]
    pub memory_limit: String,

    /// Ephemeral storage request (e.g. '10Gi', '20Gi')
    #[arg(long, global = true, env = "CUSTOM_ENV_VM_STORAGE_REQUEST", default_value = "")]
    pub ephemeral_storage_request: String,

    /// Ephemeral storage limit (e.g. '20Gi', '50Gi')
    #[arg(long, global = true, env = "CUSTOM_ENV_VM_STORAGE_LIMIT", default_value = "")]
    pub ephemeral_storage_limit: String,

    /// Guest clock timezone
    #[arg(long, global = true, env = "CUSTOM_ENV_VM_TIMEZONE", default_value = "")]
    pub timezone: String,
}

/// Everything a phase needs to know about the job it is serving.
///
/// `id` is unique across time (the digest includes a nanosecond timestamp)
/// and therefore NOT reproducible across invocations; phases after *prepare*
/// recover it by selecting on the id label rather than recomputing it.
#[derive(Clone, Debug, Default)]
pub struct JobContext {
    pub id: String,
    pub base_name: String,
    pub namespace: String,

    pub image: String,
    pub image_pull_policy: String,
    pub image_pull_secret: String,
    pub machine_type: String,
    pub architecture: String,
    pub timezone: String,

    pub cpu_request: String,
    pub cpu_limit: String,
    pub memory_request: String,
    pub memory_limit: String,
    pub ephemeral_storage_request: String,
    pub ephemeral_storage_limit: String,

    pub project_id: String,
    pub job_id: String,
    pub job_name: String,
    pub job_ref: String,
    pub job_sha: String,
    pub job_before_sha: String,
    pub job_url: String,

    /// RFC3339 creation timestamp, stamped on the VM for garbage collection.
    pub created_at: String,
    /// Duration string (e.g. '3h') bounding the VM's life.
    pub ttl: String,
}

impl JobContext {
    pub fn from_args(args: &JobArgs) -> Self {
        let now = Utc::now();
        let nanos = now.timestamp_nanos_opt().unwrap_or_default();

        JobContext {
            id: job_id_digest(
                &args.runner_id,
                &args.project_id,
                &args.concurrent_id,
                &args.job_id,
                nanos,
            ),
            base_name: format!(
                "runner-{}-project-{}-concurrent-{}",
                args.runner_id, args.project_id, args.concurrent_id
            ),
            namespace: args.namespace.clone(),

            image: args.image.clone(),
            image_pull_policy: String::new(),
            image_pull_secret: String::new(),
            machine_type: args.machine_type.clone(),
            architecture: args.architecture.clone(),
            timezone: args.timezone.clone(),

            cpu_request: args.cpu_request.clone(),
            cpu_limit: args.cpu_limit.clone(),
            memory_request: args.memory_request.clone(),
            memory_limit: args.memory_limit.clone(),
            ephemeral_storage_request: args.ephemeral_storage_request.clone(),
            ephemeral_storage_limit: args.ephemeral_storage_limit.clone(),

            project_id: args.project_id.clone(),
            job_id: args.job_id.clone(),
            job_name: args.job_name.clone(),
            job_ref: args.job_ref.clone(),
            job_sha: args.job_sha.clone(),
            job_before_sha: args.job_before_sha.clone(),
            job_url: args.job_url.clone(),

            created_at: now.to_rfc3339_opts(SecondsFormat::Secs, true),
            ttl: if args.vm_ttl.is_empty() {
                DEFAULT_VM_TTL.to_string()
            } else {
                args.vm_ttl.clone()
            },
        }
    }
}

enum Element<'a> {
    Str(&'a str),
    Int(i64),
}

/// SHA-1 over a length-prefixed encoding of the identity tuple.
///
/// Every element is preceded by its length (strings) or is fixed-width
/// (integers), and the whole sequence by its element count, so that adjacent
/// elements cannot be re-split into a colliding tuple.
fn digest(elements: &[Element<'_>]) -> String {
    let mut hasher = Sha1::new();
    hasher.update((elements.len() as u64).to_be_bytes());
    for element in elements {
        match element {
            Element::Str(s) => {
                hasher.update((s.len() as u64).to_be_bytes());
                hasher.update(s.as_bytes());
            }
            Element::Int(n) => hasher.update(n.to_be_bytes()),
        }
    }
    hex::encode(hasher.finalize())
}

/// Derive the job id from the runner's identity tuple and a wall-clock
/// nanosecond timestamp, guaranteeing uniqueness across retries of the same
/// job.
pub fn job_id_digest(
    runner_id: &str,
    project_id: &str,
    concurrent_id: &str,
    job_id: &str,
    timestamp_nanos: i64,
) -> String {
    digest(&[
        Element::Str(runner_id),
        Element::Str(project_id),
        Element::Str(concurrent_id),
        Element::Str(job_id),
        Element::Int(timestamp_nanos),
    ])
}
