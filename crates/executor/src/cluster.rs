//! Cluster plumbing shared by every phase: client construction, the label
//! vocabulary tying a job to its objects, lookup by id label, and the
//! resumable watch loop over the job's virtual machine.

use std::future::Future;

use color_eyre::eyre::{eyre, Context as _, Result};
use futures::stream::BoxStream;
use futures::StreamExt as _;
use kube::api::{Api, ListParams, WatchEvent, WatchParams};
use kube::{Client, ResourceExt as _};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::context::JobContext;
use crate::vmi::VirtualMachineInstance;

/// Label prefix for every object this executor creates.
pub const LABEL_PREFIX: &str = "io.kubevirt.gitlab-runner";

/// Annotation carrying the JSON run configuration on the virtual machine.
/// This annotation and the id label are the only channels between phases.
pub const RUN_CONFIG_ANNOTATION: &str = "gitlab-runner.kubevirt.io/run-config";

/// A label key under our prefix, e.g. `label("id")`.
pub fn label(name: &str) -> String {
    format!("{LABEL_PREFIX}/{name}")
}

/// Label selector matching exactly this job's virtual machine.
pub fn id_selector(jctx: &JobContext) -> String {
    format!("{LABEL_PREFIX}/id={}", jctx.id)
}

/// Build a cluster client: in-cluster configuration when running inside the
/// cluster, otherwise `KUBECONFIG` or `~/.kube/config`.
pub async fn client() -> Result<Client> {
    Client::try_default()
        .await
        .context("connecting to the cluster")
}

pub fn vmi_api(client: Client, namespace: &str) -> Api<VirtualMachineInstance> {
    Api::namespaced(client, namespace)
}

/// How a job's scripts are to be executed on its machine. Serialized into the
/// [`RUN_CONFIG_ANNOTATION`] at provisioning and read back by later phases.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    pub shell: String,
    pub ssh: SshRunConfig,
}

/// SSH half of the run configuration. `password` is always persisted empty;
/// the real password is only reachable through `secret_ref`.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SshRunConfig {
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub secret_ref: String,
}

/// Read the run configuration annotation off a virtual machine.
pub fn run_config_of(vm: &VirtualMachineInstance) -> Result<RunConfig> {
    let raw = vm
        .annotations()
        .get(RUN_CONFIG_ANNOTATION)
        .ok_or_else(|| eyre!("virtual machine instance carries no run configuration"))?;
    serde_json::from_str(raw).context("unmarshalling run configuration annotation")
}

/// Failure modes when resolving the job's virtual machine from its id label.
#[derive(Debug, thiserror::Error)]
pub enum FindVmError {
    #[error("virtual machine instance disappeared while the job was running")]
    Disappeared,
    #[error("virtual machine instance has ambiguous id: {count} instances found with id {id}")]
    Ambiguous { count: usize, id: String },
    #[error(transparent)]
    Api(#[from] kube::Error),
}

/// Locate the single virtual machine carrying this job's id label.
///
/// Zero matches means the machine is gone (callers decide whether that is
/// fatal); more than one means the uniqueness invariant is broken and nothing
/// may act on either machine.
pub async fn find_job_vm(
    api: &Api<VirtualMachineInstance>,
    jctx: &JobContext,
) -> Result<VirtualMachineInstance, FindVmError> {
    let list = api
        .list(&ListParams::default().labels(&id_selector(jctx)))
        .await?;
    let mut items = list.items;
    if items.len() > 1 {
        return Err(FindVmError::Ambiguous {
            count: items.len(),
            id: jctx.id.clone(),
        });
    }
    items.pop().ok_or(FindVmError::Disappeared)
}

/// Verdict returned by a watch callback.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WatchFlow {
    /// Keep consuming events.
    Continue,
    /// The condition being watched for has been reached.
    Done,
}

pub type VmiEvent = WatchEvent<VirtualMachineInstance>;
type VmiEventStream = BoxStream<'static, kube::Result<VmiEvent>>;

/// Watch the job's virtual machine until `on_event` reports it is done.
///
/// The long poll resumes from the resource version of `initial` (or from the
/// beginning of history when there is none) and reopens transparently when
/// the server closes it. `Error` events are offered to the callback first, so
/// a phase can abandon the watch instead of retrying; if it continues, the
/// resource version is reset and the stream reopened. Cancellation is the
/// caller's business, via `tokio::time::timeout` around this future.
pub async fn watch_job_vm<F>(
    api: &Api<VirtualMachineInstance>,
    jctx: &JobContext,
    initial: Option<&VirtualMachineInstance>,
    on_event: F,
) -> Result<()>
where
    F: FnMut(&VmiEvent) -> Result<WatchFlow>,
{
    let params = WatchParams::default().labels(&id_selector(jctx));
    let resource_version = initial
        .and_then(|vm| vm.metadata.resource_version.clone())
        .unwrap_or_else(|| "0".to_string());
    let api = api.clone();

    watch_with(
        resource_version,
        move |version| {
            let api = api.clone();
            let params = params.clone();
            async move { Ok(api.watch(&params, &version).await?.boxed()) }
        },
        on_event,
    )
    .await
}

/// The reconnect loop, generic over how a stream is opened so the retry
/// policy can be exercised without a cluster.
async fn watch_with<O, Fut, F>(
    mut resource_version: String,
    mut open: O,
    mut on_event: F,
) -> Result<()>
where
    O: FnMut(String) -> Fut,
    Fut: Future<Output = kube::Result<VmiEventStream>>,
    F: FnMut(&VmiEvent) -> Result<WatchFlow>,
{
    'stream: loop {
        let mut events = open(resource_version.clone())
            .await
            .context("watching virtual machine instances")?;

        loop {
            let Some(item) = events.next().await else {
                // The server closed the long poll; resume where we left off.
                continue 'stream;
            };
            match item {
                Ok(WatchEvent::Error(status)) => {
                    warn!(
                        reason = %status.reason,
                        message = %status.message,
                        "error watching virtual machine instance, retrying"
                    );
                    if on_event(&WatchEvent::Error(status))? == WatchFlow::Done {
                        return Ok(());
                    }
                    resource_version = "0".to_string();
                    continue 'stream;
                }
                Ok(WatchEvent::Bookmark(_)) => {}
                Ok(event) => {
                    if let Some(version) = event_vm(&event)
                        .and_then(|vm| vm.metadata.resource_version.clone())
                    {
                        resource_version = version;
                    }
                    if on_event(&event)? == WatchFlow::Done {
                        return Ok(());
                    }
                }
                // A payload the typed client cannot decode is a protocol
                // violation, not a transport hiccup.
                Err(err @ kube::Error::SerdeError(_)) => {
                    return Err(err).context("decoding virtual machine watch event");
                }
                Err(err) => {
                    warn!(error = %err, "virtual machine watch stream broke, reopening");
                    continue 'stream;
                }
            }
        }
    }
}

/// The virtual machine inside an event, when the event carries one.
pub fn event_vm(event: &VmiEvent) -> Option<&VirtualMachineInstance> {
    match event {
        WatchEvent::Added(vm) | WatchEvent::Modified(vm) | WatchEvent::Deleted(vm) => Some(vm),
        WatchEvent::Bookmark(_) | WatchEvent::Error(_) => None,
    }
}
