//! The KubeVirt `VirtualMachineInstance` resource and per-job VM composition.
//!
//! Only the slice of the KubeVirt v1 API this executor actually reads and
//! writes is modeled; the declarations are wire-compatible with the real
//! resource, and everything else passes through the API server untouched.

use std::collections::BTreeMap;

use color_eyre::eyre::{bail, Context as _, Result};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::cluster::{self, RunConfig};
use crate::context::JobContext;

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "kubevirt.io",
    version = "v1",
    kind = "VirtualMachineInstance",
    namespaced,
    status = "VirtualMachineInstanceStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstanceSpec {
    pub domain: DomainSpec,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DomainSpec {
    pub resources: ResourceRequirements,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine: Option<Machine>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<Cpu>,
    pub devices: Devices,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clock: Option<Clock>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct ResourceRequirements {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, Quantity>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, Quantity>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct Machine {
    #[serde(rename = "type")]
    pub machine_type: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct Cpu {
    pub model: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct Devices {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<Disk>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct Disk {
    pub name: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct Clock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timer: Option<Timer>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct Timer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hyperv: Option<HypervTimer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtc: Option<RtcTimer>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct HypervTimer {}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RtcTimer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tick_policy: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_disk: Option<ContainerDiskSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_init_no_cloud: Option<CloudInitNoCloudSource>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerDiskSource {
    pub image: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_pull_policy: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_pull_secret: String,
}

/// Cloud-init NoCloud data source. The user-data is always referenced through
/// a Secret, never inlined into the VM spec.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CloudInitNoCloudSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data_secret_ref: Option<LocalObjectReference>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct LocalObjectReference {
    pub name: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstanceStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub phase: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<VmiInterface>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<VmiCondition>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VmiInterface {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip_address: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct VmiCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
}

impl VirtualMachineInstance {
    /// The guest's first reported interface address, once it has one.
    pub fn ip_address(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|status| status.interfaces.first())
            .map(|interface| interface.ip_address.as_str())
            .filter(|ip| !ip.is_empty())
    }

    /// Whether the cluster reports the `Ready` condition as true.
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .map(|status| {
                status
                    .conditions
                    .iter()
                    .any(|cond| cond.condition_type == "Ready" && cond.status == "True")
            })
            .unwrap_or(false)
    }

    /// Reachability gate for *prepare*: an address plus the Ready condition.
    pub fn is_reachable(&self) -> bool {
        self.ip_address().is_some() && self.is_ready()
    }

    pub fn phase(&self) -> &str {
        self.status
            .as_ref()
            .map(|status| status.phase.as_str())
            .unwrap_or_default()
    }
}

/// Compose the virtual machine object for a job.
///
/// Pure assembly: quantity validation and RunConfig serialization happen here,
/// before any cluster I/O, so a bad flag can never leave a half-provisioned
/// job behind.
pub fn build_job_vm(
    jctx: &JobContext,
    run_config: &RunConfig,
    secret_name: &str,
) -> Result<VirtualMachineInstance> {
    let mut resources = ResourceRequirements::default();
    let entries = [
        (&jctx.cpu_request, "cpu", true),
        (&jctx.cpu_limit, "cpu", false),
        (&jctx.memory_request, "memory", true),
        (&jctx.memory_limit, "memory", false),
        (&jctx.ephemeral_storage_request, "ephemeral-storage", true),
        (&jctx.ephemeral_storage_limit, "ephemeral-storage", false),
    ];
    for (value, key, is_request) in entries {
        if value.is_empty() {
            continue;
        }
        validate_quantity(value).wrap_err_with(|| format!("parsing {key} quantity"))?;
        let list = if is_request {
            &mut resources.requests
        } else {
            &mut resources.limits
        };
        list.insert(key.to_string(), Quantity(value.clone()));
    }

    if jctx.image.is_empty() {
        bail!("must specify a containerdisk image");
    }

    let run_config_json =
        serde_json::to_string(run_config).context("marshalling run configuration")?;

    let mut domain = DomainSpec {
        resources,
        machine: (!jctx.machine_type.is_empty()).then(|| Machine {
            machine_type: jctx.machine_type.clone(),
        }),
        cpu: None,
        devices: Devices {
            disks: vec![
                Disk {
                    name: "root".into(),
                },
                Disk {
                    name: "cloudinit".into(),
                },
            ],
        },
        clock: Some(Clock {
            timezone: Some(jctx.timezone.clone()),
            timer: Some(Timer {
                hyperv: Some(HypervTimer {}),
                rtc: Some(RtcTimer {
                    tick_policy: Some("catchup".into()),
                }),
            }),
        }),
    };

    // The image decides the actual guest architecture; all we can express on
    // this API version is the CPU model.
    if !jctx.architecture.is_empty() {
        domain.cpu = Some(Cpu {
            model: "host-passthrough".into(),
        });
    }

    let labels = BTreeMap::from([
        (cluster::label("id"), jctx.id.clone()),
        (cluster::label("created-at"), jctx.created_at.clone()),
        (cluster::label("ttl"), jctx.ttl.clone()),
    ]);

    // The project/job annotations are the ones the Kubernetes executor sets;
    // carrying them keeps external tooling working against our VMs too.
    let annotations = BTreeMap::from([
        ("project.runner.gitlab.com/id".to_string(), jctx.project_id.clone()),
        ("job.runner.gitlab.com/id".to_string(), jctx.job_id.clone()),
        ("job.runner.gitlab.com/name".to_string(), jctx.job_name.clone()),
        ("job.runner.gitlab.com/ref".to_string(), jctx.job_ref.clone()),
        ("job.runner.gitlab.com/sha".to_string(), jctx.job_sha.clone()),
        (
            "job.runner.gitlab.com/before-sha".to_string(),
            jctx.job_before_sha.clone(),
        ),
        ("job.runner.gitlab.com/url".to_string(), jctx.job_url.clone()),
        (cluster::RUN_CONFIG_ANNOTATION.to_string(), run_config_json),
    ]);

    let spec = VirtualMachineInstanceSpec {
        domain,
        volumes: vec![
            Volume {
                name: "root".into(),
                container_disk: Some(ContainerDiskSource {
                    image: jctx.image.clone(),
                    image_pull_policy: jctx.image_pull_policy.clone(),
                    image_pull_secret: jctx.image_pull_secret.clone(),
                }),
                cloud_init_no_cloud: None,
            },
            Volume {
                name: "cloudinit".into(),
                container_disk: None,
                cloud_init_no_cloud: Some(CloudInitNoCloudSource {
                    user_data_secret_ref: Some(LocalObjectReference {
                        name: secret_name.to_string(),
                    }),
                }),
            },
        ],
    };

    let mut vm = VirtualMachineInstance::new("", spec);
    vm.metadata = ObjectMeta {
        generate_name: Some(jctx.base_name.clone()),
        labels: Some(labels),
        annotations: Some(annotations),
        ..Default::default()
    };
    Ok(vm)
}

/// Compose and create the job's VM, surfacing the API error untouched.
pub async fn create_job_vm(
    api: &Api<VirtualMachineInstance>,
    jctx: &JobContext,
    run_config: &RunConfig,
    secret_name: &str,
) -> Result<VirtualMachineInstance> {
    let vm = build_job_vm(jctx, run_config, secret_name)?;
    api.create(&PostParams::default(), &vm)
        .await
        .context("creating virtual machine instance")
}

/// Validate a string against the Kubernetes quantity grammar: a decimal
/// number with an optional binary (Ki..Ei), decimal (k..E) or milli suffix,
/// or plain scientific notation.
fn validate_quantity(value: &str) -> Result<()> {
    const SUFFIXES: [&str; 13] = [
        "Ki", "Mi", "Gi", "Ti", "Pi", "Ei", "m", "k", "M", "G", "T", "P", "E",
    ];

    let number = SUFFIXES
        .iter()
        .find_map(|suffix| value.strip_suffix(suffix))
        .unwrap_or(value);

    let parsed: f64 = number
        .parse()
        .map_err(|_| color_eyre::eyre::eyre!("invalid quantity {value:?}"))?;
    if !parsed.is_finite() {
        bail!("invalid quantity {value:?}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::SshRunConfig;

    fn job_context() -> JobContext {
        JobContext {
            id: "abc123".into(),
            base_name: "runner-r1-project-p7-concurrent-0".into(),
            namespace: "gitlab-runner".into(),
            image: "registry/runner:1".into(),
            cpu_request: "1".into(),
            memory_limit: "2Gi".into(),
            timezone: "Etc/UTC".into(),
            created_at: "2026-08-02T10:00:00Z".into(),
            ttl: "3h".into(),
            project_id: "p7".into(),
            job_id: "42".into(),
            ..Default::default()
        }
    }

    fn run_config() -> RunConfig {
        RunConfig {
            shell: "bash".into(),
            ssh: SshRunConfig {
                user: "runner".into(),
                password: String::new(),
                secret_ref: "vm-creds-abc123".into(),
            },
        }
    }

    #[test]
    fn test_build_vm_metadata() {
        let vm = build_job_vm(&job_context(), &run_config(), "vm-creds-abc123").unwrap();
        assert_eq!(
            vm.metadata.generate_name.as_deref(),
            Some("runner-r1-project-p7-concurrent-0")
        );
        let labels = vm.metadata.labels.as_ref().unwrap();
        assert_eq!(labels["io.kubevirt.gitlab-runner/id"], "abc123");
        assert_eq!(
            labels["io.kubevirt.gitlab-runner/created-at"],
            "2026-08-02T10:00:00Z"
        );
        assert_eq!(labels["io.kubevirt.gitlab-runner/ttl"], "3h");
        let annotations = vm.metadata.annotations.as_ref().unwrap();
        assert_eq!(annotations["project.runner.gitlab.com/id"], "p7");
        assert_eq!(annotations["job.runner.gitlab.com/id"], "42");
    }

    #[test]
    fn test_build_vm_volumes_reference_secret() {
        let vm = build_job_vm(&job_context(), &run_config(), "vm-creds-abc123").unwrap();
        let volumes = &vm.spec.volumes;
        assert_eq!(volumes.len(), 2);
        assert_eq!(volumes[0].name, "root");
        assert_eq!(
            volumes[0].container_disk.as_ref().unwrap().image,
            "registry/runner:1"
        );
        assert_eq!(volumes[1].name, "cloudinit");
        let secret_ref = volumes[1]
            .cloud_init_no_cloud
            .as_ref()
            .unwrap()
            .user_data_secret_ref
            .as_ref()
            .unwrap();
        assert_eq!(secret_ref.name, "vm-creds-abc123");
    }

    #[test]
    fn test_build_vm_run_config_annotation_has_no_password() {
        let mut rc = run_config();
        rc.ssh.password = String::new();
        let vm = build_job_vm(&job_context(), &rc, "vm-creds-abc123").unwrap();
        let annotations = vm.metadata.annotations.as_ref().unwrap();
        let raw = &annotations[crate::cluster::RUN_CONFIG_ANNOTATION];
        let parsed: RunConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.shell, "bash");
        assert_eq!(parsed.ssh.user, "runner");
        assert_eq!(parsed.ssh.secret_ref, "vm-creds-abc123");
        assert!(parsed.ssh.password.is_empty());
        assert!(raw.contains("secretRef"));
    }

    #[test]
    fn test_build_vm_resources() {
        let vm = build_job_vm(&job_context(), &run_config(), "s").unwrap();
        let resources = &vm.spec.domain.resources;
        assert_eq!(resources.requests["cpu"].0, "1");
        assert_eq!(resources.limits["memory"].0, "2Gi");
        // Empty quantities are omitted, not zeroed.
        assert!(!resources.requests.contains_key("memory"));
        assert!(!resources.limits.contains_key("cpu"));
        assert!(!resources.requests.contains_key("ephemeral-storage"));
    }

    #[test]
    fn test_build_vm_rejects_bad_quantity() {
        let mut jctx = job_context();
        jctx.memory_limit = "lots".into();
        let err = build_job_vm(&jctx, &run_config(), "s").unwrap_err();
        assert!(err.to_string().contains("memory"), "{err}");
    }

    #[test]
    fn test_build_vm_requires_image() {
        let mut jctx = job_context();
        jctx.image = String::new();
        let err = build_job_vm(&jctx, &run_config(), "s").unwrap_err();
        assert!(err.to_string().contains("containerdisk image"), "{err}");
    }

    #[test]
    fn test_build_vm_architecture_sets_cpu_model() {
        let mut jctx = job_context();
        assert!(build_job_vm(&jctx, &run_config(), "s")
            .unwrap()
            .spec
            .domain
            .cpu
            .is_none());
        jctx.architecture = "aarch64".into();
        let vm = build_job_vm(&jctx, &run_config(), "s").unwrap();
        assert_eq!(vm.spec.domain.cpu.unwrap().model, "host-passthrough");
    }

    #[test]
    fn test_build_vm_clock() {
        let vm = build_job_vm(&job_context(), &run_config(), "s").unwrap();
        let clock = vm.spec.domain.clock.unwrap();
        assert_eq!(clock.timezone.as_deref(), Some("Etc/UTC"));
        let timer = clock.timer.unwrap();
        assert!(timer.hyperv.is_some());
        assert_eq!(timer.rtc.unwrap().tick_policy.as_deref(), Some("catchup"));
    }

    #[test]
    fn test_validate_quantity() {
        for ok in ["1", "2.5", "500m", "1Gi", "10e3", "-1", "128974848"] {
            assert!(validate_quantity(ok).is_ok(), "{ok} should parse");
        }
        for bad in ["lots", "1Qi", "Gi", " 1", "inf", "nan"] {
            assert!(validate_quantity(bad).is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn test_status_accessors() {
        let mut vm = VirtualMachineInstance::new("vm", VirtualMachineInstanceSpec::default());
        assert!(vm.ip_address().is_none());
        assert!(!vm.is_reachable());

        vm.status = Some(VirtualMachineInstanceStatus {
            interfaces: vec![VmiInterface {
                ip_address: "10.0.0.5".into(),
            }],
            conditions: vec![VmiCondition {
                condition_type: "Ready".into(),
                status: "False".into(),
            }],
            ..Default::default()
        });
        assert_eq!(vm.ip_address(), Some("10.0.0.5"));
        assert!(!vm.is_reachable());

        vm.status.as_mut().unwrap().conditions[0].status = "True".into();
        assert!(vm.is_reachable());
    }
}
