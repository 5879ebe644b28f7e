//! The per-job credentials Secret.
//!
//! One Secret per job, named after the job id, holding the SSH user and
//! password plus the cloud-init user-data the guest fetches on first boot.
//! The plaintext password lives here and nowhere else on the cluster.

use std::collections::BTreeMap;

use color_eyre::eyre::{Context as _, Result};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};
use kube::Client;

use crate::cluster::label;
use crate::context::JobContext;

/// Default SSH port on the guest.
const SSH_PORT: u16 = 22;

/// Name of the credentials Secret for a job id.
pub fn secret_name(id: &str) -> String {
    format!("vm-creds-{id}")
}

pub fn secret_api(client: Client, namespace: &str) -> Api<Secret> {
    Api::namespaced(client, namespace)
}

/// SSH login material read back from a credentials Secret.
#[derive(Clone, Debug)]
pub struct SshCredentials {
    pub user: String,
    pub password: String,
    pub port: u16,
}

fn build_credentials_secret(
    jctx: &JobContext,
    user: &str,
    password: &str,
    user_data: &str,
) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(secret_name(&jctx.id)),
            namespace: Some(jctx.namespace.clone()),
            labels: Some(BTreeMap::from([
                (label("id"), jctx.id.clone()),
                (label("type"), "vm-credentials".to_string()),
            ])),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        string_data: Some(BTreeMap::from([
            ("user".to_string(), user.to_string()),
            ("password".to_string(), password.to_string()),
            ("userdata".to_string(), user_data.to_string()),
        ])),
        ..Default::default()
    }
}

/// Create the credentials Secret for a job.
pub async fn create_credentials_secret(
    api: &Api<Secret>,
    jctx: &JobContext,
    user: &str,
    password: &str,
    user_data: &str,
) -> Result<Secret> {
    let secret = build_credentials_secret(jctx, user, password, user_data);
    api.create(&PostParams::default(), &secret)
        .await
        .context("creating credentials secret")
}

/// Fetch the SSH credentials a VM was provisioned with.
pub async fn get_ssh_credentials(api: &Api<Secret>, name: &str) -> Result<SshCredentials> {
    let secret = api
        .get(name)
        .await
        .with_context(|| format!("getting credentials secret {name}"))?;
    Ok(SshCredentials {
        user: string_field(&secret, "user"),
        password: string_field(&secret, "password"),
        port: SSH_PORT,
    })
}

/// Delete the credentials Secret. A missing Secret is success: cleanup, gc
/// and the prepare rollback all race for the same object.
pub async fn delete_credentials_secret(api: &Api<Secret>, name: &str) -> Result<()> {
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(err) if is_not_found(&err) => Ok(()),
        Err(err) => Err(err).with_context(|| format!("deleting credentials secret {name}")),
    }
}

/// Whether a cluster error is a plain 404.
fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}

fn string_field(secret: &Secret, key: &str) -> String {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|value| String::from_utf8_lossy(&value.0).into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn job_context() -> JobContext {
        JobContext {
            id: "abc123".into(),
            namespace: "gitlab-runner".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_secret_shape() {
        let secret = build_credentials_secret(&job_context(), "runner", "hunter2", "#cloud-config");
        assert_eq!(secret.metadata.name.as_deref(), Some("vm-creds-abc123"));
        let labels = secret.metadata.labels.as_ref().unwrap();
        assert_eq!(labels["io.kubevirt.gitlab-runner/id"], "abc123");
        assert_eq!(labels["io.kubevirt.gitlab-runner/type"], "vm-credentials");
        assert_eq!(secret.type_.as_deref(), Some("Opaque"));
        let data = secret.string_data.as_ref().unwrap();
        assert_eq!(data["user"], "runner");
        assert_eq!(data["password"], "hunter2");
        assert_eq!(data["userdata"], "#cloud-config");
    }

    #[test]
    fn test_not_found_is_swallowed() {
        let not_found = kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: "secrets \"vm-creds-x\" not found".into(),
            reason: "NotFound".into(),
            code: 404,
        });
        assert!(is_not_found(&not_found));

        let forbidden = kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: "forbidden".into(),
            reason: "Forbidden".into(),
            code: 403,
        });
        assert!(!is_not_found(&forbidden));
    }

    #[test]
    fn test_string_field_reads_decoded_data() {
        let mut secret = Secret::default();
        assert_eq!(string_field(&secret, "user"), "");
        secret.data = Some(BTreeMap::from([(
            "user".to_string(),
            k8s_openapi::ByteString(b"runner".to_vec()),
        )]));
        assert_eq!(string_field(&secret, "user"), "runner");
    }
}
