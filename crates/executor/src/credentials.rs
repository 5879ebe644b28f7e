//! Per-VM login material: random passwords and first-boot guest configuration.
//!
//! Each job gets a throwaway password that exists in exactly two places: the
//! credentials Secret, and (hashed, for Linux guests) the guest's own shadow
//! database. It never appears in the VM spec, labels, annotations or logs.

use color_eyre::eyre::{bail, Context as _, Result};
use rand::distr::Alphanumeric;
use rand::Rng as _;

/// Minimum password length; shorter requests are raised to this.
const MIN_PASSWORD_LENGTH: usize = 32;

/// Generate a random alphanumeric password of at least [`MIN_PASSWORD_LENGTH`]
/// characters. The thread RNG is reseeded from the operating system, so the
/// result is suitable as a one-shot VM credential.
pub fn generate_password(length: usize) -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(length.max(MIN_PASSWORD_LENGTH))
        .map(char::from)
        .collect()
}

/// Hash a password for the cloud-init `passwd` field.
fn hash_password(password: &str) -> Result<String> {
    bcrypt::hash(password, bcrypt::DEFAULT_COST).context("hashing VM password")
}

/// Build the first-boot user-data document for the guest, keyed on the job's
/// shell.
///
/// `bash` selects a Linux cloud-init document carrying only a bcrypt hash of
/// the password. `pwsh` selects a Cloudbase-Init document for Windows guests;
/// Cloudbase-Init only accepts plaintext passwords, so protection of that
/// document relies on Secret RBAC and TLS to the API server.
pub fn generate_user_data(shell: &str, user: &str, password: &str) -> Result<String> {
    match shell {
        "bash" => linux_user_data(user, password),
        "pwsh" => Ok(windows_user_data(user, password)),
        other => bail!("unsupported shell: {other} (expected 'bash' or 'pwsh')"),
    }
}

fn linux_user_data(user: &str, password: &str) -> Result<String> {
    let hashed = hash_password(password)?;
    Ok(format!(
        "#cloud-config
users:
  - name: {user}
    lock_passwd: false
    passwd: {hashed}
    sudo: ALL=(ALL) NOPASSWD:ALL
    shell: /bin/bash
ssh_pwauth: true
chpasswd:
  expire: false
"
    ))
}

fn windows_user_data(user: &str, password: &str) -> String {
    format!(
        "#cloud-config
users:
  - name: {user}
    passwd: {password}
    groups: Administrators
"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_length_and_charset() {
        for (requested, want) in [(0, 32), (16, 32), (32, 32), (64, 64)] {
            let password = generate_password(requested);
            assert_eq!(password.len(), want, "requested {requested}");
            assert!(
                password.chars().all(|c| c.is_ascii_alphanumeric()),
                "unexpected character in {password:?}"
            );
        }
    }

    #[test]
    fn test_passwords_are_not_repeated() {
        assert_ne!(generate_password(0), generate_password(0));
    }

    #[test]
    fn test_hash_password_roundtrips() {
        let hashed = hash_password("testpassword123").unwrap();
        assert!(hashed.starts_with("$2"), "not a bcrypt hash: {hashed}");
        assert!(bcrypt::verify("testpassword123", &hashed).unwrap());
    }

    #[test]
    fn test_linux_user_data() {
        let userdata = generate_user_data("bash", "testuser", "testpassword123").unwrap();
        assert!(userdata.starts_with("#cloud-config"));
        assert!(userdata.contains("name: testuser"));
        assert!(userdata.contains("sudo: ALL=(ALL) NOPASSWD:ALL"));
        assert!(userdata.contains("shell: /bin/bash"));
        assert!(userdata.contains("ssh_pwauth: true"));
        assert!(userdata.contains("chpasswd:"));
        // The password only ever appears hashed.
        assert!(!userdata.contains("testpassword123"));
        assert!(userdata.contains("passwd: $2"));
        assert!(!userdata.contains("Administrators"));
    }

    #[test]
    fn test_windows_user_data() {
        let userdata = generate_user_data("pwsh", "testuser", "testpassword123").unwrap();
        assert!(userdata.starts_with("#cloud-config"));
        assert!(userdata.contains("name: testuser"));
        assert!(userdata.contains("passwd: testpassword123"));
        assert!(userdata.contains("groups: Administrators"));
        assert!(!userdata.contains("sudo:"));
        assert!(!userdata.contains("/bin/bash"));
        assert!(!userdata.contains("ssh_pwauth"));
        assert!(!userdata.contains("chpasswd:"));
        assert!(!userdata.contains("$2"));
    }

    #[test]
    fn test_unsupported_shell() {
        let err = generate_user_data("sh", "testuser", "pw").unwrap_err();
        assert!(
            err.to_string().contains("unsupported shell"),
            "unexpected message: {err}"
        );
    }
}
