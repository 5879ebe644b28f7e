//! SSH transport to the guest.
//!
//! Wraps the system `ssh` client through `sshpass`, which reads the password
//! from the `SSHPASS` environment variable so it never appears on a command
//! line or in a log. Host keys are not checked: every machine is freshly
//! booted, single-use, and addressed by cluster-internal IP.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use color_eyre::eyre::{bail, Context as _, Result};
use tokio::io::AsyncWriteExt as _;
use tokio::process::Command;
use tracing::debug;

use crate::secrets::SshCredentials;

/// Delay between connection attempts while waiting for the guest.
const RETRY_DELAY: Duration = Duration::from_secs(2);

/// The ssh client reserves 255 for its own failures; every other status is
/// the remote command's.
pub const TRANSPORT_FAILURE_STATUS: i32 = 255;

fn ssh_command(ip: &str, credentials: &SshCredentials, connect_timeout: Duration) -> Command {
    let mut cmd = Command::new("sshpass");
    cmd.arg("-e")
        .arg("ssh")
        .arg("-o")
        .arg("StrictHostKeyChecking=no")
        .arg("-o")
        .arg("UserKnownHostsFile=/dev/null")
        .arg("-o")
        .arg("LogLevel=ERROR")
        .arg("-o")
        .arg(format!(
            "ConnectTimeout={}",
            connect_timeout.as_secs().max(1)
        ))
        .arg("-p")
        .arg(credentials.port.to_string())
        .arg(format!("{}@{}", credentials.user, ip))
        .env("SSHPASS", &credentials.password);
    cmd
}

/// Dial the guest until it accepts a session.
///
/// Each attempt is bounded by `dial_timeout`; the loop itself runs until the
/// ambient deadline the caller wrapped around this future cancels it.
pub async fn dial(ip: &str, credentials: &SshCredentials, dial_timeout: Duration) -> Result<()> {
    loop {
        let mut cmd = ssh_command(ip, credentials, dial_timeout);
        cmd.arg("true")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let status = cmd.status().await.context("spawning ssh client")?;
        if status.success() {
            return Ok(());
        }
        debug!(%ip, %status, "guest not reachable yet");
        tokio::time::sleep(RETRY_DELAY).await;
    }
}

/// Remote interpreter for each supported job shell. The script is streamed
/// over stdin rather than passed as an argument, so it never hits a command
/// line on either side.
fn shell_invocation(shell: &str) -> Result<&'static [&'static str]> {
    match shell {
        "bash" => Ok(&["bash", "-s"]),
        "pwsh" => Ok(&["pwsh", "-NoProfile", "-NonInteractive", "-Command", "-"]),
        other => bail!("unsupported shell: {other} (expected 'bash' or 'pwsh')"),
    }
}

/// Stream a stage script to the guest shell, with stdout and stderr flowing
/// through to the runner. Returns the ssh client's exit status code, or
/// `None` when it was killed by a signal.
pub async fn exec_script(
    ip: &str,
    credentials: &SshCredentials,
    shell: &str,
    script: &Path,
    connect_timeout: Duration,
) -> Result<Option<i32>> {
    let body = tokio::fs::read(script)
        .await
        .with_context(|| format!("reading job script {}", script.display()))?;

    let mut cmd = ssh_command(ip, credentials, connect_timeout);
    cmd.args(shell_invocation(shell)?)
        .stdin(Stdio::piped())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    let mut child = cmd.spawn().context("spawning ssh client")?;
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| color_eyre::eyre::eyre!("ssh client has no stdin"))?;
    stdin
        .write_all(&body)
        .await
        .context("streaming job script to the guest")?;
    drop(stdin);

    let status = child.wait().await.context("waiting for ssh client")?;
    Ok(status.code())
}
