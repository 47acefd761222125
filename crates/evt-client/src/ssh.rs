//! SSH bootstrap: credential acquisition for a new session.
//!
//! Shells out to the system `ssh` to run the server-side terminal launcher,
//! which registers a session and prints an `id/passkey` line on stdout. The
//! heavy lifting (authentication, known hosts, proxying) stays with ssh
//! itself; this module only builds the remote command and parses the reply.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info};

use evt_core::error::{Error, Result};
use evt_core::SessionCredentials;

/// How long to wait for ssh to produce the credential line.
const SETUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Remote launcher binary registered on the server host.
const LAUNCHER: &str = "etterminal";

/// Parameters for the remote launcher invocation.
#[derive(Debug, Clone, Default)]
pub struct SshSetup {
    pub user: String,
    pub host: String,
    /// Prefix prepended to the launcher command (e.g. a wrapper script).
    pub prefix: String,
    /// Kill the user's existing sessions before registering a new one.
    pub kill_other_sessions: bool,
    pub verbose: u8,
    /// Disable the launcher's 1024-lines/s output throttle.
    pub noratelimit: bool,
}

impl SshSetup {
    /// The command executed on the remote host.
    fn remote_command(&self) -> String {
        let mut cmd = String::new();
        if !self.prefix.is_empty() {
            cmd.push_str(&self.prefix);
            if !self.prefix.ends_with(' ') {
                cmd.push(' ');
            }
        }
        cmd.push_str(LAUNCHER);
        if self.kill_other_sessions {
            cmd.push_str(" --kill-other-sessions");
        }
        if self.verbose > 0 {
            cmd.push_str(&format!(" --verbose {}", self.verbose));
        }
        if self.noratelimit {
            cmd.push_str(" --noratelimit");
        }
        cmd
    }
}

/// Register a session on the remote host and return its credentials.
pub async fn setup_session(setup: &SshSetup) -> Result<SessionCredentials> {
    let target = format!("{}@{}", setup.user, setup.host);
    let remote_command = setup.remote_command();
    info!(target = %target, command = %remote_command, "registering session over ssh");

    let child = Command::new("ssh")
        .arg(&target)
        .arg(&remote_command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::Transport {
            message: format!("failed to spawn ssh: {e}"),
        })?;

    let output = tokio::time::timeout(SETUP_TIMEOUT, child.wait_with_output())
        .await
        .map_err(|_| Error::Timeout)?
        .map_err(|e| Error::Transport {
            message: format!("ssh failed: {e}"),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Transport {
            message: format!(
                "ssh setup to {target} exited with {}: {}",
                output.status,
                stderr.trim()
            ),
        });
    }

    parse_setup_output(&String::from_utf8_lossy(&output.stdout))
}

/// Pick the credential line out of the launcher's stdout.
///
/// The launcher prints exactly one `id/passkey` line, but login scripts may
/// emit noise around it; the last line containing a `/` wins.
fn parse_setup_output(stdout: &str) -> Result<SessionCredentials> {
    let line = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty() && l.contains('/'))
        .ok_or_else(|| Error::config(format!("invalid id/passkey response: {stdout:?}")))?;

    debug!("parsed credential line from launcher");
    SessionCredentials::parse(line)
}
