use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::constants::{SSH_KNOWN_HOSTS_FILE_NAME, SSH_USER_PRIVATE_KEY_FILE_NAME, VM_USER};

/// Probes the guest's sshd with a short non-interactive connection attempt.
///
/// The probe runs `true` over ssh in batch mode with password auth disabled;
/// it is read-only and side-effect-free on the guest. Success means the
/// child exited 0 within the per-attempt budget.
#[derive(Debug)]
pub struct SshProber {
    program: String,
    key_path: PathBuf,
    known_hosts_path: PathBuf,
    username: String,
}

impl SshProber {
    pub fn new(working_dir: &Path) -> Self {
        Self {
            program: "ssh".to_string(),
            key_path: working_dir.join(SSH_USER_PRIVATE_KEY_FILE_NAME),
            known_hosts_path: working_dir.join(SSH_KNOWN_HOSTS_FILE_NAME),
            username: VM_USER.to_string(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_program(mut self, program: &str) -> Self {
        self.program = program.to_string();
        self
    }

    fn command_args(&self, ip: &str, timeout: Duration) -> Vec<String> {
        vec![
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            "LogLevel=ERROR".into(),
            "-o".into(),
            "PasswordAuthentication=no".into(),
            "-o".into(),
            "StrictHostKeyChecking=accept-new".into(),
            "-o".into(),
            format!("UserKnownHostsFile={}", self.known_hosts_path.display()),
            "-o".into(),
            format!("ConnectTimeout={}", timeout.as_secs().max(1)),
            "-p".into(),
            "22".into(),
            "-i".into(),
            self.key_path.display().to_string(),
            format!("{}@{ip}", self.username),
            "true".into(),
        ]
    }

    /// Attempt one probe. Kills the child if it outlives the budget.
    pub async fn probe(&self, ip: &str, timeout: Duration) -> bool {
        if !self.key_path.exists() {
            debug!(path = %self.key_path.display(), "SSH key not found, skipping probe");
            return false;
        }

        let mut child = match Command::new(&self.program)
            .args(self.command_args(ip, timeout))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                debug!(error = %e, "failed to spawn SSH probe");
                return false;
            }
        };

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                let success = status.success();
                debug!(ip = %ip, success, "SSH probe finished");
                success
            }
            Ok(Err(e)) => {
                debug!(ip = %ip, error = %e, "SSH probe wait failed");
                false
            }
            Err(_) => {
                debug!(ip = %ip, timeout_secs = timeout.as_secs(), "SSH probe timed out, killing");
                let _ = child.kill().await;
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_args_fixed_options() {
        let dir = tempfile::tempdir().unwrap();
        let prober = SshProber::new(dir.path());
        let args = prober.command_args("192.168.64.7", Duration::from_secs(10));

        let joined = args.join(" ");
        assert!(joined.contains("-o BatchMode=yes"));
        assert!(joined.contains("-o PasswordAuthentication=no"));
        assert!(joined.contains("-o StrictHostKeyChecking=accept-new"));
        assert!(joined.contains("-o ConnectTimeout=10"));
        assert!(joined.contains(&format!(
            "UserKnownHostsFile={}",
            dir.path().join(SSH_KNOWN_HOSTS_FILE_NAME).display()
        )));
        assert!(joined.contains("-p 22"));
        assert_eq!(args.last().map(String::as_str), Some("true"));
        assert!(
            args.iter().any(|a| a == "builder@192.168.64.7"),
            "probe must target the builder account: {joined}"
        );
    }

    #[tokio::test]
    async fn test_probe_without_key_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let prober = SshProber::new(dir.path());
        assert!(!prober.probe("192.168.64.7", Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_probe_reports_child_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SSH_USER_PRIVATE_KEY_FILE_NAME), b"key").unwrap();

        // `true` ignores the ssh argument vector and exits 0; `false` exits 1.
        let ok = SshProber::new(dir.path()).with_program("true");
        assert!(ok.probe("192.168.64.7", Duration::from_secs(5)).await);

        let fail = SshProber::new(dir.path()).with_program("false");
        assert!(!fail.probe("192.168.64.7", Duration::from_secs(5)).await);
    }
}
