//! ssh/scp command plumbing for guests booted with a forwarded ssh port.

use std::{
    path::Path,
    process::{Command, Stdio},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SshError {
    #[error("spawn: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("{cmd} failed: {output}")]
    Failed { cmd: String, output: String },
}

const SSH_OPTIONS: [&str; 10] = [
    "-o",
    "BatchMode=yes",
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
    "-o",
    "IdentitiesOnly=yes",
    "-o",
    "ConnectTimeout=10",
];

/// Base ssh command for the guest; callers append the remote command line.
pub fn ssh_basic_cmd(ip: &str, port: u16, key: &str, user: &str) -> Command {
    let mut ssh = Command::new("ssh");
    ssh.args(SSH_OPTIONS)
        .arg("-p")
        .arg(port.to_string())
        .arg("-i")
        .arg(key)
        .arg(format!("{}@{}", user, ip));
    ssh
}

/// Copy a local file into the guest.
pub fn scp(
    ip: &str,
    port: u16,
    key: &str,
    user: &str,
    from: &Path,
    to: &Path,
) -> Result<(), SshError> {
    let mut scp = Command::new("scp");
    scp.args(SSH_OPTIONS)
        .arg("-P")
        .arg(port.to_string())
        .arg("-i")
        .arg(key)
        .arg(from)
        .arg(format!("{}@{}:{}", user, ip, to.display()))
        .stdin(Stdio::null());
    let output = scp.output()?;
    if output.status.success() {
        Ok(())
    } else {
        Err(SshError::Failed {
            cmd: format!("{:?}", scp),
            output: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
