//! Per-pool configuration files (json).

use anyhow::{bail, Context};
use repro_vm::qemu::QemuConfig;
use serde::Deserialize;
use std::{
    fs::read_to_string,
    path::{Path, PathBuf},
    time::Duration,
};

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Target under test, such as linux/amd64.
    pub target: String,
    /// Root of the tool installation holding the per-target binaries.
    pub syzkaller: PathBuf,
    /// Executor binary uploaded into every guest; defaults to the
    /// syz-executor of the target under the installation root.
    #[serde(default)]
    pub executor_bin: Option<PathBuf>,
    /// Address the coordinator rpc listens on. Port 0 picks a free one.
    #[serde(default = "default_rpc")]
    pub rpc: String,
    /// Executable extension of target binaries.
    #[serde(default)]
    pub exe_extension: String,
    /// How long one guest runs before it is recycled, in seconds.
    #[serde(default = "default_running_time")]
    pub vm_running_time_secs: u64,
    /// Number of guests booted from this config.
    #[serde(default = "default_count")]
    pub count: usize,
    pub qemu: QemuConfig,
}

fn default_rpc() -> String {
    "127.0.0.1:0".to_string()
}

fn default_running_time() -> u64 {
    60 * 60
}

fn default_count() -> usize {
    1
}

impl PoolConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let mut config: PoolConfig = serde_json::from_str(&content)
            .with_context(|| format!("bad config {}", path.display()))?;
        config.qemu.target = config.target.clone();
        config.check()?;
        Ok(config)
    }

    pub fn check(&self) -> anyhow::Result<()> {
        self.target_split()?;
        if self.count == 0 {
            bail!("pool has no vms");
        }
        if self.vm_running_time_secs == 0 {
            bail!("zero vm running time");
        }
        if !self.syzkaller.is_dir() {
            bail!("bad tool root dir: {}", self.syzkaller.display());
        }
        self.qemu.check().context("qemu config error")?;
        Ok(())
    }

    /// (os, arch) of the target.
    pub fn target_split(&self) -> anyhow::Result<(&str, &str)> {
        match self.target.split_once('/') {
            Some((os, arch)) if !os.is_empty() && !arch.is_empty() => Ok((os, arch)),
            _ => bail!("bad target '{}', expected os/arch", self.target),
        }
    }

    fn target_bin_dir(&self) -> anyhow::Result<PathBuf> {
        let (os, arch) = self.target_split()?;
        Ok(self.syzkaller.join("bin").join(format!("{}_{}", os, arch)))
    }

    /// The agent binary copied into every guest.
    pub fn runner_bin(&self) -> anyhow::Result<PathBuf> {
        Ok(self
            .target_bin_dir()?
            .join(format!("repro-runner{}", self.exe_extension)))
    }

    /// The executor binary the agent drives.
    pub fn executor_bin(&self) -> anyhow::Result<PathBuf> {
        match self.executor_bin.as_ref() {
            Some(bin) => Ok(bin.clone()),
            None => Ok(self
                .target_bin_dir()?
                .join(format!("syz-executor{}", self.exe_extension))),
        }
    }

    pub fn vm_running_time(&self) -> Duration {
        Duration::from_secs(self.vm_running_time_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_config() {
        let raw = r#"{
            "target": "linux/amd64",
            "syzkaller": "/syz",
            "count": 2,
            "qemu": {
                "kernel_img": "bzImage",
                "disk_img": "stretch.img",
                "ssh_key": "stretch.id_rsa"
            }
        }"#;
        let config: PoolConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.count, 2);
        assert_eq!(config.rpc, "127.0.0.1:0");
        assert_eq!(config.target_split().unwrap(), ("linux", "amd64"));
        assert_eq!(config.qemu.ssh_user, "root");
        assert_eq!(
            config.runner_bin().unwrap(),
            PathBuf::from("/syz/bin/linux_amd64/repro-runner")
        );
        assert_eq!(config.vm_running_time(), Duration::from_secs(3600));
    }

    #[test]
    fn rejects_bad_targets() {
        let raw = r#"{
            "target": "linux",
            "syzkaller": "/syz",
            "qemu": {"disk_img": "d", "ssh_key": "k"}
        }"#;
        let config: PoolConfig = serde_json::from_str(raw).unwrap();
        assert!(config.target_split().is_err());
    }
}
