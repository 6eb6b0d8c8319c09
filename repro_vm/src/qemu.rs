//! Boot and manage a single qemu guest.

use crate::io::{capture, OutputHandle};
use crate::ssh;
use serde::Deserialize;
use std::{
    net::{Ipv4Addr, TcpListener},
    path::PathBuf,
    process::{Child, Command, Stdio},
    thread::sleep,
    time::{Duration, Instant},
};
use thiserror::Error;

/// Address of the host as seen from inside a user-mode-networking guest.
pub const GUEST_HOST_IP: &str = "10.0.2.2";

const SSH_IP: &str = "127.0.0.1";
const BOOT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Configuration of one qemu guest, embedded in the per-pool config file.
#[derive(Debug, Clone, Deserialize)]
pub struct QemuConfig {
    /// Boot target, such as linux/amd64. Filled in from the pool config.
    #[serde(default)]
    pub target: String,
    /// Path to the kernel image, booted directly when present.
    #[serde(default)]
    pub kernel_img: Option<String>,
    /// Path to the disk image.
    pub disk_img: String,
    /// Path to the ssh secret key for the os under test.
    pub ssh_key: String,
    /// Username inside the os under test.
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    #[serde(default = "default_smp")]
    pub smp: u32,
    /// Memory size in megabytes.
    #[serde(default = "default_mem")]
    pub mem: u32,
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_smp() -> u32 {
    2
}

fn default_mem() -> u32 {
    4096
}

#[derive(Debug, Error)]
pub enum QemuConfigError {
    #[error("unsupported target: {0}")]
    UnsupportedTarget(String),
    #[error("invalid image path: {0}")]
    InvalidPath(String),
    #[error("empty ssh username")]
    EmptySshUser,
    #[error("invalid smp '{0}', should be in [1, 1024]")]
    InvalidCpuNumber(u32),
    #[error("invalid memory size '{0}'M, should be in [128, 1048576]")]
    InvalidMemSize(u32),
}

impl QemuConfig {
    pub fn check(&self) -> Result<(), QemuConfigError> {
        if arch_conf(&self.target).is_none() {
            return Err(QemuConfigError::UnsupportedTarget(self.target.clone()));
        }
        if !PathBuf::from(&self.disk_img).is_file() {
            return Err(QemuConfigError::InvalidPath(self.disk_img.clone()));
        }
        if let Some(kernel_img) = self.kernel_img.as_ref() {
            if !PathBuf::from(kernel_img).is_file() {
                return Err(QemuConfigError::InvalidPath(kernel_img.clone()));
            }
        }
        if !PathBuf::from(&self.ssh_key).is_file() {
            return Err(QemuConfigError::InvalidPath(self.ssh_key.clone()));
        }
        if self.ssh_user.is_empty() {
            return Err(QemuConfigError::EmptySshUser);
        }
        if self.smp == 0 || self.smp > 1024 {
            return Err(QemuConfigError::InvalidCpuNumber(self.smp));
        }
        if self.mem < 128 || self.mem > 1_048_576 {
            return Err(QemuConfigError::InvalidMemSize(self.mem));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum BootError {
    #[error("boot: {0}")]
    Boot(String),
    #[error("spawn: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("no free port for ssh forwarding")]
    NoFreePort,
}

/// A booted (or bootable) qemu guest. Killing the process on drop.
pub struct QemuHandle {
    config: QemuConfig,
    debug: bool,
    qemu: Option<Child>,
    stdout: Option<OutputHandle>,
    stderr: Option<OutputHandle>,
    ssh_port: Option<u16>,
}

impl QemuHandle {
    pub fn with_config(config: QemuConfig, debug: bool) -> Self {
        Self {
            config,
            debug,
            qemu: None,
            stdout: None,
            stderr: None,
            ssh_port: None,
        }
    }

    /// Boot the guest, rebooting if one is already running. Returns the time
    /// it took until the guest answered over ssh.
    pub fn boot(&mut self) -> Result<Duration, BootError> {
        if self.qemu.is_some() {
            log::debug!("rebooting {}", self.config.target);
            self.kill();
        }

        let ssh_port = free_port().ok_or(BootError::NoFreePort)?;
        let mut cmd = build_qemu_command(&self.config, ssh_port);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        log::debug!("qemu cmd: {:?}", cmd);

        let mut child = cmd.spawn()?;
        self.stdout = Some(capture(child.stdout.take().unwrap(), self.debug));
        self.stderr = Some(capture(child.stderr.take().unwrap(), false));
        self.qemu = Some(child);
        self.ssh_port = Some(ssh_port);

        let start = Instant::now();
        loop {
            sleep(Duration::from_secs(2));
            if self.is_alive() {
                self.clear_console();
                return Ok(start.elapsed());
            }
            if let Some(status) = self.qemu.as_mut().unwrap().try_wait()? {
                let stderr = self.stderr.take().unwrap().take_current();
                let stderr = String::from_utf8_lossy(&stderr).into_owned();
                self.kill();
                return Err(BootError::Boot(format!(
                    "qemu exited with {} during boot\n{}",
                    status, stderr
                )));
            }
            if start.elapsed() > BOOT_TIMEOUT {
                self.kill();
                return Err(BootError::Boot(format!(
                    "no ssh answer within {}s",
                    BOOT_TIMEOUT.as_secs()
                )));
            }
        }
    }

    /// Host-side ssh address of the guest.
    pub fn addr(&self) -> Option<(String, u16)> {
        self.ssh_port.map(|port| (SSH_IP.to_string(), port))
    }

    /// (key path, user) for logging into the guest.
    pub fn ssh(&self) -> (String, String) {
        (self.config.ssh_key.clone(), self.config.ssh_user.clone())
    }

    /// Guest-visible address of a port the coordinator listens on.
    pub fn forward_addr(&self, port: u16) -> String {
        format!("{}:{}", GUEST_HOST_IP, port)
    }

    pub fn is_alive(&self) -> bool {
        let (ip, port) = match self.addr() {
            Some(addr) => addr,
            None => return false,
        };
        let mut ssh_cmd = ssh::ssh_basic_cmd(&ip, port, &self.config.ssh_key, &self.config.ssh_user);
        ssh_cmd.arg("pwd").stdin(Stdio::null());
        matches!(ssh_cmd.output(), Ok(output) if output.status.success())
    }

    /// Console output captured since the last call.
    pub fn console_output(&self) -> Vec<u8> {
        self.stdout
            .as_ref()
            .map(|out| out.take_current())
            .unwrap_or_default()
    }

    /// Whether the guest's console stream has closed, i.e. qemu has exited.
    pub fn console_finished(&self) -> bool {
        self.stdout
            .as_ref()
            .map(|out| out.is_finished())
            .unwrap_or(true)
    }

    pub fn clear_console(&self) {
        if let Some(stdout) = self.stdout.as_ref() {
            stdout.clear();
        }
        if let Some(stderr) = self.stderr.as_ref() {
            stderr.clear();
        }
    }

    /// Wait briefly for a dying guest to finish writing its console log,
    /// then kill it and return everything still buffered.
    pub fn collect_crash_log(&mut self) -> Option<Vec<u8>> {
        let stdout = self.stdout.take()?;
        let deadline = Instant::now() + Duration::from_secs(15);
        while Instant::now() < deadline {
            match self.qemu.as_mut().and_then(|q| q.try_wait().ok()) {
                Some(None) => sleep(Duration::from_millis(100)),
                _ => break,
            }
        }
        self.kill();
        Some(stdout.wait_finished(Duration::from_secs(5)))
    }

    fn kill(&mut self) {
        if let Some(qemu) = self.qemu.as_mut() {
            let _ = qemu.kill();
            let _ = qemu.wait();
        }
        self.qemu = None;
        self.stdout = None;
        self.stderr = None;
        self.ssh_port = None;
    }
}

impl Drop for QemuHandle {
    fn drop(&mut self) {
        self.kill();
    }
}

struct ArchConf {
    qemu: &'static str,
    args: &'static [&'static str],
    net_dev: &'static str,
    append: &'static [&'static str],
}

static LINUX_APPEND: [&str; 9] = [
    "earlyprintk=serial",
    "oops=panic",
    "nmi_watchdog=panic",
    "panic_on_warn=1",
    "panic=1",
    "ftrace_dump_on_oops=orig_cpu",
    "vsyscall=native",
    "net.ifnames=0",
    "biosdevname=0",
];

fn arch_conf(target: &str) -> Option<&'static ArchConf> {
    static AMD64: ArchConf = ArchConf {
        qemu: "qemu-system-x86_64",
        args: &["-enable-kvm", "-cpu", "host,migratable=off"],
        net_dev: "e1000",
        append: &["root=/dev/sda", "console=ttyS0"],
    };
    static I386: ArchConf = ArchConf {
        qemu: "qemu-system-i386",
        args: &[],
        net_dev: "e1000",
        append: &["root=/dev/sda", "console=ttyS0"],
    };
    static ARM64: ArchConf = ArchConf {
        qemu: "qemu-system-aarch64",
        args: &["-machine", "virt,virtualization=on", "-cpu", "cortex-a57"],
        net_dev: "virtio-net-pci",
        append: &["root=/dev/vda", "console=ttyAMA0"],
    };
    static RISCV64: ArchConf = ArchConf {
        qemu: "qemu-system-riscv64",
        args: &["-machine", "virt"],
        net_dev: "virtio-net-pci",
        append: &["root=/dev/vda", "console=ttyS0"],
    };
    match target {
        "linux/amd64" => Some(&AMD64),
        "linux/386" => Some(&I386),
        "linux/arm64" => Some(&ARM64),
        "linux/riscv64" => Some(&RISCV64),
        _ => None,
    }
}

fn free_port() -> Option<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).ok()?;
    listener.local_addr().ok().map(|addr| addr.port())
}

fn build_qemu_command(conf: &QemuConfig, ssh_port: u16) -> Command {
    let arch = arch_conf(&conf.target).unwrap();

    let mut cmd = Command::new(arch.qemu);
    cmd.args([
        "-display",
        "none",
        "-serial",
        "stdio",
        "-no-reboot",
        "-snapshot",
        "-device",
        "virtio-rng-pci",
    ]);
    cmd.args(arch.args);
    cmd.arg("-m").arg(conf.mem.to_string());
    cmd.arg("-smp").arg(conf.smp.to_string());
    cmd.arg("-device")
        .arg(format!("{},netdev=net0", arch.net_dev));
    cmd.arg("-netdev").arg(format!(
        "user,id=net0,hostfwd=tcp:{}:{}-:22",
        SSH_IP, ssh_port
    ));
    cmd.arg("-drive")
        .arg(format!("file={},index=0,media=disk", conf.disk_img));
    if let Some(kernel_img) = conf.kernel_img.as_ref() {
        let mut append: Vec<&str> = arch.append.to_vec();
        append.extend(LINUX_APPEND);
        cmd.arg("-kernel").arg(kernel_img);
        cmd.arg("-append").arg(append.join(" "));
    }
    cmd
}
