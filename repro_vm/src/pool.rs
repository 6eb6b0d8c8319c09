//! The pool abstraction the coordinator schedules over: a homogeneous group
//! of guests, created on demand and monitored until they die.

use crate::io::OutputHandle;
use crate::qemu::{BootError, QemuConfig, QemuHandle};
use crate::report::{Report, Reporter};
use crate::ssh::{self, SshError};
use std::{
    path::{Path, PathBuf},
    process::{Child, Stdio},
    sync::atomic::{AtomicBool, Ordering},
    thread::sleep,
    time::{Duration, Instant},
};

pub struct Pool {
    config: QemuConfig,
    count: usize,
    debug: bool,
}

impl Pool {
    pub fn new(config: QemuConfig, count: usize, debug: bool) -> Self {
        Self {
            config,
            count,
            debug,
        }
    }

    /// Number of guests this pool runs in parallel.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Boot a fresh guest for slot `vm_id`.
    pub fn create(&self, vm_id: usize) -> Result<Instance, BootError> {
        let mut qemu = QemuHandle::with_config(self.config.clone(), self.debug);
        let boot_time = qemu.boot()?;
        log::debug!("vm {} booted in around {}s", vm_id, boot_time.as_secs());
        Ok(Instance {
            vm_id,
            qemu,
            debug: self.debug,
        })
    }
}

/// One booted guest.
pub struct Instance {
    vm_id: usize,
    qemu: QemuHandle,
    debug: bool,
}

/// A command running inside a guest, output captured in the background.
pub struct RunHandle {
    child: Child,
    pub stdout: OutputHandle,
    pub stderr: OutputHandle,
}

impl RunHandle {
    fn kill(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for RunHandle {
    fn drop(&mut self) {
        self.kill();
    }
}

impl Instance {
    /// Upload a binary into the guest home directory; returns the remote path.
    pub fn copy(&self, bin: &Path) -> Result<PathBuf, SshError> {
        let (ip, port) = self.qemu.addr().unwrap();
        let (key, user) = self.qemu.ssh();
        let to = PathBuf::from("~").join(bin.file_name().unwrap());
        ssh::scp(&ip, port, &key, &user, bin, &to)?;
        Ok(to)
    }

    /// Guest-visible address of a port bound on the host.
    pub fn forward(&self, port: u16) -> String {
        self.qemu.forward_addr(port)
    }

    /// Run a command inside the guest over ssh.
    pub fn run(&mut self, cmd: &str) -> Result<RunHandle, SshError> {
        let (ip, port) = self.qemu.addr().unwrap();
        let (key, user) = self.qemu.ssh();
        let mut ssh_cmd = ssh::ssh_basic_cmd(&ip, port, &key, &user);
        ssh_cmd
            .arg(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = ssh_cmd.spawn()?;
        let stdout = crate::io::capture(child.stdout.take().unwrap(), self.debug);
        let stderr = crate::io::capture(child.stderr.take().unwrap(), self.debug);
        Ok(RunHandle {
            child,
            stdout,
            stderr,
        })
    }

    /// Watch the guest until it crashes, dies, exceeds its running time or
    /// the process is asked to stop. Always returns a report describing why
    /// monitoring ended; the caller decides whether to reboot.
    pub fn monitor_execution(
        &mut self,
        mut run: RunHandle,
        reporter: &Reporter,
        running_time: Duration,
        stop: &AtomicBool,
    ) -> Report {
        let start = Instant::now();
        let mut console: Vec<u8> = Vec::new();
        loop {
            sleep(Duration::from_millis(500));
            console.extend(self.qemu.console_output());

            if reporter.contains_crash(&console) {
                if let Some(tail) = self.qemu.collect_crash_log() {
                    console.extend(tail);
                }
                run.kill();
                return reporter.extract(&console).unwrap_or_else(|| Report {
                    title: "corrupted crash report".to_string(),
                    raw_log: console,
                    ..Default::default()
                });
            }
            if self.qemu.console_finished() {
                run.kill();
                return reporter.extract(&console).unwrap_or_else(|| Report {
                    title: format!("lost connection to vm {}", self.vm_id),
                    raw_log: console,
                    ..Default::default()
                });
            }
            if let Ok(Some(status)) = run.child.try_wait() {
                let stderr = run.stderr.take_current();
                return Report {
                    title: format!("runner on vm {} exited with {}", self.vm_id, status),
                    report: String::from_utf8_lossy(&stderr).into_owned(),
                    raw_log: console,
                };
            }
            if stop.load(Ordering::Relaxed) {
                run.kill();
                return Report {
                    title: "stop requested".to_string(),
                    raw_log: console,
                    ..Default::default()
                };
            }
            if start.elapsed() >= running_time {
                run.kill();
                return Report {
                    title: "vm running time exceeded".to_string(),
                    raw_log: console,
                    ..Default::default()
                };
            }
        }
    }
}
