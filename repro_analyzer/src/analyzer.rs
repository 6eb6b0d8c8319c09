//! The coordinator: owns the program table, the per-vm task queues and the
//! statistics, and keeps one supervisor loop alive per vm.

use crate::{
    config::PoolConfig,
    queue::{QueueError, Repeat, Task, TasksQueue},
    rpc::ProgramArgs,
    stats::Statistics,
    util::{prog_hash, stop_flag, stop_req, stop_soon, vm_key, VmKey},
};
use anyhow::Context;
use rand::SeedableRng;
use repro_core::{mutation::mutate_fail_nth, parse::parse_prog, prog::Prog, HashMap, RngType};
use repro_vm::{pool::Pool, report::Reporter};
use std::{
    path::PathBuf,
    sync::{Arc, Mutex, OnceLock},
    thread,
    time::Duration,
};
use thiserror::Error;

/// Repeat flag requesting infinite execution.
pub const INFINITE_REPEAT: i64 = -1;

/// One configured pool of vms.
pub struct PoolInfo {
    pub config: PoolConfig,
    pub pool: Pool,
    pub reporter: Reporter,
}

/// State guarded by the coordinator's scheduling mutex: the queues, the
/// canonical programs and the mutation rng. Statistics has its own lock and
/// is never entered while this one is held the other way around.
struct Shared {
    queue: TasksQueue,
    programs: HashMap<String, Prog>,
    rng: RngType,
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("no program registered for task {0}")]
    UnknownProgram(String),
}

pub struct Analyzer {
    pools: Vec<PoolInfo>,
    runner_bin: PathBuf,
    executor_bin: PathBuf,
    rpc_port: OnceLock<u16>,
    shared: Mutex<Shared>,
    stats: Arc<Statistics>,
}

const REBOOT_BACKOFF: Duration = Duration::from_secs(10);

impl Analyzer {
    pub fn new(
        pools: Vec<PoolInfo>,
        runner_bin: PathBuf,
        executor_bin: PathBuf,
        stats: Arc<Statistics>,
    ) -> Self {
        Self {
            pools,
            runner_bin,
            executor_bin,
            rpc_port: OnceLock::new(),
            shared: Mutex::new(Shared {
                queue: TasksQueue::new(),
                programs: HashMap::default(),
                rng: RngType::from_entropy(),
            }),
            stats,
        }
    }

    pub fn stats(&self) -> &Arc<Statistics> {
        &self.stats
    }

    /// Record the rpc port supervisors forward into every guest.
    pub fn set_rpc_port(&self, port: u16) {
        self.rpc_port
            .set(port)
            .expect("rpc port already recorded");
    }

    /// Register the programs and schedule one task per (program, vm) on
    /// every vm of every pool. Negative `repeat` means infinite.
    pub fn add_tasks(&self, programs: &[Prog], repeat: i64) {
        let mut shared = self.shared.lock().unwrap();
        for (pool_id, info) in self.pools.iter().enumerate() {
            for vm_id in 0..info.pool.count() {
                Self::add_tasks_locked(&mut shared, vm_key(pool_id, vm_id), programs, repeat);
            }
        }
    }

    /// Same, targeted at a single vm.
    pub fn add_tasks_by_id(&self, vm: VmKey, programs: &[Prog], repeat: i64) {
        let mut shared = self.shared.lock().unwrap();
        Self::add_tasks_locked(&mut shared, vm, programs, repeat);
    }

    fn add_tasks_locked(shared: &mut Shared, vm: VmKey, programs: &[Prog], repeat: i64) {
        for program in programs {
            let id = prog_hash(program);
            shared.programs.insert(id.clone(), program.clone());
            shared.queue.push(
                vm,
                Task {
                    id,
                    repeat: Repeat::from_flag(repeat),
                },
            );
        }
    }

    /// Remove every pending dispatch of the task. Executions already handed
    /// out complete and are still counted.
    pub fn stop_task(&self, task_id: &str) -> Result<(), QueueError> {
        let mut shared = self.shared.lock().unwrap();
        shared.queue.stop(task_id)
    }

    /// Resurrect a task known only by id from the statistics record and
    /// broadcast it to every vm as an infinite task.
    pub fn run_task(&self, task_id: &str) -> anyhow::Result<()> {
        let text = self
            .stats
            .program_of(task_id)
            .context("there is no such task")?;
        let program = parse_prog(&text).map_err(|e| anyhow::anyhow!("wrong program format: {}", e))?;

        let mut shared = self.shared.lock().unwrap();
        shared.programs.insert(task_id.to_string(), program);
        shared.queue.push_all(&Task {
            id: task_id.to_string(),
            repeat: Repeat::Infinite,
        });
        Ok(())
    }

    pub fn is_running(&self, task_id: &str) -> bool {
        let shared = self.shared.lock().unwrap();
        shared.queue.contains(task_id)
    }

    /// Pop the next task for the vm, blocking on the pull gate while its
    /// queue is empty. The program's fault injection indices are re-rolled
    /// on the canonical copy before serialization, so later dispatches of
    /// the same id observe the mutation.
    pub fn next_program(&self, vm: VmKey) -> Result<(String, Vec<u8>), TaskError> {
        let mut shared = self.shared.lock().unwrap();
        while shared.queue.is_empty(vm) {
            let gate = shared.queue.gate(vm);
            shared = gate.wait(shared).unwrap();
        }
        let task = shared.queue.get_and_pop(vm)?;
        let Shared { programs, rng, .. } = &mut *shared;
        let program = programs
            .get_mut(&task.id)
            .ok_or_else(|| TaskError::UnknownProgram(task.id.clone()))?;
        mutate_fail_nth(program, rng);
        Ok((task.id, program.serialize()))
    }

    /// Feed the outcome a runner reported into the statistics. Outcomes of
    /// the very first poll carry no task id and are ignored.
    pub fn add_program_result(&self, args: &ProgramArgs) {
        if args.task_id.is_empty() {
            return;
        }
        let program = {
            let shared = self.shared.lock().unwrap();
            shared
                .programs
                .get(&args.task_id)
                .map(|p| String::from_utf8_lossy(&p.serialize()).into_owned())
        };
        self.stats
            .add_result(args.pool, &args.task_id, args.error.as_deref(), program);
    }

    /// Spawn one supervisor thread per vm of every pool.
    pub fn start_instances(self: &Arc<Self>) {
        for (pool_id, info) in self.pools.iter().enumerate() {
            for vm_id in 0..info.pool.count() {
                let analyzer = Arc::clone(self);
                thread::Builder::new()
                    .name(format!("vm-{}-{}", pool_id, vm_id))
                    .spawn(move || analyzer.supervise(pool_id, vm_id))
                    .expect("failed to spawn vm supervisor");
            }
        }
    }

    fn supervise(&self, pool_id: usize, vm_id: usize) {
        while !stop_soon() {
            if let Err(e) = self.run_instance(pool_id, vm_id) {
                log::error!("vm {}/{}: {:#}", pool_id, vm_id, e);
                thread::sleep(REBOOT_BACKOFF);
            }
        }
    }

    /// One lifecycle of one vm: boot, upload the binaries, run the agent,
    /// watch it until the guest dies or times out, report, return to reboot.
    fn run_instance(&self, pool_id: usize, vm_id: usize) -> anyhow::Result<()> {
        let info = &self.pools[pool_id];
        let rpc_port = self
            .rpc_port
            .get()
            .copied()
            .context("rpc server not started")?;
        let (os, arch) = info.config.target_split()?;

        let mut instance = info
            .pool
            .create(vm_id)
            .context("failed to create instance")?;
        let rpc_addr = instance.forward(rpc_port);
        let runner = instance
            .copy(&self.runner_bin)
            .context("failed to copy runner")?;
        instance
            .copy(&self.executor_bin)
            .context("failed to copy executor")?;

        let command = format!(
            "{} --os={} --arch={} --addr={} --pool={} --vm={}",
            runner.display(),
            os,
            arch,
            rpc_addr,
            pool_id,
            vm_id
        );
        let run = instance.run(&command).context("failed to start runner")?;
        let report = instance.monitor_execution(
            run,
            &info.reporter,
            info.config.vm_running_time(),
            stop_flag(),
        );

        log::info!("{}", report);
        log::info!("reboot the vm in pool {}", pool_id);
        Ok(())
    }
}

/// Flush the statistics and exit on the first termination signal.
pub fn setup_signal_handler(stats: Arc<Statistics>) {
    use signal_hook::consts::TERM_SIGNALS;
    use signal_hook::iterator::Signals;

    thread::spawn(move || {
        let mut signals = Signals::new(TERM_SIGNALS).unwrap();
        if let Some(signal) = signals.forever().next() {
            log::info!("signal {} received, flushing statistics", signal);
            stop_req();
            stats.print();
            std::process::exit(0);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use repro_core::parse::parse_log;
    use repro_vm::qemu::QemuConfig;

    fn test_pool(count: usize) -> PoolInfo {
        let qemu = QemuConfig {
            target: "linux/amd64".to_string(),
            kernel_img: None,
            disk_img: "disk.img".to_string(),
            ssh_key: "key".to_string(),
            ssh_user: "root".to_string(),
            smp: 1,
            mem: 512,
        };
        let config = PoolConfig {
            target: "linux/amd64".to_string(),
            syzkaller: PathBuf::from("/syz"),
            executor_bin: None,
            rpc: "127.0.0.1:0".to_string(),
            exe_extension: String::new(),
            vm_running_time_secs: 60,
            count,
            qemu: qemu.clone(),
        };
        PoolInfo {
            pool: Pool::new(qemu, count, false),
            config,
            reporter: Reporter::new(),
        }
    }

    fn test_analyzer(pool_sizes: &[usize]) -> Arc<Analyzer> {
        let pools = pool_sizes.iter().map(|&n| test_pool(n)).collect();
        let stats = Arc::new(Statistics::new(pool_sizes.len(), None).unwrap());
        Arc::new(Analyzer::new(
            pools,
            PathBuf::from("repro-runner"),
            PathBuf::from("syz-executor"),
            stats,
        ))
    }

    fn one_prog(text: &str) -> Prog {
        let progs = parse_log(text.as_bytes());
        assert_eq!(progs.len(), 1);
        progs.into_iter().next().unwrap()
    }

    fn success(pool: usize, vm: usize, task_id: &str) -> ProgramArgs {
        ProgramArgs {
            pool,
            vm,
            task_id: task_id.to_string(),
            ..Default::default()
        }
    }

    fn stats_value(analyzer: &Analyzer) -> serde_json::Value {
        serde_json::from_str(&analyzer.stats().json().unwrap()).unwrap()
    }

    #[test]
    fn single_vm_finite_repeat_runs_n_plus_one_times() {
        let analyzer = test_analyzer(&[1]);
        let prog = one_prog("close(0x3)\n");
        analyzer.add_tasks(&[prog.clone()], 2);
        let key = vm_key(0, 0);

        let id = prog_hash(&prog);
        for _ in 0..3 {
            let (got, _) = analyzer.next_program(key).unwrap();
            assert_eq!(got, id);
            analyzer.add_program_result(&success(0, 0, &got));
        }
        assert!(!analyzer.is_running(&id));

        let stats = stats_value(&analyzer);
        assert_eq!(stats["TotalRuns"], 3);
        assert_eq!(stats["SuccessfulRuns"], 3);
        assert_eq!(stats["Results"][&id]["TotalRuns"], 3);
    }

    #[test]
    fn same_error_across_pools_shares_a_fingerprint() {
        let analyzer = test_analyzer(&[1, 1]);
        let prog = one_prog("close(0x3)\n");
        analyzer.add_tasks(&[prog.clone()], -1);
        let id = prog_hash(&prog);

        for pool in 0..2 {
            let (got, _) = analyzer.next_program(vm_key(pool, 0)).unwrap();
            assert_eq!(got, id);
            let mut args = success(pool, 0, &got);
            args.error = Some(b"BUG: foo".to_vec());
            analyzer.add_program_result(&args);
        }

        let stats = stats_value(&analyzer);
        let errors = stats["Results"][&id]["Errors"].as_object().unwrap();
        assert_eq!(errors.len(), 1);
        let error = errors.values().next().unwrap();
        assert_eq!(error["Error"], "BUG: foo");
        assert_eq!(error["Pools"], serde_json::json!([1, 1]));
        assert_eq!(error["Count"], 2);
    }

    #[test]
    fn stopped_task_is_not_dispatched_again() {
        let analyzer = test_analyzer(&[1]);
        let prog = one_prog("close(0x3)\n");
        analyzer.add_tasks(&[prog.clone()], -1);
        let id = prog_hash(&prog);

        let (got, _) = analyzer.next_program(vm_key(0, 0)).unwrap();
        assert_eq!(got, id);
        analyzer.stop_task(&id).unwrap();
        assert!(!analyzer.is_running(&id));
        assert_eq!(analyzer.stop_task(&id), Err(QueueError::NotFound));
    }

    #[test]
    fn completed_task_can_be_resurrected_from_statistics() {
        let analyzer = test_analyzer(&[1]);
        let prog = one_prog("close(0x3)\n");
        analyzer.add_tasks(&[prog.clone()], 0);
        let id = prog_hash(&prog);
        let key = vm_key(0, 0);

        let (got, _) = analyzer.next_program(key).unwrap();
        analyzer.add_program_result(&success(0, 0, &got));
        assert!(!analyzer.is_running(&id));

        analyzer.run_task(&id).unwrap();
        assert!(analyzer.is_running(&id));
        let (got, _) = analyzer.next_program(key).unwrap();
        assert_eq!(got, id);
        // infinite now: the queue still holds it
        assert!(analyzer.is_running(&id));
    }

    #[test]
    fn run_task_on_unknown_id_fails() {
        let analyzer = test_analyzer(&[1]);
        assert!(analyzer.run_task("no-such-task").is_err());
    }

    #[test]
    fn next_program_rerolls_fail_nth() {
        let analyzer = test_analyzer(&[1]);
        let prog = one_prog("close(0x3) (fail_nth: 1)\n");
        analyzer.add_tasks(&[prog], -1);

        let (_, serialized) = analyzer.next_program(vm_key(0, 0)).unwrap();
        let text = String::from_utf8(serialized).unwrap();
        let reparsed = parse_prog(&text).unwrap();
        let nth = reparsed.calls()[0].props.fail_nth;
        assert!((10..30).contains(&nth), "fail_nth {} out of range", nth);
    }

    #[test]
    fn next_program_blocks_until_a_task_arrives() {
        let analyzer = test_analyzer(&[1]);
        let key = vm_key(0, 0);
        let waiter = {
            let analyzer = Arc::clone(&analyzer);
            thread::spawn(move || analyzer.next_program(key).unwrap().0)
        };
        thread::sleep(Duration::from_millis(50));
        let prog = one_prog("close(0x3)\n");
        analyzer.add_tasks_by_id(key, &[prog.clone()], -1);
        assert_eq!(waiter.join().unwrap(), prog_hash(&prog));
    }

    #[test]
    fn first_poll_without_task_id_is_ignored() {
        let analyzer = test_analyzer(&[1]);
        analyzer.add_program_result(&success(0, 0, ""));
        let stats = stats_value(&analyzer);
        assert_eq!(stats["TotalRuns"], 0);
    }
}
