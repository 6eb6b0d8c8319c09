//! In-vm agent: long-polls the coordinator for programs and drives the
//! executor binary. Every poll carries the outcome of the previous program.

use clap::Parser;
use env_logger::Env;
use repro_analyzer::rpc::{self, ProgramArgs, ProgramResults, RpcError};
use repro_vm::io::capture;
use std::{
    io::Write,
    net::TcpStream,
    path::PathBuf,
    process::{exit, Command, ExitStatus, Stdio},
    thread::sleep,
    time::{Duration, Instant},
};

#[derive(Debug, Parser)]
#[command(name = "repro-runner", about = "in-vm reproducer agent")]
struct Settings {
    /// Target os.
    #[arg(long, default_value = "linux")]
    os: String,
    /// Target arch.
    #[arg(long, default_value = "amd64")]
    arch: String,
    /// Address of the coordinator rpc.
    #[arg(long)]
    addr: String,
    /// Pool this vm belongs to.
    #[arg(long, default_value_t = 0)]
    pool: usize,
    /// Slot of this vm inside the pool.
    #[arg(long, default_value_t = 0)]
    vm: usize,
    /// Path of the executor binary.
    #[arg(long, default_value = "./syz-executor")]
    executor: PathBuf,
    /// Seconds one program may run before it counts as hanged.
    #[arg(long, default_value_t = 60)]
    program_timeout: u64,
}

fn main() {
    let settings = Settings::parse();
    env_logger::Builder::from_env(Env::new().filter_or("RUNNER_LOG", "info")).init();
    log::info!(
        "runner for {}/{} on vm {}/{} polling {}",
        settings.os,
        settings.arch,
        settings.pool,
        settings.vm,
        settings.addr
    );

    let mut stream = connect(&settings.addr);
    let mut args = first_poll(&settings);

    loop {
        let results = match rpc::call(&mut stream, &args) {
            Ok(results) => results,
            Err(RpcError::Server(e)) => {
                log::error!("coordinator refused the poll: {}", e);
                args = first_poll(&settings);
                sleep(Duration::from_secs(5));
                continue;
            }
            Err(e) => {
                log::error!("rpc: {}", e);
                args = first_poll(&settings);
                sleep(Duration::from_secs(5));
                stream = connect(&settings.addr);
                continue;
            }
        };
        args = execute(&settings, &results);
    }
}

/// A poll carrying no outcome, used on startup and after rpc failures
/// (a resent outcome could otherwise be counted twice).
fn first_poll(settings: &Settings) -> ProgramArgs {
    ProgramArgs {
        pool: settings.pool,
        vm: settings.vm,
        ..Default::default()
    }
}

fn connect(addr: &str) -> TcpStream {
    let mut tries = 0;
    loop {
        match TcpStream::connect(addr) {
            Ok(conn) => return conn,
            Err(e) => {
                tries += 1;
                if tries == 10 {
                    log::error!("can't reach the coordinator at {}: {}", addr, e);
                    exit(1);
                }
                sleep(Duration::from_secs(1));
            }
        }
    }
}

struct Outcome {
    hanged: bool,
    error: Option<Vec<u8>>,
}

fn execute(settings: &Settings, results: &ProgramResults) -> ProgramArgs {
    let mut args = ProgramArgs {
        pool: settings.pool,
        vm: settings.vm,
        task_id: results.id.clone(),
        ..Default::default()
    };
    match run_executor(settings, &results.prog) {
        Ok(outcome) => {
            args.hanged = outcome.hanged;
            args.error = outcome.error;
        }
        Err(e) => {
            args.error = Some(format!("failed to run executor: {}", e).into_bytes());
        }
    }
    args
}

fn run_executor(settings: &Settings, prog: &[u8]) -> std::io::Result<Outcome> {
    let mut cmd = Command::new(&settings.executor);
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn()?;

    let stdout = capture(child.stdout.take().unwrap(), false);
    let stderr = capture(child.stderr.take().unwrap(), false);
    child.stdin.take().unwrap().write_all(prog)?;

    let deadline = Instant::now() + Duration::from_secs(settings.program_timeout);
    loop {
        match child.try_wait()? {
            Some(status) => {
                let mut output = stdout.wait_finished(Duration::from_secs(1));
                output.extend(stderr.wait_finished(Duration::from_secs(1)));
                let error = if status.success() {
                    None
                } else {
                    Some(error_tail(output, status))
                };
                return Ok(Outcome {
                    hanged: false,
                    error,
                });
            }
            None if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Ok(Outcome {
                    hanged: true,
                    error: None,
                });
            }
            None => sleep(Duration::from_millis(50)),
        }
    }
}

fn error_tail(mut output: Vec<u8>, status: ExitStatus) -> Vec<u8> {
    const MAX_OUTPUT: usize = 4096;
    if output.len() > MAX_OUTPUT {
        output.drain(..output.len() - MAX_OUTPUT);
    }
    let mut msg = format!("executor exited with {}\n", status).into_bytes();
    msg.extend(output);
    msg
}
