use anyhow::{bail, Context};
use clap::Parser;
use env_logger::{Env, TimestampPrecision};
use repro_analyzer::{
    analyzer::{setup_signal_handler, Analyzer, PoolInfo, INFINITE_REPEAT},
    config::PoolConfig,
    monitor::Monitor,
    rpc,
    stats::Statistics,
};
use repro_core::{parse::parse_log, prog::Prog};
use repro_vm::{pool::Pool, report::Reporter};
use std::{path::PathBuf, process::exit, sync::Arc};

/// Run reproducers repeatedly across pools of virtual machines and collect
/// per-program execution statistics.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Settings {
    /// Configuration files of the kernel pools, comma separated.
    #[arg(long, value_delimiter = ',')]
    configs: Vec<PathBuf>,
    /// How many times each reproducer runs on every vm; negative means
    /// until stopped.
    #[arg(long, default_value_t = INFINITE_REPEAT, allow_negative_numbers = true)]
    repeat: i64,
    /// Listen address of the http control surface.
    #[arg(long, default_value = "10.10.2.95:8080")]
    address: String,
    /// Path of the statistics json file; without it the statistics go to
    /// stdout on shutdown.
    #[arg(long, default_value = "")]
    data: String,
    /// Print debug output from the virtual machines.
    #[arg(long)]
    debug: bool,
    /// Reproducer files to execute.
    reproducers: Vec<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let settings = Settings::parse();

    let log_env = Env::new()
        .filter_or("REPRO_LOG", "info")
        .default_write_style_or("auto");
    env_logger::Builder::from_env(log_env)
        .format_timestamp(Some(TimestampPrecision::Seconds))
        .init();

    if settings.configs.is_empty() {
        log::error!("there are no configs for virtual machines");
        exit(255);
    }
    if settings.reproducers.is_empty() {
        log::error!("there are no reproducers for testing");
        exit(255);
    }

    let mut pools = Vec::with_capacity(settings.configs.len());
    for path in &settings.configs {
        let config = PoolConfig::load(path)?;
        let pool = Pool::new(config.qemu.clone(), config.count, settings.debug);
        pools.push(PoolInfo {
            pool,
            reporter: Reporter::new(),
            config,
        });
    }

    // the first pool's config is authoritative for target and rpc address
    let head = &pools[0].config;
    let rpc_addr = head.rpc.clone();
    let runner_bin = head.runner_bin()?;
    if !runner_bin.exists() {
        bail!("bad config: can't find {}", runner_bin.display());
    }
    let executor_bin = head.executor_bin()?;
    if !executor_bin.exists() {
        bail!("bad config: can't find {}", executor_bin.display());
    }

    let programs = load_reproducers(&settings.reproducers)?;
    log::info!("number of loaded programs: {}", programs.len());

    let data_path = (!settings.data.is_empty()).then(|| PathBuf::from(&settings.data));
    let stats = Arc::new(
        Statistics::new(pools.len(), data_path).context("failed to initialise statistics")?,
    );

    let analyzer = Arc::new(Analyzer::new(
        pools,
        runner_bin,
        executor_bin,
        Arc::clone(&stats),
    ));
    analyzer.add_tasks(&programs, settings.repeat);

    let port =
        rpc::serve(Arc::clone(&analyzer), &rpc_addr).context("failed to start rpc server")?;
    analyzer.set_rpc_port(port);

    setup_signal_handler(stats);
    analyzer.start_instances();

    Monitor::new(analyzer).listen_and_serve(&settings.address)
}

fn load_reproducers(files: &[PathBuf]) -> anyhow::Result<Vec<Prog>> {
    let mut programs = Vec::new();
    for path in files {
        let data = std::fs::read(path)
            .with_context(|| format!("can't read repro file {}", path.display()))?;
        programs.extend(parse_log(&data));
    }
    if programs.is_empty() {
        bail!("no programs parsed from the reproducer files");
    }
    Ok(programs)
}
