//! Experiment supervisor
//!
//! Builds the workload tasks from the expanded configuration, runs their
//! creation steps sequentially, resets the shared clock and starts
//! everything, then ticks a 500 ms liveness loop until the duration
//! elapses, a task dies, or shutdown is requested. Reset is idempotent and
//! strictly ordered: command server, task lists, perfmon client, a 1 s
//! grace sleep, SIGTERM to surviving children, temp dir.
//!
//! Signal policy: SIGTERM/SIGINT only touch atomics in the handler. While
//! no reset is in progress the first `IGNORE_SIGNALS_MAX` signals are
//! counted and ignored (container teardown is noisy); beyond that, and
//! always once a reset began, a signal requests shutdown.

pub mod command_server;
pub mod perfmon;
pub mod task;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context};
use log::{info, warn};

use crate::config::SupervisorConfig;
use crate::util::time::{Clock, TimeSync};
use crate::util::tmpdir::TmpDir;
use crate::Result;

use command_server::CommandServer;
use perfmon::PerfmonClient;
use task::{BlkLoad, ClientSim, ExperimentTask, KvBench};

const IGNORE_SIGNALS_MAX: u32 = 10;
const MAIN_LOOP_TICK: Duration = Duration::from_millis(500);

static SHUTDOWN: AtomicBool = AtomicBool::new(false);
static RESETTING: AtomicBool = AtomicBool::new(false);
static SIGNALS_SEEN: AtomicU32 = AtomicU32::new(0);

extern "C" fn signal_handler(_signal: libc::c_int) {
    // async-signal-safe: atomics only, teardown happens on the main thread
    if RESETTING.load(Ordering::Relaxed) {
        SHUTDOWN.store(true, Ordering::Relaxed);
        return;
    }
    let seen = SIGNALS_SEEN.fetch_add(1, Ordering::Relaxed) + 1;
    if seen > IGNORE_SIGNALS_MAX {
        SHUTDOWN.store(true, Ordering::Relaxed);
    }
}

fn install_signal_handlers() {
    let handler = signal_handler as extern "C" fn(libc::c_int) as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGTERM, handler);
        libc::signal(libc::SIGINT, handler);
    }
}

fn container_runtime_check() -> Result<()> {
    let status = std::process::Command::new("sh")
        .arg("-c")
        .arg("docker ps -a >/dev/null")
        .status()
        .context("failed to initiate the command processor")?;
    if !status.success() {
        bail!("failed to use the docker command");
    }
    Ok(())
}

/// Run the whole experiment; returns after reset completed.
pub fn run(config: SupervisorConfig) -> Result<()> {
    install_signal_handlers();
    container_runtime_check()?;

    let config = Arc::new(config);
    let cli = &config.cli;

    if config.kv.is_empty() && config.sim.is_empty() && config.load.is_empty() {
        warn!("no benchmark specified");
        return Ok(());
    }

    let clock = Arc::new(Clock::new());
    let tmpdir = Arc::new(TmpDir::new()?);
    let tsync = Arc::new(TimeSync::new(cli.stats_interval as u64));
    let warm_period_s = cli.warm_period as u64 * 60;
    let sync_stats = cli.sync_stats;

    let result = run_experiment(
        &config,
        &clock,
        &tmpdir,
        &tsync,
        warm_period_s,
        sync_stats,
    );
    if let Err(err) = &result {
        warn!("experiment failed: {:#}", err);
    }
    result
}

fn run_experiment(
    config: &Arc<SupervisorConfig>,
    clock: &Arc<Clock>,
    tmpdir: &Arc<TmpDir>,
    tsync: &Arc<TimeSync>,
    warm_period_s: u64,
    sync_stats: bool,
) -> Result<()> {
    let cli = &config.cli;
    let mut tasks: Vec<Arc<dyn ExperimentTask>> = Vec::new();

    // KV benchmark instances, with their creation steps run up front
    let mut kv_tasks: Vec<Arc<dyn ExperimentTask>> = Vec::new();
    for i in 0..config.kv.len() {
        let primary = i == 0 && sync_stats && config.sim.is_empty();
        let task: Arc<dyn ExperimentTask> = Arc::new(KvBench::new(
            config.clone(),
            i,
            clock.clone(),
            tmpdir.clone(),
            Some(tsync.clone()),
            primary,
        ));
        task.create_resources()?;
        kv_tasks.push(task);
    }

    let mut sim_tasks: Vec<Arc<dyn ExperimentTask>> = Vec::new();
    for i in 0..config.sim.len() {
        let primary = i == 0 && sync_stats;
        let task: Arc<dyn ExperimentTask> = Arc::new(ClientSim::new(
            config.clone(),
            i,
            clock.clone(),
            tmpdir.clone(),
            Some(tsync.clone()),
            primary,
        ));
        task.create_resources()?;
        sim_tasks.push(task);
    }

    // creation can take a long time: the experiment clock starts here
    clock.reset();

    for task in &kv_tasks {
        task.start()?;
    }
    for task in &sim_tasks {
        task.start()?;
    }

    let mut load_tasks: Vec<Arc<dyn ExperimentTask>> = Vec::new();
    for i in 0..config.load.len() {
        let primary =
            i == 0 && sync_stats && config.sim.is_empty() && config.kv.is_empty();
        let task: Arc<dyn ExperimentTask> = Arc::new(BlkLoad::new(
            config.clone(),
            i,
            clock.clone(),
            tmpdir.clone(),
            Some(tsync.clone()),
            primary,
        ));
        task.start()?;
        load_tasks.push(task);
    }

    tasks.extend(kv_tasks);
    tasks.extend(sim_tasks);
    tasks.extend(load_tasks);

    let mut task_map: HashMap<String, Arc<dyn ExperimentTask>> = HashMap::new();
    for task in &tasks {
        task_map.insert(task.name().to_string(), task.clone());
    }

    let mut command_server = Some(CommandServer::new(
        &cli.socket,
        task_map,
        clock.clone(),
        warm_period_s,
    )?);
    if let Some(server) = command_server.as_mut() {
        server.run_initial_commands(&cli.commands);
    }

    let mut perfmon = if cli.perfmon {
        Some(PerfmonClient::new(
            cli.perfmon_port,
            clock.clone(),
            warm_period_s,
            cli.stats_interval,
            if sync_stats { Some(tsync.clone()) } else { None },
        )?)
    } else {
        None
    };

    let result = main_loop(cli.duration, clock, &tasks, perfmon.as_ref());

    info!("main loop finished");
    reset(&mut command_server, &tasks, &mut perfmon);
    result
}

fn main_loop(
    duration_min: u32,
    clock: &Arc<Clock>,
    tasks: &[Arc<dyn ExperimentTask>],
    perfmon: Option<&PerfmonClient>,
) -> Result<()> {
    let duration_s = duration_min as u64 * 60;
    let mut signals_logged = 0;

    while !SHUTDOWN.load(Ordering::Relaxed) && clock.s() <= duration_s {
        let seen = SIGNALS_SEEN.load(Ordering::Relaxed);
        if seen > signals_logged {
            warn!("signal ignored ({}/{})", seen, IGNORE_SIGNALS_MAX);
            signals_logged = seen;
        }

        if let Some(perfmon) = perfmon {
            if !perfmon.is_active()? {
                bail!("performance counter client is not active");
            }
        }

        for task in tasks {
            if !task.is_active() {
                info!("task {} is no longer active", task.name());
                return Ok(());
            }
        }

        thread::sleep(MAIN_LOOP_TICK);
    }

    if SHUTDOWN.load(Ordering::Relaxed) {
        warn!("shutdown requested by signal");
    } else {
        info!("duration time exceeded: {} minutes", duration_min);
    }
    Ok(())
}

/// Idempotent, strictly ordered teardown.
fn reset(
    command_server: &mut Option<CommandServer>,
    tasks: &[Arc<dyn ExperimentTask>],
    perfmon: &mut Option<PerfmonClient>,
) {
    if RESETTING.swap(true, Ordering::Relaxed) {
        return;
    }
    SIGNALS_SEEN.store(0, Ordering::Relaxed);

    command_server.take();

    let pids: Vec<u32> = tasks.iter().filter_map(|t| t.core().pid()).collect();
    for task in tasks {
        task.shutdown();
    }

    perfmon.take();

    thread::sleep(Duration::from_secs(1));

    for pid in pids {
        let alive = unsafe { libc::kill(pid as libc::pid_t, 0) } == 0;
        if alive {
            warn!("child (pid {}) still active. kill it", pid);
            unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        }
    }
    // the temp dir is removed when its last owner drops
}

#[cfg(test)]
mod tests {
    use super::*;

    // one test: the handler state is process-global
    #[test]
    fn test_signal_policy() {
        SHUTDOWN.store(false, Ordering::Relaxed);
        RESETTING.store(false, Ordering::Relaxed);
        SIGNALS_SEEN.store(0, Ordering::Relaxed);

        // outside a reset the first IGNORE_SIGNALS_MAX signals are ignored
        for _ in 0..IGNORE_SIGNALS_MAX {
            signal_handler(libc::SIGTERM);
        }
        assert!(!SHUTDOWN.load(Ordering::Relaxed));
        signal_handler(libc::SIGTERM);
        assert!(SHUTDOWN.load(Ordering::Relaxed));

        // during a reset any signal propagates without touching the counter
        SHUTDOWN.store(false, Ordering::Relaxed);
        SIGNALS_SEEN.store(0, Ordering::Relaxed);
        RESETTING.store(true, Ordering::Relaxed);
        signal_handler(libc::SIGTERM);
        assert!(SHUTDOWN.load(Ordering::Relaxed));
        assert_eq!(SIGNALS_SEEN.load(Ordering::Relaxed), 0);

        RESETTING.store(false, Ordering::Relaxed);
        SHUTDOWN.store(false, Ordering::Relaxed);
    }
}
