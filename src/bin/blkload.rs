//! blkload - raw block I/O load generator
//!
//! One long-lived process per workload instance. The engine controller
//! drives the selected I/O engine against the workload file, the reporter
//! emits one STATS line per interval, and the command surface (stdin,
//! socket, `--command_script`) mutates parameters while the run is going.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::{error, info, warn};

use ioduel::config::{parse_command_script, LoadCli, ScriptCommand};
use ioduel::control::{CommandHandler, CommandReader};
use ioduel::engine::EngineController;
use ioduel::report::{Reporter, ReportShift};
use ioduel::util::logging;
use ioduel::util::time::Clock;
use ioduel::Result;

/// Signals only raise this flag; teardown happens on the main thread.
static SIGNAL_RECEIVED: AtomicUsize = AtomicUsize::new(0);

extern "C" fn signal_handler(signal: libc::c_int) {
    SIGNAL_RECEIVED.store(signal as usize, Ordering::Relaxed);
}

fn install_signal_handlers() {
    let handler = signal_handler as extern "C" fn(libc::c_int) as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGTERM, handler);
        libc::signal(libc::SIGINT, handler);
    }
}

fn main() {
    let cli = LoadCli::parse();
    if let Err(err) = logging::init(&cli.log_level, cli.log_time_prefix) {
        eprintln!("ERROR: {:#}", err);
        std::process::exit(1);
    }

    info!("initiating blkload version {}", env!("CARGO_PKG_VERSION"));
    install_signal_handlers();

    match run(cli) {
        Ok(()) => {
            info!("exit(0)");
        }
        Err(err) => {
            error!("{:#}", err);
            info!("exit(1)");
            std::process::exit(1);
        }
    }
}

fn run(cli: LoadCli) -> Result<()> {
    cli.validate()?;
    info!("parameters: {}", cli.summary());

    let params = cli.to_params();
    let mut script = parse_command_script(&cli.command_script)?;

    let stop = Arc::new(AtomicBool::new(false));
    let shift = Arc::new(ReportShift::new());

    let controller = EngineController::new(params.clone())
        .context("failed to initialize the engine controller")?;

    let handler = Arc::new(CommandHandler::new(
        params.clone(),
        shift.clone(),
        stop.clone(),
    ));
    let socket = if cli.socket.is_empty() {
        None
    } else {
        Some(cli.socket.clone())
    };
    let reader = CommandReader::new(handler.clone(), socket)?;

    let reporter = Reporter::spawn(
        params.clone(),
        controller.stats(),
        shift.clone(),
        stop.clone(),
    )?;

    let execution_clock = Clock::new();
    let result = main_loop(
        &cli,
        &execution_clock,
        &mut script,
        &handler,
        &controller,
        &reader,
        &reporter,
        &stop,
    );

    stop.store(true, Ordering::Relaxed);
    reader.stop();
    controller.stop();
    reporter.finish();

    result
}

#[allow(clippy::too_many_arguments)]
fn main_loop(
    cli: &LoadCli,
    clock: &Clock,
    script: &mut VecDeque<ScriptCommand>,
    handler: &Arc<CommandHandler>,
    controller: &EngineController,
    reader: &CommandReader,
    reporter: &Reporter,
    stop: &Arc<AtomicBool>,
) -> Result<()> {
    while controller.is_active()? && reader.is_active() && !stop.load(Ordering::Relaxed) {
        let signal = SIGNAL_RECEIVED.load(Ordering::Relaxed);
        if signal != 0 {
            warn!("received signal {}", signal);
            break;
        }

        let cur_s = clock.s();
        while let Some(entry) = script.front() {
            if entry.time_s >= cur_s {
                break;
            }
            let entry = script.pop_front().expect("front checked");
            info!(
                "command_script time={}, command: {}",
                entry.time_s, entry.command
            );
            if entry.command == "stop" {
                stop.store(true, Ordering::Relaxed);
                break;
            }
            match handler.handle(&entry.command) {
                Ok(reply) => info!("{}", reply),
                Err(err) => error!("{:#}", err),
            }
        }
        if stop.load(Ordering::Relaxed) {
            break;
        }

        if cli.duration > 0 && clock.s() > cli.duration as u64 {
            info!("duration time exceeded: {} seconds", cli.duration);
            break;
        }

        reporter.check()?;

        thread::sleep(Duration::from_millis(500));
    }
    Ok(())
}
