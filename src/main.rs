//! ioduel - experiment supervisor entry point

use clap::Parser;
use log::{error, info};

use ioduel::config::SupervisorCli;
use ioduel::supervisor;
use ioduel::util::logging;

fn main() {
    let cli = SupervisorCli::parse();
    if let Err(err) = logging::init(&cli.log_level, cli.log_time_prefix) {
        eprintln!("ERROR: {:#}", err);
        std::process::exit(1);
    }

    info!("ioduel version {}", env!("CARGO_PKG_VERSION"));

    let result = cli
        .validate()
        .and_then(|_| cli.expand())
        .and_then(supervisor::run);

    match result {
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
