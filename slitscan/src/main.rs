use std::thread;

use anyhow::Context;
use clap::Parser;
use signal_hook::{consts, iterator::Signals};

use slitscan::{Cli, Engine};

/// Mirrors `shadow::core::main::run_shadow`'s top-level shape: install
/// signal handling, parse the CLI into a resolved configuration, start the
/// logger, then hand off to the engine. Any failure is printed and turns
/// into a non-zero exit (§6: "`0` is not defined... `≠0` on any
/// non-recoverable exception").
fn main() -> anyhow::Result<()> {
    let mut signals =
        Signals::new([consts::SIGINT, consts::SIGTERM]).context("installing signal handlers")?;
    thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            log::info!("received signal {signal}, flushing log and exiting");
            log::logger().flush();
            std::process::exit(1);
        }
    });

    let cli = Cli::parse();
    let config = cli
        .into_engine_config()
        .context("resolving configuration")?;

    slitscan_logger::init(&config.log_file, config.log_level).context("initializing logger")?;

    let mut engine = Engine::new(config).context("starting engine")?;
    engine.run()
}
