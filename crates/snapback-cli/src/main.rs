mod attempt;
mod cleanup;
mod config;
mod dispatch;
mod logging;
mod orchestrator;
mod render;

use anyhow::Result;
use clap::Parser;

use crate::dispatch::{run_cli, Cli};
use crate::logging::init_logging;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.debuglog.as_deref())?;
    run_cli(cli)
}
