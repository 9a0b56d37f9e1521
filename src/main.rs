//! runcell - run model-written code in a sandboxed worker.
//!
//! Thin binary entry point that delegates to the handlers in `cli`.

use anyhow::Result;
use clap::Parser;

mod cli;
mod main_helpers;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let workspace = cli::resolve_workspace(args.workspace.as_deref())?;
    let manager = cli::load_config(args.config.as_deref(), &workspace)?;
    main_helpers::initialize_tracing(&manager.config().logging);

    match args.command {
        Commands::Run(options) => {
            cli::run::handle_run_command(manager.into_config(), options).await
        }
        Commands::Replay(options) => {
            cli::replay::handle_replay_command(manager.into_config(), options).await
        }
        Commands::Config => cli::config::handle_config_command(&manager),
    }
}
