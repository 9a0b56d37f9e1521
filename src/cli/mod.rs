use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use runcell_config::ConfigManager;

pub mod config;
pub mod replay;
pub mod run;

#[derive(Debug, Parser)]
#[command(name = "runcell")]
#[command(about = "Run model-written code in a sandboxed worker and feed the results back")]
#[command(version)]
pub struct Cli {
    /// Configuration file to use instead of the layered lookup
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Directory searched for `runcell.toml` (defaults to the current directory)
    #[arg(long, global = true, value_name = "DIR")]
    pub workspace: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Execute a file, or stdin, in a fresh sandbox
    Run(RunOptions),
    /// Feed a saved transcript through the auto-run loop once
    Replay(ReplayOptions),
    /// Print the effective configuration as TOML
    Config,
}

#[derive(Debug, Args)]
pub struct RunOptions {
    /// Source file to execute; `-` or omitted reads stdin
    pub file: Option<String>,

    /// Host file copied into the sandbox before the run (repeatable)
    #[arg(short, long = "mount", value_name = "PATH")]
    pub mounts: Vec<PathBuf>,

    /// Write generated files into this directory
    #[arg(long, value_name = "DIR")]
    pub save_files: Option<PathBuf>,

    /// Print the execution result as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct ReplayOptions {
    /// JSON array of chat messages
    pub transcript: PathBuf,

    /// Write the updated transcript here
    #[arg(short, long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Print the last message as JSON instead of its content
    #[arg(long)]
    pub json: bool,
}

pub fn resolve_workspace(workspace: Option<&Path>) -> Result<PathBuf> {
    match workspace {
        Some(path) => Ok(path.to_path_buf()),
        None => std::env::current_dir().context("failed to resolve current directory"),
    }
}

pub fn load_config(explicit: Option<&Path>, workspace: &Path) -> Result<ConfigManager> {
    match explicit {
        Some(path) => ConfigManager::load_from_file(path),
        None => ConfigManager::load(workspace),
    }
}
