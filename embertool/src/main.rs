//! `ember` CLI - command-line driver for the ember scripting language.
//!
//! This is the main entry point for the `ember` CLI application. It uses
//! clap for argument parsing and dispatches to `run` (execute a script
//! file) or `repl` (interactive read-eval-print loop) -- the "command-line
//! driver" the core execution engine treats as an external collaborator,
//! talking to it only through `ember_runtime`'s embedding API.

mod commands;
mod error;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use commands::{
    repl::{run_repl, ReplArgs},
    run::{run_script, RunArgs},
};
use error::{EmberToolError, Result};

/// `ember` - run scripts written in the language this workspace compiles
/// and executes.
#[derive(Parser, Debug)]
#[command(name = "ember")]
#[command(author = "Ember Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run or explore ember scripts", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose (debug-level) logging.
    #[arg(short, long, global = true, env = "EMBER_VERBOSE")]
    verbose: bool,

    /// Disable colored log output.
    #[arg(long, global = true, env = "EMBER_NO_COLOR")]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load and run a script file, printing any values it returns.
    Run(RunCommand),

    /// Start an interactive read-eval-print loop.
    Repl,
}

#[derive(Parser, Debug)]
struct RunCommand {
    /// Path to the script to run.
    script: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.no_color)?;

    match cli.command {
        Commands::Run(args) => run_script(RunArgs {
            script: args.script,
            verbose: cli.verbose,
        }),
        Commands::Repl => run_repl(ReplArgs { verbose: cli.verbose }),
    }
}

fn init_logging(verbose: bool, no_color: bool) -> Result<()> {
    let filter = if verbose { EnvFilter::new("debug") } else { EnvFilter::new("info") };

    let subscriber = fmt::layer()
        .with_ansi(!no_color)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(subscriber)
        .try_init()
        .map_err(|e| EmberToolError::Config(format!("failed to initialize logging: {e}")))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_subcommand() {
        let cli = Cli::parse_from(["ember", "run", "script.ember"]);
        match cli.command {
            Commands::Run(args) => assert_eq!(args.script, PathBuf::from("script.ember")),
            _ => panic!("expected Run command"),
        }
    }

    #[test]
    fn parses_repl_subcommand() {
        let cli = Cli::parse_from(["ember", "repl"]);
        assert!(matches!(cli.command, Commands::Repl));
    }

    #[test]
    fn parses_global_verbose() {
        let cli = Cli::parse_from(["ember", "--verbose", "repl"]);
        assert!(cli.verbose);
    }
}
