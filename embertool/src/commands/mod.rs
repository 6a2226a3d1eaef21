//! Command modules for the `ember` CLI.
//!
//! This module contains implementations for all available subcommands.
//! Each subcommand is implemented in its own file following a standardized pattern.

pub mod repl;
pub mod run;

#[allow(unused_imports)]
pub use repl::{run_repl, ReplArgs};
#[allow(unused_imports)]
pub use run::{run_script, RunArgs};
