//! `ember run <script>`: loads and executes a script file, printing any
//! values it returns.

use std::path::PathBuf;

use ember_runtime::api::MULTRET;
use ember_runtime::State;

use crate::error::{EmberToolError, Result};

pub struct RunArgs {
    pub script: PathBuf,
    pub verbose: bool,
}

pub fn run_script(args: RunArgs) -> Result<()> {
    let source = std::fs::read_to_string(&args.script)?;
    let chunk_name = args
        .script
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "?".to_string());

    let state = State::open();
    state
        .load(&source, &chunk_name)
        .map_err(|e| EmberToolError::Script(e.to_string()))?;

    if args.verbose {
        tracing::debug!(chunk = %chunk_name, "loaded chunk, invoking");
    }

    state
        .call(0, MULTRET)
        .map_err(|e| EmberToolError::Script(e.to_string()))?;

    for i in 1..=state.top() {
        println!("{}", state.describe(i));
    }
    Ok(())
}
