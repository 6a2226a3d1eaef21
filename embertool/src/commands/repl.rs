//! `ember repl`: a line-at-a-time read-eval-print loop over a single
//! persistent `State`, so globals and top-level locals set by one line
//! stay visible to the next -- each line is compiled as its own chunk and
//! run with `pcall` so a runtime error doesn't end the session.

use std::io::Write;

use ember_runtime::api::MULTRET;
use ember_runtime::State;

use crate::error::Result;

pub struct ReplArgs {
    pub verbose: bool,
}

pub fn run_repl(args: ReplArgs) -> Result<()> {
    let state = State::open();
    let mut chunk_count: u32 = 0;
    let stdin = std::io::stdin();

    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            println!();
            return Ok(());
        }
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }

        chunk_count += 1;
        let chunk_name = format!("=stdin:{chunk_count}");

        // Try it as an expression first, the way an interactive Lua
        // prompt does -- most REPL input is "what's this worth", not a
        // statement.
        let as_expression = format!("return {line}");
        if state.load(&as_expression, &chunk_name).is_err() {
            if let Err(e) = state.load(line, &chunk_name) {
                eprintln!("{e}");
                continue;
            }
        }

        if args.verbose {
            tracing::debug!(chunk = %chunk_name, "evaluating REPL input");
        }

        let before = state.top() - 1; // the pushed chunk closure itself
        match state.pcall(0, MULTRET, 0) {
            0 => {
                for i in before + 1..=state.top() {
                    println!("{}", state.describe(i));
                }
                state.settop(before);
            }
            _ => {
                eprintln!("{}", state.describe(-1));
                state.pop(1);
            }
        }
    }
}
