//! sago command-line runner.
//!
//! Commands:
//! - `sago run <file.sgo>` - run a textual SSA program
//! - `sago test <dir>` - run Test* functions of every .sgo file in a dir
//! - `sago dump <file.sgo>` - print the parsed instruction stream

use std::process;
use std::sync::Arc;

use anyhow::{anyhow, Context as _, Result};
use clap::{Parser, Subcommand};

use sago_interp::{Context, Mode};
use sago_ssa::Program;

mod ssa_text;

#[derive(Parser)]
#[command(name = "sago")]
#[command(about = "SSA interpreter for the sago language", long_about = None)]
struct Cli {
    /// Print a trace of instructions as they are interpreted.
    #[arg(long, global = true)]
    trace: bool,

    /// Print the instruction stream before running.
    #[arg(long, global = true)]
    dump_instr: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a textual SSA program; the process exits with the program's
    /// exit code.
    Run {
        /// Path to a .sgo file
        file: String,
        /// Entrypoint function (default: main)
        #[arg(long, default_value = "main")]
        entry: String,
    },

    /// Run all Test* functions of every .sgo file in a directory.
    Test {
        /// Directory containing .sgo files
        dir: String,
    },

    /// Parse a file and print its instruction stream.
    Dump {
        /// Path to a .sgo file
        file: String,
    },
}

fn main() {
    let cli = Cli::parse();
    let mut mode = Mode::NONE;
    if cli.trace {
        mode = mode | Mode::TRACING;
    }
    if cli.dump_instr {
        mode = mode | Mode::DUMP_INSTR;
    }

    let result = match cli.command {
        Commands::Run { file, entry } => cmd_run(mode, &file, &entry),
        Commands::Test { dir } => cmd_test(mode, &dir),
        Commands::Dump { file } => cmd_dump(&file),
    };

    match result {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("error: {:#}", e);
            process::exit(2);
        }
    }
}

fn load_program(ctx: &Arc<Context>, file: &str) -> Result<Arc<Program>> {
    let src = std::fs::read_to_string(file).with_context(|| format!("reading {}", file))?;
    let prog = ssa_text::parse_text(ctx.type_store(), &src)
        .map_err(|e| anyhow!("{}: {}", file, e))?;
    Ok(Arc::new(prog))
}

fn cmd_run(mode: Mode, file: &str, entry: &str) -> Result<i32> {
    let ctx = Context::new(mode);
    let prog = load_program(&ctx, file)?;
    let (code, err) = ctx.run_program(&prog, entry);
    if let Some(err) = err {
        eprintln!("{}", err);
    }
    Ok(code)
}

fn cmd_test(mode: Mode, dir: &str) -> Result<i32> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("reading {}", dir))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map_or(false, |ext| ext == "sgo"))
        .collect();
    entries.sort();

    if entries.is_empty() {
        println!("?\t{} [no .sgo files]", dir);
        return Ok(0);
    }

    let mut failed = 0;
    for path in &entries {
        let name = path.display().to_string();
        let ctx = Context::new(mode);
        let prog = match load_program(&ctx, &name) {
            Ok(p) => p,
            Err(e) => {
                println!("FAIL\t{} [parse error: {:#}]", name, e);
                failed += 1;
                continue;
            }
        };
        if ctx.test_program(&prog, &name).is_err() {
            failed += 1;
        }
    }

    if failed > 0 {
        Err(anyhow!("{} of {} files failed", failed, entries.len()))
    } else {
        Ok(0)
    }
}

fn cmd_dump(file: &str) -> Result<i32> {
    let ctx = Context::new(Mode::NONE);
    let prog = load_program(&ctx, file)?;
    let mut out = Vec::new();
    prog.dump_instrs(&mut out)?;
    print!("{}", String::from_utf8_lossy(&out));
    Ok(0)
}
