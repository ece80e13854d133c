//! Command-line driver: source file in, ASTC bytecode container out.
//!
//! Calls the parser, emitter, and serializer in that order with no
//! additional semantics of its own — everything that can go wrong maps to
//! one of the four non-zero exit codes below.

use clap::Parser;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

const EXIT_SUCCESS: u8 = 0;
const EXIT_USAGE: u8 = 1;
const EXIT_PARSE_ERROR: u8 = 2;
const EXIT_EMIT_ERROR: u8 = 3;
const EXIT_IO_ERROR: u8 = 4;

#[derive(Parser)]
#[command(name = "astcc", about = "Compiles a C99 subset to ASTC bytecode")]
struct Args {
    #[arg(short, long)]
    input: PathBuf,
    #[arg(short, long)]
    output: PathBuf,
    #[arg(long)]
    fold_constants: bool,
    #[arg(long)]
    eliminate_dead_code: bool,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(EXIT_USAGE);
        }
    };
    run(args)
}

fn run(args: Args) -> ExitCode {
    let source = match fs::read(&args.input) {
        Ok(bytes) => bytes,
        Err(e) => {
            log::error!("failed to read {}: {e}", args.input.display());
            return ExitCode::from(EXIT_IO_ERROR);
        }
    };

    let unit = match astc_parser::parse(&source) {
        Ok(unit) => unit,
        Err(e) => {
            log::error!("parse error: {e}");
            return ExitCode::from(EXIT_PARSE_ERROR);
        }
    };

    let opts = astc_emit::EmitOptions {
        fold_constants: args.fold_constants,
        eliminate_dead_code: args.eliminate_dead_code,
    };
    let program = match astc_emit::emit_program(&unit, opts) {
        Ok(program) => program,
        Err(e) => {
            log::error!("emission error: {e}");
            return ExitCode::from(EXIT_EMIT_ERROR);
        }
    };

    let mut buf = Vec::new();
    if let Err(e) = astc_format::write_program(&mut buf, &program) {
        log::error!("failed to serialize ASTC program: {e}");
        return ExitCode::from(EXIT_EMIT_ERROR);
    }

    if let Err(e) = fs::write(&args.output, &buf) {
        log::error!("failed to write {}: {e}", args.output.display());
        return ExitCode::from(EXIT_IO_ERROR);
    }

    log::info!("wrote {} ({} instructions) to {}", args.input.display(), program.instructions.len(), args.output.display());
    ExitCode::from(EXIT_SUCCESS)
}
