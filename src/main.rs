// File: src/main.rs
//
// Entry point: the thin REPL/file-runner named out-of-scope by spec.md §1
// ("reads input, passes source text, exits with coded statuses"). Argument
// parsing is direct `std::env::args()`, matching the original's `main.c`
// rather than the teacher's `clap`-based `Cli`/`Commands` -- this CLI's
// entire shape is "zero args → REPL, one arg → run file, more → usage
// error", which doesn't need (or fit) a subcommand parser (see DESIGN.md).

use std::io::Write;
use std::process::ExitCode;

use lumen::repl;
use lumen::vm::{InterpretError, Vm};

const EXIT_OK: u8 = 0;
const EXIT_USAGE: u8 = 64;
const EXIT_COMPILE_ERROR: u8 = 65;
const EXIT_RUNTIME_ERROR: u8 = 70;
const EXIT_IO_ERROR: u8 = 74;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut vm = Vm::new();
    vm.heap.stress_gc = env_flag_set("LUMEN_STRESS_GC");
    vm.heap.log_gc = env_flag_set("LUMEN_LOG_GC");
    vm.trace_execution = env_flag_set("LUMEN_TRACE_EXECUTION");

    match args.len() {
        0 => {
            repl::run(&mut vm);
            ExitCode::from(EXIT_OK)
        }
        1 => ExitCode::from(run_file(&mut vm, &args[0])),
        _ => {
            eprintln!("Usage: lumen [path]");
            ExitCode::from(EXIT_USAGE)
        }
    }
}

fn env_flag_set(name: &str) -> bool {
    std::env::var(name).map(|v| v != "0" && !v.is_empty()).unwrap_or(false)
}

fn run_file(vm: &mut Vm, path: &str) -> u8 {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("Could not read file \"{path}\": {e}");
            return EXIT_IO_ERROR;
        }
    };
    let source = match String::from_utf8(bytes) {
        Ok(s) => s,
        Err(_) => {
            eprintln!("Could not read file \"{path}\": not valid UTF-8.");
            return EXIT_IO_ERROR;
        }
    };
    let source = source.strip_prefix('\u{feff}').unwrap_or(&source);

    match vm.interpret(source) {
        Ok(()) => EXIT_OK,
        Err(InterpretError::Compile(errors)) => {
            for e in &errors {
                eprintln!("{e}");
            }
            EXIT_COMPILE_ERROR
        }
        Err(InterpretError::Runtime(e)) => {
            eprint!("{e}");
            let _ = std::io::stderr().flush();
            EXIT_RUNTIME_ERROR
        }
    }
}
