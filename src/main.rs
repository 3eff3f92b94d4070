mod chunk;
mod cli_reporter;
mod compiler;
mod heap;
mod natives;
mod reporter;
mod token;
mod tokenizer;
mod value;
mod vm;

use cli_reporter::CliReporter;
use rustyline::Editor;
use std::{env, fs, process};
use vm::{InterpretError, Vm};

fn main() {
    let args: Vec<String> = env::args().collect();
    match args.len() {
        1 => run_repl(),
        2 => run_file(&args[1]),
        _ => {
            eprintln!("Usage: lox [script]");
            process::exit(exitcode::USAGE);
        }
    }
}

fn run_repl() {
    let mut vm = Vm::new();
    let mut reporter = CliReporter::new();
    let mut rl = Editor::<()>::new();
    loop {
        match rl.readline("> ") {
            Ok(line) => {
                rl.add_history_entry(&line);
                // errors were already reported; the session continues
                vm.interpret(&line, &mut reporter).ok();
            }
            Err(_) => break,
        }
    }
}

fn run_file(path: &str) -> ! {
    let source = fs::read_to_string(path).unwrap_or_else(|err| {
        eprintln!("Could not read {}: {}", path, err);
        process::exit(exitcode::IOERR);
    });

    let mut vm = Vm::new();
    let mut reporter = CliReporter::new();
    match vm.interpret(&source, &mut reporter) {
        Ok(()) => process::exit(exitcode::OK),
        Err(InterpretError::Compile) => process::exit(exitcode::DATAERR),
        Err(InterpretError::Runtime) => process::exit(exitcode::SOFTWARE),
    }
}
