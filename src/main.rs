#![warn(clippy::all)]

mod compiler;
mod diagnostic;
mod lexer;
mod vm;

use std::io::{self, BufRead, Write};
use std::process::ExitCode;

use diagnostic::{ansi::AnsiRenderer, json, Diagnostic};
use vm::{InterpretError, Vm};

// sysexits-style codes: usage, compile error, runtime error, unreadable file.
const EX_USAGE: u8 = 64;
const EX_DATAERR: u8 = 65;
const EX_SOFTWARE: u8 = 70;
const EX_IOERR: u8 = 74;

#[derive(Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Ansi,
    Text,
    Json,
}

impl OutputMode {
    fn from_flag(arg: &str) -> Option<OutputMode> {
        match arg {
            "--ansi" | "-a" => Some(OutputMode::Ansi),
            "--text" | "-t" => Some(OutputMode::Text),
            "--json" | "-j" => Some(OutputMode::Json),
            _ => None,
        }
    }

    /// Fallback when no flag is given: colour on an interactive stderr
    /// unless NO_COLOR is set, JSON when stderr is redirected. stderr is
    /// the fd that matters here; stdout belongs to the running program.
    fn from_environment() -> OutputMode {
        // isatty never faults: every errno case comes back as "not a tty",
        // which lands us in the machine-readable default.
        let interactive = unsafe { libc::isatty(libc::STDERR_FILENO) } == 1;
        match (interactive, std::env::var_os("NO_COLOR")) {
            (true, None) => OutputMode::Ansi,
            (true, Some(_)) => OutputMode::Text,
            (false, _) => OutputMode::Json,
        }
    }

    fn render(self, d: &Diagnostic) -> String {
        match self {
            OutputMode::Ansi => AnsiRenderer { use_color: true }.render(d),
            OutputMode::Text => AnsiRenderer { use_color: false }.render(d),
            // One object per line so several diagnostics stay parseable.
            OutputMode::Json => format!("{}\n", json::render(d)),
        }
    }
}

/// Strips the output-format flags out of argv, leaving the positional
/// arguments. Giving more than one format flag is a usage error.
fn split_format_flags(args: Vec<String>) -> (OutputMode, Vec<String>) {
    let mut chosen = Vec::new();
    let mut positional = Vec::with_capacity(args.len());
    for arg in args {
        match OutputMode::from_flag(&arg) {
            Some(mode) => chosen.push(mode),
            None => positional.push(arg),
        }
    }
    if chosen.len() > 1 {
        eprintln!("error: pick at most one of --ansi, --text, --json");
        std::process::exit(EX_USAGE as i32);
    }
    let mode = chosen.pop().unwrap_or_else(OutputMode::from_environment);
    (mode, positional)
}

fn report_error(error: &InterpretError, mode: OutputMode) {
    match error {
        InterpretError::Compile(diagnostics) => {
            for d in diagnostics {
                eprint!("{}", mode.render(d));
            }
        }
        InterpretError::Runtime(e) => eprint!("{}", mode.render(&Diagnostic::from(e))),
    }
}

fn repl(mode: OutputMode) -> ExitCode {
    let mut vm = Vm::new();
    let stdin = io::stdin();
    loop {
        print!("> ");
        let _ = io::stdout().flush();
        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        // The session continues after errors of either kind.
        if let Err(e) = vm.interpret(line) {
            report_error(&e, mode);
        }
    }
    ExitCode::SUCCESS
}

fn run_file(path: &str, mode: OutputMode) -> ExitCode {
    let source = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Could not read {path}: {e}");
            return ExitCode::from(EX_IOERR);
        }
    };
    let mut vm = Vm::new();
    match vm.interpret(&source) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e @ InterpretError::Compile(_)) => {
            report_error(&e, mode);
            ExitCode::from(EX_DATAERR)
        }
        Err(e @ InterpretError::Runtime(_)) => {
            report_error(&e, mode);
            ExitCode::from(EX_SOFTWARE)
        }
    }
}

fn main() -> ExitCode {
    let (mode, args) = split_format_flags(std::env::args().collect());

    if args.len() == 2 && (args[1] == "--version" || args[1] == "-V") {
        println!("rill {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    if args.len() == 2 && (args[1] == "--help" || args[1] == "-h") {
        println!("rill — a small scripting language with classes and closures\n");
        println!("Usage:");
        println!("  rill              Start the interactive prompt");
        println!("  rill <path>       Run a script file\n");
        println!("Output format (errors):");
        println!("  --ansi / -a   Force ANSI colour output (default when stderr is a TTY)");
        println!("  --text / -t   Force plain text output (no colour)");
        println!("  --json / -j   Force JSON output (default when stderr is not a TTY)");
        println!("  NO_COLOR=1    Disable colour (same as --text)");
        return ExitCode::SUCCESS;
    }

    match args.len() {
        1 => repl(mode),
        2 => run_file(&args[1], mode),
        _ => {
            eprintln!("Usage: rill [path]");
            ExitCode::from(EX_USAGE)
        }
    }
}
