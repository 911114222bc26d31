use std::{
    fs,
    io::Read,
    process::ExitCode,
};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use japl::{RuntimeError, Value, VirtualMachine};
use rustyline::{error::ReadlineError, Editor};

const EOT: char = '\u{4}';

#[derive(Parser)]
#[command(
    name = "japl",
    version,
    disable_version_flag = true,
    about = "The JAPL programming language"
)]
struct Cli {
    /// Script to run; '-' reads standard input up to EOT. Omit to start the REPL.
    file: Option<String>,

    /// Evaluate an inline chunk of source and exit
    #[arg(short = 'c', value_name = "EXPR", conflicts_with = "file")]
    command: Option<String>,

    /// Print version information and exit
    #[arg(short = 'v', long = "version", action = ArgAction::Version)]
    version: Option<bool>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(error) => {
            eprintln!("japl: {:#}", error);
            ExitCode::from(74)
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    if let Some(source) = cli.command {
        return Ok(execute(&source, "<string>"));
    }
    match cli.file.as_deref() {
        Some("-") => {
            let mut input = String::new();
            std::io::stdin()
                .read_to_string(&mut input)
                .context("failed to read standard input")?;
            // Everything past the EOT marker is the script's own stdin
            // channel, owned by the caller.
            let source = input.split(EOT).next().unwrap_or_default().to_string();
            Ok(execute(&source, "<stdin>"))
        }
        Some(file) => {
            let source = fs::read_to_string(file)
                .with_context(|| format!("failed to read file: {}", file))?;
            Ok(execute(&source, file))
        }
        None => {
            repl();
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn execute(source: &str, file: &str) -> ExitCode {
    let mut vm = VirtualMachine::new(file);
    match vm.interpret(source) {
        Ok(()) => ExitCode::SUCCESS,
        // Tracebacks were already printed on the way out.
        Err(error) if error.downcast_ref::<RuntimeError>().is_some() => ExitCode::from(70),
        Err(_) => ExitCode::from(65),
    }
}

fn banner() {
    println!(
        "JAPL {} [{} {}]",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    println!("Type code below; '//clear' wipes the screen, CTRL+D exits.");
}

fn repl() {
    banner();

    let mut rl = Editor::<()>::new();
    let mut vm = VirtualMachine::new("<stdin>");

    loop {
        match rl.readline("=> ") {
            Ok(line) => {
                let trimmed = line.trim_end();
                if trimmed.is_empty() {
                    continue;
                }
                if trimmed == "//clear" {
                    print!("\x1b[2J\x1b[H");
                    banner();
                    continue;
                }
                rl.add_history_entry(trimmed);

                if vm.interpret(&line).is_err() {
                    // Already reported; the prompt comes back with globals
                    // and interned constants intact.
                    continue;
                }
                let result = vm.last_popped();
                if result != Value::Nil {
                    println!("{}", vm.stringify(result));
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(error) => {
                eprintln!("REPL error: {:?}", error);
                break;
            }
        }
    }
}
