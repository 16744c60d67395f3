// Quill CLI - Command Line Interface
// Usage: quill [FILE] [OPTIONS]

use clap::Parser;
use colored::*;
use std::fs;
use std::path::{Path, PathBuf};

use quill_core::compiler::{compile, CompileWarning, Program};
use quill_core::lexer::Scanner;
use quill_core::vm::Vm;

/// Quill - an embeddable, class-based scripting language
#[derive(Parser)]
#[command(name = "quill")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "An embeddable, class-based scripting language", long_about = None)]
struct Cli {
    /// Source file to run
    file: Option<PathBuf>,

    /// Debug options: tokens, asm (comma-separated)
    #[arg(short = 'd', long = "debug", value_delimiter = ',')]
    debug: Option<Vec<String>>,

    /// Execute inline code
    #[arg(short = 'e', long = "eval")]
    eval: Option<String>,

    /// Check for errors without running
    #[arg(long = "check")]
    check: bool,
}

fn main() {
    quill_core::init_tracing();
    let cli = Cli::parse();
    let debug = DebugFlags::from_options(&cli.debug);

    let result = if let Some(code) = cli.eval {
        handle_source(&code, "<eval>", &debug, cli.check)
    } else if let Some(path) = cli.file {
        read_source(&path).and_then(|source| {
            let file_name = path.to_string_lossy().to_string();
            handle_source(&source, &file_name, &debug, cli.check)
        })
    } else {
        Err("No input given. Pass a FILE or use -e CODE (see --help)".to_string())
    };

    if let Err(e) = result {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}

#[derive(Default, Clone)]
struct DebugFlags {
    tokens: bool,
    asm: bool,
}

impl DebugFlags {
    fn from_options(opts: &Option<Vec<String>>) -> Self {
        let mut flags = Self::default();
        if let Some(opts) = opts {
            for opt in opts {
                match opt.as_str() {
                    "tokens" => flags.tokens = true,
                    "asm" => flags.asm = true,
                    _ => eprintln!("{} Unknown debug option: {}", "!".yellow(), opt),
                }
            }
        }
        flags
    }
}

fn read_source(path: &Path) -> Result<String, String> {
    fs::read_to_string(path).map_err(|e| format!("Error reading file '{}': {}", path.display(), e))
}

fn handle_source(source: &str, file_name: &str, debug: &DebugFlags, check: bool) -> Result<(), String> {
    if debug.tokens {
        let tokens = Scanner::new(source, file_name)
            .scan_tokens_checked()
            .map_err(|e| e.with_source(source).format())?;
        println!("{}", "-- Tokens --".cyan());
        for token in &tokens {
            println!("  {:?} '{}'", token.kind, token.lexeme);
        }
        println!();
    }

    let Program { function, warnings } = compile(source, file_name).map_err(|e| e.format())?;
    print_warnings(&warnings, file_name);

    if debug.asm {
        print!("{}", function.chunk.disassemble(file_name));
    }

    if check {
        println!("{} No errors found in {}", "✓".green(), file_name);
        return Ok(());
    }

    let mut vm = Vm::new();
    vm.run_compiled(function, source, file_name).map_err(|e| e.format())?;
    Ok(())
}

fn print_warnings(warnings: &[CompileWarning], file_name: &str) {
    for warning in warnings {
        eprintln!(
            "{}: {}\n  {} {}:{}:{}",
            "warning".yellow().bold(),
            warning.message,
            "-->".blue(),
            file_name,
            warning.span.start.line,
            warning.span.start.column
        );
    }
}
