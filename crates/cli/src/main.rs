//! Yan driver
//!
//! `yan run 脚本.yan` executes a file, `yan disasm 脚本.yan` prints its
//! bytecode, and a bare `yan` starts the REPL. Exit codes follow the
//! usual scripting convention: 65 for compile errors, 70 for runtime
//! errors, 74 when the input file cannot be read.

use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser as ClapParser, Subcommand};
use tracing_subscriber::EnvFilter;
use yan_core::{Heap, Obj, Value};
use yan_runtime::{InterpretResult, Vm};

mod config;
mod repl;

use config::Config;

const EXIT_COMPILE_ERROR: i32 = 65;
const EXIT_RUNTIME_ERROR: i32 = 70;
const EXIT_IO_ERROR: i32 = 74;

#[derive(ClapParser)]
#[command(name = "yan")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Yan（言）语言解释器", long_about = None)]
struct Cli {
    /// Interpreter configuration file (defaults to ./yan.toml if present)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a Yan source file
    Run {
        /// Input source file
        file: PathBuf,
    },

    /// Disassemble the bytecode compiled from a source file
    Disasm {
        /// Input source file
        file: PathBuf,
    },

    /// Start the interactive REPL (also the default with no subcommand)
    Repl,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(message) => {
            eprintln!("{message}");
            process::exit(EXIT_IO_ERROR);
        }
    };

    match cli.command {
        Some(Commands::Run { file }) => run_file(&file, &config),
        Some(Commands::Disasm { file }) => disassemble_file(&file),
        Some(Commands::Repl) | None => {
            let mut vm = Vm::with_options(config.vm_options());
            if let Err(message) = repl::run(&mut vm) {
                eprintln!("{message}");
                process::exit(EXIT_IO_ERROR);
            }
        }
    }
}

fn load_config(explicit: Option<&Path>) -> Result<Config, String> {
    if let Some(path) = explicit {
        return Config::load(path);
    }
    let implicit = Path::new("yan.toml");
    if implicit.exists() {
        Config::load(implicit)
    } else {
        Ok(Config::default())
    }
}

fn read_source(file: &Path) -> String {
    match std::fs::read_to_string(file) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("无法读取文件 {}：{e}", file.display());
            process::exit(EXIT_IO_ERROR);
        }
    }
}

fn run_file(file: &Path, config: &Config) {
    let source = read_source(file);
    let mut vm = Vm::with_options(config.vm_options());
    match vm.interpret(&source) {
        InterpretResult::Ok => {}
        InterpretResult::CompileError => process::exit(EXIT_COMPILE_ERROR),
        InterpretResult::RuntimeError => process::exit(EXIT_RUNTIME_ERROR),
    }
}

/// Compile without running and print every chunk, the script first and
/// each named function after it.
fn disassemble_file(file: &Path) {
    let source = read_source(file);
    let mut heap = Heap::new();
    let script = match yan_compiler::compile(&source, &mut heap) {
        Ok(function) => function,
        Err(message) => {
            eprintln!("{message}");
            process::exit(EXIT_COMPILE_ERROR);
        }
    };

    let mut pending = vec![script];
    let mut seen = std::collections::HashSet::new();
    while let Some(function_ref) = pending.pop() {
        if !seen.insert(function_ref) {
            continue;
        }
        let function = heap.function(function_ref);
        let name = match function.name {
            Some(name) => heap.string(name).to_text(),
            None => "脚本".to_string(),
        };
        print!("{}", yan_runtime::debug::disassemble_chunk(&heap, &function.chunk, &name));
        println!();
        for &constant in &function.chunk.constants {
            if let Value::Obj(r) = constant {
                if let Obj::Function(_) = heap.get(r) {
                    pending.push(r);
                }
            }
        }
    }
}
