//! LuoShu Compiler Backend - CLI

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use luoshu::backends::assembly::Machine;
use luoshu::middle::passes::OptimizerSettings;
use luoshu::unit::{CompilationUnit, Language};
use luoshu::util::logger;
use luoshu::{NAME, VERSION};
use std::path::PathBuf;

/// Backend pipeline for the LuoShu language: IR optimization and
/// stack-machine bytecode assembly
#[derive(Parser, Debug)]
#[command(name = "luoshu")]
#[command(author = "LuoShu Team")]
#[command(version = VERSION)]
#[command(about = NAME, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Assemble an IR object file to bytecode
    Build {
        /// IR source file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Target machine
        #[arg(long, value_enum, default_value = "compact")]
        machine: MachineArg,

        /// Disable the optimizer
        #[arg(long)]
        no_optimize: bool,

        /// Bias the optimizer toward small output
        #[arg(long)]
        small: bool,

        /// Emit the bytecode object as JSON instead of a hex dump
        #[arg(long)]
        emit_json: bool,
    },

    /// Parse, analyze and pretty-print an IR object file
    Print {
        /// IR source file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Print the optimized tree
        #[arg(long)]
        optimize: bool,
    },

    /// Print version information
    Version,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum MachineArg {
    Compact,
    Wide,
}

impl From<MachineArg> for Machine {
    fn from(arg: MachineArg) -> Self {
        match arg {
            MachineArg::Compact => Machine::Compact,
            MachineArg::Wide => Machine::Wide,
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.verbose {
        logger::init_debug();
    } else {
        logger::init();
    }

    match args.command {
        Commands::Build {
            file,
            machine,
            no_optimize,
            small,
            emit_json,
        } => {
            let source = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read source: {}", file.display()))?;
            let settings = if no_optimize {
                OptimizerSettings::none()
            } else if small {
                OptimizerSettings::small()
            } else {
                OptimizerSettings::default()
            };
            let name = file.display().to_string();
            let mut unit = CompilationUnit::new(Language::Ir, settings);
            unit.parse_and_analyze(&name, &source)
                .with_context(|| format!("Failed to compile: {}", name))?;
            unit.optimize()?;
            let assembled = unit.assemble(machine.into())?;
            if emit_json {
                println!("{}", serde_json::to_string_pretty(&assembled.object)?);
            } else {
                eprintln!("{}", assembled.listing);
                println!("{}", assembled.object.to_hex());
            }
        }
        Commands::Print { file, optimize } => {
            let source = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read source: {}", file.display()))?;
            let name = file.display().to_string();
            let settings = if optimize {
                OptimizerSettings::default()
            } else {
                OptimizerSettings::none()
            };
            let mut unit = CompilationUnit::new(Language::Ir, settings);
            unit.parse_and_analyze(&name, &source)
                .with_context(|| format!("Failed to parse: {}", name))?;
            unit.optimize()?;
            print!("{}", unit.print()?);
        }
        Commands::Version => {
            println!("{} {}", NAME, VERSION);
        }
    }

    Ok(())
}
