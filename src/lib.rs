//! LuoShu (洛书) Compiler Backend
//!
//! The backend pipeline of the LuoShu language: lowers a typed,
//! inheritance-resolved AST into a stack-machine intermediate
//! representation, optimizes the IR through fixpoint tree-rewrite passes,
//! and assembles it into a relocatable bytecode object with symbolic jump
//! targets resolved to concrete offsets.
//!
//! # Example
//!
//! ```no_run
//! use luoshu::backends::assembly::Machine;
//! use luoshu::middle::passes::OptimizerSettings;
//! use luoshu::unit::{CompilationUnit, Language};
//!
//! let mut unit = CompilationUnit::new(Language::Ir, OptimizerSettings::default());
//! unit.parse_and_analyze("demo", "{ mstore(0, add(1, 2)) }").unwrap();
//! unit.optimize().unwrap();
//! let assembled = unit.assemble(Machine::Compact).unwrap();
//! println!("{}", assembled.object.to_hex());
//! ```

#![warn(rust_2018_idioms)]

pub mod backends;
pub mod error;
pub mod frontend;
pub mod middle;
pub mod unit;
pub mod util;

pub use error::{CoreError, Result};

/// Language version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Project name
pub const NAME: &str = "LuoShu (洛书)";

use backends::assembly::Machine;
use middle::passes::OptimizerSettings;
use unit::MachineAssemblyObject;

/// Compile a typed class through the whole pipeline
///
/// Generation, the re-parse self-check, optimization and assembly in one
/// call; returns the generated IR text and the assembled object.
pub fn compile_class(
    class: &frontend::ast::ClassDefinition,
    hierarchy: Vec<&frontend::ast::ClassDefinition>,
    settings: OptimizerSettings,
    machine: Machine,
) -> Result<(String, MachineAssemblyObject)> {
    let generator = middle::codegen::IrGenerator::new(class, hierarchy, settings);
    let (text, unit) = generator.run()?;
    let assembled = unit.assemble(machine)?;
    Ok((text, assembled))
}

/// Compile textual IR source into a bytecode object
pub fn compile_source(
    source_name: &str,
    source: &str,
    settings: OptimizerSettings,
    machine: Machine,
) -> Result<MachineAssemblyObject> {
    let mut unit = unit::CompilationUnit::new(unit::Language::Ir, settings);
    unit.parse_and_analyze(source_name, source)?;
    unit.optimize()?;
    unit.assemble(machine)
}
