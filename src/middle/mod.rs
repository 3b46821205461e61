//! Intermediate representation and code generation
//!
//! This layer lowers the typed AST into the stack-machine IR, optimizes
//! the IR tree in place, and hands the result to the backends for item
//! lowering and assembly.

pub mod analysis;
pub mod codegen;
pub mod ir;
pub mod passes;
