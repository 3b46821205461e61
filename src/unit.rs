//! Compilation-unit state machine
//!
//! `Unparsed → Parsed → Analyzed → Optimized (optional) → assemble`.
//! Re-entering [`CompilationUnit::parse_and_analyze`] discards all prior
//! state. [`CompilationUnit::assemble`] is pure with respect to stored
//! state and may be invoked repeatedly for different target machines.

use crate::backends::assembly::{Assembly, BytecodeObject, Machine};
use crate::backends::item::AssemblyItem;
use crate::backends::object::{Object, ObjectCompiler, ObjectNode};
use crate::error::{CoreError, Result};
use crate::middle::analysis::analyze_object;
use crate::middle::ir::parser::parse_object;
use crate::middle::passes::{run_suite, OptimizerSettings};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

/// Input flavor of a compilation unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    /// IR surface syntax, parsed and analyzed from text
    #[default]
    Ir,
    /// Raw item input, constructed via [`CompilationUnit::from_items`]
    Items,
}

/// Pipeline position of a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Unparsed,
    Parsed,
    Analyzed,
    Optimized,
}

/// Result of assembling a unit for one target machine
#[derive(Debug)]
pub struct MachineAssemblyObject {
    pub object: BytecodeObject,
    /// Human-readable item listing
    pub listing: String,
}

pub struct CompilationUnit {
    language: Language,
    settings: OptimizerSettings,
    state: UnitState,
    source_name: String,
    object: Option<Object>,
    raw_items: Option<Vec<AssemblyItem>>,
}

impl CompilationUnit {
    pub fn new(language: Language, settings: OptimizerSettings) -> Self {
        Self {
            language,
            settings,
            state: UnitState::Unparsed,
            source_name: String::new(),
            object: None,
            raw_items: None,
        }
    }

    /// Unit built directly from a lowered item list; starts analyzed.
    pub fn from_items(items: Vec<AssemblyItem>) -> Self {
        Self {
            language: Language::Items,
            settings: OptimizerSettings::none(),
            state: UnitState::Analyzed,
            source_name: String::new(),
            object: None,
            raw_items: Some(items),
        }
    }

    pub fn state(&self) -> UnitState {
        self.state
    }

    pub fn language(&self) -> Language {
        self.language
    }

    /// Parse and analyze textual IR input, discarding all prior state
    pub fn parse_and_analyze(&mut self, source_name: &str, source: &str) -> Result<()> {
        if self.language != Language::Ir {
            return Err(CoreError::internal(
                "textual input on a raw-item compilation unit",
            ));
        }
        // Full reset, not incremental.
        self.state = UnitState::Unparsed;
        self.object = None;
        self.source_name = source_name.to_string();

        let object = parse_object(source)?;
        self.object = Some(object);
        self.state = UnitState::Parsed;

        analyze_object(self.object.as_ref().expect("object just parsed"))?;
        self.state = UnitState::Analyzed;
        debug!(source = source_name, "unit parsed and analyzed");
        Ok(())
    }

    /// Optimize the tree in place; a no-op unless the unit is analyzed and
    /// the optimizer is configured on. Must precede `assemble` when
    /// requested.
    pub fn optimize(&mut self) -> Result<()> {
        if self.state != UnitState::Analyzed || !self.settings.run_optimizer {
            return Ok(());
        }
        let object = self
            .object
            .as_mut()
            .ok_or_else(|| CoreError::internal("optimize without a parsed object"))?;
        optimize_object(object, &self.settings)?;
        analyze_object(self.object.as_ref().expect("object present")).map_err(|error| {
            CoreError::internal(format!("invalid IR after optimization: {}", error))
        })?;
        self.state = UnitState::Optimized;
        Ok(())
    }

    /// Produce a fresh bytecode object for the given target
    pub fn assemble(&self, machine: Machine) -> Result<MachineAssemblyObject> {
        let assembly = match self.language {
            Language::Items => {
                let items = self
                    .raw_items
                    .as_ref()
                    .ok_or_else(|| CoreError::internal("raw-item unit without items"))?;
                Assembly::from_items(items.clone())
            }
            Language::Ir => {
                if self.state != UnitState::Analyzed && self.state != UnitState::Optimized {
                    return Err(CoreError::internal(
                        "assemble called before successful analysis",
                    ));
                }
                if self.settings.run_optimizer && self.state != UnitState::Optimized {
                    return Err(CoreError::internal(
                        "optimization is configured on but was not run before assembly",
                    ));
                }
                let object = self
                    .object
                    .as_ref()
                    .ok_or_else(|| CoreError::internal("assemble without a parsed object"))?;
                ObjectCompiler::compile(object)?
            }
        };
        let listing = assembly.assembly_string();
        let object = assembly.assemble(machine)?;
        debug!(
            bytes = object.bytecode.len(),
            machine = ?machine,
            "unit assembled"
        );
        Ok(MachineAssemblyObject { object, listing })
    }

    /// Re-parseable textual rendering of the current tree
    pub fn print(&self) -> Result<String> {
        let object = self
            .object
            .as_ref()
            .ok_or_else(|| CoreError::internal("print without a parsed object"))?;
        Ok(format!("{}\n", object))
    }

    /// The parsed object tree; only available after successful analysis
    pub fn parser_result(&self) -> Result<&Object> {
        if self.state != UnitState::Analyzed && self.state != UnitState::Optimized {
            return Err(CoreError::internal("parser result before analysis"));
        }
        self.object
            .as_ref()
            .ok_or_else(|| CoreError::internal("parser result without a parsed object"))
    }
}

/// Optimize every code block in the object tree, innermost objects first
fn optimize_object(object: &mut Object, settings: &OptimizerSettings) -> Result<()> {
    for node in &mut object.subobjects {
        if let ObjectNode::Object(sub) = node {
            optimize_object(sub, settings)?;
        }
    }
    run_suite(&mut object.code, settings, &HashSet::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::opcode::Opcode;
    use primitive_types::U256;

    const SAMPLE: &str = "object \"unit\" { code { \
        let r := wrap(5) mstore(0, r) \
        function wrap(x) -> y { y := add(x, 1) } } }";

    #[test]
    fn test_state_progression() {
        let mut unit = CompilationUnit::new(Language::Ir, OptimizerSettings::default());
        assert_eq!(unit.state(), UnitState::Unparsed);
        unit.parse_and_analyze("test", SAMPLE).unwrap();
        assert_eq!(unit.state(), UnitState::Analyzed);
        unit.optimize().unwrap();
        assert_eq!(unit.state(), UnitState::Optimized);
        let first = unit.assemble(Machine::Compact).unwrap();
        let second = unit.assemble(Machine::Wide).unwrap();
        assert!(!first.object.bytecode.is_empty());
        assert!(second.object.bytecode.len() >= first.object.bytecode.len());
    }

    #[test]
    fn test_reparse_resets_state() {
        let mut unit = CompilationUnit::new(Language::Ir, OptimizerSettings::default());
        unit.parse_and_analyze("test", SAMPLE).unwrap();
        unit.optimize().unwrap();
        unit.parse_and_analyze("test", "{ mstore(0, 1) }").unwrap();
        assert_eq!(unit.state(), UnitState::Analyzed);
        assert!(unit.print().unwrap().contains("mstore(0, 1)"));
    }

    #[test]
    fn test_assemble_requires_configured_optimization() {
        let mut unit = CompilationUnit::new(Language::Ir, OptimizerSettings::default());
        unit.parse_and_analyze("test", SAMPLE).unwrap();
        // optimizer configured on but not run
        assert!(unit.assemble(Machine::Compact).is_err());
    }

    #[test]
    fn test_optimize_is_noop_when_disabled() {
        let mut unit = CompilationUnit::new(Language::Ir, OptimizerSettings::none());
        unit.parse_and_analyze("test", SAMPLE).unwrap();
        unit.optimize().unwrap();
        assert_eq!(unit.state(), UnitState::Analyzed);
        unit.assemble(Machine::Compact).unwrap();
    }

    #[test]
    fn test_analysis_failure_keeps_parsed_state() {
        let mut unit = CompilationUnit::new(Language::Ir, OptimizerSettings::default());
        let result = unit.parse_and_analyze("test", "{ mstore(0, undeclared) }");
        assert!(result.is_err());
        assert_eq!(unit.state(), UnitState::Parsed);
    }

    #[test]
    fn test_raw_item_unit() {
        let items = vec![
            AssemblyItem::push(U256::from(1)),
            AssemblyItem::push(U256::zero()),
            AssemblyItem::operation(Opcode::MStore),
            AssemblyItem::operation(Opcode::Stop),
        ];
        let unit = CompilationUnit::from_items(items);
        let assembled = unit.assemble(Machine::Compact).unwrap();
        assert_eq!(
            assembled.object.bytecode,
            vec![
                Opcode::Push1 as u8,
                1,
                Opcode::Push1 as u8,
                0,
                Opcode::MStore as u8,
                Opcode::Stop as u8
            ]
        );
    }

    #[test]
    fn test_text_input_on_item_unit_is_error() {
        let mut unit = CompilationUnit::from_items(vec![AssemblyItem::operation(Opcode::Stop)]);
        assert!(unit.parse_and_analyze("test", "{ }").is_err());
    }
}
