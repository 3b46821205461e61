//! Unused-code pruning pass
//!
//! Deletes function definitions with zero references, declarations whose
//! names are all unreferenced (keeping a `pop(...)` of a non-movable
//! initializer), and expression statements whose expression is entirely
//! movable. Deleting one definition can make another dead, so the pass
//! iterates to a fixpoint; reference counts only ever decrease, and a
//! safety cap guards against accounting bugs.
//!
//! Note that circular references between dead functions are not removed.
//!
//! Prerequisite: globally unique names.

use crate::error::{CoreError, Result};
use crate::middle::ir::*;
use crate::middle::passes::names::{count_references, count_references_in_expression};
use crate::middle::passes::semantics::is_movable;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Fixpoint iteration cap; reference counts are monotone, so hitting this
/// means the accounting is broken.
const MAX_ROUNDS: usize = 4096;

pub struct UnusedPruner {
    references: HashMap<String, usize>,
    should_run_again: bool,
}

impl UnusedPruner {
    /// Run the pruner until the tree stops changing; returns whether any
    /// round changed it.
    pub fn run_until_stabilized(
        block: &mut Block,
        externally_used: &HashSet<String>,
    ) -> Result<bool> {
        let mut changed = false;
        for _ in 0..MAX_ROUNDS {
            let mut pruner = UnusedPruner::new(block, externally_used);
            pruner.visit_block(block)?;
            if !pruner.should_run_again {
                return Ok(changed);
            }
            changed = true;
        }
        Err(CoreError::internal("unused pruner failed to stabilize"))
    }

    fn new(block: &Block, externally_used: &HashSet<String>) -> Self {
        let mut references = count_references(block);
        for name in externally_used {
            *references.entry(name.clone()).or_default() += 1;
        }
        Self {
            references,
            should_run_again: false,
        }
    }

    fn visit_block(&mut self, block: &mut Block) -> Result<()> {
        for statement in &mut block.statements {
            match statement {
                Statement::FunctionDefinition(function) => {
                    if !self.used(&function.name) {
                        debug!(function = %function.name, "pruning unused function");
                        self.subtract_references(&count_references(&function.body))?;
                        *statement = empty_block(function.span);
                    }
                }
                Statement::VariableDeclaration(decl) => {
                    // Removable only if every declared name is unused and
                    // the initializer either does not exist, is movable, or
                    // can be downgraded to a discarded call.
                    if decl.variables.iter().any(|v| self.used(&v.name)) {
                        continue;
                    }
                    match &decl.value {
                        None => *statement = empty_block(decl.span),
                        Some(value) if is_movable(value) => {
                            self.subtract_references(&count_references_in_expression(value))?;
                            *statement = empty_block(decl.span);
                        }
                        Some(_) if decl.variables.len() == 1 => {
                            // Keep the side effect, discard the result.
                            let span = decl.span;
                            let value = decl.value.take().expect("initializer present");
                            *statement = Statement::Expression(ExpressionStatement {
                                span,
                                expression: Expression::builtin(
                                    crate::backends::opcode::Opcode::Pop,
                                    vec![value],
                                ),
                            });
                        }
                        Some(_) => {}
                    }
                }
                Statement::Expression(expr_statement) => {
                    if is_movable(&expr_statement.expression) {
                        self.subtract_references(&count_references_in_expression(
                            &expr_statement.expression,
                        ))?;
                        *statement = empty_block(expr_statement.span);
                    }
                }
                _ => {}
            }
        }

        remove_empty_blocks(block);

        // Recurse after this level's replacements.
        for statement in &mut block.statements {
            match statement {
                Statement::FunctionDefinition(s) => self.visit_block(&mut s.body)?,
                Statement::If(s) => self.visit_block(&mut s.body)?,
                Statement::Switch(s) => {
                    for case in &mut s.cases {
                        self.visit_block(&mut case.body)?;
                    }
                }
                Statement::ForLoop(s) => {
                    self.visit_block(&mut s.pre)?;
                    self.visit_block(&mut s.post)?;
                    self.visit_block(&mut s.body)?;
                }
                Statement::Block(inner) => self.visit_block(inner)?,
                _ => {}
            }
        }
        Ok(())
    }

    fn used(&self, name: &str) -> bool {
        self.references.get(name).copied().unwrap_or(0) > 0
    }

    fn subtract_references(&mut self, subtrahend: &HashMap<String, usize>) -> Result<()> {
        for (name, count) in subtrahend {
            let recorded = self.references.get_mut(name).ok_or_else(|| {
                CoreError::internal(format!("subtracting references of unknown name `{}`", name))
            })?;
            if *recorded < *count {
                return Err(CoreError::internal(format!(
                    "subtracting {} references of `{}` but only {} recorded",
                    count, name, recorded
                )));
            }
            *recorded -= count;
            self.should_run_again = true;
        }
        Ok(())
    }

    /// Recorded reference count of a name (drained by pruning)
    pub fn remaining_references(&self, name: &str) -> usize {
        self.references.get(name).copied().unwrap_or(0)
    }
}

fn empty_block(span: crate::util::span::Span) -> Statement {
    Statement::Block(Block {
        span,
        statements: Vec::new(),
    })
}

fn remove_empty_blocks(block: &mut Block) {
    block.statements.retain(|statement| {
        !matches!(statement, Statement::Block(inner) if inner.statements.is_empty())
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middle::ir::parser::parse_block;
    use crate::middle::ir::printer::print_block;

    fn run_pruner(source: &str) -> String {
        let mut block = parse_block(source).unwrap();
        UnusedPruner::run_until_stabilized(&mut block, &HashSet::new()).unwrap();
        print_block(&block)
    }

    #[test]
    fn test_unused_movable_declaration_removed() {
        let printed = run_pruner("{ let a := add(1, 2) mstore(0, 1) }");
        assert!(!printed.contains("let a"));
        assert!(printed.contains("mstore(0, 1)"));
    }

    #[test]
    fn test_unused_effectful_declaration_downgraded() {
        let printed = run_pruner("{ let a := add(1, 1) let b := f() function f() -> r { r := mload(1) } }");
        // The pure initializer vanishes; the call keeps its effect.
        assert!(!printed.contains("let a"));
        assert!(!printed.contains("let b"));
        assert!(printed.contains("pop(f())"));
    }

    #[test]
    fn test_cascading_function_removal() {
        let printed = run_pruner(
            "{ function outer() -> r { r := inner() } function inner() -> r2 { r2 := 1 } mstore(0, 1) }",
        );
        // outer is unreferenced; removing it must make inner dead too.
        assert!(!printed.contains("function outer"));
        assert!(!printed.contains("function inner"));
    }

    #[test]
    fn test_externally_used_function_kept() {
        let mut block =
            parse_block("{ function entry() -> r { r := 1 } mstore(0, 1) }").unwrap();
        let mut keep = HashSet::new();
        keep.insert("entry".to_string());
        UnusedPruner::run_until_stabilized(&mut block, &keep).unwrap();
        assert!(print_block(&block).contains("function entry"));
    }

    #[test]
    fn test_movable_expression_statement_removed() {
        let printed = run_pruner("{ pop(add(1, 2)) mstore(0, 1) }");
        assert!(!printed.contains("pop"));
    }

    #[test]
    fn test_reference_counts_match_recount_after_fixpoint() {
        let mut block = parse_block(
            "{ let a := 1 let b := add(a, 1) mstore(0, b) function g() -> r { r := 2 } }",
        )
        .unwrap();
        UnusedPruner::run_until_stabilized(&mut block, &HashSet::new()).unwrap();
        // After the fixpoint, a fresh pruner over the pruned tree records
        // exactly the counts a full recount produces and changes nothing.
        let recount = count_references(&block);
        let pruner = UnusedPruner::new(&block, &HashSet::new());
        for (name, count) in &recount {
            assert_eq!(pruner.remaining_references(name), *count);
        }
    }
}
