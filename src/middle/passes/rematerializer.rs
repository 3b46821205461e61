//! Rematerialization pass
//!
//! Replaces a variable reference with its most recently assigned expression
//! when that expression is movable and one of the following holds:
//!
//!  - the variable is referenced exactly once
//!  - the value has zero estimated evaluation cost
//!  - the variable is referenced at most `max_references` times and the
//!    value costs at most `max_cost`
//!
//! Tracking of a binding is invalidated by any reassignment of the bound
//! name, by a reassignment of any name its value reads, and by leaving the
//! defining scope.
//!
//! Prerequisite: globally unique names.

use crate::error::Result;
use crate::middle::ir::*;
use crate::middle::passes::metrics::code_cost;
use crate::middle::passes::names::{assigned_names, count_references};
use crate::middle::passes::semantics::{is_movable, references_name};
use crate::middle::passes::OptimizerSettings;
use std::collections::HashMap;

pub struct Rematerializer {
    references: HashMap<String, usize>,
    /// Per-scope latest movable value of each tracked name
    values: Vec<HashMap<String, Expression>>,
    max_references: usize,
    max_cost: usize,
    changed: bool,
}

impl Rematerializer {
    /// Run the pass; returns whether anything was replaced
    pub fn run(block: &mut Block, settings: &OptimizerSettings) -> Result<bool> {
        let mut pass = Rematerializer {
            references: count_references(block),
            values: Vec::new(),
            max_references: settings.remat_max_references,
            max_cost: settings.remat_max_cost,
            changed: false,
        };
        pass.visit_block(block)?;
        Ok(pass.changed)
    }

    fn visit_block(&mut self, block: &mut Block) -> Result<()> {
        self.values.push(HashMap::new());
        let result = self.visit_statements(&mut block.statements);
        self.values.pop();
        result
    }

    fn visit_statements(&mut self, statements: &mut [Statement]) -> Result<()> {
        for statement in statements {
            self.visit_statement(statement)?;
        }
        Ok(())
    }

    fn visit_statement(&mut self, statement: &mut Statement) -> Result<()> {
        match statement {
            Statement::Expression(s) => self.visit_expression(&mut s.expression),
            Statement::VariableDeclaration(s) => {
                if let Some(value) = &mut s.value {
                    self.visit_expression(value)?;
                }
                if s.variables.len() == 1 {
                    if let Some(value) = &s.value {
                        if is_movable(value) {
                            self.track(&s.variables[0].name, value.clone());
                        }
                    }
                }
                Ok(())
            }
            Statement::Assignment(s) => {
                self.visit_expression(&mut s.value)?;
                for target in &s.targets {
                    self.invalidate(&target.name);
                }
                if s.targets.len() == 1 && is_movable(&s.value) {
                    self.track(&s.targets[0].name, s.value.clone());
                }
                Ok(())
            }
            Statement::FunctionDefinition(s) => {
                // Function bodies cannot see the enclosing value bindings.
                let saved = std::mem::take(&mut self.values);
                let result = self.visit_block(&mut s.body);
                self.values = saved;
                result
            }
            Statement::If(s) => {
                self.visit_expression(&mut s.condition)?;
                self.visit_block(&mut s.body)?;
                // Assignments on the conditional path invalidate tracking.
                for name in assigned_names(&s.body) {
                    self.invalidate(&name);
                }
                Ok(())
            }
            Statement::Switch(s) => {
                self.visit_expression(&mut s.expression)?;
                let mut conditionally_assigned = std::collections::HashSet::new();
                for case in &mut s.cases {
                    self.visit_block(&mut case.body)?;
                    conditionally_assigned.extend(assigned_names(&case.body));
                }
                for name in conditionally_assigned {
                    self.invalidate(&name);
                }
                Ok(())
            }
            Statement::ForLoop(s) => {
                self.values.push(HashMap::new());
                let result = (|| {
                    self.visit_statements(&mut s.pre.statements)?;
                    // Names assigned anywhere in the iterated parts are not
                    // stable across iterations.
                    let mut unstable = assigned_names(&s.body);
                    unstable.extend(assigned_names(&s.post));
                    for name in &unstable {
                        self.invalidate(name);
                    }
                    self.visit_expression(&mut s.condition)?;
                    self.visit_block(&mut s.body)?;
                    self.visit_block(&mut s.post)?;
                    for name in &unstable {
                        self.invalidate(name);
                    }
                    Ok(())
                })();
                self.values.pop();
                result
            }
            Statement::Block(inner) => self.visit_block(inner),
            Statement::Break(_) | Statement::Continue(_) => Ok(()),
        }
    }

    fn visit_expression(&mut self, expression: &mut Expression) -> Result<()> {
        if let Expression::Identifier(identifier) = expression {
            if let Some(value) = self.lookup(&identifier.name) {
                let references = self
                    .references
                    .get(&identifier.name)
                    .copied()
                    .unwrap_or(0);
                let cost = code_cost(&value);
                if references == 1
                    || cost == 0
                    || (references <= self.max_references && cost <= self.max_cost)
                {
                    *expression = value;
                    self.changed = true;
                    // Recurse into the substituted copy so chained
                    // bindings rematerialize in one run.
                    return self.visit_expression_children(expression);
                }
            }
            return Ok(());
        }
        self.visit_expression_children(expression)
    }

    fn visit_expression_children(&mut self, expression: &mut Expression) -> Result<()> {
        match expression {
            Expression::FunctionCall(call) => {
                for argument in &mut call.arguments {
                    self.visit_expression(argument)?;
                }
                Ok(())
            }
            Expression::BuiltinCall(call) => {
                for argument in &mut call.arguments {
                    self.visit_expression(argument)?;
                }
                Ok(())
            }
            Expression::Literal(_) | Expression::Identifier(_) => Ok(()),
        }
    }

    fn track(&mut self, name: &str, value: Expression) {
        if let Some(scope) = self.values.last_mut() {
            scope.insert(name.to_string(), value);
        }
    }

    fn lookup(&self, name: &str) -> Option<Expression> {
        for scope in self.values.iter().rev() {
            if let Some(value) = scope.get(name) {
                return Some(value.clone());
            }
        }
        None
    }

    /// Drop the binding for `name` and any binding whose value reads it
    fn invalidate(&mut self, name: &str) {
        for scope in &mut self.values {
            scope.retain(|key, value| key != name && !references_name(value, name));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middle::ir::parser::parse_block;
    use crate::middle::ir::printer::print_block;

    fn run_pass(source: &str) -> String {
        let mut block = parse_block(source).unwrap();
        Rematerializer::run(&mut block, &OptimizerSettings::default()).unwrap();
        print_block(&block)
    }

    #[test]
    fn test_single_reference_is_rematerialized() {
        let printed = run_pass("{ let a := add(mload(16), 3) mstore(0, a) }");
        // mload makes the value non-movable; nothing changes.
        assert!(printed.contains("mstore(0, a)"));
        let printed = run_pass("{ let a := add(x, 3) mstore(0, a) let x := 1 }");
        assert!(printed.contains("mstore(0, add(x, 3))"));
    }

    #[test]
    fn test_cheap_constant_spreads() {
        let printed = run_pass("{ let a := 1 mstore(a, a) mstore(add(a, 1), a) }");
        assert!(printed.contains("mstore(1, 1)"));
        assert!(printed.contains("mstore(add(1, 1), 1)"));
    }

    #[test]
    fn test_reassignment_invalidates() {
        let printed = run_pass("{ let a := 1 a := mload(0) mstore(0, a) }");
        // After the non-movable reassignment the reference must stay.
        assert!(printed.contains("mstore(0, a)"));
    }

    #[test]
    fn test_dependent_binding_invalidated() {
        let printed = run_pass("{ let x := 1 let a := add(x, x) x := 2 mstore(0, a) }");
        // `a`'s value reads `x`, which was reassigned; `a` must survive.
        assert!(printed.contains("mstore(0, a)"));
    }

    #[test]
    fn test_conditional_assignment_invalidates() {
        let printed =
            run_pass("{ let a := 7 if mload(0) { a := 8 } mstore(0, a) mstore(1, a) mstore(2, a) mstore(3, a) mstore(4, a) mstore(5, a) }");
        assert!(printed.contains("mstore(0, a)"));
    }

    #[test]
    fn test_loop_counter_not_rematerialized_into_body() {
        let printed = run_pass(
            "{ for { let i := 0 } lt(i, 3) { i := add(i, 1) } { mstore(i, 1) } }",
        );
        assert!(printed.contains("mstore(i, 1)"));
        assert!(printed.contains("lt(i, 3)"));
    }
}
