//! Name bookkeeping for the optimizer
//!
//! Declared-name collection, whole-tree reference counting, assignment
//! tracking, single-assignment literal detection, and the fresh-name
//! dispenser. All of it assumes (and preserves) the globally-unique-names
//! precondition.

use crate::middle::ir::*;
use std::collections::{HashMap, HashSet};

/// All names declared anywhere in the block: variables, functions,
/// parameters and named returns.
pub fn collect_names(block: &Block) -> HashSet<String> {
    let mut names = HashSet::new();
    collect_names_into(block, &mut names);
    names
}

fn collect_names_into(block: &Block, names: &mut HashSet<String>) {
    for statement in &block.statements {
        match statement {
            Statement::VariableDeclaration(decl) => {
                for variable in &decl.variables {
                    names.insert(variable.name.clone());
                }
            }
            Statement::FunctionDefinition(function) => {
                names.insert(function.name.clone());
                for binding in function.parameters.iter().chain(&function.returns) {
                    names.insert(binding.name.clone());
                }
                collect_names_into(&function.body, names);
            }
            Statement::If(statement) => collect_names_into(&statement.body, names),
            Statement::Switch(statement) => {
                for case in &statement.cases {
                    collect_names_into(&case.body, names);
                }
            }
            Statement::ForLoop(statement) => {
                collect_names_into(&statement.pre, names);
                collect_names_into(&statement.post, names);
                collect_names_into(&statement.body, names);
            }
            Statement::Block(inner) => collect_names_into(inner, names),
            _ => {}
        }
    }
}

/// Reference count per name over a whole block: identifier uses plus
/// function call targets. Declarations do not count as references.
pub fn count_references(block: &Block) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    count_in_block(block, &mut counts);
    counts
}

/// Reference counts inside a single expression
pub fn count_references_in_expression(expression: &Expression) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    count_in_expression(expression, &mut counts);
    counts
}

fn count_in_block(block: &Block, counts: &mut HashMap<String, usize>) {
    for statement in &block.statements {
        count_in_statement(statement, counts);
    }
}

fn count_in_statement(statement: &Statement, counts: &mut HashMap<String, usize>) {
    match statement {
        Statement::Expression(s) => count_in_expression(&s.expression, counts),
        Statement::VariableDeclaration(s) => {
            if let Some(value) = &s.value {
                count_in_expression(value, counts);
            }
        }
        Statement::Assignment(s) => {
            for target in &s.targets {
                *counts.entry(target.name.clone()).or_default() += 1;
            }
            count_in_expression(&s.value, counts);
        }
        Statement::FunctionDefinition(s) => count_in_block(&s.body, counts),
        Statement::If(s) => {
            count_in_expression(&s.condition, counts);
            count_in_block(&s.body, counts);
        }
        Statement::Switch(s) => {
            count_in_expression(&s.expression, counts);
            for case in &s.cases {
                count_in_block(&case.body, counts);
            }
        }
        Statement::ForLoop(s) => {
            count_in_block(&s.pre, counts);
            count_in_expression(&s.condition, counts);
            count_in_block(&s.post, counts);
            count_in_block(&s.body, counts);
        }
        Statement::Block(inner) => count_in_block(inner, counts),
        Statement::Break(_) | Statement::Continue(_) => {}
    }
}

fn count_in_expression(expression: &Expression, counts: &mut HashMap<String, usize>) {
    match expression {
        Expression::Identifier(identifier) => {
            *counts.entry(identifier.name.clone()).or_default() += 1;
        }
        Expression::FunctionCall(call) => {
            *counts.entry(call.function.name.clone()).or_default() += 1;
            for argument in &call.arguments {
                count_in_expression(argument, counts);
            }
        }
        Expression::BuiltinCall(call) => {
            for argument in &call.arguments {
                count_in_expression(argument, counts);
            }
        }
        Expression::Literal(_) => {}
    }
}

/// Names that appear as assignment targets anywhere in the block
pub fn assigned_names(block: &Block) -> HashSet<String> {
    let mut names = HashSet::new();
    assigned_in_block(block, &mut names);
    names
}

fn assigned_in_block(block: &Block, names: &mut HashSet<String>) {
    for statement in &block.statements {
        match statement {
            Statement::Assignment(assignment) => {
                for target in &assignment.targets {
                    names.insert(target.name.clone());
                }
            }
            Statement::FunctionDefinition(function) => assigned_in_block(&function.body, names),
            Statement::If(statement) => assigned_in_block(&statement.body, names),
            Statement::Switch(statement) => {
                for case in &statement.cases {
                    assigned_in_block(&case.body, names);
                }
            }
            Statement::ForLoop(statement) => {
                assigned_in_block(&statement.pre, names);
                assigned_in_block(&statement.post, names);
                assigned_in_block(&statement.body, names);
            }
            Statement::Block(inner) => assigned_in_block(inner, names),
            _ => {}
        }
    }
}

/// Names provably bound to a literal exactly once: declared alone with a
/// literal initializer and never reassigned anywhere in the tree.
pub fn literal_bindings(block: &Block) -> HashSet<String> {
    let reassigned = assigned_names(block);
    let mut bindings = HashSet::new();
    literal_bindings_into(block, &reassigned, &mut bindings);
    bindings
}

fn literal_bindings_into(
    block: &Block,
    reassigned: &HashSet<String>,
    bindings: &mut HashSet<String>,
) {
    for statement in &block.statements {
        match statement {
            Statement::VariableDeclaration(decl) => {
                if decl.variables.len() == 1
                    && matches!(decl.value, Some(Expression::Literal(_)))
                    && !reassigned.contains(&decl.variables[0].name)
                {
                    bindings.insert(decl.variables[0].name.clone());
                }
            }
            Statement::FunctionDefinition(function) => {
                literal_bindings_into(&function.body, reassigned, bindings);
            }
            Statement::If(statement) => {
                literal_bindings_into(&statement.body, reassigned, bindings);
            }
            Statement::Switch(statement) => {
                for case in &statement.cases {
                    literal_bindings_into(&case.body, reassigned, bindings);
                }
            }
            Statement::ForLoop(statement) => {
                literal_bindings_into(&statement.pre, reassigned, bindings);
                literal_bindings_into(&statement.post, reassigned, bindings);
                literal_bindings_into(&statement.body, reassigned, bindings);
            }
            Statement::Block(inner) => literal_bindings_into(inner, reassigned, bindings),
            _ => {}
        }
    }
}

/// Allocator for names not yet used anywhere in the unit
#[derive(Debug, Clone)]
pub struct NameDispenser {
    used: HashSet<String>,
    counter: usize,
}

impl NameDispenser {
    /// Dispenser seeded with every name used in the block
    pub fn new(block: &Block) -> Self {
        Self::from_used(collect_names(block))
    }

    pub fn from_used(used: HashSet<String>) -> Self {
        Self { used, counter: 0 }
    }

    /// Fresh name built from a hint and an optional context prefix
    pub fn new_name(&mut self, hint: &str, context: &str) -> String {
        let prefix = if context.is_empty() {
            hint.to_string()
        } else {
            let context: String = context.chars().take(10).collect();
            format!("{}_{}", context, hint)
        };
        let mut name = prefix.clone();
        while name.is_empty() || self.used.contains(&name) {
            self.counter += 1;
            name = format!("{}_{}", prefix, self.counter);
        }
        self.used.insert(name.clone());
        name
    }
}
