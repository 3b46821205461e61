//! Size and cost metrics for optimizer decisions
//!
//! Metrics are recomputed after structural changes and never persisted
//! across runs.

use crate::middle::ir::*;

/// Code size of a block: the number of statement and expression nodes.
/// Function definitions encountered while traversing are skipped; to size
/// a function, invoke this on its body.
pub fn code_size(block: &Block) -> usize {
    block.statements.iter().map(statement_size).sum()
}

fn statement_size(statement: &Statement) -> usize {
    match statement {
        Statement::FunctionDefinition(_) => 0,
        Statement::Expression(s) => 1 + expression_size(&s.expression),
        Statement::VariableDeclaration(s) => {
            1 + s.value.as_ref().map(expression_size).unwrap_or(0)
        }
        Statement::Assignment(s) => 1 + expression_size(&s.value),
        Statement::If(s) => 1 + expression_size(&s.condition) + code_size(&s.body),
        Statement::Switch(s) => {
            1 + expression_size(&s.expression)
                + s.cases.iter().map(|case| code_size(&case.body)).sum::<usize>()
        }
        Statement::ForLoop(s) => {
            1 + code_size(&s.pre)
                + expression_size(&s.condition)
                + code_size(&s.post)
                + code_size(&s.body)
        }
        Statement::Break(_) | Statement::Continue(_) => 1,
        Statement::Block(inner) => 1 + code_size(inner),
    }
}

/// Code size of a single expression subtree
pub fn expression_size(expression: &Expression) -> usize {
    match expression {
        Expression::Literal(_) | Expression::Identifier(_) => 1,
        Expression::FunctionCall(call) => {
            1 + call.arguments.iter().map(expression_size).sum::<usize>()
        }
        Expression::BuiltinCall(call) => {
            1 + call.arguments.iter().map(expression_size).sum::<usize>()
        }
    }
}

/// Rough evaluation cost of an expression: literals cost their encoded
/// byte size, variable references are free, builtins cost their tier and
/// user function calls a flat 50.
pub fn code_cost(expression: &Expression) -> usize {
    match expression {
        Expression::Literal(literal) => literal
            .numeric_value()
            .map(|value| crate::backends::item::byte_length(value))
            .unwrap_or(32),
        Expression::Identifier(_) => 0,
        Expression::BuiltinCall(call) => {
            call.op.cost_tier() + call.arguments.iter().map(code_cost).sum::<usize>()
        }
        Expression::FunctionCall(call) => {
            50 + call.arguments.iter().map(code_cost).sum::<usize>()
        }
    }
}
