//! Semantic facts about expressions
//!
//! The movability check: an expression is movable when it is provably free
//! of observable side effects and independent of mutable state, so a pass
//! may move, duplicate or delete it without changing behavior.

use crate::middle::ir::*;
use std::collections::HashSet;

/// Result of a movability scan
#[derive(Debug, Default)]
pub struct Movability {
    pub movable: bool,
    /// Variables the expression reads
    pub referenced: HashSet<String>,
}

/// Scan one expression
pub fn check_expression(expression: &Expression) -> Movability {
    let mut result = Movability {
        movable: true,
        referenced: HashSet::new(),
    };
    scan(expression, &mut result);
    result
}

/// Shorthand for the common yes/no question
pub fn is_movable(expression: &Expression) -> bool {
    check_expression(expression).movable
}

fn scan(expression: &Expression, result: &mut Movability) {
    match expression {
        Expression::Literal(_) => {}
        Expression::Identifier(identifier) => {
            result.referenced.insert(identifier.name.clone());
        }
        Expression::BuiltinCall(call) => {
            if !call.op.movable() {
                result.movable = false;
            }
            for argument in &call.arguments {
                scan(argument, result);
            }
        }
        // User functions are opaque here; treat every call as effectful.
        Expression::FunctionCall(call) => {
            result.movable = false;
            for argument in &call.arguments {
                scan(argument, result);
            }
        }
    }
}

/// True if the expression reads the given variable
pub fn references_name(expression: &Expression, name: &str) -> bool {
    match expression {
        Expression::Literal(_) => false,
        Expression::Identifier(identifier) => identifier.name == name,
        Expression::BuiltinCall(call) => {
            call.arguments.iter().any(|arg| references_name(arg, name))
        }
        Expression::FunctionCall(call) => {
            call.arguments.iter().any(|arg| references_name(arg, name))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middle::ir::parser::parse_block;

    fn first_value(source: &str) -> Expression {
        let block = parse_block(source).unwrap();
        let Statement::VariableDeclaration(decl) = &block.statements[0] else {
            panic!("expected declaration");
        };
        decl.value.clone().unwrap()
    }

    #[test]
    fn test_arithmetic_is_movable() {
        let expr = first_value("{ let a := add(mul(2, 3), x) let x := 1 }");
        let result = check_expression(&expr);
        assert!(result.movable);
        assert!(result.referenced.contains("x"));
    }

    #[test]
    fn test_memory_write_is_not_movable() {
        let block = parse_block("{ mstore(0, 1) }").unwrap();
        let Statement::Expression(statement) = &block.statements[0] else {
            panic!("expected expression statement");
        };
        assert!(!is_movable(&statement.expression));
    }

    #[test]
    fn test_load_nested_in_arithmetic() {
        let expr = first_value("{ let a := add(1, mload(0)) }");
        assert!(!is_movable(&expr));
    }

    #[test]
    fn test_user_calls_are_opaque() {
        let expr = first_value("{ let a := f() function f() -> r { r := 1 } }");
        assert!(!is_movable(&expr));
    }
}
