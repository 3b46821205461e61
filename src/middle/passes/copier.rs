//! Structural tree copy with name rewriting
//!
//! One generic traversal shared by the inliner (per-call rename maps) and
//! the inline-block translator (namespacing plus external-reference
//! resolution). The rewrite function sees every name in the tree: declared
//! bindings, assignment targets, identifier uses, function definitions and
//! call targets.

use crate::middle::ir::*;

/// Copy a block, passing every name through `rename`
pub fn copy_block(block: &Block, rename: &mut dyn FnMut(&str) -> String) -> Block {
    Block {
        span: block.span,
        statements: block
            .statements
            .iter()
            .map(|statement| copy_statement(statement, rename))
            .collect(),
    }
}

/// Copy a statement, passing every name through `rename`
pub fn copy_statement(statement: &Statement, rename: &mut dyn FnMut(&str) -> String) -> Statement {
    match statement {
        Statement::Expression(s) => Statement::Expression(ExpressionStatement {
            span: s.span,
            expression: copy_expression(&s.expression, rename),
        }),
        Statement::VariableDeclaration(s) => Statement::VariableDeclaration(VariableDeclaration {
            span: s.span,
            variables: s
                .variables
                .iter()
                .map(|variable| Binding {
                    span: variable.span,
                    name: rename(&variable.name),
                })
                .collect(),
            value: s.value.as_ref().map(|value| copy_expression(value, rename)),
        }),
        Statement::Assignment(s) => Statement::Assignment(Assignment {
            span: s.span,
            targets: s
                .targets
                .iter()
                .map(|target| Identifier {
                    span: target.span,
                    name: rename(&target.name),
                })
                .collect(),
            value: copy_expression(&s.value, rename),
        }),
        Statement::FunctionDefinition(s) => Statement::FunctionDefinition(FunctionDefinition {
            span: s.span,
            name: rename(&s.name),
            parameters: s
                .parameters
                .iter()
                .map(|binding| Binding {
                    span: binding.span,
                    name: rename(&binding.name),
                })
                .collect(),
            returns: s
                .returns
                .iter()
                .map(|binding| Binding {
                    span: binding.span,
                    name: rename(&binding.name),
                })
                .collect(),
            body: copy_block(&s.body, rename),
        }),
        Statement::If(s) => Statement::If(If {
            span: s.span,
            condition: copy_expression(&s.condition, rename),
            body: copy_block(&s.body, rename),
        }),
        Statement::Switch(s) => Statement::Switch(Switch {
            span: s.span,
            expression: copy_expression(&s.expression, rename),
            cases: s
                .cases
                .iter()
                .map(|case| Case {
                    span: case.span,
                    value: case.value.clone(),
                    body: copy_block(&case.body, rename),
                })
                .collect(),
        }),
        Statement::ForLoop(s) => Statement::ForLoop(ForLoop {
            span: s.span,
            pre: copy_block(&s.pre, rename),
            condition: copy_expression(&s.condition, rename),
            post: copy_block(&s.post, rename),
            body: copy_block(&s.body, rename),
        }),
        Statement::Break(span) => Statement::Break(*span),
        Statement::Continue(span) => Statement::Continue(*span),
        Statement::Block(inner) => Statement::Block(copy_block(inner, rename)),
    }
}

/// Copy an expression, passing every name through `rename`
pub fn copy_expression(
    expression: &Expression,
    rename: &mut dyn FnMut(&str) -> String,
) -> Expression {
    match expression {
        Expression::Literal(literal) => Expression::Literal(literal.clone()),
        Expression::Identifier(identifier) => Expression::Identifier(Identifier {
            span: identifier.span,
            name: rename(&identifier.name),
        }),
        Expression::FunctionCall(call) => Expression::FunctionCall(FunctionCall {
            span: call.span,
            function: Identifier {
                span: call.function.span,
                name: rename(&call.function.name),
            },
            arguments: call
                .arguments
                .iter()
                .map(|argument| copy_expression(argument, rename))
                .collect(),
        }),
        Expression::BuiltinCall(call) => Expression::BuiltinCall(BuiltinCall {
            span: call.span,
            op: call.op,
            arguments: call
                .arguments
                .iter()
                .map(|argument| copy_expression(argument, rename))
                .collect(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middle::ir::parser::parse_block;
    use crate::middle::ir::printer::print_block;
    use std::collections::HashMap;

    #[test]
    fn test_identity_copy() {
        let block = parse_block("{ let a := 1 if a { pop(add(a, 2)) } }").unwrap();
        let copy = copy_block(&block, &mut |name| name.to_string());
        assert!(syntactic_eq(&block, &copy));
    }

    #[test]
    fn test_rename_map_copy() {
        let block = parse_block("{ let a := 1 let b := add(a, f(a)) }").unwrap();
        let mut map = HashMap::new();
        map.insert("a".to_string(), "a_1".to_string());
        let copy = copy_block(&block, &mut |name| {
            map.get(name).cloned().unwrap_or_else(|| name.to_string())
        });
        let printed = print_block(&copy);
        assert!(printed.contains("let a_1 := 1"));
        assert!(printed.contains("add(a_1, f(a_1))"));
    }

    #[test]
    fn test_prefix_copy_renames_call_targets() {
        let block = parse_block("{ helper(x) }").unwrap();
        let copy = copy_block(&block, &mut |name| format!("usr${}", name));
        let printed = print_block(&copy);
        assert!(printed.contains("usr$helper(usr$x)"));
    }

    #[test]
    fn test_builtin_names_are_not_renamed() {
        let block = parse_block("{ pop(add(1, x)) }").unwrap();
        let copy = copy_block(&block, &mut |name| format!("usr${}", name));
        let printed = print_block(&copy);
        assert!(printed.contains("pop(add(1, usr$x))"));
    }
}
