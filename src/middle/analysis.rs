//! IR scope analysis
//!
//! The `Parsed → Analyzed` gate: every identifier must resolve to a name
//! bound in an enclosing scope, names must not collide, call arities and
//! expression value counts must line up, and `break`/`continue` must sit
//! inside a loop body. Function bodies see functions but not the enclosing
//! variables; functions are visible in their whole defining block.

use crate::backends::object::{Object, ObjectNode};
use crate::error::{CoreError, Result};
use crate::middle::ir::*;
use crate::util::span::Span;
use std::collections::{HashMap, HashSet};

/// Analyze an object tree
pub fn analyze_object(object: &Object) -> Result<()> {
    let mut data_names = HashSet::new();
    for node in &object.subobjects {
        data_names.insert(node.name().to_string());
    }
    let mut checker = Checker {
        data_names,
        var_scopes: Vec::new(),
        fn_scopes: Vec::new(),
        loop_depth: 0,
    };
    checker.check_block(&object.code)?;
    for node in &object.subobjects {
        if let ObjectNode::Object(sub) = node {
            analyze_object(sub)?;
        }
    }
    Ok(())
}

/// Analyze a bare block (no object context, so no data references)
pub fn analyze_block(block: &Block) -> Result<()> {
    let mut checker = Checker {
        data_names: HashSet::new(),
        var_scopes: Vec::new(),
        fn_scopes: Vec::new(),
        loop_depth: 0,
    };
    checker.check_block(block)
}

struct Checker {
    data_names: HashSet<String>,
    var_scopes: Vec<HashSet<String>>,
    fn_scopes: Vec<HashMap<String, (usize, usize)>>,
    loop_depth: usize,
}

fn err(msg: impl Into<String>, span: Span) -> CoreError {
    CoreError::Analysis {
        msg: msg.into(),
        span,
    }
}

impl Checker {
    fn check_block(&mut self, block: &Block) -> Result<()> {
        self.var_scopes.push(HashSet::new());
        self.fn_scopes.push(HashMap::new());
        let result = self.check_scoped_statements(block);
        self.fn_scopes.pop();
        self.var_scopes.pop();
        result
    }

    fn check_scoped_statements(&mut self, block: &Block) -> Result<()> {
        // Functions are hoisted: visible in the whole block.
        for statement in &block.statements {
            if let Statement::FunctionDefinition(function) = statement {
                if self.is_visible(&function.name) {
                    return Err(err(
                        format!("name `{}` already declared", function.name),
                        function.span,
                    ));
                }
                self.fn_scopes
                    .last_mut()
                    .expect("function scope present")
                    .insert(
                        function.name.clone(),
                        (function.parameters.len(), function.returns.len()),
                    );
            }
        }
        for statement in &block.statements {
            self.check_statement(statement)?;
        }
        Ok(())
    }

    fn check_statement(&mut self, statement: &Statement) -> Result<()> {
        match statement {
            Statement::Expression(s) => {
                let values = self.check_expression(&s.expression)?;
                if values != 0 {
                    return Err(err(
                        format!("expression statement produces {} values", values),
                        s.span,
                    ));
                }
                Ok(())
            }
            Statement::VariableDeclaration(s) => {
                if let Some(value) = &s.value {
                    let values = self.check_expression(value)?;
                    if values != s.variables.len() {
                        return Err(err(
                            format!(
                                "declaring {} variables from {} values",
                                s.variables.len(),
                                values
                            ),
                            s.span,
                        ));
                    }
                }
                for variable in &s.variables {
                    self.declare_variable(variable)?;
                }
                Ok(())
            }
            Statement::Assignment(s) => {
                let values = self.check_expression(&s.value)?;
                if values != s.targets.len() {
                    return Err(err(
                        format!(
                            "assigning {} values to {} targets",
                            values,
                            s.targets.len()
                        ),
                        s.span,
                    ));
                }
                for target in &s.targets {
                    if !self.variable_visible(&target.name) {
                        return Err(err(
                            format!("assignment to undeclared variable `{}`", target.name),
                            target.span,
                        ));
                    }
                }
                Ok(())
            }
            Statement::FunctionDefinition(s) => self.check_function(s),
            Statement::If(s) => {
                self.expect_value(&s.condition)?;
                self.check_block(&s.body)
            }
            Statement::Switch(s) => {
                self.expect_value(&s.expression)?;
                let mut seen = HashSet::new();
                for case in &s.cases {
                    if let Some(literal) = &case.value {
                        let value = literal.numeric_value().map_err(|_| {
                            err("invalid case literal", literal.span)
                        })?;
                        if !seen.insert(value) {
                            return Err(err("duplicate switch case", literal.span));
                        }
                    }
                    self.check_block(&case.body)?;
                }
                Ok(())
            }
            Statement::ForLoop(s) => {
                // The pre block scopes the whole loop.
                self.var_scopes.push(HashSet::new());
                self.fn_scopes.push(HashMap::new());
                let result = (|| {
                    self.check_scoped_statements(&s.pre)?;
                    self.expect_value(&s.condition)?;
                    self.loop_depth += 1;
                    let body = self.check_block(&s.body);
                    self.loop_depth -= 1;
                    body?;
                    self.check_block(&s.post)
                })();
                self.fn_scopes.pop();
                self.var_scopes.pop();
                result
            }
            Statement::Break(span) | Statement::Continue(span) => {
                if self.loop_depth == 0 {
                    return Err(err("loop control statement outside of a loop body", *span));
                }
                Ok(())
            }
            Statement::Block(inner) => self.check_block(inner),
        }
    }

    fn check_function(&mut self, function: &FunctionDefinition) -> Result<()> {
        // Function bodies cannot access the enclosing variable scopes.
        let saved_vars = std::mem::take(&mut self.var_scopes);
        let saved_depth = std::mem::replace(&mut self.loop_depth, 0);
        self.var_scopes.push(HashSet::new());
        let result = (|| {
            for binding in function.parameters.iter().chain(&function.returns) {
                if self.is_visible(&binding.name) {
                    return Err(err(
                        format!("name `{}` already declared", binding.name),
                        binding.span,
                    ));
                }
                self.var_scopes
                    .last_mut()
                    .expect("parameter scope present")
                    .insert(binding.name.clone());
            }
            self.check_block(&function.body)
        })();
        self.var_scopes = saved_vars;
        self.loop_depth = saved_depth;
        result
    }

    fn check_expression(&mut self, expression: &Expression) -> Result<usize> {
        match expression {
            Expression::Literal(_) => Ok(1),
            Expression::Identifier(identifier) => {
                if self.variable_visible(&identifier.name) {
                    Ok(1)
                } else if self.function_signature(&identifier.name).is_some() {
                    Err(err(
                        format!("function `{}` used as a value", identifier.name),
                        identifier.span,
                    ))
                } else {
                    Err(err(
                        format!("reference to undeclared name `{}`", identifier.name),
                        identifier.span,
                    ))
                }
            }
            Expression::BuiltinCall(call) if call.op.is_pseudo() => {
                match call.arguments.as_slice() {
                    [Expression::Literal(literal)] if literal.kind == LiteralKind::String => {
                        if !self.data_names.contains(&literal.value) {
                            return Err(err(
                                format!("unknown object or data name `{}`", literal.value),
                                literal.span,
                            ));
                        }
                        Ok(1)
                    }
                    _ => Err(err(
                        format!("`{}` expects one string-literal argument", call.op),
                        call.span,
                    )),
                }
            }
            Expression::BuiltinCall(call) => {
                let info = call.op.info();
                if call.arguments.len() != info.args {
                    return Err(err(
                        format!(
                            "builtin `{}` expects {} arguments, got {}",
                            call.op,
                            info.args,
                            call.arguments.len()
                        ),
                        call.span,
                    ));
                }
                for argument in &call.arguments {
                    self.expect_value(argument)?;
                }
                Ok(info.rets)
            }
            Expression::FunctionCall(call) => {
                let Some((params, rets)) = self.function_signature(&call.function.name) else {
                    return Err(err(
                        format!("call of undeclared function `{}`", call.function.name),
                        call.function.span,
                    ));
                };
                if call.arguments.len() != params {
                    return Err(err(
                        format!(
                            "function `{}` expects {} arguments, got {}",
                            call.function.name,
                            params,
                            call.arguments.len()
                        ),
                        call.span,
                    ));
                }
                for argument in &call.arguments {
                    self.expect_value(argument)?;
                }
                Ok(rets)
            }
        }
    }

    fn expect_value(&mut self, expression: &Expression) -> Result<()> {
        let values = self.check_expression(expression)?;
        if values != 1 {
            return Err(err(
                format!("expected a single value, got {}", values),
                expression.span(),
            ));
        }
        Ok(())
    }

    fn declare_variable(&mut self, variable: &Binding) -> Result<()> {
        if self.is_visible(&variable.name) {
            return Err(err(
                format!("name `{}` already declared", variable.name),
                variable.span,
            ));
        }
        self.var_scopes
            .last_mut()
            .expect("variable scope present")
            .insert(variable.name.clone());
        Ok(())
    }

    fn variable_visible(&self, name: &str) -> bool {
        self.var_scopes.iter().any(|scope| scope.contains(name))
    }

    fn function_signature(&self, name: &str) -> Option<(usize, usize)> {
        self.fn_scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name))
            .copied()
    }

    fn is_visible(&self, name: &str) -> bool {
        self.variable_visible(name) || self.function_signature(name).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middle::ir::parser::{parse_block, parse_object};

    fn check(source: &str) -> Result<()> {
        analyze_block(&parse_block(source).unwrap())
    }

    #[test]
    fn test_well_formed_block() {
        check("{ let a := 1 a := add(a, 1) if a { mstore(0, a) } }").unwrap();
    }

    #[test]
    fn test_undeclared_identifier() {
        assert!(matches!(
            check("{ mstore(0, a) }"),
            Err(CoreError::Analysis { .. })
        ));
    }

    #[test]
    fn test_use_before_declaration() {
        assert!(check("{ mstore(0, a) let a := 1 }").is_err());
    }

    #[test]
    fn test_redeclaration_rejected() {
        assert!(check("{ let a := 1 let a := 2 }").is_err());
    }

    #[test]
    fn test_forward_function_call_allowed() {
        check("{ pop(f(1)) function f(x) -> y { y := x } }").unwrap();
    }

    #[test]
    fn test_function_body_cannot_see_outer_locals() {
        assert!(check("{ let a := 1 function f() -> y { y := a } pop(f()) pop(a) }").is_err());
    }

    #[test]
    fn test_builtin_arity_checked() {
        assert!(check("{ mstore(0) }").is_err());
        assert!(check("{ pop(add(1, 2, 3)) }").is_err());
    }

    #[test]
    fn test_break_outside_loop_rejected() {
        assert!(check("{ break }").is_err());
        check("{ for { } 1 { } { break } }").unwrap();
    }

    #[test]
    fn test_duplicate_switch_case() {
        assert!(check("{ switch 1 case 0 { } case 0 { } default { } }").is_err());
    }

    #[test]
    fn test_data_reference_scope() {
        let object = parse_object(
            "object \"a\" { code { pop(dataoffset(\"b\")) } object \"b\" { code { stop() } } }",
        )
        .unwrap();
        analyze_object(&object).unwrap();
        let missing = parse_object("object \"a\" { code { pop(datasize(\"nope\")) } }").unwrap();
        assert!(analyze_object(&missing).is_err());
    }
}
