//! Converts an IR tree into its textual form
//!
//! The output is re-parseable: printing any tree and feeding the text back
//! through the parser yields a structurally equal tree.

use crate::middle::ir::*;

/// Render a block as source text
pub fn print_block(block: &Block) -> String {
    if block.statements.is_empty() {
        return "{\n}".into();
    }
    let body = block
        .statements
        .iter()
        .map(print_statement)
        .collect::<Vec<_>>()
        .join("\n")
        .replace('\n', "\n    ");
    format!("{{\n    {}\n}}", body)
}

/// Render a single statement
pub fn print_statement(statement: &Statement) -> String {
    match statement {
        Statement::Expression(s) => print_expression(&s.expression),
        Statement::VariableDeclaration(s) => {
            let names = s
                .variables
                .iter()
                .map(|v| v.name.clone())
                .collect::<Vec<_>>()
                .join(", ");
            match &s.value {
                Some(value) => format!("let {} := {}", names, print_expression(value)),
                None => format!("let {}", names),
            }
        }
        Statement::Assignment(s) => {
            let targets = s
                .targets
                .iter()
                .map(|t| t.name.clone())
                .collect::<Vec<_>>()
                .join(", ");
            format!("{} := {}", targets, print_expression(&s.value))
        }
        Statement::FunctionDefinition(s) => {
            let params = s
                .parameters
                .iter()
                .map(|p| p.name.clone())
                .collect::<Vec<_>>()
                .join(", ");
            let mut out = format!("function {}({})", s.name, params);
            if !s.returns.is_empty() {
                let rets = s
                    .returns
                    .iter()
                    .map(|r| r.name.clone())
                    .collect::<Vec<_>>()
                    .join(", ");
                out += &format!(" -> {}", rets);
            }
            format!("{}\n{}", out, print_block(&s.body))
        }
        Statement::If(s) => format!(
            "if {}\n{}",
            print_expression(&s.condition),
            print_block(&s.body)
        ),
        Statement::Switch(s) => {
            let mut out = format!("switch {}", print_expression(&s.expression));
            for case in &s.cases {
                match &case.value {
                    Some(value) => out += &format!("\ncase {} ", print_literal(value)),
                    None => out += "\ndefault ",
                }
                out += &print_block(&case.body);
            }
            out
        }
        Statement::ForLoop(s) => format!(
            "for {}\n{}\n{}\n{}",
            print_block(&s.pre),
            print_expression(&s.condition),
            print_block(&s.post),
            print_block(&s.body)
        ),
        Statement::Break(_) => "break".into(),
        Statement::Continue(_) => "continue".into(),
        Statement::Block(block) => print_block(block),
    }
}

/// Render a single expression
pub fn print_expression(expression: &Expression) -> String {
    match expression {
        Expression::Literal(literal) => print_literal(literal),
        Expression::Identifier(identifier) => identifier.name.clone(),
        Expression::FunctionCall(call) => format!(
            "{}({})",
            call.function.name,
            call.arguments
                .iter()
                .map(print_expression)
                .collect::<Vec<_>>()
                .join(", ")
        ),
        Expression::BuiltinCall(call) => format!(
            "{}({})",
            call.op,
            call.arguments
                .iter()
                .map(print_expression)
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

fn print_literal(literal: &Literal) -> String {
    match literal.kind {
        LiteralKind::Number | LiteralKind::Boolean => literal.value.clone(),
        LiteralKind::String => {
            let mut out = String::from("\"");
            for c in literal.value.chars() {
                match c {
                    '\\' => out.push_str("\\\\"),
                    '"' => out.push_str("\\\""),
                    '\n' => out.push_str("\\n"),
                    '\r' => out.push_str("\\r"),
                    '\t' => out.push_str("\\t"),
                    c if !c.is_ascii() || (c as u32) < 0x20 => {
                        out.push_str(&format!("\\x{:02x}", c as u32 & 0xff));
                    }
                    c => out.push(c),
                }
            }
            out.push('"');
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::opcode::Opcode;
    use primitive_types::U256;

    #[test]
    fn test_empty_block() {
        assert_eq!(print_block(&Block::default()), "{\n}");
    }

    #[test]
    fn test_declaration_and_call() {
        let block = Block::of(vec![
            Statement::let_single("a", Some(Expression::number(U256::from(1)))),
            Statement::let_single(
                "b",
                Some(Expression::builtin(
                    Opcode::Add,
                    vec![Expression::ident("a"), Expression::number(U256::from(2))],
                )),
            ),
        ]);
        assert_eq!(
            print_block(&block),
            "{\n    let a := 1\n    let b := add(a, 2)\n}"
        );
    }

    #[test]
    fn test_function_definition() {
        let fun = Statement::FunctionDefinition(FunctionDefinition {
            span: crate::util::span::Span::dummy(),
            name: "f".into(),
            parameters: vec![Binding::new("x")],
            returns: vec![Binding::new("y")],
            body: Block::of(vec![Statement::assign_single("y", Expression::ident("x"))]),
        });
        assert_eq!(
            print_statement(&fun),
            "function f(x) -> y\n{\n    y := x\n}"
        );
    }

    #[test]
    fn test_string_escaping() {
        let expr = Expression::string("a\"b\\c\nd");
        assert_eq!(print_expression(&expr), "\"a\\\"b\\\\c\\nd\"");
    }
}
