//! Synthesized helper functions
//!
//! Conversions, checked arithmetic and internal dispatch are generated as
//! IR function definitions, once per name, and appended to the object code
//! after translation. The collector is the memoization point: requesting
//! the same helper twice returns the same name without regenerating it.

use crate::error::{CoreError, Result};
use crate::frontend::types::Type;
use crate::middle::codegen::context::Context;
use crate::middle::ir::{
    self, Binding, Block, Case, Expression, Literal, LiteralKind, Statement,
};
use crate::backends::opcode::Opcode;
use crate::util::span::Span;
use indexmap::IndexMap;
use primitive_types::U256;

/// Container of generated functions identified by name
#[derive(Debug, Default)]
pub struct HelperCollector {
    functions: IndexMap<String, ir::FunctionDefinition>,
}

impl HelperCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Register a generated function under its own name
    pub fn insert(&mut self, function: ir::FunctionDefinition) -> Result<()> {
        if function.name.is_empty() {
            return Err(CoreError::internal("helper function without a name"));
        }
        if self.functions.contains_key(&function.name) {
            return Err(CoreError::internal(format!(
                "helper `{}` generated twice",
                function.name
            )));
        }
        self.functions.insert(function.name.clone(), function);
        Ok(())
    }

    /// Remove and return all collected functions, in generation order
    pub fn drain(&mut self) -> Vec<Statement> {
        std::mem::take(&mut self.functions)
            .into_values()
            .map(Statement::FunctionDefinition)
            .collect()
    }
}

/// `prefix0, prefix1, ...` name list used for generated signatures
pub fn suffixed_names(prefix: &str, count: usize) -> Vec<String> {
    (0..count).map(|i| format!("{}{}", prefix, i)).collect()
}

fn bindings(names: &[String]) -> Vec<Binding> {
    names.iter().map(Binding::new).collect()
}

fn hex_literal(value: U256) -> Expression {
    Expression::Literal(Literal {
        span: Span::dummy(),
        kind: LiteralKind::Number,
        value: format!("0x{:x}", value),
    })
}

fn abort_block() -> Block {
    Block::of(vec![Statement::expr(Expression::builtin(
        Opcode::Abort,
        vec![
            Expression::number(U256::zero()),
            Expression::number(U256::zero()),
        ],
    ))])
}

impl<'a> Context<'a> {
    /// Width-parameterized overflow-checked unsigned addition
    pub fn checked_add_function(&mut self, bits: u16) -> Result<String> {
        if bits == 0 || bits > 256 || bits % 8 != 0 {
            return Err(CoreError::internal(format!(
                "checked add for invalid width {}",
                bits
            )));
        }
        let name = format!("checked_add_uint_{}", bits);
        if self.helpers.contains(&name) {
            return Ok(name);
        }
        let body = if bits < 256 {
            // let mask := <mask>
            // sum := add(and(x, mask), and(y, mask))
            // if and(sum, not(mask)) { abort(0, 0) }
            let mask = (U256::one() << bits) - U256::one();
            Block::of(vec![
                Statement::let_single("mask", Some(hex_literal(mask))),
                Statement::assign_single(
                    "sum",
                    Expression::builtin(
                        Opcode::Add,
                        vec![
                            Expression::builtin(
                                Opcode::And,
                                vec![Expression::ident("x"), Expression::ident("mask")],
                            ),
                            Expression::builtin(
                                Opcode::And,
                                vec![Expression::ident("y"), Expression::ident("mask")],
                            ),
                        ],
                    ),
                ),
                Statement::If(ir::If {
                    span: Span::dummy(),
                    condition: Expression::builtin(
                        Opcode::And,
                        vec![
                            Expression::ident("sum"),
                            Expression::builtin(Opcode::Not, vec![Expression::ident("mask")]),
                        ],
                    ),
                    body: abort_block(),
                }),
            ])
        } else {
            // sum := add(x, y)
            // if lt(sum, x) { abort(0, 0) }
            Block::of(vec![
                Statement::assign_single(
                    "sum",
                    Expression::builtin(
                        Opcode::Add,
                        vec![Expression::ident("x"), Expression::ident("y")],
                    ),
                ),
                Statement::If(ir::If {
                    span: Span::dummy(),
                    condition: Expression::builtin(
                        Opcode::Lt,
                        vec![Expression::ident("sum"), Expression::ident("x")],
                    ),
                    body: abort_block(),
                }),
            ])
        };
        self.helpers.insert(ir::FunctionDefinition {
            span: Span::dummy(),
            name: name.clone(),
            parameters: vec![Binding::new("x"), Binding::new("y")],
            returns: vec![Binding::new("sum")],
            body,
        })?;
        Ok(name)
    }

    /// Type-pair-keyed value conversion; `None` when the conversion is the
    /// identity and no call is needed.
    pub fn conversion_function(&mut self, from: &Type, to: &Type) -> Result<Option<String>> {
        if from == to {
            return Ok(None);
        }
        // A compile-time rational is a full word awaiting cleanup.
        let source_bits = match from {
            Type::UInt(bits) => *bits,
            Type::Rational(_) => 256,
            _ => {
                return Err(CoreError::unimplemented(format!(
                    "conversion from `{}` to `{}`",
                    from, to
                )));
            }
        };
        let Type::UInt(target_bits) = to else {
            return Err(CoreError::unimplemented(format!(
                "conversion from `{}` to `{}`",
                from, to
            )));
        };
        if source_bits <= *target_bits {
            // Widening keeps the value; the high bits are already clean.
            return Ok(None);
        }
        let name = format!("convert_uint{}_to_uint{}", source_bits, target_bits);
        if self.helpers.contains(&name) {
            return Ok(Some(name));
        }
        let mask = (U256::one() << *target_bits) - U256::one();
        self.helpers.insert(ir::FunctionDefinition {
            span: Span::dummy(),
            name: name.clone(),
            parameters: vec![Binding::new("value")],
            returns: vec![Binding::new("converted")],
            body: Block::of(vec![Statement::assign_single(
                "converted",
                Expression::builtin(
                    Opcode::And,
                    vec![Expression::ident("value"), hex_literal(mask)],
                ),
            )]),
        })?;
        Ok(Some(name))
    }

    /// Multi-way branch calling one of the hierarchy's functions of the
    /// given signature via its numeric id, with a trap default. Built once
    /// per `(arity_in, arity_out)` pair.
    pub fn internal_dispatch(&mut self, arity_in: usize, arity_out: usize) -> Result<String> {
        let name = format!("dispatch_internal_in_{}_out_{}", arity_in, arity_out);
        if self.helpers.contains(&name) {
            return Ok(name);
        }
        let ins = suffixed_names("in_", arity_in);
        let outs = suffixed_names("out_", arity_out);

        let mut cases = Vec::new();
        for function in self.functions_with_arity(arity_in, arity_out) {
            self.enqueue_function(function);
            let call = Expression::call(
                self.function_name(function),
                ins.iter().map(|n| Expression::ident(n.clone())).collect(),
            );
            let body = if outs.is_empty() {
                Block::of(vec![Statement::expr(call)])
            } else {
                Block::of(vec![Statement::Assignment(ir::Assignment {
                    span: Span::dummy(),
                    targets: outs
                        .iter()
                        .map(|n| ir::Identifier {
                            span: Span::dummy(),
                            name: n.clone(),
                        })
                        .collect(),
                    value: call,
                })])
            };
            cases.push(Case {
                span: Span::dummy(),
                value: Some(Literal {
                    span: Span::dummy(),
                    kind: LiteralKind::Number,
                    value: function.id.to_string(),
                }),
                body,
            });
        }
        cases.push(Case {
            span: Span::dummy(),
            value: None,
            body: Block::of(vec![Statement::expr(Expression::builtin(
                Opcode::Trap,
                vec![],
            ))]),
        });

        let mut parameters = vec![Binding::new("fun")];
        parameters.extend(bindings(&ins));
        self.helpers.insert(ir::FunctionDefinition {
            span: Span::dummy(),
            name: name.clone(),
            parameters,
            returns: bindings(&outs),
            body: Block::of(vec![Statement::Switch(ir::Switch {
                span: Span::dummy(),
                expression: Expression::ident("fun"),
                cases,
            })]),
        })?;
        Ok(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::ast::{ClassDefinition, FunctionDefinition, StmtKind, Stmt, VariableDeclaration};
    use crate::middle::ir::printer::print_statement;

    fn sample_class() -> ClassDefinition {
        let param = VariableDeclaration {
            id: 11,
            span: Span::dummy(),
            name: "a".into(),
            ty: Type::uint8(),
        };
        let ret = VariableDeclaration {
            id: 12,
            span: Span::dummy(),
            name: "r".into(),
            ty: Type::uint8(),
        };
        ClassDefinition {
            id: 1,
            span: Span::dummy(),
            name: "A".into(),
            functions: vec![FunctionDefinition {
                id: 10,
                span: Span::dummy(),
                name: "f".into(),
                params: vec![param],
                returns: vec![ret],
                body: Some(Stmt {
                    span: Span::dummy(),
                    kind: StmtKind::Block(vec![]),
                }),
                is_constructor: false,
            }],
        }
    }

    #[test]
    fn test_checked_add_small_width() {
        let class = sample_class();
        let mut ctx = Context::new(vec![&class]);
        let name = ctx.checked_add_function(8).unwrap();
        assert_eq!(name, "checked_add_uint_8");
        // memoized: second request returns the same name, no second body
        assert_eq!(ctx.checked_add_function(8).unwrap(), name);
        let printed: Vec<String> = ctx.helpers.drain().iter().map(print_statement).collect();
        assert_eq!(printed.len(), 1);
        assert!(printed[0].contains("let mask := 0xff"));
        assert!(printed[0].contains("abort(0, 0)"));
    }

    #[test]
    fn test_checked_add_full_width() {
        let class = sample_class();
        let mut ctx = Context::new(vec![&class]);
        ctx.checked_add_function(256).unwrap();
        let printed: Vec<String> = ctx.helpers.drain().iter().map(print_statement).collect();
        assert!(printed[0].contains("if lt(sum, x)"));
    }

    #[test]
    fn test_conversion_identity_and_narrowing() {
        let class = sample_class();
        let mut ctx = Context::new(vec![&class]);
        assert_eq!(
            ctx.conversion_function(&Type::uint8(), &Type::uint8()).unwrap(),
            None
        );
        assert_eq!(
            ctx.conversion_function(&Type::uint8(), &Type::uint256()).unwrap(),
            None
        );
        let name = ctx
            .conversion_function(&Type::uint256(), &Type::uint8())
            .unwrap();
        assert_eq!(name.as_deref(), Some("convert_uint256_to_uint8"));
    }

    #[test]
    fn test_dispatch_covers_signature() {
        let class = sample_class();
        let mut ctx = Context::new(vec![&class]);
        let name = ctx.internal_dispatch(1, 1).unwrap();
        assert_eq!(name, "dispatch_internal_in_1_out_1");
        let printed: Vec<String> = ctx.helpers.drain().iter().map(print_statement).collect();
        assert!(printed[0].contains("switch fun"));
        assert!(printed[0].contains("case 10"));
        assert!(printed[0].contains("out_0 := fun_f_10(in_0)"));
        assert!(printed[0].contains("default"));
        assert!(printed[0].contains("trap()"));
    }
}
