//! Typed AST → IR generation
//!
//! Translates one inheritance-linearized class into an IR object tree:
//! a creation object holding the deploy code and a nested runtime object
//! holding the entry dispatch plus every reachable function. The emitted
//! text is re-parsed and analyzed as a self-check before optimization.

pub mod context;
pub mod helpers;
pub mod statements;

use crate::error::{CoreError, Result};
use crate::frontend::ast::{ClassDefinition, FunctionDefinition};
use crate::frontend::types::Type;
use crate::backends::object::{Object, ObjectNode};
use crate::backends::opcode::Opcode;
use crate::middle::ir::{self, Block, Case, Expression, Statement};
use crate::middle::passes::OptimizerSettings;
use crate::unit::{CompilationUnit, Language};
use crate::util::span::Span;
use context::Context;
use primitive_types::U256;
use statements::{StatementGenerator, RETURN_FLAG};
use tracing::debug;

pub struct IrGenerator<'a> {
    most_derived: &'a ClassDefinition,
    /// Linearized inheritance list, most derived first
    hierarchy: Vec<&'a ClassDefinition>,
    settings: OptimizerSettings,
}

impl<'a> IrGenerator<'a> {
    pub fn new(
        most_derived: &'a ClassDefinition,
        hierarchy: Vec<&'a ClassDefinition>,
        settings: OptimizerSettings,
    ) -> Self {
        Self {
            most_derived,
            hierarchy,
            settings,
        }
    }

    /// Generate, self-check and optimize; returns the IR text and the
    /// ready-to-assemble compilation unit.
    pub fn run(&self) -> Result<(String, CompilationUnit)> {
        let object = self.generate()?;
        let text = object.to_string();
        let mut unit = CompilationUnit::new(Language::Ir, self.settings.clone());
        unit.parse_and_analyze(&object.name, &text).map_err(|error| {
            CoreError::internal(format!("generator produced invalid IR: {}", error))
        })?;
        unit.optimize()?;
        Ok((text, unit))
    }

    fn generate(&self) -> Result<Object> {
        // Constructors are a staging boundary, not silently dropped code.
        if self.most_derived.constructor().is_some() {
            return Err(CoreError::unimplemented_at(
                "constructors",
                self.most_derived.span,
            ));
        }
        let creation_name = format!("{}_{}", self.most_derived.name, self.most_derived.id);
        let runtime_name = format!("{}_deployed", creation_name);

        // Runtime object: entry dispatch plus all reachable functions.
        let mut ctx = Context::new(self.hierarchy.clone());
        let mut runtime_code = self.dispatch_routine(&mut ctx)?;
        while let Some(function) = ctx.pop_queued_function() {
            self.generate_function(&mut ctx, function)?;
        }
        runtime_code.extend(ctx.helpers.drain());
        debug!(object = %runtime_name, statements = runtime_code.len(), "generated runtime object");

        // Creation object: copy the runtime object and hand it over.
        let deploy_code = vec![
            Statement::expr(Expression::builtin(
                Opcode::DataCopy,
                vec![
                    Expression::number(U256::zero()),
                    Expression::builtin(
                        Opcode::DataOffset,
                        vec![Expression::string(runtime_name.clone())],
                    ),
                    Expression::builtin(
                        Opcode::DataSize,
                        vec![Expression::string(runtime_name.clone())],
                    ),
                ],
            )),
            Statement::expr(Expression::builtin(
                Opcode::Finish,
                vec![
                    Expression::number(U256::zero()),
                    Expression::builtin(
                        Opcode::DataSize,
                        vec![Expression::string(runtime_name.clone())],
                    ),
                ],
            )),
        ];

        Ok(Object {
            name: creation_name,
            code: Block::of(deploy_code),
            subobjects: vec![ObjectNode::Object(Object {
                name: runtime_name,
                code: Block::of(runtime_code),
                subobjects: Vec::new(),
            })],
        })
    }

    /// Entry dispatch: a switch on the first input word over the numeric
    /// ids of all most-derived, non-constructor functions. The selected
    /// function's result word is written to memory and returned.
    fn dispatch_routine(&self, ctx: &mut Context<'a>) -> Result<Vec<Statement>> {
        let mut cases = Vec::new();
        let mut seen: Vec<(String, Vec<Type>)> = Vec::new();
        for class in &self.hierarchy {
            for function in class.defined_functions() {
                if function.is_constructor {
                    continue;
                }
                let key = (function.name.clone(), function.parameter_types());
                if seen.contains(&key) {
                    continue;
                }
                seen.push(key);
                cases.push(self.dispatch_case(ctx, function)?);
            }
        }
        cases.push(Case {
            span: Span::dummy(),
            value: None,
            body: Block::of(vec![Statement::expr(Expression::builtin(
                Opcode::Trap,
                vec![],
            ))]),
        });

        Ok(vec![
            Statement::let_single(
                "selector",
                Some(Expression::builtin(
                    Opcode::Input,
                    vec![Expression::number(U256::zero())],
                )),
            ),
            Statement::Switch(ir::Switch {
                span: Span::dummy(),
                expression: Expression::ident("selector"),
                cases,
            }),
        ])
    }

    fn dispatch_case(&self, ctx: &mut Context<'a>, function: &'a FunctionDefinition) -> Result<Case> {
        if function.returns.len() > 1 {
            return Err(CoreError::unimplemented_at(
                "dispatch of functions returning multiple values",
                function.span,
            ));
        }
        ctx.enqueue_function(function);
        let arguments = (0..function.params.len())
            .map(|index| {
                Expression::builtin(
                    Opcode::Input,
                    vec![Expression::number(U256::from(index as u64 + 1))],
                )
            })
            .collect();
        let call = Expression::call(ctx.function_name(function), arguments);

        let body = if function.returns.is_empty() {
            Block::of(vec![
                Statement::expr(call),
                Statement::expr(Expression::builtin(Opcode::Stop, vec![])),
            ])
        } else {
            let ret = format!("ret_{}", function.id);
            Block::of(vec![
                Statement::let_single(ret.clone(), Some(call)),
                Statement::expr(Expression::builtin(
                    Opcode::MStore,
                    vec![Expression::number(U256::zero()), Expression::ident(ret)],
                )),
                Statement::expr(Expression::builtin(
                    Opcode::Finish,
                    vec![
                        Expression::number(U256::zero()),
                        Expression::number(U256::from(32)),
                    ],
                )),
            ])
        };
        Ok(Case {
            span: Span::dummy(),
            value: Some(ir::Literal {
                span: Span::dummy(),
                kind: ir::LiteralKind::Number,
                value: function.id.to_string(),
            }),
            body,
        })
    }

    /// Generate one function definition, once per name, wrapped in the
    /// loop that carries the synthetic termination flag.
    fn generate_function(&self, ctx: &mut Context<'a>, function: &'a FunctionDefinition) -> Result<()> {
        let name = ctx.function_name(function);
        if ctx.helpers.contains(&name) {
            return Ok(());
        }
        let Some(body) = &function.body else {
            return Err(CoreError::unimplemented_at(
                "generation of bodiless functions",
                function.span,
            ));
        };
        if function.returns.len() > 1 {
            return Err(CoreError::unimplemented_at(
                "functions returning multiple values",
                function.span,
            ));
        }

        let mut parameters = Vec::with_capacity(function.params.len());
        for param in &function.params {
            parameters.push(ir::Binding::new(ctx.add_local_variable(param)?));
        }
        let mut returns = Vec::with_capacity(function.returns.len());
        for ret in &function.returns {
            returns.push(ir::Binding::new(ctx.add_local_variable(ret)?));
        }

        let mut generator = StatementGenerator::new(ctx, function.returns.first());
        match &body.kind {
            crate::frontend::ast::StmtKind::Block(statements) => {
                for statement in statements {
                    generator.generate_statement(statement)?;
                }
            }
            _ => generator.generate_statement(body)?,
        }
        let mut loop_body = generator.into_statements();
        loop_body.push(Statement::Break(Span::dummy()));

        // function f(...) -> r {
        //     for { let return_flag := 1 } return_flag { } { <body> break }
        // }
        ctx.helpers.insert(ir::FunctionDefinition {
            span: function.span,
            name,
            parameters,
            returns,
            body: Block::of(vec![Statement::ForLoop(ir::ForLoop {
                span: Span::dummy(),
                pre: Block::of(vec![Statement::let_single(
                    RETURN_FLAG,
                    Some(Expression::number(U256::one())),
                )]),
                condition: Expression::ident(RETURN_FLAG),
                post: Block::default(),
                body: Block::of(loop_body),
            })]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::ast::*;
    use crate::frontend::types::FunctionType;

    fn uint8_var(id: NodeId, name: &str) -> VariableDeclaration {
        VariableDeclaration {
            id,
            span: Span::dummy(),
            name: name.into(),
            ty: Type::uint8(),
        }
    }

    fn typed(id: NodeId, ty: Type, kind: ExprKind) -> Expr {
        Expr {
            id,
            span: Span::dummy(),
            ty,
            kind,
        }
    }

    /// class { f(v: uint8) -> uint8 { return v + 1 } } with all node ids
    /// shifted by `offset`, so overriding classes carry distinct ids
    fn sample_class_with(offset: NodeId, class_name: &str) -> ClassDefinition {
        let param = uint8_var(offset + 10, "v");
        let ret = uint8_var(offset + 11, "r");
        let value = typed(
            offset + 20,
            Type::uint8(),
            ExprKind::Binary {
                op: BinOp::Add,
                lhs: Box::new(typed(
                    offset + 21,
                    Type::uint8(),
                    ExprKind::Identifier(DeclarationRef {
                        id: offset + 10,
                        kind: DeclKind::Variable,
                    }),
                )),
                rhs: Box::new(typed(
                    offset + 22,
                    Type::Rational(U256::from(1)),
                    ExprKind::Literal(LiteralValue::Number(U256::from(1))),
                )),
            },
        );
        ClassDefinition {
            id: offset + 1,
            span: Span::dummy(),
            name: class_name.into(),
            functions: vec![FunctionDefinition {
                id: offset + 5,
                span: Span::dummy(),
                name: "f".into(),
                params: vec![param],
                returns: vec![ret],
                body: Some(Stmt {
                    span: Span::dummy(),
                    kind: StmtKind::Block(vec![Stmt {
                        span: Span::dummy(),
                        kind: StmtKind::Return { value: Some(value) },
                    }]),
                }),
                is_constructor: false,
            }],
        }
    }

    fn sample_class() -> ClassDefinition {
        sample_class_with(0, "Counter")
    }

    #[test]
    fn test_generated_object_layout() {
        let class = sample_class();
        let generator =
            IrGenerator::new(&class, vec![&class], OptimizerSettings::none());
        let (text, unit) = generator.run().unwrap();
        assert!(text.starts_with("object \"Counter_1\""));
        assert!(text.contains("object \"Counter_1_deployed\""));
        assert!(text.contains("switch selector"));
        assert!(text.contains("case 5"));
        assert!(text.contains("function fun_f_5(vloc_v_10) -> vloc_r_11"));
        assert!(text.contains("let return_flag := 1"));
        assert!(text.contains("checked_add_uint_8"));
        assert!(unit.print().is_ok());
    }

    #[test]
    fn test_dispatch_prefers_most_derived() {
        let base = sample_class();
        let derived = sample_class_with(100, "Derived");
        let generator =
            IrGenerator::new(&derived, vec![&derived, &base], OptimizerSettings::none());
        let (text, _unit) = generator.run().unwrap();
        assert!(text.contains("case 105"));
        assert!(!text.contains("case 5 "));
        assert!(text.contains("fun_f_105"));
        assert!(!text.contains("fun_f_5("));
    }

    #[test]
    fn test_function_typed_call_uses_dispatch() {
        // let g := f; g(7)  lowers through internal dispatch
        let class = sample_class();
        let fn_type = Type::Function(FunctionType::new(
            vec![Type::uint8()],
            vec![Type::uint8()],
        ));
        let decl_g = VariableDeclaration {
            id: 60,
            span: Span::dummy(),
            name: "g".into(),
            ty: fn_type.clone(),
        };
        let body = vec![
            Stmt {
                span: Span::dummy(),
                kind: StmtKind::VarDecl {
                    decls: vec![decl_g.clone()],
                    init: Some(typed(
                        61,
                        fn_type.clone(),
                        ExprKind::Identifier(DeclarationRef {
                            id: 5,
                            kind: DeclKind::Function,
                        }),
                    )),
                },
            },
            Stmt {
                span: Span::dummy(),
                kind: StmtKind::Return {
                    value: Some(typed(
                        62,
                        Type::uint8(),
                        ExprKind::Call {
                            callee: Box::new(typed(
                                63,
                                fn_type,
                                ExprKind::Identifier(DeclarationRef {
                                    id: 60,
                                    kind: DeclKind::Variable,
                                }),
                            )),
                            args: vec![typed(
                                64,
                                Type::uint8(),
                                ExprKind::Literal(LiteralValue::Number(U256::from(7))),
                            )],
                        },
                    )),
                },
            },
        ];
        let mut class2 = class.clone();
        class2.functions.push(FunctionDefinition {
            id: 70,
            span: Span::dummy(),
            name: "call_g".into(),
            params: vec![],
            returns: vec![uint8_var(71, "out")],
            body: Some(Stmt {
                span: Span::dummy(),
                kind: StmtKind::Block(body),
            }),
            is_constructor: false,
        });
        let generator =
            IrGenerator::new(&class2, vec![&class2], OptimizerSettings::none());
        let (text, _unit) = generator.run().unwrap();
        assert!(text.contains("dispatch_internal_in_1_out_1"));
        assert!(text.contains("default {"), "dispatch needs a trap default");
    }
}
