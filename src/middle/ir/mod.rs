//! Stack-machine intermediate representation
//!
//! The IR between the typed source AST and the final bytecode: blocks of
//! statements over expressions, with functions, loops, switches and calls
//! to the target machine's builtins. Every name in a well-formed tree is
//! globally unique for the lifetime of the compilation unit — several
//! optimizer passes rely on that for safe substitution.
//!
//! Node dispatch is closed-set: each pass pattern-matches exhaustively over
//! [`Statement`] and [`Expression`]; adding a pass never touches the node
//! definitions.

pub mod interp;
pub mod parser;
pub mod printer;

use crate::backends::opcode::Opcode;
use crate::error::{CoreError, Result};
use crate::util::span::Span;
use primitive_types::U256;

/// A scope-creating ordered statement sequence
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Block {
    pub span: Span,
    pub statements: Vec<Statement>,
}

/// Statement variants
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    Expression(ExpressionStatement),
    VariableDeclaration(VariableDeclaration),
    Assignment(Assignment),
    FunctionDefinition(FunctionDefinition),
    If(If),
    Switch(Switch),
    ForLoop(ForLoop),
    Break(Span),
    Continue(Span),
    Block(Block),
}

/// Statement that contains only a single expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpressionStatement {
    pub span: Span,
    pub expression: Expression,
}

/// Non-hoisted block-scope variable declaration, `let a, b := value`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableDeclaration {
    pub span: Span,
    pub variables: Vec<Binding>,
    pub value: Option<Expression>,
}

/// Assignment to previously declared variables, `a, b := value`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub span: Span,
    pub targets: Vec<Identifier>,
    pub value: Expression,
}

/// Function definition, `function f(a, b) -> c { ... }`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionDefinition {
    pub span: Span,
    pub name: String,
    pub parameters: Vec<Binding>,
    pub returns: Vec<Binding>,
    pub body: Block,
}

/// Conditional execution without an else branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct If {
    pub span: Span,
    pub condition: Expression,
    pub body: Block,
}

/// Switch case; `value` is `None` for the default case
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Case {
    pub span: Span,
    pub value: Option<Literal>,
    pub body: Block,
}

/// Multi-way branch on an expression value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Switch {
    pub span: Span,
    pub expression: Expression,
    pub cases: Vec<Case>,
}

/// Native loop: `for <pre> <condition> <post> <body>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForLoop {
    pub span: Span,
    pub pre: Block,
    pub condition: Expression,
    pub post: Block,
    pub body: Block,
}

/// A declared name (parameter, return variable, or let binding)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub span: Span,
    pub name: String,
}

/// Expression variants
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expression {
    Literal(Literal),
    Identifier(Identifier),
    FunctionCall(FunctionCall),
    BuiltinCall(BuiltinCall),
}

/// Literal payload classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiteralKind {
    Number,
    Boolean,
    String,
}

/// Literal number, boolean or string (textual payload)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Literal {
    pub span: Span,
    pub kind: LiteralKind,
    pub value: String,
}

/// Reference to a bound name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identifier {
    pub span: Span,
    pub name: String,
}

/// Call of a user-defined function
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionCall {
    pub span: Span,
    pub function: Identifier,
    pub arguments: Vec<Expression>,
}

/// Call of a target-machine builtin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltinCall {
    pub span: Span,
    pub op: Opcode,
    pub arguments: Vec<Expression>,
}

impl Statement {
    /// Source location of this statement
    pub fn span(&self) -> Span {
        match self {
            Statement::Expression(s) => s.span,
            Statement::VariableDeclaration(s) => s.span,
            Statement::Assignment(s) => s.span,
            Statement::FunctionDefinition(s) => s.span,
            Statement::If(s) => s.span,
            Statement::Switch(s) => s.span,
            Statement::ForLoop(s) => s.span,
            Statement::Break(span) | Statement::Continue(span) => *span,
            Statement::Block(s) => s.span,
        }
    }
}

impl Expression {
    /// Source location of this expression
    pub fn span(&self) -> Span {
        match self {
            Expression::Literal(e) => e.span,
            Expression::Identifier(e) => e.span,
            Expression::FunctionCall(e) => e.span,
            Expression::BuiltinCall(e) => e.span,
        }
    }

    /// Number literal with a decimal payload
    pub fn number(value: U256) -> Expression {
        Expression::Literal(Literal {
            span: Span::dummy(),
            kind: LiteralKind::Number,
            value: value.to_string(),
        })
    }

    /// Boolean literal
    pub fn boolean(value: bool) -> Expression {
        Expression::Literal(Literal {
            span: Span::dummy(),
            kind: LiteralKind::Boolean,
            value: if value { "true" } else { "false" }.into(),
        })
    }

    /// String literal
    pub fn string(value: impl Into<String>) -> Expression {
        Expression::Literal(Literal {
            span: Span::dummy(),
            kind: LiteralKind::String,
            value: value.into(),
        })
    }

    /// Identifier reference
    pub fn ident(name: impl Into<String>) -> Expression {
        Expression::Identifier(Identifier {
            span: Span::dummy(),
            name: name.into(),
        })
    }

    /// User function call
    pub fn call(name: impl Into<String>, arguments: Vec<Expression>) -> Expression {
        Expression::FunctionCall(FunctionCall {
            span: Span::dummy(),
            function: Identifier {
                span: Span::dummy(),
                name: name.into(),
            },
            arguments,
        })
    }

    /// Builtin call
    pub fn builtin(op: Opcode, arguments: Vec<Expression>) -> Expression {
        Expression::BuiltinCall(BuiltinCall {
            span: Span::dummy(),
            op,
            arguments,
        })
    }
}

impl Literal {
    /// Numeric value of a number or boolean literal
    pub fn numeric_value(&self) -> Result<U256> {
        match self.kind {
            LiteralKind::Number => {
                let text = self.value.as_str();
                let parsed = if let Some(hex) = text.strip_prefix("0x") {
                    U256::from_str_radix(hex, 16)
                } else {
                    U256::from_str_radix(text, 10)
                };
                parsed.map_err(|_| {
                    CoreError::internal_at(format!("invalid number literal `{}`", text), self.span)
                })
            }
            LiteralKind::Boolean => Ok(if self.value == "true" {
                U256::one()
            } else {
                U256::zero()
            }),
            LiteralKind::String => Err(CoreError::unimplemented_at(
                "numeric value of string literal",
                self.span,
            )),
        }
    }
}

impl Block {
    /// Block with the given statements and a dummy span
    pub fn of(statements: Vec<Statement>) -> Block {
        Block {
            span: Span::dummy(),
            statements,
        }
    }
}

impl Statement {
    /// Expression statement
    pub fn expr(expression: Expression) -> Statement {
        Statement::Expression(ExpressionStatement {
            span: Span::dummy(),
            expression,
        })
    }

    /// Single-name declaration, `let <name> := <value>`
    pub fn let_single(name: impl Into<String>, value: Option<Expression>) -> Statement {
        Statement::VariableDeclaration(VariableDeclaration {
            span: Span::dummy(),
            variables: vec![Binding::new(name)],
            value,
        })
    }

    /// Single-target assignment, `<name> := <value>`
    pub fn assign_single(name: impl Into<String>, value: Expression) -> Statement {
        Statement::Assignment(Assignment {
            span: Span::dummy(),
            targets: vec![Identifier {
                span: Span::dummy(),
                name: name.into(),
            }],
            value,
        })
    }
}

impl Binding {
    pub fn new(name: impl Into<String>) -> Binding {
        Binding {
            span: Span::dummy(),
            name: name.into(),
        }
    }
}

/// Structural equality ignoring source locations
///
/// The printer drops spans and the parser re-derives them, so round-trip
/// comparisons go through this instead of `PartialEq`.
pub fn syntactic_eq(a: &Block, b: &Block) -> bool {
    stmts_eq(&a.statements, &b.statements)
}

fn stmts_eq(a: &[Statement], b: &[Statement]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| stmt_eq(x, y))
}

fn stmt_eq(a: &Statement, b: &Statement) -> bool {
    use Statement::*;
    match (a, b) {
        (Expression(x), Expression(y)) => expr_eq(&x.expression, &y.expression),
        (VariableDeclaration(x), VariableDeclaration(y)) => {
            bindings_eq(&x.variables, &y.variables)
                && match (&x.value, &y.value) {
                    (None, None) => true,
                    (Some(u), Some(v)) => expr_eq(u, v),
                    _ => false,
                }
        }
        (Assignment(x), Assignment(y)) => {
            x.targets.len() == y.targets.len()
                && x.targets
                    .iter()
                    .zip(&y.targets)
                    .all(|(u, v)| u.name == v.name)
                && expr_eq(&x.value, &y.value)
        }
        (FunctionDefinition(x), FunctionDefinition(y)) => {
            x.name == y.name
                && bindings_eq(&x.parameters, &y.parameters)
                && bindings_eq(&x.returns, &y.returns)
                && syntactic_eq(&x.body, &y.body)
        }
        (If(x), If(y)) => expr_eq(&x.condition, &y.condition) && syntactic_eq(&x.body, &y.body),
        (Switch(x), Switch(y)) => {
            expr_eq(&x.expression, &y.expression)
                && x.cases.len() == y.cases.len()
                && x.cases.iter().zip(&y.cases).all(|(u, v)| {
                    syntactic_eq(&u.body, &v.body)
                        && match (&u.value, &v.value) {
                            (None, None) => true,
                            (Some(l), Some(r)) => l.kind == r.kind && l.value == r.value,
                            _ => false,
                        }
                })
        }
        (ForLoop(x), ForLoop(y)) => {
            syntactic_eq(&x.pre, &y.pre)
                && expr_eq(&x.condition, &y.condition)
                && syntactic_eq(&x.post, &y.post)
                && syntactic_eq(&x.body, &y.body)
        }
        (Break(_), Break(_)) | (Continue(_), Continue(_)) => true,
        (Block(x), Block(y)) => syntactic_eq(x, y),
        _ => false,
    }
}

fn bindings_eq(a: &[Binding], b: &[Binding]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.name == y.name)
}

/// Structural expression equality ignoring source locations
pub fn expr_eq(a: &Expression, b: &Expression) -> bool {
    use Expression::*;
    match (a, b) {
        (Literal(x), Literal(y)) => x.kind == y.kind && x.value == y.value,
        (Identifier(x), Identifier(y)) => x.name == y.name,
        (FunctionCall(x), FunctionCall(y)) => {
            x.function.name == y.function.name
                && x.arguments.len() == y.arguments.len()
                && x.arguments.iter().zip(&y.arguments).all(|(u, v)| expr_eq(u, v))
        }
        (BuiltinCall(x), BuiltinCall(y)) => {
            x.op == y.op
                && x.arguments.len() == y.arguments.len()
                && x.arguments.iter().zip(&y.arguments).all(|(u, v)| expr_eq(u, v))
        }
        _ => false,
    }
}
