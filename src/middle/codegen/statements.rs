//! Typed AST → IR translation at statement level and below
//!
//! One forward recursive pass, no backtracking. Every sub-expression value
//! is bound to its own `expr_<id>` variable; statements append to a
//! growing buffer that becomes the surrounding block. Anything the slice
//! does not cover fails loudly as a staging error instead of
//! mistranslating.

use crate::error::{CoreError, Result};
use crate::frontend::ast::{
    BinOp, DeclKind, Expr, ExprKind, ExternalRef, LiteralValue, Stmt, StmtKind,
};
use crate::frontend::types::Type;
use crate::middle::codegen::context::Context;
use crate::middle::ir::{self, Block, Expression, Statement};
use crate::middle::passes::copier::copy_block;
use primitive_types::U256;
use std::collections::HashMap;

/// Name of the synthetic "keep looping" flag threaded through every
/// generated function body
pub const RETURN_FLAG: &str = "return_flag";

pub struct StatementGenerator<'a, 'c> {
    ctx: &'c mut Context<'a>,
    /// Return variable of the enclosing function, if any
    return_variable: Option<&'a crate::frontend::ast::VariableDeclaration>,
    body: Vec<Statement>,
}

impl<'a, 'c> StatementGenerator<'a, 'c> {
    pub fn new(
        ctx: &'c mut Context<'a>,
        return_variable: Option<&'a crate::frontend::ast::VariableDeclaration>,
    ) -> Self {
        Self {
            ctx,
            return_variable,
            body: Vec::new(),
        }
    }

    /// Finish and hand back the generated statements
    pub fn into_statements(self) -> Vec<Statement> {
        self.body
    }

    /// Generate a sub-block into a fresh buffer sharing this context
    fn subgenerate(&mut self, generate: impl FnOnce(&mut Self) -> Result<()>) -> Result<Block> {
        let saved = std::mem::take(&mut self.body);
        let result = generate(self);
        let statements = std::mem::replace(&mut self.body, saved);
        result?;
        Ok(Block::of(statements))
    }

    pub fn generate_statement(&mut self, stmt: &'a Stmt) -> Result<()> {
        match &stmt.kind {
            StmtKind::Block(statements) => {
                let block = self.subgenerate(|generator| {
                    for statement in statements {
                        generator.generate_statement(statement)?;
                    }
                    Ok(())
                })?;
                self.body.push(Statement::Block(block));
                Ok(())
            }
            StmtKind::VarDecl { decls, init } => self.generate_var_decl(stmt, decls, init),
            StmtKind::Expression(expr) => self.generate_expr(expr),
            StmtKind::If { .. } => Err(CoreError::unimplemented_at("if statements", stmt.span)),
            StmtKind::For {
                init,
                cond,
                post,
                body,
            } => self.generate_for(init, cond, post, body),
            StmtKind::Return { value } => self.generate_return(stmt, value),
            StmtKind::Break => {
                self.body.push(Statement::Break(stmt.span));
                Ok(())
            }
            StmtKind::Continue => {
                self.body.push(Statement::Continue(stmt.span));
                Ok(())
            }
            StmtKind::InlineIr {
                block,
                external_refs,
            } => self.generate_inline_ir(block, external_refs),
        }
    }

    fn generate_var_decl(
        &mut self,
        stmt: &Stmt,
        decls: &'a [crate::frontend::ast::VariableDeclaration],
        init: &'a Option<Expr>,
    ) -> Result<()> {
        for decl in decls {
            self.ctx.add_local_variable(decl)?;
        }
        match init {
            Some(expression) => {
                if decls.len() != 1 {
                    return Err(CoreError::unimplemented_at(
                        "destructuring declarations",
                        stmt.span,
                    ));
                }
                self.generate_expr(expression)?;
                let decl = &decls[0];
                let value = self.expression_as_type(expression, &decl.ty)?;
                self.body.push(Statement::let_single(
                    self.ctx.variable_name(decl)?,
                    Some(value),
                ));
            }
            None => {
                for decl in decls {
                    self.body
                        .push(Statement::let_single(self.ctx.variable_name(decl)?, None));
                }
            }
        }
        Ok(())
    }

    /// Loops thread the synthetic flag so an inner `return` clears it and
    /// breaks the innermost loop; each enclosing loop re-checks the flag
    /// to propagate termination outward.
    fn generate_for(
        &mut self,
        init: &'a Option<Box<Stmt>>,
        cond: &'a Option<Expr>,
        post: &'a Option<Expr>,
        body: &'a Stmt,
    ) -> Result<()> {
        let pre = self.subgenerate(|generator| {
            if let Some(statement) = init {
                generator.generate_statement(statement)?;
            }
            Ok(())
        })?;
        let post_block = self.subgenerate(|generator| {
            if let Some(expression) = post {
                generator.generate_expr(expression)?;
            }
            Ok(())
        })?;
        let loop_body = self.subgenerate(|generator| {
            if let Some(condition) = cond {
                generator.generate_expr(condition)?;
                let as_bool = generator.expression_as_type(condition, &Type::Bool)?;
                generator.body.push(Statement::If(ir::If {
                    span: condition.span,
                    condition: Expression::builtin(
                        crate::backends::opcode::Opcode::IsZero,
                        vec![as_bool],
                    ),
                    body: Block::of(vec![Statement::Break(condition.span)]),
                }));
            }
            generator.generate_statement(body)
        })?;
        self.body.push(Statement::ForLoop(ir::ForLoop {
            span: body.span,
            pre,
            condition: Expression::ident(RETURN_FLAG),
            post: post_block,
            body: loop_body,
        }));
        // Bubble the termination flag out of this loop level.
        self.body.push(Statement::If(ir::If {
            span: body.span,
            condition: Expression::builtin(
                crate::backends::opcode::Opcode::IsZero,
                vec![Expression::ident(RETURN_FLAG)],
            ),
            body: Block::of(vec![Statement::Break(body.span)]),
        }));
        Ok(())
    }

    fn generate_return(&mut self, stmt: &Stmt, value: &'a Option<Expr>) -> Result<()> {
        if let Some(expression) = value {
            let ret = self.return_variable.ok_or_else(|| {
                CoreError::internal_at("return with value outside a function", stmt.span)
            })?;
            self.generate_expr(expression)?;
            let converted = self.expression_as_type(expression, &ret.ty)?;
            self.body.push(Statement::assign_single(
                self.ctx.variable_name(ret)?,
                converted,
            ));
        }
        self.body.push(Statement::assign_single(
            RETURN_FLAG,
            Expression::number(U256::zero()),
        ));
        self.body.push(Statement::Break(stmt.span));
        Ok(())
    }

    /// Inline low-level blocks are copied structurally: identifiers the
    /// collaborator resolved to outer declarations become the generated
    /// variable names, everything else gets a namespacing prefix so
    /// user-chosen names cannot collide with generated ones.
    fn generate_inline_ir(
        &mut self,
        block: &ir::Block,
        external_refs: &[ExternalRef],
    ) -> Result<()> {
        let mut resolved: HashMap<String, String> = HashMap::new();
        for reference in external_refs {
            if reference.is_offset || reference.is_slot {
                return Err(CoreError::unimplemented(
                    "offset/slot references from inline blocks",
                ));
            }
            let name = self
                .ctx
                .variable_name_by_id(reference.decl)
                .ok_or_else(|| {
                    CoreError::internal(format!(
                        "inline block references unknown declaration `{}`",
                        reference.name
                    ))
                })?;
            resolved.insert(reference.name.clone(), name);
        }
        let copied = copy_block(block, &mut |name| {
            resolved
                .get(name)
                .cloned()
                .unwrap_or_else(|| format!("usr${}", name))
        });
        self.body.push(Statement::Block(copied));
        Ok(())
    }

    /// Evaluate an expression, leaving its value bound to `expr_<id>`
    pub fn generate_expr(&mut self, expr: &'a Expr) -> Result<()> {
        match &expr.kind {
            ExprKind::Literal(literal) => {
                let value = match literal {
                    LiteralValue::Bool(flag) => Expression::boolean(*flag),
                    LiteralValue::Number(value) => hex_number(*value),
                };
                self.define_expression(expr, value)
            }
            ExprKind::Identifier(reference) => match reference.kind {
                DeclKind::Variable => {
                    let name = self.ctx.variable_name_by_id(reference.id).ok_or_else(|| {
                        CoreError::internal_at("identifier resolves to unknown variable", expr.span)
                    })?;
                    self.define_expression(expr, Expression::ident(name))
                }
                DeclKind::Function => {
                    // A function used as a value becomes its numeric id,
                    // resolved virtually; calls route through dispatch.
                    let function = self.ctx.find_function_by_id(reference.id).ok_or_else(|| {
                        CoreError::internal_at(
                            "identifier resolves to unknown function",
                            expr.span,
                        )
                    })?;
                    let resolved = self.ctx.virtual_function(function)?;
                    self.define_expression(expr, Expression::number(U256::from(resolved.id)))
                }
            },
            ExprKind::Binary { op, lhs, rhs } => self.generate_binary(expr, *op, lhs, rhs),
            ExprKind::Assignment { lhs, rhs } => self.generate_assignment(expr, lhs, rhs),
            ExprKind::Call { callee, args } => self.generate_call(expr, callee, args),
        }
    }

    fn generate_binary(
        &mut self,
        expr: &'a Expr,
        op: BinOp,
        lhs: &'a Expr,
        rhs: &'a Expr,
    ) -> Result<()> {
        if matches!(op, BinOp::And | BinOp::Or) {
            return Err(CoreError::unimplemented_at(
                "short-circuiting boolean operators",
                expr.span,
            ));
        }
        // A rational result was folded by the front end already.
        if let Type::Rational(value) = &expr.ty {
            return self.define_expression(expr, hex_number(*value));
        }
        if op != BinOp::Add {
            return Err(CoreError::unimplemented_at(
                format!("binary operator `{}`", op.as_str()),
                expr.span,
            ));
        }
        let Type::UInt(bits) = &expr.ty else {
            return Err(CoreError::unimplemented_at(
                format!("addition on `{}`", expr.ty),
                expr.span,
            ));
        };
        let bits = *bits;
        self.generate_expr(lhs)?;
        self.generate_expr(rhs)?;
        let left = self.expression_as_type(lhs, &expr.ty)?;
        let right = self.expression_as_type(rhs, &expr.ty)?;
        let helper = self.ctx.checked_add_function(bits)?;
        self.define_expression(expr, Expression::call(helper, vec![left, right]))
    }

    fn generate_assignment(&mut self, expr: &'a Expr, lhs: &'a Expr, rhs: &'a Expr) -> Result<()> {
        self.generate_expr(rhs)?;
        let ExprKind::Identifier(reference) = &lhs.kind else {
            return Err(CoreError::unimplemented_at(
                "assignment to a non-identifier target",
                lhs.span,
            ));
        };
        if reference.kind != DeclKind::Variable {
            return Err(CoreError::unimplemented_at(
                "assignment to a non-variable target",
                lhs.span,
            ));
        }
        let name = self.ctx.variable_name_by_id(reference.id).ok_or_else(|| {
            CoreError::internal_at("assignment target resolves to unknown variable", lhs.span)
        })?;
        let value = self.expression_as_type(rhs, &lhs.ty)?;
        self.body.push(Statement::assign_single(name.clone(), value));
        // The assignment expression itself yields the stored value.
        self.define_expression(expr, Expression::ident(name))
    }

    fn generate_call(&mut self, expr: &'a Expr, callee: &'a Expr, args: &'a [Expr]) -> Result<()> {
        let Some(function_type) = callee.function_type().cloned() else {
            return Err(CoreError::unimplemented_at(
                "call of a non-function expression",
                callee.span,
            ));
        };
        if !function_type.arbitrary_params && args.len() != function_type.params.len() {
            return Err(CoreError::internal_at(
                "argument count mismatch survived the front end",
                expr.span,
            ));
        }

        // Arguments evaluate strictly left to right; each is converted to
        // its formal type unless the callee accepts arbitrary parameters.
        let mut lowered_args = Vec::with_capacity(args.len());
        for (index, argument) in args.iter().enumerate() {
            self.generate_expr(argument)?;
            if function_type.arbitrary_params {
                lowered_args.push(Expression::ident(self.ctx.expression_name(argument)?));
            } else {
                lowered_args
                    .push(self.expression_as_type(argument, &function_type.params[index])?);
            }
        }

        // A statically known callee resolves virtually; anything else
        // (including a function-typed variable) evaluates to a numeric id
        // routed through internal dispatch.
        let call = match &callee.kind {
            ExprKind::Identifier(reference) if reference.kind == DeclKind::Function => {
                let function = self.ctx.find_function_by_id(reference.id).ok_or_else(|| {
                    CoreError::internal_at("callee resolves to unknown function", callee.span)
                })?;
                let name = self.ctx.virtual_function_name(function)?;
                Expression::call(name, lowered_args)
            }
            _ => {
                self.generate_expr(callee)?;
                let dispatch = self
                    .ctx
                    .internal_dispatch(function_type.params.len(), function_type.returns.len())?;
                let mut dispatch_args = Vec::with_capacity(lowered_args.len() + 1);
                dispatch_args.push(Expression::ident(self.ctx.expression_name(callee)?));
                dispatch_args.extend(lowered_args);
                Expression::call(dispatch, dispatch_args)
            }
        };

        match function_type.returns.len() {
            0 => {
                self.body.push(Statement::expr(call));
                Ok(())
            }
            1 => self.define_expression(expr, call),
            _ => Err(CoreError::unimplemented_at(
                "calls returning multiple values",
                expr.span,
            )),
        }
    }

    /// Value of `expr` converted to type `to`; assumes the expression was
    /// already generated.
    fn expression_as_type(&mut self, expr: &Expr, to: &Type) -> Result<Expression> {
        let name = self.ctx.expression_name(expr)?;
        match self.ctx.conversion_function(&expr.ty, to)? {
            None => Ok(Expression::ident(name)),
            Some(conversion) => Ok(Expression::call(conversion, vec![Expression::ident(name)])),
        }
    }

    /// Bind the expression's value: `let expr_<id> := <value>`
    fn define_expression(&mut self, expr: &Expr, value: Expression) -> Result<()> {
        let name = self.ctx.expression_name(expr)?;
        self.body.push(Statement::let_single(name, Some(value)));
        Ok(())
    }
}

/// Compact hex rendering used for generated number literals
fn hex_number(value: U256) -> Expression {
    Expression::Literal(ir::Literal {
        span: crate::util::span::Span::dummy(),
        kind: ir::LiteralKind::Number,
        value: format!("0x{:x}", value),
    })
}
