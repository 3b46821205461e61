//! Function inlining pass
//!
//! Inlines calls that form the entire right-hand side of an expression
//! statement, assignment or variable declaration. A call is inlined when it
//! is not self-recursive and the callee is referenced exactly once anywhere,
//! or its body is below a small size threshold, or below a larger threshold
//! with at least one literal-constant argument.
//!
//! Prerequisite: globally unique names, function hoisting (no function
//! definitions nested inside other function bodies).

use crate::error::{CoreError, Result};
use crate::middle::ir::*;
use crate::middle::passes::copier::copy_block;
use crate::middle::passes::metrics::code_size;
use crate::middle::passes::names::{
    collect_names, count_references, literal_bindings, NameDispenser,
};
use crate::middle::passes::OptimizerSettings;
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use tracing::debug;

pub struct Inliner<'a> {
    dispenser: &'a mut NameDispenser,
    /// Callee bodies, refreshed after each function is processed so later
    /// decisions inline already-optimized code.
    functions: IndexMap<String, FunctionDefinition>,
    function_sizes: HashMap<String, usize>,
    /// Functions referenced exactly once anywhere
    always_inline: HashSet<String>,
    /// Names provably bound to a literal exactly once
    constants: HashSet<String>,
    small_size: usize,
    constant_bonus_size: usize,
}

impl<'a> Inliner<'a> {
    /// Run one inlining pass over the tree
    pub fn run(
        block: &mut Block,
        dispenser: &'a mut NameDispenser,
        settings: &OptimizerSettings,
    ) -> Result<()> {
        let mut inliner = Inliner::new(block, dispenser, settings);
        inliner.process(block)
    }

    fn new(
        block: &Block,
        dispenser: &'a mut NameDispenser,
        settings: &OptimizerSettings,
    ) -> Self {
        let constants = literal_bindings(block);
        let references = count_references(block);

        let mut functions = IndexMap::new();
        let mut function_sizes = HashMap::new();
        let mut always_inline = HashSet::new();
        collect_function_definitions(block, &mut functions);
        for (name, function) in &functions {
            function_sizes.insert(name.clone(), code_size(&function.body));
            if references.get(name).copied().unwrap_or(0) == 1 {
                always_inline.insert(name.clone());
            }
        }

        Self {
            dispenser,
            functions,
            function_sizes,
            always_inline,
            constants,
            small_size: settings.inline_small_size,
            constant_bonus_size: settings.inline_constant_bonus_size,
        }
    }

    fn process(&mut self, block: &mut Block) -> Result<()> {
        // Call sites outside any function first, then each function body
        // with its own name as the recursion guard.
        self.handle_block(None, block)?;
        let names: Vec<String> = self.functions.keys().cloned().collect();
        for name in names {
            self.process_function(block, &name)?;
        }
        Ok(())
    }

    fn process_function(&mut self, block: &mut Block, name: &str) -> Result<()> {
        let mut body = take_function_body(block, name).ok_or_else(|| {
            CoreError::internal(format!("inliner lost track of function `{}`", name))
        })?;
        self.handle_block(Some(name), &mut body)?;
        let size = code_size(&body);
        // Later call sites inline the already-processed body.
        if let Some(function) = self.functions.get_mut(name) {
            function.body = body.clone();
        }
        self.function_sizes.insert(name.to_string(), size);
        if !put_function_body(block, name, body) {
            return Err(CoreError::internal(format!(
                "inliner lost track of function `{}`",
                name
            )));
        }
        Ok(())
    }

    fn handle_block(&mut self, current: Option<&str>, block: &mut Block) -> Result<()> {
        let statements = std::mem::take(&mut block.statements);
        let mut out = Vec::with_capacity(statements.len());
        for mut statement in statements {
            match &mut statement {
                Statement::Block(inner) => self.handle_block(current, inner)?,
                Statement::If(s) => self.handle_block(current, &mut s.body)?,
                Statement::Switch(s) => {
                    for case in &mut s.cases {
                        self.handle_block(current, &mut case.body)?;
                    }
                }
                Statement::ForLoop(s) => {
                    self.handle_block(current, &mut s.pre)?;
                    self.handle_block(current, &mut s.post)?;
                    self.handle_block(current, &mut s.body)?;
                }
                // Function bodies are processed separately, with their own
                // name as call-site context.
                Statement::FunctionDefinition(_) => {}
                _ => {}
            }
            out.extend(self.try_inline_statement(current, statement)?);
        }
        block.statements = out;
        Ok(())
    }

    /// Inline the statement's right-hand-side call if eligible; otherwise
    /// return the statement unchanged.
    fn try_inline_statement(
        &mut self,
        current: Option<&str>,
        statement: Statement,
    ) -> Result<Vec<Statement>> {
        let call = match &statement {
            Statement::Expression(s) => match &s.expression {
                Expression::FunctionCall(call) => Some(call),
                _ => None,
            },
            Statement::Assignment(s) => match &s.value {
                Expression::FunctionCall(call) => Some(call),
                _ => None,
            },
            Statement::VariableDeclaration(s) => match &s.value {
                Some(Expression::FunctionCall(call)) => Some(call),
                _ => None,
            },
            _ => None,
        };
        match call {
            Some(call) if self.shall_inline(call, current) => self.perform_inline(statement),
            _ => Ok(vec![statement]),
        }
    }

    fn shall_inline(&self, call: &FunctionCall, call_site: Option<&str>) -> bool {
        // No recursive inlining.
        if Some(call.function.name.as_str()) == call_site {
            return false;
        }
        let Some(function) = self.functions.get(&call.function.name) else {
            return false;
        };
        if self.always_inline.contains(&function.name) {
            return true;
        }
        // Constant arguments open up further folding, so they earn a
        // larger size allowance.
        let constant_arg = call.arguments.iter().any(|argument| match argument {
            Expression::Literal(_) => true,
            Expression::Identifier(identifier) => self.constants.contains(&identifier.name),
            _ => false,
        });
        let size = self
            .function_sizes
            .get(&function.name)
            .copied()
            .unwrap_or(usize::MAX);
        size < self.small_size || (constant_arg && size < self.constant_bonus_size)
    }

    fn perform_inline(&mut self, statement: Statement) -> Result<Vec<Statement>> {
        let (call, outs) = split_statement(statement)?;
        let function = self
            .functions
            .get(&call.function.name)
            .cloned()
            .ok_or_else(|| {
                CoreError::internal(format!(
                    "inline of unknown function `{}`",
                    call.function.name
                ))
            })?;
        if function.parameters.len() != call.arguments.len() {
            return Err(CoreError::internal_at(
                format!("argument count mismatch inlining `{}`", function.name),
                call.span,
            ));
        }
        debug!(function = %function.name, "inlining call");

        let mut replacements: HashMap<String, String> = HashMap::new();
        let mut statements = Vec::new();

        // Bind each formal to its argument, each named return to nothing.
        for (parameter, argument) in function.parameters.iter().zip(call.arguments) {
            let fresh = self.dispenser.new_name(&parameter.name, &function.name);
            replacements.insert(parameter.name.clone(), fresh.clone());
            statements.push(Statement::let_single(fresh, Some(argument)));
        }
        for ret in &function.returns {
            let fresh = self.dispenser.new_name(&ret.name, &function.name);
            replacements.insert(ret.name.clone(), fresh.clone());
            statements.push(Statement::let_single(fresh, None));
        }

        // Every name declared inside the body gets a fresh replacement
        // before the structural copy.
        for declared in collect_names(&function.body) {
            if !replacements.contains_key(&declared) {
                let fresh = self.dispenser.new_name(&declared, &function.name);
                replacements.insert(declared, fresh);
            }
        }
        if contains_function_definition(&function.body) {
            return Err(CoreError::internal(
                "function hoisting must run before inlining",
            ));
        }
        let body = copy_block(&function.body, &mut |name| {
            replacements
                .get(name)
                .cloned()
                .unwrap_or_else(|| name.to_string())
        });
        statements.extend(body.statements);

        // Copy renamed returns into the original targets.
        match outs {
            InlineOuts::Discard => {}
            InlineOuts::Assign(targets) => {
                if targets.len() != function.returns.len() {
                    return Err(CoreError::internal(format!(
                        "return arity mismatch inlining `{}`",
                        function.name
                    )));
                }
                for (target, ret) in targets.into_iter().zip(&function.returns) {
                    statements.push(Statement::Assignment(Assignment {
                        span: target.span,
                        targets: vec![target],
                        value: Expression::ident(replacements[&ret.name].clone()),
                    }));
                }
            }
            InlineOuts::Declare(variables) => {
                if variables.len() != function.returns.len() {
                    return Err(CoreError::internal(format!(
                        "return arity mismatch inlining `{}`",
                        function.name
                    )));
                }
                for (variable, ret) in variables.into_iter().zip(&function.returns) {
                    statements.push(Statement::VariableDeclaration(VariableDeclaration {
                        span: variable.span,
                        variables: vec![variable],
                        value: Some(Expression::ident(replacements[&ret.name].clone())),
                    }));
                }
            }
        }
        Ok(statements)
    }
}

enum InlineOuts {
    Discard,
    Assign(Vec<Identifier>),
    Declare(Vec<Binding>),
}

fn split_statement(statement: Statement) -> Result<(FunctionCall, InlineOuts)> {
    match statement {
        Statement::Expression(s) => match s.expression {
            Expression::FunctionCall(call) => Ok((call, InlineOuts::Discard)),
            _ => Err(CoreError::internal("inline of non-call statement")),
        },
        Statement::Assignment(s) => match s.value {
            Expression::FunctionCall(call) => Ok((call, InlineOuts::Assign(s.targets))),
            _ => Err(CoreError::internal("inline of non-call assignment")),
        },
        Statement::VariableDeclaration(s) => match s.value {
            Some(Expression::FunctionCall(call)) => Ok((call, InlineOuts::Declare(s.variables))),
            _ => Err(CoreError::internal("inline of non-call declaration")),
        },
        _ => Err(CoreError::internal("inline of unsupported statement")),
    }
}

fn collect_function_definitions(block: &Block, out: &mut IndexMap<String, FunctionDefinition>) {
    for statement in &block.statements {
        match statement {
            Statement::FunctionDefinition(function) => {
                out.insert(function.name.clone(), function.clone());
            }
            Statement::Block(inner) => collect_function_definitions(inner, out),
            Statement::If(s) => collect_function_definitions(&s.body, out),
            Statement::Switch(s) => {
                for case in &s.cases {
                    collect_function_definitions(&case.body, out);
                }
            }
            Statement::ForLoop(s) => {
                collect_function_definitions(&s.pre, out);
                collect_function_definitions(&s.post, out);
                collect_function_definitions(&s.body, out);
            }
            _ => {}
        }
    }
}

/// Detach the named function's body from the tree, leaving it empty
fn take_function_body(block: &mut Block, name: &str) -> Option<Block> {
    for statement in &mut block.statements {
        let taken = match statement {
            Statement::FunctionDefinition(function) => {
                if function.name == name {
                    return Some(std::mem::take(&mut function.body));
                }
                None
            }
            Statement::Block(inner) => take_function_body(inner, name),
            Statement::If(s) => take_function_body(&mut s.body, name),
            Statement::Switch(s) => s
                .cases
                .iter_mut()
                .find_map(|case| take_function_body(&mut case.body, name)),
            Statement::ForLoop(s) => take_function_body(&mut s.pre, name)
                .or_else(|| take_function_body(&mut s.post, name))
                .or_else(|| take_function_body(&mut s.body, name)),
            _ => None,
        };
        if taken.is_some() {
            return taken;
        }
    }
    None
}

/// Re-attach a detached function body; true on success
fn put_function_body(block: &mut Block, name: &str, body: Block) -> bool {
    let mut body = Some(body);
    put_function_body_inner(block, name, &mut body)
}

fn put_function_body_inner(block: &mut Block, name: &str, body: &mut Option<Block>) -> bool {
    for statement in &mut block.statements {
        let done = match statement {
            Statement::FunctionDefinition(function) => {
                if function.name == name {
                    function.body = body.take().expect("body placed exactly once");
                    true
                } else {
                    false
                }
            }
            Statement::Block(inner) => put_function_body_inner(inner, name, body),
            Statement::If(s) => put_function_body_inner(&mut s.body, name, body),
            Statement::Switch(s) => s
                .cases
                .iter_mut()
                .any(|case| put_function_body_inner(&mut case.body, name, body)),
            Statement::ForLoop(s) => {
                put_function_body_inner(&mut s.pre, name, body)
                    || put_function_body_inner(&mut s.post, name, body)
                    || put_function_body_inner(&mut s.body, name, body)
            }
            _ => false,
        };
        if done {
            return true;
        }
    }
    false
}

fn contains_function_definition(block: &Block) -> bool {
    block.statements.iter().any(|statement| match statement {
        Statement::FunctionDefinition(_) => true,
        Statement::Block(inner) => contains_function_definition(inner),
        Statement::If(s) => contains_function_definition(&s.body),
        Statement::Switch(s) => s
            .cases
            .iter()
            .any(|case| contains_function_definition(&case.body)),
        Statement::ForLoop(s) => {
            contains_function_definition(&s.pre)
                || contains_function_definition(&s.post)
                || contains_function_definition(&s.body)
        }
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middle::ir::parser::parse_block;
    use crate::middle::ir::printer::print_block;

    fn run_inliner(source: &str) -> Block {
        let mut block = parse_block(source).unwrap();
        let mut dispenser = NameDispenser::new(&block);
        let settings = OptimizerSettings::default();
        Inliner::run(&mut block, &mut dispenser, &settings).unwrap();
        block
    }

    #[test]
    fn test_single_use_function_is_inlined() {
        let block = run_inliner(
            "{ let r := double(3) function double(x) -> y { y := add(x, x) } }",
        );
        let printed = print_block(&block);
        // The call site is expanded into bindings plus the body copy.
        assert!(!printed.contains("double(3)"));
        assert!(printed.contains("let double_x := 3"));
        assert!(printed.contains("let r := double_y"));
    }

    #[test]
    fn test_no_recursive_inlining() {
        let block = run_inliner(
            "{ let r := f(1) function f(x) -> y { y := f(x) } pop(r) }",
        );
        let printed = print_block(&block);
        // The recursive call inside f's own body must survive.
        assert!(printed.contains("f(f_x)") || printed.contains(":= f("));
    }

    #[test]
    fn test_large_function_without_constants_stays() {
        let body = "m := add(a, b) m := add(m, a) m := add(m, b) m := add(m, a) \
                    m := add(m, b) m := add(m, a) m := add(m, b) m := add(m, a)";
        let source = format!(
            "{{ let p := q() let r := big(p, p) let s := big(p, r) pop(add(r, s)) \
               let q_v := 1 function big(a, b) -> m {{ {} }} function q() -> o {{ o := mload(0) }} }}",
            body
        );
        let block = run_inliner(&source);
        let printed = print_block(&block);
        // Two call sites, body too large for the plain threshold, no
        // literal arguments: both calls must remain.
        assert!(printed.contains("big(p, p)"));
        assert!(printed.contains("big(p, r)"));
    }

    #[test]
    fn test_constant_argument_bonus() {
        let body = "m := add(a, b) m := add(m, a) m := add(m, b) m := add(m, a)";
        let source = format!(
            "{{ let r := big(1, mload(0)) let s := big(mload(1), mload(2)) pop(add(r, s)) \
               function big(a, b) -> m {{ {} }} }}",
            body
        );
        let block = run_inliner(&source);
        let printed = print_block(&block);
        // The literal-argument call is inlined, the other one is kept.
        assert!(!printed.contains("big(1, mload(0))"));
        assert!(printed.contains("big(mload(1), mload(2))"));
    }
}
