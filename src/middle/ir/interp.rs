//! Reference tree-walking interpreter for the IR
//!
//! Executes a tree directly and records an observable trace: one entry per
//! side-effecting builtin, in execution order. The optimizer tests compare
//! traces before and after a pass to check behavior preservation.
//!
//! The memory model is word-granular: `mstore(p, v)` stores a full word at
//! address `p` and `mload(p)` reads it back; overlapping unaligned access
//! is not modeled. Call arguments evaluate right to left, matching the
//! stack lowering.

use crate::backends::opcode::Opcode;
use crate::error::{CoreError, Result};
use crate::middle::ir::*;
use primitive_types::U256;
use std::collections::HashMap;

/// Execution state and observable results
pub struct Interpreter {
    functions: HashMap<String, FunctionDefinition>,
    scopes: Vec<HashMap<String, U256>>,
    memory: HashMap<U256, U256>,
    inputs: Vec<U256>,
    trace: Vec<String>,
    steps: usize,
    halted: bool,
}

enum ControlFlow {
    Normal,
    Break,
    Continue,
    Halt,
}

/// Upper bound on executed statements, against runaway test programs
const STEP_LIMIT: usize = 100_000;

impl Interpreter {
    /// Prepare an interpreter for the given tree
    ///
    /// Function definitions are collected from the whole tree up front;
    /// the unique-names precondition makes one flat registry sufficient.
    pub fn new(block: &Block, inputs: Vec<U256>) -> Self {
        let mut functions = HashMap::new();
        collect_functions(block, &mut functions);
        Self {
            functions,
            scopes: Vec::new(),
            memory: HashMap::new(),
            inputs,
            trace: Vec::new(),
            steps: 0,
            halted: false,
        }
    }

    /// Execute the tree to completion
    pub fn run(&mut self, block: &Block) -> Result<()> {
        self.execute_block(block)?;
        Ok(())
    }

    /// Observable trace of side-effecting builtins, in execution order
    pub fn trace(&self) -> &[String] {
        &self.trace
    }

    /// Word stored at the given memory address
    pub fn memory_word(&self, address: U256) -> U256 {
        self.memory.get(&address).copied().unwrap_or_default()
    }

    fn execute_block(&mut self, block: &Block) -> Result<ControlFlow> {
        self.scopes.push(HashMap::new());
        let flow = self.execute_statements(&block.statements);
        self.scopes.pop();
        flow
    }

    fn execute_statements(&mut self, statements: &[Statement]) -> Result<ControlFlow> {
        for statement in statements {
            if self.halted {
                return Ok(ControlFlow::Halt);
            }
            match self.execute_statement(statement)? {
                ControlFlow::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(ControlFlow::Normal)
    }

    fn execute_statement(&mut self, statement: &Statement) -> Result<ControlFlow> {
        self.steps += 1;
        if self.steps > STEP_LIMIT {
            return Err(CoreError::internal("interpreter step limit exceeded"));
        }
        match statement {
            Statement::FunctionDefinition(_) => Ok(ControlFlow::Normal),
            Statement::VariableDeclaration(decl) => {
                let values = match &decl.value {
                    Some(value) => self.eval_multi(value, decl.variables.len())?,
                    None => vec![U256::zero(); decl.variables.len()],
                };
                for (variable, value) in decl.variables.iter().zip(values) {
                    self.scopes
                        .last_mut()
                        .expect("scope stack never empty during execution")
                        .insert(variable.name.clone(), value);
                }
                Ok(ControlFlow::Normal)
            }
            Statement::Assignment(assign) => {
                let values = self.eval_multi(&assign.value, assign.targets.len())?;
                for (target, value) in assign.targets.iter().zip(values) {
                    self.set_variable(&target.name, value, target.span)?;
                }
                Ok(ControlFlow::Normal)
            }
            Statement::Expression(statement) => {
                let values = self.eval(&statement.expression)?;
                if !values.is_empty() {
                    return Err(CoreError::internal_at(
                        "expression statement with leftover values",
                        statement.span,
                    ));
                }
                Ok(ControlFlow::Normal)
            }
            Statement::If(statement) => {
                let condition = self.eval_single(&statement.condition)?;
                if !condition.is_zero() {
                    return self.execute_block(&statement.body);
                }
                Ok(ControlFlow::Normal)
            }
            Statement::Switch(statement) => {
                let selector = self.eval_single(&statement.expression)?;
                let mut default = None;
                for case in &statement.cases {
                    match &case.value {
                        Some(literal) => {
                            if literal.numeric_value()? == selector {
                                return self.execute_block(&case.body);
                            }
                        }
                        None => default = Some(&case.body),
                    }
                }
                if let Some(body) = default {
                    return self.execute_block(body);
                }
                Ok(ControlFlow::Normal)
            }
            Statement::ForLoop(statement) => self.execute_for(statement),
            Statement::Break(_) => Ok(ControlFlow::Break),
            Statement::Continue(_) => Ok(ControlFlow::Continue),
            Statement::Block(block) => self.execute_block(block),
        }
    }

    fn execute_for(&mut self, statement: &ForLoop) -> Result<ControlFlow> {
        // The pre block's scope encloses condition, post and body.
        self.scopes.push(HashMap::new());
        let result = (|| {
            match self.execute_statements(&statement.pre.statements)? {
                ControlFlow::Normal => {}
                other => return Ok(other),
            }
            loop {
                if self.eval_single(&statement.condition)?.is_zero() {
                    return Ok(ControlFlow::Normal);
                }
                match self.execute_block(&statement.body)? {
                    ControlFlow::Break => return Ok(ControlFlow::Normal),
                    ControlFlow::Halt => return Ok(ControlFlow::Halt),
                    ControlFlow::Normal | ControlFlow::Continue => {}
                }
                match self.execute_block(&statement.post)? {
                    ControlFlow::Normal => {}
                    ControlFlow::Halt => return Ok(ControlFlow::Halt),
                    other => return Ok(other),
                }
            }
        })();
        self.scopes.pop();
        result
    }

    fn eval_single(&mut self, expression: &Expression) -> Result<U256> {
        let values = self.eval(expression)?;
        if values.len() != 1 {
            return Err(CoreError::internal_at(
                format!("expected one value, got {}", values.len()),
                expression.span(),
            ));
        }
        Ok(values[0])
    }

    fn eval_multi(&mut self, expression: &Expression, expected: usize) -> Result<Vec<U256>> {
        let values = self.eval(expression)?;
        if values.len() != expected {
            return Err(CoreError::internal_at(
                format!("expected {} values, got {}", expected, values.len()),
                expression.span(),
            ));
        }
        Ok(values)
    }

    fn eval(&mut self, expression: &Expression) -> Result<Vec<U256>> {
        match expression {
            Expression::Literal(literal) => Ok(vec![literal.numeric_value()?]),
            Expression::Identifier(identifier) => {
                Ok(vec![self.get_variable(&identifier.name, identifier.span)?])
            }
            Expression::BuiltinCall(call) => {
                let args = self.eval_arguments(&call.arguments)?;
                self.eval_builtin(call, args)
            }
            Expression::FunctionCall(call) => {
                let args = self.eval_arguments(&call.arguments)?;
                self.call_function(call, args)
            }
        }
    }

    /// Arguments evaluate right to left; results are returned in source order.
    fn eval_arguments(&mut self, arguments: &[Expression]) -> Result<Vec<U256>> {
        let mut values = vec![U256::zero(); arguments.len()];
        for (index, argument) in arguments.iter().enumerate().rev() {
            values[index] = self.eval_single(argument)?;
        }
        Ok(values)
    }

    fn call_function(&mut self, call: &FunctionCall, args: Vec<U256>) -> Result<Vec<U256>> {
        let function = self
            .functions
            .get(&call.function.name)
            .cloned()
            .ok_or_else(|| {
                CoreError::internal_at(
                    format!("call of unknown function `{}`", call.function.name),
                    call.span,
                )
            })?;
        if function.parameters.len() != args.len() {
            return Err(CoreError::internal_at(
                format!("argument count mismatch calling `{}`", function.name),
                call.span,
            ));
        }
        let mut frame = HashMap::new();
        for (parameter, value) in function.parameters.iter().zip(args) {
            frame.insert(parameter.name.clone(), value);
        }
        for ret in &function.returns {
            frame.insert(ret.name.clone(), U256::zero());
        }
        let saved = std::mem::take(&mut self.scopes);
        self.scopes.push(frame);
        let flow = self.execute_statements(&function.body.statements);
        let frame = self.scopes.pop().expect("function frame present");
        self.scopes = saved;
        flow?;
        Ok(function
            .returns
            .iter()
            .map(|ret| frame.get(&ret.name).copied().unwrap_or_default())
            .collect())
    }

    fn eval_builtin(&mut self, call: &BuiltinCall, args: Vec<U256>) -> Result<Vec<U256>> {
        use Opcode::*;
        let info = call.op.info();
        if args.len() != info.args {
            return Err(CoreError::internal_at(
                format!("builtin `{}` expects {} arguments", call.op, info.args),
                call.span,
            ));
        }
        let zero = U256::zero();
        let value = match call.op {
            Add => args[0].overflowing_add(args[1]).0,
            Mul => args[0].overflowing_mul(args[1]).0,
            Sub => args[0].overflowing_sub(args[1]).0,
            Div => {
                if args[1].is_zero() {
                    zero
                } else {
                    args[0] / args[1]
                }
            }
            Mod => {
                if args[1].is_zero() {
                    zero
                } else {
                    args[0] % args[1]
                }
            }
            Lt => bool_word(args[0] < args[1]),
            Gt => bool_word(args[0] > args[1]),
            Eq => bool_word(args[0] == args[1]),
            IsZero => bool_word(args[0].is_zero()),
            And => args[0] & args[1],
            Or => args[0] | args[1],
            Xor => args[0] ^ args[1],
            Not => !args[0],
            Shl => {
                if args[0] >= U256::from(256) {
                    zero
                } else {
                    args[1] << args[0].as_usize()
                }
            }
            Shr => {
                if args[0] >= U256::from(256) {
                    zero
                } else {
                    args[1] >> args[0].as_usize()
                }
            }
            Input => self
                .inputs
                .get(args[0].low_u64() as usize)
                .copied()
                .unwrap_or(zero),
            InputSize => U256::from(self.inputs.len()),
            Pop => return Ok(vec![]),
            MLoad => self.memory_word(args[0]),
            MStore => {
                self.trace.push(format!("mstore({}, {})", args[0], args[1]));
                self.memory.insert(args[0], args[1]);
                return Ok(vec![]);
            }
            DataCopy => {
                self.trace
                    .push(format!("datacopy({}, {}, {})", args[0], args[1], args[2]));
                return Ok(vec![]);
            }
            Stop => {
                self.trace.push("stop".into());
                self.halted = true;
                return Ok(vec![]);
            }
            Finish => {
                self.trace.push(format!("finish({}, {})", args[0], args[1]));
                self.halted = true;
                return Ok(vec![]);
            }
            Abort => {
                self.trace.push(format!("abort({}, {})", args[0], args[1]));
                self.halted = true;
                return Ok(vec![]);
            }
            Trap => {
                self.trace.push("trap".into());
                self.halted = true;
                return Ok(vec![]);
            }
            DataOffset | DataSize => zero,
            op => {
                return Err(CoreError::internal_at(
                    format!("builtin `{}` is not callable from IR", op),
                    call.span,
                ));
            }
        };
        Ok(vec![value])
    }

    fn get_variable(&self, name: &str, span: crate::util::span::Span) -> Result<U256> {
        for scope in self.scopes.iter().rev() {
            if let Some(value) = scope.get(name) {
                return Ok(*value);
            }
        }
        Err(CoreError::internal_at(
            format!("reference to unbound variable `{}`", name),
            span,
        ))
    }

    fn set_variable(
        &mut self,
        name: &str,
        value: U256,
        span: crate::util::span::Span,
    ) -> Result<()> {
        for scope in self.scopes.iter_mut().rev() {
            if let Some(slot) = scope.get_mut(name) {
                *slot = value;
                return Ok(());
            }
        }
        Err(CoreError::internal_at(
            format!("assignment to unbound variable `{}`", name),
            span,
        ))
    }
}

fn bool_word(value: bool) -> U256 {
    if value {
        U256::one()
    } else {
        U256::zero()
    }
}

fn collect_functions(block: &Block, registry: &mut HashMap<String, FunctionDefinition>) {
    for statement in &block.statements {
        match statement {
            Statement::FunctionDefinition(function) => {
                registry.insert(function.name.clone(), function.clone());
                collect_functions(&function.body, registry);
            }
            Statement::Block(inner) => collect_functions(inner, registry),
            Statement::If(statement) => collect_functions(&statement.body, registry),
            Statement::Switch(statement) => {
                for case in &statement.cases {
                    collect_functions(&case.body, registry);
                }
            }
            Statement::ForLoop(statement) => {
                collect_functions(&statement.pre, registry);
                collect_functions(&statement.post, registry);
                collect_functions(&statement.body, registry);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middle::ir::parser::parse_block;

    fn run_trace(source: &str) -> Vec<String> {
        let block = parse_block(source).unwrap();
        let mut interp = Interpreter::new(&block, vec![]);
        interp.run(&block).unwrap();
        interp.trace().to_vec()
    }

    #[test]
    fn test_arithmetic_and_memory() {
        let block = parse_block("{ let a := add(1, 2) mstore(0, a) }").unwrap();
        let mut interp = Interpreter::new(&block, vec![]);
        interp.run(&block).unwrap();
        assert_eq!(interp.memory_word(U256::zero()), U256::from(3));
        assert_eq!(interp.trace(), &["mstore(0, 3)".to_string()]);
    }

    #[test]
    fn test_function_call() {
        let block = parse_block(
            "{ function double(x) -> y { y := add(x, x) } mstore(0, double(21)) }",
        )
        .unwrap();
        let mut interp = Interpreter::new(&block, vec![]);
        interp.run(&block).unwrap();
        assert_eq!(interp.memory_word(U256::zero()), U256::from(42));
    }

    #[test]
    fn test_for_loop_break() {
        let trace = run_trace(
            "{ for { let i := 0 } lt(i, 10) { i := add(i, 1) } { \
               if eq(i, 3) { break } mstore(i, i) } }",
        );
        assert_eq!(trace.len(), 3);
    }

    #[test]
    fn test_switch_default() {
        let trace = run_trace("{ switch 7 case 1 { mstore(0, 1) } default { trap() } }");
        assert_eq!(trace, vec!["trap".to_string()]);
    }

    #[test]
    fn test_wrapping_arithmetic() {
        let block = parse_block("{ mstore(0, add(not(0), 2)) }").unwrap();
        let mut interp = Interpreter::new(&block, vec![]);
        interp.run(&block).unwrap();
        assert_eq!(interp.memory_word(U256::zero()), U256::from(1));
    }
}
