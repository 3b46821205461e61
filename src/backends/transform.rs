//! IR tree → assembly item lowering
//!
//! Lowers a scoped tree onto the stack machine: locals live at fixed stack
//! slots per scope, control flow becomes tag references, user calls follow
//! the return-tag convention (caller pushes the return tag, then arguments
//! right to left, then jumps; the callee rearranges returns below the
//! return address on exit). Object access pseudo-ops are rewritten to
//! sub-assembly references here.

use crate::backends::assembly::Assembly;
use crate::backends::item::{AssemblyItem, ItemKind, JumpType};
use crate::backends::opcode::Opcode;
use crate::error::{CoreError, Result};
use crate::middle::ir::*;
use indexmap::IndexMap;
use primitive_types::U256;
use std::collections::HashMap;

/// Deepest stack slot reachable by dup/swap
const MAX_STACK_ACCESS: usize = 16;

/// What a `dataoffset`/`datasize` name refers to
#[derive(Debug, Clone, Copy)]
pub enum SubRef {
    /// Nested sub-assembly with the given id
    Assembly(usize),
    /// Named data segment with its id and byte length
    Data { id: usize, len: usize },
}

#[derive(Clone)]
struct FunctionInfo {
    tag: AssemblyItem,
    params: usize,
    rets: usize,
}

struct LoopContext {
    post_tag: AssemblyItem,
    end_tag: AssemblyItem,
    /// Stack height at loop entry; break/continue pop down to this
    height: usize,
}

pub struct CodeTransform<'a> {
    assembly: &'a mut Assembly,
    sub_index: &'a IndexMap<String, SubRef>,
    /// Per-scope variable slots: name → 1-based stack position
    scopes: Vec<HashMap<String, usize>>,
    height: usize,
    functions: HashMap<String, FunctionInfo>,
    loops: Vec<LoopContext>,
}

impl<'a> CodeTransform<'a> {
    /// Lower a code block into the assembly
    pub fn run(
        assembly: &'a mut Assembly,
        sub_index: &'a IndexMap<String, SubRef>,
        block: &Block,
    ) -> Result<()> {
        let mut transform = CodeTransform {
            assembly,
            sub_index,
            scopes: Vec::new(),
            height: 0,
            functions: HashMap::new(),
            loops: Vec::new(),
        };
        transform.register_functions(block);
        transform.emit_block(block)?;
        if transform.height != 0 {
            return Err(CoreError::internal(format!(
                "{} stack items left at end of code",
                transform.height
            )));
        }
        Ok(())
    }

    /// Allocate entry tags for every function in the tree so forward calls
    /// resolve.
    fn register_functions(&mut self, block: &Block) {
        for statement in &block.statements {
            match statement {
                Statement::FunctionDefinition(function) => {
                    let tag = self.assembly.new_tag();
                    self.functions.insert(
                        function.name.clone(),
                        FunctionInfo {
                            tag,
                            params: function.parameters.len(),
                            rets: function.returns.len(),
                        },
                    );
                    self.register_functions(&function.body);
                }
                Statement::Block(inner) => self.register_functions(inner),
                Statement::If(s) => self.register_functions(&s.body),
                Statement::Switch(s) => {
                    for case in &s.cases {
                        self.register_functions(&case.body);
                    }
                }
                Statement::ForLoop(s) => {
                    self.register_functions(&s.pre);
                    self.register_functions(&s.post);
                    self.register_functions(&s.body);
                }
                _ => {}
            }
        }
    }

    fn emit_op(&mut self, op: Opcode) -> Result<()> {
        let info = op.info();
        if self.height < info.args {
            return Err(CoreError::internal(format!(
                "stack underflow lowering `{}`",
                op
            )));
        }
        self.assembly.append_operation(op);
        self.height = self.height - info.args + info.rets;
        Ok(())
    }

    fn emit_push(&mut self, value: U256) {
        self.assembly.append_constant(value);
        self.height += 1;
    }

    fn emit_push_tag(&mut self, tag: &AssemblyItem) -> Result<()> {
        self.assembly.append(tag.push_tag()?);
        self.height += 1;
        Ok(())
    }

    fn emit_block(&mut self, block: &Block) -> Result<()> {
        self.scopes.push(HashMap::new());
        let result = (|| {
            for statement in &block.statements {
                self.emit_statement(statement)?;
            }
            Ok(())
        })();
        let locals = self.scopes.last().map(|scope| scope.len()).unwrap_or(0);
        result?;
        for _ in 0..locals {
            self.emit_op(Opcode::Pop)?;
        }
        self.scopes.pop();
        Ok(())
    }

    fn emit_statement(&mut self, statement: &Statement) -> Result<()> {
        match statement {
            Statement::Expression(s) => {
                let values = self.emit_expression(&s.expression)?;
                if values != 0 {
                    return Err(CoreError::internal_at(
                        format!("expression statement leaves {} stack items", values),
                        s.span,
                    ));
                }
                Ok(())
            }
            Statement::VariableDeclaration(decl) => {
                match &decl.value {
                    Some(value) => {
                        let values = self.emit_expression(value)?;
                        if values != decl.variables.len() {
                            return Err(CoreError::internal_at(
                                format!(
                                    "initializer yields {} values for {} variables",
                                    values,
                                    decl.variables.len()
                                ),
                                decl.span,
                            ));
                        }
                    }
                    None => {
                        for _ in &decl.variables {
                            self.emit_push(U256::zero());
                        }
                    }
                }
                let base = self.height - decl.variables.len();
                let scope = self
                    .scopes
                    .last_mut()
                    .expect("scope stack never empty during lowering");
                for (index, variable) in decl.variables.iter().enumerate() {
                    scope.insert(variable.name.clone(), base + index + 1);
                }
                Ok(())
            }
            Statement::Assignment(assign) => {
                let values = self.emit_expression(&assign.value)?;
                if values != assign.targets.len() {
                    return Err(CoreError::internal_at(
                        format!(
                            "assignment of {} values to {} targets",
                            values,
                            assign.targets.len()
                        ),
                        assign.span,
                    ));
                }
                // Topmost value belongs to the last target.
                for target in assign.targets.iter().rev() {
                    self.store_variable(target)?;
                }
                Ok(())
            }
            Statement::FunctionDefinition(function) => self.emit_function(function),
            Statement::If(s) => {
                self.expect_single(&s.condition)?;
                self.emit_op(Opcode::IsZero)?;
                let end = self.assembly.new_tag();
                self.emit_push_tag(&end)?;
                self.emit_op(Opcode::JumpI)?;
                self.emit_block(&s.body)?;
                self.assembly.append(end);
                Ok(())
            }
            Statement::Switch(s) => self.emit_switch(s),
            Statement::ForLoop(s) => self.emit_for(s),
            Statement::Break(span) => {
                let Some(ctx) = self.loops.last() else {
                    return Err(CoreError::internal_at("break outside of a loop", *span));
                };
                let end = ctx.end_tag.clone();
                let excess = self.height - ctx.height;
                self.emit_unwinding_jump(&end, excess)
            }
            Statement::Continue(span) => {
                let Some(ctx) = self.loops.last() else {
                    return Err(CoreError::internal_at("continue outside of a loop", *span));
                };
                let post = ctx.post_tag.clone();
                let excess = self.height - ctx.height;
                self.emit_unwinding_jump(&post, excess)
            }
            Statement::Block(inner) => self.emit_block(inner),
        }
    }

    /// Jump off the linear path: pop `excess` items and jump, without
    /// touching the height bookkeeping of the fallthrough path.
    fn emit_unwinding_jump(&mut self, target: &AssemblyItem, excess: usize) -> Result<()> {
        for _ in 0..excess {
            self.assembly.append_operation(Opcode::Pop);
        }
        self.assembly.append(target.push_tag()?);
        self.assembly.append_operation(Opcode::Jump);
        Ok(())
    }

    fn emit_switch(&mut self, switch: &Switch) -> Result<()> {
        self.expect_single(&switch.expression)?;
        let end = self.assembly.new_tag();

        let mut valued: Vec<(AssemblyItem, &Case)> = Vec::new();
        let mut default: Option<&Case> = None;
        for case in &switch.cases {
            match &case.value {
                Some(_) => {
                    let tag = self.assembly.new_tag();
                    valued.push((tag, case));
                }
                None => default = Some(case),
            }
        }

        for (tag, case) in &valued {
            let literal = case.value.as_ref().expect("valued case has a literal");
            self.emit_op(Opcode::dup(1).expect("dup1 exists"))?;
            self.emit_push(literal.numeric_value()?);
            self.emit_op(Opcode::Eq)?;
            self.emit_push_tag(tag)?;
            self.emit_op(Opcode::JumpI)?;
        }
        if let Some(case) = default {
            self.emit_block(&case.body)?;
        }
        self.emit_push_tag(&end)?;
        self.emit_op(Opcode::Jump)?;
        for (tag, case) in &valued {
            self.assembly.append(tag.clone());
            self.emit_block(&case.body)?;
            self.emit_push_tag(&end)?;
            self.emit_op(Opcode::Jump)?;
        }
        self.assembly.append(end);
        self.emit_op(Opcode::Pop)?;
        Ok(())
    }

    fn emit_for(&mut self, statement: &ForLoop) -> Result<()> {
        // The pre block's scope encloses condition, post and body.
        self.scopes.push(HashMap::new());
        let result = (|| {
            for pre_statement in &statement.pre.statements {
                self.emit_statement(pre_statement)?;
            }
            let cond_tag = self.assembly.new_tag();
            let post_tag = self.assembly.new_tag();
            let end_tag = self.assembly.new_tag();

            self.assembly.append(cond_tag.clone());
            self.expect_single(&statement.condition)?;
            self.emit_op(Opcode::IsZero)?;
            self.emit_push_tag(&end_tag)?;
            self.emit_op(Opcode::JumpI)?;

            self.loops.push(LoopContext {
                post_tag: post_tag.clone(),
                end_tag: end_tag.clone(),
                height: self.height,
            });
            let body_result = self.emit_block(&statement.body);
            self.loops.pop();
            body_result?;

            self.assembly.append(post_tag);
            self.emit_block(&statement.post)?;
            self.emit_push_tag(&cond_tag)?;
            self.emit_op(Opcode::Jump)?;
            self.assembly.append(end_tag);
            Ok(())
        })();
        let locals = self.scopes.last().map(|scope| scope.len()).unwrap_or(0);
        result?;
        for _ in 0..locals {
            self.emit_op(Opcode::Pop)?;
        }
        self.scopes.pop();
        Ok(())
    }

    fn emit_function(&mut self, function: &FunctionDefinition) -> Result<()> {
        let info = self
            .functions
            .get(&function.name)
            .cloned()
            .ok_or_else(|| {
                CoreError::internal_at(
                    format!("unregistered function `{}`", function.name),
                    function.span,
                )
            })?;
        if info.rets > 1 {
            return Err(CoreError::unimplemented_at(
                "lowering of functions with multiple return values",
                function.span,
            ));
        }
        if info.params + 1 > MAX_STACK_ACCESS {
            return Err(CoreError::unimplemented_at(
                "function with parameters too deep in stack",
                function.span,
            ));
        }

        // Fall-through protection: jump over the body.
        let after = self.assembly.new_tag();
        self.emit_push_tag(&after)?;
        self.emit_op(Opcode::Jump)?;
        self.assembly.append(info.tag.clone());

        let saved_height = self.height;
        let saved_scopes = std::mem::take(&mut self.scopes);
        let saved_loops = std::mem::take(&mut self.loops);

        // Entry stack: return address below the arguments, first argument
        // topmost.
        self.height = info.params + 1;
        let mut frame = HashMap::new();
        for (index, parameter) in function.parameters.iter().enumerate() {
            frame.insert(parameter.name.clone(), info.params + 1 - index);
        }
        self.scopes.push(frame);
        for ret in &function.returns {
            self.emit_push(U256::zero());
            let slot = self.height;
            self.scopes
                .last_mut()
                .expect("function frame present")
                .insert(ret.name.clone(), slot);
        }

        self.emit_block(&function.body)?;

        let expected = info.params + 1 + info.rets;
        if self.height != expected {
            return Err(CoreError::internal_at(
                format!(
                    "stack height {} at exit of `{}`, expected {}",
                    self.height, function.name, expected
                ),
                function.span,
            ));
        }
        // Move the return value below the return address, drop the
        // arguments, jump back.
        if info.rets == 1 {
            let swap = Opcode::swap(info.params + 1).ok_or_else(|| {
                CoreError::unimplemented_at("function frame too deep in stack", function.span)
            })?;
            self.emit_op(swap)?;
            for _ in 0..info.params {
                self.emit_op(Opcode::swap(1).expect("swap1 exists"))?;
                self.emit_op(Opcode::Pop)?;
            }
        } else {
            for _ in 0..info.params {
                self.emit_op(Opcode::Pop)?;
            }
        }
        self.assembly
            .append(AssemblyItem::operation(Opcode::Jump).with_jump_type(JumpType::OutOfFunction));

        self.height = saved_height;
        self.scopes = saved_scopes;
        self.loops = saved_loops;
        self.assembly.append(after);
        Ok(())
    }

    /// Emit an expression that must produce exactly one value
    fn expect_single(&mut self, expression: &Expression) -> Result<()> {
        let values = self.emit_expression(expression)?;
        if values != 1 {
            return Err(CoreError::internal_at(
                format!("expected one value, got {}", values),
                expression.span(),
            ));
        }
        Ok(())
    }

    /// Emit an expression; returns the number of values it leaves
    fn emit_expression(&mut self, expression: &Expression) -> Result<usize> {
        match expression {
            Expression::Literal(literal) => {
                if literal.kind == LiteralKind::String {
                    return Err(CoreError::unimplemented_at(
                        "string literals outside data references",
                        literal.span,
                    ));
                }
                self.emit_push(literal.numeric_value()?);
                Ok(1)
            }
            Expression::Identifier(identifier) => {
                let slot = self.variable_slot(identifier)?;
                let depth = self.height - slot + 1;
                let dup = Opcode::dup(depth).ok_or_else(|| {
                    CoreError::unimplemented_at(
                        format!("variable `{}` too deep in stack", identifier.name),
                        identifier.span,
                    )
                })?;
                self.emit_op(dup)?;
                Ok(1)
            }
            Expression::BuiltinCall(call) if call.op.is_pseudo() => {
                self.emit_data_reference(call)?;
                Ok(1)
            }
            Expression::BuiltinCall(call) => {
                let info = call.op.info();
                if call.arguments.len() != info.args {
                    return Err(CoreError::internal_at(
                        format!("builtin `{}` expects {} arguments", call.op, info.args),
                        call.span,
                    ));
                }
                for argument in call.arguments.iter().rev() {
                    self.expect_single(argument)?;
                }
                self.emit_op(call.op)?;
                Ok(info.rets)
            }
            Expression::FunctionCall(call) => {
                let info = self
                    .functions
                    .get(&call.function.name)
                    .cloned()
                    .ok_or_else(|| {
                        CoreError::internal_at(
                            format!("call of unknown function `{}`", call.function.name),
                            call.span,
                        )
                    })?;
                if call.arguments.len() != info.params {
                    return Err(CoreError::internal_at(
                        format!("argument count mismatch calling `{}`", call.function.name),
                        call.span,
                    ));
                }
                if info.rets > 1 {
                    return Err(CoreError::unimplemented_at(
                        "lowering of calls with multiple return values",
                        call.span,
                    ));
                }
                let height_before = self.height;
                let ret_tag = self.assembly.new_tag();
                self.emit_push_tag(&ret_tag)?;
                for argument in call.arguments.iter().rev() {
                    self.expect_single(argument)?;
                }
                self.emit_push_tag(&info.tag)?;
                self.assembly.append(
                    AssemblyItem::operation(Opcode::Jump).with_jump_type(JumpType::IntoFunction),
                );
                self.assembly.append(ret_tag);
                self.height = height_before + info.rets;
                Ok(info.rets)
            }
        }
    }

    /// `dataoffset`/`datasize` with a string-literal name become
    /// sub-assembly or data-segment references.
    fn emit_data_reference(&mut self, call: &BuiltinCall) -> Result<()> {
        let name = match call.arguments.as_slice() {
            [Expression::Literal(literal)] if literal.kind == LiteralKind::String => {
                &literal.value
            }
            _ => {
                return Err(CoreError::internal_at(
                    format!("`{}` expects one string-literal argument", call.op),
                    call.span,
                ));
            }
        };
        let sub = self.sub_index.get(name).ok_or_else(|| {
            CoreError::internal_at(
                format!("`{}` references unknown object `{}`", call.op, name),
                call.span,
            )
        })?;
        let item = match (call.op, sub) {
            (Opcode::DataOffset, SubRef::Assembly(id)) => AssemblyItem::new(ItemKind::PushSub(*id)),
            (Opcode::DataSize, SubRef::Assembly(id)) => {
                AssemblyItem::new(ItemKind::PushSubSize(*id))
            }
            (Opcode::DataOffset, SubRef::Data { id, .. }) => {
                AssemblyItem::new(ItemKind::PushData(U256::from(*id)))
            }
            (Opcode::DataSize, SubRef::Data { len, .. }) => AssemblyItem::push(U256::from(*len)),
            _ => {
                return Err(CoreError::internal_at(
                    format!("`{}` is not a data reference", call.op),
                    call.span,
                ));
            }
        };
        self.assembly.append(item);
        self.height += 1;
        Ok(())
    }

    fn variable_slot(&self, identifier: &Identifier) -> Result<usize> {
        for scope in self.scopes.iter().rev() {
            if let Some(slot) = scope.get(&identifier.name) {
                return Ok(*slot);
            }
        }
        Err(CoreError::internal_at(
            format!("reference to unbound variable `{}`", identifier.name),
            identifier.span,
        ))
    }

    /// Store the stack top into a variable's slot
    fn store_variable(&mut self, target: &Identifier) -> Result<()> {
        let slot = self.variable_slot(target)?;
        let depth = self.height - slot;
        if depth == 0 {
            return Err(CoreError::internal_at(
                format!("assignment to `{}` with empty value stack", target.name),
                target.span,
            ));
        }
        let swap = Opcode::swap(depth).ok_or_else(|| {
            CoreError::unimplemented_at(
                format!("variable `{}` too deep in stack", target.name),
                target.span,
            )
        })?;
        self.emit_op(swap)?;
        self.emit_op(Opcode::Pop)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::assembly::Machine;
    use crate::middle::ir::parser::parse_block;

    fn lower(source: &str) -> Assembly {
        let block = parse_block(source).unwrap();
        let mut assembly = Assembly::new();
        let sub_index = IndexMap::new();
        CodeTransform::run(&mut assembly, &sub_index, &block).unwrap();
        assembly
    }

    fn ops(assembly: &Assembly) -> Vec<String> {
        assembly.items().iter().map(|item| item.to_string()).collect()
    }

    #[test]
    fn test_simple_store_lowering() {
        let assembly = lower("{ mstore(0, add(1, 2)) }");
        // arguments right to left: push 2, push 1, add; then 0, mstore
        assert_eq!(
            ops(&assembly),
            vec!["0x2", "0x1", "add", "0x0", "mstore"]
        );
        assembly.assemble(Machine::Compact).unwrap();
    }

    #[test]
    fn test_locals_are_scoped_and_popped() {
        let assembly = lower("{ let a := 5 { let b := a pop(b) } pop(a) }");
        let listing = ops(&assembly);
        // two declarations, two explicit pops, two scope-exit pops
        assert_eq!(listing.iter().filter(|op| *op == "pop").count(), 4);
        assembly.assemble(Machine::Compact).unwrap();
    }

    #[test]
    fn test_if_lowering_shape() {
        let assembly = lower("{ if 1 { stop() } }");
        let listing = ops(&assembly);
        assert_eq!(listing[0], "0x1");
        assert_eq!(listing[1], "iszero");
        assert!(listing[2].starts_with("tag_"));
        assert_eq!(listing[3], "jumpi");
        assert_eq!(listing[4], "stop");
        assert!(listing[5].ends_with(':'));
    }

    #[test]
    fn test_function_call_convention() {
        let assembly = lower(
            "{ let r := id(7) pop(r) function id(x) -> y { y := x } }",
        );
        let listing = ops(&assembly);
        assert!(listing.iter().any(|op| op == "jump\t[in]"));
        assert!(listing.iter().any(|op| op == "jump\t[out]"));
        let object = assembly.assemble(Machine::Compact).unwrap();
        assert!(!object.bytecode.is_empty());
    }

    #[test]
    fn test_for_loop_with_break() {
        let assembly = lower(
            "{ for { let i := 0 } lt(i, 4) { i := add(i, 1) } { \
               if eq(i, 2) { break } } }",
        );
        assembly.assemble(Machine::Compact).unwrap();
    }

    #[test]
    fn test_switch_pops_selector() {
        let assembly = lower(
            "{ switch mload(0) case 0 { stop() } case 1 { trap() } default { stop() } }",
        );
        let listing = ops(&assembly);
        assert!(listing.iter().filter(|op| *op == "dup1").count() == 2);
        assert_eq!(listing.last().map(String::as_str), Some("pop"));
        assembly.assemble(Machine::Compact).unwrap();
    }

    #[test]
    fn test_expression_statement_with_value_is_error() {
        let block = parse_block("{ add(1, 2) }").unwrap();
        let mut assembly = Assembly::new();
        let sub_index = IndexMap::new();
        assert!(CodeTransform::run(&mut assembly, &sub_index, &block).is_err());
    }
}
