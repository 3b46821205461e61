//! Per-compilation-unit generation state
//!
//! Owns name allocation for declarations and expressions, the linearized
//! inheritance hierarchy, the synthesized-helper collector and the queue of
//! functions still awaiting generation. One context per generated object;
//! independent compilations never share a context.

use crate::error::{CoreError, Result};
use crate::frontend::ast::{ClassDefinition, Expr, FunctionDefinition, NodeId, VariableDeclaration};
use crate::frontend::types::Type;
use crate::middle::codegen::helpers::HelperCollector;
use indexmap::IndexMap;
use std::collections::HashSet;

pub struct Context<'a> {
    /// Inheritance hierarchy, most derived first
    hierarchy: Vec<&'a ClassDefinition>,
    /// Declaration identity → generated variable name
    local_names: IndexMap<NodeId, String>,
    /// Synthesized helper functions, generated once per name
    pub helpers: HelperCollector,
    /// Functions referenced but not yet generated
    generation_queue: Vec<&'a FunctionDefinition>,
    queued: HashSet<NodeId>,
}

impl<'a> Context<'a> {
    pub fn new(hierarchy: Vec<&'a ClassDefinition>) -> Self {
        Self {
            hierarchy,
            local_names: IndexMap::new(),
            helpers: HelperCollector::new(),
            generation_queue: Vec::new(),
            queued: HashSet::new(),
        }
    }

    pub fn hierarchy(&self) -> &[&'a ClassDefinition] {
        &self.hierarchy
    }

    /// Allocate and record a fresh name for a local declaration
    ///
    /// Multi-slot types are an explicit staging boundary.
    pub fn add_local_variable(&mut self, decl: &VariableDeclaration) -> Result<String> {
        if decl.ty.size_on_stack() != 1 {
            return Err(CoreError::unimplemented_at(
                format!("multi-slot type `{}` for local variable", decl.ty),
                decl.span,
            ));
        }
        let name = format!("vloc_{}_{}", decl.name, decl.id);
        self.local_names.insert(decl.id, name.clone());
        Ok(name)
    }

    /// Generated name of a registered local declaration
    pub fn variable_name(&self, decl: &VariableDeclaration) -> Result<String> {
        self.variable_name_by_id(decl.id)
            .ok_or_else(|| CoreError::internal_at(format!("unknown variable `{}`", decl.name), decl.span))
    }

    /// Generated name for a declaration id, if registered
    pub fn variable_name_by_id(&self, id: NodeId) -> Option<String> {
        self.local_names.get(&id).cloned()
    }

    /// Generated name of a function definition
    pub fn function_name(&self, function: &FunctionDefinition) -> String {
        format!("fun_{}_{}", function.name, function.id)
    }

    /// Name of the variable holding an expression's value
    pub fn expression_name(&self, expr: &Expr) -> Result<String> {
        if expr.ty.size_on_stack() != 1 {
            return Err(CoreError::unimplemented_at(
                format!("multi-slot expression of type `{}`", expr.ty),
                expr.span,
            ));
        }
        Ok(format!("expr_{}", expr.id))
    }

    /// Most-derived implementation of a function, scanning derived-to-base
    /// for a non-constructor with the same name and parameter signature.
    /// Well-typed input always resolves; failure is a contract violation.
    pub fn virtual_function(
        &self,
        function: &FunctionDefinition,
    ) -> Result<&'a FunctionDefinition> {
        let signature = function.parameter_types();
        for class in &self.hierarchy {
            for candidate in class.defined_functions() {
                if candidate.name == function.name
                    && !candidate.is_constructor
                    && candidate.parameter_types() == signature
                {
                    return Ok(candidate);
                }
            }
        }
        Err(CoreError::internal_at(
            format!("virtual lookup of `{}` found no implementation", function.name),
            function.span,
        ))
    }

    /// Generated name of the most-derived implementation; the resolved
    /// function is queued for generation.
    pub fn virtual_function_name(&mut self, function: &FunctionDefinition) -> Result<String> {
        let resolved = self.virtual_function(function)?;
        self.enqueue_function(resolved);
        Ok(self.function_name(resolved))
    }

    /// Function definition carrying the given node id, anywhere in the
    /// hierarchy
    pub fn find_function_by_id(&self, id: NodeId) -> Option<&'a FunctionDefinition> {
        for class in &self.hierarchy {
            for function in class.defined_functions() {
                if function.id == id {
                    return Some(function);
                }
            }
        }
        None
    }

    /// Hierarchy functions matching an exact `(arity_in, arity_out)`
    /// signature, non-constructors only
    pub fn functions_with_arity(
        &self,
        arity_in: usize,
        arity_out: usize,
    ) -> Vec<&'a FunctionDefinition> {
        let mut matching = Vec::new();
        for class in &self.hierarchy {
            for function in class.defined_functions() {
                if !function.is_constructor
                    && function.params.len() == arity_in
                    && function.returns.len() == arity_out
                {
                    matching.push(function);
                }
            }
        }
        matching
    }

    /// Queue a function for generation (deduplicated by node id)
    pub fn enqueue_function(&mut self, function: &'a FunctionDefinition) {
        if self.queued.insert(function.id) {
            self.generation_queue.push(function);
        }
    }

    /// Next function awaiting generation
    pub fn pop_queued_function(&mut self) -> Option<&'a FunctionDefinition> {
        self.generation_queue.pop()
    }

    /// True if the given type occupies exactly one stack slot
    pub fn single_slot(ty: &Type) -> bool {
        ty.size_on_stack() == 1
    }
}
