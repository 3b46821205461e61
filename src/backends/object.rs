//! Object container model and object compiler
//!
//! A compilation unit is an object tree: a code block plus nested
//! deployable sub-objects and named data segments. The object compiler
//! lowers the tree into one relocatable [`Assembly`] per object, wiring
//! `dataoffset`/`datasize` references to sub-assembly ids.

use crate::backends::assembly::Assembly;
use crate::backends::transform::{CodeTransform, SubRef};
use crate::error::Result;
use crate::middle::ir::printer::print_block;
use crate::middle::ir::Block;
use indexmap::IndexMap;
use std::fmt;
use std::fmt::Write as _;

/// A nested object or a named data segment
#[derive(Debug, Clone)]
pub enum ObjectNode {
    Object(Object),
    Data { name: String, data: Vec<u8> },
}

impl ObjectNode {
    pub fn name(&self) -> &str {
        match self {
            ObjectNode::Object(object) => &object.name,
            ObjectNode::Data { name, .. } => name,
        }
    }
}

/// Code and data object container
#[derive(Debug, Clone)]
pub struct Object {
    pub name: String,
    pub code: Block,
    pub subobjects: Vec<ObjectNode>,
}

impl Object {
    /// Sub-node lookup by name
    pub fn subobject(&self, name: &str) -> Option<&ObjectNode> {
        self.subobjects.iter().find(|node| node.name() == name)
    }
}

impl fmt::Display for Object {
    /// Re-parseable textual rendering of the object tree
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut body = String::new();
        let _ = write!(body, "code {}", print_block(&self.code));
        for node in &self.subobjects {
            match node {
                ObjectNode::Object(object) => {
                    let _ = write!(body, "\n{}", object);
                }
                ObjectNode::Data { name, data } => {
                    let mut hex = String::with_capacity(data.len() * 2);
                    for byte in data {
                        let _ = write!(hex, "{:02x}", byte);
                    }
                    let _ = write!(body, "\ndata \"{}\" hex\"{}\"", name, hex);
                }
            }
        }
        let body = body.replace('\n', "\n    ");
        write!(f, "object \"{}\" {{\n    {}\n}}", self.name, body)
    }
}

/// Compiles an object tree into a relocatable assembly
pub struct ObjectCompiler;

impl ObjectCompiler {
    /// Lower `object` and all of its sub-objects
    pub fn compile(object: &Object) -> Result<Assembly> {
        let mut assembly = Assembly::new();
        let mut sub_index: IndexMap<String, SubRef> = IndexMap::new();

        for node in &object.subobjects {
            match node {
                ObjectNode::Object(sub) => {
                    let compiled = Self::compile(sub)?;
                    let id = assembly.append_sub(compiled);
                    sub_index.insert(sub.name.clone(), SubRef::Assembly(id));
                }
                ObjectNode::Data { name, data } => {
                    let len = data.len();
                    let id = assembly.append_data(name, data.clone());
                    sub_index.insert(name.clone(), SubRef::Data { id, len });
                }
            }
        }

        CodeTransform::run(&mut assembly, &sub_index, &object.code)?;
        Ok(assembly)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middle::ir::parser::parse_object;
    use crate::middle::ir::syntactic_eq;

    #[test]
    fn test_object_text_round_trip() {
        let source = "object \"a\" { code { mstore(0, 1) } \
                      object \"b\" { code { stop() } } data \"tbl\" hex\"c0fe\" }";
        let object = parse_object(source).unwrap();
        let printed = object.to_string();
        let reparsed = parse_object(&printed).unwrap();
        assert_eq!(reparsed.name, "a");
        assert!(syntactic_eq(&object.code, &reparsed.code));
        assert_eq!(reparsed.subobjects.len(), 2);
        match (&object.subobjects[1], &reparsed.subobjects[1]) {
            (
                ObjectNode::Data { data: original, .. },
                ObjectNode::Data { data: round, .. },
            ) => assert_eq!(original, round),
            _ => panic!("expected data nodes"),
        }
    }
}
