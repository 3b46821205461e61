//! End-to-end pipeline tests
//!
//! Typed AST in, bytecode object out: generation, the re-parse
//! self-check, optimization, lowering and two-pass assembly.

use luoshu::backends::assembly::Machine;
use luoshu::backends::item::{AssemblyItem, ItemKind};
use luoshu::backends::opcode::Opcode;
use luoshu::frontend::ast::*;
use luoshu::frontend::types::Type;
use luoshu::middle::ir::parser::parse_object;
use luoshu::middle::ir::syntactic_eq;
use luoshu::middle::passes::OptimizerSettings;
use luoshu::unit::{CompilationUnit, Language};
use luoshu::util::span::Span;
use luoshu::{compile_class, compile_source};
use primitive_types::U256;

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

/// class Adder { bump(v: uint8) -> uint8 { let a = 1; return v + a } }
fn adder_class() -> ClassDefinition {
    let param = uint8_var(10, "v");
    let ret = uint8_var(11, "out");
    let local = uint8_var(12, "a");
    let body = vec![
        Stmt {
            span: Span::dummy(),
            kind: StmtKind::VarDecl {
                decls: vec![local.clone()],
                init: Some(typed(
                    20,
                    Type::Rational(U256::from(1)),
                    ExprKind::Literal(LiteralValue::Number(U256::from(1))),
                )),
            },
        },
        Stmt {
            span: Span::dummy(),
            kind: StmtKind::Return {
                value: Some(typed(
                    21,
                    Type::uint8(),
                    ExprKind::Binary {
                        op: BinOp::Add,
                        lhs: Box::new(typed(
                            22,
                            Type::uint8(),
                            ExprKind::Identifier(DeclarationRef {
                                id: 10,
                                kind: DeclKind::Variable,
                            }),
                        )),
                        rhs: Box::new(typed(
                            23,
                            Type::uint8(),
                            ExprKind::Identifier(DeclarationRef {
                                id: 12,
                                kind: DeclKind::Variable,
                            }),
                        )),
                    },
                )),
            },
        },
    ];
    ClassDefinition {
        id: 1,
        span: Span::dummy(),
        name: "Adder".into(),
        functions: vec![FunctionDefinition {
            id: 5,
            span: Span::dummy(),
            name: "bump".into(),
            params: vec![param],
            returns: vec![ret],
            body: Some(Stmt {
                span: Span::dummy(),
                kind: StmtKind::Block(body),
            }),
            is_constructor: false,
        }],
    }
}

#[test]
fn test_class_compiles_to_bytecode() {
    let class = adder_class();
    let (text, assembled) =
        compile_class(&class, vec![&class], OptimizerSettings::default(), Machine::Compact)
            .unwrap();
    assert!(text.contains("object \"Adder_1\""));
    assert!(text.contains("checked_add_uint_8"));
    assert!(!assembled.object.bytecode.is_empty());
    // The runtime object is embedded as a sub-assembly.
    assert_eq!(assembled.object.sub_offsets.len(), 1);
    let runtime_start = assembled.object.sub_offsets[0];
    assert!(runtime_start < assembled.object.bytecode.len());
}

#[test]
fn test_generated_text_round_trips() {
    let class = adder_class();
    let (text, _) = compile_class(
        &class,
        vec![&class],
        OptimizerSettings::none(),
        Machine::Compact,
    )
    .unwrap();
    let object = parse_object(&text).unwrap();
    let reprinted = object.to_string();
    let reparsed = parse_object(&reprinted).unwrap();
    assert!(syntactic_eq(&object.code, &reparsed.code));
    assert_eq!(object.subobjects.len(), reparsed.subobjects.len());
}

#[test]
fn test_optimized_build_is_not_larger() {
    let class = adder_class();
    let (_, plain) = compile_class(
        &class,
        vec![&class],
        OptimizerSettings::none(),
        Machine::Compact,
    )
    .unwrap();
    let (_, optimized) = compile_class(
        &class,
        vec![&class],
        OptimizerSettings::default(),
        Machine::Compact,
    )
    .unwrap();
    assert!(optimized.object.bytecode.len() <= plain.object.bytecode.len());
}

#[test]
fn test_machine_variants_differ_in_width() {
    let source = "{ let a := 1 if a { mstore(0, a) } }";
    let compact = compile_source("t", source, OptimizerSettings::none(), Machine::Compact).unwrap();
    let wide = compile_source("t", source, OptimizerSettings::none(), Machine::Wide).unwrap();
    assert!(wide.object.bytecode.len() > compact.object.bytecode.len());
}

#[test]
fn test_two_pass_stability_across_width_boundary() {
    // Enough forward-referenced tags and padding that every tag position
    // lands beyond the one-byte range: the up-front width choice must
    // already cover it, so re-assembling produces no further growth.
    let mut unit_items: Vec<AssemblyItem> = Vec::new();
    for tag in 0..16u64 {
        unit_items.push(AssemblyItem::new(ItemKind::PushTag(U256::from(tag))));
        unit_items.push(AssemblyItem::operation(Opcode::Jump));
    }
    for _ in 0..100 {
        unit_items.push(AssemblyItem::push(U256::from(0xFFFFu64)));
        unit_items.push(AssemblyItem::operation(Opcode::Pop));
    }
    for tag in 0..16u64 {
        unit_items.push(AssemblyItem::new(ItemKind::Tag(U256::from(tag))));
    }
    unit_items.push(AssemblyItem::operation(Opcode::Stop));

    let unit = CompilationUnit::from_items(unit_items);
    let first = unit.assemble(Machine::Compact).unwrap();
    let second = unit.assemble(Machine::Compact).unwrap();
    assert_eq!(first.object.bytecode, second.object.bytecode);
    assert!(first.object.tag_positions.iter().all(|p| *p > 0xFF));
}

#[test]
fn test_source_pipeline_with_objects() {
    let source = "object \"outer\" { code { \
        datacopy(0, dataoffset(\"inner\"), datasize(\"inner\")) \
        finish(0, datasize(\"inner\")) } \
        object \"inner\" { code { mstore(0, 42) stop() } } \
        data \"greeting\" hex\"68656c6c6f\" }";
    let mut unit = CompilationUnit::new(Language::Ir, OptimizerSettings::default());
    unit.parse_and_analyze("objects", source).unwrap();
    unit.optimize().unwrap();
    let assembled = unit.assemble(Machine::Compact).unwrap();

    // The inner object's bytecode and the data segment are embedded after
    // the outer code, and the data payload survives byte for byte.
    assert_eq!(assembled.object.sub_offsets.len(), 1);
    let (name, data_offset) = &assembled.object.data_offsets[0];
    assert_eq!(name, "greeting");
    assert_eq!(
        &assembled.object.bytecode[*data_offset..*data_offset + 5],
        b"hello"
    );
}

#[test]
fn test_error_classes_are_distinct() {
    // A staging gap surfaces as Unimplemented, never as Internal.
    let class = adder_class();
    let mut with_constructor = class.clone();
    with_constructor.functions.push(FunctionDefinition {
        id: 90,
        span: Span::dummy(),
        name: "init".into(),
        params: vec![],
        returns: vec![],
        body: Some(Stmt {
            span: Span::dummy(),
            kind: StmtKind::Block(vec![]),
        }),
        is_constructor: true,
    });
    let result = compile_class(
        &with_constructor,
        vec![&with_constructor],
        OptimizerSettings::none(),
        Machine::Compact,
    );
    assert!(matches!(
        result,
        Err(luoshu::CoreError::Unimplemented { .. })
    ));
}
