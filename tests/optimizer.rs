//! Optimizer integration tests
//!
//! Whole-suite scenarios over parsed IR: behavior preservation against the
//! reference interpreter, fixpoint cleanups and the reference-count
//! invariant.

use luoshu::middle::ir::interp::Interpreter;
use luoshu::middle::ir::parser::parse_block;
use luoshu::middle::ir::printer::print_block;
use luoshu::middle::ir::Block;
use luoshu::middle::passes::names::{count_references, NameDispenser};
use luoshu::middle::passes::unused_pruner::UnusedPruner;
use luoshu::middle::passes::{inliner::Inliner, rematerializer::Rematerializer, run_suite, OptimizerSettings};
use primitive_types::U256;
use std::collections::HashSet;

fn trace_of(block: &Block, inputs: Vec<U256>) -> Vec<String> {
    let mut interp = Interpreter::new(block, inputs);
    interp.run(block).unwrap();
    interp.trace().to_vec()
}

/// Representative programs for behavior-preservation checks
const PROGRAMS: &[&str] = &[
    "{ let a := 1 let b := add(a, 2) mstore(0, b) }",
    "{ function sq(x) -> y { y := mul(x, x) } mstore(0, sq(input(0))) mstore(32, sq(3)) }",
    "{ let n := input(0) let acc := 0 \
       for { let i := 0 } lt(i, n) { i := add(i, 1) } { acc := add(acc, i) } \
       mstore(0, acc) }",
    "{ function store_twice(p, v) { mstore(p, v) mstore(add(p, 32), v) } \
       store_twice(0, 7) store_twice(64, input(1)) }",
    "{ let sel := input(0) switch sel \
       case 0 { mstore(0, 11) } case 1 { mstore(0, 22) } default { trap() } }",
];

#[test]
fn test_suite_preserves_observable_traces() {
    for source in PROGRAMS {
        let original = parse_block(source).unwrap();
        let mut optimized = original.clone();
        run_suite(
            &mut optimized,
            &OptimizerSettings::default(),
            &HashSet::new(),
        )
        .unwrap();
        for input in [0u64, 1, 5] {
            let inputs = vec![U256::from(input), U256::from(99u64)];
            assert_eq!(
                trace_of(&original, inputs.clone()),
                trace_of(&optimized, inputs),
                "trace diverged for program: {}",
                source
            );
        }
    }
}

#[test]
fn test_inlining_alone_preserves_traces() {
    for source in PROGRAMS {
        let original = parse_block(source).unwrap();
        let mut inlined = original.clone();
        let mut dispenser = NameDispenser::new(&inlined);
        Inliner::run(&mut inlined, &mut dispenser, &OptimizerSettings::default()).unwrap();
        let inputs = vec![U256::from(3u64), U256::from(4u64)];
        assert_eq!(
            trace_of(&original, inputs.clone()),
            trace_of(&inlined, inputs),
            "inlining changed behavior of: {}",
            source
        );
    }
}

#[test]
fn test_rematerialization_preserves_pure_programs() {
    // No side-effecting substitutable sub-expressions: before/after must be
    // observably equivalent.
    let source = "{ let a := add(input(0), 1) let b := add(a, a) mstore(0, b) mstore(32, a) }";
    let original = parse_block(source).unwrap();
    let mut optimized = original.clone();
    Rematerializer::run(&mut optimized, &OptimizerSettings::default()).unwrap();
    let inputs = vec![U256::from(10u64)];
    let mut before = Interpreter::new(&original, inputs.clone());
    before.run(&original).unwrap();
    let mut after = Interpreter::new(&optimized, inputs);
    after.run(&optimized).unwrap();
    assert_eq!(before.trace(), after.trace());
    assert_eq!(
        before.memory_word(U256::zero()),
        after.memory_word(U256::zero())
    );
}

#[test]
fn test_checked_add_scenario() {
    // `let a := 1  let b := add8(a, 2)` with a dispatch-style wrapper: the
    // wrapper and the literal-argument helper call collapse into the
    // checked-add body over literal operands; the keeper call in `entry`
    // holds the helper definition alive.
    let source = "{ \
        let a := 1 \
        let b := add8(a, 2) \
        mstore(0, b) \
        function add8(x, y) -> s { s := checked_add_uint_8(x, y) } \
        function checked_add_uint_8(x2, y2) -> sum { \
            let mask := 0xff \
            sum := add(and(x2, mask), and(y2, mask)) \
            if and(sum, not(mask)) { abort(0, 0) } \
        } \
        function entry() -> r { r := checked_add_uint_8(input(0), input(1)) } \
    }";
    let mut block = parse_block(source).unwrap();
    let mut keep = HashSet::new();
    keep.insert("entry".to_string());
    run_suite(&mut block, &OptimizerSettings::default(), &keep).unwrap();
    let printed = print_block(&block);

    // The wrapper is gone and exactly one helper call with literal
    // operands remains; the non-constant call site in `entry` also still
    // uses the helper.
    assert!(!printed.contains("function add8"));
    assert_eq!(printed.matches("checked_add_uint_8(1, 2)").count(), 1);
    assert!(printed.contains("function entry"));
    assert!(printed.contains("checked_add_uint_8(input(0), input(1))"));

    // Behavior check on top: the store still sees 3.
    let mut interp = Interpreter::new(&block, vec![]);
    interp.run(&block).unwrap();
    assert_eq!(interp.memory_word(U256::zero()), U256::from(3));
}

#[test]
fn test_single_call_site_function_disappears() {
    let source = "{ let r := once(41) mstore(0, r) \
                   function once(x) -> y { y := add(x, 1) } }";
    let mut block = parse_block(source).unwrap();
    run_suite(&mut block, &OptimizerSettings::default(), &HashSet::new()).unwrap();
    let printed = print_block(&block);
    assert!(!printed.contains("function once"));
    assert!(!printed.contains("once("));
}

#[test]
fn test_unread_variable_handling() {
    // Pure initializer: fully removed. Effectful initializer: downgraded
    // to a discarded call that still runs. Two call sites keep the callee
    // below the once-referenced auto-inline rule, so the calls survive.
    let source = "{ let dead := add(1, 2) let eff := bump() let eff2 := bump() mstore(0, 7) \
                   function bump() -> r { mstore(32, add(mload(32), 1)) r := mload(32) } }";
    let mut block = parse_block(source).unwrap();
    run_suite(&mut block, &OptimizerSettings::default(), &HashSet::new()).unwrap();
    let printed = print_block(&block);
    assert!(!printed.contains("dead"));
    assert!(!printed.contains("let eff"));
    assert!(printed.contains("pop(bump())"));

    let mut interp = Interpreter::new(&block, vec![]);
    interp.run(&block).unwrap();
    assert_eq!(interp.memory_word(U256::from(32)), U256::from(2));
}

#[test]
fn test_reference_counts_never_go_negative() {
    // A fixpoint prune over a tree with cascading dead functions must end
    // with counts matching a fresh recount.
    let source = "{ mstore(0, 1) \
                   function a() -> r { r := b() } \
                   function b() -> r2 { r2 := c() } \
                   function c() -> r3 { r3 := 1 } }";
    let mut block = parse_block(source).unwrap();
    UnusedPruner::run_until_stabilized(&mut block, &HashSet::new()).unwrap();
    let printed = print_block(&block);
    assert!(!printed.contains("function"));
    // A second run over the pruned tree finds nothing left to do, and a
    // fresh recount agrees with the tree.
    let changed = UnusedPruner::run_until_stabilized(&mut block, &HashSet::new()).unwrap();
    assert!(!changed);
    for name in count_references(&block).keys() {
        assert!(printed.contains(name.as_str()));
    }
}
