//! Integration tests for the instruction pattern matcher.

use vc4cc::analysis::patterns::{
    search, InstructionPattern, OperationPattern, Pattern, ValuePattern,
};
use vc4cc::ir::instruction::{Instruction, OpCode, Pack};
use vc4cc::ir::method::{method_with_entry_block, Method};
use vc4cc::ir::types::TYPE_INT32;
use vc4cc::ir::value::Value;

fn two_part_pattern(allow_gaps: bool) -> Pattern {
    let mut pattern = Pattern::new(allow_gaps);
    pattern.parts.push(InstructionPattern {
        operation: OperationPattern::Fixed(OpCode::Add),
        ..InstructionPattern::default()
    });
    pattern.parts.push(InstructionPattern {
        operation: OperationPattern::Fixed(OpCode::Sub),
        ..InstructionPattern::default()
    });
    pattern
}

fn build_method_with_gap() -> Method {
    let mut method = method_with_entry_block("patterns");
    let a = method.add_new_local(TYPE_INT32, "%a");
    let gap = method.add_new_local(TYPE_INT32, "%gap");
    let b = method.add_new_local(TYPE_INT32, "%b");
    method.append_to_end(Instruction::op(
        OpCode::Add,
        a.clone(),
        Value::int(1),
        Value::int(2),
    ));
    method.append_to_end(Instruction::mov(gap, Value::int(9)));
    method.append_to_end(Instruction::op(OpCode::Sub, b, a, Value::int(1)));
    method
}

/// `search(allow_gaps = true)` succeeds exactly when some contiguous
/// subsequence (whose gaps satisfy the gap rules) matches without gaps.
#[test]
fn gapped_search_subsumes_compact_search() {
    let method = build_method_with_gap();

    // the gap instruction breaks the compact match
    let mut compact = two_part_pattern(false);
    assert!(search(&method, method.walk_all(), &mut compact).is_none());

    // but the gapped search tolerates it
    let mut gapped = two_part_pattern(true);
    assert!(search(&method, method.walk_all(), &mut gapped).is_some());
}

#[test]
fn compact_match_implies_gapped_match() {
    let mut method = method_with_entry_block("patterns");
    let a = method.add_new_local(TYPE_INT32, "%a");
    let b = method.add_new_local(TYPE_INT32, "%b");
    method.append_to_end(Instruction::op(
        OpCode::Add,
        a.clone(),
        Value::int(1),
        Value::int(2),
    ));
    method.append_to_end(Instruction::op(OpCode::Sub, b, a, Value::int(1)));

    let mut compact = two_part_pattern(false);
    let compact_result = search(&method, method.walk_all(), &mut compact);
    assert!(compact_result.is_some());

    let mut gapped = two_part_pattern(true);
    let gapped_result = search(&method, method.walk_all(), &mut gapped);
    assert_eq!(compact_result, gapped_result);
}

/// Instructions with pack modes never match, whatever the pattern.
#[test]
fn pack_modes_disqualify_instructions() {
    let mut method = method_with_entry_block("patterns");
    let a = method.add_new_local(TYPE_INT32, "%a");
    let mut inst = Instruction::op(OpCode::Add, a, Value::int(1), Value::int(2));
    inst.pack = Pack::Int16A;
    method.append_to_end(inst);

    let mut pattern = Pattern::single(InstructionPattern {
        operation: OperationPattern::Fixed(OpCode::Add),
        ..InstructionPattern::default()
    });
    assert!(search(&method, method.walk_all(), &mut pattern).is_none());
}

/// Captures only become visible when the whole pattern matched.
#[test]
fn captures_are_atomic_across_the_attempt() {
    let mut method = method_with_entry_block("patterns");
    let a = method.add_new_local(TYPE_INT32, "%a");
    method.append_to_end(Instruction::op(
        OpCode::Add,
        a,
        Value::int(1),
        Value::int(2),
    ));
    // no Sub follows, so the two-part pattern cannot match
    let mut pattern = Pattern::new(true);
    let captured = pattern.new_value_placeholder();
    pattern.parts.push(InstructionPattern {
        output: ValuePattern::AnyLocal(captured),
        operation: OperationPattern::Fixed(OpCode::Add),
        ..InstructionPattern::default()
    });
    pattern.parts.push(InstructionPattern {
        operation: OperationPattern::Fixed(OpCode::Sub),
        ..InstructionPattern::default()
    });
    assert!(search(&method, method.walk_all(), &mut pattern).is_none());
    assert!(pattern.value(captured).is_none(), "no capture may leak");
}
