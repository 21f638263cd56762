//! Integration tests for the control-flow passes.

use vc4cc::ir::instruction::{
    BranchCondition, ConditionCode, DelayKind, Instruction, InstructionKind, OpCode,
};
use vc4cc::ir::method::{method_with_entry_block, Method};
use vc4cc::ir::types::TYPE_INT32;
use vc4cc::ir::value::{Value, BOOL_TRUE};
use vc4cc::optimization::{
    add_start_stop_segment, extend_branches, merge_adjacent_blocks, simplify_conditional_blocks,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn every_branch_gets_three_delay_slots() {
    init_logging();
    let mut method = method_with_entry_block("cf");
    let target = method.create_block("%target");
    let label = method.blocks()[target].label().clone();
    let cond = method.add_new_local(TYPE_INT32, "%cond");
    method.append_to_block(
        0,
        Instruction::branch(label, BranchCondition::ZeroSet, cond),
    );
    extend_branches(&mut method).unwrap();

    let instructions = method.block(0).instructions();
    let branch = instructions
        .iter()
        .position(|inst| matches!(inst.kind, InstructionKind::Branch { .. }))
        .unwrap();
    for offset in 1..=3 {
        assert!(
            matches!(
                instructions[branch + offset].kind,
                InstructionKind::Nop {
                    delay: DelayKind::BranchDelay
                }
            ),
            "missing delay slot {offset}"
        );
    }
    // the condition was ORed with the element numbers into the flags
    let setter = &instructions[branch - 1];
    assert!(setter.does_set_flag(), "{setter}");
    assert!(setter.to_string().contains("elem_num"), "{setter}");
}

#[test]
fn repeated_branches_on_the_same_condition_set_flags_once() {
    init_logging();
    let mut method = method_with_entry_block("cf");
    let first = method.create_block("%first");
    let second = method.create_block("%second");
    let cond = method.add_new_local(TYPE_INT32, "%cond");
    let first_label = method.blocks()[first].label().clone();
    let second_label = method.blocks()[second].label().clone();
    method.append_to_block(
        0,
        Instruction::branch(first_label, BranchCondition::ZeroSet, cond.clone()),
    );
    method.append_to_block(
        0,
        Instruction::branch(second_label, BranchCondition::ZeroClear, cond),
    );
    extend_branches(&mut method).unwrap();
    let text = method.to_text();
    assert_eq!(text.matches("setf").count(), 1, "{text}");
}

/// cond -> {A, B} -> join with `x = 1` / `x = 2` collapses into conditional
/// moves in the predecessor and a single branch to the join block.
#[test]
fn if_else_diamonds_collapse_to_conditional_moves() {
    init_logging();
    let mut method = method_with_entry_block("cf");
    let block_a = method.create_block("%then");
    let block_b = method.create_block("%else");
    let join = method.create_block("%join");
    let a_label = method.blocks()[block_a].label().clone();
    let b_label = method.blocks()[block_b].label().clone();
    let join_label = method.blocks()[join].label().clone();

    let cond = method.add_new_local(TYPE_INT32, "%cond");
    let x = method.add_new_local(TYPE_INT32, "%x");
    method.append_to_block(
        0,
        Instruction::branch(a_label, BranchCondition::ZeroSet, cond),
    );
    method.append_to_block(
        0,
        Instruction::branch(b_label, BranchCondition::Always, BOOL_TRUE),
    );
    method.append_to_block(block_a, Instruction::mov(x.clone(), Value::int(1)));
    method.append_to_block(
        block_a,
        Instruction::branch(join_label.clone(), BranchCondition::Always, BOOL_TRUE),
    );
    method.append_to_block(block_b, Instruction::mov(x.clone(), Value::int(2)));
    method.append_to_block(
        block_b,
        Instruction::branch(join_label, BranchCondition::Always, BOOL_TRUE),
    );
    // the written local escapes into the join block
    let y = method.add_new_local(TYPE_INT32, "%y");
    method.append_to_block(
        join,
        Instruction::op(OpCode::Add, y, x.clone(), Value::int(0)),
    );

    assert!(simplify_conditional_blocks(&mut method).unwrap());

    // only the predecessor and the join block remain
    assert_eq!(method.blocks().len(), 2);
    let entry = method.block(0).instructions();
    // the conditional path writes under its branch condition
    let conditional_write = entry.iter().any(|inst| {
        inst.writes_local(x.local_id().unwrap()) && inst.condition == ConditionCode::ZeroSet
    });
    assert!(conditional_write, "{}", method.to_text());
    // the default path writes unconditionally, before the conditional one
    let default_position = entry
        .iter()
        .position(|inst| {
            inst.writes_local(x.local_id().unwrap())
                && inst.condition == ConditionCode::Always
        })
        .unwrap();
    let conditional_position = entry
        .iter()
        .position(|inst| {
            inst.writes_local(x.local_id().unwrap())
                && inst.condition == ConditionCode::ZeroSet
        })
        .unwrap();
    assert!(default_position < conditional_position, "{}", method.to_text());
    // control continues into the join block
    assert!(
        matches!(
            entry.last().unwrap().kind,
            InstructionKind::Branch { ref target, .. } if &*target.name == "%join"
        ),
        "{}",
        method.to_text()
    );
}

#[test]
fn block_merging_is_idempotent() {
    init_logging();
    let mut method = method_with_entry_block("cf");
    let second = method.create_block("%straight");
    let tail = method.add_new_local(TYPE_INT32, "%t");
    method.append_to_block(second, Instruction::mov(tail, Value::int(1)));

    assert!(merge_adjacent_blocks(&mut method).unwrap());
    assert_eq!(method.blocks().len(), 1);
    // a second run finds no candidates
    assert!(!merge_adjacent_blocks(&mut method).unwrap());
    assert_eq!(method.blocks().len(), 1);
}

#[test]
fn reserved_last_block_is_never_merged() {
    init_logging();
    let mut method = method_with_entry_block("cf");
    method.create_block("%end_of_function");
    assert!(!merge_adjacent_blocks(&mut method).unwrap());
    assert_eq!(method.blocks().len(), 2);
}

fn count_uniform_reads(method: &Method) -> usize {
    method
        .blocks()
        .iter()
        .flat_map(|block| block.instructions())
        .filter(|inst| {
            inst.arguments()
                .iter()
                .any(|arg| arg.check_register() == Some(vc4cc::ir::value::REG_UNIFORM))
        })
        .count()
}

#[test]
fn start_segment_loads_only_read_implicit_arguments() {
    init_logging();
    let mut method = method_with_entry_block("cf");
    // a kernel using only the global data address
    let gda = method.find_or_create_local(
        TYPE_INT32,
        vc4cc::ir::method::GLOBAL_DATA_ADDRESS,
    );
    let user = method.add_new_local(TYPE_INT32, "%u");
    let gda_value = Value::local(gda, TYPE_INT32);
    method.append_to_end(Instruction::op(
        OpCode::Add,
        user,
        gda_value,
        Value::int(4),
    ));

    add_start_stop_segment(&mut method).unwrap();

    let bit = vc4cc::ir::UniformsUsed::bit_for(vc4cc::ir::method::GLOBAL_DATA_ADDRESS).unwrap();
    assert!(method.metadata.uniforms_used.is_used(bit));
    assert_eq!(method.metadata.uniforms_used.count_uniforms(), 1);
    assert_eq!(count_uniform_reads(&method), 1);

    // the stop segment ends the program
    let text = method.to_text();
    assert!(text.contains("endprogram"), "{text}");
}

#[test]
fn vector_parameters_load_one_uniform_per_lane() {
    init_logging();
    let mut method = method_with_entry_block("cf");
    let int4 = TYPE_INT32.to_vector_type(4);
    let param = method.add_parameter(
        "v",
        int4.clone(),
        vc4cc::ir::ParameterDecorations::BY_VALUE,
    );
    // the parameter must be used somewhere
    let user = method.add_new_local(TYPE_INT32, "%u");
    let param_value = Value::local(param, int4);
    method.append_to_end(Instruction::op(
        OpCode::Add,
        user,
        param_value,
        Value::int(0),
    ));

    add_start_stop_segment(&mut method).unwrap();
    assert_eq!(count_uniform_reads(&method), 4);
    // lanes beyond the first are written under an element-match condition
    let text = method.to_text();
    assert!(text.contains("element_insertion"), "{text}");
}
