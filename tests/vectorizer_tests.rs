//! Integration tests for the loop vectorizer.

use vc4cc::ir::instruction::{
    BranchCondition, Decorations, Instruction, InstructionKind, MemoryOp, OpCode, SetFlag,
};
use vc4cc::ir::method::{method_with_entry_block, Method};
use vc4cc::ir::types::{AddressSpace, DataType, TYPE_INT32, TYPE_INT8};
use vc4cc::ir::value::{SmallImmediate, Value, INT_ONE};
use vc4cc::ir::ParameterDecorations;
use vc4cc::normalization::lower_memory_access;
use vc4cc::optimization::vectorize_loops;
use vc4cc::periphery::vpm::{dma_setup_kind, DmaSetupKind};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// `for (int i = 0; i < 16; ++i) out[i] = a[i] + 1;`
///
/// The iteration variable is phi-carried: initialized before the loop,
/// updated at the end of the (single) loop block, compared against the limit
/// and branched on.
fn build_vector_add_kernel(extra_rotation: bool) -> (Method, Value) {
    let mut method = method_with_entry_block("k");
    let loop_block = method.create_block("%loop");
    method.create_block("%end_of_function");
    let ptr = DataType::pointer(TYPE_INT32, AddressSpace::Global);
    let a = method.add_parameter("a", ptr.clone(), ParameterDecorations::empty());
    let out = method.add_parameter("out", ptr.clone(), ParameterDecorations::empty());
    let a_value = Value::local(a, ptr.clone());
    let out_value = Value::local(out, ptr);

    let i = method.add_new_local(TYPE_INT32, "%i");
    method.append_to_block(
        0,
        Instruction::mov(i.clone(), Value::int(0)).with_decorations(Decorations::PHI_NODE),
    );

    // a[i] + 1 -> out[i]
    let offset = method.add_new_local(TYPE_INT32, "%offset");
    method.append_to_block(
        loop_block,
        Instruction::op(OpCode::Shl, offset.clone(), i.clone(), Value::int(2)),
    );
    let a_addr = method.add_new_local(TYPE_INT32, "%a_addr");
    method.append_to_block(
        loop_block,
        Instruction::op(OpCode::Add, a_addr.clone(), a_value, offset.clone()),
    );
    let value = method.add_new_local(TYPE_INT32, "%value");
    method.append_to_block(
        loop_block,
        Instruction::memory(MemoryOp::Read, value.clone(), a_addr, INT_ONE, false),
    );
    let sum = method.add_new_local(TYPE_INT32, "%sum");
    method.append_to_block(
        loop_block,
        Instruction::op(OpCode::Add, sum.clone(), value.clone(), INT_ONE),
    );
    if extra_rotation {
        let rotated = method.add_new_local(TYPE_INT32, "%rotated");
        method.append_to_block(
            loop_block,
            Instruction::vector_rotation(
                rotated,
                value,
                Value::small_immediate(
                    SmallImmediate::from_rotation_offset(1).unwrap(),
                    TYPE_INT8,
                ),
            ),
        );
    }
    let out_addr = method.add_new_local(TYPE_INT32, "%out_addr");
    method.append_to_block(
        loop_block,
        Instruction::op(OpCode::Add, out_addr.clone(), out_value, offset),
    );
    method.append_to_block(
        loop_block,
        Instruction::memory(MemoryOp::Write, out_addr, sum, INT_ONE, false),
    );

    // ++i and the repetition check
    let i_next = method.add_new_local(TYPE_INT32, "%i_next");
    method.append_to_block(
        loop_block,
        Instruction::op(OpCode::Add, i_next.clone(), i.clone(), INT_ONE),
    );
    method.append_to_block(
        loop_block,
        Instruction::mov(i.clone(), i_next.clone()).with_decorations(Decorations::PHI_NODE),
    );
    let comparison = method.add_new_local(TYPE_INT32, "%cmp");
    method.append_to_block(
        loop_block,
        Instruction::op(OpCode::Sub, comparison.clone(), i_next, Value::int(16))
            .with_flags(SetFlag::SetFlags),
    );
    let loop_label = method.blocks()[loop_block].label().clone();
    method.append_to_block(
        loop_block,
        Instruction::branch(loop_label, BranchCondition::ZeroClear, comparison),
    );
    (method, i)
}

#[test]
fn trivial_loop_vectorizes_with_factor_16() {
    init_logging();
    let (mut method, i) = build_vector_add_kernel(false);
    lower_memory_access(&mut method).unwrap();
    let changed = vectorize_loops(&mut method).unwrap();
    assert!(changed, "loop should vectorize");

    // the iteration variable is now a full vector
    let variable = method.local(i.local_id().unwrap());
    assert_eq!(variable.data_type, TYPE_INT32.to_vector_type(16));

    // the initial value became the per-lane element index
    let text = method.to_text();
    assert!(text.contains("elem_num"), "initial value: {text}");

    // the step was scaled to 16, which no longer fits a small immediate
    assert!(text.contains("ldi 16"), "scaled step: {text}");
}

#[test]
fn vectorized_instructions_are_all_marked() {
    init_logging();
    let (mut method, i) = build_vector_add_kernel(false);
    lower_memory_access(&mut method).unwrap();
    assert!(vectorize_loops(&mut method).unwrap());

    let widened = i.local_id().unwrap();
    let loop_block = method
        .block_index_by_label(method.find_local("%loop").unwrap().id)
        .unwrap();
    for inst in method.block(loop_block).instructions() {
        let depends_on_widened = inst.arguments().iter().any(|arg| {
            arg.local_id() == Some(widened)
                || arg
                    .local_id()
                    .is_some_and(|id| method.local(id).data_type.vector_width() == 16)
        });
        let reads_register_only = inst
            .arguments()
            .iter()
            .all(|arg| arg.check_register().is_some());
        if depends_on_widened {
            assert!(
                inst.has_decoration(Decorations::AUTO_VECTORIZED) || reads_register_only,
                "unmarked dependent instruction: {inst}"
            );
        }
    }
}

#[test]
fn dma_store_depth_is_scaled_by_the_factor() {
    init_logging();
    let (mut method, _) = build_vector_add_kernel(false);
    lower_memory_access(&mut method).unwrap();
    assert!(vectorize_loops(&mut method).unwrap());

    let mut found = false;
    for block in method.blocks() {
        for inst in block.instructions() {
            if let Some(DmaSetupKind::Store(setup)) = dma_setup_kind(inst) {
                if inst.has_decoration(Decorations::AUTO_VECTORIZED) {
                    // one word per row before widening, sixteen after
                    assert_eq!(setup.depth(), 16, "{inst}");
                    found = true;
                }
            }
        }
    }
    assert!(found, "expected a patched DMA store setup");
}

#[test]
fn loops_with_vector_rotations_are_rejected() {
    init_logging();
    let (mut method, i) = build_vector_add_kernel(true);
    lower_memory_access(&mut method).unwrap();
    let before = method.to_text();
    let changed = vectorize_loops(&mut method).unwrap();
    assert!(!changed, "rotation must reject vectorization");
    assert_eq!(method.to_text(), before, "loop must be preserved unchanged");
    assert_eq!(
        method.local(i.local_id().unwrap()).data_type,
        TYPE_INT32,
        "iteration variable must stay scalar"
    );
}

#[test]
fn loops_with_barriers_are_rejected() {
    init_logging();
    let (mut method, _) = build_vector_add_kernel(false);
    // a barrier inside the loop body
    let loop_block = method
        .block_index_by_label(method.find_local("%loop").unwrap().id)
        .unwrap();
    method.append_to_block(
        loop_block,
        Instruction::memory_barrier(
            vc4cc::ir::MemoryScope::WorkGroup,
            vc4cc::ir::MemorySemantics::ACQUIRE_RELEASE
                | vc4cc::ir::MemorySemantics::WORK_GROUP_MEMORY,
        ),
    );
    lower_memory_access(&mut method).unwrap();
    assert!(!vectorize_loops(&mut method).unwrap());
}

#[test]
fn non_dividing_iteration_counts_use_a_smaller_factor() {
    init_logging();
    // 12 iterations: the largest dividing factor within 16 lanes is 12
    let (mut method, i) = build_vector_add_kernel(false);
    let loop_block = method
        .block_index_by_label(method.find_local("%loop").unwrap().id)
        .unwrap();
    // patch the limit from 16 to 12
    let mut patched = None;
    for (index, inst) in method.block(loop_block).instructions().iter().enumerate() {
        if let InstructionKind::Op {
            code: OpCode::Sub, ..
        } = &inst.kind
        {
            patched = Some((index, inst.clone()));
        }
    }
    let (index, mut comparison) = patched.expect("comparison instruction");
    comparison.for_each_argument_mut(|arg| {
        if arg.literal_value().map(|l| l.signed_int()) == Some(16) {
            *arg = Value::int(12);
        }
    });
    method.replace(
        vc4cc::ir::InstructionWalker::new(loop_block, index),
        comparison,
    );

    lower_memory_access(&mut method).unwrap();
    assert!(vectorize_loops(&mut method).unwrap());
    assert_eq!(
        method.local(i.local_id().unwrap()).data_type,
        TYPE_INT32.to_vector_type(12)
    );
}
