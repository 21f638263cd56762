//! Integration tests for the memory-access lowering.

use vc4cc::ir::instruction::{Instruction, InstructionKind, MemoryOp, OpCode};
use vc4cc::ir::method::{method_with_entry_block, Method};
use vc4cc::ir::types::{AddressSpace, DataType, TYPE_INT32};
use vc4cc::ir::value::{Value, INT_ONE};
use vc4cc::ir::ParameterDecorations;
use vc4cc::normalization::lower_memory_access;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn assert_no_residual_memory(method: &Method) {
    for block in method.blocks() {
        for inst in block.instructions() {
            assert!(
                !matches!(inst.kind, InstructionKind::Memory { .. }),
                "residual memory instruction: {inst}"
            );
        }
    }
}

/// `__kernel void k(__global int* out, __constant int4 C)`:
/// `out[gid] = C.y` loads the by-value vector argument with a rotation, no
/// TMU or DMA access is emitted for `C`.
#[test]
fn constant_vector_argument_reads_become_rotations() {
    init_logging();
    let mut method = method_with_entry_block("k");
    let int4 = TYPE_INT32.to_vector_type(4);
    let c = method.add_parameter("C", int4.clone(), ParameterDecorations::BY_VALUE);
    let c_value = Value::local(c, int4);

    // the front-end emitted `%addr = C + 4` for the `.y` access
    let addr = method.add_new_local(TYPE_INT32, "%addr");
    method.append_to_end(Instruction::op(
        OpCode::Add,
        addr.clone(),
        c_value,
        Value::int(4),
    ));
    let y = method.add_new_local(TYPE_INT32, "%y");
    method.append_to_end(Instruction::memory(
        MemoryOp::Read,
        y,
        addr,
        INT_ONE,
        false,
    ));

    lower_memory_access(&mut method).unwrap();
    assert_no_residual_memory(&method);

    let text = method.to_text();
    // element 1 is extracted by rotating up 15 lanes
    assert!(text.contains("<<15"), "expected rotation: {text}");
    assert!(!text.contains("tmu"), "no TMU access expected: {text}");
    assert!(!text.contains("vpm"), "no VPM access expected: {text}");
}

/// With two read-only `__global` pointers, the second read must go to the
/// other TMU; the tie for the first one goes to TMU1.
#[test]
fn tmu_loads_balance_between_both_units() {
    init_logging();
    let mut method = method_with_entry_block("k");
    let ptr = DataType::pointer(TYPE_INT32, AddressSpace::Global);
    let a = method.add_parameter("a", ptr.clone(), ParameterDecorations::empty());
    let b = method.add_parameter("b", ptr.clone(), ParameterDecorations::empty());

    let first = method.add_new_local(TYPE_INT32, "%first");
    let a_value = Value::local(a, ptr.clone());
    method.append_to_end(Instruction::memory(
        MemoryOp::Read,
        first,
        a_value,
        INT_ONE,
        false,
    ));
    let second = method.add_new_local(TYPE_INT32, "%second");
    let b_value = Value::local(b, ptr);
    method.append_to_end(Instruction::memory(
        MemoryOp::Read,
        second,
        b_value,
        INT_ONE,
        false,
    ));

    lower_memory_access(&mut method).unwrap();
    assert_no_residual_memory(&method);

    let text = method.to_text();
    assert!(text.contains("tmu1s"), "first read on TMU1: {text}");
    assert!(text.contains("tmu0s"), "second read on TMU0: {text}");
}

/// A write through a `__global` pointer routes through the VPM and DMA.
#[test]
fn global_writes_route_through_dma() {
    init_logging();
    let mut method = method_with_entry_block("k");
    let ptr = DataType::pointer(TYPE_INT32, AddressSpace::Global);
    let out = method.add_parameter("out", ptr.clone(), ParameterDecorations::empty());
    let value = method.add_new_local(TYPE_INT32, "%v");
    let out_value = Value::local(out, ptr);
    method.append_to_end(Instruction::memory(
        MemoryOp::Write,
        out_value,
        value,
        INT_ONE,
        false,
    ));

    lower_memory_access(&mut method).unwrap();
    assert_no_residual_memory(&method);

    let text = method.to_text();
    assert!(text.contains("vpw_setup"), "VPM write setup expected: {text}");
    assert!(text.contains("vpm_st_addr"), "DMA store address expected: {text}");
}

/// Guarded accesses to RAM are bracketed by mutex lock and release.
#[test]
fn guarded_accesses_are_mutex_bracketed() {
    init_logging();
    let mut method = method_with_entry_block("k");
    let ptr = DataType::pointer(TYPE_INT32, AddressSpace::Global);
    let out = method.add_parameter("out", ptr.clone(), ParameterDecorations::empty());
    let value = method.add_new_local(TYPE_INT32, "%v");
    let out_value = Value::local(out, ptr);
    method.append_to_end(Instruction::memory(
        MemoryOp::Write,
        out_value,
        value,
        INT_ONE,
        true,
    ));

    lower_memory_access(&mut method).unwrap();

    let text = method.to_text();
    let lock = text.find("mutex.lock").expect("mutex lock");
    let release = text.find("mutex.release").expect("mutex release");
    assert!(lock < release);
}

/// Filling byte-wise memory widens the byte to full words first.
#[test]
fn byte_fills_are_widened_to_words() {
    init_logging();
    let mut method = method_with_entry_block("k");
    let ptr = DataType::pointer(vc4cc::ir::types::TYPE_INT8, AddressSpace::Global);
    let out = method.add_parameter("out", ptr.clone(), ParameterDecorations::empty());
    let byte = method.add_new_local(vc4cc::ir::types::TYPE_INT8, "%byte");
    let out_value = Value::local(out, ptr);
    method.append_to_end(Instruction::memory(
        MemoryOp::Fill,
        out_value,
        byte,
        Value::int(64),
        false,
    ));

    lower_memory_access(&mut method).unwrap();
    assert_no_residual_memory(&method);

    let text = method.to_text();
    assert!(text.contains("%fill_word"), "byte widening expected: {text}");
    assert!(text.contains("%memory_fill"), "replication expected: {text}");
    assert!(text.contains("vpm_st_addr"), "DMA fill expected: {text}");
}

/// Stack allocations that fit into a register never touch a peripheral.
#[test]
fn private_array_reads_stay_in_registers() {
    init_logging();
    let mut method = method_with_entry_block("k");
    let array = DataType::array(TYPE_INT32, 4);
    let ptr = DataType::pointer(array, AddressSpace::Private);
    let alloc = method.add_stack_allocation("%arr", ptr.clone(), 16, 4);
    let alloc_value = Value::local(alloc, ptr);

    // write element 2, read it back
    let elem_addr = method.add_new_local(TYPE_INT32, "%addr");
    method.append_to_end(Instruction::op(
        OpCode::Add,
        elem_addr.clone(),
        alloc_value,
        Value::int(8),
    ));
    let input = method.add_new_local(TYPE_INT32, "%in");
    method.append_to_end(Instruction::memory(
        MemoryOp::Write,
        elem_addr.clone(),
        input,
        INT_ONE,
        false,
    ));
    let output = method.add_new_local(TYPE_INT32, "%out");
    method.append_to_end(Instruction::memory(
        MemoryOp::Read,
        output,
        elem_addr,
        INT_ONE,
        false,
    ));

    lower_memory_access(&mut method).unwrap();
    assert_no_residual_memory(&method);

    let text = method.to_text();
    assert!(!text.contains("tmu"), "{text}");
    assert!(!text.contains("vpm"), "{text}");
    // the write inserts into a lane, the read rotates the lane out
    assert!(text.contains("element_insertion"), "{text}");
    assert!(text.contains("<<"), "{text}");
}
