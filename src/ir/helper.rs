//! Shared instruction-emission helpers: SIMD lane extraction/insertion,
//! whole-vector replication and pointer-to-offset arithmetic.

use crate::error::{CompileError, CompileResult};

use super::instruction::{
    ConditionCode, Decorations, Instruction, InstructionKind, OpCode, SetFlag,
};
use super::local::LocalId;
use super::method::Method;
use super::types::{DataType, NATIVE_VECTOR_SIZE, TYPE_INT32, TYPE_INT8};
use super::value::{
    element_number_value, nop_value, SmallImmediate, Value, REG_ACC5, REG_REPLICATE_ALL,
    VECTOR_ROTATE_R5,
};
use super::walker::InstructionWalker;

/// Replicate SIMD element 0 of `src` across all 16 elements of `dest`.
pub fn insert_replication(
    method: &mut Method,
    mut it: InstructionWalker,
    src: &Value,
    dest: &Value,
) -> InstructionWalker {
    // writing r5 broadcasts element 0, reading it back yields all lanes
    it = method.emplace(
        it,
        Instruction::mov(
            Value::register(REG_REPLICATE_ALL, src.data_type.clone()),
            src.clone(),
        ),
    );
    it = it.next_in_block(method);
    it = method.emplace(
        it,
        Instruction::mov(
            dest.clone(),
            Value::register(REG_ACC5, dest.data_type.clone()),
        ),
    );
    it.next_in_block(method)
}

/// Rotate `container` so the element at `index` lands in element 0 of `dest`.
pub fn insert_vector_extraction(
    method: &mut Method,
    mut it: InstructionWalker,
    container: &Value,
    index: &Value,
    dest: &Value,
) -> InstructionWalker {
    if let Some(literal) = index.literal_value() {
        let lane = (literal.unsigned_int() % u32::from(NATIVE_VECTOR_SIZE)) as u8;
        if lane == 0 {
            it = method.emplace(it, Instruction::mov(dest.clone(), container.clone()));
            return it.next_in_block(method);
        }
        let offset = (u32::from(NATIVE_VECTOR_SIZE) - u32::from(lane)) as u8;
        let rotation = SmallImmediate::from_rotation_offset(offset).expect("offset in range");
        it = method.emplace(
            it,
            Instruction::vector_rotation(
                dest.clone(),
                container.clone(),
                Value::small_immediate(rotation, TYPE_INT8),
            ),
        );
        return it.next_in_block(method);
    }
    // dynamic index: rotate by (16 - index) taken from r5
    let offset = method.add_new_local(TYPE_INT8, "%rotation_offset");
    it = method.emplace(
        it,
        Instruction::op(
            OpCode::Sub,
            offset.clone(),
            Value::int(i32::from(NATIVE_VECTOR_SIZE)),
            index.clone(),
        ),
    );
    it = it.next_in_block(method);
    it = method.emplace(
        it,
        Instruction::mov(
            Value::register(REG_REPLICATE_ALL, TYPE_INT8),
            offset,
        ),
    );
    it = it.next_in_block(method);
    it = method.emplace(
        it,
        Instruction::vector_rotation(
            dest.clone(),
            container.clone(),
            Value::small_immediate(VECTOR_ROTATE_R5, TYPE_INT8),
        ),
    );
    it.next_in_block(method)
}

/// Insert element 0 of `value` into `container` at the given element index.
pub fn insert_vector_insertion(
    method: &mut Method,
    mut it: InstructionWalker,
    container: &Value,
    index: &Value,
    value: &Value,
) -> InstructionWalker {
    // move the source element up to the target lane
    let rotated = method.add_new_local(container.data_type.clone(), "%vector_insert");
    if let Some(literal) = index.literal_value() {
        let lane = (literal.unsigned_int() % u32::from(NATIVE_VECTOR_SIZE)) as u8;
        if lane == 0 {
            it = method.emplace(it, Instruction::mov(rotated.clone(), value.clone()));
        } else {
            let rotation = SmallImmediate::from_rotation_offset(lane).expect("lane in range");
            it = method.emplace(
                it,
                Instruction::vector_rotation(
                    rotated.clone(),
                    value.clone(),
                    Value::small_immediate(rotation, TYPE_INT8),
                ),
            );
        }
        it = it.next_in_block(method);
    } else {
        it = method.emplace(
            it,
            Instruction::mov(Value::register(REG_REPLICATE_ALL, TYPE_INT8), index.clone()),
        );
        it = it.next_in_block(method);
        it = method.emplace(
            it,
            Instruction::vector_rotation(
                rotated.clone(),
                value.clone(),
                Value::small_immediate(VECTOR_ROTATE_R5, TYPE_INT8),
            ),
        );
        it = it.next_in_block(method);
    }
    // flag the target lane and write it conditionally
    it = method.emplace(
        it,
        Instruction::op(
            OpCode::Xor,
            nop_value(),
            element_number_value(),
            index.clone(),
        )
        .with_flags(SetFlag::SetFlags),
    );
    it = it.next_in_block(method);
    it = method.emplace(
        it,
        Instruction::mov(container.clone(), rotated)
            .with_condition(ConditionCode::ZeroSet)
            .with_decorations(Decorations::ELEMENT_INSERTION),
    );
    it.next_in_block(method)
}

/// Resolve the constant byte offset of `ptr` relative to the base local by
/// folding through its writer chain.
fn resolve_constant_offset(method: &Method, ptr: &Value, base: LocalId, depth: u32) -> Option<i32> {
    if ptr.has_local(base) {
        return Some(0);
    }
    if depth == 0 {
        return None;
    }
    let writer = method.single_writer(ptr.local_id()?)?;
    match &writer.kind {
        InstructionKind::Move { source } => resolve_constant_offset(method, source, base, depth - 1),
        InstructionKind::Op {
            code: OpCode::Add,
            first,
            second: Some(second),
        } => {
            if let Some(inner) = resolve_constant_offset(method, first, base, depth - 1) {
                let lit = method.precalculate(second, 2)?;
                Some(inner + lit.signed_int())
            } else {
                let inner = resolve_constant_offset(method, second, base, depth - 1)?;
                let lit = method.precalculate(first, 2)?;
                Some(inner + lit.signed_int())
            }
        }
        _ => None,
    }
}

/// Compute the byte offset of the pointer `ptr` relative to `base`.
pub fn insert_address_to_byte_offset(
    method: &mut Method,
    mut it: InstructionWalker,
    out: &mut Value,
    base: LocalId,
    ptr: &Value,
) -> InstructionWalker {
    if let Some(offset) = resolve_constant_offset(method, ptr, base, 6) {
        *out = Value::int(offset);
        return it;
    }
    let base_value = method.local(base).value();
    let tmp = method.add_new_local(TYPE_INT32, "%byte_offset");
    it = method.emplace(
        it,
        Instruction::op(OpCode::Sub, tmp.clone(), ptr.clone(), base_value),
    );
    *out = tmp;
    it.next_in_block(method)
}

/// Compute the in-vector element index of `ptr` into the register-mapped
/// `container`: the byte offset relative to `base` divided by element width.
pub fn insert_address_to_element_offset(
    method: &mut Method,
    mut it: InstructionWalker,
    out: &mut Value,
    base: LocalId,
    container: &DataType,
    ptr: &Value,
) -> CompileResult<InstructionWalker> {
    let element_width = container.element_type().in_memory_width().max(1);
    if !element_width.is_power_of_two() {
        return Err(CompileError::normalization_general(format!(
            "cannot index into register with non-power-of-two element width {element_width}"
        )));
    }
    let mut byte_offset = Value::undefined(TYPE_INT32);
    it = insert_address_to_byte_offset(method, it, &mut byte_offset, base, ptr);
    if let Some(lit) = byte_offset.literal_value() {
        *out = Value::int(lit.signed_int() >> element_width.trailing_zeros());
        return Ok(it);
    }
    let index = method.add_new_local(TYPE_INT32, "%element_offset");
    it = method.emplace(
        it,
        Instruction::op(
            OpCode::Shr,
            index.clone(),
            byte_offset,
            Value::int(element_width.trailing_zeros() as i32),
        ),
    );
    *out = index;
    Ok(it.next_in_block(method))
}

/// Sign-extend the (8- or 16-bit) `src` into the 32-bit `dest`.
pub fn insert_sign_extension(
    method: &mut Method,
    mut it: InstructionWalker,
    src: &Value,
    dest: &Value,
    condition: ConditionCode,
) -> InstructionWalker {
    let bits = i32::from(src.data_type.scalar_bit_count());
    let shift = Value::int(32 - bits);
    let shifted = method.add_new_local(TYPE_INT32, "%sext");
    it = method.emplace(
        it,
        Instruction::op(OpCode::Shl, shifted.clone(), src.clone(), shift.clone())
            .with_condition(condition),
    );
    it = it.next_in_block(method);
    it = method.emplace(
        it,
        Instruction::op(OpCode::Asr, dest.clone(), shifted, shift).with_condition(condition),
    );
    it.next_in_block(method)
}

/// Zero-extend the (8- or 16-bit) `src` into the 32-bit `dest`.
pub fn insert_zero_extension(
    method: &mut Method,
    mut it: InstructionWalker,
    src: &Value,
    dest: &Value,
    condition: ConditionCode,
) -> InstructionWalker {
    let mask = match src.data_type.scalar_bit_count() {
        8 => 0xFF,
        16 => 0xFFFF,
        _ => -1,
    };
    it = method.emplace(
        it,
        Instruction::op(OpCode::And, dest.clone(), src.clone(), Value::int(mask))
            .with_condition(condition)
            .with_decorations(Decorations::UNSIGNED_RESULT),
    );
    it.next_in_block(method)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::method::method_with_entry_block;

    #[test]
    fn extraction_of_element_zero_is_a_move() {
        let mut method = method_with_entry_block("test");
        let container = method.add_new_local(TYPE_INT32.to_vector_type(16), "%c");
        let dest = method.add_new_local(TYPE_INT32, "%d");
        let end = method.walk_block_end(0);
        insert_vector_extraction(&mut method, end, &container, &Value::int(0), &dest);
        let text = method.to_text();
        assert!(!text.contains("<<"), "no rotation expected: {text}");
    }

    #[test]
    fn extraction_rotates_by_inverse_lane() {
        let mut method = method_with_entry_block("test");
        let container = method.add_new_local(TYPE_INT32.to_vector_type(16), "%c");
        let dest = method.add_new_local(TYPE_INT32, "%d");
        let end = method.walk_block_end(0);
        insert_vector_extraction(&mut method, end, &container, &Value::int(1), &dest);
        // element 1 is brought to lane 0 by rotating up 15
        assert!(method.to_text().contains("<<15"), "{}", method.to_text());
    }

    #[test]
    fn constant_offsets_fold_through_adds() {
        let mut method = method_with_entry_block("test");
        let base = method.add_local("%base", TYPE_INT32);
        let ptr = method.add_new_local(TYPE_INT32, "%ptr");
        let base_value = method.local(base.id).value();
        method.append_to_end(Instruction::op(
            OpCode::Add,
            ptr.clone(),
            base_value,
            Value::int(4),
        ));
        let mut out = Value::undefined(TYPE_INT32);
        let end = method.walk_block_end(0);
        insert_address_to_element_offset(
            &mut method,
            end,
            &mut out,
            base.id,
            &TYPE_INT32.to_vector_type(4),
            &ptr,
        )
        .unwrap();
        assert_eq!(out.literal_value().unwrap().signed_int(), 1);
    }
}
