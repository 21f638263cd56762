//! Literal-operand materialization.
//!
//! ALU operands can only carry a 6-bit small immediate; any other literal
//! must be loaded into a register first. This pass rewrites literal operands
//! into small immediates where the encoding exists and inserts explicit
//! load-immediate instructions otherwise.

use log::debug;

use crate::error::CompileResult;
use crate::ir::instruction::{Instruction, InstructionKind};
use crate::ir::method::Method;
use crate::ir::value::{SmallImmediate, Value, ValueContent};
use crate::ir::walker::InstructionWalker;

/// The small-immediate encoding of the literal, if one exists for its type.
fn encode_small_immediate(value: &Value) -> Option<SmallImmediate> {
    let literal = match value.content {
        ValueContent::Literal(literal) => literal,
        _ => return None,
    };
    if value.data_type.is_float_type() {
        SmallImmediate::from_float(literal.real())
    } else {
        SmallImmediate::from_integer(literal.signed_int())
    }
}

fn wants_materialization(inst: &Instruction) -> bool {
    matches!(
        inst.kind,
        InstructionKind::Op { .. } | InstructionKind::Move { .. } | InstructionKind::VectorRotation { .. }
    )
}

/// Rewrite the instruction at the walker position; returns the walker at the
/// (possibly shifted) instruction.
pub fn handle_immediate(method: &mut Method, mut it: InstructionWalker) -> InstructionWalker {
    let inst = match method.instruction(it) {
        Some(inst) if wants_materialization(inst) => inst.clone(),
        _ => return it,
    };
    // only one small immediate fits into an instruction word
    let mut used_immediate: Option<SmallImmediate> = None;
    let mut loads: Vec<(usize, Value)> = Vec::new();
    let mut rewritten = inst.clone();
    let mut index = 0usize;
    rewritten.for_each_argument_mut(|arg| {
        if let ValueContent::Literal(_) = arg.content {
            match encode_small_immediate(arg) {
                Some(imm) if used_immediate.is_none() || used_immediate == Some(imm) => {
                    used_immediate = Some(imm);
                    *arg = Value::small_immediate(imm, arg.data_type.clone());
                }
                _ => loads.push((index, arg.clone())),
            }
        } else if let ValueContent::SmallImmediate(imm) = arg.content {
            if imm.rotation_offset().is_none() && imm != crate::ir::value::VECTOR_ROTATE_R5 {
                used_immediate = Some(imm);
            }
        }
        index += 1;
    });
    if loads.is_empty() {
        if rewritten.kind != inst.kind {
            method.replace(it, rewritten);
        }
        return it;
    }
    for (load_index, literal_value) in &loads {
        let tmp = method.add_new_local(literal_value.data_type.clone(), "%immediate");
        let literal = literal_value.literal_value().expect("literal operand");
        debug!("Loading immediate value into register: {literal}");
        it = method.emplace(it, Instruction::load_immediate(tmp.clone(), literal));
        it = it.next_in_block(method);
        let mut index = 0usize;
        rewritten.for_each_argument_mut(|arg| {
            if index == *load_index {
                *arg = tmp.clone();
            }
            index += 1;
        });
    }
    method.replace(it, rewritten);
    it
}

/// Materialize literal operands over the whole method.
pub fn handle_immediates(method: &mut Method) -> CompileResult<()> {
    crate::profile_scope!("HandleImmediates");
    let mut it = method.walk_all();
    while !it.is_end_of_method(method) {
        it = handle_immediate(method, it);
        it = it.next_in_method(method);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::instruction::OpCode;
    use crate::ir::method::method_with_entry_block;
    use crate::ir::types::TYPE_INT32;

    #[test]
    fn small_literals_become_small_immediates() {
        let mut method = method_with_entry_block("imm");
        let out = method.add_new_local(TYPE_INT32, "%out");
        let a = method.add_new_local(TYPE_INT32, "%a");
        method.append_to_end(Instruction::op(OpCode::Add, out, a, Value::int(7)));
        handle_immediates(&mut method).unwrap();
        let text = method.to_text();
        assert!(!text.contains("ldi"), "{text}");
    }

    #[test]
    fn large_literals_are_loaded() {
        let mut method = method_with_entry_block("imm");
        let out = method.add_new_local(TYPE_INT32, "%out");
        let a = method.add_new_local(TYPE_INT32, "%a");
        method.append_to_end(Instruction::op(OpCode::Add, out, a, Value::int(1000)));
        handle_immediates(&mut method).unwrap();
        let text = method.to_text();
        assert!(text.contains("ldi 1000"), "{text}");
    }

    #[test]
    fn two_different_immediates_force_a_load() {
        let mut method = method_with_entry_block("imm");
        let out = method.add_new_local(TYPE_INT32, "%out");
        method.append_to_end(Instruction::op(
            OpCode::Add,
            out,
            Value::int(3),
            Value::int(4),
        ));
        handle_immediates(&mut method).unwrap();
        let text = method.to_text();
        assert!(text.contains("ldi 4"), "{text}");
    }
}
