//! Cleanup of flag-setting instructions.

use log::debug;

use crate::error::CompileResult;
use crate::ir::instruction::{InstructionKind, SetFlag};
use crate::ir::method::Method;
use crate::ir::value::Value;
use crate::ir::walker::InstructionWalker;

/// Whether the instruction is a pure flag-setting move into the nop register.
fn is_flag_only_move(inst: &crate::ir::instruction::Instruction) -> Option<&Value> {
    if inst.set_flags != SetFlag::SetFlags || inst.has_conditional_execution() {
        return None;
    }
    let writes_nop = inst
        .output()
        .and_then(Value::check_register)
        .is_some_and(|reg| reg == crate::ir::value::REG_NOP);
    if !writes_nop {
        return None;
    }
    match &inst.kind {
        InstructionKind::Move { source } => Some(source),
        _ => None,
    }
}

/// Drop re-settings of flags from the same unchanged value.
pub fn combine_same_flags(method: &mut Method) -> CompileResult<bool> {
    crate::profile_scope!("CombineSameFlags");
    let mut changed = false;
    for block in 0..method.blocks().len() {
        let mut last_source: Option<Value> = None;
        let mut index = 0usize;
        while index < method.block(block).size() {
            let walker = InstructionWalker::new(block, index);
            let inst = method.instruction(walker).unwrap();
            if let Some(source) = is_flag_only_move(inst) {
                if last_source.as_ref() == Some(source) {
                    debug!("Removing duplicate setting of the same flags: {inst}");
                    method.erase(walker);
                    changed = true;
                    continue;
                }
                last_source = Some(source.clone());
            } else {
                if inst.does_set_flag() {
                    // different flag source
                    last_source = None;
                }
                // overwriting the flag source invalidates the tracking
                if let (Some(out), Some(last)) = (inst.check_output_local(), &last_source) {
                    if last.local_id() == Some(out.id) {
                        last_source = None;
                    }
                }
            }
            index += 1;
        }
    }
    Ok(changed)
}

/// Remove flag settings whose flags nothing consumes before they are
/// overwritten or the block ends.
pub fn remove_useless_flags(method: &mut Method) -> CompileResult<bool> {
    crate::profile_scope!("RemoveUselessFlags");
    let mut changed = false;
    for block in 0..method.blocks().len() {
        let mut index = 0usize;
        while index < method.block(block).size() {
            let walker = InstructionWalker::new(block, index);
            let setter = method.instruction(walker).unwrap();
            if !setter.does_set_flag() {
                index += 1;
                continue;
            }
            // consumed if any later instruction (up to the next setter)
            // executes conditionally
            let mut consumed = false;
            let mut scan = index + 1;
            while scan < method.block(block).size() {
                let follower = &method.block(block).instructions()[scan];
                if follower.has_conditional_execution() {
                    consumed = true;
                    break;
                }
                if follower.does_set_flag() {
                    break;
                }
                scan += 1;
            }
            if consumed {
                index += 1;
                continue;
            }
            let inst = method.instruction(walker).unwrap();
            if is_flag_only_move(inst).is_some() && !inst.has_side_effects() {
                debug!("Removing unused flag-only instruction: {inst}");
                method.erase(walker);
                changed = true;
                continue;
            }
            debug!("Removing unused flag setting: {inst}");
            let mut rewritten = inst.clone();
            rewritten.set_flags = SetFlag::DontSet;
            method.replace(walker, rewritten);
            changed = true;
            index += 1;
        }
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::instruction::{ConditionCode, Instruction};
    use crate::ir::method::method_with_entry_block;
    use crate::ir::types::TYPE_INT32;
    use crate::ir::value::{nop_value, Value};

    #[test]
    fn duplicate_flag_settings_collapse() {
        let mut method = method_with_entry_block("flags");
        let cond = method.add_new_local(TYPE_INT32, "%cond");
        let a = method.add_new_local(TYPE_INT32, "%a");
        method.append_to_end(
            Instruction::mov(nop_value(), cond.clone()).with_flags(SetFlag::SetFlags),
        );
        method.append_to_end(
            Instruction::mov(a.clone(), Value::int(1)).with_condition(ConditionCode::ZeroSet),
        );
        method.append_to_end(
            Instruction::mov(nop_value(), cond.clone()).with_flags(SetFlag::SetFlags),
        );
        method.append_to_end(
            Instruction::mov(a, Value::int(2)).with_condition(ConditionCode::ZeroClear),
        );
        assert!(combine_same_flags(&mut method).unwrap());
        let text = method.to_text();
        assert_eq!(text.matches("setf").count(), 1, "{text}");
    }

    #[test]
    fn unconsumed_flags_are_removed() {
        let mut method = method_with_entry_block("flags");
        let cond = method.add_new_local(TYPE_INT32, "%cond");
        method.append_to_end(
            Instruction::mov(nop_value(), cond).with_flags(SetFlag::SetFlags),
        );
        assert!(remove_useless_flags(&mut method).unwrap());
        assert!(!method.to_text().contains("setf"));
    }

    #[test]
    fn consumed_flags_stay() {
        let mut method = method_with_entry_block("flags");
        let cond = method.add_new_local(TYPE_INT32, "%cond");
        let a = method.add_new_local(TYPE_INT32, "%a");
        method.append_to_end(
            Instruction::mov(nop_value(), cond).with_flags(SetFlag::SetFlags),
        );
        method.append_to_end(
            Instruction::mov(a, Value::int(1)).with_condition(ConditionCode::ZeroSet),
        );
        assert!(!remove_useless_flags(&mut method).unwrap());
        assert!(method.to_text().contains("setf"));
    }
}
