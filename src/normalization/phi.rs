//! Phi-node elimination.
//!
//! Phi nodes are rewritten into moves in their predecessor blocks, placed
//! before the branch entering the phi's block (or at the block end for
//! fall-through edges). The moves carry the phi-node decoration so later
//! analyses can recognize them.

use log::debug;

use crate::error::{CompileError, CompileResult};
use crate::ir::instruction::{Decorations, Instruction, InstructionKind};
use crate::ir::method::Method;
use crate::ir::walker::InstructionWalker;

/// Position in the predecessor block where the phi move belongs: before the
/// branch targeting `target_label`, else the block end.
fn insertion_point(
    method: &Method,
    pred_block: usize,
    target_label: crate::ir::local::LocalId,
) -> InstructionWalker {
    for (index, inst) in method.block(pred_block).instructions().iter().enumerate() {
        if let InstructionKind::Branch { target, .. } = &inst.kind {
            if target.id == target_label {
                return InstructionWalker::new(pred_block, index);
            }
        }
    }
    method.walk_block_end(pred_block)
}

/// Replace every phi node by decorated moves in the predecessors.
pub fn eliminate_phi_nodes(method: &mut Method) -> CompileResult<()> {
    crate::profile_scope!("EliminatePhiNodes");
    let mut block = 0usize;
    while block < method.blocks().len() {
        let label = method.block(block).label().id;
        let mut index = 0usize;
        while index < method.block(block).size() {
            let walker = InstructionWalker::new(block, index);
            let (output, sources) = match method.instruction(walker).map(|inst| &inst.kind) {
                Some(InstructionKind::Phi { sources }) => {
                    let inst = method.instruction(walker).unwrap();
                    (
                        inst.output.clone().ok_or_else(|| {
                            CompileError::normalization(
                                "phi node without destination",
                                inst.to_string(),
                            )
                        })?,
                        sources.clone(),
                    )
                }
                _ => {
                    index += 1;
                    continue;
                }
            };
            debug!(
                "Eliminating phi node into {} predecessor moves",
                sources.len()
            );
            method.erase(walker);
            for (pred_label, value) in sources {
                let pred_block = method.block_index_by_label(pred_label.id).ok_or_else(|| {
                    CompileError::normalization_general(format!(
                        "unknown predecessor block {}",
                        pred_label.name
                    ))
                })?;
                let point = insertion_point(method, pred_block, label);
                method.emplace(
                    point,
                    Instruction::mov(output.clone(), value)
                        .with_decorations(Decorations::PHI_NODE),
                );
                // inserting into an earlier position of the same block shifts
                // the scan position
                if pred_block == block && point.index <= index {
                    index += 1;
                }
            }
        }
        block += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::instruction::{BranchCondition, OpCode};
    use crate::ir::method::method_with_entry_block;
    use crate::ir::types::TYPE_INT32;
    use crate::ir::value::{Value, BOOL_TRUE};

    #[test]
    fn phi_becomes_predecessor_moves() {
        let mut method = method_with_entry_block("phi");
        let header = method.create_block("%header");
        let latch = method.create_block("%latch");
        let header_label = method.blocks()[header].label().clone();
        let i = method.add_new_local(TYPE_INT32, "%i");
        let next = method.add_new_local(TYPE_INT32, "%i_next");
        let entry_label = method.blocks()[0].label().clone();
        let latch_label = method.blocks()[latch].label().clone();
        method.append_to_block(
            header,
            Instruction::phi(
                i.clone(),
                vec![
                    (entry_label, Value::int(0)),
                    (latch_label, next.clone()),
                ],
            ),
        );
        method.append_to_block(
            latch,
            Instruction::op(OpCode::Add, next, i.clone(), Value::int(1)),
        );
        method.append_to_block(
            latch,
            Instruction::branch(header_label, BranchCondition::ZeroSet, BOOL_TRUE),
        );
        eliminate_phi_nodes(&mut method).unwrap();
        let text = method.to_text();
        assert!(!text.contains("= phi"), "{text}");
        // one move per predecessor, decorated as phi
        assert_eq!(text.matches("phi_node").count(), 2, "{text}");
    }
}
