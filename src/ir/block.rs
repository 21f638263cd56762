//! Basic blocks.

use super::instruction::{ConditionCode, Instruction, InstructionKind};
use super::value::LocalRef;

/// Name of the implicit first block of a kernel.
pub const DEFAULT_BLOCK: &str = "%start_of_function";
/// Name of the reserved final block, kept unmerged so the work-group loop can
/// be unrolled around the kernel body.
pub const LAST_BLOCK: &str = "%end_of_function";

/// An ordered sequence of instructions, beginning with its label. The block
/// falls through to its layout successor unless it ends with an unconditional
/// branch.
#[derive(Clone, Debug)]
pub struct BasicBlock {
    pub(crate) instructions: Vec<Instruction>,
}

impl BasicBlock {
    pub(crate) fn new(label: Instruction) -> Self {
        debug_assert!(matches!(label.kind, InstructionKind::Label { .. }));
        BasicBlock {
            instructions: vec![label],
        }
    }

    pub fn label(&self) -> &LocalRef {
        match &self.instructions[0].kind {
            InstructionKind::Label { label } => label,
            _ => unreachable!("block must start with its label"),
        }
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Number of instructions including the label.
    pub fn size(&self) -> usize {
        self.instructions.len()
    }

    /// Whether the block only contains its label.
    pub fn is_empty(&self) -> bool {
        self.instructions.len() <= 1
    }

    /// Whether control continues into the next block in layout order.
    pub fn falls_through(&self) -> bool {
        !self.instructions.iter().rev().any(|inst| {
            matches!(inst.kind, InstructionKind::Branch { .. })
                && inst.condition == ConditionCode::Always
        })
    }

    /// The final unconditional branch, if any.
    pub fn terminating_branch(&self) -> Option<&Instruction> {
        self.instructions.iter().rev().find(|inst| {
            matches!(inst.kind, InstructionKind::Branch { .. })
                && inst.condition == ConditionCode::Always
        })
    }
}
