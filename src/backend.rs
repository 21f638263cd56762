//! Back-end collaborator interface: the final encoder maps legal
//! instructions to 64-bit words; this module defines its contract, the
//! legality requirements and the output module header carrying the
//! per-kernel UNIFORM usage for the runtime.

use std::collections::HashMap;

use crate::error::{CompileError, CompileResult};
use crate::ir::instruction::{Instruction, InstructionKind};
use crate::ir::local::LocalId;
use crate::ir::method::Method;
use crate::ir::value::Register;

/// Magic number identifying a compiled module (first word of the binary and
/// leading hex literal of the textual form).
pub const MODULE_MAGIC: u32 = 0xDEAD_BEAF;

/// Register assignment produced by the (out-of-scope) register allocator.
pub type RegisterMapping = HashMap<LocalId, Register>;

/// Whether the instruction can be handed to the encoder. Residual high-level
/// instructions mean an earlier pass failed its contract.
pub fn check_instruction_is_encodable(inst: &Instruction) -> CompileResult<()> {
    match &inst.kind {
        InstructionKind::Memory { .. } => Err(CompileError::code_generation(
            "memory instructions cannot be encoded",
            inst.to_string(),
        )),
        InstructionKind::MemoryBarrier { .. } => Err(CompileError::code_generation(
            "memory barriers cannot be encoded",
            inst.to_string(),
        )),
        InstructionKind::Phi { .. } => Err(CompileError::code_generation(
            "phi nodes cannot be encoded",
            inst.to_string(),
        )),
        InstructionKind::LifetimeBoundary { .. } => Err(CompileError::code_generation(
            "lifetime boundaries cannot be encoded",
            inst.to_string(),
        )),
        _ => Ok(()),
    }
}

/// The encoder collaborator: legal instructions plus register assignments in,
/// little-endian 64-bit instruction words out.
pub trait InstructionEncoder {
    fn encode(&self, method: &Method, registers: &RegisterMapping) -> CompileResult<Vec<u64>>;
}

/// Per-kernel entry of the output module header.
#[derive(Clone, Debug)]
pub struct KernelHeader {
    pub name: String,
    /// Offset of the kernel's first instruction word within the module.
    pub instruction_offset: u32,
    pub instruction_count: u32,
    /// Which implicit UNIFORMs the runtime must supply.
    pub uniforms_used: u16,
    pub work_group_size: Option<[u32; 3]>,
}

impl KernelHeader {
    pub fn for_method(method: &Method, instruction_offset: u32, instruction_count: u32) -> Self {
        KernelHeader {
            name: method.name.clone(),
            instruction_offset,
            instruction_count,
            uniforms_used: method.metadata.uniforms_used.value(),
            work_group_size: method.metadata.work_group_size,
        }
    }

    fn to_words(&self) -> Vec<u64> {
        let mut words = vec![
            (u64::from(self.instruction_offset) << 32) | u64::from(self.instruction_count),
            u64::from(self.uniforms_used),
        ];
        let size = self.work_group_size.unwrap_or([0, 0, 0]);
        words.push((u64::from(size[0]) << 32) | u64::from(size[1]));
        words.push(u64::from(size[2]));
        // the kernel name, zero-padded to whole words
        let mut name_bytes = self.name.as_bytes().to_vec();
        name_bytes.resize(name_bytes.len().div_ceil(8) * 8, 0);
        words.push(name_bytes.len() as u64 / 8);
        for chunk in name_bytes.chunks(8) {
            words.push(u64::from_le_bytes(chunk.try_into().unwrap()));
        }
        words
    }
}

/// Header of the compiled module binary.
#[derive(Clone, Debug, Default)]
pub struct ModuleHeader {
    pub kernels: Vec<KernelHeader>,
}

impl ModuleHeader {
    /// Serialize the header to instruction-stream words: the magic, the
    /// kernel count and all kernel entries.
    pub fn to_words(&self) -> Vec<u64> {
        let mut words = vec![u64::from(MODULE_MAGIC), self.kernels.len() as u64];
        for kernel in &self.kernels {
            words.extend(kernel.to_words());
        }
        words
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::instruction::MemoryOp;
    use crate::ir::value::{Value, INT_ONE};

    #[test]
    fn residual_memory_instruction_is_not_encodable() {
        let inst = Instruction::memory(
            MemoryOp::Read,
            Value::int(0),
            Value::int(0),
            INT_ONE,
            false,
        );
        assert!(check_instruction_is_encodable(&inst).is_err());
    }

    #[test]
    fn header_round_trips_magic() {
        let header = ModuleHeader::default();
        let words = header.to_words();
        assert_eq!(words[0] as u32, MODULE_MAGIC);
        assert_eq!(words[1], 0);
    }
}
