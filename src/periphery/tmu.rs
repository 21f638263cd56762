//! Texture memory units: the read-only path from the QPUs to RAM.
//!
//! Each QPU pair shares two TMUs. A load writes the per-element address to
//! the unit's S coordinate register, issues the load signal and reads the
//! response from r4. Locations served by a TMU must never be written by any
//! QPU in the same kernel execution, the TMU cache is not coherent.

use crate::ir::instruction::{DelayKind, Instruction, Signal};
use crate::ir::method::Method;
use crate::ir::types::TYPE_INT32;
use crate::ir::value::{Register, Value, REG_SFU_OUT, REG_TMU0_ADDRESS, REG_TMU1_ADDRESS};
use crate::ir::walker::InstructionWalker;

/// One of the two texture memory units.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Tmu {
    Tmu0,
    Tmu1,
}

impl Tmu {
    pub fn address_register(self) -> Register {
        match self {
            Tmu::Tmu0 => REG_TMU0_ADDRESS,
            Tmu::Tmu1 => REG_TMU1_ADDRESS,
        }
    }

    pub fn load_signal(self) -> Signal {
        match self {
            Tmu::Tmu0 => Signal::LoadTmu0,
            Tmu::Tmu1 => Signal::LoadTmu1,
        }
    }
}

/// Select the TMU for a new source: the side already hosting more sources
/// keeps them, the new source goes to the other side to minimize partition
/// imbalance; ties go to TMU1 since TMU0 statistically carries more load.
pub fn select_tmu(num_on_tmu0: u32, num_on_tmu1: u32) -> Tmu {
    if num_on_tmu1 > num_on_tmu0 {
        Tmu::Tmu0
    } else {
        Tmu::Tmu1
    }
}

/// Load one vector from RAM at the (per-element) `address` into `dest`.
pub fn insert_read_vector_from_tmu(
    method: &mut Method,
    mut it: InstructionWalker,
    dest: &Value,
    address: &Value,
    tmu: Tmu,
) -> InstructionWalker {
    it = method.emplace(
        it,
        Instruction::mov(
            Value::register(tmu.address_register(), TYPE_INT32),
            address.clone(),
        ),
    );
    it = it.next_in_block(method);
    it = method.emplace(
        it,
        Instruction::nop(DelayKind::WaitTmu).with_signal(tmu.load_signal()),
    );
    it = it.next_in_block(method);
    it = method.emplace(
        it,
        Instruction::mov(
            dest.clone(),
            Value::register(REG_SFU_OUT, dest.data_type.clone()),
        ),
    );
    it.next_in_block(method)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_sources_balance_the_partitions() {
        // tie goes to TMU1, then each new source takes the emptier side
        assert_eq!(select_tmu(0, 0), Tmu::Tmu1);
        assert_eq!(select_tmu(0, 1), Tmu::Tmu0);
        assert_eq!(select_tmu(1, 1), Tmu::Tmu1);
        assert_eq!(select_tmu(3, 1), Tmu::Tmu1);
    }
}
