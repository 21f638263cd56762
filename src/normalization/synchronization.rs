//! Lowering of memory barriers onto the hardware semaphores.
//!
//! Barriers that only order the work-item's own accesses disappear, since a
//! QPU executes its memory operations in order. Wider scopes become a
//! semaphore up/down pair on a scope-specific semaphore, which serializes
//! the participating QPUs at the barrier point.

use log::debug;

use crate::error::CompileResult;
use crate::ir::instruction::{Instruction, InstructionKind, MemoryScope, MemorySemantics};
use crate::ir::method::Method;

/// Semaphore used for work-group wide synchronization.
pub const SEMAPHORE_WORK_GROUP: u8 = 0;
/// Semaphore used for device wide synchronization.
pub const SEMAPHORE_DEVICE: u8 = 1;

fn touches_shared_memory(semantics: MemorySemantics) -> bool {
    semantics.intersects(
        MemorySemantics::WORK_GROUP_MEMORY
            | MemorySemantics::CROSS_WORK_GROUP_MEMORY
            | MemorySemantics::ATOMIC_COUNTER_MEMORY
            | MemorySemantics::IMAGE_MEMORY,
    )
}

/// Lower all memory barriers; none remain afterwards.
pub fn lower_memory_barriers(method: &mut Method) -> CompileResult<()> {
    crate::profile_scope!("LowerMemoryBarriers");
    let mut it = method.walk_all();
    while !it.is_end_of_method(method) {
        let (scope, semantics) = match method.instruction(it).map(|inst| &inst.kind) {
            Some(InstructionKind::MemoryBarrier { scope, semantics }) => (*scope, *semantics),
            _ => {
                it = it.next_in_method(method);
                continue;
            }
        };
        match scope {
            MemoryScope::Invocation | MemoryScope::SubGroup => {
                // a QPU observes its own accesses in order
                debug!("Removing memory barrier of invocation-local scope");
                it = method.erase(it);
            }
            _ if !touches_shared_memory(semantics) => {
                debug!("Removing memory barrier without shared-memory semantics");
                it = method.erase(it);
            }
            MemoryScope::WorkGroup => {
                it = replace_with_semaphore_pair(method, it, SEMAPHORE_WORK_GROUP);
            }
            MemoryScope::Device | MemoryScope::CrossDevice => {
                it = replace_with_semaphore_pair(method, it, SEMAPHORE_DEVICE);
            }
            _ => unreachable!("scope handled above"),
        }
    }
    Ok(())
}

fn replace_with_semaphore_pair(
    method: &mut Method,
    it: crate::ir::walker::InstructionWalker,
    semaphore: u8,
) -> crate::ir::walker::InstructionWalker {
    debug!("Lowering memory barrier to semaphore pair {semaphore}");
    method.replace(it, Instruction::semaphore(semaphore, true));
    let it = it.next_in_block(method);
    let it = method.emplace(it, Instruction::semaphore(semaphore, false));
    it.next_in_block(method)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::method::method_with_entry_block;

    #[test]
    fn invocation_barriers_disappear() {
        let mut method = method_with_entry_block("sync");
        method.append_to_end(Instruction::memory_barrier(
            MemoryScope::Invocation,
            MemorySemantics::ACQUIRE_RELEASE | MemorySemantics::WORK_GROUP_MEMORY,
        ));
        lower_memory_barriers(&mut method).unwrap();
        assert!(!method.to_text().contains("mem-fence"));
        assert!(!method.to_text().contains("semaphore"));
    }

    #[test]
    fn work_group_barriers_become_semaphore_pairs() {
        let mut method = method_with_entry_block("sync");
        method.append_to_end(Instruction::memory_barrier(
            MemoryScope::WorkGroup,
            MemorySemantics::ACQUIRE_RELEASE | MemorySemantics::WORK_GROUP_MEMORY,
        ));
        lower_memory_barriers(&mut method).unwrap();
        let text = method.to_text();
        assert!(!text.contains("mem-fence"), "{text}");
        assert!(text.contains("semaphore 0 increase"), "{text}");
        assert!(text.contains("semaphore 0 decrease"), "{text}");
    }
}
