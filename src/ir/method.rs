//! Kernel functions and modules.
//!
//! A [`Method`] is the arena for everything a kernel compilation touches: it
//! owns the basic blocks, the local table and the VPM allocator. Passes take
//! transient borrows and address locals and blocks through keys, so the
//! cyclic structures (CFG back-edges, phi dependencies) never need owning
//! references.

use std::fmt;
use std::sync::Arc;

use crate::periphery::vpm::VpmArena;

use super::block::{BasicBlock, DEFAULT_BLOCK};
use super::instruction::{InstId, Instruction, InstructionKind, OpCode};
use super::local::{
    Global, Local, LocalId, LocalKind, Parameter, ParameterDecorations, StackAllocation,
};
use super::types::{DataType, TYPE_LABEL};
use super::value::{LocalRef, Literal, Value, ValueContent};
use super::walker::InstructionWalker;

// Names of the locals holding the implicit kernel arguments, in the order
// the host supplies them on the UNIFORM stream.
pub const WORK_DIMENSIONS: &str = "%work_dim";
pub const LOCAL_SIZES: &str = "%local_sizes";
pub const LOCAL_IDS: &str = "%local_ids";
pub const NUM_GROUPS_X: &str = "%num_groups_x";
pub const NUM_GROUPS_Y: &str = "%num_groups_y";
pub const NUM_GROUPS_Z: &str = "%num_groups_z";
pub const GROUP_ID_X: &str = "%group_id_x";
pub const GROUP_ID_Y: &str = "%group_id_y";
pub const GROUP_ID_Z: &str = "%group_id_z";
pub const GLOBAL_OFFSET_X: &str = "%global_offset_x";
pub const GLOBAL_OFFSET_Y: &str = "%global_offset_y";
pub const GLOBAL_OFFSET_Z: &str = "%global_offset_z";
pub const GLOBAL_DATA_ADDRESS: &str = "%global_data_address";

/// Bitmap of the implicit UNIFORM values a kernel actually reads, embedded in
/// the output module so the runtime only supplies what is needed.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct UniformsUsed(u16);

impl UniformsUsed {
    const NAMES: [&'static str; 13] = [
        WORK_DIMENSIONS,
        LOCAL_SIZES,
        LOCAL_IDS,
        NUM_GROUPS_X,
        NUM_GROUPS_Y,
        NUM_GROUPS_Z,
        GROUP_ID_X,
        GROUP_ID_Y,
        GROUP_ID_Z,
        GLOBAL_OFFSET_X,
        GLOBAL_OFFSET_Y,
        GLOBAL_OFFSET_Z,
        GLOBAL_DATA_ADDRESS,
    ];

    pub fn bit_for(name: &str) -> Option<u8> {
        Self::NAMES
            .iter()
            .position(|n| *n == name)
            .map(|pos| pos as u8)
    }

    pub fn set_used(&mut self, bit: u8, used: bool) {
        if used {
            self.0 |= 1 << bit;
        } else {
            self.0 &= !(1 << bit);
        }
    }

    pub fn is_used(&self, bit: u8) -> bool {
        self.0 & (1 << bit) != 0
    }

    pub fn value(&self) -> u16 {
        self.0
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Number of implicit UNIFORM words the runtime must supply.
    pub fn count_uniforms(&self) -> u32 {
        self.0.count_ones()
    }
}

/// Per-kernel metadata carried through compilation into the output header.
#[derive(Clone, Default, Debug)]
pub struct KernelMetadata {
    pub uniforms_used: UniformsUsed,
    /// Work-group size required by the kernel source, if declared.
    pub work_group_size: Option<[u32; 3]>,
}

/// A single kernel function.
pub struct Method {
    pub name: String,
    pub parameters: Vec<LocalId>,
    pub metadata: KernelMetadata,
    pub vpm: VpmArena,
    locals: Vec<Local>,
    blocks: Vec<BasicBlock>,
    next_instruction: u32,
    next_temporary: u32,
    /// Bumped on every block-level structural change, used to invalidate
    /// cached control-flow graphs.
    structure_version: u64,
}

impl Method {
    pub fn new(name: impl Into<String>) -> Self {
        Method {
            name: name.into(),
            parameters: Vec::new(),
            metadata: KernelMetadata::default(),
            vpm: VpmArena::new(),
            locals: Vec::new(),
            blocks: Vec::new(),
            next_instruction: 0,
            next_temporary: 0,
            structure_version: 0,
        }
    }

    // ---- locals -------------------------------------------------------

    pub fn locals(&self) -> &[Local] {
        &self.locals
    }

    pub fn local(&self, id: LocalId) -> &Local {
        &self.locals[id.0 as usize]
    }

    pub fn local_mut(&mut self, id: LocalId) -> &mut Local {
        &mut self.locals[id.0 as usize]
    }

    fn push_local(&mut self, name: Arc<str>, data_type: DataType, kind: LocalKind) -> LocalRef {
        let id = LocalId(self.locals.len() as u32);
        self.locals.push(Local::new(id, name, data_type, kind));
        self.locals[id.0 as usize].create_reference()
    }

    pub fn add_local(&mut self, name: impl Into<Arc<str>>, data_type: DataType) -> LocalRef {
        self.push_local(name.into(), data_type, LocalKind::Plain)
    }

    pub fn add_parameter(
        &mut self,
        name: impl Into<Arc<str>>,
        data_type: DataType,
        decorations: ParameterDecorations,
    ) -> LocalRef {
        let local = self.push_local(
            name.into(),
            data_type,
            LocalKind::Parameter(Parameter { decorations }),
        );
        self.parameters.push(local.id);
        local
    }

    pub fn add_stack_allocation(
        &mut self,
        name: impl Into<Arc<str>>,
        data_type: DataType,
        size: u32,
        alignment: u32,
    ) -> LocalRef {
        self.push_local(
            name.into(),
            data_type,
            LocalKind::StackAllocation(StackAllocation { size, alignment }),
        )
    }

    pub fn add_global(
        &mut self,
        name: impl Into<Arc<str>>,
        data_type: DataType,
        initial_value: Option<Value>,
        is_constant: bool,
    ) -> LocalRef {
        self.push_local(
            name.into(),
            data_type,
            LocalKind::Global(Global {
                initial_value,
                is_constant,
            }),
        )
    }

    /// A fresh temporary local with a unique name.
    pub fn add_new_local(&mut self, data_type: DataType, prefix: &str) -> Value {
        let name = format!("{}.{}", prefix, self.next_temporary);
        self.next_temporary += 1;
        let local = self.add_local(name, data_type.clone());
        Value::local(local, data_type)
    }

    pub fn find_local(&self, name: &str) -> Option<&Local> {
        self.locals.iter().find(|local| &*local.name == name)
    }

    pub fn find_or_create_local(&mut self, data_type: DataType, name: &str) -> LocalRef {
        if let Some(local) = self.find_local(name) {
            return local.create_reference();
        }
        self.add_local(name, data_type)
    }

    // ---- blocks -------------------------------------------------------

    pub fn blocks(&self) -> &[BasicBlock] {
        &self.blocks
    }

    pub fn block(&self, index: usize) -> &BasicBlock {
        &self.blocks[index]
    }

    pub fn structure_version(&self) -> u64 {
        self.structure_version
    }

    pub fn block_index_by_label(&self, label: LocalId) -> Option<usize> {
        self.blocks.iter().position(|b| b.label().id == label)
    }

    /// Append a new block with the given label name.
    pub fn create_block(&mut self, label_name: &str) -> usize {
        self.insert_block(self.blocks.len(), label_name)
    }

    /// Insert a new block before the given layout position.
    pub fn insert_block(&mut self, at: usize, label_name: &str) -> usize {
        let label = self.find_or_create_local(TYPE_LABEL, label_name);
        let mut inst = Instruction::label(label);
        inst.id = self.allocate_instruction_id();
        self.register_users(&inst);
        self.blocks.insert(at, BasicBlock::new(inst));
        self.structure_version += 1;
        at
    }

    /// Remove a block. Refuses when the block still contains instructions or
    /// its label is still referenced by other instructions.
    pub fn remove_block(&mut self, index: usize) -> bool {
        let label_id = self.blocks[index].label().id;
        if !self.blocks[index].is_empty() {
            return false;
        }
        let externally_used = self
            .local(label_id)
            .users
            .iter()
            .any(|(inst, use_)| use_.reads_local() && *inst != self.blocks[index].instructions[0].id);
        if externally_used {
            return false;
        }
        let block = self.blocks.remove(index);
        for inst in &block.instructions {
            self.unregister_users(inst);
        }
        self.structure_version += 1;
        true
    }

    /// Move the block at `from` so it ends up at layout position `to`.
    pub fn move_block(&mut self, from: usize, to: usize) {
        let block = self.blocks.remove(from);
        let to = if to > from { to - 1 } else { to };
        self.blocks.insert(to, block);
        self.structure_version += 1;
    }

    /// Move all non-label instructions of `source` to the end of `dest`,
    /// preserving instruction identities and user links.
    pub fn splice_block_instructions(&mut self, source: usize, dest: usize) {
        let moved: Vec<Instruction> = self.blocks[source].instructions.drain(1..).collect();
        self.blocks[dest].instructions.extend(moved);
    }

    /// Swap the label instructions of two blocks (keeping their bodies).
    pub fn swap_labels(&mut self, first: usize, second: usize) {
        let a = self.blocks[first].instructions[0].clone();
        let b = self.blocks[second].instructions[0].clone();
        self.blocks[first].instructions[0] = b;
        self.blocks[second].instructions[0] = a;
    }

    // ---- instruction access & edits ----------------------------------

    pub fn walk_all(&self) -> InstructionWalker {
        InstructionWalker::new(0, 0)
    }

    pub fn walk_block(&self, block: usize) -> InstructionWalker {
        InstructionWalker::new(block, 0)
    }

    /// Walker at the end-of-block sentinel of the given block.
    pub fn walk_block_end(&self, block: usize) -> InstructionWalker {
        InstructionWalker::new(block, self.blocks[block].size())
    }

    pub fn instruction(&self, walker: InstructionWalker) -> Option<&Instruction> {
        self.blocks
            .get(walker.block)
            .and_then(|b| b.instructions.get(walker.index))
    }

    /// Mutable access for in-place updates. Callers must not change which
    /// locals the instruction mentions; use [`Method::replace`] for that.
    pub fn instruction_mut(&mut self, walker: InstructionWalker) -> Option<&mut Instruction> {
        self.blocks
            .get_mut(walker.block)
            .and_then(|b| b.instructions.get_mut(walker.index))
    }

    fn allocate_instruction_id(&mut self) -> InstId {
        let id = InstId(self.next_instruction);
        self.next_instruction += 1;
        id
    }

    fn register_users(&mut self, inst: &Instruction) {
        for (local, reads, writes) in inst.mentioned_locals() {
            self.locals[local.0 as usize].add_user(inst.id, reads, writes);
        }
    }

    fn unregister_users(&mut self, inst: &Instruction) {
        for (local, _, _) in inst.mentioned_locals() {
            self.locals[local.0 as usize].remove_user(inst.id);
        }
    }

    /// Insert the instruction before the walker position; the returned walker
    /// points at the new instruction.
    pub fn emplace(&mut self, walker: InstructionWalker, mut inst: Instruction) -> InstructionWalker {
        inst.id = self.allocate_instruction_id();
        self.register_users(&inst);
        let block = &mut self.blocks[walker.block];
        let index = walker.index.min(block.instructions.len());
        block.instructions.insert(index, inst);
        InstructionWalker::new(walker.block, index)
    }

    /// Remove the instruction at the walker position; the returned walker
    /// addresses the next instruction (same position).
    pub fn erase(&mut self, walker: InstructionWalker) -> InstructionWalker {
        let inst = self.blocks[walker.block].instructions.remove(walker.index);
        self.unregister_users(&inst);
        walker
    }

    /// Replace the instruction at the walker position, keeping its id.
    pub fn replace(&mut self, walker: InstructionWalker, mut inst: Instruction) {
        let old = self.blocks[walker.block].instructions[walker.index].clone();
        self.unregister_users(&old);
        inst.id = old.id;
        self.register_users(&inst);
        self.blocks[walker.block].instructions[walker.index] = inst;
    }

    /// Append to the given block, before nothing (at its very end).
    pub fn append_to_block(&mut self, block: usize, inst: Instruction) -> InstructionWalker {
        let end = self.walk_block_end(block);
        self.emplace(end, inst)
    }

    /// Append to the last block of the method.
    pub fn append_to_end(&mut self, inst: Instruction) -> InstructionWalker {
        let last = self.blocks.len() - 1;
        self.append_to_block(last, inst)
    }

    /// Locate an instruction by its stable id.
    pub fn find_walker(&self, id: InstId) -> Option<InstructionWalker> {
        for (block_idx, block) in self.blocks.iter().enumerate() {
            for (index, inst) in block.instructions.iter().enumerate() {
                if inst.id == id {
                    return Some(InstructionWalker::new(block_idx, index));
                }
            }
        }
        None
    }

    /// The single instruction writing the local, if exactly one exists.
    pub fn single_writer(&self, local: LocalId) -> Option<&Instruction> {
        let id = self.local(local).single_writer()?;
        let walker = self.find_walker(id)?;
        self.instruction(walker)
    }

    /// Resolve a value to a literal by folding through up to `depth` levels
    /// of single-writer moves, loads and literal operations.
    pub fn precalculate(&self, value: &Value, depth: u32) -> Option<Literal> {
        if let Some(lit) = value.literal_value() {
            return Some(lit);
        }
        if depth == 0 {
            return None;
        }
        let local = value.local_id()?;
        let writer = self.single_writer(local)?;
        self.precalculate_instruction(writer, depth - 1)
    }

    /// Resolve the result of an instruction to a literal, if statically known.
    pub fn precalculate_instruction(&self, inst: &Instruction, depth: u32) -> Option<Literal> {
        if inst.has_conditional_execution() || inst.has_unpack_mode() || inst.has_pack_mode() {
            return None;
        }
        match &inst.kind {
            InstructionKind::Move { source } => self.precalculate(source, depth),
            InstructionKind::LoadImmediate { immediate } => Some(*immediate),
            InstructionKind::Op {
                code,
                first,
                second,
            } => {
                let a = self.precalculate(first, depth)?;
                let b = match second {
                    Some(second) => Some(self.precalculate(second, depth)?),
                    None => None,
                };
                code.precalculate(a, b)
            }
            _ => None,
        }
    }

    /// Whether the local is only accessed within a small instruction range
    /// around the walker (used to detect block-local temporaries).
    pub fn is_locally_limited(
        &self,
        walker: InstructionWalker,
        local: LocalId,
        threshold: usize,
    ) -> bool {
        let block = &self.blocks[walker.block];
        let users = &self.local(local).users;
        let mut remaining = users.len();
        let start = walker.index.saturating_sub(threshold);
        let end = (walker.index + threshold).min(block.instructions.len());
        for inst in &block.instructions[start..end] {
            if users.contains_key(&inst.id) {
                remaining -= 1;
            }
        }
        remaining == 0
    }

    /// Render the whole method as text, one instruction per line.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for block in &self.blocks {
            for inst in &block.instructions {
                out.push_str(&inst.to_string());
                out.push('\n');
            }
        }
        out
    }

    /// Count all instructions over all blocks.
    pub fn instruction_count(&self) -> usize {
        self.blocks.iter().map(BasicBlock::size).sum()
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Method({}, {} blocks, {} locals)",
            self.name,
            self.blocks.len(),
            self.locals.len()
        )
    }
}

/// A compilation unit of kernels.
#[derive(Default)]
pub struct Module {
    pub methods: Vec<Method>,
}

impl Module {
    pub fn new() -> Self {
        Module::default()
    }
}

/// Create a method with the default entry block already in place.
pub fn method_with_entry_block(name: &str) -> Method {
    let mut method = Method::new(name);
    method.create_block(DEFAULT_BLOCK);
    method
}

/// Whether the local names an actual storage location.
fn is_memory_location(local: &Local) -> bool {
    matches!(
        local.kind,
        LocalKind::Parameter(_) | LocalKind::StackAllocation(_) | LocalKind::Global(_)
    )
}

fn resolve_base(method: &Method, id: LocalId, depth: u32) -> LocalId {
    if is_memory_location(method.local(id)) {
        return id;
    }
    if let Some((base, _)) = method.local(id).reference {
        if base != id && depth > 0 {
            return resolve_base(method, base, depth - 1);
        }
    }
    if depth == 0 {
        return id;
    }
    // derive the base from the address arithmetic producing this local
    if let Some(writer) = method.single_writer(id) {
        match &writer.kind {
            InstructionKind::Move { source } => {
                if let Some(inner) = source.local_id() {
                    return resolve_base(method, inner, depth - 1);
                }
            }
            InstructionKind::Op {
                code: OpCode::Add | OpCode::Sub,
                first,
                second,
            } => {
                for arg in [Some(first), second.as_ref()].into_iter().flatten() {
                    if let Some(inner) = arg.local_id() {
                        let resolved = resolve_base(method, inner, depth - 1);
                        if is_memory_location(method.local(resolved)) {
                            return resolved;
                        }
                    }
                }
            }
            _ => {}
        }
    }
    id
}

/// Resolve a value back to the memory location its address is derived from,
/// following reference links and the address arithmetic writer chain.
pub fn base_local_of(method: &Method, value: &Value) -> Option<LocalId> {
    match &value.content {
        ValueContent::Local(local) => Some(resolve_base(method, local.id, 16)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::instruction::OpCode;
    use crate::ir::types::TYPE_INT32;
    use crate::ir::value::{Value, INT_ONE};

    #[test]
    fn users_track_mentions() {
        let mut method = method_with_entry_block("test");
        let a = method.add_local("%a", TYPE_INT32);
        let b = method.add_local("%b", TYPE_INT32);
        let out = method.add_local("%out", TYPE_INT32);
        method.append_to_end(Instruction::op(
            OpCode::Add,
            Value::local(out.clone(), TYPE_INT32),
            Value::local(a.clone(), TYPE_INT32),
            Value::local(b.clone(), TYPE_INT32),
        ));
        assert_eq!(method.local(a.id).users.len(), 1);
        assert!(method
            .local(a.id)
            .users
            .values()
            .all(|u| u.reads_local() && !u.writes_local()));
        assert!(method
            .local(out.id)
            .users
            .values()
            .all(|u| u.writes_local()));
    }

    #[test]
    fn erase_updates_users() {
        let mut method = method_with_entry_block("test");
        let a = method.add_local("%a", TYPE_INT32);
        let w = method.append_to_end(Instruction::mov(
            Value::local(a.clone(), TYPE_INT32),
            INT_ONE,
        ));
        assert_eq!(method.local(a.id).users.len(), 1);
        method.erase(w);
        assert!(method.local(a.id).users.is_empty());
    }

    #[test]
    fn precalculate_folds_through_writers() {
        let mut method = method_with_entry_block("test");
        let a = method.add_new_local(TYPE_INT32, "%a");
        let b = method.add_new_local(TYPE_INT32, "%b");
        method.append_to_end(Instruction::load_immediate(
            a.clone(),
            Literal::from_signed(40),
        ));
        method.append_to_end(Instruction::op(
            OpCode::Add,
            b.clone(),
            a.clone(),
            Value::int(2),
        ));
        assert_eq!(
            method.precalculate(&b, 4).map(|l| l.signed_int()),
            Some(42)
        );
    }

    #[test]
    fn remove_block_refuses_referenced_label() {
        let mut method = method_with_entry_block("test");
        let second = method.create_block("%target");
        let target = method.blocks()[second].label().clone();
        method.append_to_block(
            0,
            Instruction::branch(
                target,
                crate::ir::instruction::BranchCondition::Always,
                crate::ir::value::BOOL_TRUE,
            ),
        );
        assert!(!method.remove_block(second));
    }
}
