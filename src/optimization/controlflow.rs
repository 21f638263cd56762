//! Control-flow shaping: branch extension, block merging and reordering,
//! if/else collapsing, loop-invariant constant hoisting and the kernel
//! start/stop segment.

use log::{debug, warn};

use crate::analysis::cfg::{ControlFlowGraph, ControlFlowLoop, LoopInclusionTree};
use crate::error::{CompileError, CompileResult};
use crate::ir::block::{DEFAULT_BLOCK, LAST_BLOCK};
use crate::ir::helper::{insert_sign_extension, insert_zero_extension};
use crate::ir::instruction::{
    BranchCondition, ConditionCode, Decorations, DelayKind, Instruction, InstructionKind, OpCode,
    SetFlag, Signal,
};
use crate::ir::local::{LocalId, ParameterDecorations};
use crate::ir::method::{self, Method, UniformsUsed};
use crate::ir::types::{TYPE_INT32, TYPE_INT8};
use crate::ir::value::{
    element_number_value, nop_value, qpu_number_value, uniform_value, Value, BOOL_TRUE,
    REG_HOST_INTERRUPT, REG_TMU1_ADDRESS, REG_TMU_NOSWAP,
};
use crate::ir::walker::InstructionWalker;

/// Materialize branch conditions into flags and insert the delay slots.
///
/// A branch depends on a scalar condition; ORing the condition with the
/// element numbers leaves only lane 0 able to clear the zero flag, unless
/// the branch tests all lanes. Every branch is followed by three delay-slot
/// nops.
pub fn extend_branches(method: &mut Method) -> CompileResult<()> {
    crate::profile_scope!("ExtendBranches");
    // flags only need re-setting when the condition value changed
    let mut last_set_flags: Option<(Value, bool)> = None;
    let mut it = method.walk_all();
    while !it.is_end_of_method(method) {
        let inst = match method.instruction(it) {
            Some(inst) => inst,
            None => {
                it = it.next_in_method(method);
                continue;
            }
        };
        match &inst.kind {
            InstructionKind::Branch { condition, .. } => {
                let condition = condition.clone();
                let conditional = inst.has_conditional_execution();
                let on_all_elements = inst.has_decoration(Decorations::BRANCH_ON_ALL_ELEMENTS);
                debug!("Extending branch: {inst}");
                if conditional || !condition.has_literal(crate::ir::value::Literal(1)) {
                    let current = (condition.clone(), on_all_elements);
                    if last_set_flags.as_ref() != Some(&current) {
                        let flag_setter = if on_all_elements {
                            Instruction::op(
                                OpCode::Or,
                                nop_value(),
                                condition.clone(),
                                condition.clone(),
                            )
                            .with_flags(SetFlag::SetFlags)
                        } else {
                            Instruction::op(
                                OpCode::Or,
                                nop_value(),
                                element_number_value(),
                                condition.clone(),
                            )
                            .with_flags(SetFlag::SetFlags)
                        };
                        it = method.emplace(it, flag_setter);
                        it = it.next_in_block(method);
                    }
                    last_set_flags = Some(current);
                }
                // three branch delay slots
                it = it.next_in_block(method);
                for _ in 0..3 {
                    it = method.emplace(it, Instruction::nop(DelayKind::BranchDelay));
                    it = it.next_in_block(method);
                }
                continue;
            }
            _ => {
                if inst.does_set_flag() {
                    // someone else set flags, the branch condition is stale
                    last_set_flags = None;
                }
            }
        }
        it = it.next_in_method(method);
    }
    Ok(())
}

fn find_source_block(label: LocalId, block_map: &std::collections::HashMap<LocalId, LocalId>) -> LocalId {
    match block_map.get(&label) {
        Some(source) => find_source_block(*source, block_map),
        None => label,
    }
}

/// Concatenate blocks connected by a single-successor/single-predecessor
/// edge. The reserved last block stays separate for work-group unrolling.
pub fn merge_adjacent_blocks(method: &mut Method) -> CompileResult<bool> {
    crate::profile_scope!("MergeAdjacentBlocks");
    let graph = ControlFlowGraph::create(method);
    let mut blocks_to_merge: Vec<(LocalId, LocalId)> = Vec::new();
    for index in 1..method.blocks().len() {
        let prev = index - 1;
        if graph.single_predecessor(index) == Some(prev)
            && graph.single_successor(prev) == Some(index)
            && &*method.block(index).label().name != LAST_BLOCK
        {
            debug!(
                "Found basic block with single direct successor: {} and {}",
                method.block(prev).label().name,
                method.block(index).label().name
            );
            blocks_to_merge.push((
                method.block(prev).label().id,
                method.block(index).label().id,
            ));
        }
    }

    // chained merges resolve through the source-block map
    let mut block_map: std::collections::HashMap<LocalId, LocalId> =
        std::collections::HashMap::new();
    let num_merged = blocks_to_merge.len();
    for (dest_label, source_label) in blocks_to_merge {
        let source_label = find_source_block(source_label, &block_map);
        let dest_label = find_source_block(dest_label, &block_map);
        let source = method
            .block_index_by_label(source_label)
            .ok_or_else(|| CompileError::internal("merge source block disappeared"))?;
        let dest = method
            .block_index_by_label(dest_label)
            .ok_or_else(|| CompileError::internal("merge destination block disappeared"))?;
        // an explicit branch into the merged block becomes a fall-through
        if let Some(position) = method
            .block(dest)
            .instructions()
            .iter()
            .position(|inst| match &inst.kind {
                InstructionKind::Branch { target, .. } => target.id == source_label,
                _ => false,
            })
        {
            method.erase(InstructionWalker::new(dest, position));
        }
        method.splice_block_instructions(source, dest);
        if method.remove_block(source) {
            debug!("Merged block into {}", method.block(dest).label().name);
        } else {
            warn!("Failed to remove an emptied basic block");
        }
        block_map.insert(source_label, dest_label);
    }
    debug!("Merged {num_merged} pairs of blocks");
    Ok(num_merged > 0)
}

/// Move blocks whose single predecessor is elsewhere in the layout directly
/// behind that predecessor, if the preceding block does not fall through.
pub fn reorder_blocks(method: &mut Method) -> CompileResult<bool> {
    crate::profile_scope!("ReorderBlocks");
    let mut changed = false;
    let mut attempts = method.blocks().len() + 1;
    loop {
        attempts = attempts.saturating_sub(1);
        if attempts == 0 {
            break;
        }
        let cfg = ControlFlowGraph::create(method);
        let mut moved = false;
        for index in 1..method.blocks().len() {
            if &*method.block(index).label().name == LAST_BLOCK {
                continue;
            }
            let predecessor = match cfg.single_predecessor(index) {
                Some(pred) => pred,
                None => continue,
            };
            if predecessor != index - 1 && !method.block(index - 1).falls_through() {
                debug!(
                    "Reordering block with single predecessor not being the previous block: {}",
                    method.block(index).label().name
                );
                method.move_block(index, predecessor + 1);
                moved = true;
                changed = true;
                break;
            }
        }
        if !moved {
            break;
        }
    }
    Ok(changed)
}

/// A diamond: one predecessor branching into blocks that all converge on one
/// successor.
struct IfElseBlock {
    predecessor: usize,
    conditional_blocks: Vec<usize>,
    successor: usize,
}

fn find_if_else_block(method: &Method, cfg: &ControlFlowGraph) -> Option<IfElseBlock> {
    for node in 0..method.blocks().len() {
        let mut conditional_blocks = Vec::new();
        let mut common_successor: Option<usize> = None;
        let mut valid = cfg.num_successors(node) > 1;
        for (succ, _) in cfg.successors(node) {
            let second = match cfg.single_successor(succ) {
                Some(second) => second,
                None => {
                    valid = false;
                    break;
                }
            };
            if cfg.single_predecessor(succ) != Some(node)
                || common_successor.is_some_and(|existing| existing != second)
            {
                valid = false;
                break;
            }
            common_successor = Some(second);
            conditional_blocks.push(succ);
        }
        if valid && conditional_blocks.len() > 1 {
            if let Some(successor) = common_successor {
                return Some(IfElseBlock {
                    predecessor: node,
                    conditional_blocks,
                    successor,
                });
            }
        }
    }
    None
}

/// Collapse if/else diamonds into conditional moves in the predecessor.
pub fn simplify_conditional_blocks(method: &mut Method) -> CompileResult<bool> {
    crate::profile_scope!("SimplifyConditionalBlocks");
    let mut changed = false;
    loop {
        let cfg = ControlFlowGraph::create(method);
        let candidate = match find_if_else_block(method, &cfg) {
            Some(candidate) => candidate,
            None => break,
        };
        debug!(
            "Found conditional block candidate: {}",
            method.block(candidate.predecessor).label().name
        );

        // conditional bodies must be pure
        let mut has_side_effects = false;
        let mut escaping_locals: Vec<LocalId> = Vec::new();
        for &block in &candidate.conditional_blocks {
            for (index, inst) in method.block(block).instructions().iter().enumerate() {
                if index == 0 || matches!(inst.kind, InstructionKind::Branch { .. }) {
                    continue;
                }
                if inst.has_side_effects() || inst.has_conditional_execution() {
                    debug!("Side effect in conditional block: {inst}");
                    has_side_effects = true;
                    break;
                }
                if let Some(out) = inst.check_output_local() {
                    let walker = InstructionWalker::new(block, index);
                    if !method.is_locally_limited(walker, out.id, 8)
                        && !escaping_locals.contains(&out.id)
                    {
                        escaping_locals.push(out.id);
                    }
                }
            }
            if has_side_effects {
                break;
            }
        }
        if has_side_effects {
            debug!("Aborting, conditional block has side effects");
            break;
        }

        // the default (unconditional) case must end up before all the
        // conditional content, so its insertion position is fixed up front:
        // right before the first branch of the predecessor
        let insert_position = method
            .block(candidate.predecessor)
            .instructions()
            .iter()
            .position(|inst| matches!(inst.kind, InstructionKind::Branch { .. }))
            .unwrap_or(method.block(candidate.predecessor).size());
        // work with labels from here on, block indices shift during removal
        let predecessor_label = method.block(candidate.predecessor).label().id;
        let conditional_labels: Vec<LocalId> = candidate
            .conditional_blocks
            .iter()
            .map(|&block| method.block(block).label().id)
            .collect();
        let successor_label = method.block(candidate.successor).label().clone();

        for target_label in conditional_labels {
            let predecessor = method
                .block_index_by_label(predecessor_label)
                .ok_or_else(|| CompileError::internal("predecessor block disappeared"))?;
            let block = method
                .block_index_by_label(target_label)
                .ok_or_else(|| CompileError::internal("conditional block disappeared"))?;
            // the branch in the predecessor entering this block
            let branch_position = method
                .block(predecessor)
                .instructions()
                .iter()
                .position(|inst| match &inst.kind {
                    InstructionKind::Branch { target, .. } => target.id == target_label,
                    _ => false,
                });
            let (condition_value, condition_code) = match branch_position {
                Some(position) => {
                    let inst = &method.block(predecessor).instructions()[position];
                    if inst.has_conditional_execution() {
                        match &inst.kind {
                            InstructionKind::Branch { condition, .. } => {
                                (Some(condition.clone()), inst.condition)
                            }
                            _ => unreachable!(),
                        }
                    } else {
                        (None, ConditionCode::Always)
                    }
                }
                None => (None, ConditionCode::Always),
            };

            let mut target = match branch_position {
                Some(position) if condition_value.is_some() => {
                    InstructionWalker::new(predecessor, position)
                }
                Some(position) => {
                    // unconditional branch (the default case): drop it and
                    // insert the body before all branches
                    method.erase(InstructionWalker::new(predecessor, position));
                    InstructionWalker::new(predecessor, insert_position)
                }
                None => InstructionWalker::new(predecessor, insert_position),
            };

            // 1. re-set the flags the branch depended on
            if let Some(cond) = &condition_value {
                target = method.emplace(
                    target,
                    Instruction::mov(nop_value(), cond.clone()).with_flags(SetFlag::SetFlags),
                );
                target = target.next_in_block(method);
            }

            // 2. move the body across, conditionalizing escaping writes
            let body: Vec<Instruction> = method
                .block(block)
                .instructions()
                .iter()
                .skip(1)
                .filter(|inst| !matches!(inst.kind, InstructionKind::Branch { .. }))
                .cloned()
                .collect();
            for mut inst in body {
                if condition_value.is_some() {
                    let escapes = inst
                        .check_output_local()
                        .is_some_and(|out| escaping_locals.contains(&out.id));
                    if escapes {
                        inst.condition = condition_code;
                    }
                }
                target = method.emplace(target, inst);
                target = target.next_in_block(method);
            }

            // 3. drop the conditional branch and the emptied block
            if condition_value.is_some() {
                if let Some(position) = method
                    .block(predecessor)
                    .instructions()
                    .iter()
                    .position(|inst| match &inst.kind {
                        InstructionKind::Branch { target, .. } => target.id == target_label,
                        _ => false,
                    })
                {
                    method.erase(InstructionWalker::new(predecessor, position));
                }
            }
            let block = method
                .block_index_by_label(target_label)
                .ok_or_else(|| CompileError::internal("conditional block disappeared"))?;
            while method.block(block).size() > 1 {
                method.erase(InstructionWalker::new(block, 1));
            }
            if !method.remove_block(block) {
                warn!("Failed to remove collapsed conditional block");
            }
        }

        // jump to the common successor regardless of block order
        let predecessor = method
            .block_index_by_label(predecessor_label)
            .ok_or_else(|| CompileError::internal("predecessor block disappeared"))?;
        method.append_to_block(
            predecessor,
            Instruction::branch(successor_label, BranchCondition::Always, BOOL_TRUE),
        );
        changed = true;
    }
    Ok(changed)
}

/// Hoist unconditional constant loads out of loop bodies into the block
/// preceding the outermost loop.
pub fn remove_constant_load_in_loops(method: &mut Method) -> CompileResult<bool> {
    crate::profile_scope!("RemoveConstantLoadInLoops");
    let cfg = ControlFlowGraph::create(method);
    let loops = cfg.find_loops(method);
    if loops.is_empty() {
        return Ok(false);
    }
    let tree = LoopInclusionTree::create(&loops);
    let mut changed = false;

    let mut processed_roots: Vec<usize> = Vec::new();
    for index in 0..loops.len() {
        let root = tree.find_root(index);
        if processed_roots.contains(&root) {
            continue;
        }
        processed_roots.push(root);
        let root_loop: ControlFlowLoop = loops[root].clone();
        let target = match root_loop.find_predecessor(&cfg) {
            Some(block) => block,
            None => continue,
        };
        for &block in &root_loop.nodes {
            let mut index = 1usize;
            while index < method.block(block).size() {
                let walker = InstructionWalker::new(block, index);
                let inst = method.instruction(walker).unwrap();
                let hoistable = matches!(inst.kind, InstructionKind::LoadImmediate { .. })
                    && inst.check_output_local().is_some()
                    && !inst.has_side_effects()
                    && !inst.has_conditional_execution();
                if hoistable {
                    debug!("Moving constant load out of loop: {inst}");
                    let hoisted = inst.clone();
                    method.erase(walker);
                    // place before the terminating branch of the pre-header
                    let position = method
                        .block(target)
                        .instructions()
                        .iter()
                        .position(|inst| matches!(inst.kind, InstructionKind::Branch { .. }))
                        .unwrap_or(method.block(target).size());
                    method.emplace(InstructionWalker::new(target, position), hoisted);
                    changed = true;
                } else {
                    index += 1;
                }
            }
        }
    }
    Ok(changed)
}

fn is_local_read(method: &Method, name: &str) -> bool {
    method
        .find_local(name)
        .map(|local| local.readers().next().is_some())
        .unwrap_or(false)
}

/// Load a vector parameter lane by lane: one UNIFORM read per element, each
/// gated on the element index.
fn load_vector_parameter(
    method: &mut Method,
    mut it: InstructionWalker,
    parameter: LocalId,
) -> InstructionWalker {
    let param = method.local(parameter);
    let param_type = param.data_type.clone();
    let param_value = param.value();
    let decorations = param
        .as_parameter()
        .map(|p| p.decorations)
        .unwrap_or_default();
    for lane in 0..param_type.vector_width() {
        // the first write must be unconditional so the register allocator
        // sees the definition
        let condition = if lane == 0 {
            ConditionCode::Always
        } else {
            it = method.emplace(
                it,
                Instruction::op(
                    OpCode::Xor,
                    nop_value(),
                    element_number_value(),
                    Value::int(i32::from(lane)),
                )
                .with_flags(SetFlag::SetFlags),
            );
            it = it.next_in_block(method);
            ConditionCode::ZeroSet
        };
        let uniform = uniform_value(param_type.element_type());
        if decorations.contains(ParameterDecorations::SIGN_EXTEND) {
            it = insert_sign_extension(method, it, &uniform, &param_value, condition);
        } else if decorations.contains(ParameterDecorations::ZERO_EXTEND) {
            it = insert_zero_extension(method, it, &uniform, &param_value, condition);
        } else {
            it = method.emplace(
                it,
                Instruction::mov(param_value.clone(), uniform)
                    .with_condition(condition)
                    .with_decorations(Decorations::ELEMENT_INSERTION),
            );
            it = it.next_in_block(method);
        }
    }
    it
}

/// Emit the kernel prologue (implicit and explicit argument loads from the
/// UNIFORM FIFO) and the epilogue (host interrupt and program end).
pub fn add_start_stop_segment(method: &mut Method) -> CompileResult<()> {
    crate::profile_scope!("AddStartStopSegment");
    if method.blocks().is_empty() || &*method.block(0).label().name != DEFAULT_BLOCK {
        method.insert_block(0, DEFAULT_BLOCK);
    }
    let mut it = InstructionWalker::new(0, 1);

    // explicit use of the second TMU disables the automatic swapping
    let tmu1_used = method
        .blocks()
        .iter()
        .flat_map(|block| block.instructions())
        .any(|inst| inst.writes_register(REG_TMU1_ADDRESS));
    if tmu1_used {
        debug!("Using both TMUs explicitly, disabling automatic swapping");
        it = method.emplace(
            it,
            Instruction::mov(
                Value::register(REG_TMU_NOSWAP, crate::ir::types::TYPE_BOOL),
                BOOL_TRUE,
            ),
        );
        it = it.next_in_block(method);
    }

    // the leading UNIFORMs relay work-item and work-group information, in
    // the fixed order the runtime writes them
    method.metadata.uniforms_used.clear();
    let work_info = Decorations::UNSIGNED_RESULT | Decorations::WORK_GROUP_UNIFORM_VALUE;
    let implicit_arguments = [
        (method::WORK_DIMENSIONS, TYPE_INT8, work_info),
        (method::LOCAL_SIZES, TYPE_INT32, work_info),
        (
            method::LOCAL_IDS,
            TYPE_INT32,
            // local ids differ per work-item
            Decorations::UNSIGNED_RESULT,
        ),
        (method::NUM_GROUPS_X, TYPE_INT32, work_info),
        (method::NUM_GROUPS_Y, TYPE_INT32, work_info),
        (method::NUM_GROUPS_Z, TYPE_INT32, work_info),
        (method::GROUP_ID_X, TYPE_INT32, work_info),
        (method::GROUP_ID_Y, TYPE_INT32, work_info),
        (method::GROUP_ID_Z, TYPE_INT32, work_info),
        (method::GLOBAL_OFFSET_X, TYPE_INT32, work_info),
        (method::GLOBAL_OFFSET_Y, TYPE_INT32, work_info),
        (method::GLOBAL_OFFSET_Z, TYPE_INT32, work_info),
        (method::GLOBAL_DATA_ADDRESS, TYPE_INT32, work_info),
    ];
    for (name, data_type, decorations) in implicit_arguments {
        if is_local_read(method, name) {
            let bit = UniformsUsed::bit_for(name).expect("implicit argument has a bit");
            method.metadata.uniforms_used.set_used(bit, true);
            let local = method.find_or_create_local(data_type.clone(), name);
            let local_value = Value::local(local, data_type.clone());
            it = method.emplace(
                it,
                Instruction::mov(local_value, uniform_value(data_type))
                    .with_decorations(decorations),
            );
            it = it.next_in_block(method);
        }
    }

    // then the explicit kernel arguments
    let parameters = method.parameters.clone();
    for parameter in parameters {
        let param_type = method.local(parameter).data_type.clone();
        let decorations = method
            .local(parameter)
            .as_parameter()
            .map(|p| p.decorations)
            .unwrap_or_default();
        if param_type.pointer_info().is_none() && param_type.vector_width() != 1 {
            it = load_vector_parameter(method, it, parameter);
        } else if decorations.contains(ParameterDecorations::SIGN_EXTEND) {
            let uniform = uniform_value(param_type.clone());
            let value = method.local(parameter).value();
            it = insert_sign_extension(method, it, &uniform, &value, ConditionCode::Always);
        } else if decorations.contains(ParameterDecorations::ZERO_EXTEND) {
            let uniform = uniform_value(param_type.clone());
            let value = method.local(parameter).value();
            it = insert_zero_extension(method, it, &uniform, &value, ConditionCode::Always);
        } else {
            let mut load_decorations = Decorations::WORK_GROUP_UNIFORM_VALUE;
            if param_type.pointer_info().is_some() {
                // all pointers are unsigned
                load_decorations |= Decorations::UNSIGNED_RESULT;
            }
            let value = method.local(parameter).value();
            it = method.emplace(
                it,
                Instruction::mov(value, uniform_value(param_type))
                    .with_decorations(load_decorations),
            );
            it = it.next_in_block(method);
        }
    }

    generate_stop_segment(method);
    Ok(())
}

/// Signal the host and halt: the interrupt value must be non-null, so the
/// inverted QPU number is written (the upper 28 bits are all ones).
fn generate_stop_segment(method: &mut Method) {
    method.append_to_end(
        Instruction::unary_op(
            OpCode::Not,
            Value::register(REG_HOST_INTERRUPT, TYPE_INT8),
            qpu_number_value(),
        )
        .with_decorations(Decorations::WORK_GROUP_UNIFORM_VALUE),
    );
    method.append_to_end(Instruction::nop(DelayKind::ThreadEnd).with_signal(Signal::EndProgram));
    method.append_to_end(Instruction::nop(DelayKind::ThreadEnd));
    method.append_to_end(Instruction::nop(DelayKind::ThreadEnd));
}
