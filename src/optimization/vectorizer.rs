//! Loop auto-vectorization.
//!
//! Detects natural loops with a single literal-stepped induction variable
//! and statically known bounds, decides a SIMD widening factor against a
//! cost model and widens the loop body, turning per-element iterations into
//! whole-vector iterations.

use std::collections::HashSet;

use log::debug;

use crate::analysis::cfg::{ControlFlowGraph, ControlFlowLoop};
use crate::analysis::dependency::{DataDependencyGraph, DependencyKind};
use crate::error::{CompileError, CompileResult};
use crate::ir::instruction::{
    Decorations, InstId, Instruction, InstructionKind, OpCode, SetFlag,
};
use crate::ir::local::LocalId;
use crate::ir::method::Method;
use crate::ir::types::{DataType, NATIVE_VECTOR_SIZE, TYPE_INT8};
use crate::ir::value::{
    element_number_value, Literal, SmallImmediate, Value, ValueContent, REG_SFU_OUT,
    REG_TMU0_ADDRESS, REG_TMU1_ADDRESS, REG_VPM_DMA_LOAD_ADDR, REG_VPM_DMA_STORE_ADDR,
};
use crate::normalization::literals::handle_immediate;
use crate::periphery::vpm::{dma_setup_kind, DmaSetupKind};
use crate::profile_counter;
use crate::profiler::COUNTER_OPTIMIZATION;

/// How the iteration variable changes per iteration.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum StepKind {
    AddConstant,
    SubConstant,
    MulConstant,
}

impl StepKind {
    fn of(code: OpCode) -> Option<StepKind> {
        match code {
            OpCode::Add => Some(StepKind::AddConstant),
            OpCode::Sub => Some(StepKind::SubConstant),
            OpCode::Mul24 => Some(StepKind::MulConstant),
            _ => None,
        }
    }
}

/// The kind of comparison terminating the loop.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Comparison {
    Equal,
    LessThan,
}

/// Everything known about how a loop iterates.
#[derive(Debug)]
struct LoopControl {
    iteration_variable: LocalId,
    /// The phi move outside the loop setting the initial value.
    initialization: InstId,
    initial_value: Literal,
    /// The single in-loop operation changing the variable.
    iteration_step: InstId,
    step_kind: StepKind,
    step_value: Literal,
    terminating_value: Literal,
    comparison: Comparison,
    repetition_branch: InstId,
    vectorization_factor: u32,
}

impl LoopControl {
    /// Number of iterations until `initial ⋛ limit`, per step kind.
    fn count_iterations(&self) -> Option<i64> {
        let initial = i64::from(self.initial_value.signed_int());
        let mut limit = i64::from(self.terminating_value.signed_int());
        let step = i64::from(self.step_value.signed_int());
        if self.comparison == Comparison::Equal {
            // the loop runs up to and including the limit
            limit += 1;
        }
        match self.step_kind {
            StepKind::AddConstant => {
                (step > 0 && limit > initial).then(|| (limit - initial) / step)
            }
            StepKind::SubConstant => {
                (step > 0 && initial > limit).then(|| (initial - limit) / step)
            }
            StepKind::MulConstant => {
                // solve initial * step^n >= limit by repeated multiplication
                if initial <= 0 || step <= 1 || limit <= initial {
                    return None;
                }
                let mut value = initial;
                let mut count = 0i64;
                while value < limit && count < 64 {
                    value *= step;
                    count += 1;
                }
                (count < 64).then_some(count)
            }
        }
    }
}

/// Locals that are phi-carried into the loop from both inside and outside:
/// the iteration variable candidates.
fn find_loop_iterations(
    loop_: &ControlFlowLoop,
    dependencies: &DataDependencyGraph,
) -> Vec<LocalId> {
    let mut inner: HashSet<LocalId> = HashSet::new();
    let mut outer: HashSet<LocalId> = HashSet::new();
    for &node in &loop_.nodes {
        for (pred, edge) in dependencies.incoming(node) {
            for (&local, &kind) in edge {
                if kind.contains(DependencyKind::PHI | DependencyKind::FLOW) {
                    if loop_.contains_block(pred) {
                        inner.insert(local);
                    } else {
                        outer.insert(local);
                    }
                }
            }
        }
    }
    let mut candidates: Vec<LocalId> = inner.intersection(&outer).copied().collect();
    candidates.sort();
    if candidates.is_empty() {
        debug!("Failed to find a loop iteration variable");
    }
    candidates
}

/// Whether the local feeding this instruction's output is consumed by a
/// phi-node move (the step result flows back into the iteration variable).
fn feeds_phi_move(method: &Method, inst: &Instruction) -> bool {
    let out = match inst.check_output_local() {
        Some(out) => out.id,
        None => return false,
    };
    method.local(out).users.keys().any(|user| {
        method
            .find_walker(*user)
            .and_then(|walker| method.instruction(walker))
            .is_some_and(|user_inst| user_inst.has_decoration(Decorations::PHI_NODE))
    })
}

fn literal_argument(method: &Method, inst: &Instruction) -> Option<Literal> {
    inst.arguments()
        .iter()
        .find_map(|arg| method.precalculate(arg, 2))
}

fn extract_loop_control(
    method: &Method,
    cfg: &ControlFlowGraph,
    loop_: &ControlFlowLoop,
    dependencies: &DataDependencyGraph,
) -> CompileResult<Option<LoopControl>> {
    let mut found: Vec<LoopControl> = Vec::new();
    for candidate in find_loop_iterations(loop_, dependencies) {
        debug!(
            "Loop iteration variable candidate: {}",
            method.local(candidate).name
        );
        let mut initialization: Option<(InstId, Literal)> = None;
        let mut step: Option<(InstId, StepKind, Literal)> = None;

        let users: Vec<InstId> = method.local(candidate).users.keys().copied().collect();
        for user in users {
            let in_loop = loop_.find_in_loop(method, user);
            let walker = match in_loop.or_else(|| method.find_walker(user)) {
                Some(walker) => walker,
                None => continue,
            };
            let inst = method.instruction(walker).unwrap();
            let use_info = method.local(candidate).users[&user];
            if use_info.writes_local()
                && inst.has_decoration(Decorations::PHI_NODE)
                && in_loop.is_none()
            {
                if let Some(literal) = method.precalculate_instruction(inst, 4) {
                    debug!("Found lower bound: {literal}");
                    initialization = Some((user, literal));
                }
            } else if use_info.reads_local() && in_loop.is_some() {
                match &inst.kind {
                    InstructionKind::Op { code, second, .. }
                        if second.is_some() && feeds_phi_move(method, inst) =>
                    {
                        if let (Some(kind), Some(literal)) =
                            (StepKind::of(*code), literal_argument(method, inst))
                        {
                            debug!("Found iteration instruction: {inst}");
                            step = Some((user, kind, literal));
                        }
                    }
                    // the variable may be copied first (use-with-immediate)
                    InstructionKind::Move { .. } => {
                        if let Some(copy) = inst.check_output_local() {
                            let copy_users: Vec<InstId> =
                                method.local(copy.id).users.keys().copied().collect();
                            for copy_user in copy_users {
                                if let Some(copy_walker) = loop_.find_in_loop(method, copy_user) {
                                    let copy_inst = method.instruction(copy_walker).unwrap();
                                    if let InstructionKind::Op { code, second, .. } =
                                        &copy_inst.kind
                                    {
                                        if second.is_some() && feeds_phi_move(method, copy_inst) {
                                            if let (Some(kind), Some(literal)) = (
                                                StepKind::of(*code),
                                                literal_argument(method, copy_inst),
                                            ) {
                                                debug!("Found iteration instruction: {copy_inst}");
                                                step = Some((copy_user, kind, literal));
                                            }
                                        }
                                    }
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        // the repetition branch is the header's explicit edge back into the loop
        let mut repetition: Option<InstId> = None;
        for (succ, edge) in cfg.successors(loop_.header()) {
            if !edge.is_implicit() && loop_.contains_block(succ) {
                repetition = edge.branch;
                if let Some(branch) = repetition.and_then(|id| method.find_walker(id)) {
                    debug!(
                        "Found loop repetition branch: {}",
                        method.instruction(branch).unwrap()
                    );
                }
            }
        }

        let (initialization, initial_value) = match initialization {
            Some(pair) => pair,
            None => continue,
        };
        let (step_inst, step_kind, step_value) = match step {
            Some(triple) => triple,
            None => continue,
        };
        let repetition_branch = match repetition {
            Some(branch) => branch,
            None => continue,
        };

        let bounds = extract_terminating_value(method, loop_, step_inst, repetition_branch);
        let (terminating_value, comparison) = match bounds {
            Some(pair) => pair,
            None => continue,
        };
        debug!("Found upper bound: {terminating_value}");

        found.push(LoopControl {
            iteration_variable: candidate,
            initialization,
            initial_value,
            iteration_step: step_inst,
            step_kind,
            step_value,
            terminating_value,
            comparison,
            repetition_branch,
            vectorization_factor: 0,
        });
    }
    match found.len() {
        0 => Ok(None),
        1 => Ok(Some(found.into_iter().next().unwrap())),
        _ => Err(CompileError::optimization_general(
            "selecting between multiple loop iteration variables is not supported",
        )),
    }
}

/// Walk from the step result to the flag-setting comparison driving the
/// repetition branch, and read off the compared-against literal.
fn extract_terminating_value(
    method: &Method,
    loop_: &ControlFlowLoop,
    step_inst: InstId,
    repetition_branch: InstId,
) -> Option<(Literal, Comparison)> {
    let step_out = method
        .find_walker(step_inst)
        .and_then(|walker| method.instruction(walker))
        .and_then(Instruction::check_output_local)?
        .id;
    let branch_condition = match method
        .find_walker(repetition_branch)
        .and_then(|walker| method.instruction(walker))
        .map(|inst| &inst.kind)
    {
        Some(InstructionKind::Branch { condition, .. }) => condition.clone(),
        _ => return None,
    };

    let users: Vec<InstId> = method.local(step_out).users.keys().copied().collect();
    // direct: an instruction computes the branch condition from the step
    let mut comparison_inst = users.iter().copied().find(|user| {
        method
            .find_walker(*user)
            .and_then(|walker| method.instruction(walker))
            .zip(branch_condition.local_id())
            .is_some_and(|(inst, cond)| inst.writes_local(cond))
    });
    if comparison_inst.is_none() {
        // default shape: `- = xor <step>, <limit> (setf)` feeding the branch
        comparison_inst = users.iter().copied().find(|user| {
            loop_.find_in_loop(method, *user).is_some()
                && method
                    .find_walker(*user)
                    .and_then(|walker| method.instruction(walker))
                    .is_some_and(|inst| inst.set_flags == SetFlag::SetFlags)
        });
    }
    let comparison_inst = comparison_inst?;
    let inst = method
        .find_walker(comparison_inst)
        .and_then(|walker| method.instruction(walker))?;
    let comparison = match &inst.kind {
        InstructionKind::Op { code: OpCode::Xor, .. } => Comparison::Equal,
        InstructionKind::Op {
            code: OpCode::Sub | OpCode::FSub,
            ..
        } => Comparison::LessThan,
        _ => return None,
    };
    debug!("Found loop continue condition: {inst}");
    let other = inst
        .arguments()
        .into_iter()
        .find(|arg| arg.local_id() != Some(step_out))?;
    let literal = method.precalculate(other, 4)?;
    Some((literal, comparison))
}

/// The largest divisor of the iteration count fitting the free SIMD lanes.
fn determine_vectorization_factor(
    method: &Method,
    loop_: &ControlFlowLoop,
    control: &LoopControl,
) -> Option<u32> {
    let mut max_width = 1u8;
    for &block in &loop_.nodes {
        for inst in method.block(block).instructions() {
            if let Some(out) = inst.output() {
                max_width = max_width.max(out.data_type.vector_width());
            }
        }
    }
    debug!("Found maximum used vector width of {max_width} elements");
    let iterations = control.count_iterations()?;
    debug!("Determined iteration count of {iterations}");
    let mut factor = u32::from(NATIVE_VECTOR_SIZE) / u32::from(max_width);
    while factor > 0 {
        if iterations % i64::from(factor) == 0 {
            break;
        }
        factor -= 1;
    }
    debug!("Determined possible vectorization factor of {factor}");
    (factor > 0).then_some(factor)
}

/// Benefit (instructions saved) minus cost; `i32::MIN` rejects the loop.
fn calculate_costs_vs_benefits(
    method: &Method,
    loop_: &ControlFlowLoop,
    control: &LoopControl,
) -> i32 {
    let mut costs = 0i32;
    let mut read_addresses: HashSet<LocalId> = HashSet::new();
    let mut written_addresses: HashSet<LocalId> = HashSet::new();

    for &block in &loop_.nodes {
        for inst in method.block(block).instructions() {
            let writes_load_address = inst.writes_register(REG_VPM_DMA_LOAD_ADDR)
                || inst.writes_register(REG_TMU0_ADDRESS)
                || inst.writes_register(REG_TMU1_ADDRESS);
            if writes_load_address {
                for arg in inst.arguments() {
                    if let Some(local) = arg.local_id() {
                        read_addresses.insert(local);
                        if let Some((base, _)) = method.local(local).reference {
                            read_addresses.insert(base);
                        }
                    }
                }
            } else if inst.writes_register(REG_VPM_DMA_STORE_ADDR) {
                for arg in inst.arguments() {
                    if let Some(local) = arg.local_id() {
                        written_addresses.insert(local);
                        if let Some((base, _)) = method.local(local).reference {
                            written_addresses.insert(base);
                        }
                    }
                }
            } else if matches!(inst.kind, InstructionKind::VectorRotation { .. }) {
                debug!("Cannot vectorize loops containing vector rotations: {inst}");
                return i32::MIN;
            } else if matches!(inst.kind, InstructionKind::MemoryBarrier { .. }) {
                debug!("Cannot vectorize loops containing memory barriers: {inst}");
                return i32::MIN;
            } else if matches!(inst.kind, InstructionKind::Semaphore { .. }) {
                debug!("Cannot vectorize loops containing semaphore calls: {inst}");
                return i32::MIN;
            }
        }
    }

    if !read_addresses.is_disjoint(&written_addresses) {
        debug!("Cannot vectorize loops reading and writing the same memory addresses");
        return i32::MIN;
    }

    // a scaled step literal beyond the small-immediate range costs a load
    let scaled_step = control
        .step_value
        .signed_int()
        .saturating_mul(control.vectorization_factor as i32);
    if SmallImmediate::from_integer(scaled_step).is_none() {
        costs += 1;
    }

    let num_instructions = loop_.instruction_count(method) as i32;
    let benefits = num_instructions * control.vectorization_factor as i32;
    debug!(
        "Calculated cost-vs-benefit rating of {}",
        benefits - costs
    );
    benefits - costs
}

/// Queue all readers of the local for widening; readers that push an address
/// to a TMU also pull the matching r4 read into the set.
fn schedule_for_vectorization(
    method: &Method,
    local: LocalId,
    open: &mut HashSet<InstId>,
    loop_: &ControlFlowLoop,
) {
    for user in method.local(local).readers() {
        let walker = match method.find_walker(user) {
            Some(walker) => walker,
            None => continue,
        };
        let inst = method.instruction(walker).unwrap();
        if !inst.has_decoration(Decorations::AUTO_VECTORIZED) {
            open.insert(user);
        }
        let writes_tmu = inst
            .output()
            .and_then(Value::check_register)
            .is_some_and(|reg| reg.is_texture_memory_unit() || reg.is_special_functions_unit());
        if writes_tmu && loop_.find_in_loop(method, user).is_some() {
            let mut next = walker.next_in_block(method);
            while let Some(follow) = method.instruction(next) {
                if follow.reads_register(REG_SFU_OUT)
                    && !follow.has_decoration(Decorations::AUTO_VECTORIZED)
                {
                    open.insert(follow.id);
                    break;
                }
                next = next.next_in_block(method);
            }
        }
    }
}

fn widen_pointer_or_vector(data_type: &DataType, width: u8) -> DataType {
    match data_type.pointer_info() {
        Some(pointer) => DataType::pointer(
            pointer.element_type.to_vector_type(width),
            pointer.address_space,
        ),
        None => data_type.to_vector_type(width),
    }
}

/// Widen one instruction, propagating the widening to its output local.
fn vectorize_instruction(
    method: &mut Method,
    walker: crate::ir::walker::InstructionWalker,
    open: &mut HashSet<InstId>,
    factor: u32,
    loop_: &ControlFlowLoop,
) {
    let inst_id = method.instruction(walker).unwrap().id;
    debug!(
        "Vectorizing instruction: {}",
        method.instruction(walker).unwrap()
    );

    // 1. update argument types to match their (already widened) locals
    let mut vector_width = 1u8;
    let mut schedule: Vec<LocalId> = Vec::new();
    {
        let local_types: Vec<(LocalId, DataType)> = method
            .instruction(walker)
            .unwrap()
            .arguments()
            .iter()
            .filter_map(|arg| arg.local_id())
            .map(|id| (id, method.local(id).data_type.clone()))
            .collect();
        let inst = method.instruction_mut(walker).unwrap();
        inst.for_each_argument_mut(|arg| match &arg.content {
            ValueContent::Local(local) => {
                if let Some((_, local_type)) =
                    local_types.iter().find(|(id, _)| *id == local.id)
                {
                    if &arg.data_type != local_type {
                        schedule.push(local.id);
                        arg.data_type = arg.data_type.to_vector_type(local_type.vector_width());
                    }
                    vector_width = vector_width.max(arg.data_type.vector_width());
                }
            }
            ValueContent::Register(_) => {
                // register reads (e.g. from the TMU) deliver full vectors
                vector_width = vector_width.max(factor as u8);
            }
            _ => {}
        });
    }

    // 2. widen the output to the argument width
    let is_alu = matches!(
        method.instruction(walker).unwrap().kind,
        InstructionKind::Op { .. } | InstructionKind::Move { .. }
    );
    if is_alu {
        let mut widen_local: Option<(LocalId, u8)> = None;
        {
            let inst = method.instruction_mut(walker).unwrap();
            if let Some(out) = inst.output.as_mut() {
                out.data_type = widen_pointer_or_vector(&out.data_type, vector_width);
                if let Some(local) = out.check_local() {
                    widen_local = Some((local.id, out.data_type.vector_width()));
                }
            }
        }
        if let Some((local, width)) = widen_local {
            let widened = widen_pointer_or_vector(&method.local(local).data_type, width);
            method.local_mut(local).data_type = widened;
            schedule.push(local);
        }
    }

    method
        .instruction_mut(walker)
        .unwrap()
        .add_decorations(Decorations::AUTO_VECTORIZED);
    open.remove(&inst_id);
    for local in schedule {
        schedule_for_vectorization(method, local, open, loop_);
    }
}

/// Fold the 16 partial results of a widened local into every lane, using the
/// local's single associative in-loop writer; rewrites the out-of-loop reader
/// to consume the folded value.
fn fold_vectorized_local(
    method: &mut Method,
    reader: InstId,
    loop_: &ControlFlowLoop,
    open: &mut HashSet<InstId>,
) -> CompileResult<()> {
    let reader_walker = method.find_walker(reader).ok_or_else(|| {
        CompileError::internal("open vectorization instruction disappeared")
    })?;
    let reader_text = method.instruction(reader_walker).unwrap().to_string();
    debug!("Local is accessed outside of the loop: {reader_text}");

    // the folded local: the widened local this reader consumes
    let folded = method
        .instruction(reader_walker)
        .unwrap()
        .arguments()
        .iter()
        .find_map(|arg| arg.local_id().filter(|id| {
            method.local(*id).writers().any(|writer| {
                loop_.find_in_loop(method, writer).is_some()
            })
        }))
        .ok_or_else(|| {
            CompileError::optimization(
                "accessing vectorized locals outside of the loop is not supported",
                &reader_text,
            )
        })?;

    let writers: Vec<InstId> = method.local(folded).writers().collect();
    let in_loop_writers: Vec<InstId> = writers
        .iter()
        .copied()
        .filter(|writer| loop_.find_in_loop(method, *writer).is_some())
        .collect();
    let fold_op = match in_loop_writers.as_slice() {
        [single] => {
            let inst = method
                .find_walker(*single)
                .and_then(|walker| method.instruction(walker))
                .unwrap();
            match &inst.kind {
                InstructionKind::Op { code, .. }
                    if code.is_associative()
                        && !inst.has_side_effects()
                        && inst.has_decoration(Decorations::AUTO_VECTORIZED) =>
                {
                    *code
                }
                _ => {
                    return Err(CompileError::optimization(
                        "accessing vectorized locals outside of the loop is not supported",
                        &reader_text,
                    ))
                }
            }
        }
        _ => {
            return Err(CompileError::optimization(
                "accessing vectorized locals outside of the loop is not supported",
                &reader_text,
            ))
        }
    };

    // butterfly fold: combine lanes 8 apart, then 4, 2, 1
    debug!("Folding vectorized local with {}", fold_op.name());
    let vector_type = method.local(folded).data_type.clone();
    let mut it = reader_walker;
    let mut current = method.local(folded).value();
    for offset in [8u8, 4, 2, 1] {
        let rotated = method.add_new_local(vector_type.clone(), "%fold_rotated");
        let rotation = SmallImmediate::from_rotation_offset(offset).expect("offset in range");
        it = method.emplace(
            it,
            Instruction::vector_rotation(
                rotated.clone(),
                current.clone(),
                Value::small_immediate(rotation, TYPE_INT8),
            )
            .with_decorations(Decorations::AUTO_VECTORIZED),
        );
        it = it.next_in_block(method);
        let combined = method.add_new_local(vector_type.clone(), "%fold_combined");
        it = method.emplace(
            it,
            Instruction::op(fold_op, combined.clone(), current, rotated)
                .with_decorations(Decorations::AUTO_VECTORIZED),
        );
        it = it.next_in_block(method);
        current = combined;
    }

    // rewrite the reader to consume the folded result
    let mut rewritten = method.instruction(it).unwrap().clone();
    rewritten.for_each_argument_mut(|arg| {
        if arg.local_id() == Some(folded) {
            *arg = current.clone();
        }
    });
    rewritten.add_decorations(Decorations::AUTO_VECTORIZED);
    method.replace(it, rewritten);
    open.remove(&reader);
    Ok(())
}

/// Scale the DMA transfer shapes inside the loop by the widening factor.
fn fix_vpm_setups(method: &mut Method, loop_: &ControlFlowLoop, factor: u32) -> usize {
    use crate::ir::value::REG_VPM_IO;
    let mut fixed = 0usize;
    for &block in &loop_.nodes {
        let mut index = 0usize;
        while index < method.block(block).size() {
            let walker = crate::ir::walker::InstructionWalker::new(block, index);
            let setup = method.instruction(walker).and_then(dma_setup_kind);
            if let Some(setup) = setup {
                // only patch setups whose related VPM access was vectorized;
                // the VPM write precedes a DMA store, the VPM read follows a
                // DMA load
                let mut related_vectorized = false;
                match setup {
                    DmaSetupKind::Store(_) => {
                        let mut prev = walker;
                        while prev.index > 0 {
                            prev = prev.previous_in_block();
                            let before = method.instruction(prev).unwrap();
                            if before.writes_register(REG_VPM_IO) {
                                related_vectorized =
                                    before.has_decoration(Decorations::AUTO_VECTORIZED);
                                break;
                            }
                        }
                    }
                    DmaSetupKind::Load(_) => {
                        let mut next = walker.next_in_block(method);
                        while let Some(follow) = method.instruction(next) {
                            if follow.reads_register(REG_VPM_IO) {
                                related_vectorized =
                                    follow.has_decoration(Decorations::AUTO_VECTORIZED);
                                break;
                            }
                            next = next.next_in_block(method);
                        }
                    }
                }
                if related_vectorized {
                    let patched = match setup {
                        DmaSetupKind::Store(mut store) => {
                            store.set_depth((u32::from(store.depth()) * factor).min(127) as u8);
                            store.0
                        }
                        DmaSetupKind::Load(mut load) => {
                            let length =
                                (u32::from(load.row_length()) * factor) % 16; /* 0 => 16 */
                            load.set_row_length(length as u8);
                            load.0
                        }
                    };
                    let mut rewritten = method.instruction(walker).unwrap().clone();
                    if let InstructionKind::LoadImmediate { immediate } = &mut rewritten.kind {
                        *immediate = Literal(patched);
                    }
                    rewritten.add_decorations(Decorations::AUTO_VECTORIZED);
                    method.replace(walker, rewritten);
                    fixed += 1;
                }
            }
            index += 1;
        }
    }
    fixed
}

/// Rewrite the initial value for per-lane iteration and scale the step.
fn fix_initial_value_and_step(method: &mut Method, control: &LoopControl) -> CompileResult<()> {
    let factor = control.vectorization_factor;
    let variable_width = method
        .local(control.iteration_variable)
        .data_type
        .vector_width();

    let init_walker = method.find_walker(control.initialization).ok_or_else(|| {
        CompileError::internal("loop initialization instruction disappeared")
    })?;
    let init = method.instruction(init_walker).unwrap().clone();
    let init_source = match &init.kind {
        InstructionKind::Move { source } => source.clone(),
        _ => {
            return Err(CompileError::optimization(
                "unhandled initial value",
                init.to_string(),
            ))
        }
    };
    let mut rewritten_init = init.clone();
    if let Some(out) = rewritten_init.output.as_mut() {
        out.data_type = out.data_type.to_vector_type(variable_width);
    }
    let step_is_increment =
        control.step_kind == StepKind::AddConstant && control.step_value.signed_int() == 1;
    if init_source.has_literal(Literal(0)) && step_is_increment {
        // default case: counting from zero becomes the per-lane element index
        rewritten_init.kind = InstructionKind::Move {
            source: element_number_value(),
        };
        rewritten_init.add_decorations(Decorations::AUTO_VECTORIZED);
        method.replace(init_walker, rewritten_init);
        debug!(
            "Changed initial value: {}",
            method.instruction(init_walker).unwrap()
        );
    } else if init_source.is_literal_value() && step_is_increment {
        // literal start: offset the element index by it
        let output = rewritten_init.output.clone().expect("move has output");
        let mut replacement =
            Instruction::op(OpCode::Add, output, init_source, element_number_value())
                .with_decorations(init.decorations | Decorations::AUTO_VECTORIZED);
        replacement.condition = init.condition;
        method.replace(init_walker, replacement);
        debug!(
            "Changed initial value: {}",
            method.instruction(init_walker).unwrap()
        );
    } else {
        return Err(CompileError::optimization(
            "unhandled initial value",
            init.to_string(),
        ));
    }

    // scale the literal step operand
    let step_walker = method.find_walker(control.iteration_step).ok_or_else(|| {
        CompileError::internal("loop step instruction disappeared")
    })?;
    let step = method.instruction(step_walker).unwrap().clone();
    match &step.kind {
        InstructionKind::Op {
            code: OpCode::Add | OpCode::Sub,
            ..
        } => {
            let mut rewritten = step.clone();
            let mut changed = false;
            rewritten.for_each_argument_mut(|arg| {
                if changed {
                    return;
                }
                if let Some(literal) = arg.literal_value() {
                    let scaled = literal.signed_int() * factor as i32;
                    let width = arg.data_type.vector_width().saturating_mul(factor as u8);
                    *arg = Value::literal(
                        Literal::from_signed(scaled),
                        arg.data_type.to_vector_type(width.min(NATIVE_VECTOR_SIZE)),
                    );
                    changed = true;
                }
            });
            if !changed {
                return Err(CompileError::optimization(
                    "unhandled iteration step",
                    step.to_string(),
                ));
            }
            method.replace(step_walker, rewritten);
            debug!(
                "Changed iteration step: {}",
                method.instruction(step_walker).unwrap()
            );
        }
        _ => {
            return Err(CompileError::optimization(
                "unhandled iteration step operation",
                step.to_string(),
            ))
        }
    }
    Ok(())
}

/// Widen the whole loop by the chosen factor.
fn vectorize(
    method: &mut Method,
    loop_: &ControlFlowLoop,
    control: &LoopControl,
) -> CompileResult<()> {
    let factor = control.vectorization_factor;
    let mut open: HashSet<InstId> = HashSet::new();

    let variable = control.iteration_variable;
    let old_type = method.local(variable).data_type.clone();
    let new_width = (u32::from(old_type.vector_width()) * factor).min(16) as u8;
    method.local_mut(variable).data_type = old_type.to_vector_type(new_width);
    schedule_for_vectorization(method, variable, &mut open, loop_);

    let mut num_vectorized = 0usize;
    while let Some(&next) = open.iter().next() {
        match loop_.find_in_loop(method, next) {
            Some(walker) => {
                vectorize_instruction(method, walker, &mut open, factor, loop_);
                num_vectorized += 1;
            }
            None => {
                // locals read after the loop must be folded back to a scalar
                fold_vectorized_local(method, next, loop_, &mut open)?;
            }
        }
    }

    num_vectorized += fix_vpm_setups(method, loop_, factor);
    fix_initial_value_and_step(method, control)?;
    num_vectorized += 2;
    debug!("Vectorization done, changed {num_vectorized} instructions");
    Ok(())
}

/// Find vectorizable loops and widen them. Returns whether anything changed.
pub fn vectorize_loops(method: &mut Method) -> CompileResult<bool> {
    crate::profile_scope!("VectorizeLoops");
    let cfg = ControlFlowGraph::create(method);
    let loops = cfg.find_loops(method);
    let dependencies = DataDependencyGraph::create(method);
    let mut has_changed = false;

    for loop_ in loops {
        profile_counter!(COUNTER_OPTIMIZATION + 333, "Loops found", 1);
        let mut control = match extract_loop_control(method, &cfg, &loop_, &dependencies)? {
            Some(control) => control,
            None => {
                debug!("Failed to find all bounds and step for the loop, aborting vectorization");
                continue;
            }
        };

        let factor = match determine_vectorization_factor(method, &loop_, &control) {
            Some(factor) if factor > 1 => factor,
            _ => continue,
        };
        control.vectorization_factor = factor;

        let rating = calculate_costs_vs_benefits(method, &loop_, &control);
        if rating < 0 {
            // vectorization (probably) doesn't pay off
            continue;
        }

        vectorize(method, &loop_, &control)?;
        // the scaled step literal may no longer fit a small immediate
        if let Some(step_walker) = method.find_walker(control.iteration_step) {
            handle_immediate(method, step_walker);
        }
        has_changed = true;
        profile_counter!(
            COUNTER_OPTIMIZATION + 334,
            "Vectorization factors",
            factor
        );
    }
    Ok(has_changed)
}
