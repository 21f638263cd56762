//! Lowering of generic memory instructions onto the device's access paths.
//!
//! Every memory location was classified by the analysis; this pass picks the
//! mapper from the (location type × operation) decision matrix and emits the
//! concrete register, VPM, TMU or DMA sequence in place of the generic
//! instruction.

use log::debug;

use crate::analysis::memory::{
    determine_memory_access, MemoryAccessInfo, MemoryAccessType, MemoryInfo,
};
use crate::error::{CompileError, CompileResult};
use crate::ir::helper::{
    insert_address_to_byte_offset, insert_address_to_element_offset, insert_replication,
    insert_vector_extraction, insert_vector_insertion,
};
use crate::ir::instruction::{
    Instruction, InstructionKind, MemoryOp, MutexAccess, OpCode, UNPACK_8A_32,
};
use crate::ir::local::{LocalId, ParameterDecorations};
use crate::ir::method::{base_local_of, Method};
use crate::ir::types::{DataType, TYPE_INT32, TYPE_INT8};
use crate::ir::value::{Value, INT_ONE};
use crate::ir::walker::InstructionWalker;
use crate::periphery::tmu::{insert_read_vector_from_tmu, Tmu};
use crate::periphery::vpm::{
    get_best_vector_size, insert_copy_ram, insert_copy_ram_dynamic, insert_dma_load,
    insert_dma_store, insert_dma_store_dynamic, insert_read_vpm, insert_write_scratch,
    insert_write_vpm,
};

/// Snapshot of a memory instruction's fields.
#[derive(Clone, Debug)]
struct MemoryAccess {
    op: MemoryOp,
    destination: Value,
    source: Value,
    num_entries: Value,
    guard: bool,
    text: String,
}

impl MemoryAccess {
    fn from_instruction(inst: &Instruction) -> Option<Self> {
        match &inst.kind {
            InstructionKind::Memory {
                op,
                destination,
                source,
                num_entries,
                guard,
            } => Some(MemoryAccess {
                op: *op,
                destination: destination.clone(),
                source: source.clone(),
                num_entries: num_entries.clone(),
                guard: *guard,
                text: inst.to_string(),
            }),
            _ => None,
        }
    }

    fn element_type(value: &Value) -> DataType {
        match value.data_type.pointer_info() {
            Some(pointer) => pointer.element_type.clone(),
            None => value.data_type.clone(),
        }
    }

    fn source_element_type(&self) -> DataType {
        Self::element_type(&self.source)
    }

    fn destination_element_type(&self) -> DataType {
        Self::element_type(&self.destination)
    }
}

/// Lower all memory instructions of the method. Afterwards no generic memory
/// instruction remains; every access routes through registers, the VPM, the
/// TMU or DMA.
pub fn lower_memory_access(method: &mut Method) -> CompileResult<()> {
    crate::profile_scope!("LowerMemoryAccess");
    let access_info = determine_memory_access(method)?;
    let mut it = method.walk_all();
    while !it.is_end_of_method(method) {
        match method.instruction(it).map(|inst| &inst.kind) {
            Some(InstructionKind::Memory { .. }) => {
                it = map_memory_access(method, it, &access_info)?;
            }
            // lifetime markers carry no meaning once locations are assigned
            Some(InstructionKind::LifetimeBoundary { .. }) => {
                it = method.erase(it);
            }
            _ => it = it.next_in_method(method),
        }
    }
    Ok(())
}

/// Candidate memory locations of one operand. Conditional pointers yield
/// several; they must all share one access type.
fn base_candidates(
    method: &Method,
    value: &Value,
    access: &MemoryAccessInfo,
) -> CompileResult<Vec<LocalId>> {
    let mut candidates = Vec::new();
    if let Some(base) = base_local_of(method, value) {
        if access.info(base).is_some() {
            candidates.push(base);
        } else {
            // conditionally selected pointer: every writer contributes its
            // own base location
            for writer_id in method.local(base).writers() {
                if let Some(walker) = method.find_walker(writer_id) {
                    if let Some(InstructionKind::Move { source }) =
                        method.instruction(walker).map(|inst| &inst.kind)
                    {
                        if let Some(inner) = base_local_of(method, source) {
                            if access.info(inner).is_some() && !candidates.contains(&inner) {
                                candidates.push(inner);
                            }
                        }
                    }
                }
            }
        }
    }
    if candidates.is_empty() {
        return Err(CompileError::normalization_general(format!(
            "no memory location known for address {value}"
        )));
    }
    Ok(candidates)
}

fn single_info<'a>(
    access: &'a MemoryAccessInfo,
    candidates: &[LocalId],
    mapper: &str,
    text: &str,
) -> CompileResult<&'a MemoryInfo> {
    if candidates.len() != 1 {
        return Err(CompileError::normalization(
            format!("{mapper} does not support multiple memory locations"),
            text,
        ));
    }
    Ok(access.info(candidates[0]).expect("candidate was classified"))
}

fn mark_parameter(method: &mut Method, local: LocalId, decoration: ParameterDecorations) {
    if let Some(param) = method.local_mut(local).as_parameter_mut() {
        param.decorations |= decoration;
    }
}

/// Dispatch one memory instruction through the decision matrix. The walker
/// must address a memory instruction; the returned walker points past the
/// emitted replacement sequence.
pub fn map_memory_access(
    method: &mut Method,
    it: InstructionWalker,
    access: &MemoryAccessInfo,
) -> CompileResult<InstructionWalker> {
    let mem = MemoryAccess::from_instruction(
        method
            .instruction(it)
            .ok_or_else(|| CompileError::internal("walker does not address an instruction"))?,
    )
    .ok_or_else(|| CompileError::internal("walker does not address a memory instruction"))?;

    let src_candidates = match mem.op {
        MemoryOp::Read | MemoryOp::Copy => base_candidates(method, &mem.source, access)?,
        // the source of a write/fill is plain data
        MemoryOp::Write | MemoryOp::Fill => Vec::new(),
    };
    let dest_candidates = match mem.op {
        MemoryOp::Read => Vec::new(),
        _ => base_candidates(method, &mem.destination, access)?,
    };

    let type_candidates = if matches!(mem.op, MemoryOp::Read | MemoryOp::Copy) {
        &src_candidates
    } else {
        &dest_candidates
    };
    let access_type = access
        .info(type_candidates[0])
        .expect("candidate was classified")
        .access_type;
    for candidate in type_candidates {
        if access.info(*candidate).unwrap().access_type != access_type {
            return Err(CompileError::normalization(
                "cannot map conditional memory accesses of different access types together",
                &mem.text,
            ));
        }
    }

    use MemoryAccessType::*;
    use MemoryOp::*;
    match (access_type, mem.op) {
        (QpuRegisterReadOnly, Read) | (QpuRegisterReadOnly, Copy) => {
            lower_read_only_to_register(method, it, &mem, access, &src_candidates, &dest_candidates)
        }
        (QpuRegisterReadWrite, Copy) => {
            lower_copy_to_register(method, it, &mem, access, &src_candidates, &dest_candidates)
        }
        (QpuRegisterReadWrite, _) => {
            lower_read_write_to_register(method, it, &mem, access, &src_candidates, &dest_candidates)
        }
        (VpmPerQpu, Read) | (VpmShared, Read) => {
            lower_read_to_vpm(method, it, &mem, access, &src_candidates)
        }
        (VpmPerQpu, Write) | (VpmPerQpu, Fill) | (VpmShared, Write) | (VpmShared, Fill) => {
            lower_write_to_vpm(method, it, &mem, access, &dest_candidates)
        }
        (RamLoadTmu, Read) => load_via_tmu(method, it, &mem, access, &src_candidates),
        (RamReadWriteVpm, Read) | (RamReadWriteVpm, Write) | (RamReadWriteVpm, Fill) => {
            access_ram_via_vpm(method, it, &mem, access, &src_candidates, &dest_candidates)
        }
        (VpmPerQpu, Copy) | (VpmShared, Copy) | (RamLoadTmu, Copy) | (RamReadWriteVpm, Copy) => {
            map_memory_copy(method, it, &mem, access, &src_candidates, &dest_candidates)
        }
        _ => Err(CompileError::normalization("invalid memory access", &mem.text)),
    }
}

/// The number of entries covers the whole mapped register, so indexing is
/// unnecessary (byte-wise copies of whole vectors).
fn copies_whole_register(
    num_entries: &Value,
    element_type: &DataType,
    register_type: &DataType,
) -> bool {
    num_entries.literal_value().is_some_and(|lit| {
        lit.unsigned_int() * element_type.logical_width() == register_type.logical_width()
    })
}

fn lower_read_only_to_register(
    method: &mut Method,
    mut it: InstructionWalker,
    mem: &MemoryAccess,
    access: &MemoryAccessInfo,
    src_candidates: &[LocalId],
    _dest_candidates: &[LocalId],
) -> CompileResult<InstructionWalker> {
    let src_info = single_info(access, src_candidates, "lowerReadOnlyToRegister", &mem.text)?;
    let mapped = src_info.mapped_register.clone().ok_or_else(|| {
        CompileError::normalization(
            "cannot map memory location to register without mapped value",
            &mem.text,
        )
    })?;
    let element_type = src_info
        .converted_register_type
        .as_ref()
        .map(DataType::element_type)
        .unwrap_or_else(|| mapped.data_type.element_type());
    let whole_register = src_info.converted_register_type.as_ref().is_some_and(|reg| {
        copies_whole_register(&mem.num_entries, &mem.destination_element_type(), reg)
    });
    let base = src_info.local;

    let tmp_value = if mem.op == MemoryOp::Copy && whole_register {
        // no index required when the whole object is copied
        mapped.clone()
    } else {
        let mut index = Value::undefined(TYPE_INT32);
        let container = src_info
            .converted_register_type
            .clone()
            .unwrap_or_else(|| mapped.data_type.clone());
        it = insert_address_to_element_offset(method, it, &mut index, base, &container, &mem.source)?;
        let tmp = method.add_new_local(element_type, "%lowered_constant");
        it = insert_vector_extraction(method, it, &mapped, &index, &tmp);
        tmp
    };

    match mem.op {
        MemoryOp::Read => {
            debug!(
                "Replaced loading of constant memory with vector rotation of register: {}",
                mem.text
            );
            method.replace(it, Instruction::mov(mem.destination.clone(), tmp_value));
            Ok(it.next_in_block(method))
        }
        MemoryOp::Copy => {
            if !whole_register && mem.num_entries.literal_value().map(|l| l.unsigned_int()) != Some(1)
            {
                return Err(CompileError::normalization(
                    "lowering a copy with more than one entry is not supported",
                    &mem.text,
                ));
            }
            debug!(
                "Replaced copy from register-mapped constant memory with memory write: {}",
                mem.text
            );
            method.replace(
                it,
                Instruction::memory(
                    MemoryOp::Write,
                    mem.destination.clone(),
                    tmp_value,
                    INT_ONE,
                    mem.guard,
                ),
            );
            map_memory_access(method, it, access)
        }
        _ => Err(CompileError::normalization(
            "cannot perform a non-read operation on constant memory",
            &mem.text,
        )),
    }
}

fn lower_read_write_to_register(
    method: &mut Method,
    mut it: InstructionWalker,
    mem: &MemoryAccess,
    access: &MemoryAccessInfo,
    src_candidates: &[LocalId],
    dest_candidates: &[LocalId],
) -> CompileResult<InstructionWalker> {
    let info = if mem.op == MemoryOp::Read {
        single_info(access, src_candidates, "lowerReadWriteToRegister", &mem.text)?
    } else {
        single_info(access, dest_candidates, "lowerReadWriteToRegister", &mem.text)?
    };
    let mapped = info.mapped_register.clone().ok_or_else(|| {
        CompileError::normalization(
            "cannot map memory location to register without mapped value",
            &mem.text,
        )
    })?;
    let container = info
        .converted_register_type
        .clone()
        .unwrap_or_else(|| mapped.data_type.clone());
    let base = info.local;
    match mem.op {
        MemoryOp::Read => {
            let mut index = Value::undefined(TYPE_INT32);
            it =
                insert_address_to_element_offset(method, it, &mut index, base, &container, &mem.source)?;
            it = insert_vector_extraction(method, it, &mapped, &index, &mem.destination);
        }
        MemoryOp::Write => {
            let mut index = Value::undefined(TYPE_INT32);
            it = insert_address_to_element_offset(
                method,
                it,
                &mut index,
                base,
                &container,
                &mem.destination,
            )?;
            it = insert_vector_insertion(method, it, &mapped, &index, &mem.source);
        }
        MemoryOp::Fill if mem.source.data_type.is_scalar_type() => {
            it = insert_replication(method, it, &mem.source, &mapped);
        }
        _ => {
            return Err(CompileError::normalization(
                "unhandled case of lowering memory access to register",
                &mem.text,
            ))
        }
    }
    debug!("Replaced access to register-lowered memory: {}", mem.text);
    Ok(method.erase(it))
}

fn lower_copy_to_register(
    method: &mut Method,
    mut it: InstructionWalker,
    mem: &MemoryAccess,
    access: &MemoryAccessInfo,
    src_candidates: &[LocalId],
    dest_candidates: &[LocalId],
) -> CompileResult<InstructionWalker> {
    let src_info = single_info(access, src_candidates, "lowerCopyToRegister", &mem.text)?;
    let dest_info = single_info(access, dest_candidates, "lowerCopyToRegister", &mem.text)?;
    if src_info.local == dest_info.local {
        return Err(CompileError::normalization(
            "copy from and to the same register-lowered memory area is not supported",
            &mem.text,
        ));
    }
    if dest_info.access_type == MemoryAccessType::QpuRegisterReadOnly {
        return Err(CompileError::normalization(
            "copy into read-only registers is not supported",
            &mem.text,
        ));
    }
    let mapped = src_info.mapped_register.clone().ok_or_else(|| {
        CompileError::normalization("unhandled case of lowering memory copy to register", &mem.text)
    })?;
    let whole_register = src_info.converted_register_type.as_ref().is_some_and(|reg| {
        copies_whole_register(&mem.num_entries, &mem.destination_element_type(), reg)
    });
    debug!("Lowering copy with register-mapped memory: {}", mem.text);
    let tmp = if whole_register {
        mapped.clone()
    } else {
        if mem.num_entries.literal_value().map(|l| l.unsigned_int()) != Some(1) {
            return Err(CompileError::normalization(
                "lowering a copy with a dynamic number of entries is not supported",
                &mem.text,
            ));
        }
        let mut index = Value::undefined(TYPE_INT32);
        let container = src_info
            .converted_register_type
            .clone()
            .unwrap_or_else(|| mapped.data_type.clone());
        it = insert_address_to_element_offset(
            method,
            it,
            &mut index,
            src_info.local,
            &container,
            &mem.source,
        )?;
        let tmp = method.add_new_local(mem.source_element_type(), "%register_copy");
        it = insert_vector_extraction(method, it, &mapped, &index, &tmp);
        tmp
    };
    method.replace(
        it,
        Instruction::memory(
            MemoryOp::Write,
            mem.destination.clone(),
            tmp,
            INT_ONE,
            mem.guard,
        ),
    );
    map_memory_access(method, it, access)
}

/// Byte offset of the accessed address within its VPM-backed area.
fn insert_in_area_offset(
    method: &mut Method,
    it: InstructionWalker,
    out: &mut Value,
    info: &MemoryInfo,
    mem: &MemoryAccess,
    ptr: &Value,
) -> CompileResult<InstructionWalker> {
    if let Some(ranges) = &info.ranges {
        let current = method.instruction(it).map(|inst| inst.id);
        if !ranges.iter().any(|range| Some(range.access) == current) {
            // accesses synthesized during lowering (e.g. the halves of a
            // copy) have no recorded range, their offset derives from the
            // pointer like any other
            debug!("No recorded access range for {}", mem.text);
        }
    }
    Ok(insert_address_to_byte_offset(method, it, out, info.local, ptr))
}

fn lower_read_to_vpm(
    method: &mut Method,
    mut it: InstructionWalker,
    mem: &MemoryAccess,
    access: &MemoryAccessInfo,
    src_candidates: &[LocalId],
) -> CompileResult<InstructionWalker> {
    let info = single_info(access, src_candidates, "lowerReadToVPM", &mem.text)?;
    let area = info.area.ok_or_else(|| {
        CompileError::normalization("cannot lower into VPM without a VPM area", &mem.text)
    })?;
    debug!("Lowering read of on-chip memory into VPM read: {}", mem.text);
    let mut offset = Value::undefined(TYPE_INT32);
    it = insert_in_area_offset(method, it, &mut offset, info, mem, &mem.source)?;
    it = insert_read_vpm(method, it, &mem.destination, area, mem.guard, &offset);
    Ok(method.erase(it))
}

fn lower_write_to_vpm(
    method: &mut Method,
    mut it: InstructionWalker,
    mem: &MemoryAccess,
    access: &MemoryAccessInfo,
    dest_candidates: &[LocalId],
) -> CompileResult<InstructionWalker> {
    let info = single_info(access, dest_candidates, "lowerWriteToVPM", &mem.text)?;
    let area = info.area.ok_or_else(|| {
        CompileError::normalization("cannot lower into VPM without a VPM area", &mem.text)
    })?;
    match mem.op {
        MemoryOp::Write => {
            debug!("Lowering write of on-chip memory into VPM write: {}", mem.text);
            let mut offset = Value::undefined(TYPE_INT32);
            it = insert_in_area_offset(method, it, &mut offset, info, mem, &mem.destination)?;
            it = insert_write_vpm(method, it, &mem.source, area, mem.guard, &offset);
            Ok(method.erase(it))
        }
        MemoryOp::Fill => {
            let num_entries = mem.num_entries.literal_value().ok_or_else(|| {
                CompileError::normalization(
                    "filling a dynamically sized VPM area is not supported",
                    &mem.text,
                )
            })?;
            let info_local = info.local;
            let guard = mem.guard;
            let (fill_value, entry_bytes) = if mem.source.data_type == TYPE_INT8 {
                // widen the byte so whole words are written per entry
                let (row_type, _) = get_best_vector_size(num_entries.unsigned_int());
                let fill_word = method.add_new_local(TYPE_INT32, "%fill_word");
                it = method.emplace(
                    it,
                    Instruction::mov(fill_word.clone(), mem.source.clone())
                        .with_unpack(UNPACK_8A_32),
                );
                it = it.next_in_block(method);
                let fill_vector =
                    method.add_new_local(TYPE_INT32.to_vector_type(16), "%memory_fill");
                it = insert_replication(method, it, &fill_word, &fill_vector);
                (fill_vector, row_type.in_memory_width())
            } else {
                (mem.source.clone(), mem.source.data_type.in_memory_width())
            };
            let mut offset = Value::undefined(TYPE_INT32);
            let info = access.info(info_local).unwrap();
            it = insert_in_area_offset(method, it, &mut offset, info, mem, &mem.destination)?;
            if guard {
                it = method.emplace(it, Instruction::mutex(MutexAccess::Lock));
                it = it.next_in_block(method);
            }
            let entries = if mem.source.data_type == TYPE_INT8 {
                num_entries.unsigned_int() * TYPE_INT8.in_memory_width() / entry_bytes
            } else {
                num_entries.unsigned_int()
            };
            for entry in 0..entries.max(1) {
                let byte_offset = match offset.literal_value() {
                    Some(base) => {
                        Value::int((base.unsigned_int() + entry * entry_bytes) as i32)
                    }
                    None => {
                        let entry_offset = method.add_new_local(TYPE_INT32, "%fill_offset");
                        it = method.emplace(
                            it,
                            Instruction::op(
                                OpCode::Add,
                                entry_offset.clone(),
                                offset.clone(),
                                Value::int((entry * entry_bytes) as i32),
                            ),
                        );
                        it = it.next_in_block(method);
                        entry_offset
                    }
                };
                it = insert_write_vpm(method, it, &fill_value, area, false, &byte_offset);
            }
            if guard {
                it = method.emplace(it, Instruction::mutex(MutexAccess::Release));
                it = it.next_in_block(method);
            }
            Ok(method.erase(it))
        }
        _ => Err(CompileError::normalization(
            "unhandled case of lowering memory access into VPM",
            &mem.text,
        )),
    }
}

fn load_via_tmu(
    method: &mut Method,
    it: InstructionWalker,
    mem: &MemoryAccess,
    access: &MemoryAccessInfo,
    src_candidates: &[LocalId],
) -> CompileResult<InstructionWalker> {
    debug!("Loading from read-only memory via TMU: {}", mem.text);
    // all candidate sources must be served by the same unit; majority wins
    let mut num_tmu0 = 0u32;
    let mut num_tmu1 = 0u32;
    for candidate in src_candidates {
        mark_parameter(method, *candidate, ParameterDecorations::INPUT);
        match access.info(*candidate).and_then(|info| info.tmu) {
            Some(Tmu::Tmu0) => num_tmu0 += 1,
            _ => num_tmu1 += 1,
        }
    }
    let tmu = if num_tmu0 > num_tmu1 { Tmu::Tmu0 } else { Tmu::Tmu1 };
    let it = insert_read_vector_from_tmu(method, it, &mem.destination, &mem.source, tmu);
    Ok(method.erase(it))
}

fn access_ram_via_vpm(
    method: &mut Method,
    mut it: InstructionWalker,
    mem: &MemoryAccess,
    _access: &MemoryAccessInfo,
    src_candidates: &[LocalId],
    dest_candidates: &[LocalId],
) -> CompileResult<InstructionWalker> {
    debug!("Mapping access to memory located in RAM: {}", mem.text);
    match mem.op {
        MemoryOp::Fill => {
            if mem.guard {
                it = method.emplace(it, Instruction::mutex(MutexAccess::Lock));
                it = it.next_in_block(method);
            }
            match mem.num_entries.literal_value() {
                Some(num_copies) => {
                    if mem.source.data_type == TYPE_INT8 {
                        // batch single bytes into the widest dividing vector
                        let (row_type, num_rows) =
                            get_best_vector_size(num_copies.unsigned_int());
                        let fill_word = method.add_new_local(TYPE_INT32, "%fill_word");
                        it = method.emplace(
                            it,
                            Instruction::mov(fill_word.clone(), mem.source.clone())
                                .with_unpack(UNPACK_8A_32),
                        );
                        it = it.next_in_block(method);
                        let fill_vector =
                            method.add_new_local(TYPE_INT32.to_vector_type(16), "%memory_fill");
                        it = insert_replication(method, it, &fill_word, &fill_vector);
                        it = insert_write_scratch(method, it, &fill_vector);
                        it = insert_dma_store(
                            method,
                            it,
                            &mem.destination,
                            &row_type,
                            num_rows,
                            0,
                        );
                    } else {
                        it = insert_write_scratch(method, it, &mem.source);
                        it = insert_dma_store(
                            method,
                            it,
                            &mem.destination,
                            &mem.source_element_type(),
                            num_copies.unsigned_int(),
                            0,
                        );
                    }
                }
                None => {
                    // runtime-counted DMA fill
                    it = insert_write_scratch(method, it, &mem.source);
                    it = insert_dma_store_dynamic(
                        method,
                        it,
                        &mem.destination,
                        &mem.source_element_type(),
                        &mem.num_entries,
                        0,
                    );
                }
            }
            if mem.guard {
                it = method.emplace(it, Instruction::mutex(MutexAccess::Release));
                it = it.next_in_block(method);
            }
            for candidate in dest_candidates {
                mark_parameter(method, *candidate, ParameterDecorations::OUTPUT);
            }
            Ok(method.erase(it))
        }
        MemoryOp::Read => {
            if mem.guard {
                it = method.emplace(it, Instruction::mutex(MutexAccess::Lock));
                it = it.next_in_block(method);
            }
            it = insert_dma_load(
                method,
                it,
                &mem.source,
                &mem.destination_element_type(),
                1,
                0,
            );
            it = read_scratch_into(method, it, &mem.destination);
            if mem.guard {
                it = method.emplace(it, Instruction::mutex(MutexAccess::Release));
                it = it.next_in_block(method);
            }
            for candidate in src_candidates {
                mark_parameter(method, *candidate, ParameterDecorations::INPUT);
            }
            Ok(method.erase(it))
        }
        MemoryOp::Write => {
            if mem.guard {
                it = method.emplace(it, Instruction::mutex(MutexAccess::Lock));
                it = it.next_in_block(method);
            }
            it = insert_write_scratch(method, it, &mem.source);
            it = insert_dma_store(
                method,
                it,
                &mem.destination,
                &mem.source_element_type(),
                1,
                0,
            );
            if mem.guard {
                it = method.emplace(it, Instruction::mutex(MutexAccess::Release));
                it = it.next_in_block(method);
            }
            for candidate in dest_candidates {
                mark_parameter(method, *candidate, ParameterDecorations::OUTPUT);
            }
            Ok(method.erase(it))
        }
        _ => Err(CompileError::normalization(
            "unhandled case of accessing RAM",
            &mem.text,
        )),
    }
}

/// Read one vector from the DMA scratch rows into `dest`.
fn read_scratch_into(
    method: &mut Method,
    mut it: InstructionWalker,
    dest: &Value,
) -> InstructionWalker {
    use crate::ir::value::{REG_VPM_IN_SETUP, REG_VPM_IO};
    use crate::periphery::vpm::VpmReadSetup;
    let setup = VpmReadSetup::horizontal_words(1, 0);
    it = method.emplace(
        it,
        Instruction::load_immediate(
            Value::register(REG_VPM_IN_SETUP, TYPE_INT32),
            crate::ir::value::Literal(setup.0),
        ),
    );
    it = it.next_in_block(method);
    it = method.emplace(
        it,
        Instruction::mov(
            dest.clone(),
            Value::register(REG_VPM_IO, dest.data_type.clone()),
        ),
    );
    it.next_in_block(method)
}

/// Convert a front-end byte-wise copy count into entries of the aggregate
/// actually stored at the location.
fn convert_byte_count(
    method: &Method,
    mem: &MemoryAccess,
    info: &MemoryInfo,
    element_type: &DataType,
    num_entries: &mut Value,
    row_type: &mut Option<DataType>,
) -> CompileResult<()> {
    let literal = match num_entries.literal_value() {
        Some(literal) if info.area.is_some() && *element_type == TYPE_INT8 => literal,
        _ => return Ok(()),
    };
    let contained = {
        let data_type = &method.local(info.local).data_type;
        match data_type.pointer_info() {
            Some(pointer) => pointer.element_type.clone(),
            None => data_type.clone(),
        }
    };
    let num_bytes = literal.unsigned_int();
    if num_bytes != contained.in_memory_width() {
        return Err(CompileError::normalization(
            "byte-wise partial copy of on-chip memory is not supported",
            &mem.text,
        ));
    }
    if let Some(array) = contained.array_info() {
        *num_entries = Value::int(array.size as i32);
        *row_type = Some(array.element_type.clone());
    } else if contained.is_vector_type() {
        *num_entries = Value::int(1);
        *row_type = Some(contained.clone());
    } else {
        return Err(CompileError::normalization(
            "unsupported element type for memory copy into VPM",
            &mem.text,
        ));
    }
    Ok(())
}

fn map_memory_copy(
    method: &mut Method,
    mut it: InstructionWalker,
    mem: &MemoryAccess,
    access: &MemoryAccessInfo,
    src_candidates: &[LocalId],
    dest_candidates: &[LocalId],
) -> CompileResult<InstructionWalker> {
    let src_info = single_info(access, src_candidates, "mapMemoryCopy", &mem.text)?.clone();
    let dest_info = single_info(access, dest_candidates, "mapMemoryCopy", &mem.text)?.clone();

    for candidate in src_candidates {
        mark_parameter(method, *candidate, ParameterDecorations::INPUT);
    }
    for candidate in dest_candidates {
        mark_parameter(method, *candidate, ParameterDecorations::OUTPUT);
    }

    use MemoryAccessType::*;
    let src_in_vpm = matches!(src_info.access_type, VpmPerQpu | VpmShared);
    let src_in_ram = matches!(src_info.access_type, RamLoadTmu | RamReadWriteVpm);
    let dest_in_vpm = matches!(dest_info.access_type, VpmPerQpu | VpmShared);
    let dest_in_ram = matches!(dest_info.access_type, RamLoadTmu | RamReadWriteVpm);
    let dest_in_register = dest_info.access_type == QpuRegisterReadWrite;

    // byte-wise memcpy of typed aggregates: recover the element count
    let mut num_entries = mem.num_entries.clone();
    let mut row_type: Option<DataType> = None;
    convert_byte_count(
        method,
        mem,
        &src_info,
        &mem.source_element_type(),
        &mut num_entries,
        &mut row_type,
    )?;
    convert_byte_count(
        method,
        mem,
        &dest_info,
        &mem.destination_element_type(),
        &mut num_entries,
        &mut row_type,
    )?;

    if src_in_vpm && dest_in_vpm {
        // VPM → VPM: read into a register, write back
        debug!("Mapping copy between VPM areas to VPM read and write: {}", mem.text);
        if num_entries.literal_value().map(|l| l.unsigned_int()) != Some(1) {
            return Err(CompileError::normalization(
                "copying within the VPM with more than one entry is not supported",
                &mem.text,
            ));
        }
        if mem.guard {
            it = method.emplace(it, Instruction::mutex(MutexAccess::Lock));
            it = it.next_in_block(method);
        }
        let tmp = method.add_new_local(
            row_type.unwrap_or_else(|| mem.source_element_type()),
            "%vpm_copy_tmp",
        );
        it = method.emplace(
            it,
            Instruction::memory(
                MemoryOp::Read,
                tmp.clone(),
                mem.source.clone(),
                num_entries.clone(),
                false,
            ),
        );
        it = map_memory_access(method, it, access)?;
        method.replace(
            it,
            Instruction::memory(
                MemoryOp::Write,
                mem.destination.clone(),
                tmp,
                num_entries,
                false,
            ),
        );
        it = map_memory_access(method, it, access)?;
        if mem.guard {
            it = method.emplace(it, Instruction::mutex(MutexAccess::Release));
            it = it.next_in_block(method);
        }
        Ok(it)
    } else if src_in_vpm && dest_in_ram {
        // VPM → RAM is a DMA write out of the area
        debug!("Mapping copy from VPM into RAM to DMA write: {}", mem.text);
        let area = method.vpm.area(src_info.area.expect("vpm info has area")).clone();
        let mut offset = Value::undefined(TYPE_INT32);
        it = insert_in_area_offset(method, it, &mut offset, &src_info, mem, &mem.source)?;
        let row = area_row_for_offset(&area, &offset, &mem.text)?;
        let row_type = row_type.unwrap_or_else(|| mem.source_element_type());
        it = match num_entries.literal_value() {
            Some(literal) => insert_dma_store(
                method,
                it,
                &mem.destination,
                &row_type,
                literal.unsigned_int(),
                row,
            ),
            None => insert_dma_store_dynamic(
                method,
                it,
                &mem.destination,
                &row_type,
                &num_entries,
                row,
            ),
        };
        Ok(method.erase(it))
    } else if src_in_ram && dest_in_vpm {
        debug!("Mapping copy from RAM into VPM to DMA read: {}", mem.text);
        let area = method.vpm.area(dest_info.area.expect("vpm info has area")).clone();
        let mut offset = Value::undefined(TYPE_INT32);
        it = insert_in_area_offset(method, it, &mut offset, &dest_info, mem, &mem.destination)?;
        let row = area_row_for_offset(&area, &offset, &mem.text)?;
        let row_type = row_type.unwrap_or_else(|| mem.destination_element_type());
        let literal = num_entries.literal_value().ok_or_else(|| {
            CompileError::normalization(
                "copying a dynamic number of entries into the VPM is not supported",
                &mem.text,
            )
        })?;
        it = insert_dma_load(
            method,
            it,
            &mem.source,
            &row_type,
            literal.unsigned_int(),
            row,
        );
        Ok(method.erase(it))
    } else if src_in_ram && dest_in_ram {
        debug!("Mapping copy within RAM to DMA read and DMA write: {}", mem.text);
        match num_entries.literal_value() {
            Some(literal) => {
                let element = mem.source_element_type();
                let num_bytes = literal.unsigned_int() as u64
                    * u64::from(element.scalar_bit_count().max(8) / 8)
                    * u64::from(element.vector_width());
                if num_bytes > u64::from(u32::MAX) {
                    return Err(CompileError::optimization(
                        "cannot copy more than 4GB of data",
                        &mem.text,
                    ));
                }
                it = insert_copy_ram(
                    method,
                    it,
                    &mem.destination,
                    &mem.source,
                    num_bytes as u32,
                    mem.guard,
                )?;
            }
            None => {
                it = insert_copy_ram_dynamic(
                    method,
                    it,
                    &mem.destination,
                    &mem.source,
                    &mem.source_element_type(),
                    &num_entries,
                    mem.guard,
                );
            }
        }
        Ok(method.erase(it))
    } else if dest_in_register && dest_info.converted_register_type.is_some() {
        let register_type = dest_info.converted_register_type.clone().unwrap();
        if copies_whole_register(&num_entries, &mem.source_element_type(), &register_type) {
            // the whole register is covered, a single vector read suffices
            debug!(
                "Mapping copy of whole register from VPM/RAM to a read: {}",
                mem.text
            );
            let mapped = dest_info.mapped_register.clone().expect("register mapping");
            let source = retype_pointer(&mem.source, &register_type);
            method.replace(
                it,
                Instruction::memory(MemoryOp::Read, mapped, source, INT_ONE, mem.guard),
            );
            map_memory_access(method, it, access)
        } else if let Some(literal) = num_entries.literal_value() {
            let copied_bytes = literal.unsigned_int() * mem.source_element_type().logical_width();
            if copied_bytes == 0 || copied_bytes > TYPE_INT32.to_vector_type(16).logical_width() {
                return Err(CompileError::normalization(
                    "invalid number of copied elements",
                    &mem.text,
                ));
            }
            let num_elements = copied_bytes / register_type.element_type().logical_width();
            if num_elements == 0 || num_elements > 16 {
                return Err(CompileError::normalization(
                    "invalid number of copied elements",
                    &mem.text,
                ));
            }
            debug!("Mapping partial copy into register: {}", mem.text);
            if mem.guard {
                it = method.emplace(it, Instruction::mutex(MutexAccess::Lock));
                it = it.next_in_block(method);
            }
            let tmp = method.add_new_local(
                mem.source_element_type().to_vector_type(num_elements as u8),
                "%mem_read_tmp",
            );
            it = method.emplace(
                it,
                Instruction::memory(
                    MemoryOp::Read,
                    tmp.clone(),
                    mem.source.clone(),
                    INT_ONE,
                    false,
                ),
            );
            it = map_memory_access(method, it, access)?;
            method.replace(
                it,
                Instruction::memory(
                    MemoryOp::Write,
                    mem.destination.clone(),
                    tmp,
                    INT_ONE,
                    false,
                ),
            );
            it = map_memory_access(method, it, access)?;
            if mem.guard {
                it = method.emplace(it, Instruction::mutex(MutexAccess::Release));
                it = it.next_in_block(method);
            }
            Ok(it)
        } else {
            Err(CompileError::normalization(
                "copying a dynamic number of entries into a register is not supported",
                &mem.text,
            ))
        }
    } else {
        Err(CompileError::normalization(
            "unhandled case of mapping a memory copy",
            &mem.text,
        ))
    }
}

/// The VPM row addressed by a literal in-area byte offset.
fn area_row_for_offset(
    area: &crate::periphery::vpm::VpmArea,
    offset: &Value,
    text: &str,
) -> CompileResult<u8> {
    let literal = offset.literal_value().ok_or_else(|| {
        CompileError::normalization(
            "DMA transfers of VPM areas require a static in-area offset",
            text,
        )
    })?;
    Ok(area.base_row + (literal.unsigned_int() / crate::periphery::vpm::VPM_ROW_BYTES) as u8)
}

/// The same pointer value viewed as pointing to `element_type`.
fn retype_pointer(pointer: &Value, element_type: &DataType) -> Value {
    let space = pointer
        .data_type
        .pointer_info()
        .map(|info| info.address_space)
        .unwrap_or(crate::ir::types::AddressSpace::Private);
    let mut retyped = pointer.clone();
    retyped.data_type = DataType::pointer(element_type.clone(), space);
    retyped
}
