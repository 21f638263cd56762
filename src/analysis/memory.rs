//! Classification of memory locations ahead of lowering.
//!
//! For every local used as the base of a memory access this pass decides the
//! cheapest path the target offers: a QPU register, a VPM area or RAM via
//! TMU/DMA. The lowering (normalization) then emits the concrete access
//! sequences from the attached [`MemoryInfo`].

use std::collections::HashMap;

use log::debug;

use crate::error::{CompileError, CompileResult};
use crate::ir::instruction::{InstId, InstructionKind, MemoryOp};
use crate::ir::local::{LocalId, LocalKind};
use crate::ir::method::{base_local_of, Method};
use crate::ir::types::{AddressSpace, DataType, NATIVE_VECTOR_SIZE};
use crate::ir::value::Value;
use crate::periphery::tmu::{select_tmu, Tmu};
use crate::periphery::vpm::{VpmAreaId, VpmUsage, VPM_ROW_BYTES};

/// How a memory location is realized on the device.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MemoryAccessType {
    /// Read-only data held in a register, indexed by vector rotation.
    QpuRegisterReadOnly,
    /// Mutable private data held in a register.
    QpuRegisterReadWrite,
    /// On-chip VPM rows, one range per QPU.
    VpmPerQpu,
    /// On-chip VPM rows shared by all QPUs.
    VpmShared,
    /// RAM, read through the TMU (never written).
    RamLoadTmu,
    /// RAM, read and written through VPM DMA.
    RamReadWriteVpm,
}

/// One address computation feeding an access to a shared VPM area.
#[derive(Clone, Debug)]
pub struct MemoryAccessRange {
    /// The memory access instruction the range belongs to.
    pub access: InstId,
    /// The base local the accessed pointer is derived from.
    pub base: LocalId,
}

/// Lowering description of one memory location.
#[derive(Clone, Debug)]
pub struct MemoryInfo {
    pub local: LocalId,
    pub access_type: MemoryAccessType,
    /// Register-backed value holding the data, for register lowering.
    pub mapped_register: Option<Value>,
    /// The register-compatible view of the stored aggregate.
    pub converted_register_type: Option<DataType>,
    /// The VPM rows backing the location.
    pub area: Option<VpmAreaId>,
    /// Access ranges into a shared area.
    pub ranges: Option<Vec<MemoryAccessRange>>,
    /// Which TMU serves loads of this location.
    pub tmu: Option<Tmu>,
}

impl MemoryInfo {
    fn plain(local: LocalId, access_type: MemoryAccessType) -> Self {
        MemoryInfo {
            local,
            access_type,
            mapped_register: None,
            converted_register_type: None,
            area: None,
            ranges: None,
            tmu: None,
        }
    }
}

impl std::fmt::Display for MemoryInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.access_type {
            MemoryAccessType::QpuRegisterReadOnly => write!(f, "read-only register"),
            MemoryAccessType::QpuRegisterReadWrite => write!(f, "register"),
            MemoryAccessType::VpmPerQpu => write!(f, "private VPM area"),
            MemoryAccessType::VpmShared => write!(f, "shared VPM area"),
            MemoryAccessType::RamLoadTmu => write!(
                f,
                "read-only memory access via TMU{}",
                match self.tmu {
                    Some(Tmu::Tmu1) => "1",
                    _ => "0",
                }
            ),
            MemoryAccessType::RamReadWriteVpm => write!(f, "read-write memory access via VPM"),
        }
    }
}

/// The classification of all memory locations of a method.
#[derive(Default)]
pub struct MemoryAccessInfo {
    infos: HashMap<LocalId, MemoryInfo>,
}

impl MemoryAccessInfo {
    pub fn info(&self, local: LocalId) -> Option<&MemoryInfo> {
        self.infos.get(&local)
    }

    pub fn infos(&self) -> impl Iterator<Item = &MemoryInfo> {
        self.infos.values()
    }
}

/// The register-compatible type of a memory aggregate, if it fits one
/// 16-element row.
pub fn convert_to_register_type(contained: &DataType) -> Option<DataType> {
    if let Some(array) = contained.array_info() {
        if array.size <= u32::from(NATIVE_VECTOR_SIZE)
            && array.element_type.is_scalar_type()
            && contained.in_memory_width() <= VPM_ROW_BYTES
        {
            return Some(array.element_type.to_vector_type(array.size as u8));
        }
        return None;
    }
    if contained.is_simple() && contained.in_memory_width() <= VPM_ROW_BYTES {
        return Some(contained.clone());
    }
    None
}

/// How each memory instruction touches a base local.
#[derive(Default, Clone, Copy, Debug)]
struct AccessSummary {
    reads: bool,
    writes: bool,
}

fn contained_type(method: &Method, local: LocalId) -> DataType {
    let data_type = &method.local(local).data_type;
    match data_type.pointer_info() {
        Some(info) => info.element_type.clone(),
        None => data_type.clone(),
    }
}

/// Determine the [`MemoryInfo`] for every memory location of the method.
pub fn determine_memory_access(method: &mut Method) -> CompileResult<MemoryAccessInfo> {
    crate::profile_scope!("DetermineMemoryAccess");
    let mut accesses: HashMap<LocalId, AccessSummary> = HashMap::new();
    let mut shared_ranges: HashMap<LocalId, Vec<MemoryAccessRange>> = HashMap::new();

    for block in method.blocks() {
        for inst in block.instructions() {
            let (op, destination, source) = match &inst.kind {
                InstructionKind::Memory {
                    op,
                    destination,
                    source,
                    ..
                } => (*op, destination, source),
                _ => continue,
            };
            let mut record = |value: &Value, is_address: bool, write: bool| {
                if !is_address {
                    return;
                }
                if let Some(base) = base_local_of(method, value) {
                    let summary = accesses.entry(base).or_default();
                    if write {
                        summary.writes = true;
                    } else {
                        summary.reads = true;
                    }
                    shared_ranges.entry(base).or_default().push(MemoryAccessRange {
                        access: inst.id,
                        base,
                    });
                }
            };
            match op {
                MemoryOp::Read => record(source, true, false),
                MemoryOp::Write | MemoryOp::Fill => record(destination, true, true),
                MemoryOp::Copy => {
                    record(source, true, false);
                    record(destination, true, true);
                }
            }
        }
    }

    let mut result = MemoryAccessInfo::default();
    let mut num_tmu0 = 0u32;
    let mut num_tmu1 = 0u32;

    let bases: Vec<(LocalId, AccessSummary)> = {
        let mut list: Vec<_> = accesses.into_iter().collect();
        list.sort_by_key(|(id, _)| *id);
        list
    };
    for (base, summary) in bases {
        let contained = contained_type(method, base);
        let kind = method.local(base).kind.clone();
        let info = match &kind {
            LocalKind::Parameter(_) => {
                let param_type = method.local(base).data_type.clone();
                match param_type.pointer_info() {
                    Some(pointer) => match pointer.address_space {
                        AddressSpace::Local => {
                            classify_on_chip(method, base, &contained, VpmUsage::Shared)
                        }
                        AddressSpace::Private => {
                            classify_on_chip(method, base, &contained, VpmUsage::PerQpu)
                        }
                        _ if !summary.writes => {
                            let tmu = select_tmu(num_tmu0, num_tmu1);
                            match tmu {
                                Tmu::Tmu0 => num_tmu0 += 1,
                                Tmu::Tmu1 => num_tmu1 += 1,
                            }
                            let mut info = MemoryInfo::plain(base, MemoryAccessType::RamLoadTmu);
                            info.tmu = Some(tmu);
                            info
                        }
                        _ => MemoryInfo::plain(base, MemoryAccessType::RamReadWriteVpm),
                    },
                    None => {
                        // by-value parameter, loaded from UNIFORMs into its
                        // own register at kernel start
                        let local = method.local(base);
                        MemoryInfo {
                            local: base,
                            access_type: MemoryAccessType::QpuRegisterReadOnly,
                            mapped_register: Some(local.value()),
                            converted_register_type: Some(param_type.clone()),
                            area: None,
                            ranges: None,
                            tmu: None,
                        }
                    }
                }
            }
            LocalKind::StackAllocation(_) => {
                match convert_to_register_type(&contained) {
                    Some(register_type) => {
                        let mapped =
                            method.add_new_local(register_type.clone(), "%lowered_stack");
                        MemoryInfo {
                            local: base,
                            access_type: MemoryAccessType::QpuRegisterReadWrite,
                            mapped_register: Some(mapped),
                            converted_register_type: Some(register_type),
                            area: None,
                            ranges: None,
                            tmu: None,
                        }
                    }
                    None => classify_on_chip(method, base, &contained, VpmUsage::PerQpu),
                }
            }
            LocalKind::Global(global) => {
                if global.is_constant {
                    match (&global.initial_value, convert_to_register_type(&contained)) {
                        (Some(init), Some(register_type)) => MemoryInfo {
                            local: base,
                            access_type: MemoryAccessType::QpuRegisterReadOnly,
                            mapped_register: Some(init.clone()),
                            converted_register_type: Some(register_type),
                            area: None,
                            ranges: None,
                            tmu: None,
                        },
                        _ => {
                            let tmu = select_tmu(num_tmu0, num_tmu1);
                            match tmu {
                                Tmu::Tmu0 => num_tmu0 += 1,
                                Tmu::Tmu1 => num_tmu1 += 1,
                            }
                            let mut info = MemoryInfo::plain(base, MemoryAccessType::RamLoadTmu);
                            info.tmu = Some(tmu);
                            info
                        }
                    }
                } else {
                    classify_on_chip(method, base, &contained, VpmUsage::Shared)
                }
            }
            LocalKind::Plain => {
                return Err(CompileError::normalization_general(format!(
                    "memory access to a location of unknown storage: {}",
                    method.local(base).name
                )))
            }
        };
        let mut info = info;
        if matches!(
            info.access_type,
            MemoryAccessType::VpmShared | MemoryAccessType::VpmPerQpu
        ) {
            info.ranges = shared_ranges.remove(&base);
        }
        debug!(
            "Memory location {} lowered to {}",
            method.local(base).name,
            info
        );
        result.infos.insert(base, info);
    }
    Ok(result)
}

/// Place a location into the VPM, falling back to RAM when the arena is full.
fn classify_on_chip(
    method: &mut Method,
    base: LocalId,
    contained: &DataType,
    usage: VpmUsage,
) -> MemoryInfo {
    let bytes = contained.in_memory_width();
    let rows = bytes.div_ceil(VPM_ROW_BYTES).max(1);
    if rows <= u32::from(u8::MAX) {
        if let Some(area) = method
            .vpm
            .allocate(usage, rows as u8, contained.element_type())
        {
            let access_type = match usage {
                VpmUsage::PerQpu => MemoryAccessType::VpmPerQpu,
                VpmUsage::Shared => MemoryAccessType::VpmShared,
            };
            let mut info = MemoryInfo::plain(base, access_type);
            info.area = Some(area);
            return info;
        }
    }
    debug!(
        "VPM exhausted, keeping {} in RAM",
        method.local(base).name
    );
    MemoryInfo::plain(base, MemoryAccessType::RamReadWriteVpm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::instruction::Instruction;
    use crate::ir::local::ParameterDecorations;
    use crate::ir::method::method_with_entry_block;
    use crate::ir::types::{TYPE_INT32, TYPE_INT8};
    use crate::ir::value::INT_ONE;

    #[test]
    fn read_only_global_parameters_take_the_tmu_path() {
        let mut method = method_with_entry_block("mem");
        let ptr_type = DataType::pointer(TYPE_INT32, AddressSpace::Global);
        let a = method.add_parameter("a", ptr_type.clone(), ParameterDecorations::empty());
        let dest = method.add_new_local(TYPE_INT32, "%v");
        let a_value = Value::local(a.clone(), ptr_type);
        method.append_to_end(Instruction::memory(
            MemoryOp::Read,
            dest,
            a_value,
            INT_ONE,
            false,
        ));
        let info = determine_memory_access(&mut method).unwrap();
        let info = info.info(a.id).unwrap();
        assert_eq!(info.access_type, MemoryAccessType::RamLoadTmu);
        assert_eq!(info.tmu, Some(Tmu::Tmu1));
    }

    #[test]
    fn written_global_parameters_use_dma() {
        let mut method = method_with_entry_block("mem");
        let ptr_type = DataType::pointer(TYPE_INT32, AddressSpace::Global);
        let out = method.add_parameter("out", ptr_type.clone(), ParameterDecorations::empty());
        let value = method.add_new_local(TYPE_INT32, "%v");
        let out_value = Value::local(out.clone(), ptr_type);
        method.append_to_end(Instruction::memory(
            MemoryOp::Write,
            out_value,
            value,
            INT_ONE,
            false,
        ));
        let info = determine_memory_access(&mut method).unwrap();
        assert_eq!(
            info.info(out.id).unwrap().access_type,
            MemoryAccessType::RamReadWriteVpm
        );
    }

    #[test]
    fn small_stack_allocations_lower_to_registers() {
        let mut method = method_with_entry_block("mem");
        let array = DataType::array(TYPE_INT32, 4);
        let ptr = DataType::pointer(array.clone(), AddressSpace::Private);
        let alloc = method.add_stack_allocation("%arr", ptr.clone(), 16, 4);
        let dest = method.add_new_local(TYPE_INT32, "%v");
        let addr = Value::local(alloc.clone(), ptr);
        method.append_to_end(Instruction::memory(
            MemoryOp::Read,
            dest,
            addr,
            INT_ONE,
            false,
        ));
        let info = determine_memory_access(&mut method).unwrap();
        let info = info.info(alloc.id).unwrap();
        assert_eq!(info.access_type, MemoryAccessType::QpuRegisterReadWrite);
        assert_eq!(
            info.converted_register_type,
            Some(TYPE_INT32.to_vector_type(4))
        );
        assert!(info.mapped_register.is_some());
    }

    #[test]
    fn large_stack_allocations_move_to_vpm() {
        let mut method = method_with_entry_block("mem");
        let array = DataType::array(TYPE_INT8, 256);
        let ptr = DataType::pointer(array, AddressSpace::Private);
        let alloc = method.add_stack_allocation("%buf", ptr.clone(), 256, 4);
        let dest = method.add_new_local(TYPE_INT8, "%v");
        let addr = Value::local(alloc.clone(), ptr);
        method.append_to_end(Instruction::memory(
            MemoryOp::Read,
            dest,
            addr,
            INT_ONE,
            false,
        ));
        let info = determine_memory_access(&mut method).unwrap();
        assert_eq!(
            info.info(alloc.id).unwrap().access_type,
            MemoryAccessType::VpmPerQpu
        );
    }
}
