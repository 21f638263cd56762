//! Vertex pipe memory: the on-chip scratchpad shared by all QPUs and the DMA
//! engine.
//!
//! The arena hands out row-aligned areas of the VPM user space to memory
//! locations lowered onto the chip. The setup-word wrappers encode the VPM
//! read/write and DMA load/store configuration registers; field layouts
//! follow the VideoCore IV architecture reference.

use crate::error::{CompileError, CompileResult};
use crate::ir::instruction::{Instruction, InstructionKind, MutexAccess, OpCode};
use crate::ir::method::Method;
use crate::ir::types::{DataType, TYPE_INT32};
use crate::ir::value::{
    qpu_number_value, Literal, Value, REG_VPM_DMA_LOAD_ADDR, REG_VPM_DMA_LOAD_WAIT,
    REG_VPM_DMA_STORE_ADDR, REG_VPM_DMA_STORE_WAIT, REG_VPM_IN_SETUP, REG_VPM_IO,
    REG_VPM_OUT_SETUP,
};
use crate::ir::walker::InstructionWalker;

/// Bytes per VPM row (16 words of 32 bits).
pub const VPM_ROW_BYTES: u32 = 64;
/// Rows of the VPM user share available to the compiler.
pub const VPM_NUM_ROWS: u8 = 64;
/// Rows reserved at the bottom of the user share as DMA staging scratch.
pub const VPM_SCRATCH_ROWS: u8 = 4;

/// Handle of an allocated VPM area.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct VpmAreaId(pub u32);

/// How an area is shared between the four QPUs.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum VpmUsage {
    /// Each QPU owns a distinct row range, addressed by QPU id.
    PerQpu,
    /// One row range for all QPUs, callers guard access with the mutex.
    Shared,
}

/// A row-aligned region of the VPM.
#[derive(Clone, Debug)]
pub struct VpmArea {
    pub id: VpmAreaId,
    pub usage: VpmUsage,
    /// First row of the area (of the first QPU's range for per-QPU areas).
    pub base_row: u8,
    /// Rows per QPU range (per-QPU) or of the whole area (shared).
    pub num_rows: u8,
    pub element_type: DataType,
}

impl VpmArea {
    /// Byte offset of the area base within the VPM, for the given QPU.
    pub fn base_offset(&self, qpu_rows_before: u8) -> u32 {
        u32::from(self.base_row + qpu_rows_before) * VPM_ROW_BYTES
    }

    pub fn byte_size(&self) -> u32 {
        u32::from(self.num_rows) * VPM_ROW_BYTES
    }
}

/// Per-method allocator of VPM rows.
#[derive(Debug)]
pub struct VpmArena {
    areas: Vec<VpmArea>,
    next_row: u8,
}

impl Default for VpmArena {
    fn default() -> Self {
        Self::new()
    }
}

impl VpmArena {
    pub fn new() -> Self {
        VpmArena {
            areas: Vec::new(),
            next_row: VPM_SCRATCH_ROWS,
        }
    }

    pub fn area(&self, id: VpmAreaId) -> &VpmArea {
        &self.areas[id.0 as usize]
    }

    pub fn available_rows(&self) -> u8 {
        VPM_NUM_ROWS - self.next_row
    }

    /// Allocate an area of `num_rows` rows (per QPU for per-QPU usage).
    pub fn allocate(
        &mut self,
        usage: VpmUsage,
        num_rows: u8,
        element_type: DataType,
    ) -> Option<VpmAreaId> {
        let total = match usage {
            VpmUsage::PerQpu => num_rows.checked_mul(4)?,
            VpmUsage::Shared => num_rows,
        };
        if total > self.available_rows() {
            return None;
        }
        let id = VpmAreaId(self.areas.len() as u32);
        self.areas.push(VpmArea {
            id,
            usage,
            base_row: self.next_row,
            num_rows,
            element_type,
        });
        self.next_row += total;
        Some(id)
    }
}

// ---- setup words ------------------------------------------------------

/// VPM generic block read setup (written to the read-setup register).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct VpmReadSetup(pub u32);

impl VpmReadSetup {
    /// 32-bit horizontal vectors starting at the given row.
    pub fn horizontal_words(num: u8, row: u8) -> Self {
        // NUM [23:20], STRIDE [17:12] = 1, HORIZ [11], SIZE [9:8] = 0b10, ADDR [7:0]
        VpmReadSetup(
            (u32::from(num & 0xF) << 20)
                | (1 << 12)
                | (1 << 11)
                | (0b10 << 8)
                | u32::from(row),
        )
    }

    pub fn address(self) -> u8 {
        (self.0 & 0xFF) as u8
    }
}

/// VPM generic block write setup.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct VpmWriteSetup(pub u32);

impl VpmWriteSetup {
    pub fn horizontal_words(row: u8) -> Self {
        // STRIDE [17:12] = 1, HORIZ [11], SIZE [9:8] = 0b10, ADDR [7:0]
        VpmWriteSetup((1 << 12) | (1 << 11) | (0b10 << 8) | u32::from(row))
    }
}

/// DMA load (RAM → VPM) setup word.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DmaLoadSetup(pub u32);

impl DmaLoadSetup {
    /// Load `rows` rows of `row_words` 32-bit words each into the VPM,
    /// starting at the given row.
    pub fn words(rows: u8, row_words: u8, vpm_row: u8) -> Self {
        // ID [31] = 1, MODEW [30:28] = 0 (32-bit), MPITCH [27:24] = 3 (8 bytes * 2^3),
        // ROWLEN [23:20] (0 => 16), NROWS [19:16] (0 => 16), VPITCH [15:12] = 1,
        // VERT [11] = 0, ADDRXY [10:0] = Y address (row)
        DmaLoadSetup(
            (1 << 31)
                | (3 << 24)
                | (u32::from(row_words & 0xF) << 20)
                | (u32::from(rows & 0xF) << 16)
                | (1 << 12)
                | (u32::from(vpm_row) << 4),
        )
    }

    pub fn is_dma_setup(self) -> bool {
        self.0 >> 31 == 1
    }

    /// The length of one transferred row in words (0 encodes 16).
    pub fn row_length(self) -> u8 {
        ((self.0 >> 20) & 0xF) as u8
    }

    pub fn set_row_length(&mut self, row_words: u8) {
        self.0 = (self.0 & !(0xF << 20)) | (u32::from(row_words & 0xF) << 20);
    }
}

/// DMA store (VPM → RAM) setup word.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DmaStoreSetup(pub u32);

impl DmaStoreSetup {
    /// Store `units` rows of `depth` 32-bit words each from the VPM.
    pub fn words(units: u8, depth: u8, vpm_row: u8) -> Self {
        // ID [31:30] = 0b10, UNITS [29:23], DEPTH [22:16], HORIZ [13],
        // VPMBASE [12:3] in (Y, X) block addresses; rows are addressed
        // with X = 0
        DmaStoreSetup(
            (0b10 << 30)
                | (u32::from(units & 0x7F) << 23)
                | (u32::from(depth & 0x7F) << 16)
                | (1 << 13)
                | (u32::from(vpm_row) << 7),
        )
    }

    pub fn is_dma_setup(self) -> bool {
        self.0 >> 30 == 0b10
    }

    pub fn depth(self) -> u8 {
        ((self.0 >> 16) & 0x7F) as u8
    }

    pub fn set_depth(&mut self, depth: u8) {
        self.0 = (self.0 & !(0x7F << 16)) | (u32::from(depth & 0x7F) << 16);
    }

    /// Bit position of the UNITS field, for runtime-computed row counts.
    pub const UNITS_SHIFT: u8 = 23;
}

/// Choose the widest 32-bit row shape whose total size divides `num_bytes`.
/// Returns the row type and the number of rows.
pub fn get_best_vector_size(num_bytes: u32) -> (DataType, u32) {
    for width in [16u32, 8, 4, 2, 1] {
        let row_bytes = width * 4;
        if num_bytes % row_bytes == 0 {
            return (
                TYPE_INT32.to_vector_type(width as u8),
                num_bytes / row_bytes,
            );
        }
    }
    // fall back to single bytes
    (crate::ir::types::TYPE_INT8, num_bytes)
}

// ---- access sequences -------------------------------------------------

fn emit_setup(
    method: &mut Method,
    mut it: InstructionWalker,
    setup_word: u32,
    setup_register: crate::ir::value::Register,
    in_area_offset: &Value,
) -> InstructionWalker {
    let setup_value = Value::register(setup_register, TYPE_INT32);
    if let Some(offset) = in_area_offset.literal_value() {
        // fold literal offsets into the row address of the setup word
        let rows = offset.unsigned_int() / VPM_ROW_BYTES;
        it = method.emplace(
            it,
            Instruction::load_immediate(setup_value, Literal(setup_word + rows)),
        );
        return it.next_in_block(method);
    }
    // dynamic offset: row index = offset / 64, added onto the base setup word
    let row_offset = method.add_new_local(TYPE_INT32, "%vpm_row");
    it = method.emplace(
        it,
        Instruction::op(
            OpCode::Shr,
            row_offset.clone(),
            in_area_offset.clone(),
            Value::int(VPM_ROW_BYTES.trailing_zeros() as i32),
        ),
    );
    it = it.next_in_block(method);
    let base = method.add_new_local(TYPE_INT32, "%vpm_setup");
    it = method.emplace(
        it,
        Instruction::load_immediate(base.clone(), Literal(setup_word)),
    );
    it = it.next_in_block(method);
    it = method.emplace(
        it,
        Instruction::op(OpCode::Add, setup_value, base, row_offset),
    );
    it.next_in_block(method)
}

fn lock_if(method: &mut Method, it: InstructionWalker, guard: bool) -> InstructionWalker {
    if guard {
        let it = method.emplace(it, Instruction::mutex(MutexAccess::Lock));
        it.next_in_block(method)
    } else {
        it
    }
}

fn release_if(method: &mut Method, it: InstructionWalker, guard: bool) -> InstructionWalker {
    if guard {
        let it = method.emplace(it, Instruction::mutex(MutexAccess::Release));
        it.next_in_block(method)
    } else {
        it
    }
}

/// Byte offset of the area base for the executing QPU: per-QPU areas address
/// their row range by QPU id, shared areas start at the area base.
fn emit_area_base_offset(
    method: &mut Method,
    mut it: InstructionWalker,
    area: &VpmArea,
    in_area_offset: &Value,
) -> (InstructionWalker, Value) {
    let base = u32::from(area.base_row) * VPM_ROW_BYTES;
    match area.usage {
        VpmUsage::Shared => {
            if let Some(lit) = in_area_offset.literal_value() {
                (it, Value::int((base + lit.unsigned_int()) as i32))
            } else {
                let total = method.add_new_local(TYPE_INT32, "%vpm_offset");
                it = method.emplace(
                    it,
                    Instruction::op(
                        OpCode::Add,
                        total.clone(),
                        in_area_offset.clone(),
                        Value::int(base as i32),
                    ),
                );
                (it.next_in_block(method), total)
            }
        }
        VpmUsage::PerQpu => {
            // base + qpu_num * rows_per_qpu * 64 + offset
            let qpu_stride = u32::from(area.num_rows) * VPM_ROW_BYTES;
            let qpu_offset = method.add_new_local(TYPE_INT32, "%vpm_qpu_offset");
            it = method.emplace(
                it,
                Instruction::op(
                    OpCode::Mul24,
                    qpu_offset.clone(),
                    qpu_number_value(),
                    Value::int(qpu_stride as i32),
                ),
            );
            it = it.next_in_block(method);
            let total = method.add_new_local(TYPE_INT32, "%vpm_offset");
            it = method.emplace(
                it,
                Instruction::op(
                    OpCode::Add,
                    total.clone(),
                    qpu_offset,
                    match in_area_offset.literal_value() {
                        Some(lit) => Value::int((base + lit.unsigned_int()) as i32),
                        None => in_area_offset.clone(),
                    },
                ),
            );
            it = it.next_in_block(method);
            if in_area_offset.literal_value().is_none() && base != 0 {
                let rebased = method.add_new_local(TYPE_INT32, "%vpm_offset");
                it = method.emplace(
                    it,
                    Instruction::op(
                        OpCode::Add,
                        rebased.clone(),
                        total.clone(),
                        Value::int(base as i32),
                    ),
                );
                return (it.next_in_block(method), rebased);
            }
            (it, total)
        }
    }
}

/// Read one vector from the VPM area into `dest`.
pub fn insert_read_vpm(
    method: &mut Method,
    mut it: InstructionWalker,
    dest: &Value,
    area_id: VpmAreaId,
    guard: bool,
    in_area_offset: &Value,
) -> InstructionWalker {
    let area = method.vpm.area(area_id).clone();
    it = lock_if(method, it, guard);
    let (mut it, offset) = emit_area_base_offset(method, it, &area, in_area_offset);
    let setup = VpmReadSetup::horizontal_words(1, 0);
    it = emit_setup(method, it, setup.0, REG_VPM_IN_SETUP, &offset);
    it = method.emplace(
        it,
        Instruction::mov(
            dest.clone(),
            Value::register(REG_VPM_IO, dest.data_type.clone()),
        ),
    );
    it = it.next_in_block(method);
    release_if(method, it, guard)
}

/// Write one vector from `src` into the VPM area.
pub fn insert_write_vpm(
    method: &mut Method,
    mut it: InstructionWalker,
    src: &Value,
    area_id: VpmAreaId,
    guard: bool,
    in_area_offset: &Value,
) -> InstructionWalker {
    let area = method.vpm.area(area_id).clone();
    it = lock_if(method, it, guard);
    let (mut it, offset) = emit_area_base_offset(method, it, &area, in_area_offset);
    let setup = VpmWriteSetup::horizontal_words(0);
    it = emit_setup(method, it, setup.0, REG_VPM_OUT_SETUP, &offset);
    it = method.emplace(
        it,
        Instruction::mov(
            Value::register(REG_VPM_IO, src.data_type.clone()),
            src.clone(),
        ),
    );
    it = it.next_in_block(method);
    release_if(method, it, guard)
}

/// Write one vector into the DMA staging scratch rows.
pub fn insert_write_scratch(
    method: &mut Method,
    mut it: InstructionWalker,
    src: &Value,
) -> InstructionWalker {
    let setup = VpmWriteSetup::horizontal_words(0);
    it = emit_setup(method, it, setup.0, REG_VPM_OUT_SETUP, &Value::int(0));
    it = method.emplace(
        it,
        Instruction::mov(
            Value::register(REG_VPM_IO, src.data_type.clone()),
            src.clone(),
        ),
    );
    it.next_in_block(method)
}

fn words_per_row(row_type: &DataType) -> u8 {
    ((row_type.in_memory_width() + 3) / 4).min(16) as u8
}

/// DMA one or more rows from RAM into the VPM, starting at `vpm_row`.
pub fn insert_dma_load(
    method: &mut Method,
    mut it: InstructionWalker,
    ram_address: &Value,
    row_type: &DataType,
    num_rows: u32,
    vpm_row: u8,
) -> InstructionWalker {
    let setup = DmaLoadSetup::words((num_rows & 0xF) as u8, words_per_row(row_type), vpm_row);
    let setup_value = Value::register(REG_VPM_IN_SETUP, TYPE_INT32);
    it = method.emplace(
        it,
        Instruction::load_immediate(setup_value, Literal(setup.0)),
    );
    it = it.next_in_block(method);
    it = method.emplace(
        it,
        Instruction::mov(
            Value::register(REG_VPM_DMA_LOAD_ADDR, TYPE_INT32),
            ram_address.clone(),
        ),
    );
    it = it.next_in_block(method);
    it = method.emplace(
        it,
        Instruction::mov(
            crate::ir::value::nop_value(),
            Value::register(REG_VPM_DMA_LOAD_WAIT, TYPE_INT32),
        ),
    );
    it.next_in_block(method)
}

/// DMA one or more rows from the VPM (starting at `vpm_row`) into RAM.
pub fn insert_dma_store(
    method: &mut Method,
    mut it: InstructionWalker,
    ram_address: &Value,
    row_type: &DataType,
    num_rows: u32,
    vpm_row: u8,
) -> InstructionWalker {
    let setup = DmaStoreSetup::words((num_rows & 0x7F) as u8, words_per_row(row_type), vpm_row);
    let setup_value = Value::register(REG_VPM_OUT_SETUP, TYPE_INT32);
    it = method.emplace(
        it,
        Instruction::load_immediate(setup_value, Literal(setup.0)),
    );
    it = it.next_in_block(method);
    it = method.emplace(
        it,
        Instruction::mov(
            Value::register(REG_VPM_DMA_STORE_ADDR, TYPE_INT32),
            ram_address.clone(),
        ),
    );
    it = it.next_in_block(method);
    it = method.emplace(
        it,
        Instruction::mov(
            crate::ir::value::nop_value(),
            Value::register(REG_VPM_DMA_STORE_WAIT, TYPE_INT32),
        ),
    );
    it.next_in_block(method)
}

/// DMA store with the row count only known at run time: the UNITS field of
/// the setup word is computed from the count. Counts beyond the 7-bit field
/// wrap in hardware; the analysis rejects larger static extents beforehand.
pub fn insert_dma_store_dynamic(
    method: &mut Method,
    mut it: InstructionWalker,
    ram_address: &Value,
    row_type: &DataType,
    num_rows: &Value,
    vpm_row: u8,
) -> InstructionWalker {
    let base = DmaStoreSetup::words(0, words_per_row(row_type), vpm_row);
    let shifted = method.add_new_local(TYPE_INT32, "%dma_units");
    it = method.emplace(
        it,
        Instruction::op(
            OpCode::Shl,
            shifted.clone(),
            num_rows.clone(),
            Value::int(i32::from(DmaStoreSetup::UNITS_SHIFT)),
        ),
    );
    it = it.next_in_block(method);
    let base_value = method.add_new_local(TYPE_INT32, "%dma_setup");
    it = method.emplace(
        it,
        Instruction::load_immediate(base_value.clone(), Literal(base.0)),
    );
    it = it.next_in_block(method);
    it = method.emplace(
        it,
        Instruction::op(
            OpCode::Or,
            Value::register(REG_VPM_OUT_SETUP, TYPE_INT32),
            base_value,
            shifted,
        ),
    );
    it = it.next_in_block(method);
    it = method.emplace(
        it,
        Instruction::mov(
            Value::register(REG_VPM_DMA_STORE_ADDR, TYPE_INT32),
            ram_address.clone(),
        ),
    );
    it = it.next_in_block(method);
    it = method.emplace(
        it,
        Instruction::mov(
            crate::ir::value::nop_value(),
            Value::register(REG_VPM_DMA_STORE_WAIT, TYPE_INT32),
        ),
    );
    it.next_in_block(method)
}

/// Copy `num_bytes` from RAM to RAM, staging through the scratch rows.
pub fn insert_copy_ram(
    method: &mut Method,
    mut it: InstructionWalker,
    dest_address: &Value,
    src_address: &Value,
    num_bytes: u32,
    guard: bool,
) -> CompileResult<InstructionWalker> {
    if num_bytes % 4 != 0 {
        return Err(CompileError::normalization_general(format!(
            "byte-granular RAM copy of {num_bytes} bytes is not supported"
        )));
    }
    it = lock_if(method, it, guard);
    let (row_type, total_rows) = get_best_vector_size(num_bytes);
    let row_bytes = row_type.in_memory_width();
    let mut copied_rows = 0u32;
    while copied_rows < total_rows {
        let chunk = (total_rows - copied_rows).min(u32::from(VPM_SCRATCH_ROWS));
        let offset = copied_rows * row_bytes;
        let src = offset_address(method, &mut it, src_address, offset);
        let dest = offset_address(method, &mut it, dest_address, offset);
        it = insert_dma_load(method, it, &src, &row_type, chunk, 0);
        it = insert_dma_store(method, it, &dest, &row_type, chunk, 0);
        copied_rows += chunk;
    }
    Ok(release_if(method, it, guard))
}

/// Copy a run-time number of entries from RAM to RAM through the scratch
/// rows in a single runtime-counted transfer pair.
pub fn insert_copy_ram_dynamic(
    method: &mut Method,
    mut it: InstructionWalker,
    dest_address: &Value,
    src_address: &Value,
    row_type: &DataType,
    num_rows: &Value,
    guard: bool,
) -> InstructionWalker {
    it = lock_if(method, it, guard);
    // load side: NROWS is 4 bits, the count is masked into the field
    let base = DmaLoadSetup::words(0, words_per_row(row_type), 0);
    let masked = method.add_new_local(TYPE_INT32, "%dma_rows");
    it = method.emplace(
        it,
        Instruction::op(
            OpCode::And,
            masked.clone(),
            num_rows.clone(),
            Value::int(0xF),
        ),
    );
    it = it.next_in_block(method);
    let shifted = method.add_new_local(TYPE_INT32, "%dma_rows");
    it = method.emplace(
        it,
        Instruction::op(OpCode::Shl, shifted.clone(), masked, Value::int(16)),
    );
    it = it.next_in_block(method);
    let base_value = method.add_new_local(TYPE_INT32, "%dma_setup");
    it = method.emplace(
        it,
        Instruction::load_immediate(base_value.clone(), Literal(base.0)),
    );
    it = it.next_in_block(method);
    it = method.emplace(
        it,
        Instruction::op(
            OpCode::Or,
            Value::register(REG_VPM_IN_SETUP, TYPE_INT32),
            base_value,
            shifted,
        ),
    );
    it = it.next_in_block(method);
    it = method.emplace(
        it,
        Instruction::mov(
            Value::register(REG_VPM_DMA_LOAD_ADDR, TYPE_INT32),
            src_address.clone(),
        ),
    );
    it = it.next_in_block(method);
    it = method.emplace(
        it,
        Instruction::mov(
            crate::ir::value::nop_value(),
            Value::register(REG_VPM_DMA_LOAD_WAIT, TYPE_INT32),
        ),
    );
    it = it.next_in_block(method);
    it = insert_dma_store_dynamic(method, it, dest_address, row_type, num_rows, 0);
    release_if(method, it, guard)
}

fn offset_address(
    method: &mut Method,
    it: &mut InstructionWalker,
    address: &Value,
    offset: u32,
) -> Value {
    if offset == 0 {
        return address.clone();
    }
    let out = method.add_new_local(address.data_type.clone(), "%addr_offset");
    *it = method.emplace(
        *it,
        Instruction::op(
            OpCode::Add,
            out.clone(),
            address.clone(),
            Value::int(offset as i32),
        ),
    );
    *it = it.next_in_block(method);
    out
}

/// Whether the instruction writes one of the VPM setup registers with a DMA
/// setup word (used by the vectorizer to patch transfer shapes).
pub fn dma_setup_kind(inst: &Instruction) -> Option<DmaSetupKind> {
    let immediate = match &inst.kind {
        InstructionKind::LoadImmediate { immediate } => *immediate,
        _ => return None,
    };
    if inst.writes_register(REG_VPM_OUT_SETUP) && DmaStoreSetup(immediate.0).is_dma_setup() {
        Some(DmaSetupKind::Store(DmaStoreSetup(immediate.0)))
    } else if inst.writes_register(REG_VPM_IN_SETUP) && DmaLoadSetup(immediate.0).is_dma_setup() {
        Some(DmaSetupKind::Load(DmaLoadSetup(immediate.0)))
    } else {
        None
    }
}

#[derive(Clone, Copy, Debug)]
pub enum DmaSetupKind {
    Load(DmaLoadSetup),
    Store(DmaStoreSetup),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::types::TYPE_INT8;

    #[test]
    fn arena_allocates_disjoint_rows() {
        let mut arena = VpmArena::new();
        let a = arena
            .allocate(VpmUsage::Shared, 2, TYPE_INT32.to_vector_type(16))
            .unwrap();
        let b = arena
            .allocate(VpmUsage::PerQpu, 1, TYPE_INT32.to_vector_type(16))
            .unwrap();
        let area_a = arena.area(a);
        let area_b = arena.area(b);
        assert_eq!(area_a.base_row, VPM_SCRATCH_ROWS);
        assert_eq!(area_b.base_row, VPM_SCRATCH_ROWS + 2);
        // per-QPU areas occupy one range per QPU
        assert_eq!(arena.available_rows(), VPM_NUM_ROWS - VPM_SCRATCH_ROWS - 2 - 4);
    }

    #[test]
    fn arena_rejects_overflow() {
        let mut arena = VpmArena::new();
        assert!(arena
            .allocate(VpmUsage::Shared, VPM_NUM_ROWS, TYPE_INT32)
            .is_none());
    }

    #[test]
    fn dma_store_depth_round_trips() {
        let mut setup = DmaStoreSetup::words(4, 16, 0);
        assert!(setup.is_dma_setup());
        assert_eq!(setup.depth(), 16);
        setup.set_depth(32);
        assert_eq!(setup.depth(), 32);
    }

    #[test]
    fn dma_load_row_length_round_trips() {
        let mut setup = DmaLoadSetup::words(1, 4, 0);
        assert!(setup.is_dma_setup());
        assert_eq!(setup.row_length(), 4);
        setup.set_row_length(8);
        assert_eq!(setup.row_length(), 8);
        // 16 words encode as 0
        setup.set_row_length(16);
        assert_eq!(setup.row_length(), 0);
    }

    #[test]
    fn best_vector_size_prefers_wide_rows() {
        assert_eq!(get_best_vector_size(64), (TYPE_INT32.to_vector_type(16), 1));
        assert_eq!(get_best_vector_size(128), (TYPE_INT32.to_vector_type(16), 2));
        assert_eq!(get_best_vector_size(24), (TYPE_INT32.to_vector_type(2), 3));
        assert_eq!(get_best_vector_size(3), (TYPE_INT8, 3));
    }
}
