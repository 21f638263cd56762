//! Values flowing through the IR.
//!
//! A [`Value`] is a cheap-to-copy tagged union of literal word, 6-bit small
//! immediate, hardware register, reference to a local or undefined content,
//! always paired with its [`DataType`].

use std::fmt;
use std::sync::Arc;

use super::local::LocalId;
use super::types::{DataType, TYPE_BOOL, TYPE_INT32, TYPE_INT8, TYPE_UNKNOWN};

/// A 32-bit literal word. The interpretation (signed, unsigned, float, bool)
/// is determined by the type of the containing [`Value`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Literal(pub u32);

impl Literal {
    pub fn from_signed(value: i32) -> Self {
        Literal(value as u32)
    }

    pub fn from_bool(value: bool) -> Self {
        Literal(u32::from(value))
    }

    pub fn from_float(value: f32) -> Self {
        Literal(value.to_bits())
    }

    pub fn signed_int(self) -> i32 {
        self.0 as i32
    }

    pub fn unsigned_int(self) -> u32 {
        self.0
    }

    pub fn real(self) -> f32 {
        f32::from_bits(self.0)
    }

    pub fn is_true(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Debug for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Literal({})", self.signed_int())
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.signed_int())
    }
}

/// The 6-bit encoding of a fixed set of constants usable directly as ALU
/// operand B instead of a register address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SmallImmediate(pub u8);

/// Vector rotation by the value in r5.
pub const VECTOR_ROTATE_R5: SmallImmediate = SmallImmediate(48);

impl SmallImmediate {
    /// The encoding for an integer in [-16, 15], if any.
    pub fn from_integer(value: i32) -> Option<SmallImmediate> {
        match value {
            0..=15 => Some(SmallImmediate(value as u8)),
            -16..=-1 => Some(SmallImmediate((value + 32) as u8)),
            _ => None,
        }
    }

    /// The encoding for one of the power-of-two float constants, if any.
    pub fn from_float(value: f32) -> Option<SmallImmediate> {
        (32..48).map(SmallImmediate).find(|imm| {
            imm.to_literal()
                .is_some_and(|lit| lit.real().to_bits() == value.to_bits())
        })
    }

    /// The encoding for a vector rotation by a constant offset in [1, 15].
    pub fn from_rotation_offset(offset: u8) -> Option<SmallImmediate> {
        if (1..=15).contains(&offset) {
            Some(SmallImmediate(48 + offset))
        } else {
            None
        }
    }

    /// The literal this immediate loads, `None` for rotation codes.
    pub fn to_literal(self) -> Option<Literal> {
        match self.0 {
            0..=15 => Some(Literal(u32::from(self.0))),
            16..=31 => Some(Literal::from_signed(i32::from(self.0) - 32)),
            // 1.0, 2.0, ..., 128.0
            32..=39 => Some(Literal::from_float(
                (1u32 << (self.0 - 32)) as f32,
            )),
            // 1/256, 1/128, ..., 1/2
            40..=47 => Some(Literal::from_float(
                1.0 / (1u64 << (48 - self.0)) as f32,
            )),
            _ => None,
        }
    }

    pub fn rotation_offset(self) -> Option<u8> {
        match self.0 {
            49..=63 => Some(self.0 - 48),
            _ => None,
        }
    }
}

impl fmt::Display for SmallImmediate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(lit) = self.to_literal() {
            write!(f, "{lit}")
        } else if *self == VECTOR_ROTATE_R5 {
            f.write_str("<<r5")
        } else {
            write!(f, "<<{}", self.0 - 48)
        }
    }
}

/// The register file a hardware register lives in.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum RegisterFile {
    PhysicalA,
    PhysicalB,
    /// Addressable via either physical file.
    PhysicalAny,
    Accumulator,
}

/// A hardware register, addressed by file and number.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Register {
    pub file: RegisterFile,
    pub num: u8,
}

impl Register {
    pub const fn new(file: RegisterFile, num: u8) -> Self {
        Register { file, num }
    }

    pub fn is_accumulator(self) -> bool {
        self.file == RegisterFile::Accumulator
    }

    /// Peripheral (non general-purpose) register.
    pub fn is_special(self) -> bool {
        self.num >= 32 || self.is_accumulator()
    }

    pub fn is_vertex_pipeline_memory(self) -> bool {
        (48..=50).contains(&self.num) && !self.is_accumulator()
    }

    pub fn is_special_functions_unit(self) -> bool {
        (52..=55).contains(&self.num) && !self.is_accumulator()
    }

    pub fn is_texture_memory_unit(self) -> bool {
        (56..=63).contains(&self.num) && !self.is_accumulator()
    }
}

// Peripheral registers used by the lowering passes. Numbers follow the
// register address map of the VideoCore IV architecture specification.
pub const REG_UNIFORM: Register = Register::new(RegisterFile::PhysicalAny, 32);
pub const REG_SFU_OUT: Register = Register::new(RegisterFile::Accumulator, 36);
pub const REG_TMU_NOSWAP: Register = Register::new(RegisterFile::PhysicalAny, 36);
pub const REG_REPLICATE_ALL: Register = Register::new(RegisterFile::Accumulator, 37);
pub const REG_ACC5: Register = Register::new(RegisterFile::Accumulator, 37);
pub const REG_ELEMENT_NUMBER: Register = Register::new(RegisterFile::PhysicalA, 38);
pub const REG_QPU_NUMBER: Register = Register::new(RegisterFile::PhysicalB, 38);
pub const REG_HOST_INTERRUPT: Register = Register::new(RegisterFile::PhysicalAny, 38);
pub const REG_NOP: Register = Register::new(RegisterFile::PhysicalAny, 39);
pub const REG_VPM_IO: Register = Register::new(RegisterFile::PhysicalAny, 48);
pub const REG_VPM_IN_SETUP: Register = Register::new(RegisterFile::PhysicalA, 49);
pub const REG_VPM_OUT_SETUP: Register = Register::new(RegisterFile::PhysicalB, 49);
pub const REG_VPM_DMA_LOAD_WAIT: Register = Register::new(RegisterFile::PhysicalA, 50);
pub const REG_VPM_DMA_STORE_WAIT: Register = Register::new(RegisterFile::PhysicalB, 50);
pub const REG_VPM_DMA_LOAD_ADDR: Register = Register::new(RegisterFile::PhysicalA, 50);
pub const REG_VPM_DMA_STORE_ADDR: Register = Register::new(RegisterFile::PhysicalB, 50);
pub const REG_MUTEX: Register = Register::new(RegisterFile::PhysicalAny, 51);
pub const REG_TMU0_ADDRESS: Register = Register::new(RegisterFile::PhysicalAny, 56);
pub const REG_TMU1_ADDRESS: Register = Register::new(RegisterFile::PhysicalAny, 60);

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.file, self.num) {
            (RegisterFile::Accumulator, 36) => f.write_str("r4"),
            (RegisterFile::Accumulator, 37) => f.write_str("r5"),
            (RegisterFile::Accumulator, n) => write!(f, "r{}", n - 32),
            (RegisterFile::PhysicalAny, 32) => f.write_str("uniform"),
            (RegisterFile::PhysicalA, 38) => f.write_str("elem_num"),
            (RegisterFile::PhysicalB, 38) => f.write_str("qpu_num"),
            (RegisterFile::PhysicalAny, 38) => f.write_str("irq"),
            (RegisterFile::PhysicalAny, 39) => f.write_str("-"),
            (RegisterFile::PhysicalAny, 36) => f.write_str("tmu_noswap"),
            (RegisterFile::PhysicalAny, 48) => f.write_str("vpm"),
            (RegisterFile::PhysicalA, 49) => f.write_str("vpr_setup"),
            (RegisterFile::PhysicalB, 49) => f.write_str("vpw_setup"),
            (RegisterFile::PhysicalA, 50) => f.write_str("vpm_ld_addr"),
            (RegisterFile::PhysicalB, 50) => f.write_str("vpm_st_addr"),
            (RegisterFile::PhysicalAny, 51) => f.write_str("mutex"),
            (RegisterFile::PhysicalAny, 56) => f.write_str("tmu0s"),
            (RegisterFile::PhysicalAny, 60) => f.write_str("tmu1s"),
            (file, num) => write!(
                f,
                "r{}{}",
                match file {
                    RegisterFile::PhysicalA => "a",
                    RegisterFile::PhysicalB => "b",
                    _ => "",
                },
                num
            ),
        }
    }
}

/// Reference to a [`super::local::Local`]; carries the name purely for
/// diagnostics, identity is the id.
#[derive(Clone, Debug)]
pub struct LocalRef {
    pub id: LocalId,
    pub name: Arc<str>,
}

impl PartialEq for LocalRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for LocalRef {}

impl std::hash::Hash for LocalRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// The content variants of a [`Value`].
#[derive(Clone, PartialEq, Debug)]
pub enum ValueContent {
    Literal(Literal),
    SmallImmediate(SmallImmediate),
    Register(Register),
    Local(LocalRef),
    /// Per-element literal contents of a whole SIMD vector.
    Vector(Arc<Vec<Literal>>),
    Undefined,
}

/// A typed value.
#[derive(Clone, PartialEq, Debug)]
pub struct Value {
    pub content: ValueContent,
    pub data_type: DataType,
}

pub const UNDEFINED_VALUE: Value = Value {
    content: ValueContent::Undefined,
    data_type: TYPE_UNKNOWN,
};

impl Value {
    pub fn literal(literal: Literal, data_type: DataType) -> Self {
        Value {
            content: ValueContent::Literal(literal),
            data_type,
        }
    }

    pub fn int(value: i32) -> Self {
        Value::literal(Literal::from_signed(value), TYPE_INT32)
    }

    pub fn small_immediate(imm: SmallImmediate, data_type: DataType) -> Self {
        Value {
            content: ValueContent::SmallImmediate(imm),
            data_type,
        }
    }

    pub fn register(register: Register, data_type: DataType) -> Self {
        Value {
            content: ValueContent::Register(register),
            data_type,
        }
    }

    pub fn local(local: LocalRef, data_type: DataType) -> Self {
        Value {
            content: ValueContent::Local(local),
            data_type,
        }
    }

    pub fn vector(elements: Vec<Literal>, data_type: DataType) -> Self {
        Value {
            content: ValueContent::Vector(Arc::new(elements)),
            data_type,
        }
    }

    pub fn undefined(data_type: DataType) -> Self {
        Value {
            content: ValueContent::Undefined,
            data_type,
        }
    }

    pub fn check_local(&self) -> Option<&LocalRef> {
        match &self.content {
            ValueContent::Local(local) => Some(local),
            _ => None,
        }
    }

    pub fn local_id(&self) -> Option<LocalId> {
        self.check_local().map(|l| l.id)
    }

    pub fn check_register(&self) -> Option<Register> {
        match &self.content {
            ValueContent::Register(reg) => Some(*reg),
            _ => None,
        }
    }

    pub fn check_vector(&self) -> Option<&Arc<Vec<Literal>>> {
        match &self.content {
            ValueContent::Vector(elements) => Some(elements),
            _ => None,
        }
    }

    /// The literal content, also resolving literal-loading small immediates
    /// and vectors with identical elements.
    pub fn literal_value(&self) -> Option<Literal> {
        match &self.content {
            ValueContent::Literal(lit) => Some(*lit),
            ValueContent::SmallImmediate(imm) => imm.to_literal(),
            ValueContent::Vector(elements) => {
                let first = *elements.first()?;
                elements.iter().all(|e| *e == first).then_some(first)
            }
            _ => None,
        }
    }

    pub fn is_literal_value(&self) -> bool {
        self.literal_value().is_some()
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self.content, ValueContent::Undefined)
    }

    pub fn has_register(&self, register: Register) -> bool {
        self.check_register() == Some(register)
    }

    pub fn has_literal(&self, literal: Literal) -> bool {
        self.literal_value() == Some(literal)
    }

    pub fn has_local(&self, id: LocalId) -> bool {
        self.local_id() == Some(id)
    }
}

pub const INT_ZERO: Value = Value {
    content: ValueContent::Literal(Literal(0)),
    data_type: TYPE_INT8,
};
pub const INT_ONE: Value = Value {
    content: ValueContent::Literal(Literal(1)),
    data_type: TYPE_INT8,
};
pub const BOOL_TRUE: Value = Value {
    content: ValueContent::Literal(Literal(1)),
    data_type: TYPE_BOOL,
};
pub const BOOL_FALSE: Value = Value {
    content: ValueContent::Literal(Literal(0)),
    data_type: TYPE_BOOL,
};

/// The per-lane element index (0..15), read from register file A.
pub fn element_number_value() -> Value {
    Value::register(REG_ELEMENT_NUMBER, TYPE_INT8.to_vector_type(16))
}

/// The id of the executing QPU, read from register file B.
pub fn qpu_number_value() -> Value {
    Value::register(REG_QPU_NUMBER, TYPE_INT8)
}

pub fn uniform_value(data_type: DataType) -> Value {
    Value::register(REG_UNIFORM, data_type)
}

pub fn nop_value() -> Value {
    Value::register(REG_NOP, TYPE_UNKNOWN)
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.content {
            ValueContent::Literal(lit) => {
                if self.data_type.is_float_type() {
                    write!(f, "{} ({})", self.data_type, lit.real())
                } else if self.data_type == TYPE_BOOL {
                    write!(f, "bool ({})", lit.is_true())
                } else {
                    write!(f, "{} ({})", self.data_type, lit)
                }
            }
            ValueContent::SmallImmediate(imm) => write!(f, "{} ({})", self.data_type, imm),
            ValueContent::Register(reg) => write!(f, "{} ({})", self.data_type, reg),
            ValueContent::Local(local) => write!(f, "{} {}", self.data_type, local.name),
            ValueContent::Vector(elements) => {
                write!(f, "{} <", self.data_type)?;
                for (i, e) in elements.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{e}")?;
                }
                f.write_str(">")
            }
            ValueContent::Undefined => write!(f, "{} undefined", self.data_type),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_immediate_round_trips_integers() {
        for i in -16..=15 {
            let imm = SmallImmediate::from_integer(i).unwrap();
            assert_eq!(imm.to_literal().unwrap().signed_int(), i);
        }
        assert!(SmallImmediate::from_integer(16).is_none());
        assert!(SmallImmediate::from_integer(-17).is_none());
    }

    #[test]
    fn small_immediate_floats() {
        assert_eq!(SmallImmediate(32).to_literal().unwrap().real(), 1.0);
        assert_eq!(SmallImmediate(39).to_literal().unwrap().real(), 128.0);
        assert_eq!(SmallImmediate(40).to_literal().unwrap().real(), 1.0 / 256.0);
        assert_eq!(SmallImmediate(47).to_literal().unwrap().real(), 0.5);
    }

    #[test]
    fn rotation_codes_carry_no_literal() {
        let rot = SmallImmediate::from_rotation_offset(3).unwrap();
        assert_eq!(rot.to_literal(), None);
        assert_eq!(rot.rotation_offset(), Some(3));
        assert_eq!(VECTOR_ROTATE_R5.rotation_offset(), None);
    }

    #[test]
    fn uniform_vector_literal_value() {
        let v = Value::vector(vec![Literal(7); 16], TYPE_INT32.to_vector_type(16));
        assert_eq!(v.literal_value().unwrap().signed_int(), 7);
        let w = Value::vector(
            vec![Literal(1), Literal(2)],
            TYPE_INT32.to_vector_type(2),
        );
        assert_eq!(w.literal_value(), None);
    }

    #[test]
    fn register_predicates() {
        assert!(REG_TMU0_ADDRESS.is_texture_memory_unit());
        assert!(REG_TMU1_ADDRESS.is_texture_memory_unit());
        assert!(REG_VPM_IO.is_vertex_pipeline_memory());
        assert!(REG_SFU_OUT.is_accumulator());
        assert!(!REG_SFU_OUT.is_texture_memory_unit());
    }
}
