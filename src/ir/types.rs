//! Data types of IR values.
//!
//! A type is a scalar bit-width with a SIMD vector width, optionally wrapped
//! in a pointer (carrying its address space) or an aggregate. Complex type
//! payloads are interned process-wide so deeply nested types stay cheap to
//! clone; equality is always componentwise.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

/// The number of SIMD lanes of one QPU.
pub const NATIVE_VECTOR_SIZE: u8 = 16;

/// OpenCL address space of a pointed-to memory location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressSpace {
    Private,
    Local,
    Global,
    Constant,
    Generic,
}

impl fmt::Display for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AddressSpace::Private => "__private",
            AddressSpace::Local => "__local",
            AddressSpace::Global => "__global",
            AddressSpace::Constant => "__constant",
            AddressSpace::Generic => "__generic",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PointerInfo {
    pub element_type: DataType,
    pub address_space: AddressSpace,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArrayInfo {
    pub element_type: DataType,
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StructInfo {
    pub name: String,
    pub fields: Vec<DataType>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum TypeKind {
    /// Scalar or native vector type.
    Simple {
        scalar_bits: u8,
        vector_width: u8,
        float: bool,
    },
    Pointer(Arc<PointerInfo>),
    Array(Arc<ArrayInfo>),
    Struct(Arc<StructInfo>),
    /// Branch target, only valid for label locals.
    Label,
    /// Type not (yet) known.
    Unknown,
}

/// The data type of a [`crate::ir::Value`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DataType {
    kind: TypeKind,
}

pub const TYPE_UNKNOWN: DataType = DataType {
    kind: TypeKind::Unknown,
};
pub const TYPE_LABEL: DataType = DataType {
    kind: TypeKind::Label,
};
pub const TYPE_BOOL: DataType = DataType::scalar(1, false);
pub const TYPE_INT8: DataType = DataType::scalar(8, false);
pub const TYPE_INT16: DataType = DataType::scalar(16, false);
pub const TYPE_INT32: DataType = DataType::scalar(32, false);
pub const TYPE_HALF: DataType = DataType::scalar(16, true);
pub const TYPE_FLOAT: DataType = DataType::scalar(32, true);

fn pointer_cache() -> &'static Mutex<HashMap<PointerInfo, Arc<PointerInfo>>> {
    static CACHE: OnceLock<Mutex<HashMap<PointerInfo, Arc<PointerInfo>>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn array_cache() -> &'static Mutex<HashMap<ArrayInfo, Arc<ArrayInfo>>> {
    static CACHE: OnceLock<Mutex<HashMap<ArrayInfo, Arc<ArrayInfo>>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn struct_cache() -> &'static Mutex<HashMap<StructInfo, Arc<StructInfo>>> {
    static CACHE: OnceLock<Mutex<HashMap<StructInfo, Arc<StructInfo>>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

impl DataType {
    pub const fn scalar(bits: u8, float: bool) -> Self {
        DataType {
            kind: TypeKind::Simple {
                scalar_bits: bits,
                vector_width: 1,
                float,
            },
        }
    }

    pub const fn vector(bits: u8, width: u8, float: bool) -> Self {
        DataType {
            kind: TypeKind::Simple {
                scalar_bits: bits,
                vector_width: width,
                float,
            },
        }
    }

    pub fn pointer(element_type: DataType, address_space: AddressSpace) -> Self {
        let info = PointerInfo {
            element_type,
            address_space,
        };
        let mut cache = pointer_cache().lock().unwrap();
        let arc = cache
            .entry(info.clone())
            .or_insert_with(|| Arc::new(info))
            .clone();
        DataType {
            kind: TypeKind::Pointer(arc),
        }
    }

    pub fn array(element_type: DataType, size: u32) -> Self {
        let info = ArrayInfo { element_type, size };
        let mut cache = array_cache().lock().unwrap();
        let arc = cache
            .entry(info.clone())
            .or_insert_with(|| Arc::new(info))
            .clone();
        DataType {
            kind: TypeKind::Array(arc),
        }
    }

    pub fn structure(name: impl Into<String>, fields: Vec<DataType>) -> Self {
        let info = StructInfo {
            name: name.into(),
            fields,
        };
        let mut cache = struct_cache().lock().unwrap();
        let arc = cache
            .entry(info.clone())
            .or_insert_with(|| Arc::new(info))
            .clone();
        DataType {
            kind: TypeKind::Struct(arc),
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.kind == TypeKind::Unknown
    }

    pub fn is_label(&self) -> bool {
        self.kind == TypeKind::Label
    }

    pub fn is_simple(&self) -> bool {
        matches!(self.kind, TypeKind::Simple { .. })
    }

    pub fn is_scalar_type(&self) -> bool {
        matches!(self.kind, TypeKind::Simple { vector_width: 1, .. })
    }

    pub fn is_vector_type(&self) -> bool {
        matches!(
            self.kind,
            TypeKind::Simple { vector_width, .. } if vector_width > 1
        )
    }

    pub fn is_float_type(&self) -> bool {
        matches!(self.kind, TypeKind::Simple { float: true, .. })
    }

    pub fn pointer_info(&self) -> Option<&PointerInfo> {
        match &self.kind {
            TypeKind::Pointer(info) => Some(info),
            _ => None,
        }
    }

    pub fn array_info(&self) -> Option<&ArrayInfo> {
        match &self.kind {
            TypeKind::Array(info) => Some(info),
            _ => None,
        }
    }

    pub fn struct_info(&self) -> Option<&StructInfo> {
        match &self.kind {
            TypeKind::Struct(info) => Some(info),
            _ => None,
        }
    }

    /// The bit-width of a single element, 32 for pointers.
    pub fn scalar_bit_count(&self) -> u8 {
        match &self.kind {
            TypeKind::Simple { scalar_bits, .. } => *scalar_bits,
            // pointers are 32-bit addresses on this device
            TypeKind::Pointer(_) => 32,
            TypeKind::Array(info) => info.element_type.scalar_bit_count(),
            _ => 32,
        }
    }

    pub fn vector_width(&self) -> u8 {
        match &self.kind {
            TypeKind::Simple { vector_width, .. } => *vector_width,
            _ => 1,
        }
    }

    /// Same scalar type with the given number of SIMD lanes.
    pub fn to_vector_type(&self, width: u8) -> DataType {
        debug_assert!(width >= 1 && width <= NATIVE_VECTOR_SIZE);
        match &self.kind {
            TypeKind::Simple {
                scalar_bits, float, ..
            } => DataType::vector(*scalar_bits, width, *float),
            _ => self.clone(),
        }
    }

    /// The type of a single element: pointed-to type for pointers, element
    /// type for arrays, the scalar type for vectors.
    pub fn element_type(&self) -> DataType {
        match &self.kind {
            TypeKind::Pointer(info) => info.element_type.clone(),
            TypeKind::Array(info) => info.element_type.clone(),
            TypeKind::Simple {
                scalar_bits, float, ..
            } => DataType::scalar(*scalar_bits, *float),
            _ => self.clone(),
        }
    }

    /// Number of bytes of the value as it is processed in registers.
    pub fn logical_width(&self) -> u32 {
        match &self.kind {
            TypeKind::Simple {
                scalar_bits,
                vector_width,
                ..
            } => (u32::from(*scalar_bits).max(8) / 8) * u32::from(*vector_width),
            TypeKind::Pointer(_) => 4,
            TypeKind::Array(info) => info.element_type.logical_width() * info.size,
            TypeKind::Struct(info) => info.fields.iter().map(DataType::logical_width).sum(),
            _ => 4,
        }
    }

    /// Number of bytes the value occupies in memory.
    pub fn in_memory_width(&self) -> u32 {
        match &self.kind {
            // 3-element vectors are padded to 4 elements in memory
            TypeKind::Simple {
                scalar_bits,
                vector_width,
                ..
            } if *vector_width == 3 => (u32::from(*scalar_bits).max(8) / 8) * 4,
            _ => self.logical_width(),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            TypeKind::Simple {
                scalar_bits,
                vector_width,
                float,
            } => {
                let base = match (scalar_bits, float) {
                    (1, _) => "bool".to_string(),
                    (bits, false) => format!("i{bits}"),
                    (bits, true) => format!("f{bits}"),
                };
                if *vector_width > 1 {
                    write!(f, "{base}x{vector_width}")
                } else {
                    f.write_str(&base)
                }
            }
            TypeKind::Pointer(info) => {
                write!(f, "({} {})*", info.address_space, info.element_type)
            }
            TypeKind::Array(info) => write!(f, "{}[{}]", info.element_type, info.size),
            TypeKind::Struct(info) => write!(f, "%{}", info.name),
            TypeKind::Label => f.write_str("label"),
            TypeKind::Unknown => f.write_str("?"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_equality_is_componentwise() {
        let a = DataType::pointer(TYPE_INT32.to_vector_type(4), AddressSpace::Global);
        let b = DataType::pointer(TYPE_INT32.to_vector_type(4), AddressSpace::Global);
        let c = DataType::pointer(TYPE_INT32.to_vector_type(4), AddressSpace::Local);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn interned_payloads_are_shared() {
        let a = DataType::array(TYPE_FLOAT, 8);
        let b = DataType::array(TYPE_FLOAT, 8);
        let (ia, ib) = (a.array_info().unwrap(), b.array_info().unwrap());
        assert!(std::ptr::eq(ia, ib));
    }

    #[test]
    fn widths() {
        assert_eq!(TYPE_INT32.to_vector_type(16).logical_width(), 64);
        assert_eq!(TYPE_INT8.logical_width(), 1);
        assert_eq!(TYPE_BOOL.logical_width(), 1);
        assert_eq!(DataType::array(TYPE_INT32, 12).in_memory_width(), 48);
        // 3-element vectors pad to 4 in memory
        assert_eq!(TYPE_FLOAT.to_vector_type(3).in_memory_width(), 16);
        assert_eq!(TYPE_FLOAT.to_vector_type(3).logical_width(), 12);
    }

    #[test]
    fn display_forms() {
        assert_eq!(TYPE_INT32.to_string(), "i32");
        assert_eq!(TYPE_FLOAT.to_vector_type(16).to_string(), "f32x16");
        assert_eq!(
            DataType::pointer(TYPE_INT32, AddressSpace::Global).to_string(),
            "(__global i32)*"
        );
    }
}
