//! The intermediate representation: values, locals, types, instructions,
//! basic blocks and methods.

pub mod block;
pub mod helper;
pub mod instruction;
pub mod local;
pub mod method;
pub mod types;
pub mod value;
pub mod walker;

pub use block::{BasicBlock, DEFAULT_BLOCK, LAST_BLOCK};
pub use instruction::{
    BranchCondition, ConditionCode, Decorations, DelayKind, InstId, Instruction, InstructionKind,
    MemoryOp, MemoryScope, MemorySemantics, MutexAccess, OpCode, Pack, SetFlag, Signal, Unpack,
};
pub use local::{Local, LocalId, LocalKind, LocalUse, Parameter, ParameterDecorations};
pub use method::{KernelMetadata, Method, Module, UniformsUsed};
pub use types::{AddressSpace, DataType, NATIVE_VECTOR_SIZE};
pub use value::{
    Literal, LocalRef, Register, RegisterFile, SmallImmediate, Value, ValueContent,
    UNDEFINED_VALUE,
};
pub use walker::InstructionWalker;
