//! The intermediate instruction set.
//!
//! Instructions are a tagged sum; what the C++ original expressed with
//! dynamic casts becomes exhaustive matches here. Every instruction carries
//! the common extension payload (condition, flags, signal, pack modes and
//! decorations) next to its variant data.

use std::fmt;

use bitflags::bitflags;
use smallvec::SmallVec;

use super::local::LocalId;
use super::value::{LocalRef, Literal, Value, REG_UNIFORM, REG_VPM_IO};

/// Stable identity of an instruction within its method, independent of its
/// current position.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct InstId(pub u32);

/// ALU operation codes. The trailing pseudo-codes never appear in emitted
/// instructions, they classify non-ALU instructions for pattern matching.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum OpCode {
    Add,
    Sub,
    Mul24,
    And,
    Or,
    Xor,
    Not,
    Shl,
    Shr,
    Asr,
    Ror,
    Min,
    Max,
    Clz,
    FAdd,
    FSub,
    FMul,
    FMin,
    FMax,
    Ftoi,
    Itof,
    V8Adds,
    V8Subs,
    // pseudo-codes for the pattern matcher
    Mov,
    Ldi,
    Rotate,
    Br,
    Mutex,
}

impl OpCode {
    pub fn name(self) -> &'static str {
        match self {
            OpCode::Add => "add",
            OpCode::Sub => "sub",
            OpCode::Mul24 => "mul24",
            OpCode::And => "and",
            OpCode::Or => "or",
            OpCode::Xor => "xor",
            OpCode::Not => "not",
            OpCode::Shl => "shl",
            OpCode::Shr => "shr",
            OpCode::Asr => "asr",
            OpCode::Ror => "ror",
            OpCode::Min => "min",
            OpCode::Max => "max",
            OpCode::Clz => "clz",
            OpCode::FAdd => "fadd",
            OpCode::FSub => "fsub",
            OpCode::FMul => "fmul",
            OpCode::FMin => "fmin",
            OpCode::FMax => "fmax",
            OpCode::Ftoi => "ftoi",
            OpCode::Itof => "itof",
            OpCode::V8Adds => "v8adds",
            OpCode::V8Subs => "v8subs",
            OpCode::Mov => "mov",
            OpCode::Ldi => "ldi",
            OpCode::Rotate => "rotate",
            OpCode::Br => "br",
            OpCode::Mutex => "mutex",
        }
    }

    pub fn num_operands(self) -> u8 {
        match self {
            OpCode::Not | OpCode::Clz | OpCode::Ftoi | OpCode::Itof => 1,
            _ => 2,
        }
    }

    pub fn is_floating_point(self) -> bool {
        matches!(
            self,
            OpCode::FAdd | OpCode::FSub | OpCode::FMul | OpCode::FMin | OpCode::FMax
        )
    }

    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            OpCode::Add
                | OpCode::Mul24
                | OpCode::And
                | OpCode::Or
                | OpCode::Xor
                | OpCode::Min
                | OpCode::Max
                | OpCode::FAdd
                | OpCode::FMul
                | OpCode::FMin
                | OpCode::FMax
                | OpCode::V8Adds
        )
    }

    /// Whether a chain of applications may be reassociated, which allows a
    /// vector of partial results to be folded into a scalar.
    pub fn is_associative(self) -> bool {
        matches!(
            self,
            OpCode::Add
                | OpCode::And
                | OpCode::Or
                | OpCode::Xor
                | OpCode::Min
                | OpCode::Max
                | OpCode::FAdd
                | OpCode::FMin
                | OpCode::FMax
        )
    }

    /// Constant-fold the operation on literal operands.
    pub fn precalculate(self, first: Literal, second: Option<Literal>) -> Option<Literal> {
        let a = first;
        let b = second;
        let int = |v: i32| Some(Literal::from_signed(v));
        let float = |v: f32| Some(Literal::from_float(v));
        match self {
            OpCode::Add => int(a.signed_int().wrapping_add(b?.signed_int())),
            OpCode::Sub => int(a.signed_int().wrapping_sub(b?.signed_int())),
            OpCode::Mul24 => int(
                ((a.unsigned_int() & 0xFF_FFFF).wrapping_mul(b?.unsigned_int() & 0xFF_FFFF))
                    as i32,
            ),
            OpCode::And => Some(Literal(a.0 & b?.0)),
            OpCode::Or => Some(Literal(a.0 | b?.0)),
            OpCode::Xor => Some(Literal(a.0 ^ b?.0)),
            OpCode::Not => Some(Literal(!a.0)),
            OpCode::Shl => Some(Literal(a.0.wrapping_shl(b?.0 & 31))),
            OpCode::Shr => Some(Literal(a.0.wrapping_shr(b?.0 & 31))),
            OpCode::Asr => int((a.signed_int()).wrapping_shr(b?.0 & 31)),
            OpCode::Min => int(a.signed_int().min(b?.signed_int())),
            OpCode::Max => int(a.signed_int().max(b?.signed_int())),
            OpCode::Clz => int(a.0.leading_zeros() as i32),
            OpCode::FAdd => float(a.real() + b?.real()),
            OpCode::FSub => float(a.real() - b?.real()),
            OpCode::FMul => float(a.real() * b?.real()),
            OpCode::FMin => float(a.real().min(b?.real())),
            OpCode::FMax => float(a.real().max(b?.real())),
            OpCode::Ftoi => int(a.real() as i32),
            OpCode::Itof => float(a.signed_int() as f32),
            _ => None,
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Condition under which an instruction executes, per SIMD element.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub enum ConditionCode {
    #[default]
    Always,
    Never,
    ZeroSet,
    ZeroClear,
    NegativeSet,
    NegativeClear,
    CarrySet,
    CarryClear,
}

impl ConditionCode {
    pub fn invert(self) -> ConditionCode {
        match self {
            ConditionCode::Always => ConditionCode::Never,
            ConditionCode::Never => ConditionCode::Always,
            ConditionCode::ZeroSet => ConditionCode::ZeroClear,
            ConditionCode::ZeroClear => ConditionCode::ZeroSet,
            ConditionCode::NegativeSet => ConditionCode::NegativeClear,
            ConditionCode::NegativeClear => ConditionCode::NegativeSet,
            ConditionCode::CarrySet => ConditionCode::CarryClear,
            ConditionCode::CarryClear => ConditionCode::CarrySet,
        }
    }
}

impl fmt::Display for ConditionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConditionCode::Always => "",
            ConditionCode::Never => "never",
            ConditionCode::ZeroSet => "ifz",
            ConditionCode::ZeroClear => "ifzc",
            ConditionCode::NegativeSet => "ifn",
            ConditionCode::NegativeClear => "ifnc",
            ConditionCode::CarrySet => "ifc",
            ConditionCode::CarryClear => "ifcc",
        };
        f.write_str(name)
    }
}

/// Conditions a branch may depend on.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BranchCondition {
    Always,
    ZeroSet,
    ZeroClear,
}

impl From<BranchCondition> for ConditionCode {
    fn from(cond: BranchCondition) -> ConditionCode {
        match cond {
            BranchCondition::Always => ConditionCode::Always,
            BranchCondition::ZeroSet => ConditionCode::ZeroSet,
            BranchCondition::ZeroClear => ConditionCode::ZeroClear,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub enum SetFlag {
    #[default]
    DontSet,
    SetFlags,
}

/// Instruction signals. Only the TMU loads and program end are emitted by
/// the core; the rest exists for completeness of the encoding surface.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub enum Signal {
    #[default]
    None,
    SoftBreak,
    ThreadSwitch,
    EndProgram,
    WaitScoreboard,
    ScoreboardUnlock,
    LoadTmu0,
    LoadTmu1,
    AluSmallImmediate,
}

impl Signal {
    pub fn has_side_effects(self) -> bool {
        !matches!(self, Signal::None | Signal::AluSmallImmediate)
    }
}

/// Pack modes applied when writing the output.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub enum Pack {
    #[default]
    Nop,
    Int16A,
    Int16B,
    Int8A,
    Int8B,
    Int8C,
    Int8D,
    Int8888,
    Sat32,
}

impl Pack {
    pub fn has_effect(self) -> bool {
        self != Pack::Nop
    }
}

/// Unpack modes applied when reading the first operand.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub enum Unpack {
    #[default]
    Nop,
    Int16A,
    Int16B,
    Rep8D,
    Int8A,
    Int8B,
    Int8C,
    Int8D,
}

impl Unpack {
    pub fn has_effect(self) -> bool {
        self != Unpack::Nop
    }
}

/// Zero-extends byte a (bits 0..8) of the operand to a 32-bit word.
pub const UNPACK_8A_32: Unpack = Unpack::Int8A;

bitflags! {
    /// Additional semantic markers on instructions.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct Decorations: u16 {
        /// Inserted or modified by the loop vectorizer.
        const AUTO_VECTORIZED = 1 << 0;
        /// This move was created from a phi-node.
        const PHI_NODE = 1 << 1;
        /// Writes a single SIMD element of the output.
        const ELEMENT_INSERTION = 1 << 2;
        const UNSIGNED_RESULT = 1 << 3;
        /// The value is identical for all work-items of a work-group.
        const WORK_GROUP_UNIFORM_VALUE = 1 << 4;
        /// Branch only if the condition holds on all 16 elements.
        const BRANCH_ON_ALL_ELEMENTS = 1 << 5;
        /// All 16 elements of the result hold the same value.
        const IDENTICAL_ELEMENTS = 1 << 6;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MemoryOp {
    Read,
    Write,
    Copy,
    Fill,
}

impl fmt::Display for MemoryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MemoryOp::Read => "read",
            MemoryOp::Write => "write",
            MemoryOp::Copy => "copy",
            MemoryOp::Fill => "fill",
        })
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MutexAccess {
    Lock,
    Release,
}

/// The reason a nop occupies an instruction slot.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DelayKind {
    BranchDelay,
    ThreadEnd,
    WaitRegister,
    WaitTmu,
    WaitVpm,
    WaitUniform,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MemoryScope {
    CrossDevice,
    Device,
    WorkGroup,
    SubGroup,
    Invocation,
}

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct MemorySemantics: u16 {
        const ACQUIRE = 1 << 0;
        const RELEASE = 1 << 1;
        const ACQUIRE_RELEASE = 1 << 2;
        const SEQUENTIALLY_CONSISTENT = 1 << 3;
        const SUBGROUP_MEMORY = 1 << 4;
        const WORK_GROUP_MEMORY = 1 << 5;
        const CROSS_WORK_GROUP_MEMORY = 1 << 6;
        const ATOMIC_COUNTER_MEMORY = 1 << 7;
        const IMAGE_MEMORY = 1 << 8;
    }
}

/// The variant data of an [`Instruction`].
#[derive(Clone, PartialEq, Debug)]
pub enum InstructionKind {
    /// ALU operation.
    Op {
        code: OpCode,
        first: Value,
        second: Option<Value>,
    },
    Move {
        source: Value,
    },
    /// Loads the same 32-bit immediate into all 16 SIMD elements.
    LoadImmediate {
        immediate: Literal,
    },
    /// Rotates the 16-element vector upwards by the offset (a rotation small
    /// immediate or the r5 register).
    VectorRotation {
        source: Value,
        offset: Value,
    },
    /// Generic memory access, lowered away by normalization.
    Memory {
        op: MemoryOp,
        destination: Value,
        source: Value,
        num_entries: Value,
        guard: bool,
    },
    Branch {
        target: LocalRef,
        condition: Value,
    },
    /// Block header.
    Label {
        label: LocalRef,
    },
    Phi {
        sources: Vec<(LocalRef, Value)>,
    },
    Semaphore {
        semaphore: u8,
        increase: bool,
    },
    /// Lowered to a semaphore handshake before code generation.
    MemoryBarrier {
        scope: MemoryScope,
        semantics: MemorySemantics,
    },
    LifetimeBoundary {
        allocation: Value,
        is_end: bool,
    },
    /// Lowered to a read/write of the hardware mutex register at encoding.
    MutexLock {
        access: MutexAccess,
    },
    Nop {
        delay: DelayKind,
    },
}

/// A single intermediate instruction.
#[derive(Clone, Debug)]
pub struct Instruction {
    pub id: InstId,
    pub kind: InstructionKind,
    pub output: Option<Value>,
    pub condition: ConditionCode,
    pub set_flags: SetFlag,
    pub signal: Signal,
    pub pack: Pack,
    pub unpack: Unpack,
    pub decorations: Decorations,
}

impl Instruction {
    fn new(kind: InstructionKind, output: Option<Value>) -> Self {
        Instruction {
            // re-assigned when the instruction is inserted into a method
            id: InstId(u32::MAX),
            kind,
            output,
            condition: ConditionCode::Always,
            set_flags: SetFlag::DontSet,
            signal: Signal::None,
            pack: Pack::Nop,
            unpack: Unpack::Nop,
            decorations: Decorations::empty(),
        }
    }

    pub fn op(code: OpCode, output: Value, first: Value, second: Value) -> Self {
        Instruction::new(
            InstructionKind::Op {
                code,
                first,
                second: Some(second),
            },
            Some(output),
        )
    }

    pub fn unary_op(code: OpCode, output: Value, first: Value) -> Self {
        Instruction::new(
            InstructionKind::Op {
                code,
                first,
                second: None,
            },
            Some(output),
        )
    }

    pub fn mov(output: Value, source: Value) -> Self {
        Instruction::new(InstructionKind::Move { source }, Some(output))
    }

    pub fn load_immediate(output: Value, immediate: Literal) -> Self {
        Instruction::new(InstructionKind::LoadImmediate { immediate }, Some(output))
    }

    pub fn vector_rotation(output: Value, source: Value, offset: Value) -> Self {
        Instruction::new(InstructionKind::VectorRotation { source, offset }, Some(output))
    }

    pub fn memory(
        op: MemoryOp,
        destination: Value,
        source: Value,
        num_entries: Value,
        guard: bool,
    ) -> Self {
        Instruction::new(
            InstructionKind::Memory {
                op,
                destination,
                source,
                num_entries,
                guard,
            },
            None,
        )
    }

    pub fn branch(target: LocalRef, condition: BranchCondition, value: Value) -> Self {
        let mut inst = Instruction::new(
            InstructionKind::Branch {
                target,
                condition: value,
            },
            None,
        );
        inst.condition = condition.into();
        inst
    }

    pub fn label(label: LocalRef) -> Self {
        Instruction::new(InstructionKind::Label { label }, None)
    }

    pub fn phi(output: Value, sources: Vec<(LocalRef, Value)>) -> Self {
        Instruction::new(InstructionKind::Phi { sources }, Some(output))
    }

    pub fn semaphore(semaphore: u8, increase: bool) -> Self {
        debug_assert!(semaphore < 16);
        Instruction::new(InstructionKind::Semaphore { semaphore, increase }, None)
    }

    pub fn memory_barrier(scope: MemoryScope, semantics: MemorySemantics) -> Self {
        Instruction::new(InstructionKind::MemoryBarrier { scope, semantics }, None)
    }

    pub fn lifetime_boundary(allocation: Value, is_end: bool) -> Self {
        Instruction::new(InstructionKind::LifetimeBoundary { allocation, is_end }, None)
    }

    pub fn mutex(access: MutexAccess) -> Self {
        Instruction::new(InstructionKind::MutexLock { access }, None)
    }

    pub fn nop(delay: DelayKind) -> Self {
        Instruction::new(InstructionKind::Nop { delay }, None)
    }

    pub fn with_condition(mut self, condition: ConditionCode) -> Self {
        self.condition = condition;
        self
    }

    pub fn with_flags(mut self, set_flags: SetFlag) -> Self {
        self.set_flags = set_flags;
        self
    }

    pub fn with_signal(mut self, signal: Signal) -> Self {
        self.signal = signal;
        self
    }

    pub fn with_unpack(mut self, unpack: Unpack) -> Self {
        self.unpack = unpack;
        self
    }

    pub fn with_decorations(mut self, decorations: Decorations) -> Self {
        self.decorations |= decorations;
        self
    }

    pub fn add_decorations(&mut self, decorations: Decorations) {
        self.decorations |= decorations;
    }

    pub fn has_decoration(&self, decoration: Decorations) -> bool {
        self.decorations.contains(decoration)
    }

    /// All values this instruction reads, in a fixed order.
    pub fn arguments(&self) -> SmallVec<[&Value; 4]> {
        let mut args = SmallVec::new();
        match &self.kind {
            InstructionKind::Op { first, second, .. } => {
                args.push(first);
                if let Some(second) = second {
                    args.push(second);
                }
            }
            InstructionKind::Move { source } => args.push(source),
            InstructionKind::VectorRotation { source, offset } => {
                args.push(source);
                args.push(offset);
            }
            InstructionKind::Memory {
                destination,
                source,
                num_entries,
                ..
            } => {
                args.push(destination);
                args.push(source);
                args.push(num_entries);
            }
            InstructionKind::Branch { condition, .. } => args.push(condition),
            InstructionKind::LifetimeBoundary { allocation, .. } => args.push(allocation),
            InstructionKind::Phi { sources } => {
                for (_, value) in sources {
                    args.push(value);
                }
            }
            _ => {}
        }
        args
    }

    /// Visit all read values mutably.
    pub fn for_each_argument_mut(&mut self, mut f: impl FnMut(&mut Value)) {
        match &mut self.kind {
            InstructionKind::Op { first, second, .. } => {
                f(first);
                if let Some(second) = second {
                    f(second);
                }
            }
            InstructionKind::Move { source } => f(source),
            InstructionKind::VectorRotation { source, offset } => {
                f(source);
                f(offset);
            }
            InstructionKind::Memory {
                destination,
                source,
                num_entries,
                ..
            } => {
                f(destination);
                f(source);
                f(num_entries);
            }
            InstructionKind::Branch { condition, .. } => f(condition),
            InstructionKind::LifetimeBoundary { allocation, .. } => f(allocation),
            InstructionKind::Phi { sources } => {
                for (_, value) in sources {
                    f(value);
                }
            }
            _ => {}
        }
    }

    /// The first/second ALU argument view used by the pattern matcher.
    pub fn argument(&self, index: usize) -> Option<&Value> {
        match &self.kind {
            InstructionKind::Op { first, second, .. } => match index {
                0 => Some(first),
                1 => second.as_ref(),
                _ => None,
            },
            InstructionKind::Move { source } if index == 0 => Some(source),
            InstructionKind::VectorRotation { source, .. } if index == 0 => Some(source),
            InstructionKind::LoadImmediate { .. } => None,
            InstructionKind::Branch { condition, .. } if index == 0 => Some(condition),
            _ => None,
        }
    }

    pub fn output(&self) -> Option<&Value> {
        self.output.as_ref()
    }

    pub fn check_output_local(&self) -> Option<&LocalRef> {
        self.output.as_ref().and_then(Value::check_local)
    }

    /// Locals this instruction mentions, as (id, is_read, is_written).
    pub fn mentioned_locals(&self) -> SmallVec<[(LocalId, bool, bool); 6]> {
        let mut locals = SmallVec::new();
        for arg in self.arguments() {
            if let Some(local) = arg.check_local() {
                locals.push((local.id, true, false));
            }
        }
        match &self.kind {
            InstructionKind::Branch { target, .. } => locals.push((target.id, true, false)),
            InstructionKind::Label { label } => locals.push((label.id, false, true)),
            InstructionKind::Phi { sources } => {
                for (pred, _) in sources {
                    locals.push((pred.id, true, false));
                }
            }
            _ => {}
        }
        if let Some(local) = self.check_output_local() {
            locals.push((local.id, false, true));
        }
        locals
    }

    pub fn reads_local(&self, id: LocalId) -> bool {
        self.mentioned_locals()
            .iter()
            .any(|(lid, read, _)| *lid == id && *read)
    }

    pub fn writes_local(&self, id: LocalId) -> bool {
        self.check_output_local().map(|l| l.id) == Some(id)
    }

    pub fn reads_register(&self, register: super::value::Register) -> bool {
        self.arguments().iter().any(|arg| arg.has_register(register))
    }

    pub fn writes_register(&self, register: super::value::Register) -> bool {
        self.output
            .as_ref()
            .map(|out| out.has_register(register))
            .unwrap_or(false)
    }

    pub fn has_conditional_execution(&self) -> bool {
        self.condition != ConditionCode::Always
    }

    pub fn does_set_flag(&self) -> bool {
        self.set_flags == SetFlag::SetFlags
    }

    pub fn has_pack_mode(&self) -> bool {
        self.pack.has_effect()
    }

    pub fn has_unpack_mode(&self) -> bool {
        self.unpack.has_effect()
    }

    /// Whether executing the instruction affects anything beyond its output
    /// local: peripheral register accesses, signals, synchronization,
    /// branches and un-lowered memory accesses all count.
    pub fn has_side_effects(&self) -> bool {
        if matches!(
            self.kind,
            InstructionKind::Memory { .. }
                | InstructionKind::Branch { .. }
                | InstructionKind::Semaphore { .. }
                | InstructionKind::MemoryBarrier { .. }
                | InstructionKind::MutexLock { .. }
        ) {
            return true;
        }
        if self.signal.has_side_effects() {
            return true;
        }
        if let Some(out) = &self.output {
            if let Some(reg) = out.check_register() {
                if !reg.is_accumulator() && reg.is_special() && reg != super::value::REG_NOP {
                    return true;
                }
            }
        }
        // reading these registers pops FIFOs or acquires hardware locks
        self.arguments().iter().any(|arg| {
            arg.check_register().is_some_and(|reg| {
                reg == REG_UNIFORM || reg == REG_VPM_IO || reg == super::value::REG_MUTEX
            })
        })
    }

    /// Pattern-matcher classification of the instruction.
    pub fn match_op_code(&self) -> Option<OpCode> {
        match &self.kind {
            InstructionKind::Op { code, .. } => Some(*code),
            InstructionKind::Move { .. } => Some(OpCode::Mov),
            InstructionKind::LoadImmediate { .. } => Some(OpCode::Ldi),
            InstructionKind::VectorRotation { .. } => Some(OpCode::Rotate),
            InstructionKind::Branch { .. } => Some(OpCode::Br),
            InstructionKind::MutexLock { .. } => Some(OpCode::Mutex),
            _ => None,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let extras = {
            let mut parts = Vec::new();
            if self.condition != ConditionCode::Always {
                parts.push(self.condition.to_string());
            }
            if self.does_set_flag() {
                parts.push("setf".to_string());
            }
            if self.signal != Signal::None {
                parts.push(format!("{:?}", self.signal).to_lowercase());
            }
            if !self.decorations.is_empty() {
                parts.push(format!("{:?}", self.decorations).to_lowercase());
            }
            if parts.is_empty() {
                String::new()
            } else {
                format!(" ({})", parts.join(", "))
            }
        };
        let out = |output: &Option<Value>| {
            output
                .as_ref()
                .map(|o| format!("{o} = "))
                .unwrap_or_default()
        };
        match &self.kind {
            InstructionKind::Op {
                code,
                first,
                second,
            } => {
                write!(f, "{}{} {}", out(&self.output), code, first)?;
                if let Some(second) = second {
                    write!(f, ", {second}")?;
                }
                f.write_str(&extras)
            }
            InstructionKind::Move { source } => {
                write!(f, "{}{}{}", out(&self.output), source, extras)
            }
            InstructionKind::LoadImmediate { immediate } => {
                write!(f, "{}ldi {}{}", out(&self.output), immediate, extras)
            }
            InstructionKind::VectorRotation { source, offset } => {
                write!(f, "{}{} << {}{}", out(&self.output), source, offset, extras)
            }
            InstructionKind::Memory {
                op,
                destination,
                source,
                num_entries,
                guard,
            } => write!(
                f,
                "{}{} {} <- {} x {}{}{}",
                out(&self.output),
                op,
                destination,
                source,
                num_entries,
                if *guard { " (guarded)" } else { "" },
                extras
            ),
            InstructionKind::Branch { target, condition } => {
                if self.condition == ConditionCode::Always {
                    write!(f, "br {}{}", target.name, extras)
                } else {
                    write!(
                        f,
                        "br.{} {} (on {}){}",
                        self.condition, target.name, condition, extras
                    )
                }
            }
            InstructionKind::Label { label } => write!(f, "label: {}{}", label.name, extras),
            InstructionKind::Phi { sources } => {
                write!(f, "{}phi", out(&self.output))?;
                for (i, (pred, value)) in sources.iter().enumerate() {
                    write!(
                        f,
                        "{} {} -> {}",
                        if i == 0 { "" } else { "," },
                        pred.name,
                        value
                    )?;
                }
                f.write_str(&extras)
            }
            InstructionKind::Semaphore { semaphore, increase } => write!(
                f,
                "semaphore {} {}{}",
                semaphore,
                if *increase { "increase" } else { "decrease" },
                extras
            ),
            InstructionKind::MemoryBarrier { scope, semantics } => {
                write!(f, "mem-fence {:?}, {:?}{}", scope, semantics, extras)
            }
            InstructionKind::LifetimeBoundary { allocation, is_end } => write!(
                f,
                "life-time for {} {}{}",
                allocation,
                if *is_end { "ends" } else { "starts" },
                extras
            ),
            InstructionKind::MutexLock { access } => write!(
                f,
                "mutex.{}{}",
                match access {
                    MutexAccess::Lock => "lock",
                    MutexAccess::Release => "release",
                },
                extras
            ),
            InstructionKind::Nop { delay } => {
                write!(f, "nop.{}{}", format!("{delay:?}").to_lowercase(), extras)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::types::TYPE_INT32;

    #[test]
    fn condition_inversion_is_involutive() {
        for cond in [
            ConditionCode::Always,
            ConditionCode::ZeroSet,
            ConditionCode::ZeroClear,
            ConditionCode::NegativeSet,
            ConditionCode::CarrySet,
        ] {
            assert_eq!(cond.invert().invert(), cond);
        }
    }

    #[test]
    fn precalculation() {
        let lit = |v: i32| Literal::from_signed(v);
        assert_eq!(
            OpCode::Add.precalculate(lit(3), Some(lit(4))),
            Some(lit(7))
        );
        assert_eq!(
            OpCode::Xor.precalculate(lit(5), Some(lit(5))),
            Some(lit(0))
        );
        assert_eq!(
            OpCode::Asr.precalculate(lit(-8), Some(lit(1))),
            Some(lit(-4))
        );
        assert_eq!(OpCode::Mov.precalculate(lit(1), None), None);
    }

    #[test]
    fn memory_instruction_has_side_effects() {
        let mem = Instruction::memory(
            MemoryOp::Read,
            Value::int(0),
            Value::int(0),
            crate::ir::value::INT_ONE,
            false,
        );
        assert!(mem.has_side_effects());
        let add = Instruction::op(
            OpCode::Add,
            Value::undefined(TYPE_INT32),
            Value::int(1),
            Value::int(2),
        );
        assert!(!add.has_side_effects());
    }
}
