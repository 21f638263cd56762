//! Symbolic storage locations owned by a [`super::method::Method`].
//!
//! Locals are addressed by [`LocalId`] keys into the method's local table;
//! values reference them without owning them. Every local tracks its users,
//! the set of instructions mentioning it, split into read and write counts.

use std::collections::HashMap;
use std::sync::Arc;

use bitflags::bitflags;

use super::instruction::InstId;
use super::types::DataType;
use super::value::{LocalRef, Value};

/// Key of a local in its method's local table.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct LocalId(pub u32);

bitflags! {
    /// Decorations attached to kernel parameters.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct ParameterDecorations: u8 {
        /// The parameter is read by the kernel.
        const INPUT = 1 << 0;
        /// The parameter is written by the kernel.
        const OUTPUT = 1 << 1;
        const SIGN_EXTEND = 1 << 2;
        const ZERO_EXTEND = 1 << 3;
        const READ_ONLY = 1 << 4;
        const BY_VALUE = 1 << 5;
    }
}

/// A kernel argument.
#[derive(Clone, Debug, Default)]
pub struct Parameter {
    pub decorations: ParameterDecorations,
}

/// Per-invocation private memory with a declared size.
#[derive(Clone, Debug)]
pub struct StackAllocation {
    pub size: u32,
    pub alignment: u32,
}

/// Module-scope variable, duplicated into each method's local table so a
/// method owns its complete view during compilation.
#[derive(Clone, Debug)]
pub struct Global {
    pub initial_value: Option<Value>,
    pub is_constant: bool,
}

/// The variant of a [`Local`].
#[derive(Clone, Debug)]
pub enum LocalKind {
    Plain,
    Parameter(Parameter),
    StackAllocation(StackAllocation),
    Global(Global),
}

/// How an instruction uses a local.
#[derive(Clone, Copy, Default, Debug)]
pub struct LocalUse {
    pub num_reads: u32,
    pub num_writes: u32,
}

impl LocalUse {
    pub fn reads_local(&self) -> bool {
        self.num_reads > 0
    }

    pub fn writes_local(&self) -> bool {
        self.num_writes > 0
    }
}

/// A symbolic SSA-like name with a type and a set of users.
#[derive(Clone, Debug)]
pub struct Local {
    pub id: LocalId,
    pub name: Arc<str>,
    pub data_type: DataType,
    pub kind: LocalKind,
    /// Base local and constant offset this local is an address into, if known.
    pub reference: Option<(LocalId, i32)>,
    pub users: HashMap<InstId, LocalUse>,
}

impl Local {
    pub fn new(id: LocalId, name: impl Into<Arc<str>>, data_type: DataType, kind: LocalKind) -> Self {
        Local {
            id,
            name: name.into(),
            data_type,
            kind,
            reference: None,
            users: HashMap::new(),
        }
    }

    pub fn create_reference(&self) -> LocalRef {
        LocalRef {
            id: self.id,
            name: self.name.clone(),
        }
    }

    pub fn value(&self) -> Value {
        Value::local(self.create_reference(), self.data_type.clone())
    }

    pub fn as_parameter(&self) -> Option<&Parameter> {
        match &self.kind {
            LocalKind::Parameter(param) => Some(param),
            _ => None,
        }
    }

    pub fn as_parameter_mut(&mut self) -> Option<&mut Parameter> {
        match &mut self.kind {
            LocalKind::Parameter(param) => Some(param),
            _ => None,
        }
    }

    pub fn as_stack_allocation(&self) -> Option<&StackAllocation> {
        match &self.kind {
            LocalKind::StackAllocation(alloc) => Some(alloc),
            _ => None,
        }
    }

    pub fn as_global(&self) -> Option<&Global> {
        match &self.kind {
            LocalKind::Global(global) => Some(global),
            _ => None,
        }
    }

    pub fn readers(&self) -> impl Iterator<Item = InstId> + '_ {
        self.users
            .iter()
            .filter(|(_, use_)| use_.reads_local())
            .map(|(id, _)| *id)
    }

    pub fn writers(&self) -> impl Iterator<Item = InstId> + '_ {
        self.users
            .iter()
            .filter(|(_, use_)| use_.writes_local())
            .map(|(id, _)| *id)
    }

    /// The only writing instruction, if there is exactly one.
    pub fn single_writer(&self) -> Option<InstId> {
        let mut writers = self.writers();
        let first = writers.next()?;
        writers.next().is_none().then_some(first)
    }

    pub(crate) fn add_user(&mut self, inst: InstId, reads: bool, writes: bool) {
        let entry = self.users.entry(inst).or_default();
        if reads {
            entry.num_reads += 1;
        }
        if writes {
            entry.num_writes += 1;
        }
    }

    pub(crate) fn remove_user(&mut self, inst: InstId) {
        self.users.remove(&inst);
    }
}
