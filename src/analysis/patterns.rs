//! Declarative matching and capturing over single instructions or short
//! straight-line fragments.
//!
//! Placeholders are opaque integer handles allocated per [`Pattern`]; their
//! captures live in an array-keyed table written back only when the whole
//! pattern matched. For multi-instruction patterns each instruction matches
//! against a tentative per-instruction cache that is merged into the global
//! cache only when the instruction matched in full, which keeps the attempt
//! atomic across skipped gap instructions.

use std::collections::{HashMap, HashSet};

use crate::error::{CompileError, CompileResult};
use crate::ir::instruction::{ConditionCode, Instruction, OpCode, SetFlag};
use crate::ir::local::LocalId;
use crate::ir::method::Method;
use crate::ir::value::Value;
use crate::ir::walker::InstructionWalker;
use crate::profile_scope;

/// Handle of a value placeholder within its pattern.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ValueHandle(u32);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct OpCodeHandle(u32);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ConditionHandle(u32);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct FlagHandle(u32);

/// What a single value position must look like.
#[derive(Clone, Debug)]
pub enum ValuePattern {
    /// Must equal this concrete value.
    Fixed(Value),
    /// Capture any value referencing a local.
    AnyLocal(ValueHandle),
    /// Capture any value with literal content.
    AnyLiteral(ValueHandle),
    /// Capture any present value.
    AnyValue(ValueHandle),
    /// Match anything, including an absent value.
    Ignored,
}

#[derive(Clone, Debug)]
pub enum OperationPattern {
    Fixed(OpCode),
    Any(OpCodeHandle),
    Ignored,
}

#[derive(Clone, Debug)]
pub enum ConditionPattern {
    Fixed(ConditionCode),
    Any(ConditionHandle),
    /// Capture the inverse of the instruction's condition.
    Inverted(ConditionHandle),
    Ignored,
}

#[derive(Clone, Debug)]
pub enum FlagPattern {
    Fixed(SetFlag),
    Any(FlagHandle),
    Ignored,
}

/// Shape of one instruction.
#[derive(Clone, Debug)]
pub struct InstructionPattern {
    pub output: ValuePattern,
    pub operation: OperationPattern,
    pub first_argument: ValuePattern,
    pub second_argument: ValuePattern,
    pub condition: ConditionPattern,
    pub flags: FlagPattern,
}

impl Default for InstructionPattern {
    fn default() -> Self {
        InstructionPattern {
            output: ValuePattern::Ignored,
            operation: OperationPattern::Ignored,
            first_argument: ValuePattern::Ignored,
            second_argument: ValuePattern::Ignored,
            condition: ConditionPattern::Ignored,
            flags: FlagPattern::Ignored,
        }
    }
}

/// Captured placeholder contents, array-keyed by handle.
#[derive(Clone, Debug, Default)]
struct Captures {
    values: Vec<Option<Value>>,
    op_codes: Vec<Option<OpCode>>,
    conditions: Vec<Option<ConditionCode>>,
    flags: Vec<Option<SetFlag>>,
}

/// An ordered sequence of instruction patterns.
#[derive(Clone, Debug, Default)]
pub struct Pattern {
    pub parts: Vec<InstructionPattern>,
    /// Tolerate unrelated instructions between the parts.
    pub allow_gaps: bool,
    captures: Captures,
}

impl Pattern {
    pub fn new(allow_gaps: bool) -> Self {
        Pattern {
            allow_gaps,
            ..Pattern::default()
        }
    }

    pub fn single(part: InstructionPattern) -> Self {
        let mut pattern = Pattern::new(false);
        pattern.parts.push(part);
        pattern
    }

    pub fn new_value_placeholder(&mut self) -> ValueHandle {
        self.captures.values.push(None);
        ValueHandle(self.captures.values.len() as u32 - 1)
    }

    pub fn new_op_code_placeholder(&mut self) -> OpCodeHandle {
        self.captures.op_codes.push(None);
        OpCodeHandle(self.captures.op_codes.len() as u32 - 1)
    }

    pub fn new_condition_placeholder(&mut self) -> ConditionHandle {
        self.captures.conditions.push(None);
        ConditionHandle(self.captures.conditions.len() as u32 - 1)
    }

    pub fn new_flag_placeholder(&mut self) -> FlagHandle {
        self.captures.flags.push(None);
        FlagHandle(self.captures.flags.len() as u32 - 1)
    }

    /// The value captured for a placeholder after a successful search.
    pub fn value(&self, handle: ValueHandle) -> Option<&Value> {
        self.captures.values[handle.0 as usize].as_ref()
    }

    pub fn op_code(&self, handle: OpCodeHandle) -> Option<OpCode> {
        self.captures.op_codes[handle.0 as usize]
    }

    pub fn condition(&self, handle: ConditionHandle) -> Option<ConditionCode> {
        self.captures.conditions[handle.0 as usize]
    }

    pub fn flag(&self, handle: FlagHandle) -> Option<SetFlag> {
        self.captures.flags[handle.0 as usize]
    }

    /// Validate the pattern itself; patterns over pack/unpack modes are
    /// malformed since matching ignores those instructions entirely.
    pub fn validate(&self) -> CompileResult<()> {
        if self.parts.is_empty() {
            return Err(CompileError::internal("empty instruction pattern"));
        }
        Ok(())
    }
}

/// Tentative captures during one match attempt.
#[derive(Clone, Debug, Default)]
struct MatchCache {
    values: HashMap<u32, Value>,
    op_codes: HashMap<u32, OpCode>,
    conditions: HashMap<u32, ConditionCode>,
    flags: HashMap<u32, SetFlag>,
}

impl MatchCache {
    fn merge(&mut self, other: MatchCache) {
        self.values.extend(other.values);
        self.op_codes.extend(other.op_codes);
        self.conditions.extend(other.conditions);
        self.flags.extend(other.flags);
    }
}

fn matches_cached_value(
    value: &Value,
    handle: u32,
    previous: &MatchCache,
    new: &MatchCache,
) -> bool {
    if let Some(cached) = previous.values.get(&handle) {
        if cached != value {
            return false;
        }
    }
    if let Some(cached) = new.values.get(&handle) {
        if cached != value {
            return false;
        }
    }
    true
}

fn matches_value(
    value: Option<&Value>,
    pattern: &ValuePattern,
    previous: &MatchCache,
    new: &mut MatchCache,
) -> bool {
    match pattern {
        ValuePattern::Ignored => true,
        ValuePattern::Fixed(expected) => value == Some(expected),
        ValuePattern::AnyLocal(handle) => match value {
            Some(value) if value.check_local().is_some() => {
                if !matches_cached_value(value, handle.0, previous, new) {
                    return false;
                }
                new.values.insert(handle.0, value.clone());
                true
            }
            _ => false,
        },
        ValuePattern::AnyLiteral(handle) => match value {
            Some(value) if value.is_literal_value() => {
                if !matches_cached_value(value, handle.0, previous, new) {
                    return false;
                }
                new.values.insert(handle.0, value.clone());
                true
            }
            _ => false,
        },
        ValuePattern::AnyValue(handle) => match value {
            Some(value) => {
                if !matches_cached_value(value, handle.0, previous, new) {
                    return false;
                }
                new.values.insert(handle.0, value.clone());
                true
            }
            None => false,
        },
    }
}

fn matches_operation(
    op: OpCode,
    pattern: &OperationPattern,
    previous: &MatchCache,
    new: &mut MatchCache,
) -> bool {
    match pattern {
        OperationPattern::Ignored => true,
        OperationPattern::Fixed(expected) => op == *expected,
        OperationPattern::Any(handle) => {
            if let Some(cached) = previous.op_codes.get(&handle.0) {
                if *cached != op {
                    return false;
                }
            }
            if let Some(cached) = new.op_codes.get(&handle.0) {
                if *cached != op {
                    return false;
                }
            }
            new.op_codes.insert(handle.0, op);
            true
        }
    }
}

fn matches_condition(
    condition: ConditionCode,
    pattern: &ConditionPattern,
    previous: &MatchCache,
    new: &mut MatchCache,
) -> bool {
    let check = |code: ConditionCode, handle: u32, new: &mut MatchCache| {
        if let Some(cached) = previous.conditions.get(&handle) {
            if *cached != code {
                return false;
            }
        }
        if let Some(cached) = new.conditions.get(&handle) {
            if *cached != code {
                return false;
            }
        }
        new.conditions.insert(handle, code);
        true
    };
    match pattern {
        ConditionPattern::Ignored => true,
        ConditionPattern::Fixed(expected) => condition == *expected,
        ConditionPattern::Any(handle) => check(condition, handle.0, new),
        ConditionPattern::Inverted(handle) => check(condition.invert(), handle.0, new),
    }
}

fn matches_flag(
    flag: SetFlag,
    pattern: &FlagPattern,
    previous: &MatchCache,
    new: &mut MatchCache,
) -> bool {
    match pattern {
        FlagPattern::Ignored => true,
        FlagPattern::Fixed(expected) => flag == *expected,
        FlagPattern::Any(handle) => {
            if let Some(cached) = previous.flags.get(&handle.0) {
                if *cached != flag {
                    return false;
                }
            }
            if let Some(cached) = new.flags.get(&handle.0) {
                if *cached != flag {
                    return false;
                }
            }
            new.flags.insert(handle.0, flag);
            true
        }
    }
}

/// Match a single instruction against one pattern part, collecting tentative
/// captures into `new`.
fn matches_only(
    inst: &Instruction,
    pattern: &InstructionPattern,
    previous: &MatchCache,
    new: &mut MatchCache,
) -> bool {
    // pack/unpack modes and side-effecting signals disqualify outright
    if inst.has_pack_mode() || inst.has_unpack_mode() || inst.signal.has_side_effects() {
        return false;
    }
    if !matches_value(inst.output(), &pattern.output, previous, new) {
        return false;
    }
    let op = match inst.match_op_code() {
        Some(op) => op,
        None => return false,
    };
    if !matches_operation(op, &pattern.operation, previous, new) {
        return false;
    }
    if !matches_value(inst.argument(0), &pattern.first_argument, previous, new) {
        return false;
    }
    if !matches_value(inst.argument(1), &pattern.second_argument, previous, new) {
        return false;
    }
    if !matches_condition(inst.condition, &pattern.condition, previous, new) {
        return false;
    }
    matches_flag(inst.set_flags, &pattern.flags, previous, new)
}

/// Write the captures of a matched instruction back into the pattern.
fn update_only(inst: &Instruction, pattern: &InstructionPattern, captures: &mut Captures) {
    let mut update_value = |value: Option<&Value>, value_pattern: &ValuePattern| {
        let handle = match value_pattern {
            ValuePattern::AnyLocal(h) | ValuePattern::AnyLiteral(h) | ValuePattern::AnyValue(h) => {
                h.0
            }
            _ => return,
        };
        if let Some(value) = value {
            captures.values[handle as usize] = Some(value.clone());
        }
    };
    update_value(inst.output(), &pattern.output);
    update_value(inst.argument(0), &pattern.first_argument);
    update_value(inst.argument(1), &pattern.second_argument);
    if let (Some(op), OperationPattern::Any(handle)) = (inst.match_op_code(), &pattern.operation) {
        captures.op_codes[handle.0 as usize] = Some(op);
    }
    match &pattern.condition {
        ConditionPattern::Any(handle) => {
            captures.conditions[handle.0 as usize] = Some(inst.condition);
        }
        ConditionPattern::Inverted(handle) => {
            captures.conditions[handle.0 as usize] = Some(inst.condition.invert());
        }
        _ => {}
    }
    if let FlagPattern::Any(handle) = &pattern.flags {
        captures.flags[handle.0 as usize] = Some(inst.set_flags);
    }
}

/// Match a single instruction against a one-part pattern, writing captures
/// back on success.
pub fn matches(inst: &Instruction, pattern: &mut Pattern) -> bool {
    profile_scope!("PatternMatching");
    debug_assert_eq!(pattern.parts.len(), 1);
    let cache = MatchCache::default();
    let mut new = MatchCache::default();
    if !matches_only(inst, &pattern.parts[0], &cache, &mut new) {
        return false;
    }
    let part = pattern.parts[0].clone();
    update_only(inst, &part, &mut pattern.captures);
    true
}

/// All parts must match consecutive instructions.
fn search_inner_compact(
    method: &Method,
    start: InstructionWalker,
    pattern: &mut Pattern,
) -> Option<InstructionWalker> {
    let mut global = MatchCache::default();
    let mut it = start;
    for part in &pattern.parts {
        let inst = method.instruction(it)?;
        // any failure aborts the whole attempt, so one cache suffices
        let mut new = MatchCache::default();
        if !matches_only(inst, part, &global, &mut new) {
            return None;
        }
        global.merge(new);
        it = it.next_in_block(method);
    }
    // matched; write all captures back
    let mut it = start;
    let parts = pattern.parts.clone();
    for part in &parts {
        update_only(method.instruction(it).unwrap(), part, &mut pattern.captures);
        it = it.next_in_block(method);
    }
    Some(start)
}

/// All parts must match in order, with unrelated instructions tolerated in
/// between under the gap rules.
fn search_inner_gapped(
    method: &Method,
    start: InstructionWalker,
    pattern: &mut Pattern,
) -> Option<InstructionWalker> {
    let mut gap_written: HashSet<LocalId> = HashSet::new();
    let mut previously_written: HashSet<LocalId> = HashSet::new();
    let mut global = MatchCache::default();
    let mut matched: Vec<InstructionWalker> = Vec::with_capacity(pattern.parts.len());
    let mut it = start;
    for part in &pattern.parts {
        let mut local_cache = MatchCache::default();
        loop {
            let inst = match method.instruction(it) {
                Some(inst) => inst,
                None => return None,
            };
            if matches_only(inst, part, &global, &mut local_cache) {
                break;
            }
            // unrelated gap instruction: side effects or flag setting abort
            if inst.signal.has_side_effects() || inst.does_set_flag() {
                return None;
            }
            if let Some(out) = inst.check_output_local() {
                gap_written.insert(out.id);
            }
            it = it.next_in_block(method);
            // tentative captures of the failed try are wrong, drop them
            local_cache = MatchCache::default();
        }

        // a matched instruction must not read a local a gap instruction
        // overwrote after a previously matched instruction wrote it
        let inst = method.instruction(it).unwrap();
        let conflicting = gap_written
            .iter()
            .any(|local| previously_written.contains(local) && inst.reads_local(*local));
        if conflicting {
            return None;
        }

        global.merge(local_cache);
        matched.push(it);
        if let Some(out) = inst.check_output_local() {
            previously_written.insert(out.id);
        }
        it = it.next_in_block(method);
    }

    let parts = pattern.parts.clone();
    for (walker, part) in matched.iter().zip(&parts) {
        update_only(method.instruction(*walker).unwrap(), part, &mut pattern.captures);
    }
    Some(start)
}

/// Search the block from `start` for the pattern. Returns the position of the
/// first matched instruction; `None` means no match (not an error).
pub fn search(
    method: &Method,
    start: InstructionWalker,
    pattern: &mut Pattern,
) -> Option<InstructionWalker> {
    profile_scope!("PatternMatching");
    if pattern.parts.is_empty() {
        return None;
    }
    let mut it = start;
    while let Some(inst) = method.instruction(it) {
        let mut dummy = MatchCache::default();
        let first = pattern.parts[0].clone();
        if matches_only(inst, &first, &MatchCache::default(), &mut dummy) {
            let result = if pattern.allow_gaps {
                search_inner_gapped(method, it, pattern)
            } else {
                search_inner_compact(method, it, pattern)
            };
            if result.is_some() {
                return result;
            }
        }
        it = it.next_in_block(method);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::instruction::{Instruction, OpCode, SetFlag};
    use crate::ir::method::{method_with_entry_block, Method};
    use crate::ir::types::TYPE_INT32;
    use crate::ir::value::{nop_value, Value};

    fn add_chain_method() -> (Method, Value, Value, Value) {
        let mut method = method_with_entry_block("patterns");
        let a = method.add_new_local(TYPE_INT32, "%a");
        let b = method.add_new_local(TYPE_INT32, "%b");
        let c = method.add_new_local(TYPE_INT32, "%c");
        method.append_to_end(Instruction::op(
            OpCode::Add,
            b.clone(),
            a.clone(),
            Value::int(1),
        ));
        method.append_to_end(Instruction::op(
            OpCode::Xor,
            c.clone(),
            b.clone(),
            Value::int(3),
        ));
        (method, a, b, c)
    }

    #[test]
    fn captures_values_and_opcode() {
        let (method, _, b, _) = add_chain_method();
        let mut pattern = Pattern::new(false);
        let out = pattern.new_value_placeholder();
        let op = pattern.new_op_code_placeholder();
        let lit = pattern.new_value_placeholder();
        pattern.parts.push(InstructionPattern {
            output: ValuePattern::AnyLocal(out),
            operation: OperationPattern::Any(op),
            first_argument: ValuePattern::Ignored,
            second_argument: ValuePattern::AnyLiteral(lit),
            ..InstructionPattern::default()
        });
        let found = search(&method, method.walk_all(), &mut pattern);
        assert!(found.is_some());
        assert_eq!(pattern.value(out), Some(&b));
        assert_eq!(pattern.op_code(op), Some(OpCode::Add));
        assert_eq!(
            pattern.value(lit).and_then(|v| v.literal_value()).unwrap().signed_int(),
            1
        );
    }

    #[test]
    fn repeated_placeholder_must_capture_same_value() {
        let (method, _, b, _) = add_chain_method();
        // %x = add ..., then xor %x, ...: the chained local must be equal
        let mut pattern = Pattern::new(false);
        let chained = pattern.new_value_placeholder();
        pattern.parts.push(InstructionPattern {
            output: ValuePattern::AnyLocal(chained),
            operation: OperationPattern::Fixed(OpCode::Add),
            ..InstructionPattern::default()
        });
        pattern.parts.push(InstructionPattern {
            operation: OperationPattern::Fixed(OpCode::Xor),
            first_argument: ValuePattern::AnyLocal(chained),
            ..InstructionPattern::default()
        });
        let found = search(&method, method.walk_all(), &mut pattern);
        assert!(found.is_some());
        assert_eq!(pattern.value(chained), Some(&b));
    }

    #[test]
    fn no_match_returns_none() {
        let (method, ..) = add_chain_method();
        let mut pattern = Pattern::single(InstructionPattern {
            operation: OperationPattern::Fixed(OpCode::FMul),
            ..InstructionPattern::default()
        });
        assert!(search(&method, method.walk_all(), &mut pattern).is_none());
    }

    #[test]
    fn gap_with_flag_setting_aborts() {
        let mut method = method_with_entry_block("gaps");
        let a = method.add_new_local(TYPE_INT32, "%a");
        let b = method.add_new_local(TYPE_INT32, "%b");
        method.append_to_end(Instruction::op(
            OpCode::Add,
            a.clone(),
            Value::int(1),
            Value::int(2),
        ));
        // flag-setting instruction in the gap
        method.append_to_end(
            Instruction::op(OpCode::Xor, nop_value(), Value::int(0), Value::int(1))
                .with_flags(SetFlag::SetFlags),
        );
        method.append_to_end(Instruction::op(
            OpCode::Sub,
            b.clone(),
            a.clone(),
            Value::int(1),
        ));
        let mut pattern = Pattern::new(true);
        pattern.parts.push(InstructionPattern {
            operation: OperationPattern::Fixed(OpCode::Add),
            ..InstructionPattern::default()
        });
        pattern.parts.push(InstructionPattern {
            operation: OperationPattern::Fixed(OpCode::Sub),
            ..InstructionPattern::default()
        });
        assert!(search(&method, method.walk_all(), &mut pattern).is_none());
    }

    #[test]
    fn gap_overwriting_matched_local_aborts() {
        let mut method = method_with_entry_block("gaps");
        let a = method.add_new_local(TYPE_INT32, "%a");
        let b = method.add_new_local(TYPE_INT32, "%b");
        method.append_to_end(Instruction::op(
            OpCode::Add,
            a.clone(),
            Value::int(1),
            Value::int(2),
        ));
        // gap overwrites %a, which the first matched instruction wrote
        method.append_to_end(Instruction::mov(a.clone(), Value::int(9)));
        method.append_to_end(Instruction::op(
            OpCode::Sub,
            b.clone(),
            a.clone(),
            Value::int(1),
        ));
        let mut pattern = Pattern::new(true);
        let out = pattern.new_value_placeholder();
        pattern.parts.push(InstructionPattern {
            output: ValuePattern::AnyLocal(out),
            operation: OperationPattern::Fixed(OpCode::Add),
            ..InstructionPattern::default()
        });
        pattern.parts.push(InstructionPattern {
            operation: OperationPattern::Fixed(OpCode::Sub),
            first_argument: ValuePattern::AnyLocal(out),
            ..InstructionPattern::default()
        });
        assert!(search(&method, method.walk_all(), &mut pattern).is_none());
    }

    #[test]
    fn gap_overwriting_unmatched_local_is_tolerated() {
        let mut method = method_with_entry_block("gaps");
        let a = method.add_new_local(TYPE_INT32, "%a");
        let b = method.add_new_local(TYPE_INT32, "%b");
        let unrelated = method.add_new_local(TYPE_INT32, "%u");
        method.append_to_end(Instruction::op(
            OpCode::Add,
            a.clone(),
            Value::int(1),
            Value::int(2),
        ));
        method.append_to_end(Instruction::mov(unrelated, Value::int(9)));
        method.append_to_end(Instruction::op(
            OpCode::Sub,
            b.clone(),
            a.clone(),
            Value::int(1),
        ));
        let mut pattern = Pattern::new(true);
        pattern.parts.push(InstructionPattern {
            operation: OperationPattern::Fixed(OpCode::Add),
            ..InstructionPattern::default()
        });
        pattern.parts.push(InstructionPattern {
            operation: OperationPattern::Fixed(OpCode::Sub),
            ..InstructionPattern::default()
        });
        assert!(search(&method, method.walk_all(), &mut pattern).is_some());
    }

    #[test]
    fn rerunning_with_captures_prefilled_is_stable() {
        let (method, _, b, _) = add_chain_method();
        let mut pattern = Pattern::new(false);
        let out = pattern.new_value_placeholder();
        pattern.parts.push(InstructionPattern {
            output: ValuePattern::AnyLocal(out),
            operation: OperationPattern::Fixed(OpCode::Add),
            ..InstructionPattern::default()
        });
        let first = search(&method, method.walk_all(), &mut pattern).unwrap();
        assert_eq!(pattern.value(out), Some(&b));
        let second = search(&method, first, &mut pattern).unwrap();
        assert_eq!(first, second);
        assert_eq!(pattern.value(out), Some(&b));
    }
}
