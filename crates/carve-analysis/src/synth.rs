//! Structure synthesis.
//!
//! Groups each function's non-stack memory accesses by the identity of
//! the base-register value (the root), types a struct field per access
//! cluster, links pointer fields when a loaded or stored value is
//! itself the root of another group, and finally merges structs across
//! functions when one root flows into a callee through an argument
//! register or a stack slot.

use crate::flow::{has_nonstack_memory_access, Func};
use crate::propagate::{FuncContexts, Propagation};
use crate::struc::{merge_strucs, new_struc, FieldKind, StrucRef};
use carve_emulate::{
    is_write_access, memory_address, points_to_stack, stack_argument_number, Addr, RegSlot,
    RootKey, Value,
};
use carve_pe::PeImage;
use iced_x86::{Instruction, InstructionInfoFactory, OpKind, Register};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// One observed memory access, before field typing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct Access {
    offset: u64,
    kind: FieldKind,
    size: u64,
    signed: bool,
}

/// Accesses clustered under one root value.
#[derive(Debug)]
struct Group {
    root: Value,
    struc: StrucRef,
    /// Unique access shapes in discovery (address) order.
    accesses: Vec<Access>,
    /// Field offset per contributing instruction.
    instr_offsets: BTreeMap<Addr, u64>,
    /// (offset, stored value) pairs for memory writes from registers.
    written_roots: Vec<(u64, RootKey)>,
    /// Registers observed carrying the root.
    base_regs: BTreeSet<RegSlot>,
}

/// Per-function grouping result.
#[derive(Debug, Default)]
struct FuncGroups {
    groups: BTreeMap<RootKey, Group>,
}

/// Runs structure synthesis over every analyzed function and returns the
/// global struct table keyed by name.
pub fn synthesize(
    image: &PeImage,
    funcs: &BTreeMap<Addr, Func>,
    propagation: &Propagation,
) -> BTreeMap<String, StrucRef> {
    // Per-function grouping and intra-function linking are independent.
    let domains: BTreeMap<Addr, FuncGroups> = funcs
        .par_iter()
        .filter_map(|(&entry, func)| {
            let contexts = propagation.of(entry)?;
            let mut groups = build_groups(func, contexts);
            create_strucs(image, func, &mut groups);
            intra_link(&groups);
            Some((entry, groups))
        })
        .collect::<Vec<_>>()
        .into_iter()
        .collect();

    // Register every non-empty struct under a unique name.
    let mut table: BTreeMap<String, StrucRef> = BTreeMap::new();
    for domain in domains.values() {
        for group in domain.groups.values() {
            if group.struc.lock().unwrap().is_empty() {
                continue;
            }
            let base = group.struc.lock().unwrap().name.clone();
            let mut name = base.clone();
            let mut k = 1;
            while table.contains_key(&name) {
                k += 1;
                name = format!("{}_{}", base, k);
            }
            group.struc.lock().unwrap().name = name.clone();
            table.insert(name, group.struc.clone());
        }
    }

    // Cross-function linking runs serially so merge order, and with it
    // union member order, is reproducible.
    let merged_away = inter_link(funcs, propagation, &domains);
    table.retain(|_, struc| !merged_away.contains(&(std::sync::Arc::as_ptr(struc) as usize)));
    table
}

/// Classifies one memory access by the decoder's view of the operand.
fn classify_access(instr: &Instruction) -> (FieldKind, bool, u64) {
    use iced_x86::MemorySize;
    let memory_size = instr.memory_size();
    let bytes = memory_size.size() as u64;
    match memory_size {
        MemorySize::Float16 | MemorySize::Float32 | MemorySize::Float64 | MemorySize::Float80 => {
            (FieldKind::Float, false, bytes)
        }
        MemorySize::Int8 | MemorySize::Int16 | MemorySize::Int32 | MemorySize::Int64 => {
            (FieldKind::Int, true, bytes)
        }
        _ => (FieldKind::UInt, false, bytes.min(8)),
    }
}

/// Index of the register operand feeding a memory store, if any.
fn store_source_register(instr: &Instruction) -> Option<Register> {
    (0..instr.op_count())
        .find(|&i| instr.op_kind(i) == OpKind::Register)
        .map(|i| instr.op_register(i))
}

fn build_groups(func: &Func, contexts: &FuncContexts) -> FuncGroups {
    let mut result = FuncGroups::default();
    let mut factory = InstructionInfoFactory::new();
    let mut seen: HashSet<(RootKey, Access)> = HashSet::new();

    for (&addr, instr) in &func.instructions {
        if !has_nonstack_memory_access(instr) {
            continue;
        }
        let base = instr.memory_base();
        if base == Register::RIP {
            continue;
        }
        let Some(base_slot) = RegSlot::from_register(base) else {
            continue;
        };
        let (kind, signed, size) = classify_access(instr);
        if size == 0 {
            continue;
        }
        let is_store = {
            let info = factory.info(instr);
            info.used_memory().iter().any(|m| is_write_access(m.access()))
        };
        let index_slot = RegSlot::from_register(instr.memory_index());
        let scale = instr.memory_index_scale() as u64;

        for ctx in contexts.at(addr) {
            let Some(root) = ctx.get_register(base_slot) else {
                continue;
            };
            let mut offset = instr.memory_displacement64() as i64;
            if let Some(index) = index_slot {
                if let Some(iv) = ctx.get_register(index).and_then(|v| v.as_concrete()) {
                    offset = offset.wrapping_add((iv.wrapping_mul(scale)) as i64);
                }
            }
            if offset < 0 {
                log::debug!("skipping negative field offset at {:#x}", addr);
                continue;
            }
            let access = Access {
                offset: offset as u64,
                kind,
                size,
                signed,
            };
            let key = root.root_key();
            let group = result.groups.entry(key).or_insert_with(|| Group {
                root,
                struc: new_struc(String::new()),
                accesses: Vec::new(),
                instr_offsets: BTreeMap::new(),
                written_roots: Vec::new(),
                base_regs: BTreeSet::new(),
            });
            if seen.insert((key, access)) {
                group.accesses.push(access);
            }
            group.instr_offsets.entry(addr).or_insert(access.offset);
            group.base_regs.insert(base_slot);
            if is_store {
                if let Some(src) = store_source_register(instr) {
                    if let Some(stored) = RegSlot::from_register(src)
                        .and_then(|slot| ctx.get_register(slot))
                    {
                        group.written_roots.push((access.offset, stored.root_key()));
                    }
                }
            }
        }
    }
    result
}

/// Runs of at least this many consecutive same-shaped accesses collapse
/// into one array field.
const ARRAY_RUN_MIN: usize = 3;

fn create_strucs(image: &PeImage, func: &Func, domain: &mut FuncGroups) {
    let rva = image.raw_to_rva(func.entry).unwrap_or(0);
    for (key, group) in &mut domain.groups {
        let (id, sub) = match key {
            RootKey::Symbolic(id, offset) => (*id, *offset as u64),
            RootKey::Concrete(value) => (*value, 0),
        };
        group.struc.lock().unwrap().name = format!("{:08x}_{:x}_{:x}", rva, id, sub);

        // Decide which accesses open an array run and which are
        // swallowed by one.
        let mut starts: BTreeMap<Access, u64> = BTreeMap::new();
        let mut swallowed: HashSet<Access> = HashSet::new();
        let mut by_shape: BTreeMap<(FieldKind, u64, bool), Vec<u64>> = BTreeMap::new();
        for access in &group.accesses {
            by_shape
                .entry((access.kind, access.size, access.signed))
                .or_default()
                .push(access.offset);
        }
        for ((kind, size, signed), mut offsets) in by_shape {
            offsets.sort_unstable();
            offsets.dedup();
            let mut i = 0;
            while i < offsets.len() {
                let mut len = 1;
                while i + len < offsets.len()
                    && offsets[i + len] == offsets[i] + len as u64 * size
                {
                    len += 1;
                }
                if len >= ARRAY_RUN_MIN {
                    let shape = |offset| Access {
                        offset,
                        kind,
                        size,
                        signed,
                    };
                    starts.insert(shape(offsets[i]), len as u64);
                    for covered in &offsets[i + 1..i + len] {
                        swallowed.insert(shape(*covered));
                    }
                }
                i += len;
            }
        }

        let mut struc = group.struc.lock().unwrap();
        for access in &group.accesses {
            if swallowed.contains(access) {
                continue;
            }
            let count = starts.get(access).copied().unwrap_or(1);
            match access.kind {
                FieldKind::Float => struc.add_float_field(access.offset, access.size, count),
                _ => struc.add_int_field(access.offset, access.size, access.signed, count),
            }
        }
    }
}

/// Links pointer fields between groups of one function: a group whose
/// root was produced by another group's load, or stored through another
/// group's field, is that field's pointee.
fn intra_link(domain: &FuncGroups) {
    for (key_b, group_b) in &domain.groups {
        let Some(source) = group_b.root.source() else {
            continue;
        };
        for (key_a, group_a) in &domain.groups {
            if key_a == key_b {
                continue;
            }
            if let Some(&offset) = group_a.instr_offsets.get(&source) {
                group_a
                    .struc
                    .lock()
                    .unwrap()
                    .add_pointer_field(offset, 1, Some(group_b.struc.clone()));
            }
        }
    }
    for (key_a, group_a) in &domain.groups {
        for (offset, stored) in &group_a.written_roots {
            if stored == key_a {
                continue;
            }
            if let Some(group_b) = domain.groups.get(stored) {
                group_a
                    .struc
                    .lock()
                    .unwrap()
                    .add_pointer_field(*offset, 1, Some(group_b.struc.clone()));
            }
        }
    }
}

/// The argument slot a group's root was loaded from, if its defining
/// instruction read the stack frame.
fn stack_argument_of(
    func: &Func,
    contexts: &FuncContexts,
    key: &RootKey,
    root: &Value,
) -> Option<u32> {
    if let RootKey::Concrete(value) = key {
        if points_to_stack(*value) {
            return stack_argument_number(*value);
        }
    }
    let source = root.source()?;
    let instr = func.instruction(source)?;
    if crate::flow::memory_operand(instr).is_none() || instr.memory_base() != Register::RSP {
        return None;
    }
    for ctx in contexts.at(source) {
        if let Some(address) = memory_address(instr, ctx).as_concrete() {
            if let Some(slot) = stack_argument_number(address) {
                return Some(slot);
            }
        }
    }
    None
}

/// Registers that may have carried the root into the function.
fn link_candidate_registers(
    func: &Func,
    contexts: &FuncContexts,
    key: &RootKey,
    group: &Group,
) -> BTreeSet<RegSlot> {
    let mut candidates = group.base_regs.clone();
    if group.root.source() == Some(func.entry) {
        if let Some(initial) = contexts.at(func.entry).first() {
            for slot in RegSlot::tracked() {
                if initial.get_register(slot).map(|v| v.root_key()) == Some(*key) {
                    candidates.insert(slot);
                }
            }
        }
    }
    candidates
}

/// Cross-function linking. Returns the pointers of structs that were
/// merged into another and must leave the output table.
fn inter_link(
    funcs: &BTreeMap<Addr, Func>,
    propagation: &Propagation,
    domains: &BTreeMap<Addr, FuncGroups>,
) -> HashSet<usize> {
    let mut merged_away = HashSet::new();
    for (&entry, domain) in domains {
        let func = &funcs[&entry];
        let Some(contexts) = propagation.of(entry) else {
            continue;
        };
        for (key, group) in &domain.groups {
            if group.struc.lock().unwrap().is_empty() {
                continue;
            }
            let linked = if let Some(slot) = stack_argument_of(func, contexts, key, &group.root)
            {
                link_via_stack(entry, group, slot, funcs, propagation, domains)
            } else {
                link_via_registers(
                    entry,
                    group,
                    &link_candidate_registers(func, contexts, key, group),
                    funcs,
                    propagation,
                    domains,
                )
            };
            if linked {
                merged_away.insert(std::sync::Arc::as_ptr(&group.struc) as usize);
            }
        }
    }
    merged_away
}

/// Merges a stack-passed group into the struct its caller handed over in
/// the matching argument slot.
fn link_via_stack(
    entry: Addr,
    group: &Group,
    argument: u32,
    funcs: &BTreeMap<Addr, Func>,
    propagation: &Propagation,
    domains: &BTreeMap<Addr, FuncGroups>,
) -> bool {
    for (&caller_entry, caller) in funcs {
        let Some(calls) = caller.calls.get(&entry) else {
            continue;
        };
        let (Some(caller_contexts), Some(caller_domain)) =
            (propagation.of(caller_entry), domains.get(&caller_entry))
        else {
            continue;
        };
        for call in calls {
            for ctx in caller_contexts.at(call.src) {
                let Some(rsp) = ctx.get_register(RegSlot::RSP).and_then(|v| v.as_concrete())
                else {
                    continue;
                };
                let slot_address = rsp.wrapping_add(8 * argument as u64);
                let Some(stored) = ctx.get_memory(slot_address, 8).exact else {
                    continue;
                };
                if let Some(target) = caller_domain.groups.get(&stored.root_key()) {
                    merge_strucs(&target.struc, &group.struc);
                    return true;
                }
            }
        }
    }
    false
}

/// Merges a register-passed group into the struct its caller held in the
/// same register at the call site.
fn link_via_registers(
    entry: Addr,
    group: &Group,
    candidates: &BTreeSet<RegSlot>,
    funcs: &BTreeMap<Addr, Func>,
    propagation: &Propagation,
    domains: &BTreeMap<Addr, FuncGroups>,
) -> bool {
    for (&caller_entry, caller) in funcs {
        let Some(calls) = caller.calls.get(&entry) else {
            continue;
        };
        let (Some(caller_contexts), Some(caller_domain)) =
            (propagation.of(caller_entry), domains.get(&caller_entry))
        else {
            continue;
        };
        for call in calls {
            for ctx in caller_contexts.at(call.src) {
                for &reg in candidates {
                    let Some(passed) = ctx.get_register(reg) else {
                        continue;
                    };
                    if let Some(target) = caller_domain.groups.get(&passed.root_key()) {
                        if std::sync::Arc::ptr_eq(&target.struc, &group.struc) {
                            continue;
                        }
                        merge_strucs(&target.struc, &group.struc);
                        return true;
                    }
                }
            }
        }
    }
    false
}
