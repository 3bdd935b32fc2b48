//! Context propagation.
//!
//! Walks every path of a function's cover in lock-step, interpreting
//! instructions against forked contexts. All paths that agree on the
//! next decision are advanced together; at each branch the group splits
//! into taken and not-taken halves. Contexts observed at an address are
//! recorded in a per-address set deduplicated by register-write hash.

use crate::coverage::{Path, PathCover};
use crate::error::AnalysisError;
use crate::flow::{is_any_jump, jump_target, Func};
use carve_emulate::{Addr, Context, Contexts, Emulator, SymbolIds};
use rayon::prelude::*;
use std::collections::BTreeMap;

/// Contexts recorded for one function, keyed by instruction address.
///
/// Each bucket is kept sorted by context hash; a context whose hash is
/// already present at the same address is dropped.
#[derive(Debug, Default)]
pub struct FuncContexts {
    map: BTreeMap<Addr, Vec<Context>>,
}

impl FuncContexts {
    /// Records `context` at `addr` unless an equal-hash twin exists.
    pub fn insert(&mut self, addr: Addr, context: Context) -> bool {
        let bucket = self.map.entry(addr).or_default();
        match bucket.binary_search_by_key(&context.hash(), |c| c.hash()) {
            Ok(_) => false,
            Err(at) => {
                bucket.insert(at, context);
                true
            }
        }
    }

    /// The contexts recorded at `addr`, ordered by hash.
    pub fn at(&self, addr: Addr) -> &[Context] {
        self.map.get(&addr).map_or(&[], Vec::as_slice)
    }

    /// True if no context was recorded anywhere.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Total number of recorded contexts.
    pub fn len(&self) -> usize {
        self.map.values().map(Vec::len).sum()
    }
}

/// Result of the propagation stage.
#[derive(Debug, Default)]
pub struct Propagation {
    contexts: BTreeMap<Addr, FuncContexts>,
}

impl Propagation {
    /// Propagates contexts through every complete function, in
    /// parallel. Functions without a computable path cover contribute
    /// nothing; discovered back edges are recorded on their functions.
    pub fn analyze(funcs: &mut BTreeMap<Addr, Func>) -> Propagation {
        let results: Vec<(Addr, FuncContexts, Vec<(Addr, Addr)>)> = funcs
            .par_iter()
            .filter_map(|(&entry, func)| {
                let cover = match PathCover::analyze(func) {
                    Ok(cover) => cover,
                    Err(err) => {
                        log::debug!("no path cover for {:#x}: {}", entry, err);
                        return None;
                    }
                };
                let ids = SymbolIds::new(entry);
                let contexts = propagate_func(func, &cover, &ids);
                let cycles = cover.loops().iter().copied().collect();
                Some((entry, contexts, cycles))
            })
            .collect();

        let mut propagation = Propagation::default();
        for (entry, contexts, cycles) in results {
            for (src, dst) in cycles {
                if let Some(func) = funcs.get_mut(&entry) {
                    func.add_cycle(src, dst);
                }
            }
            propagation.contexts.insert(entry, contexts);
        }
        propagation
    }

    /// The recorded contexts of one function.
    pub fn of(&self, entry: Addr) -> Option<&FuncContexts> {
        self.contexts.get(&entry)
    }

    /// Number of functions that produced contexts.
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    /// True if no function produced contexts.
    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}

#[derive(Clone, Copy)]
struct Cursor<'p> {
    steps: &'p Path,
    at: usize,
}

impl Cursor<'_> {
    fn current(&self) -> Option<&crate::coverage::PathStep> {
        self.steps.get(self.at)
    }

    fn advance(&mut self) {
        if self.at < self.steps.len() {
            self.at += 1;
        }
    }
}

/// Runs one function's cover to completion.
pub fn propagate_func(func: &Func, cover: &PathCover, ids: &SymbolIds) -> FuncContexts {
    let mut recorded = FuncContexts::default();
    let mut emulator = Emulator::new(ids);
    let cursors: Vec<Cursor> = cover
        .paths()
        .iter()
        .map(|steps| Cursor { steps, at: 0 })
        .collect();
    let initial = Contexts::single(Context::initial(func.entry, ids));
    walk(
        func,
        &mut recorded,
        &mut emulator,
        cursors,
        initial,
        func.entry,
    );
    recorded
}

fn walk(
    func: &Func,
    recorded: &mut FuncContexts,
    emulator: &mut Emulator,
    mut cursors: Vec<Cursor>,
    mut contexts: Contexts,
    mut addr: Addr,
) {
    let end = func.end_address();
    while addr < end {
        let Some(instr) = func.instruction(addr) else {
            break;
        };
        let instr = *instr;

        let mut advanced = Contexts::new();
        for context in contexts.drain() {
            let mut child = context.make_child();
            emulator.emulate(addr, &instr, &mut child);
            recorded.insert(addr, context);
            advanced.push(child);
        }
        contexts = advanced;
        if contexts.is_empty() {
            break;
        }

        if is_any_jump(&instr) {
            debug_assert!(
                cursors
                    .iter()
                    .all(|c| c.current().map(|s| s.jump)
                        == cursors[0].current().map(|s| s.jump)),
                "path groups must agree on the next decision"
            );
            let Some(current) = cursors.first().and_then(|c| c.current().copied()) else {
                break;
            };
            if current.jump != addr {
                // A branch outside the decision list (its target leaves
                // the function): treat it as never taken.
                addr += instr.len() as u64;
                continue;
            }
            let (taken, not_taken): (Vec<Cursor>, Vec<Cursor>) = cursors
                .into_iter()
                .partition(|c| c.current().map_or(false, |s| s.take));
            if !not_taken.is_empty() {
                let mut group = not_taken;
                for cursor in &mut group {
                    cursor.advance();
                }
                walk(
                    func,
                    recorded,
                    emulator,
                    group,
                    contexts.make_children(),
                    addr + instr.len() as u64,
                );
            }
            if taken.is_empty() {
                return;
            }
            let Some(target) = jump_target(&instr) else {
                return;
            };
            cursors = taken;
            for cursor in &mut cursors {
                cursor.advance();
            }
            addr = target;
            continue;
        }
        if instr.flow_control() == iced_x86::FlowControl::Return {
            break;
        }
        addr += instr.len() as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::FlowRecovery;
    use crate::testutil::build_pe;
    use carve_pe::PeImage;
    use carve_emulate::RegSlot;
    use iced_x86::code_asm::*;

    fn propagate(code: &[u8]) -> (BTreeMap<Addr, Func>, Propagation) {
        let image = PeImage::parse(build_pe(code)).unwrap();
        let mut funcs = FlowRecovery::new(&image).analyze().unwrap();
        let propagation = Propagation::analyze(&mut funcs);
        (funcs, propagation)
    }

    #[test]
    fn records_contexts_at_every_instruction() {
        let mut asm = CodeAssembler::new(64).unwrap();
        asm.mov(eax, 1).unwrap();
        asm.mov(ecx, 2).unwrap();
        asm.ret().unwrap();
        let (funcs, propagation) = propagate(&asm.assemble(0x200).unwrap());

        let contexts = propagation.of(0x200).unwrap();
        for &addr in funcs[&0x200].instructions.keys() {
            assert_eq!(contexts.at(addr).len(), 1, "at {:#x}", addr);
        }
    }

    #[test]
    fn shared_path_prefix_is_propagated_once() {
        let mut asm = CodeAssembler::new(64).unwrap();
        let mut other = asm.create_label();
        asm.test(rcx, rcx).unwrap();
        asm.jne(other).unwrap();
        asm.mov(eax, 1).unwrap();
        asm.ret().unwrap();
        asm.set_label(&mut other).unwrap();
        asm.mov(eax, 1).unwrap();
        asm.ret().unwrap();
        let (_, propagation) = propagate(&asm.assemble(0x200).unwrap());

        let contexts = propagation.of(0x200).unwrap();
        // Entry instruction observed once despite two paths.
        assert_eq!(contexts.at(0x200).len(), 1);
    }

    #[test]
    fn diverging_writes_keep_distinct_contexts() {
        let mut asm = CodeAssembler::new(64).unwrap();
        let mut other = asm.create_label();
        asm.test(rcx, rcx).unwrap();
        asm.jne(other).unwrap();
        asm.mov(eax, 1).unwrap();
        asm.ret().unwrap();
        asm.set_label(&mut other).unwrap();
        asm.mov(eax, 2).unwrap();
        asm.ret().unwrap();
        let code = asm.assemble(0x200).unwrap();
        let (funcs, propagation) = propagate(&code);

        // The two ret instructions each saw one context, with different
        // rax values.
        let func = &funcs[&0x200];
        let contexts = propagation.of(0x200).unwrap();
        let rets: Vec<Addr> = func
            .instructions
            .iter()
            .filter(|(_, i)| i.flow_control() == iced_x86::FlowControl::Return)
            .map(|(&a, _)| a)
            .collect();
        assert_eq!(rets.len(), 2);
        let a = contexts.at(rets[0])[0]
            .get_register(RegSlot::Gpr(0))
            .unwrap();
        let b = contexts.at(rets[1])[0]
            .get_register(RegSlot::Gpr(0))
            .unwrap();
        assert_ne!(a.as_concrete(), b.as_concrete());
    }

    #[test]
    fn loop_terminates_and_registers_cycle() {
        let mut asm = CodeAssembler::new(64).unwrap();
        let mut top = asm.create_label();
        asm.xor(eax, eax).unwrap();
        asm.set_label(&mut top).unwrap();
        asm.inc(eax).unwrap();
        asm.cmp(eax, 64).unwrap();
        asm.jl(top).unwrap();
        asm.ret().unwrap();
        let (funcs, propagation) = propagate(&asm.assemble(0x200).unwrap());

        assert!(!funcs[&0x200].cycles.is_empty());
        let contexts = propagation.of(0x200).unwrap();
        assert!(!contexts.is_empty());
    }

    #[test]
    fn incomplete_function_contributes_no_contexts() {
        let mut asm = CodeAssembler::new(64).unwrap();
        asm.jmp(rax).unwrap();
        let (_, propagation) = propagate(&asm.assemble(0x200).unwrap());
        assert!(propagation.of(0x200).is_none());
    }
}
