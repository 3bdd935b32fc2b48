//! Control-flow recovery.
//!
//! Recursive disassembly from the image entry point. Each function is
//! traced instruction by instruction; branch targets are classified as
//! inner, outer or unknown, and unknown targets are resolved by
//! sub-traces that either merge back into the function or demote the
//! target to a new function entry. Calls and outer jumps seed further
//! function entries, which are traced in parallel waves.

use crate::error::AnalysisError;
use crate::flow::{
    call_target, is_conditional_jump, is_unconditional_jmp, jump_target, Func, JumpKind,
};
use carve_pe::PeImage;
use carve_emulate::Addr;
use iced_x86::{Decoder, DecoderOptions, FlowControl, Instruction};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

/// Recovers the set of reachable functions from a PE image.
pub struct FlowRecovery<'a> {
    image: &'a PeImage,
}

impl<'a> FlowRecovery<'a> {
    /// Creates a recovery pass over `image`.
    pub fn new(image: &'a PeImage) -> Self {
        Self { image }
    }

    /// Traces every function reachable from the entry point.
    ///
    /// Functions whose bytes fail to decode are discarded and logged;
    /// the rest of the run is unaffected.
    pub fn analyze(&self) -> Result<BTreeMap<Addr, Func>, AnalysisError> {
        let entry = self.image.entry_point().map_err(AnalysisError::Image)?;
        let mut funcs: BTreeMap<Addr, Func> = BTreeMap::new();
        let mut failed: BTreeSet<Addr> = BTreeSet::new();
        let mut pending: BTreeSet<Addr> = BTreeSet::new();
        pending.insert(entry);

        while !pending.is_empty() {
            let batch: Vec<Addr> = pending
                .iter()
                .copied()
                .filter(|a| !funcs.contains_key(a) && !failed.contains(a))
                .collect();
            pending.clear();
            if batch.is_empty() {
                break;
            }

            let results: Vec<(Addr, Result<Func, AnalysisError>)> = batch
                .into_par_iter()
                .map(|e| (e, self.build_func(e)))
                .collect();

            for (func_entry, result) in results {
                match result {
                    Ok(func) => {
                        for &dst in func.calls.keys() {
                            if !funcs.contains_key(&dst) {
                                pending.insert(dst);
                            }
                        }
                        for &dst in func.outer_jumps.keys() {
                            if !funcs.contains_key(&dst) {
                                pending.insert(dst);
                            }
                        }
                        funcs.insert(func_entry, func);
                    }
                    Err(err) => {
                        log::warn!("discarding function at {:#x}: {}", func_entry, err);
                        failed.insert(func_entry);
                    }
                }
            }
        }
        Ok(funcs)
    }

    /// Traces one function, resolving unknown jumps until the trace is
    /// complete or no further progress is possible.
    fn build_func(&self, entry: Addr) -> Result<Func, AnalysisError> {
        let mut func = Func::new(entry);
        loop {
            self.fill(&mut func)?;
            if func.is_complete() {
                break;
            }
            if !self.resolve_incomplete(&mut func)? {
                break;
            }
        }
        Ok(func)
    }

    /// Decodes forward from the trace frontier until the trace halts or
    /// leaves the section.
    fn fill(&self, func: &mut Func) -> Result<(), AnalysisError> {
        let mut next = match func.instructions.last_key_value() {
            Some((&addr, _)) => Some(addr),
            None => Some(func.entry),
        };
        let end = self.image.section_end(func.entry)?;
        while let Some(addr) = next {
            if addr >= end {
                break;
            }
            let instr = self.decode_at(addr, end)?;
            func.add_instruction(addr, instr);
            next = step(func, None, addr, &instr);
        }
        Ok(())
    }

    /// Resolves the lowest unknown jump by sub-tracing from its
    /// destination. A sub-trace that becomes contiguous with the outer
    /// trace merges into it; otherwise the destination is demoted to an
    /// outer jump. Returns true if anything changed.
    fn resolve_incomplete(&self, outer: &mut Func) -> Result<bool, AnalysisError> {
        if outer.instructions.is_empty() || outer.unknown_jumps.is_empty() {
            return Ok(false);
        }
        let mut progress = false;
        while let Some((&unknown_dst, _)) = outer.unknown_jumps.first_key_value() {
            let mut sub = Func::new(unknown_dst);
            let end = self.image.section_end(unknown_dst)?;
            let mut next = Some(unknown_dst);
            let mut can_merge = false;
            while !can_merge {
                let Some(addr) = next else { break };
                if addr >= end {
                    break;
                }
                let instr = self.decode_at(addr, end)?;
                sub.add_instruction(addr, instr);
                next = step(&mut sub, Some(outer), addr, &instr);
                can_merge = can_merge_with_outer(&sub, outer);
            }
            if can_merge {
                outer.merge(sub);
                progress = true;
                break;
            }
            if !outer.promote_unknown_jump(unknown_dst, JumpKind::Outer) {
                break;
            }
            progress = true;
        }
        Ok(progress)
    }

    fn decode_at(&self, addr: Addr, end: Addr) -> Result<Instruction, AnalysisError> {
        let bytes = &self.image.data()[addr as usize..end as usize];
        let mut decoder = Decoder::with_ip(64, bytes, addr, DecoderOptions::NONE);
        let instr = decoder.decode();
        if instr.is_invalid() {
            return Err(AnalysisError::Decode { address: addr });
        }
        Ok(instr)
    }
}

/// A sub-trace can merge once it is complete in its own right, or once
/// its first instruction sits exactly at the outer trace's frontier.
fn can_merge_with_outer(sub: &Func, outer: &Func) -> bool {
    if sub.is_complete() {
        return true;
    }
    let Some((&first, _)) = sub.instructions.first_key_value() else {
        return false;
    };
    first == outer.end_address()
}

/// Advances one instruction of a trace: classifies control flow and
/// returns the next address to decode, or `None` when the trace halts.
fn step(trace: &mut Func, mut outer: Option<&mut Func>, addr: Addr, instr: &Instruction) -> Option<Addr> {
    let next = addr + instr.len() as u64;

    // Visiting an address settles any unknown jump that targeted it.
    trace.promote_unknown_jump(addr, JumpKind::Inner);
    if let Some(outer) = outer.as_deref_mut() {
        outer.promote_unknown_jump(addr, JumpKind::Inner);
    }

    if instr.flow_control() == FlowControl::Call || instr.flow_control() == FlowControl::IndirectCall {
        // Calls are assumed to return.
        if let Some(dst) = call_target(instr) {
            trace.add_call(dst, addr, next);
        }
        return Some(next);
    }
    if instr.flow_control() == FlowControl::Return {
        trace.has_ret = true;
        return trace.is_inside(next).then_some(next);
    }
    if is_unconditional_jmp(instr) {
        let Some(dst) = jump_target(instr) else {
            trace.unresolved_jumps.insert(addr);
            return None;
        };
        let kind = classify_jump(trace, dst, next);
        trace.add_jump(kind, dst, addr);
        return match kind {
            JumpKind::Unknown => trace
                .promote_unknown_jump(next, JumpKind::Inner)
                .then_some(next),
            JumpKind::Inner => (dst >= next).then_some(next),
            JumpKind::Outer => None,
        };
    }
    if is_conditional_jump(instr) {
        let Some(dst) = jump_target(instr) else {
            trace.unresolved_jumps.insert(addr);
            return Some(next);
        };
        let kind = classify_jump(trace, dst, next);
        trace.add_jump(kind, dst, addr);
        return Some(next);
    }
    if instr.flow_control() == FlowControl::IndirectBranch {
        trace.unresolved_jumps.insert(addr);
        return None;
    }
    Some(next)
}

/// Classifies a branch destination for the trace as it stands.
fn classify_jump(trace: &Func, dst: Addr, next: Addr) -> JumpKind {
    // A zero-displacement jump stays inner by definition.
    if dst == next {
        return JumpKind::Inner;
    }
    // A jump as the very first instruction is a tail-call thunk.
    if trace.instructions.len() == 1 {
        return JumpKind::Outer;
    }
    if trace.instructions.contains_key(&dst) {
        return JumpKind::Inner;
    }
    if dst < trace.entry {
        return JumpKind::Outer;
    }
    JumpKind::Unknown
}

/// RVA bounds of the analyzed code, for progress reporting.
pub fn va_bounds(image: &PeImage, funcs: &BTreeMap<Addr, Func>) -> (u32, u32) {
    let mut low = u32::MAX;
    let mut high = 0;
    for func in funcs.values() {
        if let Ok(rva) = image.raw_to_rva(func.entry) {
            low = low.min(rva);
        }
        if let Ok(rva) = image.raw_to_rva(func.end_address().saturating_sub(1)) {
            high = high.max(rva);
        }
    }
    if low == u32::MAX {
        (0, 0)
    } else {
        (low, high)
    }
}
