//! Recovered function records.
//!
//! A [`Func`] is one function as seen by control-flow recovery: its
//! decoded instructions keyed by raw offset, its classified jumps, its
//! call sites and the back edges discovered later by the path cover.

use carve_emulate::Addr;
use iced_x86::{FlowControl, Instruction, Mnemonic, OpKind, Register};
use std::collections::{BTreeMap, BTreeSet};

/// Classification of a branch target relative to the function being
/// traced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpKind {
    /// Destination belongs to this function.
    Inner,
    /// Destination belongs to another function.
    Outer,
    /// Not classifiable yet; resolved by sub-traces.
    Unknown,
}

/// A classified jump edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Jump {
    /// Branch destination.
    pub dst: Addr,
    /// Branch instruction address.
    pub src: Addr,
}

/// A direct call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Call {
    /// Call destination.
    pub dst: Addr,
    /// Call instruction address.
    pub src: Addr,
    /// Return address (the instruction after the call).
    pub ret: Addr,
}

/// One recovered function.
#[derive(Debug, Default)]
pub struct Func {
    /// Entry point, as a raw file offset.
    pub entry: Addr,
    /// Decoded instructions keyed by raw offset.
    pub instructions: BTreeMap<Addr, Instruction>,
    /// Jumps staying inside the function, keyed by destination.
    pub inner_jumps: BTreeMap<Addr, Vec<Jump>>,
    /// Jumps leaving the function, keyed by destination.
    pub outer_jumps: BTreeMap<Addr, Vec<Jump>>,
    /// Jumps not classified yet, keyed by destination.
    pub unknown_jumps: BTreeMap<Addr, Vec<Jump>>,
    /// Jump instructions whose destination cannot be computed.
    pub unresolved_jumps: BTreeSet<Addr>,
    /// Direct call sites, keyed by destination.
    pub calls: BTreeMap<Addr, Vec<Call>>,
    /// True once a RET was decoded.
    pub has_ret: bool,
    /// Back edges found by the path cover.
    pub cycles: BTreeSet<(Addr, Addr)>,
}

impl Func {
    /// Creates an empty function rooted at `entry`.
    pub fn new(entry: Addr) -> Self {
        Self {
            entry,
            ..Self::default()
        }
    }

    /// True once the function needs no further decoding.
    pub fn is_complete(&self) -> bool {
        !self.instructions.is_empty()
            && self.unknown_jumps.is_empty()
            && self.unresolved_jumps.is_empty()
            && self.has_ret
    }

    /// True if `addr` is a decoded instruction or a known inner target.
    pub fn is_inside(&self, addr: Addr) -> bool {
        self.instructions.contains_key(&addr) || self.inner_jumps.contains_key(&addr)
    }

    /// The decoded instruction at `addr`, if any.
    pub fn instruction(&self, addr: Addr) -> Option<&Instruction> {
        self.instructions.get(&addr)
    }

    /// End of the decoded range: one past the last instruction.
    pub fn end_address(&self) -> Addr {
        self.instructions
            .last_key_value()
            .map(|(&addr, instr)| addr + instr.len() as u64)
            .unwrap_or(self.entry)
    }

    /// Records a decoded instruction.
    pub fn add_instruction(&mut self, addr: Addr, instr: Instruction) {
        self.instructions.insert(addr, instr);
    }

    /// Records a classified jump, keeping (dst, src) pairs unique.
    pub fn add_jump(&mut self, kind: JumpKind, dst: Addr, src: Addr) {
        let map = match kind {
            JumpKind::Inner => &mut self.inner_jumps,
            JumpKind::Outer => &mut self.outer_jumps,
            JumpKind::Unknown => &mut self.unknown_jumps,
        };
        let jumps = map.entry(dst).or_default();
        if !jumps.iter().any(|j| j.src == src) {
            jumps.push(Jump { dst, src });
        }
    }

    /// Records a call site, keeping (dst, src) pairs unique.
    pub fn add_call(&mut self, dst: Addr, src: Addr, ret: Addr) {
        let calls = self.calls.entry(dst).or_default();
        if !calls.iter().any(|c| c.src == src) {
            calls.push(Call { dst, src, ret });
        }
    }

    /// Records a back edge.
    pub fn add_cycle(&mut self, src: Addr, dst: Addr) {
        self.cycles.insert((src, dst));
    }

    /// Reclassifies every unknown jump to `dst`. Returns true if any
    /// jump moved.
    pub fn promote_unknown_jump(&mut self, dst: Addr, kind: JumpKind) -> bool {
        let Some(jumps) = self.unknown_jumps.remove(&dst) else {
            return false;
        };
        for jump in jumps {
            self.add_jump(kind, jump.dst, jump.src);
        }
        true
    }

    /// Merges a sub-trace into this function.
    pub fn merge(&mut self, other: Func) {
        self.instructions.extend(other.instructions);
        for (_, jumps) in other.inner_jumps {
            for j in jumps {
                self.add_jump(JumpKind::Inner, j.dst, j.src);
            }
        }
        for (_, jumps) in other.outer_jumps {
            for j in jumps {
                self.add_jump(JumpKind::Outer, j.dst, j.src);
            }
        }
        for (_, jumps) in other.unknown_jumps {
            for j in jumps {
                self.add_jump(JumpKind::Unknown, j.dst, j.src);
            }
        }
        for (_, calls) in other.calls {
            for c in calls {
                self.add_call(c.dst, c.src, c.ret);
            }
        }
        self.unresolved_jumps.extend(other.unresolved_jumps);
        self.has_ret |= other.has_ret;
    }
}

/// True for any branch instruction, conditional or not, including
/// register-indirect jumps.
pub fn is_any_jump(instr: &Instruction) -> bool {
    matches!(
        instr.flow_control(),
        FlowControl::ConditionalBranch | FlowControl::UnconditionalBranch | FlowControl::IndirectBranch
    )
}

/// True for conditional branches (Jcc, LOOPcc, JCXZ family).
pub fn is_conditional_jump(instr: &Instruction) -> bool {
    instr.flow_control() == FlowControl::ConditionalBranch
}

/// True for a direct unconditional JMP.
pub fn is_unconditional_jmp(instr: &Instruction) -> bool {
    instr.mnemonic() == Mnemonic::Jmp
        && instr.flow_control() == FlowControl::UnconditionalBranch
}

/// The branch destination of a direct jump, or `None` when the target is
/// register- or memory-indirect.
pub fn jump_target(instr: &Instruction) -> Option<Addr> {
    match instr.flow_control() {
        FlowControl::ConditionalBranch | FlowControl::UnconditionalBranch => {
            Some(instr.near_branch_target())
        }
        _ => None,
    }
}

/// The destination of a direct call, or `None` for indirect calls.
pub fn call_target(instr: &Instruction) -> Option<Addr> {
    match instr.flow_control() {
        FlowControl::Call => Some(instr.near_branch_target()),
        _ => None,
    }
}

/// Index of the instruction's explicit memory operand, if it has one.
pub fn memory_operand(instr: &Instruction) -> Option<u32> {
    (0..instr.op_count()).find(|&i| instr.op_kind(i) == OpKind::Memory)
}

/// True if the instruction touches memory through something other than
/// the stack pointer. Stack traffic never contributes struct fields.
pub fn has_nonstack_memory_access(instr: &Instruction) -> bool {
    memory_operand(instr).is_some()
        && instr.memory_base() != Register::RSP
        && instr.memory_index() != Register::RSP
}

#[cfg(test)]
mod tests {
    use super::*;
    use iced_x86::code_asm::*;
    use iced_x86::{Decoder, DecoderOptions};

    fn decode_one(build: impl FnOnce(&mut CodeAssembler)) -> Instruction {
        let mut asm = CodeAssembler::new(64).unwrap();
        build(&mut asm);
        let bytes = asm.assemble(0x400).unwrap();
        Decoder::with_ip(64, &bytes, 0x400, DecoderOptions::NONE).decode()
    }

    #[test]
    fn classifies_branch_instructions() {
        let jcc = decode_one(|a| {
            let mut l = a.create_label();
            a.je(l).unwrap();
            a.set_label(&mut l).unwrap();
            a.nop().unwrap();
        });
        assert!(is_any_jump(&jcc));
        assert!(is_conditional_jump(&jcc));
        assert!(!is_unconditional_jmp(&jcc));
        assert_eq!(jump_target(&jcc), Some(jcc.next_ip()));

        let indirect = decode_one(|a| a.jmp(rax).unwrap());
        assert!(is_any_jump(&indirect));
        assert_eq!(jump_target(&indirect), None);
    }

    #[test]
    fn stack_accesses_are_not_struct_accesses() {
        let stack = decode_one(|a| a.mov(rax, qword_ptr(rsp + 8)).unwrap());
        assert!(!has_nonstack_memory_access(&stack));

        let field = decode_one(|a| a.mov(rax, qword_ptr(rcx + 8)).unwrap());
        assert!(has_nonstack_memory_access(&field));
        assert_eq!(memory_operand(&field), Some(1));
    }

    #[test]
    fn completeness_requires_ret_and_no_unknowns() {
        let mut func = Func::new(0x400);
        assert!(!func.is_complete());

        func.add_instruction(0x400, decode_one(|a| a.nop().unwrap()));
        func.has_ret = true;
        assert!(func.is_complete());

        func.add_jump(JumpKind::Unknown, 0x500, 0x400);
        assert!(!func.is_complete());
        assert!(func.promote_unknown_jump(0x500, JumpKind::Inner));
        assert!(func.is_complete());
        assert!(func.is_inside(0x500));
    }
}
