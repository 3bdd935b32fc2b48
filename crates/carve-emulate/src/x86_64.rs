//! x86-64 instruction semantics over symbolic contexts.
//!
//! The emulator covers the mnemonics the analysis cares about: the MOV
//! family, the common ALU operations, LEA, stack pushes and pops, CALL,
//! RET and INC/DEC. Every other instruction is modeled as an opaque
//! clobber: each written register or memory location receives a fresh
//! symbolic value sourced at the instruction.
//!
//! Sub-register lanes follow hardware behavior: writes to 32-bit lanes
//! zero the high half of the tracked 64-bit slot, writes to 8- and
//! 16-bit lanes preserve it.

use crate::context::Context;
use crate::registers::RegSlot;
use crate::value::{hash_combine, stack_sentinel, Addr, Symbol, SymbolIds, Value};
use iced_x86::{Instruction, InstructionInfoFactory, Mnemonic, OpAccess, OpKind, Register};

/// A resolved instruction operand.
struct Operand {
    reg: Option<RegSlot>,
    address: Option<u64>,
    value: Value,
}

/// Returns true for operand accesses that modify their target.
pub fn is_write_access(access: OpAccess) -> bool {
    matches!(
        access,
        OpAccess::Write | OpAccess::CondWrite | OpAccess::ReadWrite | OpAccess::ReadCondWrite
    )
}

fn is_immediate(kind: OpKind) -> bool {
    matches!(
        kind,
        OpKind::Immediate8
            | OpKind::Immediate8_2nd
            | OpKind::Immediate16
            | OpKind::Immediate32
            | OpKind::Immediate64
            | OpKind::Immediate8to16
            | OpKind::Immediate8to32
            | OpKind::Immediate8to64
            | OpKind::Immediate32to64
    )
}

fn width_mask(size: u8) -> u64 {
    if size >= 8 {
        u64::MAX
    } else {
        (1u64 << (size as u32 * 8)) - 1
    }
}

/// Computes the effective address of an instruction's memory operand.
///
/// With concrete (or absent) base and index the result is the concrete
/// `base + index*scale + disp`. Any symbolic component makes the result
/// symbolic, with an identity folded from each symbolic register's slot
/// id, symbol id and offset, then the scale and displacement, in that
/// order. RIP-relative operands are always symbolic. A symbolic address
/// based on RSP is tagged with the stack sentinel.
pub fn memory_address(instr: &Instruction, ctx: &Context) -> Value {
    let mut symbolic = false;
    let mut value = 0u64;
    let mut symbol = 0u64;

    let base = instr.memory_base();
    if base == Register::RIP {
        symbolic = true;
        hash_combine(&mut symbol, u64::from(u16::MAX));
    } else if base != Register::None {
        fold_register(base, ctx, &mut symbolic, &mut value, &mut symbol, 1);
    }

    let index = instr.memory_index();
    if index != Register::None {
        let scale = instr.memory_index_scale() as u64;
        fold_register(index, ctx, &mut symbolic, &mut value, &mut symbol, scale);
        hash_combine(&mut symbol, scale);
    }

    let disp = instr.memory_displacement64();
    if disp != 0 {
        value = value.wrapping_add(disp);
        hash_combine(&mut symbol, disp);
    }
    if instr.memory_size().size() == 0 {
        hash_combine(&mut symbol, 1);
    }

    if symbolic {
        if base == Register::RSP {
            symbol = stack_sentinel() | (symbol & 0xFFFF_FFFF);
        }
        Value::with_symbol(None, 8, Symbol::new(symbol, 0))
    } else {
        Value::concrete(None, value)
    }
}

fn fold_register(
    reg: Register,
    ctx: &Context,
    symbolic: &mut bool,
    value: &mut u64,
    symbol: &mut u64,
    scale: u64,
) {
    let held = RegSlot::from_register(reg).and_then(|slot| ctx.get_register(slot));
    match held.and_then(|v| v.as_concrete()) {
        Some(v) => *value = value.wrapping_add(v.wrapping_mul(scale)),
        None => {
            *symbolic = true;
            if let Some(sym) = held.and_then(|v| v.symbol()) {
                if let Some(slot) = RegSlot::from_register(reg) {
                    hash_combine(symbol, slot.id() as u64);
                }
                hash_combine(symbol, sym.id);
                hash_combine(symbol, sym.offset as u64);
            }
        }
    }
}

fn mov_value(dst: &Value, src: &Value) -> Value {
    let size = dst.size();
    let mask = width_mask(size);
    match (dst.as_concrete(), src.as_concrete()) {
        (Some(d), Some(s)) if size < 4 => {
            Value::concrete_sized(src.source(), (d & !mask) | (s & mask), size)
        }
        (_, Some(s)) => Value::concrete_sized(src.source(), s & mask, size),
        _ => *src,
    }
}

fn arith_value(dst: &Value, src: &Value, op: fn(u64, u64) -> u64, ids: &SymbolIds) -> Value {
    let size = dst.size();
    let mask = width_mask(size);
    if let (Some(d), Some(s)) = (dst.as_concrete(), src.as_concrete()) {
        let result = op(d, s);
        if size < 4 {
            Value::concrete_sized(src.source(), (d & !mask) | (result & mask), size)
        } else {
            Value::concrete_sized(src.source(), result & mask, size)
        }
    } else if let (Some(sym), Some(s)) = (dst.symbol(), src.as_concrete()) {
        Value::with_symbol(
            src.source(),
            size,
            Symbol::new(sym.id, op(sym.offset as u64, s) as i64),
        )
    } else {
        Value::symbolic(src.source(), size, ids)
    }
}

/// Symbolic x86-64 emulator for one function's worth of contexts.
pub struct Emulator<'a> {
    ids: &'a SymbolIds,
    info: InstructionInfoFactory,
}

impl<'a> Emulator<'a> {
    /// Creates an emulator drawing fresh symbols from `ids`.
    pub fn new(ids: &'a SymbolIds) -> Self {
        Self {
            ids,
            info: InstructionInfoFactory::new(),
        }
    }

    /// Interprets one instruction at `addr` against `ctx`.
    pub fn emulate(&mut self, addr: Addr, instr: &Instruction, ctx: &mut Context) {
        match instr.mnemonic() {
            Mnemonic::Mov | Mnemonic::Movzx | Mnemonic::Movsx | Mnemonic::Movsxd => {
                self.emulate_binary(addr, instr, ctx, None)
            }
            Mnemonic::Add => self.emulate_binary(addr, instr, ctx, Some(u64::wrapping_add)),
            Mnemonic::Sub => self.emulate_binary(addr, instr, ctx, Some(u64::wrapping_sub)),
            Mnemonic::Or => self.emulate_binary(addr, instr, ctx, Some(|a, b| a | b)),
            Mnemonic::And => self.emulate_binary(addr, instr, ctx, Some(|a, b| a & b)),
            Mnemonic::Xor => self.emulate_binary(addr, instr, ctx, Some(|a, b| a ^ b)),
            Mnemonic::Imul => self.emulate_binary(addr, instr, ctx, Some(u64::wrapping_mul)),
            Mnemonic::Lea => self.emulate_lea(addr, instr, ctx),
            Mnemonic::Push => self.emulate_push(addr, instr, ctx),
            Mnemonic::Pop => self.emulate_pop(addr, instr, ctx),
            Mnemonic::Call => self.emulate_call(addr, ctx),
            Mnemonic::Ret => self.emulate_ret(addr, ctx),
            Mnemonic::Inc => self.emulate_step(addr, instr, ctx, 1),
            Mnemonic::Dec => self.emulate_step(addr, instr, ctx, -1),
            _ => self.clobber_writes(addr, instr, ctx),
        }
    }

    fn emulate_binary(
        &mut self,
        addr: Addr,
        instr: &Instruction,
        ctx: &mut Context,
        op: Option<fn(u64, u64) -> u64>,
    ) {
        let mut dst = self.operand(instr, 0, ctx, addr);
        let mut src = None;
        let mut imm = None;
        if instr.op_count() >= 2 {
            src = Some(self.operand(instr, 1, ctx, addr));
        }
        if instr.op_count() >= 3 && is_immediate(instr.op_kind(2)) {
            imm = Some(self.operand(instr, 2, ctx, addr).value);
        }

        let apply = |d: &Value, s: &Value, ids: &SymbolIds| match op {
            Some(op) => arith_value(d, s, op, ids),
            None => mov_value(d, s),
        };

        let zero_idiom = instr.mnemonic() == Mnemonic::Xor
            && dst.reg.is_some()
            && dst.reg == src.as_ref().and_then(|s| s.reg);
        dst.value = if zero_idiom {
            let width = src.as_ref().map_or(8, |s| s.value.size());
            Value::concrete_sized(Some(addr), 0, width)
        } else if let (Some(src), Some(imm)) = (&src, &imm) {
            apply(&src.value, imm, self.ids)
        } else if let Some(src) = &src {
            apply(&dst.value, &src.value, self.ids)
        } else {
            Value::symbolic(Some(addr), dst.value.size(), self.ids)
        };
        dst.value.set_source(Some(addr));

        if let Some(slot) = dst.reg {
            ctx.set_register(slot, dst.value);
        } else if let Some(address) = dst.address {
            ctx.set_memory(address, dst.value);
        }
    }

    fn emulate_lea(&mut self, addr: Addr, instr: &Instruction, ctx: &mut Context) {
        let dst = self.operand(instr, 0, ctx, addr);
        if let (Some(slot), Some(effective)) =
            (dst.reg, memory_address(instr, ctx).as_concrete())
        {
            ctx.set_register(slot, Value::concrete(Some(addr), effective));
        }
    }

    fn emulate_push(&mut self, addr: Addr, instr: &Instruction, ctx: &mut Context) {
        let Some(rsp) = ctx.get_register(RegSlot::RSP).and_then(|v| v.as_concrete()) else {
            return;
        };
        let new_rsp = rsp.wrapping_sub(8);
        let mut op = self.operand(instr, 0, ctx, addr);
        op.value.set_source(Some(addr));
        ctx.set_register(RegSlot::RSP, Value::concrete(Some(addr), new_rsp));
        ctx.set_memory(new_rsp, op.value);
    }

    fn emulate_pop(&mut self, addr: Addr, instr: &Instruction, ctx: &mut Context) {
        let Some(rsp) = ctx.get_register(RegSlot::RSP).and_then(|v| v.as_concrete()) else {
            return;
        };
        let dst = self.operand(instr, 0, ctx, addr);
        let slot_address = Value::concrete(None, rsp);
        let mut value = ctx
            .get_memory(rsp, 8)
            .exact
            .unwrap_or_else(|| Value::deref(Some(addr), &slot_address, 8));
        value.set_source(Some(addr));
        ctx.set_register(RegSlot::RSP, Value::concrete(Some(addr), rsp.wrapping_add(8)));
        if let Some(slot) = dst.reg {
            ctx.set_register(slot, value);
        } else if let Some(address) = dst.address {
            ctx.set_memory(address, value);
        }
    }

    /// Calls are abstracted as stack-balanced: RSP is left unchanged and
    /// the Microsoft x64 volatile register set is clobbered.
    fn emulate_call(&mut self, addr: Addr, ctx: &mut Context) {
        for slot in RegSlot::volatile() {
            ctx.set_register(slot, Value::symbolic(Some(addr), 8, self.ids));
        }
    }

    fn emulate_ret(&mut self, addr: Addr, ctx: &mut Context) {
        if let Some(rsp) = ctx.get_register(RegSlot::RSP).and_then(|v| v.as_concrete()) {
            ctx.set_register(RegSlot::RSP, Value::concrete(Some(addr), rsp.wrapping_add(8)));
        }
    }

    fn emulate_step(&mut self, addr: Addr, instr: &Instruction, ctx: &mut Context, delta: i64) {
        let dst = self.operand(instr, 0, ctx, addr);
        let result = match dst.value.as_concrete() {
            Some(v) => Value::concrete(Some(addr), v.wrapping_add_signed(delta)),
            None => {
                let sym = dst.value.symbol().unwrap_or(Symbol::new(0, 0));
                Value::with_symbol(
                    Some(addr),
                    8,
                    Symbol::new(sym.id, sym.offset.wrapping_add(delta)),
                )
            }
        };
        if let Some(slot) = dst.reg {
            ctx.set_register(slot, result);
        } else if let Some(address) = dst.address {
            ctx.set_memory(address, result);
        }
    }

    fn clobber_writes(&mut self, addr: Addr, instr: &Instruction, ctx: &mut Context) {
        let mut reg_writes: Vec<(RegSlot, u8)> = Vec::new();
        let mut memory_write = None;
        {
            let info = self.info.info(instr);
            for used in info.used_registers() {
                if is_write_access(used.access()) {
                    if let Some(slot) = RegSlot::from_register(used.register()) {
                        reg_writes.push((slot, used.register().size().min(8).max(1) as u8));
                    }
                }
            }
            for used in info.used_memory() {
                if is_write_access(used.access()) {
                    memory_write = Some(used.memory_size().size().min(8).max(1) as u8);
                }
            }
        }
        for (slot, size) in reg_writes {
            ctx.set_register(slot, Value::symbolic(Some(addr), size, self.ids));
        }
        if let Some(size) = memory_write {
            let explicit = (0..instr.op_count()).any(|i| instr.op_kind(i) == OpKind::Memory);
            if explicit {
                if let Some(address) = memory_address(instr, ctx).as_concrete() {
                    ctx.set_memory(address, Value::symbolic(Some(addr), size, self.ids));
                }
            }
        }
    }

    fn operand(&self, instr: &Instruction, index: u32, ctx: &Context, source: Addr) -> Operand {
        match instr.op_kind(index) {
            OpKind::Register => {
                let reg = instr.op_register(index);
                let slot = RegSlot::from_register(reg);
                let width = reg.size().min(8).max(1) as u8;
                let value = match slot.and_then(|s| ctx.get_register(s)) {
                    Some(mut held) => {
                        held.set_size(width);
                        held
                    }
                    None => Value::symbolic(Some(source), width, self.ids),
                };
                Operand {
                    reg: slot,
                    address: None,
                    value,
                }
            }
            OpKind::Memory => {
                let width = instr.memory_size().size().min(8) as u8;
                let effective = memory_address(instr, ctx);
                let address = effective.as_concrete();
                let value = if width > 0 {
                    address
                        .and_then(|a| ctx.get_memory(a, width).exact)
                        .unwrap_or_else(|| Value::deref(Some(source), &effective, width))
                } else {
                    Value::symbolic(Some(source), 8, self.ids)
                };
                Operand {
                    reg: None,
                    address,
                    value,
                }
            }
            kind if is_immediate(kind) => Operand {
                reg: None,
                address: None,
                value: Value::concrete(Some(source), instr.immediate(index)),
            },
            _ => Operand {
                reg: None,
                address: None,
                value: Value::symbolic(Some(source), 8, self.ids),
            },
        }
    }
}
