//! Canonical register slots and the persistent register file.
//!
//! The abstract machine tracks a fixed whitelist of x86-64 registers.
//! Every alias writes through to a single canonical slot: `eax`, `ax`,
//! `al` and `ah` all update the RAX slot, `xmm3` and `ymm3` the ZMM3
//! slot. Aliases outside the whitelist are silently ignored.

use crate::value::Value;
use iced_x86::Register;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A canonical register slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RegSlot {
    /// General-purpose register, numbered rax..r15 in encoding order.
    Gpr(u8),
    /// Segment register, numbered es, cs, ss, ds, fs, gs.
    Seg(u8),
    /// Vector register in its widest (zmm) form.
    Vec(u8),
}

impl RegSlot {
    /// The stack pointer slot.
    pub const RSP: RegSlot = RegSlot::Gpr(4);

    /// Canonicalizes a decoder register to its tracked slot, widening
    /// sub-registers and vector registers. Returns `None` for registers
    /// outside the whitelist (rip, flags, control registers, ...).
    pub fn from_register(reg: Register) -> Option<RegSlot> {
        if reg == Register::None || reg == Register::RIP {
            return None;
        }
        if reg.is_segment_register() {
            return Some(RegSlot::Seg(reg.number() as u8));
        }
        let full = reg.full_register();
        if full.is_gpr64() {
            Some(RegSlot::Gpr(full.number() as u8))
        } else if full.is_zmm() {
            Some(RegSlot::Vec(full.number() as u8))
        } else {
            None
        }
    }

    /// Stable numeric id, folded into symbolic address identities.
    pub fn id(self) -> u16 {
        match self {
            RegSlot::Gpr(n) => n as u16,
            RegSlot::Seg(n) => 32 + n as u16,
            RegSlot::Vec(n) => 64 + n as u16,
        }
    }

    /// Every tracked slot, in a fixed order.
    pub fn tracked() -> impl Iterator<Item = RegSlot> {
        (0..16)
            .map(RegSlot::Gpr)
            .chain((0..6).map(RegSlot::Seg))
            .chain((0..16).map(RegSlot::Vec))
    }

    /// The registers a callee may clobber under the Microsoft x64 ABI.
    pub fn volatile() -> impl Iterator<Item = RegSlot> {
        [
            RegSlot::Gpr(0),  // rax
            RegSlot::Gpr(1),  // rcx
            RegSlot::Gpr(2),  // rdx
            RegSlot::Gpr(8),  // r8
            RegSlot::Gpr(9),  // r9
            RegSlot::Gpr(10), // r10
            RegSlot::Gpr(11), // r11
        ]
        .into_iter()
        .chain((0..6).map(RegSlot::Vec))
    }
}

const GPR_NAMES: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12", "r13",
    "r14", "r15",
];
const SEG_NAMES: [&str; 6] = ["es", "cs", "ss", "ds", "fs", "gs"];

impl fmt::Display for RegSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            RegSlot::Gpr(n) => write!(f, "{}", GPR_NAMES[n as usize % 16]),
            RegSlot::Seg(n) => write!(f, "{}", SEG_NAMES[n as usize % 6]),
            RegSlot::Vec(n) => write!(f, "zmm{}", n),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct RegNode {
    parent: Option<Arc<RegNode>>,
    slots: HashMap<RegSlot, Value>,
}

/// A persistent register file.
///
/// Forking a child is O(1): the child holds an empty overlay referencing
/// the parent's node. Lookups walk the parent chain, newest write first.
#[derive(Debug, Clone, Default)]
pub struct RegisterFile {
    node: Arc<RegNode>,
}

impl RegisterFile {
    /// Creates an empty register file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Forks a child file sharing this file's history.
    pub fn fork(&self) -> Self {
        Self {
            node: Arc::new(RegNode {
                parent: Some(self.node.clone()),
                slots: HashMap::new(),
            }),
        }
    }

    /// Reads a slot, following the parent chain.
    pub fn get(&self, slot: RegSlot) -> Option<Value> {
        let mut node = Some(&self.node);
        while let Some(n) = node {
            if let Some(value) = n.slots.get(&slot) {
                return Some(*value);
            }
            node = n.parent.as_ref();
        }
        None
    }

    /// Writes a slot into the newest overlay.
    pub fn set(&mut self, slot: RegSlot, value: Value) {
        Arc::make_mut(&mut self.node).slots.insert(slot, value);
    }
}
