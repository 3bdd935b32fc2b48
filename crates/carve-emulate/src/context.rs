//! Abstract machine snapshots.
//!
//! A [`Context`] is a persistent snapshot of registers and memory at one
//! instruction point. Children are forked copy-on-write, so propagating a
//! context down a path is cheap and never disturbs the parent.
//!
//! Every context carries a running hash summarising the register writes
//! seen on the path that produced it. The hash deliberately ignores
//! memory state: contexts that differ only in memory collapse together,
//! which keeps the per-instruction context sets small.

use crate::memory::{Memory, MemoryValues};
use crate::registers::{RegSlot, RegisterFile};
use crate::value::{hash_combine, stack_sentinel, Addr, SymbolIds, Value};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// A register/memory snapshot at an instruction point.
#[derive(Debug, Clone)]
pub struct Context {
    id: u64,
    caller_id: u64,
    hash: u64,
    registers: RegisterFile,
    memory: Memory,
}

impl Context {
    /// Creates the initial context for a function entered at `entry`.
    ///
    /// Every tracked register holds a fresh symbolic value sourced at the
    /// entry point; RSP holds the concrete frame-base sentinel.
    pub fn initial(entry: Addr, ids: &SymbolIds) -> Self {
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        let mut context = Self {
            id,
            caller_id: id,
            hash: 0,
            registers: RegisterFile::new(),
            memory: Memory::new(),
        };
        for slot in RegSlot::tracked() {
            context.set_register(slot, Value::symbolic(Some(entry), 8, ids));
        }
        context.set_register(RegSlot::RSP, Value::concrete(Some(entry), stack_sentinel()));
        context
    }

    /// Forks a child context inheriting this context's state and hash.
    pub fn make_child(&self) -> Self {
        Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            caller_id: self.caller_id,
            hash: self.hash,
            registers: self.registers.fork(),
            memory: self.memory.fork(),
        }
    }

    /// Unique id of this context.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Id of the context that invoked the current function, or this
    /// context's own id at top level.
    pub fn caller_id(&self) -> u64 {
        self.caller_id
    }

    /// Running register-write hash.
    pub fn hash(&self) -> u64 {
        self.hash
    }

    /// Reads a tracked register slot.
    pub fn get_register(&self, slot: RegSlot) -> Option<Value> {
        self.registers.get(slot)
    }

    /// Writes a tracked register slot, folding the update into the hash.
    ///
    /// The old value contributes its source and fingerprint; the slot id
    /// itself is folded only on first assignment. The new value
    /// contributes its fingerprint and source.
    pub fn set_register(&mut self, slot: RegSlot, value: Value) {
        match self.get_register(slot) {
            Some(old) => {
                hash_combine(&mut self.hash, old.source().unwrap_or(0));
                hash_combine(&mut self.hash, old.fingerprint());
            }
            None => hash_combine(&mut self.hash, slot.id() as u64),
        }
        hash_combine(&mut self.hash, value.fingerprint());
        hash_combine(&mut self.hash, value.source().unwrap_or(0));
        self.registers.set(slot, value);
    }

    /// Reads `size` bytes of memory.
    pub fn get_memory(&self, address: u64, size: u8) -> MemoryValues {
        self.memory.get(address, size)
    }

    /// Stores a value in memory.
    pub fn set_memory(&mut self, address: u64, value: Value) {
        self.memory.set(address, value);
    }
}

/// An in-flight set of contexts, deduplicated by hash.
#[derive(Debug, Default)]
pub struct Contexts {
    items: Vec<Context>,
}

impl Contexts {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a singleton set.
    pub fn single(context: Context) -> Self {
        Self {
            items: vec![context],
        }
    }

    /// Inserts a context unless one with the same hash is present.
    pub fn push(&mut self, context: Context) {
        if !self.items.iter().any(|c| c.hash() == context.hash()) {
            self.items.push(context);
        }
    }

    /// Returns true if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of contexts in the set.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Drains the set in insertion order.
    pub fn drain(&mut self) -> impl Iterator<Item = Context> + '_ {
        self.items.drain(..)
    }

    /// Iterates the set in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Context> {
        self.items.iter()
    }

    /// Forks a child for every context in the set.
    pub fn make_children(&self) -> Contexts {
        let mut children = Contexts::new();
        for context in &self.items {
            children.push(context.make_child());
        }
        children
    }
}
