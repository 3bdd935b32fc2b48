//! Persistent byte-addressed memory.
//!
//! Stores one value per written address; each value implicitly covers
//! `size` bytes. Reads collect every stored value overlapping the
//! requested range, which is all the synthesis layer needs. Exact
//! byte-level reconstruction of partially overwritten values is not
//! attempted.

use crate::value::Value;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::Arc;

/// Result of a memory read.
#[derive(Debug, Clone, Default)]
pub struct MemoryValues {
    /// The stored value, when a write at exactly this address and width
    /// exists.
    pub exact: Option<Value>,
    /// Every stored value whose range overlaps the read.
    pub sources: Vec<Value>,
}

#[derive(Debug, Clone, Default)]
struct MemNode {
    parent: Option<Arc<MemNode>>,
    writes: BTreeMap<u64, Value>,
}

/// A persistent memory store with O(1) forking.
#[derive(Debug, Clone, Default)]
pub struct Memory {
    node: Arc<MemNode>,
}

impl Memory {
    /// Creates an empty memory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Forks a child memory sharing this memory's history.
    pub fn fork(&self) -> Self {
        Self {
            node: Arc::new(MemNode {
                parent: Some(self.node.clone()),
                writes: BTreeMap::new(),
            }),
        }
    }

    /// Stores `value` at `address`.
    pub fn set(&mut self, address: u64, value: Value) {
        Arc::make_mut(&mut self.node).writes.insert(address, value);
    }

    /// Reads `size` bytes at `address`.
    ///
    /// Values written in newer overlays shadow older writes at the same
    /// address; distinct addresses within the range all contribute.
    pub fn get(&self, address: u64, size: u8) -> MemoryValues {
        let end = address.wrapping_add(size as u64);
        // A stored value covers at most 8 bytes, so overlap candidates
        // start no earlier than 7 bytes below the read.
        let scan_from = address.saturating_sub(7);

        let mut newest: BTreeMap<u64, Value> = BTreeMap::new();
        let mut node = Some(&self.node);
        while let Some(n) = node {
            for (&at, value) in n.writes.range(scan_from..end) {
                if let Entry::Vacant(slot) = newest.entry(at) {
                    slot.insert(*value);
                }
            }
            node = n.parent.as_ref();
        }

        let mut result = MemoryValues::default();
        for (&at, value) in &newest {
            let covered = at.wrapping_add(value.size().max(1) as u64);
            if at < end && covered > address {
                result.sources.push(*value);
                if at == address && value.size() == size {
                    result.exact = Some(*value);
                }
            }
        }
        result
    }
}
