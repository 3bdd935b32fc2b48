//! Recovered aggregate types.
//!
//! A [`StructDef`] is an offset-keyed multimap of fields. Several fields
//! may share an offset (a union at that offset). Struct graphs may
//! cycle through pointer fields, so definitions are shared behind
//! `Arc<Mutex<..>>` and merging short-circuits on already-visited pairs.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex};

/// Shared handle to a struct definition.
pub type StrucRef = Arc<Mutex<StructDef>>;

/// Creates a shared, empty struct definition.
pub fn new_struc(name: String) -> StrucRef {
    Arc::new(Mutex::new(StructDef::new(name)))
}

/// Field type classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FieldKind {
    /// Unsigned integer.
    UInt,
    /// Signed integer.
    Int,
    /// Floating point.
    Float,
    /// Pointer, optionally to a known struct.
    Pointer,
    /// Inline struct embed.
    Struct,
}

/// One field of a recovered struct.
#[derive(Debug, Clone)]
pub struct Field {
    /// Type classification.
    pub kind: FieldKind,
    /// Element width in bytes (0 for inline struct embeds).
    pub size: u64,
    /// Element count; larger than 1 for array fields.
    pub count: u64,
    /// Referenced struct for pointer/embed fields.
    pub target: Option<StrucRef>,
}

impl Field {
    /// Bytes covered by this field.
    pub fn byte_span(&self) -> u64 {
        self.size * self.count
    }

    /// True when the two fields describe the same thing.
    fn same_as(&self, other: &Field) -> bool {
        self.kind == other.kind
            && self.size == other.size
            && match (&self.target, &other.target) {
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                (None, None) => true,
                _ => false,
            }
    }

    /// The C spelling of this field's type.
    pub fn type_name(&self, self_name: &str, self_ref: Option<&StrucRef>) -> String {
        let target_name = |target: &StrucRef| -> String {
            match self_ref {
                Some(me) if Arc::ptr_eq(me, target) => self_name.to_string(),
                _ => target.lock().unwrap().name.clone(),
            }
        };
        match self.kind {
            FieldKind::UInt => match self.size {
                1 => "uint8_t".into(),
                2 => "uint16_t".into(),
                4 => "uint32_t".into(),
                _ => "uint64_t".into(),
            },
            FieldKind::Int => match self.size {
                1 => "int8_t".into(),
                2 => "int16_t".into(),
                4 => "int32_t".into(),
                _ => "int64_t".into(),
            },
            FieldKind::Float => match self.size {
                2 => "f16_t".into(),
                4 => "float".into(),
                8 => "double".into(),
                _ => "long double".into(),
            },
            FieldKind::Pointer => match &self.target {
                Some(target) => format!("struct {}*", target_name(target)),
                None => "void*".into(),
            },
            FieldKind::Struct => match &self.target {
                Some(target) => format!("struct {}", target_name(target)),
                None => "struct {}".into(),
            },
        }
    }
}

/// A recovered aggregate definition.
#[derive(Debug, Default)]
pub struct StructDef {
    /// Deterministic name.
    pub name: String,
    fields: BTreeMap<u64, Vec<Field>>,
    covered: BTreeSet<u64>,
}

impl StructDef {
    /// Creates an empty definition.
    pub fn new(name: String) -> Self {
        Self {
            name,
            ..Self::default()
        }
    }

    /// Fields flattened in (offset, insertion) order.
    pub fn fields(&self) -> impl Iterator<Item = (u64, &Field)> {
        self.fields
            .iter()
            .flat_map(|(&off, bucket)| bucket.iter().map(move |f| (off, f)))
    }

    /// True when no field was recorded.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// True when some field starts at `offset`.
    pub fn has_field_at(&self, offset: u64) -> bool {
        self.covered.contains(&offset)
    }

    /// Total size: end of the widest field at the highest offset.
    pub fn size(&self) -> u64 {
        let Some((&offset, bucket)) = self.fields.last_key_value() else {
            return 0;
        };
        let widest = bucket.iter().map(|f| f.size.max(1)).max().unwrap_or(1);
        offset + widest
    }

    /// Adds an integer field unless an integer or pointer of the same
    /// width already covers the offset.
    pub fn add_int_field(&mut self, offset: u64, size: u64, signed: bool, count: u64) {
        let duplicate = self.overlapping(offset).any(|(_, f)| {
            f.size == size
                && matches!(f.kind, FieldKind::UInt | FieldKind::Int | FieldKind::Pointer)
        });
        if duplicate {
            return;
        }
        self.add_field(
            offset,
            Field {
                kind: if signed { FieldKind::Int } else { FieldKind::UInt },
                size,
                count,
                target: None,
            },
        );
    }

    /// Adds a float field. A float of the same width at the same offset
    /// is folded (keeping the larger count); integer fields of the same
    /// width stay alongside as a union member.
    pub fn add_float_field(&mut self, offset: u64, size: u64, count: u64) {
        if let Some(bucket) = self.fields.get_mut(&offset) {
            if let Some(existing) = bucket
                .iter_mut()
                .find(|f| f.kind == FieldKind::Float && f.size == size)
            {
                existing.count = existing.count.max(count);
                return;
            }
        }
        self.add_field(
            offset,
            Field {
                kind: FieldKind::Float,
                size,
                count,
                target: None,
            },
        );
    }

    /// Adds a pointer field, replacing any 8-byte integer aliases at the
    /// offset. An existing pointer field absorbs the new one: a known
    /// target is kept, an unknown one adopts the new target. Target
    /// unification across structs happens at merge time, never while a
    /// definition is locked.
    pub fn add_pointer_field(&mut self, offset: u64, count: u64, target: Option<StrucRef>) {
        let mut count = count;
        if let Some(bucket) = self.fields.get_mut(&offset) {
            bucket.retain(|f| {
                let alias = f.size == 8
                    && matches!(f.kind, FieldKind::UInt | FieldKind::Int);
                if alias {
                    count = count.max(f.count);
                }
                !alias
            });
            if let Some(existing) = bucket.iter_mut().find(|f| f.kind == FieldKind::Pointer) {
                if existing.target.is_none() {
                    existing.target = target;
                }
                existing.count = existing.count.max(count);
                return;
            }
        }
        self.add_field(
            offset,
            Field {
                kind: FieldKind::Pointer,
                size: 8,
                count,
                target,
            },
        );
    }

    /// Adds an inline struct embed.
    pub fn add_struct_field(&mut self, offset: u64, target: StrucRef) {
        let duplicate = self
            .fields
            .get(&offset)
            .map_or(false, |bucket| {
                bucket.iter().any(|f| {
                    f.kind == FieldKind::Struct
                        && f.target.as_ref().is_some_and(|t| Arc::ptr_eq(t, &target))
                })
            });
        if duplicate {
            return;
        }
        self.add_field(
            offset,
            Field {
                kind: FieldKind::Struct,
                size: 0,
                count: 1,
                target: Some(target),
            },
        );
    }

    fn add_field(&mut self, offset: u64, field: Field) {
        if self
            .fields
            .get(&offset)
            .is_some_and(|bucket| bucket.iter().any(|f| f.same_as(&field)))
        {
            return;
        }
        for i in 0..field.count {
            self.covered.insert(offset + i * field.size);
        }
        self.fields.entry(offset).or_default().push(field);
    }

    /// Fields whose span covers `offset`.
    fn overlapping(&self, offset: u64) -> impl Iterator<Item = (u64, &Field)> {
        self.fields
            .range(..=offset)
            .flat_map(|(&off, bucket)| bucket.iter().map(move |f| (off, f)))
            .filter(move |(off, f)| off + f.byte_span().max(1) > offset)
    }
}

/// Merges `src` into `dst`, idempotently.
///
/// Pointer fields at matching aligned offsets recurse into their target
/// structs; everything else is copied through the aliasing rules. A
/// visited set of (dst, src) pairs bounds recursion over cyclic struct
/// graphs.
pub fn merge_strucs(dst: &StrucRef, src: &StrucRef) {
    let mut visited = HashSet::new();
    merge_into(dst, src, &mut visited);
}

fn merge_into(dst: &StrucRef, src: &StrucRef, visited: &mut HashSet<(usize, usize)>) {
    if Arc::ptr_eq(dst, src) {
        return;
    }
    let pair = (Arc::as_ptr(dst) as usize, Arc::as_ptr(src) as usize);
    if !visited.insert(pair) {
        return;
    }

    let src_fields: Vec<(u64, Field)> = {
        let guard = src.lock().unwrap();
        guard.fields().map(|(off, f)| (off, f.clone())).collect()
    };
    for (offset, field) in src_fields {
        if try_merge_pointer_targets(dst, offset, &field, visited) {
            continue;
        }
        let mut guard = dst.lock().unwrap();
        match field.kind {
            FieldKind::Pointer => {
                guard.add_pointer_field(offset, field.count, field.target.clone())
            }
            FieldKind::Float => guard.add_float_field(offset, field.size, field.count),
            FieldKind::Int | FieldKind::UInt => guard.add_int_field(
                offset,
                field.size,
                field.kind == FieldKind::Int,
                field.count,
            ),
            FieldKind::Struct => {
                if let Some(target) = field.target.clone() {
                    guard.add_struct_field(offset, target);
                }
            }
        }
    }
}

/// When `dst` already holds a pointer field overlapping `offset` at the
/// same 8-byte alignment and both sides know their targets, merge the
/// targets instead of adding a second field. Returns true if handled.
fn try_merge_pointer_targets(
    dst: &StrucRef,
    offset: u64,
    src_field: &Field,
    visited: &mut HashSet<(usize, usize)>,
) -> bool {
    if src_field.kind != FieldKind::Pointer {
        return false;
    }
    let Some(src_target) = &src_field.target else {
        return false;
    };
    let overlapping: Vec<StrucRef> = {
        let guard = dst.lock().unwrap();
        guard
            .fields()
            .filter(|(off, f)| {
                f.kind == FieldKind::Pointer
                    && f.target.is_some()
                    && *off <= offset
                    && off + f.byte_span() > offset
                    && off % 8 == offset % 8
            })
            .filter_map(|(_, f)| f.target.clone())
            .collect()
    };
    if overlapping.is_empty() {
        return false;
    }
    for target in overlapping {
        merge_into(&target, src_target, visited);
    }
    true
}
