//! Property tests for the struct-merge algebra.
//!
//! Merging recovered structs must be idempotent, and commutative up to
//! field order at one offset: merging in either direction yields the
//! same multiset of (offset, kind, size, count) rows.

use carve_analysis::{merge_strucs, new_struc, FieldKind, StrucRef};
use proptest::prelude::*;

#[derive(Debug, Clone, Copy)]
enum FieldSpec {
    Int { offset: u64, size: u64, signed: bool },
    Float { offset: u64, size: u64 },
    Pointer { offset: u64 },
}

fn arb_field() -> impl Strategy<Value = FieldSpec> {
    let offsets = prop::sample::select(vec![0u64, 4, 8, 12, 16, 24, 32]);
    prop_oneof![
        (
            offsets.clone(),
            prop::sample::select(vec![1u64, 2, 4, 8]),
            prop::bool::ANY
        )
            .prop_map(|(offset, size, signed)| FieldSpec::Int {
                offset,
                size,
                signed
            }),
        (offsets.clone(), prop::sample::select(vec![4u64, 8]))
            .prop_map(|(offset, size)| FieldSpec::Float { offset, size }),
        offsets.prop_map(|offset| FieldSpec::Pointer { offset }),
    ]
}

fn build(fields: &[FieldSpec]) -> StrucRef {
    let struc = new_struc("p".into());
    {
        let mut guard = struc.lock().unwrap();
        for spec in fields {
            match *spec {
                FieldSpec::Int {
                    offset,
                    size,
                    signed,
                } => guard.add_int_field(offset, size, signed, 1),
                FieldSpec::Float { offset, size } => guard.add_float_field(offset, size, 1),
                FieldSpec::Pointer { offset } => guard.add_pointer_field(offset, 1, None),
            }
        }
    }
    struc
}

fn rows(struc: &StrucRef) -> Vec<(u64, FieldKind, u64, u64)> {
    let mut rows: Vec<_> = struc
        .lock()
        .unwrap()
        .fields()
        .map(|(off, f)| (off, f.kind, f.size, f.count))
        .collect();
    rows.sort();
    rows
}

/// Rows with integer signedness erased: whichever side is merged first
/// decides between int and uint, so commutativity holds only up to
/// signedness.
fn unsigned_rows(struc: &StrucRef) -> Vec<(u64, FieldKind, u64, u64)> {
    rows(struc)
        .into_iter()
        .map(|(off, kind, size, count)| {
            let kind = if kind == FieldKind::Int {
                FieldKind::UInt
            } else {
                kind
            };
            (off, kind, size, count)
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    #[test]
    fn merge_is_idempotent(
        a in prop::collection::vec(arb_field(), 0..8),
        b in prop::collection::vec(arb_field(), 0..8),
    ) {
        let dst = build(&a);
        let src = build(&b);
        merge_strucs(&dst, &src);
        let once = rows(&dst);
        merge_strucs(&dst, &src);
        prop_assert_eq!(rows(&dst), once);
    }

    #[test]
    fn merge_commutes_as_multiset(
        a in prop::collection::vec(arb_field(), 0..8),
        b in prop::collection::vec(arb_field(), 0..8),
    ) {
        let ab = build(&a);
        merge_strucs(&ab, &build(&b));
        let ba = build(&b);
        merge_strucs(&ba, &build(&a));
        prop_assert_eq!(unsigned_rows(&ab), unsigned_rows(&ba));
    }

    #[test]
    fn self_merge_is_identity(a in prop::collection::vec(arb_field(), 0..8)) {
        let struc = build(&a);
        let before = rows(&struc);
        merge_strucs(&struc, &struc);
        prop_assert_eq!(rows(&struc), before);
    }
}
