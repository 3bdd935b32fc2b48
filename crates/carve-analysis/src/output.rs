//! C header rendering of recovered structs.

use crate::struc::StrucRef;
use std::collections::BTreeMap;
use std::fmt::Write;

/// Renders one struct as a C definition.
///
/// Fields are emitted in ascending offset order; fields overlapping an
/// earlier field are folded into a union. Gaps become `char` padding
/// arrays. Field names are `field_<offset>` with a `_<k>` suffix inside
/// unions; offsets are zero-padded to four hex digits.
pub fn render_struc(handle: &StrucRef) -> String {
    let def = handle.lock().unwrap();
    let flat: Vec<(u64, crate::struc::Field)> =
        def.fields().map(|(off, f)| (off, f.clone())).collect();

    let mut out = String::new();
    writeln!(out, "struct {} {{", def.name).unwrap();

    let mut next_offset = 0u64;
    let mut i = 0;
    while i < flat.len() {
        let base_offset = flat[i].0;
        if base_offset > next_offset {
            writeln!(
                out,
                "    char _padding_{:04x}[{:#06x}];",
                next_offset,
                base_offset - next_offset
            )
            .unwrap();
        }
        next_offset = base_offset + flat[i].1.byte_span();
        let mut members = 1;
        let mut j = i + 1;
        while j < flat.len() {
            let (prev_offset, prev_field) = &flat[j - 1];
            let prev_end = prev_offset + prev_field.byte_span();
            if prev_end <= flat[j].0 {
                break;
            }
            if next_offset < prev_end {
                next_offset = prev_end;
            }
            members += 1;
            j += 1;
        }

        let is_union = members > 1;
        let indent = if is_union { "        " } else { "    " };
        if is_union {
            out.push_str("    union {\n");
        }
        for (k, (offset, field)) in flat[i..j].iter().enumerate() {
            let type_name = field.type_name(&def.name, Some(handle));
            if *offset == base_offset {
                write!(out, "{}{} field_{:04x}", indent, type_name, offset).unwrap();
            } else {
                write!(
                    out,
                    "{}struct {{ char _padding[{:#06x}]; {} value",
                    indent,
                    offset - base_offset,
                    type_name
                )
                .unwrap();
                if field.count > 1 {
                    write!(out, "[{}]", field.count).unwrap();
                }
                write!(out, "; }} field_{:04x}", offset).unwrap();
            }
            if is_union {
                write!(out, "_{}", k + 1).unwrap();
            }
            if *offset == base_offset && field.count > 1 {
                write!(out, "[{}]", field.count).unwrap();
            }
            out.push_str(";\n");
        }
        if is_union {
            out.push_str("    };\n");
        }
        i = j;
    }
    out.push_str("};\n");
    out
}

/// Renders the whole struct table in name order.
pub fn render_all(strucs: &BTreeMap<String, StrucRef>) -> String {
    let mut out = String::new();
    for handle in strucs.values() {
        out.push_str(&render_struc(handle));
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::struc::new_struc;

    #[test]
    fn renders_fields_padding_and_arrays() {
        let s = new_struc("demo".into());
        {
            let mut s = s.lock().unwrap();
            s.add_int_field(0, 4, true, 1);
            s.add_int_field(8, 4, false, 4);
        }
        let text = render_struc(&s);
        assert_eq!(
            text,
            "struct demo {\n\
             \x20   int32_t field_0000;\n\
             \x20   char _padding_0004[0x0004];\n\
             \x20   uint32_t field_0008[4];\n\
             };\n"
        );
    }

    #[test]
    fn renders_union_members_in_discovery_order() {
        let s = new_struc("u".into());
        {
            let mut s = s.lock().unwrap();
            s.add_float_field(0, 4, 1);
            s.add_int_field(0, 4, true, 1);
        }
        let text = render_struc(&s);
        assert_eq!(
            text,
            "struct u {\n\
             \x20   union {\n\
             \x20       float field_0000_1;\n\
             \x20       int32_t field_0000_2;\n\
             \x20   };\n\
             };\n"
        );
    }

    #[test]
    fn renders_pointer_fields_by_target_name() {
        let inner = new_struc("inner".into());
        inner.lock().unwrap().add_int_field(0, 4, true, 1);
        let outer = new_struc("outer".into());
        outer
            .lock()
            .unwrap()
            .add_pointer_field(0x10, 1, Some(inner.clone()));

        let text = render_struc(&outer);
        assert!(text.contains("struct inner* field_0010;"), "{}", text);
        assert!(text.contains("char _padding_0000[0x0010];"), "{}", text);
    }
}
