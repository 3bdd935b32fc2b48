//! End-to-end recovery scenarios over small assembled fixtures.

mod common;

use carve_analysis::{recover_structs, render_all, render_struc, FieldKind};
use carve_pe::PeImage;
use common::{build_pe, recover, shapes};
use iced_x86::code_asm::*;

#[test]
fn flat_struct_with_three_scalars() {
    // void f(S* s) reading s->a (int32), s->b (int32), s->c (double).
    let mut asm = CodeAssembler::new(64).unwrap();
    asm.movsxd(rax, dword_ptr(rcx)).unwrap();
    asm.movsxd(rdx, dword_ptr(rcx + 4)).unwrap();
    asm.movsd_2(xmm0, qword_ptr(rcx + 8)).unwrap();
    asm.ret().unwrap();

    let strucs = recover(&asm.assemble(0x200).unwrap());
    assert_eq!(strucs.len(), 1);
    let struc = strucs.values().next().unwrap();
    assert_eq!(
        shapes(struc),
        vec![
            (0, FieldKind::Int, 4, 1),
            (4, FieldKind::Int, 4, 1),
            (8, FieldKind::Float, 8, 1),
        ]
    );
    assert_eq!(struc.lock().unwrap().size(), 16);

    let text = render_struc(struc);
    assert!(text.contains("int32_t field_0000;"), "{}", text);
    assert!(text.contains("int32_t field_0004;"), "{}", text);
    assert!(text.contains("double field_0008;"), "{}", text);
}

#[test]
fn consecutive_reads_collapse_into_array() {
    // Reads s->a[0..3] as 32-bit ints.
    let mut asm = CodeAssembler::new(64).unwrap();
    asm.movsxd(rax, dword_ptr(rcx)).unwrap();
    asm.movsxd(rdx, dword_ptr(rcx + 4)).unwrap();
    asm.movsxd(r8, dword_ptr(rcx + 8)).unwrap();
    asm.movsxd(r9, dword_ptr(rcx + 12)).unwrap();
    asm.ret().unwrap();

    let strucs = recover(&asm.assemble(0x200).unwrap());
    assert_eq!(strucs.len(), 1);
    let struc = strucs.values().next().unwrap();
    assert_eq!(shapes(struc), vec![(0, FieldKind::Int, 4, 4)]);
    assert!(render_struc(struc).contains("int32_t field_0000[4];"));
}

#[test]
fn pointer_chain_links_two_structs() {
    // t = s->p; x = t->q;
    let mut asm = CodeAssembler::new(64).unwrap();
    asm.mov(rax, qword_ptr(rcx + 0x10)).unwrap();
    asm.movsxd(rdx, dword_ptr(rax + 8)).unwrap();
    asm.ret().unwrap();

    let strucs = recover(&asm.assemble(0x200).unwrap());
    assert_eq!(strucs.len(), 2);

    let outer = strucs
        .values()
        .find(|s| {
            s.lock()
                .unwrap()
                .fields()
                .any(|(_, f)| f.kind == FieldKind::Pointer)
        })
        .expect("an outer struct with a pointer field");
    let outer_shapes = shapes(outer);
    assert_eq!(outer_shapes, vec![(0x10, FieldKind::Pointer, 8, 1)]);

    let inner = {
        let guard = outer.lock().unwrap();
        let (_, field) = guard.fields().next().unwrap();
        field.target.clone().expect("pointer target")
    };
    assert_eq!(shapes(&inner), vec![(8, FieldKind::Int, 4, 1)]);

    let inner_name = inner.lock().unwrap().name.clone();
    let text = render_struc(outer);
    assert!(
        text.contains(&format!("struct {}* field_0010;", inner_name)),
        "{}",
        text
    );
}

#[test]
fn float_and_int_reads_union_at_offset_zero() {
    // One path reads *(float*)(s+0), the other *(int*)(s+0).
    let mut asm = CodeAssembler::new(64).unwrap();
    let mut other = asm.create_label();
    asm.test(rdx, rdx).unwrap();
    asm.jne(other).unwrap();
    asm.movss(xmm0, dword_ptr(rcx)).unwrap();
    asm.ret().unwrap();
    asm.set_label(&mut other).unwrap();
    asm.movsxd(rax, dword_ptr(rcx)).unwrap();
    asm.ret().unwrap();

    let strucs = recover(&asm.assemble(0x200).unwrap());
    assert_eq!(strucs.len(), 1);
    let struc = strucs.values().next().unwrap();
    assert_eq!(
        shapes(struc),
        vec![(0, FieldKind::Float, 4, 1), (0, FieldKind::Int, 4, 1)]
    );

    let text = render_struc(struc);
    assert!(text.contains("union {"), "{}", text);
    assert!(text.contains("float field_0000_1;"), "{}", text);
    assert!(text.contains("int32_t field_0000_2;"), "{}", text);
}

#[test]
fn stack_passed_pointer_merges_callee_struct_into_caller() {
    // The caller pushes a struct pointer; the callee reads it back from
    // its first stack argument slot and dereferences a field.
    let mut asm = CodeAssembler::new(64).unwrap();
    let mut callee = asm.create_label();
    asm.movsxd(rax, dword_ptr(rcx)).unwrap();
    asm.push(rcx).unwrap();
    asm.call(callee).unwrap();
    asm.ret().unwrap();
    asm.set_label(&mut callee).unwrap();
    asm.mov(rax, qword_ptr(rsp + 8)).unwrap();
    asm.movsxd(rdx, dword_ptr(rax + 4)).unwrap();
    asm.ret().unwrap();

    let strucs = recover(&asm.assemble(0x200).unwrap());
    assert_eq!(strucs.len(), 1, "callee struct must merge into caller's");
    let struc = strucs.values().next().unwrap();
    assert_eq!(
        shapes(struc),
        vec![(0, FieldKind::Int, 4, 1), (4, FieldKind::Int, 4, 1)]
    );
}

#[test]
fn register_passed_pointer_merges_callee_struct_into_caller() {
    let mut asm = CodeAssembler::new(64).unwrap();
    let mut callee = asm.create_label();
    asm.movsxd(rax, dword_ptr(rcx)).unwrap();
    asm.call(callee).unwrap();
    asm.ret().unwrap();
    asm.set_label(&mut callee).unwrap();
    asm.movsxd(rdx, dword_ptr(rcx + 8)).unwrap();
    asm.ret().unwrap();

    let strucs = recover(&asm.assemble(0x200).unwrap());
    assert_eq!(strucs.len(), 1);
    let struc = strucs.values().next().unwrap();
    assert_eq!(
        shapes(struc),
        vec![(0, FieldKind::Int, 4, 1), (8, FieldKind::Int, 4, 1)]
    );
}

#[test]
fn loop_over_array_terminates_with_one_struct() {
    // for (i = 0; i < 64; i++) acc += s->arr[i];
    let mut asm = CodeAssembler::new(64).unwrap();
    let mut top = asm.create_label();
    asm.xor(eax, eax).unwrap();
    asm.xor(edx, edx).unwrap();
    asm.set_label(&mut top).unwrap();
    asm.add(edx, dword_ptr(rcx + rax * 4)).unwrap();
    asm.inc(eax).unwrap();
    asm.cmp(eax, 64).unwrap();
    asm.jl(top).unwrap();
    asm.ret().unwrap();
    let code = asm.assemble(0x200).unwrap();

    let image = PeImage::parse(build_pe(&code)).unwrap();
    let mut pipeline = carve_analysis::Pipeline::recover(&image).unwrap();
    pipeline.propagate();
    assert!(
        !pipeline.funcs[&0x200].cycles.is_empty(),
        "the back edge must be recorded"
    );

    let strucs = pipeline.synthesize();
    assert_eq!(strucs.len(), 1);
    let struc = strucs.values().next().unwrap();
    for (_, kind, size, count) in shapes(struc) {
        assert_eq!(kind, FieldKind::UInt);
        assert_eq!(size, 4);
        assert!(count >= 1);
    }
}

#[test]
fn output_is_stable_across_runs() {
    let mut asm = CodeAssembler::new(64).unwrap();
    asm.mov(rax, qword_ptr(rcx + 0x10)).unwrap();
    asm.movsxd(rdx, dword_ptr(rax + 8)).unwrap();
    asm.movsd_2(xmm1, qword_ptr(rcx + 0x20)).unwrap();
    asm.ret().unwrap();
    let code = asm.assemble(0x200).unwrap();

    let render = |code: &[u8]| {
        let image = PeImage::parse(build_pe(code)).unwrap();
        render_all(&recover_structs(&image).unwrap())
    };
    let first = render(&code);
    let second = render(&code);
    assert!(!first.is_empty());
    assert_eq!(first, second);
}
