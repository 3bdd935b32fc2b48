//! Fixture helpers shared by the integration tests.

use carve_analysis::{recover_structs, FieldKind, StrucRef};
use carve_pe::PeImage;
use std::collections::BTreeMap;

/// Builds a minimal PE32+ image with one executable `.text` section
/// holding `code` at raw offset 0x200, mapped at RVA 0x1000.
pub fn build_pe(code: &[u8]) -> Vec<u8> {
    let raw_size = (code.len() as u32).div_ceil(0x200) * 0x200;
    let mut data = vec![0u8; 0x200 + raw_size as usize];

    data[0..2].copy_from_slice(&0x5A4Du16.to_le_bytes());
    data[60..64].copy_from_slice(&0x80u32.to_le_bytes());
    data[0x80..0x84].copy_from_slice(&0x0000_4550u32.to_le_bytes());

    let coff = 0x84;
    data[coff..coff + 2].copy_from_slice(&0x8664u16.to_le_bytes());
    data[coff + 2..coff + 4].copy_from_slice(&1u16.to_le_bytes());
    data[coff + 16..coff + 18].copy_from_slice(&0xF0u16.to_le_bytes());
    data[coff + 18..coff + 20].copy_from_slice(&0x0022u16.to_le_bytes());

    let opt = coff + 20;
    data[opt..opt + 2].copy_from_slice(&0x20Bu16.to_le_bytes());
    data[opt + 16..opt + 20].copy_from_slice(&0x1000u32.to_le_bytes());
    data[opt + 24..opt + 32].copy_from_slice(&0x1_4000_0000u64.to_le_bytes());
    data[opt + 32..opt + 36].copy_from_slice(&0x1000u32.to_le_bytes());
    data[opt + 36..opt + 40].copy_from_slice(&0x200u32.to_le_bytes());
    data[opt + 108..opt + 112].copy_from_slice(&16u32.to_le_bytes());

    let sec = opt + 0xF0;
    data[sec..sec + 5].copy_from_slice(b".text");
    data[sec + 8..sec + 12].copy_from_slice(&(code.len() as u32).to_le_bytes());
    data[sec + 12..sec + 16].copy_from_slice(&0x1000u32.to_le_bytes());
    data[sec + 16..sec + 20].copy_from_slice(&raw_size.to_le_bytes());
    data[sec + 20..sec + 24].copy_from_slice(&0x200u32.to_le_bytes());
    data[sec + 36..sec + 40].copy_from_slice(&0x6000_0020u32.to_le_bytes());

    data[0x200..0x200 + code.len()].copy_from_slice(code);
    data
}

/// Runs the whole pipeline over assembled code.
pub fn recover(code: &[u8]) -> BTreeMap<String, StrucRef> {
    let image = PeImage::parse(build_pe(code)).unwrap();
    recover_structs(&image).unwrap()
}

/// Flattens a struct into comparable (offset, kind, size, count) rows.
pub fn shapes(struc: &StrucRef) -> Vec<(u64, FieldKind, u64, u64)> {
    struc
        .lock()
        .unwrap()
        .fields()
        .map(|(off, f)| (off, f.kind, f.size, f.count))
        .collect()
}
