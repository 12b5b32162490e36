//! End-to-end scenarios: compile layouts for each architecture, probe the
//! raw image bytes, and decompile back.

use indexmap::IndexMap;

use kbdlink::layout::{Character, DeadKey, KeyAttributes, KeyCode, ScanCode, ShiftState};
use kbdlink::{compile, decompile, Arch, Config, Error, Layout};

const TIMESTAMP: u32 = 0x5F5E_1000;

fn logger() {
    // only the first call installs the global logger
    stderrlog::new().verbosity(4).init().ok();
}

fn config() -> Config {
    Config::new(TIMESTAMP)
}

fn u16_at(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn u32_at(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn u64_at(data: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

struct Headers {
    pe: usize,
    machine: u16,
    magic: u16,
    image_base: u64,
    /// (name, virtual_size, virtual_address, raw_size, raw_offset)
    sections: Vec<([u8; 8], u32, u32, u32, u32)>,
}

fn headers(data: &[u8]) -> Headers {
    assert_eq!(&data[0..2], b"MZ");
    let pe = u32_at(data, 0x3C) as usize;
    assert_eq!(&data[pe..pe + 4], b"PE\0\0");
    let machine = u16_at(data, pe + 4);
    let section_count = u16_at(data, pe + 6) as usize;
    let optional_size = u16_at(data, pe + 20) as usize;
    let optional = pe + 24;
    let magic = u16_at(data, optional);
    let image_base = match magic {
        0x10B => u32_at(data, optional + 28) as u64,
        0x20B => u64_at(data, optional + 24),
        other => panic!("unexpected optional magic {:#x}", other),
    };
    let mut sections = Vec::new();
    let mut offset = optional + optional_size;
    for _ in 0..section_count {
        let mut name = [0u8; 8];
        name.copy_from_slice(&data[offset..offset + 8]);
        sections.push((
            name,
            u32_at(data, offset + 8),
            u32_at(data, offset + 12),
            u32_at(data, offset + 16),
            u32_at(data, offset + 20),
        ));
        offset += 40;
    }
    Headers {
        pe,
        machine,
        magic,
        image_base,
        sections,
    }
}

impl Headers {
    fn section(&self, name: &[u8]) -> (u32, u32, u32, u32) {
        let entry = self
            .sections
            .iter()
            .find(|(section_name, ..)| &section_name[..] == name)
            .unwrap_or_else(|| panic!("missing section {:?}", name));
        (entry.1, entry.2, entry.3, entry.4)
    }

    fn file_offset(&self, rva: u32) -> usize {
        let entry = self
            .sections
            .iter()
            .rev()
            .find(|(_, _, address, ..)| *address <= rva)
            .expect("rva below every section");
        (entry.4 + (rva - entry.2)) as usize
    }
}

fn chars(entries: &[(ShiftState, char, bool)]) -> IndexMap<ShiftState, Character> {
    entries
        .iter()
        .map(|&(state, ch, dead)| (state, Character { ch, dead }))
        .collect()
}

fn minimal_layout() -> Layout {
    let mut layout = Layout {
        name: "Test".to_string(),
        author: "T".to_string(),
        copyright: "T".to_string(),
        version: (1, 0),
        dll_name: "kbdtst.dll".to_string(),
        ..Default::default()
    };
    layout
        .keymap
        .insert(ScanCode::new(0x02), KeyCode::named(0x31, "1"));
    layout.charmap.insert(
        0x31,
        chars(&[
            (ShiftState::default(), '1', false),
            (ShiftState::shift(), '!', false),
        ]),
    );
    layout
}

fn us_like_layout() -> Layout {
    let mut layout = Layout {
        name: "US Test Layout".to_string(),
        author: "Example Project".to_string(),
        copyright: "(c) 2020 Example Project".to_string(),
        version: (2, 5),
        dll_name: "kbdust.dll".to_string(),
        ..Default::default()
    };

    // digits row 0x02..=0x0D
    let digits = "1234567890-=";
    let shifted = "!@#$%^&*()_+";
    let digit_vks: [u16; 12] = [
        0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0xBD, 0xBB,
    ];
    for (index, vk) in digit_vks.into_iter().enumerate() {
        layout
            .keymap
            .insert(ScanCode::new(0x02 + index as u8), KeyCode::new(vk));
        let base = digits.as_bytes()[index] as char;
        let upper = shifted.as_bytes()[index] as char;
        layout.charmap.insert(
            vk,
            chars(&[
                (ShiftState::default(), base, false),
                (ShiftState::shift(), upper, false),
            ]),
        );
    }
    // euro on AltGr+5
    layout
        .charmap
        .get_mut(&0x35)
        .unwrap()
        .insert(ShiftState::altgr(), Character::plain('\u{20AC}'));

    // a letter with CAPLOK
    let mut key_a = KeyCode::new(0x41);
    key_a.attributes = KeyAttributes {
        capslock: true,
        ..Default::default()
    };
    layout.keymap.insert(ScanCode::new(0x1E), key_a);
    layout.charmap.insert(
        0x41,
        chars(&[
            (ShiftState::default(), 'a', false),
            (ShiftState::shift(), 'A', false),
        ]),
    );

    // named control keys
    layout
        .keymap
        .insert(ScanCode::new(0x01), KeyCode::named(0x1B, "Esc"));
    layout
        .keymap
        .insert(ScanCode::new(0x0E), KeyCode::named(0x08, "Backspace"));
    layout
        .keymap
        .insert(ScanCode::new(0x45), KeyCode::named(0x90, "Num Lock"));
    layout
        .keymap
        .insert(ScanCode::ext1(0x1D), KeyCode::named(0x13, "Pause"));
    // extended keys
    layout
        .keymap
        .insert(ScanCode::ext0(0x4B), KeyCode::named(0x125, "Left"));
    layout
        .keymap
        .insert(ScanCode::ext0(0x1C), KeyCode::new(0x10D));
    // numpad 7 with its composite navigation vk
    layout.keymap.insert(ScanCode::new(0x47), KeyCode::new(0xC24));
    layout
        .charmap
        .insert(0x67, chars(&[(ShiftState::default(), '7', false)]));

    // an acute dead key on the quote key
    layout
        .keymap
        .insert(ScanCode::new(0x28), KeyCode::new(0xDE));
    layout.charmap.insert(
        0xDE,
        chars(&[
            (ShiftState::default(), '\u{B4}', true),
            (ShiftState::shift(), '"', false),
        ]),
    );
    let mut compositions = IndexMap::new();
    compositions.insert('a', Character::plain('\u{E1}'));
    compositions.insert('e', Character::plain('\u{E9}'));
    compositions.insert(' ', Character::plain('\u{B4}'));
    layout.deadkeys.insert(
        '\u{B4}',
        DeadKey {
            name: "acute".to_string(),
            charmap: compositions,
        },
    );
    layout
}

#[test]
fn scenario_minimal_x86() {
    logger();
    let layout = minimal_layout();
    let output = compile(&layout, Arch::X86, &config()).unwrap();
    assert!(output.warnings.is_empty());
    let data = &output.bytes;

    let headers = headers(data);
    assert_eq!(headers.machine, 0x14C);
    assert_eq!(headers.magic, 0x10B);
    assert_eq!(headers.image_base, 0x5FFF_0000);
    let names: Vec<&[u8]> = headers
        .sections
        .iter()
        .map(|(name, ..)| &name[..])
        .collect();
    assert_eq!(names, vec![&b".data\0\0\0"[..], b".rsrc\0\0\0", b".reloc\0\0"]);

    // the export directory sits at the start of .data
    let optional = headers.pe + 24;
    let export_rva = u32_at(data, optional + 96);
    assert_eq!(export_rva, 0x1000);
    let export = headers.file_offset(export_rva);
    assert_eq!(u32_at(data, export + 4), TIMESTAMP);
    assert_eq!(u32_at(data, export + 16), 1, "ordinal base");
    let name_rva = u32_at(data, export + 12);
    let name_offset = headers.file_offset(name_rva);
    assert_eq!(&data[name_offset..name_offset + 11], b"kbdtst.dll\0");

    // one address table entry pointing at the MOV EAX/RET thunk
    let addresses_rva = u32_at(data, export + 28);
    let func_rva = u32_at(data, headers.file_offset(addresses_rva));
    let func = headers.file_offset(func_rva);
    assert_eq!(data[func], 0xB8);
    let table_address = u32_at(data, func + 1) as u64;
    assert_eq!(data[func + 5], 0xC3);
    let table_rva = (table_address - headers.image_base) as u32;
    let (data_size, data_rva, ..) = headers.section(b".data\0\0\0");
    assert!(table_rva >= data_rva && table_rva < data_rva + data_size);

    // exported name
    let names_rva = u32_at(data, export + 32);
    let func_name_rva = u32_at(data, headers.file_offset(names_rva));
    let func_name = headers.file_offset(func_name_rva);
    assert_eq!(
        &data[func_name..func_name + 19],
        b"KbdLayerDescriptor\0"
    );

    // vsc 0x02 maps to '1' in the flat table
    let decompiled = decompile(data).unwrap();
    assert_eq!(decompiled.arch, Arch::X86);
    assert_eq!(decompiled.timestamp, TIMESTAMP);
    assert_eq!(
        decompiled.layout.keymap[&ScanCode::new(0x02)].win_vk,
        0x31
    );
    assert_eq!(
        decompiled.layout.charmap[&0x31][&ShiftState::shift()],
        Character::plain('!')
    );
}

#[test]
fn scenario_deadkey_roundtrip_amd64() {
    logger();
    let layout = us_like_layout();
    let output = compile(&layout, Arch::Amd64, &config()).unwrap();
    assert!(output.warnings.is_empty());

    let decompiled = decompile(&output.bytes).unwrap();
    assert_eq!(decompiled.arch, Arch::Amd64);
    assert_eq!(decompiled.layout, layout);

    let deadkey = &decompiled.layout.deadkeys[&'\u{B4}'];
    assert_eq!(deadkey.name, "acute");
    assert_eq!(deadkey.charmap[&'a'], Character::plain('\u{E1}'));
    assert_eq!(
        decompiled.layout.charmap[&0xDE][&ShiftState::default()],
        Character::dead('\u{B4}')
    );
}

#[test]
fn scenario_sgcaps_wow64() {
    logger();
    let mut layout = minimal_layout();
    let mut key = KeyCode::new(0x41);
    key.attributes.capslock_secondary = true;
    layout.keymap.insert(ScanCode::new(0x1E), key);
    layout.charmap.insert(
        0x41,
        chars(&[
            (ShiftState::default(), 'a', false),
            (ShiftState::shift(), 'A', false),
            (ShiftState::default().with_capslock(), '\u{E1}', false),
            (ShiftState::shift().with_capslock(), '\u{C1}', false),
        ]),
    );
    let output = compile(&layout, Arch::Wow64, &config()).unwrap();
    assert!(output.warnings.is_empty());

    let headers = headers(&output.bytes);
    assert_eq!(headers.machine, 0x14C);
    assert_eq!(headers.magic, 0x10B);
    assert_eq!(headers.image_base, 0x5FFE_0000);

    let decompiled = decompile(&output.bytes).unwrap();
    assert_eq!(decompiled.arch, Arch::Wow64);
    // the default "1" name normalizes away; everything else round-trips
    let mut expected = layout.clone();
    expected.keymap.get_mut(&ScanCode::new(0x02)).unwrap().name = None;
    assert_eq!(decompiled.layout, expected);
    assert!(
        decompiled.layout.keymap[&ScanCode::new(0x1E)]
            .attributes
            .capslock_secondary
    );
}

#[test]
fn roundtrip_all_architectures() {
    logger();
    let layout = us_like_layout();
    for arch in [Arch::X86, Arch::Wow64, Arch::Amd64] {
        let output = compile(&layout, arch, &config()).unwrap();
        assert!(output.warnings.is_empty(), "warnings on {}", arch);
        let decompiled = decompile(&output.bytes).unwrap();
        assert_eq!(decompiled.arch, arch);
        assert_eq!(decompiled.layout, layout, "round trip through {}", arch);
        assert!(decompiled.warnings.is_empty());
    }
}

#[test]
fn relocations_cover_every_data_pointer() {
    logger();
    let mut layout = us_like_layout();
    // plenty of named keys makes .data cross a page boundary
    for code in 0x50..=0x7Eu8 {
        layout.keymap.insert(
            ScanCode::ext0(code),
            KeyCode::named(
                0x100 | code as u16,
                &format!("Extended Navigation Key Number {:02X} With A Rather Long Name", code),
            ),
        );
    }
    for arch in [Arch::X86, Arch::Amd64] {
        let output = compile(&layout, arch, &config()).unwrap();
        let data = &output.bytes;
        let headers = headers(data);
        let (data_size, data_rva, ..) = headers.section(b".data\0\0\0");
        let (reloc_size, reloc_rva, ..) = headers.section(b".reloc\0\0");

        let mut offset = headers.file_offset(reloc_rva);
        let end = offset + reloc_size as usize;
        let mut blocks = 0;
        let mut entries = 0;
        while offset < end {
            let page = u32_at(data, offset);
            let block_size = u32_at(data, offset + 4) as usize;
            assert_eq!(block_size % 4, 0);
            for position in (offset + 8..offset + block_size).step_by(2) {
                let entry = u16_at(data, position);
                let kind = entry >> 12;
                let page_offset = (entry & 0xFFF) as u32;
                if kind == 0 {
                    continue; // alignment pad
                }
                let pointer_rva = page + page_offset;
                assert!(pointer_rva >= data_rva && pointer_rva < data_rva + data_size);
                let at = headers.file_offset(pointer_rva);
                let value = match kind {
                    3 => u32_at(data, at) as u64,
                    10 => u64_at(data, at),
                    other => panic!("unexpected relocation type {}", other),
                };
                let target = (value - headers.image_base) as u32;
                assert!(
                    target >= data_rva && target < data_rva + data_size,
                    "pointer at rva {:#x} targets {:#x} outside .data",
                    pointer_rva,
                    target
                );
                entries += 1;
            }
            offset += block_size;
            blocks += 1;
        }
        assert!(blocks >= 2, "expected .data to span pages on {}", arch);
        assert!(entries > 40);
    }
}

#[test]
fn scenario_too_many_shift_states() {
    logger();
    let mut layout = minimal_layout();
    let mut characters = IndexMap::new();
    for mask in 0..15u16 {
        characters.insert(ShiftState::from_bits(mask), Character::plain('x'));
    }
    layout.charmap.insert(0x31, characters);
    match compile(&layout, Arch::X86, &config()) {
        Err(Error::TooManyShiftStates(count)) => assert_eq!(count, 15),
        other => panic!("expected TooManyShiftStates, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn compilation_is_deterministic() {
    logger();
    let layout = us_like_layout();
    for arch in [Arch::X86, Arch::Wow64, Arch::Amd64] {
        let first = compile(&layout, arch, &config()).unwrap();
        let second = compile(&layout, arch, &config()).unwrap();
        assert_eq!(first.bytes, second.bytes);
        let other = compile(&layout, arch, &Config::new(TIMESTAMP + 1)).unwrap();
        assert_ne!(first.bytes, other.bytes);
    }
}

#[test]
fn checksum_is_patched_unless_disabled() {
    logger();
    let layout = minimal_layout();
    let output = compile(&layout, Arch::X86, &config()).unwrap();
    let headers = headers(&output.bytes);
    let checksum_offset = headers.pe + 24 + 64;
    assert_ne!(u32_at(&output.bytes, checksum_offset), 0);

    let mut raw = config();
    raw.fix_checksum = false;
    let output = compile(&layout, Arch::X86, &raw).unwrap();
    assert_eq!(u32_at(&output.bytes, checksum_offset), 0);
    // the checksum is the only difference
    let decompiled = decompile(&output.bytes).unwrap();
    assert_eq!(decompiled.layout, minimal_layout_normalized());
}

/// The minimal layout with the default-named key normalized away, which is
/// exactly what a decompile reconstructs.
fn minimal_layout_normalized() -> Layout {
    let mut layout = minimal_layout();
    layout.keymap.get_mut(&ScanCode::new(0x02)).unwrap().name = None;
    layout
}

#[test]
fn default_key_names_normalize_in_round_trip() {
    logger();
    // "1" names a key whose vk is 0x31; the name is the default and is
    // not stored in the image
    let layout = minimal_layout();
    let output = compile(&layout, Arch::Amd64, &config()).unwrap();
    let decompiled = decompile(&output.bytes).unwrap();
    assert_eq!(decompiled.layout, minimal_layout_normalized());
}

#[test]
fn charmap_without_scancode_warns_and_drops() {
    logger();
    let mut layout = minimal_layout();
    layout
        .charmap
        .insert(0x99, chars(&[(ShiftState::default(), 'x', false)]));
    let output = compile(&layout, Arch::X86, &config()).unwrap();
    assert!(output
        .warnings
        .contains(&kbdlink::Warning::UnmappedVk(0x99)));
    let decompiled = decompile(&output.bytes).unwrap();
    assert!(!decompiled.layout.charmap.contains_key(&0x99));
}

#[test]
fn version_resource_survives_the_trip() {
    logger();
    let layout = us_like_layout();
    let output = compile(&layout, Arch::X86, &config()).unwrap();
    let decompiled = decompile(&output.bytes).unwrap();
    assert_eq!(decompiled.layout.name, "US Test Layout");
    assert_eq!(decompiled.layout.author, "Example Project");
    assert_eq!(decompiled.layout.copyright, "(c) 2020 Example Project");
    assert_eq!(decompiled.layout.version, (2, 5));
    assert_eq!(decompiled.layout.dll_name, "kbdust.dll");
}

#[test]
fn garbage_input_is_rejected() {
    logger();
    assert!(matches!(
        decompile(b"not a portable executable"),
        Err(Error::Malformed(_))
    ));
    let mut truncated = compile(&minimal_layout(), Arch::X86, &config())
        .unwrap()
        .bytes;
    truncated.truncate(0x80);
    assert!(decompile(&truncated).is_err());
}

#[test]
fn images_end_on_a_file_alignment_boundary() {
    logger();
    for arch in [Arch::X86, Arch::Wow64, Arch::Amd64] {
        let output = compile(&minimal_layout(), arch, &config()).unwrap();
        assert_eq!(output.bytes.len() % 0x200, 0);
        let headers = headers(&output.bytes);
        for (name, _, _, raw_size, raw_offset) in &headers.sections {
            assert_eq!(raw_offset % 0x200, 0, "section {:?}", name);
            assert_eq!(raw_size % 0x200, 0, "section {:?}", name);
        }
    }
}
