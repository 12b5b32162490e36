//! Modifier map, VK→WCHAR table and dead-key tables.
//!
//! The character table is a list of row *groups*: a base row, optionally an
//! SGCAPS secondary row (same VK, characters that apply under CapsLock),
//! and optionally a dead-key continuation row (VK 0xFF) carrying the raw
//! dead characters for the columns the preceding rows marked WCH_DEAD.
//! All rows in the single emitted VK_TO_WCHAR_TABLE share one column
//! count: the number of distinct shift states in use.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use log::debug;

use crate::arch::Arch;
use crate::error::{push_warning, Error, Result, Warning};
use crate::kbd::{
    translate_vk, SHIFT_INVALID, VK_CONTROL, VK_KANA, VK_MENU, VK_NONE, VK_SHIFT, WCH_DEAD,
    WCH_LGTR, WCH_NONE,
};
use crate::layout::{Character, DeadKey, KeyAttributes, Layout, ShiftState};
use crate::linker::{Arena, BlobId, BlobReader, Symbol};
use crate::pe::ImageView;
use crate::wintypes::{makelong, split_long, u8_len, wchar_unit, char_from_unit, wstr};

/// The charmap-derived table blobs.
#[derive(Debug, Copy, Clone)]
pub struct CharmapBlobs {
    /// MODIFIERS: VK_TO_BIT pointer, wMaxModBits, ModNumber column map.
    pub modifiers: BlobId,
    /// The VK_TO_WCHAR_TABLE list (one entry plus the null terminator).
    pub vk_to_wchar_table: BlobId,
    /// DEADKEY rows, zero-terminated.
    pub dead_key: BlobId,
    /// Dead-key name pointers, null-terminated.
    pub key_names_dead: BlobId,
}

fn lptr(arch: Arch, target: Option<BlobId>) -> Symbol {
    Symbol::pointer(arch.long_pointer(), arch.image_base(), target)
}

/// Assigns table columns to shift states in first-encounter order over the
/// keymap, returning the states in column order and the highest modifier
/// mask in use.
fn assign_columns(
    layout: &Layout,
    warnings: &mut Vec<Warning>,
) -> Result<(Vec<ShiftState>, u16, BTreeMap<u16, KeyAttributes>)> {
    let mut shift_states = Vec::new();
    let mut column_of: IndexMap<ShiftState, usize> = IndexMap::new();
    let mut vk_attributes = BTreeMap::new();
    let mut max_mask = 0u16;
    for key in layout.keymap.values() {
        let vk = translate_vk(key.win_vk);
        if vk == 0 || vk == VK_NONE {
            continue;
        }
        let characters = match layout.charmap.get(&vk) {
            Some(characters) if !characters.is_empty() => characters,
            _ => continue,
        };
        if vk > 0xFF {
            push_warning(warnings, Warning::UnknownSpecialVk(vk));
            continue;
        }
        vk_attributes.insert(vk, key.attributes);
        for shiftstate in characters.keys() {
            let stripped = shiftstate.base();
            if !column_of.contains_key(&stripped) {
                column_of.insert(stripped, shift_states.len());
                shift_states.push(stripped);
                max_mask = max_mask.max(stripped.to_bits());
            }
        }
    }
    for vk in layout.charmap.keys() {
        if !vk_attributes.contains_key(&translate_vk(*vk)) {
            push_warning(warnings, Warning::UnmappedVk(*vk));
        }
    }
    if shift_states.len() >= 15 {
        return Err(Error::TooManyShiftStates(shift_states.len()));
    }
    if shift_states.len() > 10 {
        push_warning(warnings, Warning::ManyShiftStates(shift_states.len()));
    }
    Ok((shift_states, max_mask, vk_attributes))
}

/// Builds the modifier, character and dead-key tables from
/// `layout.charmap` and `layout.deadkeys`.
pub fn compile(
    arena: &mut Arena,
    layout: &Layout,
    arch: Arch,
    warnings: &mut Vec<Warning>,
) -> Result<CharmapBlobs> {
    let (shift_states, max_mask, vk_attributes) = assign_columns(layout, warnings)?;
    let column_count = shift_states.len();

    let vk_to_bits = arena.blob(4)?;
    for (vk, bit) in [
        (VK_SHIFT, 1u8),
        (VK_CONTROL, 2),
        (VK_MENU, 4),
        (VK_KANA, 8),
    ] {
        arena.append_u8(vk_to_bits, vk)?;
        arena.append_u8(vk_to_bits, bit)?;
    }
    arena.append_u16(vk_to_bits, 0)?;

    let modifiers = arena.blob(8)?;
    arena.append_symbol(modifiers, lptr(arch, Some(vk_to_bits)))?;
    arena.append_u16(modifiers, max_mask)?;
    for mask in 0..=max_mask {
        let column = shift_states
            .iter()
            .position(|state| *state == ShiftState::from_bits(mask))
            .map_or(SHIFT_INVALID, |column| column as u8);
        arena.append_u8(modifiers, column)?;
    }

    let vk_to_wchars = arena.blob(2)?;
    let append_row =
        |arena: &mut Arena, vk: u8, attributes: u8, row: &[u16]| -> Result<()> {
            arena.append_u8(vk_to_wchars, vk)?;
            arena.append_u8(vk_to_wchars, attributes)?;
            for &unit in row {
                arena.append_u16(vk_to_wchars, unit)?;
            }
            Ok(())
        };
    for (&vk, &attributes) in &vk_attributes {
        let characters = match layout.charmap.get(&vk) {
            Some(characters) => characters,
            None => continue,
        };
        let mut attributes = attributes;

        let mut dead: IndexMap<ShiftState, char> = characters
            .iter()
            .filter(|(shiftstate, character)| character.dead && !shiftstate.capslock)
            .map(|(shiftstate, character)| (*shiftstate, character.ch))
            .collect();
        let mut secondary: IndexMap<ShiftState, Character> = IndexMap::new();
        if attributes.capslock_secondary {
            if !dead.is_empty() {
                push_warning(warnings, Warning::SgcapsDeadKeyConflict(vk));
                attributes.capslock_secondary = false;
            } else {
                // the CapsLock layer of an SGCAPS key may itself hold dead keys
                secondary = characters
                    .iter()
                    .filter(|(shiftstate, _)| shiftstate.capslock)
                    .map(|(shiftstate, character)| (shiftstate.base(), *character))
                    .collect();
                dead = characters
                    .iter()
                    .filter(|(shiftstate, character)| character.dead && shiftstate.capslock)
                    .map(|(shiftstate, character)| (shiftstate.base(), character.ch))
                    .collect();
            }
        }

        let mut base_row = Vec::with_capacity(column_count);
        for shiftstate in &shift_states {
            base_row.push(match characters.get(shiftstate) {
                Some(character) if character.dead => WCH_DEAD,
                Some(character) => wchar_unit(character.ch)?,
                None => WCH_NONE,
            });
        }
        append_row(arena, vk as u8, attributes.to_bits(), &base_row)?;

        if attributes.capslock_secondary {
            let mut row = Vec::with_capacity(column_count);
            for shiftstate in &shift_states {
                row.push(match secondary.get(shiftstate) {
                    Some(character) if character.dead => WCH_DEAD,
                    Some(character) => wchar_unit(character.ch)?,
                    None => WCH_NONE,
                });
            }
            append_row(arena, vk as u8, 0, &row)?;
        }

        if !dead.is_empty() {
            let mut row = Vec::with_capacity(column_count);
            for shiftstate in &shift_states {
                row.push(match dead.get(shiftstate) {
                    Some(&ch) => wchar_unit(ch)?,
                    None => WCH_NONE,
                });
            }
            append_row(arena, 0xFF, 0, &row)?;
        }
    }
    append_row(arena, 0, 0, &vec![0u16; column_count])?;

    let vk_to_wchar_table = arena.blob(8)?;
    arena.append_symbol(vk_to_wchar_table, lptr(arch, Some(vk_to_wchars)))?;
    arena.append_u8(vk_to_wchar_table, u8_len(column_count)?)?;
    arena.append_u8(vk_to_wchar_table, u8_len(column_count * 2 + 2)?)?;
    arena.append_symbol(vk_to_wchar_table, lptr(arch, None))?;
    arena.append_u8(vk_to_wchar_table, 0)?;
    arena.append_u8(vk_to_wchar_table, 0)?;
    arena.append_padding(vk_to_wchar_table, arch.long_pointer())?;

    let dead_key = arena.blob(4)?;
    for (&accent, deadkey) in &layout.deadkeys {
        for (&base, composed) in &deadkey.charmap {
            arena.append_u32(
                dead_key,
                makelong(wchar_unit(base)?, wchar_unit(accent)?),
            )?;
            arena.append_u16(dead_key, wchar_unit(composed.ch)?)?;
            arena.append_u16(dead_key, composed.dead as u16)?;
        }
    }
    arena.append_u32(dead_key, 0)?;
    arena.append_u16(dead_key, 0)?;
    arena.append_u16(dead_key, 0)?;

    let key_names_dead = arena.blob(8)?;
    for (&accent, deadkey) in &layout.deadkeys {
        let mut text = String::new();
        text.push(accent);
        text.push_str(&deadkey.name);
        let name = wstr(arena, &text)?;
        arena.append_symbol(key_names_dead, lptr(arch, Some(name)))?;
    }
    arena.append_symbol(key_names_dead, lptr(arch, None))?;

    Ok(CharmapBlobs {
        modifiers,
        vk_to_wchar_table,
        dead_key,
        key_names_dead,
    })
}

fn classify(
    unit: u16,
    column: usize,
    shift_state_map: &BTreeMap<usize, ShiftState>,
) -> Result<Option<Character>> {
    if unit == WCH_NONE || unit == WCH_DEAD || unit == WCH_LGTR {
        return Ok(None);
    }
    if !shift_state_map.contains_key(&column) {
        return Err(Error::Malformed(format!(
            "character column {} has no shift state assigned",
            column
        )));
    }
    Ok(Some(Character::plain(char_from_unit(unit)?)))
}

/// Rebuilds `layout.charmap`, `layout.deadkeys` and the per-key attributes
/// from the extracted modifier, character and dead-key tables.
#[allow(clippy::too_many_arguments)]
pub fn decompile(
    view: &ImageView,
    modifiers: &[u8],
    vk_to_wchar_table: &[u8],
    dead_key: Option<&[u8]>,
    key_names_dead: Option<&[u8]>,
    layout: &mut Layout,
    warnings: &mut Vec<Warning>,
) -> Result<()> {
    let long_pointer = view.arch.long_pointer();

    let mut reader = BlobReader::new(modifiers);
    let vk_to_bits_ptr = reader.read_uint(long_pointer, long_pointer)?;
    let (vk_to_bits, _) = view.extract_array(vk_to_bits_ptr.wrapping_sub(view.base) as u32, 2)?;
    let mut bits_reader = BlobReader::new(&vk_to_bits);
    loop {
        let vk = bits_reader.read_u8()?;
        let bit = bits_reader.read_u8()?;
        if vk == 0 && bit == 0 {
            break;
        }
        debug!("modifier vk {:#x} -> bit {:#x}", vk, bit);
    }

    let max_mask = reader.read_u16()?;
    let mut shift_state_map: BTreeMap<usize, ShiftState> = BTreeMap::new();
    for mask in 0..=max_mask {
        let column = reader.read_u8()?;
        if column != SHIFT_INVALID {
            shift_state_map.insert(column as usize, ShiftState::from_bits(mask));
        }
    }
    warnings.extend(reader.take_warnings());

    let mut attributes_of: BTreeMap<u16, KeyAttributes> = BTreeMap::new();
    let mut table_reader = BlobReader::new(vk_to_wchar_table);
    loop {
        let table_ptr = table_reader.read_uint(long_pointer, long_pointer)?;
        if table_ptr == 0 {
            break;
        }
        let columns = table_reader.read_u8()? as usize;
        let width = table_reader.read_u8()? as usize;
        if width != 2 * columns + 2 {
            return Err(Error::Malformed(format!(
                "VK_TO_WCHARS cbSize {} does not match {} modifications",
                width, columns
            )));
        }
        let (rows_data, row_count) =
            view.extract_array(table_ptr.wrapping_sub(view.base) as u32, width)?;
        debug!("VK_TO_WCHARS: {} columns, {} rows", columns, row_count);

        let mut rows = BlobReader::new(&rows_data);
        let mut row = 0;
        while row < row_count {
            let vk = rows.read_u8()? as u16;
            let attribute_bits = rows.read_u8()?;
            let attributes = KeyAttributes::from_bits(attribute_bits);
            if vk == VK_NONE {
                push_warning(
                    warnings,
                    Warning::UnexpectedValue {
                        context: "stray dead-key continuation row",
                        expected: 0,
                        found: VK_NONE as u64,
                    },
                );
                for _ in 0..columns {
                    rows.read_u16()?;
                }
                row += 1;
                continue;
            }

            let mut characters: IndexMap<ShiftState, Character> = IndexMap::new();
            let mut dead_columns: BTreeMap<usize, bool> = BTreeMap::new();
            for column in 0..columns {
                let unit = rows.read_u16()?;
                if unit == WCH_DEAD {
                    if attributes.capslock_secondary {
                        push_warning(warnings, Warning::SgcapsDeadKeyConflict(vk));
                    } else {
                        dead_columns.insert(column, true);
                    }
                } else if unit == WCH_LGTR {
                    push_warning(warnings, Warning::LigatureSkipped);
                } else if let Some(character) = classify(unit, column, &shift_state_map)? {
                    characters.insert(shift_state_map[&column], character);
                }
            }
            row += 1;

            if attributes.capslock_secondary {
                if row >= row_count {
                    return Err(Error::Malformed(
                        "missing SGCAPS continuation row".into(),
                    ));
                }
                rows.read_or_warn_uint(1, 1, vk as u64, "SGCAPS continuation VirtualKey")?;
                rows.read_or_warn_uint(1, 1, 0, "SGCAPS continuation Attributes")?;
                for column in 0..columns {
                    let unit = rows.read_u16()?;
                    if unit == WCH_DEAD {
                        dead_columns.insert(column, true);
                    } else if unit == WCH_LGTR {
                        push_warning(warnings, Warning::LigatureSkipped);
                    } else if let Some(character) = classify(unit, column, &shift_state_map)? {
                        characters.insert(shift_state_map[&column].with_capslock(), character);
                    }
                }
                row += 1;
            }

            if !dead_columns.is_empty() {
                if row >= row_count {
                    return Err(Error::Malformed(
                        "missing dead-key continuation row".into(),
                    ));
                }
                rows.read_or_warn_uint(1, 1, VK_NONE as u64, "dead-key continuation VirtualKey")?;
                rows.read_or_warn_uint(1, 1, 0, "dead-key continuation Attributes")?;
                for column in 0..columns {
                    let unit = rows.read_u16()?;
                    if !dead_columns.contains_key(&column) {
                        if unit != WCH_NONE {
                            push_warning(
                                warnings,
                                Warning::UnexpectedValue {
                                    context: "dead-key continuation column",
                                    expected: WCH_NONE as u64,
                                    found: unit as u64,
                                },
                            );
                        }
                        continue;
                    }
                    if unit == WCH_NONE || unit == WCH_DEAD || unit == WCH_LGTR {
                        push_warning(warnings, Warning::DeadKeyInvalidTarget(unit as u32));
                        continue;
                    }
                    let mut shiftstate =
                        *shift_state_map.get(&column).ok_or_else(|| {
                            Error::Malformed(format!(
                                "dead-key column {} has no shift state assigned",
                                column
                            ))
                        })?;
                    if attributes.capslock_secondary {
                        shiftstate = shiftstate.with_capslock();
                    }
                    characters.insert(shiftstate, Character::dead(char_from_unit(unit)?));
                }
                row += 1;
            }

            if layout.charmap.contains_key(&vk) {
                push_warning(
                    warnings,
                    Warning::DuplicateEntry(format!("character rows for vk {:#x}", vk)),
                );
                continue;
            }
            layout.charmap.insert(vk, characters);
            attributes_of.insert(vk, attributes);
        }
        warnings.extend(rows.take_warnings());
    }
    warnings.extend(table_reader.take_warnings());

    for key in layout.keymap.values_mut() {
        if let Some(&attributes) = attributes_of.get(&translate_vk(key.win_vk)) {
            key.attributes = attributes;
        }
    }

    let mut dead_key_names: IndexMap<char, String> = IndexMap::new();
    if let Some(bytes) = key_names_dead {
        let mut reader = BlobReader::new(bytes);
        loop {
            let pointer = reader.read_uint(long_pointer, long_pointer)?;
            if pointer == 0 {
                break;
            }
            let text = view.extract_wstr(pointer.wrapping_sub(view.base) as u32)?;
            let mut chars = text.chars();
            if let Some(accent) = chars.next() {
                dead_key_names.insert(accent, chars.collect());
            }
        }
        warnings.extend(reader.take_warnings());
    }

    if let Some(bytes) = dead_key {
        let mut reader = BlobReader::new(bytes);
        loop {
            let both = reader.read_u32()?;
            let (base_unit, accent_unit) = split_long(both);
            if base_unit == 0 && accent_unit == 0 {
                break;
            }
            let composed_unit = reader.read_u16()?;
            let flags = reader.read_u16()?;
            if flags > 1 {
                push_warning(warnings, Warning::UnknownDeadKeyFlags(flags));
            }
            if composed_unit == WCH_NONE || composed_unit == WCH_DEAD || composed_unit == WCH_LGTR
            {
                push_warning(warnings, Warning::DeadKeyInvalidTarget(both));
                continue;
            }
            let accent = char_from_unit(accent_unit)?;
            let base = char_from_unit(base_unit)?;
            let composed = Character {
                ch: char_from_unit(composed_unit)?,
                dead: flags == 1,
            };
            let deadkey = layout.deadkeys.entry(accent).or_insert_with(|| DeadKey {
                name: dead_key_names
                    .get(&accent)
                    .cloned()
                    .unwrap_or_else(|| accent.to_string()),
                charmap: IndexMap::new(),
            });
            if deadkey.charmap.contains_key(&base) {
                push_warning(
                    warnings,
                    Warning::DuplicateEntry(format!("dead key {:?} + {:?}", accent, base)),
                );
                continue;
            }
            deadkey.charmap.insert(base, composed);
        }
        warnings.extend(reader.take_warnings());
    }

    Ok(())
}
