/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! The dynamic linker: drives [crate::mach_o::MachO] parsing for the main
//! image and its recursive dylib dependencies, interprets the bind/lazy-bind
//! opcode streams and the export trie, wires section-level lazy/non-lazy
//! pointers and `__mod_init_func` constructors through [SymbolTable], and
//! finally hands out [BreakpointRegistry] trampolines for whatever remains
//! unresolved once the whole dependency graph has loaded.
//!
//! See [crate::mach_o] for the Mach-O structure this drives.

use crate::dyld_cache::DyldCache;
use crate::error::{EmuError, LoaderError};
use crate::fs::Fs;
use crate::mach_o::{MachO, SectionKind};
use crate::machine::Machine;
use crate::state;
use std::borrow::Cow;
use std::collections::HashSet;
use std::path::Path;

// mach-o/loader.h bind opcode nibbles.
const BIND_OPCODE_MASK: u8 = 0xf0;
const BIND_IMMEDIATE_MASK: u8 = 0x0f;
const BIND_OPCODE_DONE: u8 = 0x00;
const BIND_OPCODE_SET_DYLIB_ORDINAL_IMM: u8 = 0x10;
const BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB: u8 = 0x20;
const BIND_OPCODE_SET_DYLIB_SPECIAL_IMM: u8 = 0x30;
const BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM: u8 = 0x40;
const BIND_OPCODE_SET_TYPE_IMM: u8 = 0x50;
const BIND_OPCODE_SET_ADDEND_SLEB: u8 = 0x60;
const BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x70;
const BIND_OPCODE_ADD_ADDR_ULEB: u8 = 0x80;
const BIND_OPCODE_DO_BIND: u8 = 0x90;
const BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB: u8 = 0xa0;
const BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED: u8 = 0xb0;
const BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB: u8 = 0xc0;

const EXPORT_SYMBOL_FLAGS_REEXPORT: u64 = 0x08;
const EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER: u64 = 0x10;

struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}
impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        ByteReader { bytes, pos: 0 }
    }
    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }
    fn u8(&mut self) -> u8 {
        let b = self.bytes.get(self.pos).copied().unwrap_or(0);
        self.pos += 1;
        b
    }
    fn uleb(&mut self) -> u64 {
        let mut result: u64 = 0;
        let mut shift = 0;
        loop {
            let byte = self.u8();
            result |= ((byte & 0x7f) as u64) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                break;
            }
        }
        result
    }
    fn sleb(&mut self) -> i64 {
        let mut result: i64 = 0;
        let mut shift = 0;
        let mut byte;
        loop {
            byte = self.u8();
            result |= ((byte & 0x7f) as i64) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                break;
            }
        }
        if shift < 64 && (byte & 0x40) != 0 {
            result |= -(1i64 << shift);
        }
        result
    }
    fn cstr(&mut self) -> String {
        let start = self.pos;
        while self.pos < self.bytes.len() && self.bytes[self.pos] != 0 {
            self.pos += 1;
        }
        let s = String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned();
        if self.pos < self.bytes.len() {
            self.pos += 1; // skip NUL
        }
        s
    }
}

/// Interpret a bind or lazy-bind opcode stream against `image`, calling
/// `need_symbol(name, segment_base + offset)` for every `DO_BIND*` event.
fn run_bind_opcodes(
    machine: &mut Machine,
    image: &MachO,
    image_name: &str,
    opcodes: &[u8],
) -> Result<(), EmuError> {
    let mut reader = ByteReader::new(opcodes);
    let mut segment_index: usize = 0;
    let mut offset: u32 = 0;
    let mut name = String::new();

    let mut bind_one = |machine: &mut Machine, segment_index: usize, offset: u32, name: &str| {
        let Some(base) = image.segment_base(segment_index) else {
            return;
        };
        let target = base + offset;
        if let Err(e) = machine.symtab.need(&mut machine.mem, name, target) {
            log!("bind: {} in {}: {}", name, image_name, e);
        }
    };

    while !reader.at_end() {
        let byte = reader.u8();
        let opcode = byte & BIND_OPCODE_MASK;
        let imm = byte & BIND_IMMEDIATE_MASK;
        match opcode {
            BIND_OPCODE_DONE => break,
            BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | BIND_OPCODE_SET_DYLIB_SPECIAL_IMM => {
                let _ = imm;
            }
            BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB => {
                let _ = reader.uleb();
            }
            BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM => {
                name = reader.cstr();
            }
            BIND_OPCODE_SET_TYPE_IMM => {}
            BIND_OPCODE_SET_ADDEND_SLEB => {
                let _ = reader.sleb();
            }
            BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                segment_index = imm as usize;
                offset = reader.uleb() as u32;
            }
            BIND_OPCODE_ADD_ADDR_ULEB => {
                offset = offset.wrapping_add(reader.uleb() as u32);
            }
            BIND_OPCODE_DO_BIND => {
                bind_one(machine, segment_index, offset, &name);
                offset = offset.wrapping_add(4);
            }
            BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB => {
                bind_one(machine, segment_index, offset, &name);
                offset = offset.wrapping_add(4).wrapping_add(reader.uleb() as u32);
            }
            BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED => {
                bind_one(machine, segment_index, offset, &name);
                offset = offset.wrapping_add(4).wrapping_add(4 * imm as u32);
            }
            BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB => {
                let count = reader.uleb();
                let skip = reader.uleb() as u32;
                for _ in 0..count {
                    bind_one(machine, segment_index, offset, &name);
                    offset = offset.wrapping_add(4).wrapping_add(skip);
                }
            }
            _ => {
                log!("bind: unrecognized opcode {:#x} in {}", byte, image_name);
                break;
            }
        }
    }
    Ok(())
}

/// Recursive descent over the export trie, announcing `found_symbol` at
/// each terminal node. Invokes a resolver via [Machine::execute_function]
/// when `EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER` is set.
fn walk_export_trie(
    machine: &mut Machine,
    image: &MachO,
    image_name: &str,
    trie: &[u8],
    node_offset: usize,
    prefix: &str,
) -> Result<(), EmuError> {
    let Some(node_bytes) = trie.get(node_offset..) else {
        return Ok(());
    };
    let mut reader = ByteReader::new(node_bytes);
    let terminal_size = reader.uleb() as usize;

    if terminal_size > 0 {
        let mut terminal = ByteReader::new(&node_bytes[reader.pos..reader.pos + terminal_size]);
        let flags = terminal.uleb();
        if flags & EXPORT_SYMBOL_FLAGS_REEXPORT != 0 {
            let _ordinal = terminal.uleb();
            let _import_name = terminal.cstr();
            log!("export: re-export of {:?} not followed", prefix);
        } else {
            let text_base = image.text_segment_base.unwrap_or(0);
            let address_offset = terminal.uleb() as u32;
            let mut resolved = text_base.wrapping_add(address_offset);
            if flags & EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER != 0 {
                let resolver_offset = terminal.uleb() as u32;
                let resolver_addr = text_base.wrapping_add(resolver_offset);
                resolved = machine
                    .execute_function(resolver_addr, &[])
                    .unwrap_or(resolved);
            }
            machine
                .symtab
                .found(&mut machine.mem, prefix, resolved, image_name)?;
        }
    }

    reader.pos += terminal_size;
    let child_count = reader.u8();
    for _ in 0..child_count {
        let label = reader.cstr();
        let child_offset = reader.uleb() as usize;
        let mut child_name = String::with_capacity(prefix.len() + label.len());
        child_name.push_str(prefix);
        child_name.push_str(&label);
        walk_export_trie(machine, image, image_name, trie, child_offset, &child_name)?;
    }
    Ok(())
}

fn process_dyld_info(machine: &mut Machine, image: &MachO, image_name: &str) -> Result<(), EmuError> {
    let Some(info) = &image.dyld_info else {
        return Ok(());
    };
    if !info.export_trie.is_empty() {
        walk_export_trie(machine, image, image_name, &info.export_trie, 0, "")?;
    }
    if !info.bind_opcodes.is_empty() {
        run_bind_opcodes(machine, image, image_name, &info.bind_opcodes)?;
    }
    if !info.lazy_bind_opcodes.is_empty() {
        run_bind_opcodes(machine, image, image_name, &info.lazy_bind_opcodes)?;
    }
    Ok(())
}

/// `S_LAZY_SYMBOL_POINTERS` -> `need_symbol`, `S_MOD_INIT_FUNC_POINTERS` ->
/// run each pointer as a constructor via [Machine::execute_function].
fn process_sections(machine: &mut Machine, image: &MachO) -> Result<(), EmuError> {
    for section in image.get_section(SectionKind::LazySymbolPointers) {
        let count = if section.entry_size == 0 {
            0
        } else {
            section.size / section.entry_size
        };
        for j in 0..count {
            let idx = (section.indirect_start + j) as usize;
            let Some(Some(name)) = image.indirect_symbol_names.get(idx) else {
                continue;
            };
            let target = section.addr + j * section.entry_size;
            machine.symtab.need(&mut machine.mem, name, target)?;
        }
    }

    let init_pointers: Vec<u32> = image
        .get_section(SectionKind::ModInitFuncPointers)
        .flat_map(|section| {
            let count = section.size / 4;
            (0..count).map(move |j| section.addr + j * 4)
        })
        .collect();
    for addr in init_pointers {
        let ctor = machine.mem.read_sized(addr as u32, 4)? as u32;
        if ctor != 0 {
            machine.execute_function(ctor, &[])?;
        }
    }
    Ok(())
}

fn load_one(
    machine: &mut Machine,
    bytes: &[u8],
    name: &str,
    cache_base: Option<usize>,
) -> Result<MachO, EmuError> {
    let image = MachO::load_from_bytes(bytes, &mut machine.mem, name.to_string(), cache_base)?;
    for sym in &image.defined_symbols {
        machine.symtab.found(&mut machine.mem, &sym.name, sym.value, name)?;
    }
    Ok(image)
}

fn resolve_bytes<'a>(
    fs: &Fs,
    cache: Option<&'a DyldCache>,
    path: &str,
) -> Result<(Cow<'a, [u8]>, Option<usize>), EmuError> {
    if let Some(cache) = cache {
        if let Some((offset, buf)) = cache.try_cache(path) {
            return Ok((Cow::Borrowed(buf), Some(offset)));
        }
    }
    if fs.exists(path) {
        let bytes = fs.read(path).map_err(LoaderError::Io)?;
        return Ok((Cow::Owned(bytes), None));
    }
    Err(LoaderError::DylibNotFound {
        path: path.to_string(),
    }
    .into())
}

fn load_dylibs(
    machine: &mut Machine,
    fs: &Fs,
    cache: Option<&DyldCache>,
    image: &MachO,
    loaded: &mut HashSet<String>,
) -> Result<(), EmuError> {
    // Collect first: `image.dynamic_libraries` borrows `image`, but loading a
    // dependency needs a fresh `&MachO` of its own further down this stack.
    let deps: Vec<String> = image.dynamic_libraries.clone();
    for path in deps {
        if loaded.contains(&path) {
            continue;
        }
        // Insert before recursing so a cycle is broken by a set hit rather
        // than infinite recursion.
        loaded.insert(path.clone());

        let (bytes, cache_base) = resolve_bytes(fs, cache, &path)?;
        let dep = load_one(machine, &bytes, &path, cache_base)?;
        process_dyld_info(machine, &dep, &path)?;
        process_sections(machine, &dep)?;
        load_dylibs(machine, fs, cache, &dep, loaded)?;
    }
    Ok(())
}

/// Load `main_path` as the program image, recursively load its dylib
/// dependencies (cache first, then the chroot filesystem), bind every
/// external reference, hand out trampolines for whatever remains
/// unresolved, and set the machine's initial register state from the
/// image's entry point.
pub fn load_main(
    machine: &mut Machine,
    fs: &Fs,
    cache: Option<&DyldCache>,
    main_path: &Path,
) -> Result<(), EmuError> {
    let main_bytes = std::fs::read(main_path).map_err(LoaderError::Io)?;
    let name = main_path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "main".to_string());

    let main_image = load_one(machine, &main_bytes, &name, None)?;
    process_dyld_info(machine, &main_image, &name)?;
    process_sections(machine, &main_image)?;

    let mut loaded = HashSet::new();
    loaded.insert(name.clone());
    load_dylibs(machine, fs, cache, &main_image, &mut loaded)?;

    // Whatever is still unresolved after the whole dependency graph has
    // loaded is a genuinely external symbol this emulator doesn't implement;
    // give it a trampoline so any binder (export trie, bind opcodes, symtab,
    // indirect table) still resolves uniformly.
    for symbol_name in machine.symtab.unresolved_names() {
        let addr = machine
            .breakpoints
            .allocate(&mut machine.mem, &symbol_name, None)?;
        machine
            .symtab
            .found(&mut machine.mem, &symbol_name, addr, "<trampoline>")?;
    }
    machine.symtab.assert_fully_resolved()?;

    if let Some(thread) = &main_image.unixthread {
        machine.arch.r[..13].copy_from_slice(&thread.r);
        machine.arch.r[state::LR] = thread.lr;
        machine.arch.thumb = thread.pc & 1 != 0;
        machine.arch.next_instruction = thread.pc & !1;
    } else if let Some(pc) = main_image.entry_point_pc {
        machine.arch.thumb = pc & 1 != 0;
        machine.arch.next_instruction = pc & !1;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uleb_round_trips_multi_byte_values() {
        // 300 = 0b1_0010_1100 -> ULEB bytes 0xAC 0x02
        let mut reader = ByteReader::new(&[0xac, 0x02]);
        assert_eq!(reader.uleb(), 300);
    }

    #[test]
    fn sleb_decodes_negative_values() {
        // -2 encodes as a single byte 0x7e in SLEB128.
        let mut reader = ByteReader::new(&[0x7e]);
        assert_eq!(reader.sleb(), -2);
    }

    #[test]
    fn cstr_stops_at_nul_and_advances_past_it() {
        let mut reader = ByteReader::new(b"foo\0bar");
        assert_eq!(reader.cstr(), "foo");
        assert_eq!(reader.pos, 4);
    }
}
