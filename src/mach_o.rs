/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Reading of Mach-O files, the executable and library format on iPhone OS.
//!
//! Implemented using the `mach_object` crate. All usage of that crate should
//! be confined to this module. The goal is to read the Mach-O binary exactly
//! once, storing any information the loader needs later, and to map loadable
//! section bytes into guest memory as they're encountered.
//!
//! Useful resources:
//! - Apple's [Overview of the Mach-O Executable Format](https://developer.apple.com/library/archive/documentation/Performance/Conceptual/CodeFootprint/Articles/MachOOverview.html).
//! - The old "OS X ABI Mach-O File Format Reference", mirrored in various
//!   places online.
//! - The [source of the mach_object crate](https://docs.rs/mach_object/latest/src/mach_object/commands.rs.html)
//!   has useful comments that don't show up in the generated documentation.

use crate::error::LoaderError;
use crate::mem::{Mem, Ptr};
use mach_object::{
    LoadCommand, MachCommand, OFile, Symbol, SymbolIter, ThreadState, N_ARM_THUMB_DEF,
    S_LAZY_SYMBOL_POINTERS, S_MOD_INIT_FUNC_POINTERS, S_NON_LAZY_SYMBOL_POINTERS,
    S_SYMBOL_STUBS, S_ZEROFILL,
};
use std::io::Cursor;

/// Bit OR'd into a defined symbol's value when `N_ARM_THUMB_DEF` is set in
/// its `n_desc`, matching the ARM convention of using the low address bit to
/// mark a function pointer as a Thumb entry point.
pub const THUMB_BIT: u32 = 1;

/// Marks a slot in the indirect symbol table that doesn't reference a real
/// undefined symbol (see `mach-o/loader.h`).
const INDIRECT_SYMBOL_LOCAL: u32 = 0x8000_0000;
const INDIRECT_SYMBOL_ABS: u32 = 0x4000_0000;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SectionKind {
    Normal,
    Zerofill,
    SymbolStubs,
    LazySymbolPointers,
    NonLazySymbolPointers,
    ModInitFuncPointers,
}

#[derive(Debug)]
pub struct ParsedSection {
    pub name: String,
    pub addr: u32,
    pub size: u32,
    pub kind: SectionKind,
    /// For stub/pointer sections: index of the section's first entry within
    /// the image's indirect symbol table.
    pub indirect_start: u32,
    /// Size in bytes of one entry (pointer or stub) in this section.
    pub entry_size: u32,
}

#[derive(Debug)]
pub struct ParsedSegment {
    pub name: String,
    pub vmaddr: u32,
    pub sections: Vec<ParsedSection>,
}

#[derive(Debug)]
pub struct DefinedSymbol {
    pub name: String,
    pub value: u32,
}

/// Raw opcode streams from `LC_DYLD_INFO_ONLY`, copied out of the file buffer
/// so they outlive the parse.
#[derive(Debug, Default)]
pub struct DyldInfo {
    pub bind_opcodes: Vec<u8>,
    pub lazy_bind_opcodes: Vec<u8>,
    pub export_trie: Vec<u8>,
}

/// The 17-word `LC_UNIXTHREAD` register snapshot: `r0..r12`, `sp`, `lr`, `pc`.
/// The loader applies every field except `sp`, which the stack allocator
/// picks independently.
#[derive(Debug)]
pub struct UnixThread {
    pub r: [u32; 13],
    pub sp: u32,
    pub lr: u32,
    pub pc: u32,
}

#[derive(Debug)]
pub struct MachO {
    pub name: String,
    pub segments: Vec<ParsedSegment>,
    pub defined_symbols: Vec<DefinedSymbol>,
    /// Parallel to the image's `LC_DYSYMTAB` indirect symbol table; `None`
    /// for `INDIRECT_SYMBOL_ABS`/`INDIRECT_SYMBOL_LOCAL` slots.
    pub indirect_symbol_names: Vec<Option<String>>,
    pub dyld_info: Option<DyldInfo>,
    pub dynamic_libraries: Vec<String>,
    pub unixthread: Option<UnixThread>,
    pub entry_point_pc: Option<u32>,
    pub text_segment_base: Option<u32>,
}

fn get_sym_by_idx<'a>(
    idx: u32,
    (symoff, nsyms, stroff, strsize): (u32, u32, u32, u32),
    is_bigend: bool,
    is_64bit: bool,
    cursor: &'a mut Cursor<&'a [u8]>,
) -> Option<mach_object::Symbol<'a>> {
    use std::io::{Seek, SeekFrom};
    if idx >= nsyms {
        return None;
    }
    let symoff = (symoff + idx * 12) as u64;
    cursor.seek(SeekFrom::Start(symoff)).ok()?;
    // parse_symbol() on SymbolIter needs the bytestring crate, so iterate
    // manually from the seeked position instead.
    let mut iter = SymbolIter::new(cursor, Vec::new(), 1, stroff, strsize, is_bigend, is_64bit);
    iter.next()
}

impl MachO {
    /// Parse one ARM Mach-O image (or pick the ARM slice out of a fat
    /// binary) out of `bytes`, mapping its loadable sections into `into_mem`.
    ///
    /// `cache_base` is `Some(offset)` when `bytes` is a whole `dyld` shared
    /// cache buffer and the image's Mach-O header begins at `offset` within
    /// it; `None` when `bytes` is a standalone file already sliced to the
    /// image.
    pub fn load_from_bytes(
        bytes: &[u8],
        into_mem: &mut Mem,
        name: String,
        cache_base: Option<usize>,
    ) -> Result<MachO, LoaderError> {
        log_dbg!("Reading {:?}", name);

        let mut cursor = Cursor::new(bytes);
        let file = OFile::parse(&mut cursor).map_err(|e| LoaderError::MachO(e.to_string()))?;

        let (header, commands) = match file {
            OFile::MachFile { header, commands } => (header, commands),
            OFile::FatFile { files, .. } => {
                let mut best_subslice = None;
                let mut best_type = None;
                for (arch, _) in files {
                    if arch.cputype != mach_object::CPU_TYPE_ARM {
                        continue;
                    }
                    if arch.cpusubtype == mach_object::CPU_SUBTYPE_ARM_V7
                        || (arch.cpusubtype == mach_object::CPU_SUBTYPE_ARM_V6
                            && best_type != Some(mach_object::CPU_SUBTYPE_ARM_V7))
                        || best_type.is_none()
                    {
                        best_subslice = Some(
                            &bytes[arch.offset as usize..arch.offset as usize + arch.size as usize],
                        );
                        best_type = Some(arch.cpusubtype);
                    }
                }
                let subslice = best_subslice.ok_or(LoaderError::NoArmSlice)?;
                return MachO::load_from_bytes(subslice, into_mem, name, None);
            }
            OFile::ArFile { .. } | OFile::SymDef { .. } => {
                return Err(LoaderError::MachO("not an executable or dylib".to_string()));
            }
        };

        if header.cputype != mach_object::CPU_TYPE_ARM {
            return Err(LoaderError::MachO("not an ARM binary".to_string()));
        }
        if header.is_bigend() || header.is_64bit() {
            return Err(LoaderError::MachO(
                "expected a little-endian 32-bit ARM image".to_string(),
            ));
        }
        let is_bigend = false;
        let is_64bit = false;

        let mut segments = Vec::new();
        let mut defined_symbols = Vec::new();
        let mut indirect_symbol_names: Vec<Option<String>> = Vec::new();
        let mut dyld_info: Option<DyldInfo> = None;
        let mut dynamic_libraries = Vec::new();
        let mut unixthread = None;
        let mut entry_point_pc = None;
        let mut text_segment_base = None;
        let mut sym_tab_info: Option<(u32, u32, u32, u32)> = None;

        for MachCommand(command, _size) in &commands {
            match command {
                LoadCommand::Segment {
                    segname,
                    vmaddr,
                    fileoff,
                    sections,
                    ..
                } => {
                    let vmaddr: u32 = (*vmaddr).try_into().unwrap();
                    let fileoff: u32 = (*fileoff).try_into().unwrap();

                    if segname == "__PAGEZERO" || segname == "__LINKEDIT" {
                        continue;
                    }
                    if segname == "__TEXT" && text_segment_base.is_none() {
                        text_segment_base = Some(vmaddr);
                    }

                    let file_base = match cache_base {
                        Some(cache_base) if (fileoff as usize) < cache_base => cache_base,
                        _ => 0,
                    };

                    let mut parsed_sections = Vec::with_capacity(sections.len());
                    for section in sections {
                        let sec_name = section.sectname.clone();
                        let addr: u32 = section.addr.try_into().unwrap();
                        let size: u32 = section.size.try_into().unwrap();
                        let sec_offset: u32 = section.offset;
                        let sect_type = section.flags.sect_type();

                        let kind = match sect_type {
                            t if t == S_ZEROFILL => SectionKind::Zerofill,
                            t if t == S_MOD_INIT_FUNC_POINTERS => SectionKind::ModInitFuncPointers,
                            t if t == S_SYMBOL_STUBS => SectionKind::SymbolStubs,
                            t if t == S_LAZY_SYMBOL_POINTERS => SectionKind::LazySymbolPointers,
                            t if t == S_NON_LAZY_SYMBOL_POINTERS => SectionKind::NonLazySymbolPointers,
                            _ => SectionKind::Normal,
                        };

                        into_mem.map(addr, size);
                        if kind != SectionKind::Zerofill && size > 0 {
                            let start = file_base + sec_offset as usize;
                            if let Some(src) = bytes.get(start..start + size as usize) {
                                into_mem.map_bytes(addr, src);
                            }
                        }

                        let entry_size = match kind {
                            SectionKind::SymbolStubs => section.reserved2,
                            SectionKind::LazySymbolPointers | SectionKind::NonLazySymbolPointers => 4,
                            _ => 0,
                        };

                        parsed_sections.push(ParsedSection {
                            name: sec_name,
                            addr,
                            size,
                            kind,
                            indirect_start: section.reserved1,
                            entry_size,
                        });
                    }

                    segments.push(ParsedSegment {
                        name: segname.clone().into_owned(),
                        vmaddr,
                        sections: parsed_sections,
                    });
                }
                LoadCommand::SymTab {
                    symoff,
                    nsyms,
                    stroff,
                    strsize,
                } => {
                    sym_tab_info = Some((*symoff, *nsyms, *stroff, *strsize));
                    if let Ok(mut sym_cursor) = {
                        use std::io::{Seek, SeekFrom};
                        let mut c = cursor.clone();
                        c.seek(SeekFrom::Start((*symoff).into())).map(|_| c)
                    } {
                        let symbols = SymbolIter::new(
                            &mut sym_cursor,
                            Vec::new(),
                            *nsyms,
                            *stroff,
                            *strsize,
                            is_bigend,
                            is_64bit,
                        );
                        for symbol in symbols {
                            if let Symbol::Defined {
                                name: Some(sym_name),
                                external: true,
                                entry,
                                desc,
                                ..
                            } = symbol
                            {
                                let entry: u32 = entry.try_into().unwrap();
                                let value = if desc & N_ARM_THUMB_DEF != 0 {
                                    entry | THUMB_BIT
                                } else {
                                    entry
                                };
                                defined_symbols.push(DefinedSymbol {
                                    name: sym_name.to_string(),
                                    value,
                                });
                            }
                        }
                    }
                }
                LoadCommand::DySymTab {
                    indirectsymoff,
                    nindirectsyms,
                    ..
                } => {
                    let Some(sym_tab_info) = sym_tab_info else {
                        continue;
                    };
                    let start = *indirectsymoff as usize;
                    let count = *nindirectsyms as usize;
                    let Some(raw) = bytes.get(start..start + count * 4) else {
                        return Err(LoaderError::TruncatedLoadCommand);
                    };
                    for chunk in raw.chunks(4) {
                        let idx = u32::from_le_bytes(chunk.try_into().unwrap());
                        if idx & (INDIRECT_SYMBOL_LOCAL | INDIRECT_SYMBOL_ABS) != 0 {
                            indirect_symbol_names.push(None);
                            continue;
                        }
                        let mut sym_cursor = cursor.clone();
                        let sym = get_sym_by_idx(idx, sym_tab_info, is_bigend, is_64bit, &mut sym_cursor);
                        indirect_symbol_names.push(match sym {
                            Some(Symbol::Undefined { name: Some(n), .. }) => Some(n.to_string()),
                            Some(Symbol::Prebound { name: Some(n), .. }) => Some(n.to_string()),
                            Some(Symbol::Defined { name: Some(n), .. }) => Some(n.to_string()),
                            _ => None,
                        });
                    }
                }
                LoadCommand::DyldInfo {
                    bind_off,
                    bind_size,
                    lazy_bind_off,
                    lazy_bind_size,
                    export_off,
                    export_size,
                    ..
                } => {
                    let copy = |off: u32, size: u32| -> Vec<u8> {
                        bytes
                            .get(off as usize..off as usize + size as usize)
                            .map(|s| s.to_vec())
                            .unwrap_or_default()
                    };
                    dyld_info = Some(DyldInfo {
                        bind_opcodes: copy(*bind_off, *bind_size),
                        lazy_bind_opcodes: copy(*lazy_bind_off, *lazy_bind_size),
                        export_trie: copy(*export_off, *export_size),
                    });
                }
                LoadCommand::LoadDyLib(dylib) | LoadCommand::ReexportDyLib(dylib) => {
                    dynamic_libraries.push(dylib.name.to_string());
                }
                LoadCommand::UnixThread { state, .. } => {
                    if let ThreadState::Arm {
                        __r,
                        __sp,
                        __lr,
                        __pc,
                        ..
                    } = state
                    {
                        entry_point_pc.get_or_insert(*__pc);
                        unixthread = Some(UnixThread {
                            r: *__r,
                            sp: *__sp,
                            lr: *__lr,
                            pc: *__pc,
                        });
                    }
                }
                LoadCommand::EntryPoint { entryoff, .. } => {
                    let entryoff: u32 = (*entryoff).try_into().unwrap();
                    entry_point_pc.get_or_insert(text_segment_base.unwrap_or(0) + entryoff);
                }
                _ => (),
            }
        }

        Ok(MachO {
            name,
            segments,
            defined_symbols,
            indirect_symbol_names,
            dyld_info,
            dynamic_libraries,
            unixthread,
            entry_point_pc,
            text_segment_base,
        })
    }

    pub fn get_section(&self, kind: SectionKind) -> impl Iterator<Item = &ParsedSection> {
        self.segments
            .iter()
            .flat_map(move |seg| seg.sections.iter().filter(move |s| s.kind == kind))
    }

    pub fn segment_base(&self, index: usize) -> Option<u32> {
        self.segments.get(index).map(|s| s.vmaddr)
    }
}

/// Convenience alias used by the loader when writing resolved pointer values.
pub fn ptr32(addr: u32) -> Ptr<u32, true> {
    Ptr::from_bits(addr)
}
