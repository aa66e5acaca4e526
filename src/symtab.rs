/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! The symbol table binds external-symbol references in one image to
//! definitions in another, in whichever order the loader happens to discover
//! them. `found` and `need` are the only two entry points, and either order
//! of calling them for a given name converges on the same memory state.

use crate::error::EmuError;
use crate::mem::{Mem, VAddr};
use std::collections::BTreeMap;

struct Entry {
    value: Option<u32>,
    pending: Vec<VAddr>,
}

/// Bidirectional registry resolving `need_symbol` call sites against
/// `found_symbol` announcements, possibly made in either order and from
/// different images.
#[derive(Default)]
pub struct SymbolTable {
    entries: BTreeMap<String, Entry>,
    /// Diagnostics only: guest address -> (image name, symbol name), so a
    /// fatal abort can report roughly where execution was. Has no effect on
    /// binding semantics.
    symbolication: BTreeMap<u32, (String, String)>,
}

impl SymbolTable {
    pub fn new() -> SymbolTable {
        SymbolTable::default()
    }

    /// Announce that `name` resolves to `value`. Immediately writes `value`
    /// to every address that previously called `need(name, ...)`, then
    /// clears the pending list.
    pub fn found(&mut self, mem: &mut Mem, name: &str, value: u32, image: &str) -> Result<(), EmuError> {
        self.symbolication.insert(value, (image.to_string(), name.to_string()));
        let entry = self
            .entries
            .entry(name.to_string())
            .or_insert_with(|| Entry { value: None, pending: Vec::new() });
        entry.value = Some(value);
        for target in entry.pending.drain(..) {
            mem.write_sized(target, 4, value as u64)?;
        }
        Ok(())
    }

    /// Request that `target` be written with `name`'s value once known. If
    /// the value is already known, writes it immediately; otherwise queues
    /// `target` for [Self::found] to fill in later.
    pub fn need(&mut self, mem: &mut Mem, name: &str, target: VAddr) -> Result<(), EmuError> {
        let entry = self
            .entries
            .entry(name.to_string())
            .or_insert_with(|| Entry { value: None, pending: Vec::new() });
        match entry.value {
            Some(value) => mem.write_sized(target, 4, value as u64),
            None => {
                entry.pending.push(target);
                Ok(())
            }
        }
    }

    /// The diagnostic symbolication map, keyed by resolved address.
    pub fn symbolicate(&self, addr: u32) -> Option<&(String, String)> {
        self.symbolication.range(..=addr).next_back().map(|(_, v)| v)
    }

    /// Names of every symbol that has been `need`-ed but never `found`. Used
    /// by the loader to hand out trampolines for genuinely external symbols
    /// once the whole dependency graph has been loaded, before the final
    /// [Self::assert_fully_resolved] check.
    pub fn unresolved_names(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.value.is_none() && !entry.pending.is_empty())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// `dump_symtab`: fatal if any symbol mentioned via `need` never got a
    /// value. Call once after the full dependency graph has been loaded.
    pub fn assert_fully_resolved(&self) -> Result<(), EmuError> {
        for (name, entry) in &self.entries {
            if entry.value.is_none() && !entry.pending.is_empty() {
                return Err(EmuError::UnresolvedSymbol { name: name.clone() });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn need_then_found_writes_value() {
        let mut mem = Mem::new();
        mem.map(0x1000, 4);
        let mut table = SymbolTable::new();
        table.need(&mut mem, "foo", 0x1000).unwrap();
        assert_eq!(mem.read_sized(0x1000, 4).unwrap(), 0);
        table.found(&mut mem, "foo", 0x42, "test").unwrap();
        assert_eq!(mem.read_sized(0x1000, 4).unwrap(), 0x42);
    }

    #[test]
    fn found_then_need_writes_value() {
        let mut mem = Mem::new();
        mem.map(0x1000, 4);
        let mut table = SymbolTable::new();
        table.found(&mut mem, "foo", 0x42, "test").unwrap();
        table.need(&mut mem, "foo", 0x1000).unwrap();
        assert_eq!(mem.read_sized(0x1000, 4).unwrap(), 0x42);
    }

    #[test]
    fn unresolved_symbol_is_fatal() {
        let mut mem = Mem::new();
        mem.map(0x1000, 4);
        let mut table = SymbolTable::new();
        table.need(&mut mem, "bar", 0x1000).unwrap();
        assert!(table.assert_fully_resolved().is_err());
    }

    #[test]
    fn symbolicates_last_known_address_at_or_below() {
        let mut mem = Mem::new();
        let mut table = SymbolTable::new();
        table.found(&mut mem, "foo", 0x2000, "libfoo").unwrap();
        let (image, name) = table.symbolicate(0x2010).unwrap();
        assert_eq!(image, "libfoo");
        assert_eq!(name, "foo");
    }
}
