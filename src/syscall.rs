/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! The darwin-style `SVC #0x80` dispatch tables: a Mach-trap table (indexed
//! by the magnitude of a negative `r12` selector) and a BSD-syscall table
//! (indexed directly by a non-negative one). Both are sparse; a selector
//! with no entry is a fatal [crate::error::EmuError::UnimplementedStub].
//!
//! The table shipped here is deliberately tiny: just enough for a minimal
//! hand-built test binary (bootstrap a Mach port, call `mach_msg`, exit) to
//! run to completion, mirroring the fact that most of the real darwin
//! syscall surface never gets exercised without a much larger host-side
//! library of framework stubs.

use crate::error::EmuError;
use crate::machine::Machine;
use crate::state;
use std::collections::HashMap;

pub type SyscallFn = fn(&mut Machine) -> Result<u32, EmuError>;

/// Reads argument `index` (0-based) of a syscall/trap per AAPCS: `A0..A3`
/// come from `r0..r3`, `A4..A9` from the words the caller pushed just below
/// its own stack pointer (`[SP-4], [SP-8], ...`).
pub fn arg(machine: &Machine, index: u8) -> Result<u32, EmuError> {
    if index < 4 {
        Ok(machine.arch.r[index as usize])
    } else {
        let offset = 4 * (index as u32 - 3);
        let addr = machine.arch.r[state::SP].wrapping_sub(offset);
        machine.mem.read_sized(addr, 4).map(|v| v as u32)
    }
}

pub struct SyscallTables {
    mach_traps: HashMap<u32, SyscallFn>,
    bsd: HashMap<u32, SyscallFn>,
}

impl SyscallTables {
    pub fn new() -> SyscallTables {
        let mut mach_traps: HashMap<u32, SyscallFn> = HashMap::new();
        // Selectors are magnitudes of the (negative) real XNU Mach-trap
        // numbers for armv7 darwin.
        mach_traps.insert(26, mach_reply_port);
        mach_traps.insert(28, mach_task_self);
        mach_traps.insert(31, mach_msg_trap);

        let mut bsd: HashMap<u32, SyscallFn> = HashMap::new();
        bsd.insert(20, getpid);
        bsd.insert(1, sys_exit);

        SyscallTables { mach_traps, bsd }
    }

    /// Dispatch on `r12`: negative selects the Mach-trap table by magnitude,
    /// non-negative selects the BSD table directly.
    pub fn dispatch(&self, selector: i32) -> Option<SyscallFn> {
        if selector < 0 {
            self.mach_traps.get(&(-selector as u32)).copied()
        } else {
            self.bsd.get(&(selector as u32)).copied()
        }
    }
}

impl Default for SyscallTables {
    fn default() -> Self {
        Self::new()
    }
}

fn mach_reply_port(_machine: &mut Machine) -> Result<u32, EmuError> {
    Ok(0)
}

fn mach_task_self(_machine: &mut Machine) -> Result<u32, EmuError> {
    Ok(1)
}

fn mach_msg_trap(_machine: &mut Machine) -> Result<u32, EmuError> {
    Ok(0) // KERN_SUCCESS; message contents are not modeled.
}

fn getpid(_machine: &mut Machine) -> Result<u32, EmuError> {
    Ok(1)
}

fn sys_exit(machine: &mut Machine) -> Result<u32, EmuError> {
    let code = arg(machine, 0)?;
    echo!("guest called exit({code})");
    std::process::exit(code as i32);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_selector_hits_mach_trap_table() {
        let tables = SyscallTables::new();
        assert!(tables.dispatch(-26).is_some());
        assert!(tables.dispatch(-999).is_none());
    }

    #[test]
    fn nonnegative_selector_hits_bsd_table() {
        let tables = SyscallTables::new();
        assert!(tables.dispatch(20).is_some());
        assert!(tables.dispatch(999).is_none());
    }
}
