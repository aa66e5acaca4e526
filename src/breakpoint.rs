/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Trampolines: fixed guest addresses, each holding the ARM breakpoint
//! encoding, that the loader hands out in place of a real function body for
//! an external symbol it cannot resolve to guest code. A `BL`/`BLX` into a
//! trampoline traps back into the executor's BKPT path, which runs a
//! host-implemented stub and returns via `LR` as if the call had been a
//! normal `BL`.

use crate::decoder::BREAKPOINT_ENCODING;
use crate::error::EmuError;
use crate::mem::{Mem, VAddr};
use std::collections::HashMap;

/// A host function bound to a trampoline. Receives the machine so it can
/// read arguments and write `r0`, returns the value to place in `r0`.
pub type HostFn = fn(&mut crate::machine::Machine) -> Result<u32, EmuError>;

pub struct Breakpoint {
    pub name: String,
    pub handler: Option<HostFn>,
}

/// Base address the trampoline allocator starts handing out slots from.
const TRAMPOLINE_BASE: VAddr = 0xa000_0000;

pub struct BreakpointRegistry {
    cursor: VAddr,
    /// One past the end of the page range already mapped for trampolines.
    mapped_up_to: VAddr,
    breakpoints: HashMap<VAddr, Breakpoint>,
}

impl BreakpointRegistry {
    pub fn new() -> BreakpointRegistry {
        BreakpointRegistry {
            cursor: TRAMPOLINE_BASE,
            mapped_up_to: TRAMPOLINE_BASE,
            breakpoints: HashMap::new(),
        }
    }

    /// Allocate a fresh trampoline slot for `name`, writing the breakpoint
    /// encoding into guest memory and registering `handler` (`None` if no
    /// host stub exists yet, which is itself a fatal condition if ever hit).
    pub fn allocate(&mut self, mem: &mut Mem, name: &str, handler: Option<HostFn>) -> Result<VAddr, EmuError> {
        let addr = self.cursor;
        self.cursor += 4;
        if addr + 4 > self.mapped_up_to {
            mem.map(self.mapped_up_to, crate::mem::PAGE_SIZE);
            self.mapped_up_to += crate::mem::PAGE_SIZE;
        }
        mem.write_sized(addr, 4, BREAKPOINT_ENCODING as u64)?;
        self.breakpoints.insert(
            addr,
            Breakpoint {
                name: name.to_string(),
                handler,
            },
        );
        Ok(addr)
    }

    pub fn lookup(&self, addr: VAddr) -> Option<&Breakpoint> {
        self.breakpoints.get(&addr)
    }
}

impl Default for BreakpointRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_writes_breakpoint_encoding() {
        let mut mem = Mem::new();
        let mut registry = BreakpointRegistry::new();
        let addr = registry.allocate(&mut mem, "foo", None).unwrap();
        assert_eq!(addr, TRAMPOLINE_BASE);
        assert_eq!(mem.read_sized(addr, 4).unwrap(), BREAKPOINT_ENCODING as u64);
        assert_eq!(registry.lookup(addr).unwrap().name, "foo");
    }

    #[test]
    fn successive_allocations_advance_by_four() {
        let mut mem = Mem::new();
        let mut registry = BreakpointRegistry::new();
        let a = registry.allocate(&mut mem, "a", None).unwrap();
        let b = registry.allocate(&mut mem, "b", None).unwrap();
        assert_eq!(b, a + 4);
    }
}
