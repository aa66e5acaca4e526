/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Applies one decoded [crate::decoder::Instruction]'s semantics to a
//! [crate::machine::Machine]. Conditional skipping and IT-block bookkeeping
//! happen one level up in [crate::machine::Machine::step]; by the time
//! [execute] is called the instruction is known to pass its condition.

use crate::arm::{self, ShiftType};
use crate::decoder::{IndexMode, Instruction, Opcode};
use crate::error::EmuError;
use crate::machine::Machine;
use crate::state::{self, ArchState};

/// Reads a register operand, special-casing `r15` to the architectural
/// "PC reads two instructions ahead" value rather than the live next-fetch
/// address.
fn reg(state: &ArchState, instr: &Instruction, n: u8) -> u32 {
    if n as usize == state::PC {
        pc_value(state, instr)
    } else {
        state.r[n as usize]
    }
}

fn pc_value(state: &ArchState, instr: &Instruction) -> u32 {
    instr.address + if state.thumb { 4 } else { 8 }
}

/// `ALUWritePC`: in ARM state this is an interworking branch (updates `T`
/// from the target's bit 0); in Thumb state it is a plain, non-interworking
/// branch.
fn alu_write_pc(state: &mut ArchState, value: u32) {
    if !state.thumb {
        state.thumb = value & 1 != 0;
    }
    state.next_instruction = value & !1u32;
}

/// `LOAD_PC(p)` / `BXWritePC`: always interworking.
fn load_write_pc(state: &mut ArchState, value: u32) {
    state.thumb = value & 1 != 0;
    state.next_instruction = value & !1u32;
}

/// Writes `value` to register `d`, routing through [alu_write_pc] when `d`
/// is `r15` (the common case for every data-processing opcode).
fn write_dest(state: &mut ArchState, d: u8, value: u32) {
    if d as usize == state::PC {
        alu_write_pc(state, value);
    } else {
        state.r[d as usize] = value;
    }
}

fn set_nz(state: &mut ArchState, result: u32) {
    state.n = (result >> 31) & 1 != 0;
    state.z = result == 0;
}

/// Applies the NZCV update for a data-processing-immediate/register opcode,
/// but only when `setflags` holds and the destination is not `r15` (section
/// 4.3: flag updates are gated on both).
fn maybe_set_logical_flags(state: &mut ArchState, d: u8, setflags: bool, result: u32, carry: Option<bool>) {
    if setflags && d as usize != state::PC {
        set_nz(state, result);
        if let Some(c) = carry {
            state.c = c;
        }
    }
}

fn maybe_set_arith_flags(state: &mut ArchState, d: u8, setflags: bool, result: u32, carry: bool, overflow: bool) {
    if setflags && d as usize != state::PC {
        set_nz(state, result);
        state.c = carry;
        state.v = overflow;
    }
}

fn offset_addr(base: u32, imm32: u32, add: bool) -> u32 {
    if add {
        base.wrapping_add(imm32)
    } else {
        base.wrapping_sub(imm32)
    }
}

/// Computes the address to access and, if writeback applies, the value to
/// write back into the base register.
fn ls_address(base: u32, offset: u32, add: bool, index: IndexMode) -> (u32, Option<u32>) {
    match index {
        IndexMode::Offset => (offset_addr(base, offset, add), None),
        IndexMode::PreIndexed => {
            let addr = offset_addr(base, offset, add);
            (addr, Some(addr))
        }
        IndexMode::PostIndexed => (base, Some(offset_addr(base, offset, add))),
    }
}

fn register_offset(state: &ArchState, instr: &Instruction, m: u8, shift_t: ShiftType, shift_n: u8) -> u32 {
    arm::shift(reg(state, instr, m), shift_t, shift_n, state.c)
}

pub fn execute(machine: &mut Machine, instr: &Instruction) -> Result<(), EmuError> {
    match instr.op.clone() {
        Opcode::LdrI { t, n, imm32, add, index } => {
            let base = reg(&machine.arch, instr, n);
            let (addr, wback) = ls_address(base, imm32, add, index);
            let value = machine.mem.read_sized(addr, 4)? as u32;
            if let Some(new_n) = wback {
                machine.arch.r[n as usize] = new_n;
            }
            if t as usize == state::PC {
                load_write_pc(&mut machine.arch, value);
            } else {
                machine.arch.r[t as usize] = value;
            }
        }
        Opcode::LdrbI { t, n, imm32, add, index } => {
            let base = reg(&machine.arch, instr, n);
            let (addr, wback) = ls_address(base, imm32, add, index);
            let value = machine.mem.read_sized(addr, 1)? as u32;
            if let Some(new_n) = wback {
                machine.arch.r[n as usize] = new_n;
            }
            write_dest(&mut machine.arch, t, value);
        }
        Opcode::LdrR { t, n, m, shift_t, shift_n, add, index } => {
            let base = reg(&machine.arch, instr, n);
            let offset = register_offset(&machine.arch, instr, m, shift_t, shift_n);
            let (addr, wback) = ls_address(base, offset, add, index);
            let value = machine.mem.read_sized(addr, 4)? as u32;
            if let Some(new_n) = wback {
                machine.arch.r[n as usize] = new_n;
            }
            if t as usize == state::PC {
                load_write_pc(&mut machine.arch, value);
            } else {
                machine.arch.r[t as usize] = value;
            }
        }
        Opcode::LdrL { t, imm32, add } => {
            let base = pc_value(&machine.arch, instr) & !0b11;
            let addr = offset_addr(base, imm32, add);
            let value = machine.mem.read_sized(addr, 4)? as u32;
            write_dest(&mut machine.arch, t, value);
        }
        Opcode::StrI { t, n, imm32, add, index } => {
            let base = reg(&machine.arch, instr, n);
            let (addr, wback) = ls_address(base, imm32, add, index);
            let value = reg(&machine.arch, instr, t);
            machine.mem.write_sized(addr, 4, value as u64)?;
            if let Some(new_n) = wback {
                machine.arch.r[n as usize] = new_n;
            }
        }
        Opcode::StrbI { t, n, imm32, add, index } => {
            let base = reg(&machine.arch, instr, n);
            let (addr, wback) = ls_address(base, imm32, add, index);
            let value = reg(&machine.arch, instr, t);
            machine.mem.write_sized(addr, 1, value as u64)?;
            if let Some(new_n) = wback {
                machine.arch.r[n as usize] = new_n;
            }
        }
        Opcode::StrR { t, n, m, shift_t, shift_n, add, index } => {
            let base = reg(&machine.arch, instr, n);
            let offset = register_offset(&machine.arch, instr, m, shift_t, shift_n);
            let (addr, wback) = ls_address(base, offset, add, index);
            let value = reg(&machine.arch, instr, t);
            machine.mem.write_sized(addr, 4, value as u64)?;
            if let Some(new_n) = wback {
                machine.arch.r[n as usize] = new_n;
            }
        }
        Opcode::StrdI { t, t2, n, imm32, add, index } => {
            let base = reg(&machine.arch, instr, n);
            let (addr, wback) = ls_address(base, imm32, add, index);
            // Source bug fix (see DESIGN.md): Rt goes to `address`, Rt2 to
            // `address+4`, not both halves getting Rt.
            machine.mem.write_sized(addr, 4, reg(&machine.arch, instr, t) as u64)?;
            machine.mem.write_sized(addr + 4, 4, reg(&machine.arch, instr, t2) as u64)?;
            if let Some(new_n) = wback {
                machine.arch.r[n as usize] = new_n;
            }
        }
        Opcode::Ldrex { t, n, imm32 } => {
            let addr = reg(&machine.arch, instr, n).wrapping_add(imm32);
            let value = machine.mem.read_sized(addr, 4)? as u32;
            write_dest(&mut machine.arch, t, value);
        }
        Opcode::Strex { d, t, n, imm32 } => {
            let addr = reg(&machine.arch, instr, n).wrapping_add(imm32);
            let value = reg(&machine.arch, instr, t);
            machine.mem.write_sized(addr, 4, value as u64)?;
            // No exclusive-monitor tracking: always reports success.
            write_dest(&mut machine.arch, d, 0);
        }

        Opcode::AddI { d, n, imm32, setflags } => {
            let (result, carry, overflow) = arm::add_with_carry(reg(&machine.arch, instr, n), imm32, false);
            write_dest(&mut machine.arch, d, result);
            maybe_set_arith_flags(&mut machine.arch, d, setflags, result, carry, overflow);
        }
        Opcode::AddR { d, n, m, shift_t, shift_n, setflags } => {
            let shifted = register_offset(&machine.arch, instr, m, shift_t, shift_n);
            let (result, carry, overflow) = arm::add_with_carry(reg(&machine.arch, instr, n), shifted, false);
            write_dest(&mut machine.arch, d, result);
            maybe_set_arith_flags(&mut machine.arch, d, setflags, result, carry, overflow);
        }
        Opcode::SubI { d, n, imm32, setflags } => {
            let (result, carry, overflow) = arm::add_with_carry(reg(&machine.arch, instr, n), !imm32, true);
            write_dest(&mut machine.arch, d, result);
            maybe_set_arith_flags(&mut machine.arch, d, setflags, result, carry, overflow);
        }
        Opcode::AddSpI { d, imm32 } => {
            let (result, _, _) = arm::add_with_carry(machine.arch.r[state::SP], imm32, false);
            write_dest(&mut machine.arch, d, result);
        }
        Opcode::SubSpI { imm32 } => {
            let (result, _, _) = arm::add_with_carry(machine.arch.r[state::SP], !imm32, true);
            machine.arch.r[state::SP] = result;
        }
        Opcode::CmpI { n, imm32 } => {
            let (result, carry, overflow) = arm::add_with_carry(reg(&machine.arch, instr, n), !imm32, true);
            set_nz(&mut machine.arch, result);
            machine.arch.c = carry;
            machine.arch.v = overflow;
        }
        Opcode::CmpR { n, m, shift_t, shift_n } => {
            let shifted = register_offset(&machine.arch, instr, m, shift_t, shift_n);
            let (result, carry, overflow) = arm::add_with_carry(reg(&machine.arch, instr, n), !shifted, true);
            set_nz(&mut machine.arch, result);
            machine.arch.c = carry;
            machine.arch.v = overflow;
        }
        Opcode::TstI { n, imm32, carry } => {
            let result = reg(&machine.arch, instr, n) & imm32;
            set_nz(&mut machine.arch, result);
            if let Some(c) = carry {
                machine.arch.c = c;
            }
        }

        Opcode::MovI { d, imm32, carry, setflags } => {
            write_dest(&mut machine.arch, d, imm32);
            maybe_set_logical_flags(&mut machine.arch, d, setflags, imm32, carry);
        }
        Opcode::MovR { d, m, setflags } => {
            let value = reg(&machine.arch, instr, m);
            write_dest(&mut machine.arch, d, value);
            // MOV (register), unlike the logical-immediate ops, never
            // touches C even when S=1.
            if setflags && d as usize != state::PC {
                set_nz(&mut machine.arch, value);
            }
        }
        Opcode::Movt { d, imm16 } => {
            machine.arch.r[d as usize] = (machine.arch.r[d as usize] & 0xFFFF) | ((imm16 as u32) << 16);
        }
        Opcode::AndI { d, n, imm32, carry, setflags } => {
            let result = reg(&machine.arch, instr, n) & imm32;
            write_dest(&mut machine.arch, d, result);
            maybe_set_logical_flags(&mut machine.arch, d, setflags, result, carry);
        }
        Opcode::EorI { d, n, imm32, carry, setflags } => {
            let result = reg(&machine.arch, instr, n) ^ imm32;
            write_dest(&mut machine.arch, d, result);
            maybe_set_logical_flags(&mut machine.arch, d, setflags, result, carry);
        }
        Opcode::OrrI { d, n, imm32, carry, setflags } => {
            let result = reg(&machine.arch, instr, n) | imm32;
            write_dest(&mut machine.arch, d, result);
            maybe_set_logical_flags(&mut machine.arch, d, setflags, result, carry);
        }
        Opcode::OrrR { d, n, m, shift_t, shift_n, setflags } => {
            let (shifted, carry_out) = arm::shift_c(reg(&machine.arch, instr, m), shift_t, shift_n, machine.arch.c);
            let result = reg(&machine.arch, instr, n) | shifted;
            write_dest(&mut machine.arch, d, result);
            maybe_set_logical_flags(&mut machine.arch, d, setflags, result, Some(carry_out));
        }
        Opcode::BicI { d, n, imm32, carry, setflags } => {
            let result = reg(&machine.arch, instr, n) & !imm32;
            write_dest(&mut machine.arch, d, result);
            maybe_set_logical_flags(&mut machine.arch, d, setflags, result, carry);
        }
        Opcode::MvnI { d, imm32, carry, setflags } => {
            let result = !imm32;
            write_dest(&mut machine.arch, d, result);
            maybe_set_logical_flags(&mut machine.arch, d, setflags, result, carry);
        }
        Opcode::Uxth { d, m, rotation } => {
            let rotated = reg(&machine.arch, instr, m).rotate_right(rotation as u32);
            machine.arch.r[d as usize] = rotated & 0xFFFF;
        }
        Opcode::Ubfx { d, n, lsbit, widthminus1 } => {
            let width = widthminus1 as u32 + 1;
            let value = reg(&machine.arch, instr, n) >> lsbit;
            let mask = if width >= 32 { u32::MAX } else { (1u32 << width) - 1 };
            machine.arch.r[d as usize] = value & mask;
        }

        Opcode::Push { registers } => {
            let count = registers.count_ones();
            let start = machine.arch.r[state::SP].wrapping_sub(4 * count);
            let mut addr = start;
            for i in 0..16u8 {
                if registers & (1 << i) != 0 {
                    let value = reg(&machine.arch, instr, i);
                    machine.mem.write_sized(addr, 4, value as u64)?;
                    addr += 4;
                }
            }
            machine.arch.r[state::SP] = start;
        }
        Opcode::Pop { registers } => {
            let mut addr = machine.arch.r[state::SP];
            for i in 0..16u8 {
                if registers & (1 << i) != 0 {
                    let value = machine.mem.read_sized(addr, 4)? as u32;
                    if i as usize == state::PC {
                        load_write_pc(&mut machine.arch, value);
                    } else {
                        machine.arch.r[i as usize] = value;
                    }
                    addr += 4;
                }
            }
            machine.arch.r[state::SP] = addr;
        }
        Opcode::Ldm { n, registers, wback } => {
            let mut addr = reg(&machine.arch, instr, n);
            for i in 0..16u8 {
                if registers & (1 << i) != 0 {
                    let value = machine.mem.read_sized(addr, 4)? as u32;
                    if i as usize == state::PC {
                        load_write_pc(&mut machine.arch, value);
                    } else {
                        machine.arch.r[i as usize] = value;
                    }
                    addr += 4;
                }
            }
            if wback {
                machine.arch.r[n as usize] = addr;
            }
        }
        Opcode::Stm { n, registers, wback } => {
            let mut addr = reg(&machine.arch, instr, n);
            for i in 0..16u8 {
                if registers & (1 << i) != 0 {
                    let value = reg(&machine.arch, instr, i);
                    machine.mem.write_sized(addr, 4, value as u64)?;
                    addr += 4;
                }
            }
            if wback {
                machine.arch.r[n as usize] = addr;
            }
        }

        Opcode::B { imm32 } => {
            let target = (pc_value(&machine.arch, instr) as i64 + imm32 as i64) as u32;
            let mask = if machine.arch.thumb { !1u32 } else { !3u32 };
            machine.arch.next_instruction = target & mask;
        }
        Opcode::Bl { imm32 } => {
            let target = (pc_value(&machine.arch, instr) as i64 + imm32 as i64) as u32;
            machine.arch.r[state::LR] = (instr.address + instr.length as u32) | machine.arch.thumb as u32;
            let mask = if machine.arch.thumb { !1u32 } else { !3u32 };
            machine.arch.next_instruction = target & mask;
        }
        Opcode::Blx { imm32, reg: reg_operand } => {
            machine.arch.r[state::LR] = (instr.address + instr.length as u32) | machine.arch.thumb as u32;
            match reg_operand {
                Some(rm) => {
                    let target = reg(&machine.arch, instr, rm);
                    load_write_pc(&mut machine.arch, target);
                }
                None => {
                    let base = pc_value(&machine.arch, instr) & !0b11;
                    let target = (base as i64 + imm32 as i64) as u32;
                    machine.arch.thumb = !machine.arch.thumb;
                    machine.arch.next_instruction = target & !0b1;
                }
            }
        }
        Opcode::Bx { m } => {
            let target = reg(&machine.arch, instr, m);
            load_write_pc(&mut machine.arch, target);
        }
        Opcode::Cbz { n, imm32, nonzero } => {
            let taken = if nonzero {
                reg(&machine.arch, instr, n) != 0
            } else {
                reg(&machine.arch, instr, n) == 0
            };
            if taken {
                let target = pc_value(&machine.arch, instr).wrapping_add(imm32);
                machine.arch.next_instruction = target;
            }
        }
        Opcode::It { firstcond, mask } => {
            machine.arch.itstate = (firstcond << 4) | mask;
        }

        Opcode::Mrc { opc1, t, crn, crm, opc2, .. } => {
            let value = machine.cp15.read(4, crn, opc1, crm, opc2);
            write_dest(&mut machine.arch, t, value);
        }

        Opcode::Svc { .. } => {
            let selector = machine.arch.r[12] as i32;
            match machine.syscalls.dispatch(selector) {
                Some(handler) => {
                    let result = handler(machine)?;
                    machine.arch.r[0] = result;
                }
                None => {
                    return Err(EmuError::UnimplementedStub {
                        name: format!("svc selector {selector}"),
                    })
                }
            }
        }
        Opcode::Bkpt { .. } => {
            let addr = instr.address;
            let (name, handler) = match machine.breakpoints.lookup(addr) {
                Some(bp) => (bp.name.clone(), bp.handler),
                None => {
                    return Err(EmuError::UnimplementedOpcode {
                        name: "BKPT (no trampoline registered)",
                        source_address: addr,
                    })
                }
            };
            match handler {
                Some(host_fn) => {
                    let result = host_fn(machine)?;
                    machine.arch.r[0] = result;
                    let lr = machine.arch.r[state::LR];
                    load_write_pc(&mut machine.arch, lr);
                }
                None => return Err(EmuError::UnimplementedStub { name }),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::Machine;

    #[test]
    fn mov_register_leaves_carry_untouched() {
        let mut machine = Machine::new();
        machine.arch.c = true;
        let instr = Instruction { condition: 0xE, address: 0, length: 2, op: Opcode::MovR { d: 0, m: 1, setflags: true } };
        machine.arch.r[1] = 0;
        execute(&mut machine, &instr).unwrap();
        assert!(machine.arch.z);
        assert!(machine.arch.c); // unchanged despite setflags
    }

    #[test]
    fn strd_writes_rt_and_rt2_to_distinct_words() {
        let mut machine = Machine::new();
        machine.mem.map(0x3000, 16);
        machine.arch.r[2] = 0x3000; // n
        machine.arch.r[3] = 0x1111_1111; // t
        machine.arch.r[4] = 0x2222_2222; // t2
        let instr = Instruction {
            condition: 0xE,
            address: 0,
            length: 4,
            op: Opcode::StrdI { t: 3, t2: 4, n: 2, imm32: 0, add: true, index: IndexMode::Offset },
        };
        execute(&mut machine, &instr).unwrap();
        assert_eq!(machine.mem.read_sized(0x3000, 4).unwrap(), 0x1111_1111);
        assert_eq!(machine.mem.read_sized(0x3004, 4).unwrap(), 0x2222_2222);
    }

    #[test]
    fn add_sets_flags_only_when_requested() {
        let mut machine = Machine::new();
        machine.arch.r[0] = 1;
        machine.arch.r[1] = 1;
        let instr = Instruction {
            condition: 0xE,
            address: 0,
            length: 4,
            op: Opcode::AddI { d: 2, n: 0, imm32: 0, setflags: false },
        };
        machine.arch.z = true;
        execute(&mut machine, &instr).unwrap();
        assert!(machine.arch.z); // untouched: setflags was false
    }
}
