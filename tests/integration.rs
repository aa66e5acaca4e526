/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! End-to-end tests driving [armvisor::machine::Machine] directly through
//! hand-assembled instruction streams, rather than through the CLI binary:
//! there's no app bundle or Objective-C runtime in this crate's world, so
//! the fixtures that matter are raw ARM/Thumb bytes and a loader-shaped
//! symbol/trampoline setup, not a compiled sample app.

use armvisor::error::EmuError;
use armvisor::machine::Machine;

/// `ADDS r2, r0, r1` with `r0=3, r1=2` sets `r2=5` and leaves every flag
/// clear (no carry, no overflow, not negative, not zero).
#[test]
fn adds_produces_expected_flags_for_ordinary_addition() {
    let mut machine = Machine::new();
    machine.mem.map(0x1000, 4096);
    // cond=AL(1110) 00 0 0100 1 Rn=0000 Rd=0010 00000000 Rm=0001
    let word: u32 = 0b1110_00_0_0100_1_0000_0010_00000000_0001;
    machine.mem.write_sized(0x1000, 4, word as u64).unwrap();
    machine.arch.r[0] = 3;
    machine.arch.r[1] = 2;
    machine.arch.next_instruction = 0x1000;

    machine.step().unwrap();

    assert_eq!(machine.arch.r[2], 5);
    assert!(!machine.arch.n);
    assert!(!machine.arch.z);
    assert!(!machine.arch.c);
    assert!(!machine.arch.v);
}

/// `ADDS r2, r0, r1` with `r0=0xFFFFFFFF, r1=1` wraps to zero and sets both
/// the zero and carry flags, with no overflow (unsigned wraparound, not a
/// signed one).
#[test]
fn adds_sets_carry_and_zero_on_unsigned_wraparound() {
    let mut machine = Machine::new();
    machine.mem.map(0x1000, 4096);
    let word: u32 = 0b1110_00_0_0100_1_0000_0010_00000000_0001;
    machine.mem.write_sized(0x1000, 4, word as u64).unwrap();
    machine.arch.r[0] = 0xFFFF_FFFF;
    machine.arch.r[1] = 1;
    machine.arch.next_instruction = 0x1000;

    machine.step().unwrap();

    assert_eq!(machine.arch.r[2], 0);
    assert!(!machine.arch.n);
    assert!(machine.arch.z);
    assert!(machine.arch.c);
    assert!(!machine.arch.v);
}

/// `ITE EQ` followed by `MOVS r0,#1` (then-clause) and `MOVS r0,#2`
/// (else-clause): with `Z` set only the first move runs, with `Z` clear
/// only the second does, and `itstate` is clear again once both slots have
/// been stepped past.
fn run_it_block(z: bool) -> u32 {
    let mut machine = Machine::new();
    machine.mem.map(0x2000, 4096);
    machine.arch.thumb = true;
    machine.arch.z = z;
    // ITE EQ: firstcond=EQ(0000), mask=1100 -> 1011_1111_0000_1100 = 0xBF0C.
    machine.mem.write_sized(0x2000, 2, 0xBF0C).unwrap();
    // MOVS r0,#1 (then, under EQ)
    machine.mem.write_sized(0x2002, 2, 0x2001).unwrap();
    // MOVS r0,#2 (else, under NE)
    machine.mem.write_sized(0x2004, 2, 0x2002).unwrap();
    machine.arch.next_instruction = 0x2000;

    for _ in 0..3 {
        machine.step().unwrap();
    }
    assert_eq!(machine.arch.itstate, 0);
    machine.arch.r[0]
}

#[test]
fn it_block_runs_then_clause_when_condition_holds() {
    assert_eq!(run_it_block(true), 1);
}

#[test]
fn it_block_runs_else_clause_when_condition_fails() {
    assert_eq!(run_it_block(false), 2);
}

/// `STR r0,[r1]` then `LDR r2,[r1]` round-trips a value through guest memory
/// in little-endian order, matching the host's own byte order.
#[test]
fn store_then_load_round_trips_little_endian() {
    let mut machine = Machine::new();
    machine.mem.map(0x1000, 4096);
    machine.mem.map(0x2000, 4096);
    // STR r0, [r1]: cond=AL 01 I=0 P=1 U=1 B=0 W=0 L=0 Rn=0001 Rt=0000 imm12=0
    let str_word: u32 = 0b1110_01_0_1_1_0_0_0_0001_0000_000000000000;
    // LDR r2, [r1]: same addressing mode, L=1, Rt=0010
    let ldr_word: u32 = 0b1110_01_0_1_1_0_0_1_0001_0010_000000000000;
    machine.mem.write_sized(0x2000, 4, str_word as u64).unwrap();
    machine.mem.write_sized(0x2004, 4, ldr_word as u64).unwrap();
    machine.arch.r[0] = 0xCAFEBABE;
    machine.arch.r[1] = 0x1000;
    machine.arch.next_instruction = 0x2000;

    machine.step().unwrap();
    assert_eq!(machine.mem.read_sized(0x1000, 1).unwrap(), 0xBE);

    machine.step().unwrap();
    assert_eq!(machine.arch.r[2], 0xCAFEBABE);
}

fn foo_stub(_machine: &mut Machine) -> Result<u32, EmuError> {
    Ok(0x42)
}

/// A `BL` into a trampoline slot traps on the breakpoint encoding the
/// loader would have written there, runs the registered host stub, and
/// resumes at the instruction after the `BL` with the stub's return value
/// in `r0` — the same mechanism [armvisor::dyld::load_main] relies on for
/// every symbol it can't resolve to real guest code.
#[test]
fn bl_into_trampoline_runs_host_stub_and_resumes_after_call() {
    let mut machine = Machine::new();
    let trampoline = machine
        .breakpoints
        .allocate(&mut machine.mem, "foo", Some(foo_stub))
        .unwrap();

    let call_site: u32 = 0x9fe0_0000;
    machine.mem.map(call_site, 4096);
    let pc_value = call_site + 8;
    let imm32 = trampoline.wrapping_sub(pc_value);
    assert_eq!(imm32 % 4, 0);
    let imm24 = imm32 >> 2;
    let bl_word: u32 = 0xEB00_0000 | (imm24 & 0x00FF_FFFF);
    machine.mem.write_sized(call_site, 4, bl_word as u64).unwrap();

    machine.arch.r[0] = 0;
    machine.arch.next_instruction = call_site;

    machine.step().unwrap(); // BL foo
    assert_eq!(machine.arch.next_instruction, trampoline);
    assert_eq!(machine.arch.r[14], call_site + 4);

    machine.step().unwrap(); // BKPT traps, stub runs, LR reloaded
    assert_eq!(machine.arch.r[0], 0x42);
    assert_eq!(machine.arch.next_instruction, call_site + 4);
}
