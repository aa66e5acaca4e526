/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Bit-exact arithmetic and shift helpers from the ARM Architecture Reference
//! Manual, shared between [crate::decoder] (which uses the shift/immediate
//! helpers to normalize operands) and [crate::executor] (which uses the
//! arithmetic helpers to apply opcode semantics).

/// One of the five shift types a register operand can carry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ShiftType {
    Lsl,
    Lsr,
    Asr,
    Ror,
    Rrx,
}

/// `DecodeImmShift` from the ARM ARM: normalizes a `(type, imm5)` encoding
/// pair into a shift type and amount, folding in the `imm5==0` special cases.
pub fn decode_imm_shift(type_bits: u8, imm5: u8) -> (ShiftType, u8) {
    match type_bits & 0b11 {
        0b00 => (ShiftType::Lsl, imm5),
        0b01 => (ShiftType::Lsr, if imm5 == 0 { 32 } else { imm5 }),
        0b10 => (ShiftType::Asr, if imm5 == 0 { 32 } else { imm5 }),
        0b11 => {
            if imm5 == 0 {
                (ShiftType::Rrx, 1)
            } else {
                (ShiftType::Ror, imm5)
            }
        }
        _ => unreachable!(),
    }
}

pub fn sign_extend(value: u32, from_bits: u32) -> i32 {
    let shift = 32 - from_bits;
    ((value << shift) as i32) >> shift
}

/// `AddWithCarry` from the ARM ARM: a 33-bit unsigned and 33-bit signed
/// addition, returning `(result, carry_out, overflow)`.
pub fn add_with_carry(x: u32, y: u32, carry_in: bool) -> (u32, bool, bool) {
    let unsigned_sum = x as u64 + y as u64 + carry_in as u64;
    let signed_sum = x as i32 as i64 + y as i32 as i64 + carry_in as i64;
    let result = unsigned_sum as u32;
    let carry_out = unsigned_sum >> 32 != 0;
    let overflow = (result as i32) as i64 != signed_sum;
    (result, carry_out, overflow)
}

fn ror(value: u32, amount: u8) -> u32 {
    let amount = (amount % 32) as u32;
    if amount == 0 {
        value
    } else {
        value.rotate_right(amount)
    }
}

/// `Shift_C` from the ARM ARM. `shift == 0` passes `carry_in` straight
/// through for every shift type except `RRX`, which always shifts by 1.
pub fn shift_c(value: u32, shift_t: ShiftType, shift_n: u8, carry_in: bool) -> (u32, bool) {
    if shift_n == 0 && shift_t != ShiftType::Rrx {
        return (value, carry_in);
    }
    match shift_t {
        ShiftType::Lsl => {
            if shift_n >= 32 {
                (0, if shift_n == 32 { value & 1 != 0 } else { false })
            } else {
                let result = value << shift_n;
                let carry_out = (value >> (32 - shift_n)) & 1 != 0;
                (result, carry_out)
            }
        }
        ShiftType::Lsr => {
            if shift_n >= 32 {
                (0, if shift_n == 32 { (value >> 31) & 1 != 0 } else { false })
            } else {
                let result = value >> shift_n;
                let carry_out = (value >> (shift_n - 1)) & 1 != 0;
                (result, carry_out)
            }
        }
        ShiftType::Asr => {
            let n = shift_n.min(32);
            let result = ((value as i32) >> (n.min(31))) as u32;
            let result = if n >= 32 {
                if (value as i32) < 0 {
                    0xFFFF_FFFF
                } else {
                    0
                }
            } else {
                result
            };
            let carry_out = if n == 0 {
                carry_in
            } else if n >= 32 {
                (value >> 31) & 1 != 0
            } else {
                (value >> (n - 1)) & 1 != 0
            };
            (result, carry_out)
        }
        ShiftType::Ror => {
            let result = ror(value, shift_n);
            let carry_out = (result >> 31) & 1 != 0;
            (result, carry_out)
        }
        ShiftType::Rrx => {
            let result = (value >> 1) | ((carry_in as u32) << 31);
            let carry_out = value & 1 != 0;
            (result, carry_out)
        }
    }
}

/// `Shift` from the ARM ARM: [shift_c] without the carry-out.
pub fn shift(value: u32, shift_t: ShiftType, shift_n: u8, carry_in: bool) -> u32 {
    shift_c(value, shift_t, shift_n, carry_in).0
}

/// `ARMExpandImm_C`: expands a 12-bit modified immediate (4-bit rotation,
/// 8-bit base) used by ARM data-processing-immediate encodings.
pub fn arm_expand_imm_c(imm12: u16, carry_in: bool) -> (u32, bool) {
    let unrotated = (imm12 & 0xff) as u32;
    let rotation = ((imm12 >> 8) & 0xf) as u8 * 2;
    if rotation == 0 {
        (unrotated, carry_in)
    } else {
        shift_c(unrotated, ShiftType::Ror, rotation, carry_in)
    }
}

/// `ThumbExpandImm_C`: expands the 12-bit Thumb-2 modified immediate (`i:imm3:imm8`).
///
/// `imm32` never depends on `carry_in`; only `carry_out` does, and only in
/// the rotated-constant case.
pub fn thumb_expand_imm_c(i: u8, imm3: u8, imm8: u8, carry_in: bool) -> (u32, bool) {
    let prefix = (i << 3) | imm3; // 4-bit control field, `i:imm3`
    if prefix >> 2 == 0 {
        // control field `00` in the top two bits: one of four fixed patterns
        let imm32 = match prefix & 0b11 {
            0b00 => imm8 as u32,
            0b01 => (imm8 as u32) << 16 | imm8 as u32,
            0b10 => (imm8 as u32) << 24 | (imm8 as u32) << 8,
            0b11 => {
                (imm8 as u32) << 24 | (imm8 as u32) << 16 | (imm8 as u32) << 8 | imm8 as u32
            }
            _ => unreachable!(),
        };
        (imm32, carry_in)
    } else {
        let unrotated = 0x80 | (imm8 as u32 & 0x7f);
        let rotation = prefix; // 1..=31, full 5-bit rotate amount
        shift_c(unrotated, ShiftType::Ror, rotation, carry_in)
    }
}

/// The 16 ARM condition codes (`condition_passed` from the ARM ARM), tested
/// against the architectural `N,Z,C,V` flags. Condition `0b1110`/`0b1111` are
/// unconditional (always true) and never reach this function from the
/// executor's `condition_passed` call site, but are handled here too for
/// completeness.
pub fn condition_passed(condition: u8, n: bool, z: bool, c: bool, v: bool) -> bool {
    match condition & 0xf {
        0x0 => z,                    // EQ
        0x1 => !z,                   // NE
        0x2 => c,                    // CS/HS
        0x3 => !c,                   // CC/LO
        0x4 => n,                    // MI
        0x5 => !n,                   // PL
        0x6 => v,                    // VS
        0x7 => !v,                   // VC
        0x8 => c && !z,              // HI
        0x9 => !c || z,              // LS
        0xA => n == v,               // GE
        0xB => n != v,               // LT
        0xC => !z && (n == v),       // GT
        0xD => z || (n != v),        // LE
        0xE | 0xF => true,           // AL
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_with_carry_matches_cmp() {
        // AddWithCarry(x, ~y, 1) == (x-y, carry, overflow), the identity CMP/SUBS rely on.
        let (result, carry, overflow) = add_with_carry(5, !2u32, true);
        assert_eq!(result, 3);
        assert!(carry);
        assert!(!overflow);
    }

    #[test]
    fn add_with_carry_detects_unsigned_overflow() {
        let (result, carry, overflow) = add_with_carry(0xFFFF_FFFF, 1, false);
        assert_eq!(result, 0);
        assert!(carry);
        assert!(!overflow);
    }

    #[test]
    fn thumb_expand_imm_is_carry_invariant() {
        let (imm_a, _) = thumb_expand_imm_c(1, 0b011, 0b1010_0101, true);
        let (imm_b, _) = thumb_expand_imm_c(1, 0b011, 0b1010_0101, false);
        assert_eq!(imm_a, imm_b);
    }

    #[test]
    fn decode_imm_shift_handles_rrx() {
        assert_eq!(decode_imm_shift(0b11, 0), (ShiftType::Rrx, 1));
        assert_eq!(decode_imm_shift(0b11, 4), (ShiftType::Ror, 4));
        assert_eq!(decode_imm_shift(0b01, 0), (ShiftType::Lsr, 32));
    }

    #[test]
    fn condition_codes_match_arm_arm() {
        assert!(condition_passed(0x0, false, true, false, false)); // EQ, Z=1
        assert!(!condition_passed(0x4, false, false, false, false)); // MI, N=0
        assert!(condition_passed(0x5, false, false, false, false)); // PL, N=0
        assert!(condition_passed(0x8, true, false, false, false)); // HI, C=1,Z=0
        assert!(!condition_passed(0x8, true, true, false, false)); // HI fails if Z=1
    }
}
