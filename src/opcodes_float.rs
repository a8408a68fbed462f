//! Single-precision float opcodes.
//!
//! Floats travel through the VM as their IEEE-754 bit patterns in
//! 32-bit words; every handler converts explicitly with `from_bits` and
//! `to_bits`. Arithmetic follows IEEE quiet-NaN semantics.

use crate::error::{Result, TerpError};
use crate::instruction::DestKind;
use crate::interpreter::Interpreter;

const SIGN_BIT: u32 = 0x8000_0000;

impl Interpreter {
    pub(crate) fn exec_float(&mut self, num: u32, l: &[u32], d: &[DestKind]) -> Result<()> {
        match num {
            // numtof
            0x190 => self.perform_store(d[0], (l[0] as i32 as f32).to_bits()),
            // ftonumz / ftonumn
            0x191 => self.perform_store(d[0], float_to_int(f32::from_bits(l[0]), true)),
            0x192 => self.perform_store(d[0], float_to_int(f32::from_bits(l[0]), false)),
            // ceil / floor
            0x198 => self.perform_store(d[0], f32::from_bits(l[0]).ceil().to_bits()),
            0x199 => self.perform_store(d[0], f32::from_bits(l[0]).floor().to_bits()),
            // arithmetic
            0x1A0 => self.binop(l, d, |x, y| x + y),
            0x1A1 => self.binop(l, d, |x, y| x - y),
            0x1A2 => self.binop(l, d, |x, y| x * y),
            0x1A3 => self.binop(l, d, |x, y| x / y),
            // fmod: remainder and integer-valued quotient
            0x1A4 => {
                let x = f32::from_bits(l[0]);
                let y = f32::from_bits(l[1]);
                let rem = x % y;
                let quo = (x - rem) / y;
                let mut quo_bits = quo.to_bits();
                if quo_bits & !SIGN_BIT == 0 {
                    // A zero quotient keeps the sign the division would
                    // have had.
                    quo_bits = (l[0] ^ l[1]) & SIGN_BIT;
                }
                self.perform_store(d[0], rem.to_bits())?;
                self.perform_store(d[1], quo_bits)
            }
            // sqrt / exp / log
            0x1A8 => self.unop(l, d, f32::sqrt),
            0x1A9 => self.unop(l, d, f32::exp),
            0x1AA => self.unop(l, d, f32::ln),
            // pow
            0x1AB => self.binop(l, d, f32::powf),
            // trig
            0x1B0 => self.unop(l, d, f32::sin),
            0x1B1 => self.unop(l, d, f32::cos),
            0x1B2 => self.unop(l, d, f32::tan),
            0x1B3 => self.unop(l, d, f32::asin),
            0x1B4 => self.unop(l, d, f32::acos),
            0x1B5 => self.unop(l, d, f32::atan),
            0x1B6 => self.binop(l, d, f32::atan2),
            // jfeq a b tolerance target
            0x1C0 => {
                if float_eq(l[0], l[1], l[2]) {
                    self.take_branch(l[3])
                } else {
                    Ok(())
                }
            }
            0x1C1 => {
                if !float_eq(l[0], l[1], l[2]) {
                    self.take_branch(l[3])
                } else {
                    Ok(())
                }
            }
            // ordered compares: NaN never branches
            0x1C2 => self.float_branch(l, |x, y| x < y),
            0x1C3 => self.float_branch(l, |x, y| x <= y),
            0x1C4 => self.float_branch(l, |x, y| x > y),
            0x1C5 => self.float_branch(l, |x, y| x >= y),
            // jisnan / jisinf
            0x1C8 => {
                if f32::from_bits(l[0]).is_nan() {
                    self.take_branch(l[1])
                } else {
                    Ok(())
                }
            }
            0x1C9 => {
                if f32::from_bits(l[0]).is_infinite() {
                    self.take_branch(l[1])
                } else {
                    Ok(())
                }
            }
            _ => Err(TerpError::fault(format!("opcode {num:#x} has no handler"))),
        }
    }

    fn unop(&mut self, l: &[u32], d: &[DestKind], f: impl Fn(f32) -> f32) -> Result<()> {
        self.perform_store(d[0], f(f32::from_bits(l[0])).to_bits())
    }

    fn binop(&mut self, l: &[u32], d: &[DestKind], f: impl Fn(f32, f32) -> f32) -> Result<()> {
        self.perform_store(d[0], f(f32::from_bits(l[0]), f32::from_bits(l[1])).to_bits())
    }

    fn float_branch(&mut self, l: &[u32], cmp: impl Fn(f32, f32) -> bool) -> Result<()> {
        if cmp(f32::from_bits(l[0]), f32::from_bits(l[1])) {
            self.take_branch(l[2])
        } else {
            Ok(())
        }
    }
}

/// Truncating or rounding float-to-int with the Glulx clamp values.
fn float_to_int(value: f32, truncate: bool) -> u32 {
    if value.is_nan() {
        return if value.is_sign_negative() {
            0x8000_0000
        } else {
            0x7FFF_FFFF
        };
    }
    let rounded = if truncate { value.trunc() } else { value.round() };
    if rounded >= 2147483648.0 {
        0x7FFF_FFFF
    } else if rounded < -2147483648.0 {
        0x8000_0000
    } else {
        rounded as i32 as u32
    }
}

/// Tolerance equality. A NaN anywhere is unequal; an infinite tolerance
/// makes everything equal; two infinities are equal when their signs
/// match.
fn float_eq(a_bits: u32, b_bits: u32, tol_bits: u32) -> bool {
    let a = f32::from_bits(a_bits);
    let b = f32::from_bits(b_bits);
    let tol = f32::from_bits(tol_bits);
    if a.is_nan() || b.is_nan() || tol.is_nan() {
        return false;
    }
    if tol.is_infinite() {
        return true;
    }
    if a.is_infinite() || b.is_infinite() {
        return a_bits == b_bits;
    }
    (a - b).abs() <= tol.abs()
}
