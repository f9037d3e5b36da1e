//! Computation and branch conditions.
//!
//! Integer arithmetic wraps at 32 bits. Float opcodes reinterpret the
//! register bits as IEEE-754 single precision.

use glulx_core::{FatalError, Result};
use glulx_jit::{Calc, Cond};

use crate::io::IoCapability;
use crate::machine::Machine;

#[inline(always)]
fn f(bits: u32) -> f32 {
    f32::from_bits(bits)
}

#[inline(always)]
fn bits(value: f32) -> u32 {
    value.to_bits()
}

// =============================================================================
// Calc
// =============================================================================

/// Run `kind` over `L0..` into `S0` (and `S1`).
#[inline]
pub fn calc<I: IoCapability>(m: &mut Machine<I>, kind: Calc) -> Result<()> {
    let [a, b, ..] = m.regs.l;
    let result = match kind {
        Calc::Add => a.wrapping_add(b),
        Calc::Sub => a.wrapping_sub(b),
        Calc::Mul => a.wrapping_mul(b),
        Calc::Div => {
            if b == 0 {
                return Err(FatalError::DivisionByZero);
            }
            (a as i32).wrapping_div(b as i32) as u32
        }
        Calc::Mod => {
            if b == 0 {
                return Err(FatalError::DivisionByZero);
            }
            (a as i32).wrapping_rem(b as i32) as u32
        }
        Calc::Neg => a.wrapping_neg(),
        Calc::BitAnd => a & b,
        Calc::BitOr => a | b,
        Calc::BitXor => a ^ b,
        Calc::BitNot => !a,
        Calc::ShiftL => {
            if b >= 32 {
                0
            } else {
                a << b
            }
        }
        Calc::SShiftR => ((a as i32) >> b.min(31)) as u32,
        Calc::UShiftR => {
            if b >= 32 {
                0
            } else {
                a >> b
            }
        }
        Calc::Copy => a,
        Calc::Sexs => a as u16 as i16 as i32 as u32,
        Calc::Sexb => a as u8 as i8 as i32 as u32,

        Calc::Aload => m.mem.read32(a.wrapping_add(b.wrapping_mul(4)))?,
        Calc::Aloads => u32::from(m.mem.read16(a.wrapping_add(b.wrapping_mul(2)))?),
        Calc::Aloadb => u32::from(m.mem.read8(a.wrapping_add(b))?),
        Calc::Aloadbit => {
            let (addr, bit) = bit_address(a, b);
            u32::from((m.mem.read8(addr)? >> bit) & 1)
        }

        Calc::NumToF => bits(a as i32 as f32),
        Calc::FtoNumZ => float_to_int(f(a), f32::trunc),
        Calc::FtoNumN => float_to_int(f(a), f32::round),
        Calc::Ceil => bits(f(a).ceil()),
        Calc::Floor => bits(f(a).floor()),
        Calc::FAdd => bits(f(a) + f(b)),
        Calc::FSub => bits(f(a) - f(b)),
        Calc::FMul => bits(f(a) * f(b)),
        Calc::FDiv => bits(f(a) / f(b)),
        Calc::FMod => {
            let (remainder, quotient) = fmod(a, b);
            m.regs.s[1] = quotient;
            remainder
        }
        Calc::Sqrt => bits(f(a).sqrt()),
        Calc::Exp => bits(f(a).exp()),
        Calc::Log => bits(f(a).ln()),
        Calc::Pow => bits(pow(f(a), f(b))),
        Calc::Sin => bits(f(a).sin()),
        Calc::Cos => bits(f(a).cos()),
        Calc::Tan => bits(f(a).tan()),
        Calc::Asin => bits(f(a).asin()),
        Calc::Acos => bits(f(a).acos()),
        Calc::Atan => bits(f(a).atan()),
        Calc::Atan2 => bits(f(a).atan2(f(b))),
    };
    m.regs.s[0] = result;
    Ok(())
}

/// Byte address and bit index for `aloadbit`/`astorebit`; `bit` is signed.
#[inline]
pub fn bit_address(base: u32, bit: u32) -> (u32, u32) {
    let bit = bit as i32;
    (base.wrapping_add((bit >> 3) as u32), (bit & 7) as u32)
}

/// `ftonumz`/`ftonumn`: saturate out-of-range values, NaN by its sign.
fn float_to_int(value: f32, round: fn(f32) -> f32) -> u32 {
    if value.is_sign_negative() {
        if value.is_nan() || value.is_infinite() || value < -2_147_483_647.0 {
            0x8000_0000
        } else {
            round(value) as i32 as u32
        }
    } else if value.is_nan() || value.is_infinite() || value > 2_147_483_647.0 {
        0x7FFF_FFFF
    } else {
        round(value) as i32 as u32
    }
}

/// `fmod`: remainder, and the quotient with the sign of `a / b` even at zero.
fn fmod(a: u32, b: u32) -> (u32, u32) {
    let remainder = f(a) % f(b);
    let mut quotient = bits((f(a) - remainder) / f(b));
    if quotient == 0 || quotient == 0x8000_0000 {
        quotient = (a ^ b) & 0x8000_0000;
    }
    (bits(remainder), quotient)
}

/// `pow` with the C99 special cases pinned down.
fn pow(base: f32, exp: f32) -> f32 {
    if base == 1.0 || exp == 0.0 || (base == -1.0 && exp.is_infinite()) {
        1.0
    } else {
        base.powf(exp)
    }
}

// =============================================================================
// Conditions
// =============================================================================

/// Evaluate a branch condition over the load registers.
#[inline]
pub fn test(cond: Cond, l: &[u32]) -> bool {
    let (a, b) = (l[0], l[1]);
    match cond {
        Cond::Jz => a == 0,
        Cond::Jnz => a != 0,
        Cond::Jeq => a == b,
        Cond::Jne => a != b,
        Cond::Jlt => (a as i32) < (b as i32),
        Cond::Jge => (a as i32) >= (b as i32),
        Cond::Jgt => (a as i32) > (b as i32),
        Cond::Jle => (a as i32) <= (b as i32),
        Cond::Jltu => a < b,
        Cond::Jgeu => a >= b,
        Cond::Jgtu => a > b,
        Cond::Jleu => a <= b,
        Cond::Jfeq => float_eq(a, b, l[2]),
        Cond::Jfne => !float_eq(a, b, l[2]),
        Cond::Jflt => f(a) < f(b),
        Cond::Jfle => f(a) <= f(b),
        Cond::Jfgt => f(a) > f(b),
        Cond::Jfge => f(a) >= f(b),
        Cond::Jisnan => f(a).is_nan(),
        Cond::Jisinf => f(a).is_infinite(),
    }
}

/// `jfeq a b tolerance`.
fn float_eq(a: u32, b: u32, tolerance: u32) -> bool {
    if f(tolerance).is_nan() {
        return false;
    }
    if f(a).is_infinite() && f(b).is_infinite() {
        // Opposite infinities never match, whatever the tolerance.
        return a == b;
    }
    let delta = f(b) - f(a);
    let tolerance = f(tolerance).abs();
    delta <= tolerance && delta >= -tolerance
}

// =============================================================================
// Tests
// =============================================================================
