//! Peephole fusion of adjacent micro-ops.
//!
//! The optimizer remembers exactly one previously emitted op. When the next
//! op together with it matches a rule, the previous op is rewritten in place
//! into the fused form and nothing new is appended. The lookback is cleared
//! at every instruction boundary, so fusion never spans two bytecode
//! instructions and branch targets always land on an unfused op.
//!
//! Rules:
//!
//! | previous                 | next                        | fused              |
//! |--------------------------|-----------------------------|--------------------|
//! | `Calc(k)`                | `Store S0 -> d` (word)      | `CalcStore(k, d)`  |
//! | `Load L0 <- #a`          | `Load L1 <- #b`             | `LoadConst2(a, b)` |
//! | `Load L0 <- local a`     | `Load L1 <- local b`        | `LoadLocal2(a, b)` |
//! | `Load L0 <- s` (word)    | `Calc(Copy)`                | `Fetch(s)`         |
//! | `Fetch(s)`               | `Store S0 -> d` (word)      | `Move(s, d)`       |
//! | `LoadConst2(a, n)`       | `Call`                      | `CallKnown`        |
//! | `Load L0 <- #a`          | `CallArgs { argc: 0 }`      | `CallKnown`        |
//! | `Load L0 <- #v`          | `Return`                    | `ReturnConst(v)`   |
//! | `Load L0 <- local o`     | `Return`                    | `ReturnLocal(o)`   |
//! | `Load L2 <- #v`          | `Astore(w)`                 | `AstoreConst(w, v)`|

use crate::operand::{Src, Width};
use crate::ops::{Calc, Op};

/// One-op lookback optimizer.
#[derive(Debug, Clone)]
pub struct Peephole {
    enabled: bool,
    last: Option<usize>,
    fused: u64,
}

impl Peephole {
    pub fn new(enabled: bool) -> Self {
        Peephole {
            enabled,
            last: None,
            fused: 0,
        }
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Forget the lookback. Called at unit start and before every instruction.
    #[inline]
    pub fn reset(&mut self) {
        self.last = None;
    }

    /// Number of fusions performed so far.
    #[inline]
    pub fn fused(&self) -> u64 {
        self.fused
    }

    /// Append `op` to `code`, fusing it into the previous op when possible.
    ///
    /// Returns the index of the op that now holds `op`'s effect.
    pub fn emit(&mut self, code: &mut Vec<Op>, op: Op) -> usize {
        if self.enabled {
            if let Some(index) = self.last.filter(|&index| index + 1 == code.len()) {
                if let Some(fused) = fuse(code[index], op) {
                    code[index] = fused;
                    self.fused += 1;
                    return index;
                }
            }
        }
        code.push(op);
        let index = code.len() - 1;
        self.last = Some(index);
        index
    }
}

/// The fusion table.
pub fn fuse(prev: Op, next: Op) -> Option<Op> {
    use Width::Word;

    let fused = match (prev, next) {
        (Op::Calc(kind), Op::Store { reg: 0, dst, width: Word }) => Op::CalcStore(kind, dst),

        (
            Op::Load { reg: 0, src: Src::Const(a), width: Word },
            Op::Load { reg: 1, src: Src::Const(b), width: Word },
        ) => Op::LoadConst2(a, b),
        (
            Op::Load { reg: 0, src: Src::Local(a), width: Word },
            Op::Load { reg: 1, src: Src::Local(b), width: Word },
        ) => Op::LoadLocal2(a, b),

        (Op::Load { reg: 0, src, width: Word }, Op::Calc(Calc::Copy)) => Op::Fetch(src),
        (Op::Fetch(src), Op::Store { reg: 0, dst, width: Word }) => Op::Move(src, dst),

        (Op::LoadConst2(addr, argc), Op::Call { dst, next }) => Op::CallKnown {
            addr,
            argc,
            dst,
            next,
        },
        (
            Op::Load { reg: 0, src: Src::Const(addr), width: Word },
            Op::CallArgs { argc: 0, dst, next },
        ) => Op::CallKnown {
            addr,
            argc: 0,
            dst,
            next,
        },

        (Op::Load { reg: 0, src: Src::Const(value), width: Word }, Op::Return) => {
            Op::ReturnConst(value)
        }
        (Op::Load { reg: 0, src: Src::Local(offset), width: Word }, Op::Return) => {
            Op::ReturnLocal(offset)
        }

        (Op::Load { reg: 2, src: Src::Const(value), width: Word }, Op::Astore(width)) => {
            Op::AstoreConst(width, value)
        }

        _ => return None,
    };
    Some(fused)
}

// =============================================================================
// Tests
// =============================================================================
