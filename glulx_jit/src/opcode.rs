//! Glulx opcode numbers and operand signatures.

use crate::operand::OperandKind::{self, Load as L, Store as S};

pub const NOP: u32 = 0x00;

pub const ADD: u32 = 0x10;
pub const SUB: u32 = 0x11;
pub const MUL: u32 = 0x12;
pub const DIV: u32 = 0x13;
pub const MOD: u32 = 0x14;
pub const NEG: u32 = 0x15;
pub const BITAND: u32 = 0x18;
pub const BITOR: u32 = 0x19;
pub const BITXOR: u32 = 0x1A;
pub const BITNOT: u32 = 0x1B;
pub const SHIFTL: u32 = 0x1C;
pub const SSHIFTR: u32 = 0x1D;
pub const USHIFTR: u32 = 0x1E;

pub const JUMP: u32 = 0x20;
pub const JZ: u32 = 0x22;
pub const JNZ: u32 = 0x23;
pub const JEQ: u32 = 0x24;
pub const JNE: u32 = 0x25;
pub const JLT: u32 = 0x26;
pub const JGE: u32 = 0x27;
pub const JGT: u32 = 0x28;
pub const JLE: u32 = 0x29;
pub const JLTU: u32 = 0x2A;
pub const JGEU: u32 = 0x2B;
pub const JGTU: u32 = 0x2C;
pub const JLEU: u32 = 0x2D;

pub const CALL: u32 = 0x30;
pub const RETURN: u32 = 0x31;
pub const CATCH: u32 = 0x32;
pub const THROW: u32 = 0x33;
pub const TAILCALL: u32 = 0x34;

pub const COPY: u32 = 0x40;
pub const COPYS: u32 = 0x41;
pub const COPYB: u32 = 0x42;
pub const SEXS: u32 = 0x44;
pub const SEXB: u32 = 0x45;
pub const ALOAD: u32 = 0x48;
pub const ALOADS: u32 = 0x49;
pub const ALOADB: u32 = 0x4A;
pub const ALOADBIT: u32 = 0x4B;
pub const ASTORE: u32 = 0x4C;
pub const ASTORES: u32 = 0x4D;
pub const ASTOREB: u32 = 0x4E;
pub const ASTOREBIT: u32 = 0x4F;

pub const STKCOUNT: u32 = 0x50;
pub const STKPEEK: u32 = 0x51;
pub const STKSWAP: u32 = 0x52;
pub const STKROLL: u32 = 0x53;
pub const STKCOPY: u32 = 0x54;

pub const STREAMCHAR: u32 = 0x70;
pub const STREAMNUM: u32 = 0x71;
pub const STREAMSTR: u32 = 0x72;
pub const STREAMUNICHAR: u32 = 0x73;

pub const GESTALT: u32 = 0x100;
pub const DEBUGTRAP: u32 = 0x101;
pub const GETMEMSIZE: u32 = 0x102;
pub const SETMEMSIZE: u32 = 0x103;
pub const JUMPABS: u32 = 0x104;

pub const RANDOM: u32 = 0x110;
pub const SETRANDOM: u32 = 0x111;

pub const QUIT: u32 = 0x120;
pub const VERIFY: u32 = 0x121;
pub const RESTART: u32 = 0x122;
pub const SAVE: u32 = 0x123;
pub const RESTORE: u32 = 0x124;
pub const SAVEUNDO: u32 = 0x125;
pub const RESTOREUNDO: u32 = 0x126;
pub const PROTECT: u32 = 0x127;
pub const HASUNDO: u32 = 0x128;
pub const DISCARDUNDO: u32 = 0x129;

pub const GLK: u32 = 0x130;

pub const GETSTRINGTBL: u32 = 0x140;
pub const SETSTRINGTBL: u32 = 0x141;
pub const GETIOSYS: u32 = 0x148;
pub const SETIOSYS: u32 = 0x149;

pub const LINEARSEARCH: u32 = 0x150;
pub const BINARYSEARCH: u32 = 0x151;
pub const LINKEDSEARCH: u32 = 0x152;

pub const CALLF: u32 = 0x160;
pub const CALLFI: u32 = 0x161;
pub const CALLFII: u32 = 0x162;
pub const CALLFIII: u32 = 0x163;

pub const MZERO: u32 = 0x170;
pub const MCOPY: u32 = 0x171;
pub const MALLOC: u32 = 0x178;
pub const MFREE: u32 = 0x179;

pub const ACCELFUNC: u32 = 0x180;
pub const ACCELPARAM: u32 = 0x181;

pub const NUMTOF: u32 = 0x190;
pub const FTONUMZ: u32 = 0x191;
pub const FTONUMN: u32 = 0x192;
pub const CEIL: u32 = 0x198;
pub const FLOOR: u32 = 0x199;
pub const FADD: u32 = 0x1A0;
pub const FSUB: u32 = 0x1A1;
pub const FMUL: u32 = 0x1A2;
pub const FDIV: u32 = 0x1A3;
pub const FMOD: u32 = 0x1A4;
pub const SQRT: u32 = 0x1A8;
pub const EXP: u32 = 0x1A9;
pub const LOG: u32 = 0x1AA;
pub const POW: u32 = 0x1AB;
pub const SIN: u32 = 0x1B0;
pub const COS: u32 = 0x1B1;
pub const TAN: u32 = 0x1B2;
pub const ASIN: u32 = 0x1B3;
pub const ACOS: u32 = 0x1B4;
pub const ATAN: u32 = 0x1B5;
pub const ATAN2: u32 = 0x1B6;
pub const JFEQ: u32 = 0x1C0;
pub const JFNE: u32 = 0x1C1;
pub const JFLT: u32 = 0x1C2;
pub const JFLE: u32 = 0x1C3;
pub const JFGT: u32 = 0x1C4;
pub const JFGE: u32 = 0x1C5;
pub const JISNAN: u32 = 0x1C8;
pub const JISINF: u32 = 0x1C9;

/// Operand list of `opcode`, or `None` when the opcode is not supported.
pub fn signature(opcode: u32) -> Option<&'static [OperandKind]> {
    let sig: &'static [OperandKind] = match opcode {
        NOP | STKSWAP | QUIT | RESTART | DISCARDUNDO => &[],

        ADD | SUB | MUL | DIV | MOD | BITAND | BITOR | BITXOR | SHIFTL | SSHIFTR | USHIFTR => {
            &[L, L, S]
        }
        NEG | BITNOT | COPY | COPYS | COPYB | SEXS | SEXB => &[L, S],

        JUMP | RETURN | STKCOPY | DEBUGTRAP | JUMPABS | SETRANDOM | SETSTRINGTBL | MFREE => &[L],
        STREAMCHAR | STREAMNUM | STREAMSTR | STREAMUNICHAR => &[L],
        JZ | JNZ | THROW | TAILCALL | STKROLL | PROTECT | SETIOSYS | MZERO => &[L, L],
        ACCELFUNC | ACCELPARAM | JISNAN | JISINF => &[L, L],
        JEQ | JNE | JLT | JGE | JGT | JLE | JLTU | JGEU | JGTU | JLEU => &[L, L, L],
        ASTORE | ASTORES | ASTOREB | ASTOREBIT | MCOPY => &[L, L, L],
        JFLT | JFLE | JFGT | JFGE => &[L, L, L],
        JFEQ | JFNE => &[L, L, L, L],

        CALL | ALOAD | ALOADS | ALOADB | ALOADBIT | GESTALT | GLK => &[L, L, S],
        CATCH => &[S, L],
        CALLF => &[L, S],
        CALLFI => &[L, L, S],
        CALLFII => &[L, L, L, S],
        CALLFIII => &[L, L, L, L, S],

        STKCOUNT | GETMEMSIZE | VERIFY | SAVEUNDO | RESTOREUNDO | HASUNDO | GETSTRINGTBL => &[S],
        STKPEEK | SETMEMSIZE | RANDOM | SAVE | RESTORE | MALLOC => &[L, S],
        GETIOSYS => &[S, S],

        LINEARSEARCH | BINARYSEARCH => &[L, L, L, L, L, L, L, S],
        LINKEDSEARCH => &[L, L, L, L, L, L, S],

        NUMTOF | FTONUMZ | FTONUMN | CEIL | FLOOR | SQRT | EXP | LOG => &[L, S],
        SIN | COS | TAN | ASIN | ACOS | ATAN => &[L, S],
        FADD | FSUB | FMUL | FDIV | POW | ATAN2 => &[L, L, S],
        FMOD => &[L, L, S, S],

        _ => return None,
    };
    Some(sig)
}

/// Mnemonic for diagnostics.
pub fn name(opcode: u32) -> &'static str {
    match opcode {
        NOP => "nop",
        ADD => "add",
        SUB => "sub",
        MUL => "mul",
        DIV => "div",
        MOD => "mod",
        JUMP => "jump",
        CALL => "call",
        RETURN => "return",
        CATCH => "catch",
        THROW => "throw",
        TAILCALL => "tailcall",
        COPY => "copy",
        STREAMCHAR => "streamchar",
        STREAMNUM => "streamnum",
        STREAMSTR => "streamstr",
        STREAMUNICHAR => "streamunichar",
        GLK => "glk",
        QUIT => "quit",
        RESTART => "restart",
        SAVE => "save",
        RESTORE => "restore",
        SAVEUNDO => "saveundo",
        RESTOREUNDO => "restoreundo",
        CALLF..=CALLFIII => "callf",
        _ => "?",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signatures() {
        assert_eq!(signature(ADD).unwrap().len(), 3);
        assert_eq!(signature(CATCH).unwrap(), &[S, L]);
        assert_eq!(signature(LINEARSEARCH).unwrap().len(), 8);
        assert_eq!(signature(FMOD).unwrap(), &[L, L, S, S]);
        assert!(signature(0x16).is_none());
        // Double-precision opcodes are not supported.
        assert!(signature(0x200).is_none());
    }
}
