//! Output under the three I/O systems, including string decoding and
//! filter functions that re-enter the print loop.

mod common;

use common::*;
use glulx_core::asm::{ImageBuilder, Label};
use glulx_vm::Termination;

/// Decoding table used by the compressed-string tests.
///
/// | code   | leaf                                   |
/// |--------|----------------------------------------|
/// | `0`    | `'a'`                                  |
/// | `10`   | end of string                          |
/// | `110`  | indirect reference to the C string XY |
/// | `1110` | U+263A                                 |
/// | `1111` | call `func` with the argument 5        |
///
/// Codes are read LSB first from each byte.
fn decoding_table(asm: &mut ImageBuilder, func: Label) -> Label {
    let xy = asm.c_string("XY");
    let [root, leaf_a, node2, end, node3, nested, node4, uni, call] =
        [(); 9].map(|_| asm.new_label());

    let table = asm.here();
    asm.word(0).word(9).word_addr(root);
    asm.bind(root);
    asm.byte(0x00).word_addr(leaf_a).word_addr(node2);
    asm.bind(leaf_a);
    asm.byte(0x02).byte(b'a');
    asm.bind(node2);
    asm.byte(0x00).word_addr(end).word_addr(node3);
    asm.bind(end);
    asm.byte(0x01);
    asm.bind(node3);
    asm.byte(0x00).word_addr(nested).word_addr(node4);
    asm.bind(nested);
    asm.byte(0x08).word_addr(xy);
    asm.bind(node4);
    asm.byte(0x00).word_addr(uni).word_addr(call);
    asm.bind(uni);
    asm.byte(0x04).word(0x263A);
    asm.bind(call);
    asm.byte(0x0A).word_addr(func).word(1).word(5);
    table
}

/// "aaXYa": a, a, nested, a, end.
const NESTED: &[u8] = &[0xE1, 0b0100_1100];
/// "a5☺": a, call, U+263A, end.
const CALL_AND_UNICODE: &[u8] = &[0xE1, 0xFE, 0x02];

/// Print every kind of output; returns the text and the filter call count.
fn print_all(filter: bool) -> (String, u32) {
    let mut asm = ImageBuilder::new();
    let buffer = asm.ram_zeroed(128);
    let count = asm.ram_zeroed(4);

    let print_num = asm.func_locals(1);
    asm.op(STREAMNUM, &[A::Local(0)]);
    asm.op(RETURN, &[A::Imm(0)]);

    // The filter appends each character to `buffer` and counts it.
    let collect = asm.func_locals(1);
    asm.op(ASTORE, &[A::AddrOf(buffer), A::At(count), A::Local(0)]);
    asm.op(ADD, &[A::At(count), A::Imm(1), A::At(count)]);
    asm.op(RETURN, &[A::Imm(0)]);

    let table = decoding_table(&mut asm, print_num);
    asm.string_table(table);
    let hello = asm.c_string("hi ");
    let wide = asm.unicode_string("é!");
    let nested = asm.here();
    asm.bytes(NESTED);
    let call = asm.here();
    asm.bytes(CALL_AND_UNICODE);

    let main = asm.func_locals(0);
    if filter {
        asm.op(SETIOSYS, &[A::Imm(1), A::AddrOf(collect)]);
    } else {
        direct_output(&mut asm);
    }
    asm.op(STREAMSTR, &[A::AddrOf(hello)]);
    asm.op(STREAMNUM, &[A::Imm(-12)]);
    asm.op(STREAMCHAR, &[A::Imm(b'z' as i32)]);
    asm.op(STREAMUNICHAR, &[A::Imm(0x3A9)]);
    asm.op(STREAMSTR, &[A::AddrOf(wide)]);
    asm.op(STREAMSTR, &[A::AddrOf(nested)]);
    asm.op(STREAMSTR, &[A::AddrOf(call)]);
    asm.op(RETURN, &[A::At(count)]);

    let (mut machine, done) = run(asm, main);
    let Termination::Returned(count) = done else {
        panic!("unexpected termination {:?}", done);
    };

    if filter {
        let base = machine.memory().ram_start();
        let text = (0..count)
            .map(|i| machine.memory().read32(base + 4 * i).unwrap())
            .map(|ch| char::from_u32(ch).unwrap())
            .collect();
        (text, count)
    } else {
        (machine.io_mut().take_output(), count)
    }
}

const EXPECTED: &str = "hi -12zΩé!aaXYaa5☺";

#[test]
fn test_direct_output() {
    let (text, count) = print_all(false);
    assert_eq!(text, EXPECTED);
    assert_eq!(count, 0);
}

#[test]
fn test_filter_sees_every_character_in_order() {
    let (text, count) = print_all(true);
    assert_eq!(text, EXPECTED);
    assert_eq!(count as usize, EXPECTED.chars().count());
}

#[test]
fn test_null_output_still_returns() {
    let mut asm = ImageBuilder::new();
    let hello = asm.c_string("quiet");
    let main = asm.func_locals(0);
    asm.op(STREAMSTR, &[A::AddrOf(hello)]);
    asm.op(STREAMNUM, &[A::Imm(5)]);
    asm.op(RETURN, &[A::Imm(1)]);

    let (mut machine, done) = run(asm, main);
    assert_eq!(done, Termination::Returned(1));
    assert!(machine.io_mut().take_output().is_empty());
}

#[test]
fn test_getiosys_reports_mode_and_rock() {
    let mut asm = ImageBuilder::new();
    let main = asm.func_locals(2);
    asm.op(SETIOSYS, &[A::Imm(1), A::Imm(0x1234)]);
    asm.op(GETIOSYS, &[A::Local(0), A::Local(4)]);
    asm.op(ADD, &[A::Local(0), A::Local(4), A::Stack]);
    asm.op(RETURN, &[A::Stack]);

    let (_, done) = run(asm, main);
    assert_eq!(done, Termination::Returned(0x1235));
}

#[test]
fn test_compressed_string_without_table_is_fatal() {
    let mut asm = ImageBuilder::new();
    let packed = asm.here();
    asm.bytes(NESTED);
    let main = asm.func_locals(0);
    direct_output(&mut asm);
    asm.op(STREAMSTR, &[A::AddrOf(packed)]);
    asm.op(RETURN, &[A::Imm(0)]);

    let image = asm.build(main);
    let mut machine = glulx_vm::Machine::new(
        &image.bytes,
        glulx_vm::NullIo,
        glulx_vm::VmConfig::for_testing(),
    )
    .unwrap();
    assert!(matches!(
        machine.run(),
        Err(glulx_core::FatalError::BadString { .. })
    ));
}
