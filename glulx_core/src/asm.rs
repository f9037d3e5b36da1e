//! A small Glulx assembler for building images by hand.
//!
//! Used by the test suites and benches to produce story files without any
//! external tooling. It knows the operand encoding but not the opcode table:
//! callers pass raw opcode numbers.
//!
//! ```ignore
//! let mut asm = ImageBuilder::new();
//! let main = asm.func_locals(0);
//! asm.op(0x31, &[Operand::Imm(42)]); // return 42
//! let image = asm.build(main);
//! ```

use crate::header::{Header, CHECKSUM_OFFSET, GLULX_MAGIC, HEADER_SIZE};
use crate::page_align;

/// A position in the image, bound later with [`ImageBuilder::bind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(usize);

/// Instruction operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// Constant, encoded in the smallest mode that holds it.
    Imm(i32),
    /// Absolute memory address (mode 7).
    Mem(u32),
    /// RAM-relative address (mode F).
    Ram(u32),
    /// Local at a byte offset into the locals segment (mode B).
    Local(u32),
    /// Push onto (store) or pop from (load) the value stack.
    Stack,
    /// Discard the value (store operand, mode 0).
    Discard,
    /// Branch offset to a label, patched so it lands on the label.
    Branch(Label),
    /// The address of a label as a 4-byte constant.
    AddrOf(Label),
    /// The memory word at a label (mode 7).
    At(Label),
}

#[derive(Debug, Clone, Copy)]
enum Fixup {
    /// 4-byte branch offset at `pos`, relative to the instruction end.
    Branch { pos: usize, label: Label, end: usize },
    /// 4-byte absolute address at `pos`.
    Abs { pos: usize, label: Label },
}

#[derive(Debug, Clone, Copy)]
enum Binding {
    Unbound,
    Rom(usize),
    Ram(usize),
}

/// Result of [`ImageBuilder::build`].
#[derive(Debug, Clone)]
pub struct AssembledImage {
    pub bytes: Vec<u8>,
    pub ram_start: u32,
    pub end_mem: u32,
    addrs: Vec<u32>,
}

impl AssembledImage {
    /// Final address of a label.
    pub fn addr(&self, label: Label) -> u32 {
        self.addrs[label.0]
    }
}

/// Incremental image builder.
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    rom: Vec<u8>,
    ram: Vec<u8>,
    labels: Vec<Binding>,
    fixups: Vec<Fixup>,
    ram_start: Option<u32>,
    min_end_mem: u32,
    stack_size: u32,
    version: u32,
    string_table: Option<Label>,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageBuilder {
    pub fn new() -> Self {
        let mut rom = Vec::with_capacity(1024);
        rom.resize(HEADER_SIZE as usize, 0);
        ImageBuilder {
            rom,
            ram: Vec::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
            ram_start: None,
            min_end_mem: 0,
            stack_size: 0x1000,
            version: 0x0003_0102,
            string_table: None,
        }
    }

    /// Pin RAMSTART. Code emitted past it ends up in writable memory.
    pub fn ram_start(mut self, addr: u32) -> Self {
        self.ram_start = Some(page_align(addr.max(HEADER_SIZE)));
        self
    }

    /// Minimum ENDMEM (rounded up to a page).
    pub fn end_mem(mut self, size: u32) -> Self {
        self.min_end_mem = page_align(size);
        self
    }

    pub fn stack_size(mut self, size: u32) -> Self {
        self.stack_size = page_align(size.max(256));
        self
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Point the header's decoding-table field at `label`.
    pub fn string_table(&mut self, label: Label) {
        self.string_table = Some(label);
    }

    // =========================================================================
    // Labels
    // =========================================================================

    pub fn new_label(&mut self) -> Label {
        self.labels.push(Binding::Unbound);
        Label(self.labels.len() - 1)
    }

    /// Bind `label` to the current ROM position.
    pub fn bind(&mut self, label: Label) {
        self.labels[label.0] = Binding::Rom(self.rom.len());
    }

    /// A new label bound here.
    pub fn here(&mut self) -> Label {
        let label = self.new_label();
        self.bind(label);
        label
    }

    /// Current ROM position (image offset).
    pub fn pos(&self) -> u32 {
        self.rom.len() as u32
    }

    // =========================================================================
    // Raw data
    // =========================================================================

    pub fn byte(&mut self, value: u8) -> &mut Self {
        self.rom.push(value);
        self
    }

    pub fn bytes(&mut self, data: &[u8]) -> &mut Self {
        self.rom.extend_from_slice(data);
        self
    }

    pub fn word(&mut self, value: u32) -> &mut Self {
        self.rom.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// A 4-byte word holding the address of `label`.
    pub fn word_addr(&mut self, label: Label) -> &mut Self {
        let pos = self.rom.len();
        self.rom.extend_from_slice(&[0; 4]);
        self.fixups.push(Fixup::Abs { pos, label });
        self
    }

    /// An `0xE0` Latin-1 string.
    pub fn c_string(&mut self, text: &str) -> Label {
        let label = self.here();
        self.rom.push(0xE0);
        self.rom.extend(text.chars().map(|c| c as u32 as u8));
        self.rom.push(0);
        label
    }

    /// An `0xE2` UCS-4 string.
    pub fn unicode_string(&mut self, text: &str) -> Label {
        let label = self.here();
        self.rom.extend_from_slice(&[0xE2, 0, 0, 0]);
        for c in text.chars() {
            self.rom.extend_from_slice(&(c as u32).to_be_bytes());
        }
        self.rom.extend_from_slice(&[0; 4]);
        label
    }

    /// Reserve initialised RAM; the label resolves to its absolute address.
    pub fn ram_data(&mut self, data: &[u8]) -> Label {
        let label = self.new_label();
        self.labels[label.0] = Binding::Ram(self.ram.len());
        self.ram.extend_from_slice(data);
        label
    }

    /// Reserve `len` zeroed RAM bytes.
    pub fn ram_zeroed(&mut self, len: usize) -> Label {
        self.ram_data(&vec![0; len])
    }

    // =========================================================================
    // Functions and instructions
    // =========================================================================

    fn func_header(&mut self, kind: u8, locals: u32) -> Label {
        let label = self.here();
        self.rom.push(kind);
        let mut left = locals;
        while left > 0 {
            let count = left.min(255);
            self.rom.extend_from_slice(&[4, count as u8]);
            left -= count;
        }
        self.rom.extend_from_slice(&[0, 0]);
        label
    }

    /// Function with arguments copied into `locals` 4-byte locals (`0xC1`).
    pub fn func_locals(&mut self, locals: u32) -> Label {
        self.func_header(0xC1, locals)
    }

    /// Function with arguments pushed onto its stack (`0xC0`).
    pub fn func_stack(&mut self, locals: u32) -> Label {
        self.func_header(0xC0, locals)
    }

    fn opcode(&mut self, opcode: u32) {
        match opcode {
            0..=0x7F => self.rom.push(opcode as u8),
            0x80..=0x3FFF => self
                .rom
                .extend_from_slice(&((opcode | 0x8000) as u16).to_be_bytes()),
            _ => self.rom.extend_from_slice(&(opcode | 0xC000_0000).to_be_bytes()),
        }
    }

    /// Emit one instruction.
    pub fn op(&mut self, opcode: u32, operands: &[Operand]) -> &mut Self {
        self.opcode(opcode);

        let modes_at = self.rom.len();
        self.rom.resize(modes_at + (operands.len() + 1) / 2, 0);

        let mut pending = Vec::new();
        for (index, operand) in operands.iter().enumerate() {
            let (mode, data) = encode(operand);
            let byte = &mut self.rom[modes_at + index / 2];
            *byte |= mode << ((index & 1) * 4);

            let pos = self.rom.len();
            self.rom.extend_from_slice(&data);
            match *operand {
                Operand::Branch(label) => pending.push((pos, label)),
                Operand::AddrOf(label) | Operand::At(label) => {
                    self.fixups.push(Fixup::Abs { pos, label })
                }
                _ => {}
            }
        }

        let end = self.rom.len();
        for (pos, label) in pending {
            self.fixups.push(Fixup::Branch { pos, label, end });
        }
        self
    }

    // =========================================================================
    // Output
    // =========================================================================

    /// Lay out ROM and RAM, resolve labels and write the header.
    ///
    /// # Panics
    ///
    /// Panics if a referenced label was never bound.
    pub fn build(mut self, start: Label) -> AssembledImage {
        let code_end = page_align(self.rom.len() as u32);
        let ram_start = self.ram_start.unwrap_or(code_end);
        let data_base = code_end.max(ram_start);
        let ext_start = page_align(data_base + self.ram.len() as u32).max(ram_start);
        let end_mem = ext_start.max(self.min_end_mem);

        let addrs: Vec<u32> = self
            .labels
            .iter()
            .map(|binding| match *binding {
                Binding::Unbound => u32::MAX,
                Binding::Rom(pos) => pos as u32,
                Binding::Ram(offset) => data_base + offset as u32,
            })
            .collect();
        let resolve = |label: Label| {
            let addr = addrs[label.0];
            assert!(addr != u32::MAX, "label {:?} was never bound", label);
            addr
        };

        for fixup in &self.fixups {
            let (pos, value) = match *fixup {
                Fixup::Branch { pos, label, end } => {
                    (pos, resolve(label).wrapping_sub(end as u32).wrapping_add(2))
                }
                Fixup::Abs { pos, label } => (pos, resolve(label)),
            };
            self.rom[pos..pos + 4].copy_from_slice(&value.to_be_bytes());
        }

        let mut bytes = self.rom;
        bytes.resize(data_base as usize, 0);
        bytes.extend_from_slice(&self.ram);
        bytes.resize(ext_start as usize, 0);

        let string_table = self.string_table.map(resolve).unwrap_or(0);
        bytes[0..4].copy_from_slice(&GLULX_MAGIC);
        for (offset, value) in [
            (4, self.version),
            (8, ram_start),
            (12, ext_start),
            (16, end_mem),
            (20, self.stack_size),
            (24, resolve(start)),
            (28, string_table),
        ] {
            bytes[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
        }
        let checksum = Header::compute_checksum(&bytes, ext_start);
        bytes[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&checksum.to_be_bytes());

        AssembledImage {
            bytes,
            ram_start,
            end_mem,
            addrs,
        }
    }
}

fn encode(operand: &Operand) -> (u8, Vec<u8>) {
    match *operand {
        Operand::Imm(0) => (0x0, Vec::new()),
        Operand::Imm(v) if i8::try_from(v).is_ok() => (0x1, vec![v as u8]),
        Operand::Imm(v) if i16::try_from(v).is_ok() => (0x2, (v as i16).to_be_bytes().to_vec()),
        Operand::Imm(v) => (0x3, v.to_be_bytes().to_vec()),
        Operand::Mem(addr) => (0x7, addr.to_be_bytes().to_vec()),
        Operand::Ram(offset) => (0xF, offset.to_be_bytes().to_vec()),
        Operand::Local(offset) => (0xB, offset.to_be_bytes().to_vec()),
        Operand::Stack => (0x8, Vec::new()),
        Operand::Discard => (0x0, Vec::new()),
        Operand::Branch(_) | Operand::AddrOf(_) => (0x3, vec![0; 4]),
        Operand::At(_) => (0x7, vec![0; 4]),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemorySpace;

    #[test]
    fn test_minimal_image_parses() {
        let mut asm = ImageBuilder::new();
        let main = asm.func_locals(0);
        asm.op(0x31, &[Operand::Imm(42)]);
        let image = asm.build(main);

        let header = Header::parse(&image.bytes).unwrap();
        assert_eq!(header.start_func, 36);
        assert_eq!(header.ram_start, 256);
        assert_eq!(
            Header::compute_checksum(&image.bytes, header.ext_start),
            header.checksum
        );
        // C1 00 00 | 31 01 2A
        assert_eq!(&image.bytes[36..42], &[0xC1, 0, 0, 0x31, 0x01, 42]);
    }

    #[test]
    fn test_operand_modes_pack_two_per_byte() {
        let mut asm = ImageBuilder::new();
        let main = asm.func_locals(1);
        asm.op(0x10, &[Operand::Local(0), Operand::Imm(300), Operand::Stack]);
        let image = asm.build(main);
        // header C1 04 01 00 00, then opcode 10, modes (2<<4 | B), (8)
        assert_eq!(&image.bytes[41..44], &[0x10, 0x2B, 0x08]);
    }

    #[test]
    fn test_branch_labels_resolve_relative_to_instruction_end() {
        let mut asm = ImageBuilder::new();
        let main = asm.func_locals(0);
        let target = asm.new_label();
        asm.op(0x20, &[Operand::Branch(target)]);
        let after = asm.pos();
        asm.bind(target);
        asm.op(0x31, &[Operand::Imm(1)]);
        let image = asm.build(main);

        let offset_at = after as usize - 4;
        let offset = u32::from_be_bytes(image.bytes[offset_at..after as usize].try_into().unwrap());
        assert_eq!(after.wrapping_add(offset).wrapping_sub(2), image.addr(target));
    }

    #[test]
    fn test_ram_data_lands_in_ram() {
        let mut asm = ImageBuilder::new().end_mem(0x2000);
        let main = asm.func_locals(0);
        asm.op(0x31, &[Operand::Imm(0)]);
        let table = asm.ram_data(&[1, 2, 3, 4]);
        let image = asm.build(main);

        let mem = MemorySpace::new(&image.bytes).unwrap();
        assert!(image.addr(table) >= image.ram_start);
        assert_eq!(mem.read32(image.addr(table)).unwrap(), 0x0102_0304);
        assert_eq!(mem.end_mem(), 0x2000);
    }

    #[test]
    fn test_pinned_ram_start_puts_code_in_ram() {
        let mut asm = ImageBuilder::new().ram_start(0x100);
        asm.bytes(&[0; 0x100]);
        let main = asm.func_locals(0);
        asm.op(0x31, &[Operand::Imm(0)]);
        let image = asm.build(main);
        assert!(image.addr(main) >= image.ram_start);
        assert!(Header::parse(&image.bytes).is_ok());
    }
}
