//! Test support: a miniature image assembler and a scripted host.
//!
//! Tests lay Glulx programs out byte-by-byte. The builder owns the
//! header bookkeeping: a fixed ROM window for code, RAM at 0x1000, and
//! a correct checksum.

use crate::host::Host;
use crate::interpreter::Interpreter;
use crate::memory::{self, ImageMemory};
use crate::opcode_tables;
use crate::output::ChannelOutput;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{Cursor, Read, Write};
use std::rc::Rc;

/// Where RAM begins in every test image.
pub const TEST_RAM_START: u32 = 0x1000;

const ROM_BASE: u32 = 36;
const OFF_CHECKSUM: usize = 32;

pub struct ImageBuilder {
    rom: Vec<u8>,
    ram: Vec<u8>,
    stack_size: u32,
    start_func: Option<u32>,
    decoding_table: u32,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageBuilder {
    pub fn new() -> ImageBuilder {
        ImageBuilder {
            rom: Vec::new(),
            ram: Vec::new(),
            stack_size: 0x1000,
            start_func: None,
            decoding_table: 0,
        }
    }

    /// Append bytes to ROM, returning their address. The first chunk
    /// that looks like a function becomes the start function.
    pub fn code(&mut self, bytes: &[u8]) -> u32 {
        let addr = self.next_code_addr();
        assert!(
            addr as usize + bytes.len() <= TEST_RAM_START as usize,
            "test ROM overflow"
        );
        if self.start_func.is_none() && matches!(bytes.first(), Some(0xC0) | Some(0xC1)) {
            self.start_func = Some(addr);
        }
        self.rom.extend_from_slice(bytes);
        addr
    }

    /// Append bytes to the initial RAM contents, returning their
    /// address.
    pub fn ram_bytes(&mut self, bytes: &[u8]) -> u32 {
        let addr = self.next_ram_addr();
        self.ram.extend_from_slice(bytes);
        addr
    }

    pub fn next_code_addr(&self) -> u32 {
        ROM_BASE + self.rom.len() as u32
    }

    pub fn next_ram_addr(&self) -> u32 {
        TEST_RAM_START + self.ram.len() as u32
    }

    pub fn set_start(&mut self, addr: u32) {
        self.start_func = Some(addr);
    }

    pub fn set_decoding_table(&mut self, addr: u32) {
        self.decoding_table = addr;
    }

    pub fn set_stack_size(&mut self, size: u32) {
        self.stack_size = size;
    }

    /// Assemble the file bytes, checksum included.
    pub fn build(&self) -> Vec<u8> {
        let ram_len = memory::round_up((self.ram.len() as u32).max(256));
        let ext_start = TEST_RAM_START + ram_len;
        let mut file = vec![0u8; ext_start as usize];

        file[0..4].copy_from_slice(b"Glul");
        crate::bytes::write_u32(&mut file, 4, 0x0003_0102); // version
        crate::bytes::write_u32(&mut file, 8, TEST_RAM_START);
        crate::bytes::write_u32(&mut file, 12, ext_start);
        crate::bytes::write_u32(&mut file, 16, ext_start); // end_mem
        crate::bytes::write_u32(&mut file, 20, self.stack_size);
        crate::bytes::write_u32(&mut file, 24, self.start_func.unwrap_or(ROM_BASE));
        crate::bytes::write_u32(&mut file, 28, self.decoding_table);

        file[ROM_BASE as usize..ROM_BASE as usize + self.rom.len()].copy_from_slice(&self.rom);
        file[TEST_RAM_START as usize..TEST_RAM_START as usize + self.ram.len()]
            .copy_from_slice(&self.ram);

        let checksum = memory::checksum(&file, ext_start);
        crate::bytes::write_u32(&mut file, OFF_CHECKSUM, checksum);
        file
    }
}

/// Encode an opcode number at its natural width.
pub fn encode_op(num: u32) -> Vec<u8> {
    if num < 0x80 {
        vec![num as u8]
    } else if num < 0x4000 {
        ((num + 0x8000) as u16).to_be_bytes().to_vec()
    } else {
        (num + 0xC000_0000).to_be_bytes().to_vec()
    }
}

/// Pack operand-mode nibbles, low nibble first.
pub fn pack_modes(modes: &[u8]) -> Vec<u8> {
    modes
        .chunks(2)
        .map(|pair| pair[0] | (pair.get(1).copied().unwrap_or(0) << 4))
        .collect()
}

/// Everything a test wants to observe about a run.
#[derive(Default)]
pub struct TestHostState {
    pub lines: VecDeque<String>,
    pub keys: VecDeque<char>,
    pub flushes: Vec<ChannelOutput>,
    pub saves: Vec<Vec<u8>>,
    pub load: Option<Vec<u8>>,
    pub transitions: u32,
    pub refuse_saves: bool,
}

impl TestHostState {
    /// All MAIN-channel text across every flush.
    pub fn main_text(&self) -> String {
        self.flushes
            .iter()
            .filter_map(|f| f.get(&crate::output::ChannelId::MAIN))
            .cloned()
            .collect()
    }
}

pub struct TestHost(pub Rc<RefCell<TestHostState>>);

impl TestHost {
    pub fn new() -> (TestHost, Rc<RefCell<TestHostState>>) {
        let state = Rc::new(RefCell::new(TestHostState::default()));
        (TestHost(state.clone()), state)
    }
}

struct SharedSave {
    state: Rc<RefCell<TestHostState>>,
    index: usize,
}

impl Write for SharedSave {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.state.borrow_mut().saves[self.index].extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Host for TestHost {
    fn line_wanted(&mut self) -> Option<String> {
        self.0.borrow_mut().lines.pop_front()
    }

    fn key_wanted(&mut self) -> Option<char> {
        self.0.borrow_mut().keys.pop_front()
    }

    fn output_ready(&mut self, channels: ChannelOutput) {
        if !channels.is_empty() {
            self.0.borrow_mut().flushes.push(channels);
        }
    }

    fn save_requested(&mut self) -> Option<Box<dyn Write>> {
        let mut state = self.0.borrow_mut();
        if state.refuse_saves {
            return None;
        }
        state.saves.push(Vec::new());
        let index = state.saves.len() - 1;
        Some(Box::new(SharedSave {
            state: self.0.clone(),
            index,
        }))
    }

    fn load_requested(&mut self) -> Option<Box<dyn Read>> {
        // Scripted bytes win; otherwise hand back the latest save so a
        // program can restore what it just wrote.
        let state = self.0.borrow();
        let data = state.load.clone().or_else(|| state.saves.last().cloned())?;
        Some(Box::new(Cursor::new(data)))
    }

    fn transition_requested(&mut self) {
        self.0.borrow_mut().transitions += 1;
    }
}

/// Build, load and run a program to completion.
pub fn run_program(builder: ImageBuilder) -> (Interpreter, crate::error::Result<()>) {
    let (host, state) = TestHost::new();
    let result = run_program_with(builder, host);
    drop(state);
    result
}

pub fn run_program_with(
    builder: ImageBuilder,
    host: TestHost,
) -> (Interpreter, crate::error::Result<()>) {
    let image = ImageMemory::load(builder.build()).unwrap();
    let mut terp = Interpreter::new(image, Box::new(host)).unwrap();
    let result = terp.run();
    (terp, result)
}

/// Run a single store-result opcode over constant operands and return
/// what it stored.
pub fn run_expr(num: u32, args: &[u32]) -> u32 {
    let (terp, result) = run_expr_inner(num, args);
    result.unwrap();
    terp.image.read_u32(TEST_RAM_START).unwrap()
}

/// Same, but the program is expected to fault.
pub fn run_expr_err(num: u32, args: &[u32]) {
    let (_, result) = run_expr_inner(num, args);
    assert!(result.is_err(), "opcode {num:#x} should have faulted");
}

fn run_expr_inner(num: u32, args: &[u32]) -> (Interpreter, crate::error::Result<()>) {
    let meta = opcode_tables::lookup(num).expect("unknown opcode in test");
    assert_eq!(meta.loads as usize, args.len());
    assert_eq!(meta.stores, 1);

    let mut code = vec![0xC1, 0x00, 0x00];
    code.extend(encode_op(num));
    let mut modes = vec![3u8; args.len()];
    modes.push(7); // store to a 32-bit memory address
    code.extend(pack_modes(&modes));
    for arg in args {
        code.extend(arg.to_be_bytes());
    }
    code.extend(TEST_RAM_START.to_be_bytes());
    code.extend(encode_op(0x120)); // quit

    let mut b = ImageBuilder::new();
    b.code(&code);
    run_program(b)
}
