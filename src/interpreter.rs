//! The engine core: registers, stack, call frames and the
//! fetch-decode-dispatch loop.
//!
//! All mutable VM state lives on the `Interpreter` record. Opcode
//! handlers for the arithmetic, memory, search, float and output
//! families are in the sibling `opcodes_*` modules; everything touching
//! the call machinery and game state is here.

use crate::error::{Result, TerpError};
use crate::glk::GlkState;
use crate::heap::HeapAllocator;
use crate::host::Host;
use crate::instruction::{self, DestKind};
use crate::memory::ImageMemory;
use crate::opcode_tables::{self, OpcodeMeta, OperandRule};
use crate::output::OutputBuffer;
use crate::quetzal;
use crate::strings::StringTable;
use crate::veneer::Veneer;
use crate::bytes;
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use std::collections::VecDeque;

/// The Glulx specification version this engine implements.
pub const GLULX_VERSION: u32 = 0x0003_0102;

/// Our own version word, reported by gestalt selector 1.
pub const TERP_VERSION: u32 = 0x0001_0000;

/// Call-stub destination types beyond the four store kinds.
pub const STUB_RESUME_HUFFSTR: u32 = 0x10;
pub const STUB_RESUME_CODE: u32 = 0x11;
pub const STUB_RESUME_NUMBER: u32 = 0x12;
pub const STUB_RESUME_CSTR: u32 = 0x13;
pub const STUB_RESUME_UNISTR: u32 = 0x14;
/// Interpreter-private: return into a native (veneer) caller. Never
/// written to a save file; save and undo are refused while any native
/// call is nested.
pub const STUB_RESUME_NATIVE: u32 = 0x99;

const STUB_SIZE: usize = 16;

/// How many undo states are retained.
const UNDO_DEPTH: usize = 3;

/// Default cap on the allocation heap.
const DEFAULT_MAX_HEAP: u32 = 0x0100_0000;

/// What the engine is doing between instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    Code,
    CString,
    UnicodeString,
    Number,
    CompressedString,
    /// A nested native call has completed; control is handed back to
    /// the native caller.
    NativeReturn,
}

/// The selected I/O system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoSystem {
    Null,
    Filter,
    Glk,
    Channels,
}

impl IoSystem {
    pub fn from_number(n: u32) -> Option<IoSystem> {
        match n {
            0 => Some(IoSystem::Null),
            1 => Some(IoSystem::Filter),
            2 => Some(IoSystem::Glk),
            20 => Some(IoSystem::Channels),
            _ => None,
        }
    }

    pub fn number(&self) -> u32 {
        match self {
            IoSystem::Null => 0,
            IoSystem::Filter => 1,
            IoSystem::Glk => 2,
            IoSystem::Channels => 20,
        }
    }
}

/// The 16-byte record pushed before calls and printing excursions.
#[derive(Debug, Clone, Copy)]
pub struct CallStub {
    pub dest_type: u32,
    pub dest_addr: u32,
    pub pc: u32,
    pub fp: u32,
}

/// Random-number source for the random opcode. Either seeded (and
/// predictable) or drawn from OS entropy.
pub struct TerpRand {
    rng: Box<dyn RngCore>,
}

impl TerpRand {
    pub fn new_uniform() -> TerpRand {
        TerpRand {
            rng: Box::new(StdRng::from_entropy()),
        }
    }

    pub fn new_seeded(seed: u64) -> TerpRand {
        TerpRand {
            rng: Box::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Full 32 bits of randomness: four random bytes assembled
    /// big-endian by shifted bitwise OR.
    pub fn next_word(&mut self) -> u32 {
        let mut b = [0u8; 4];
        self.rng.fill_bytes(&mut b);
        ((b[0] as u32) << 24) | ((b[1] as u32) << 16) | ((b[2] as u32) << 8) | (b[3] as u32)
    }

    pub fn in_range(&mut self, bound: u32) -> u32 {
        self.rng.gen_range(0..bound)
    }
}

/// The Glulx virtual machine.
pub struct Interpreter {
    pub image: ImageMemory,
    stack: Vec<u8>,

    // Registers.
    pc: u32,
    sp: usize,
    fp: usize,
    frame_len: usize,
    locals_pos: usize,
    pub(crate) exec_mode: ExecMode,
    /// Digit position while printing a number; bit position while
    /// decoding a compressed string.
    pub(crate) printing_digit: u32,
    pub(crate) output_system: IoSystem,
    pub(crate) filter_address: u32,
    pub(crate) string_table: StringTable,
    protection_start: u32,
    protection_length: u32,
    running: bool,

    // Owned resources.
    pub(crate) heap: Option<HeapAllocator>,
    pub(crate) max_heap_size: u32,
    pub(crate) out: OutputBuffer,
    pub(crate) veneer: Veneer,
    pub(crate) rng: TerpRand,
    pub(crate) glk: GlkState,
    undo: VecDeque<Vec<u8>>,
    nesting: u32,
    native_result: u32,
    host: Box<dyn Host>,
}

impl Interpreter {
    pub fn new(image: ImageMemory, host: Box<dyn Host>) -> Result<Interpreter> {
        let header = image.header().clone();
        if header.stack_size < STUB_SIZE as u32 {
            return Err(TerpError::bad_image("stack size is too small".to_string()));
        }
        let string_table = StringTable::build(&image, header.decoding_table)?;
        let mut terp = Interpreter {
            image,
            stack: vec![0; header.stack_size as usize],
            pc: 0,
            sp: 0,
            fp: 0,
            frame_len: 0,
            locals_pos: 0,
            exec_mode: ExecMode::Code,
            printing_digit: 0,
            output_system: IoSystem::Null,
            filter_address: 0,
            string_table,
            protection_start: 0,
            protection_length: 0,
            running: false,
            heap: None,
            max_heap_size: DEFAULT_MAX_HEAP,
            out: OutputBuffer::new(),
            veneer: Veneer::new(),
            rng: TerpRand::new_uniform(),
            glk: GlkState::new(),
            undo: VecDeque::new(),
            nesting: 0,
            native_result: 0,
            host,
        };
        terp.bootstrap()?;
        Ok(terp)
    }

    /// Seed the RNG for reproducible runs.
    pub fn set_random_seed(&mut self, seed: u64) {
        self.rng = TerpRand::new_seeded(seed);
    }

    pub fn set_max_heap_size(&mut self, size: u32) {
        self.max_heap_size = size;
    }

    pub fn pc(&self) -> u32 {
        self.pc
    }

    pub(crate) fn set_pc(&mut self, pc: u32) {
        self.pc = pc;
    }

    pub fn sp(&self) -> usize {
        self.sp
    }

    pub fn fp(&self) -> usize {
        self.fp
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    pub fn locals_pos(&self) -> usize {
        self.locals_pos
    }

    pub fn stack_bytes(&self) -> &[u8] {
        &self.stack[..self.sp]
    }

    /// Stop at the next instruction boundary.
    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Set up the initial call into the start function.
    fn bootstrap(&mut self) -> Result<()> {
        self.sp = 0;
        self.fp = 0;
        self.pc = 0;
        self.exec_mode = ExecMode::Code;
        self.push_call_stub(0, 0)?;
        let start = self.image.header().start_func;
        self.enter_function(start, &[])
    }

    /// Run until the program quits, returns from its start function, or
    /// faults. Output is drained to the host in every case.
    pub fn run(&mut self) -> Result<()> {
        self.running = true;
        info!("starting execution at {:#010x}", self.pc);
        let result = self.exec_loop();
        self.flush_to_host();
        result
    }

    fn exec_loop(&mut self) -> Result<()> {
        while self.running {
            self.tick()?;
        }
        Ok(())
    }

    /// One step of whatever the engine is currently doing: an
    /// instruction in code mode, one character otherwise.
    fn tick(&mut self) -> Result<()> {
        match self.exec_mode {
            ExecMode::Code => self.step_instruction(),
            ExecMode::CString => self.step_cstring(),
            ExecMode::UnicodeString => self.step_unicode_string(),
            ExecMode::Number => self.step_number(),
            ExecMode::CompressedString => self.step_compressed(),
            ExecMode::NativeReturn => Err(TerpError::fault(
                "engine ticked while returning from a native call".to_string(),
            )),
        }
    }

    // ---- stack primitives ----

    fn stack_read_u32(&self, offset: usize) -> u32 {
        bytes::read_u32(&self.stack, offset)
    }

    fn stack_write_u32(&mut self, offset: usize, value: u32) {
        bytes::write_u32(&mut self.stack, offset, value);
    }

    fn push_u32(&mut self, value: u32) -> Result<()> {
        if self.sp + 4 > self.stack.len() {
            return Err(TerpError::fault("stack overflow".to_string()));
        }
        self.stack_write_u32(self.sp, value);
        self.sp += 4;
        Ok(())
    }

    fn pop_u32(&mut self) -> Result<u32> {
        if self.sp < 4 {
            return Err(TerpError::fault("stack underflow".to_string()));
        }
        self.sp -= 4;
        Ok(self.stack_read_u32(self.sp))
    }

    /// Bottom of the current value stack.
    fn value_stack_base(&self) -> usize {
        self.fp + self.frame_len
    }

    /// Number of 32-bit values on the current value stack.
    pub fn value_count(&self) -> usize {
        (self.sp - self.value_stack_base()) / 4
    }

    pub(crate) fn push_value(&mut self, value: u32) -> Result<()> {
        self.push_u32(value)
    }

    pub(crate) fn pop_value(&mut self) -> Result<u32> {
        if self.sp < self.value_stack_base() + 4 {
            return Err(TerpError::fault(format!(
                "value stack underflow at pc {:#010x}",
                self.pc
            )));
        }
        self.pop_u32()
    }

    // ---- locals ----

    fn local_slot(&self, offset: u32, width: u32) -> Result<usize> {
        let end = offset.checked_add(width).map(|e| e as usize);
        if end.map_or(true, |e| self.locals_pos + e > self.frame_len) {
            return Err(TerpError::fault(format!(
                "local offset {offset} is outside the current frame"
            )));
        }
        Ok(self.fp + self.locals_pos + offset as usize)
    }

    pub(crate) fn read_local(&self, offset: u32, width: u32) -> Result<u32> {
        let at = self.local_slot(offset, width)?;
        Ok(match width {
            1 => self.stack[at] as u32,
            2 => bytes::read_u16(&self.stack, at) as u32,
            _ => bytes::read_u32(&self.stack, at),
        })
    }

    pub(crate) fn write_local(&mut self, offset: u32, value: u32, width: u32) -> Result<()> {
        let at = self.local_slot(offset, width)?;
        match width {
            1 => self.stack[at] = value as u8,
            2 => bytes::write_u16(&mut self.stack, at, value as u16),
            _ => bytes::write_u32(&mut self.stack, at, value),
        }
        Ok(())
    }

    // ---- memory access of a given width ----

    fn read_mem_width(&self, addr: u32, width: u32) -> Result<u32> {
        Ok(match width {
            1 => self.image.read_u8(addr)? as u32,
            2 => self.image.read_u16(addr)? as u32,
            _ => self.image.read_u32(addr)?,
        })
    }

    fn write_mem_width(&mut self, addr: u32, value: u32, width: u32) -> Result<()> {
        match width {
            1 => self.image.write_u8(addr, value as u8),
            2 => self.image.write_u16(addr, value as u16),
            _ => self.image.write_u32(addr, value),
        }
    }

    // ---- operand decoding ----

    fn read_operands(&mut self, addr: u32, meta: &OpcodeMeta) -> Result<(Vec<u32>, Vec<DestKind>)> {
        let total = (meta.loads + meta.stores) as u32;
        let mut modes = Vec::with_capacity(total as usize);
        for i in 0..total {
            let b = self.image.read_u8(addr + i / 2)?;
            modes.push(if i % 2 == 0 { b & 0x0F } else { b >> 4 });
        }
        let mut cursor = addr + (total + 1) / 2;

        let width = match meta.rule {
            OperandRule::Indirect8 => 1,
            OperandRule::Indirect16 => 2,
            _ => 4,
        };

        let mut loads = Vec::with_capacity(meta.loads as usize);
        let mut dests = Vec::with_capacity(meta.stores as usize);
        if meta.rule == OperandRule::Catch {
            dests.push(self.decode_store(modes[0], &mut cursor)?);
            loads.push(self.decode_load(modes[1], &mut cursor, 4)?);
        } else {
            for i in 0..meta.loads as usize {
                loads.push(self.decode_load(modes[i], &mut cursor, width)?);
            }
            for i in 0..meta.stores as usize {
                dests.push(self.decode_store(modes[meta.loads as usize + i], &mut cursor)?);
            }
        }
        self.pc = cursor;
        Ok((loads, dests))
    }

    fn decode_load(&mut self, mode: u8, cursor: &mut u32, width: u32) -> Result<u32> {
        use crate::instruction::*;
        let value = match mode {
            MODE_ZERO => 0,
            MODE_CONST8 => {
                let v = sign_extend_8(self.image.read_u8(*cursor)?);
                *cursor += 1;
                v
            }
            MODE_CONST16 => {
                let v = sign_extend_16(self.image.read_u16(*cursor)?);
                *cursor += 2;
                v
            }
            MODE_CONST32 => {
                let v = self.image.read_u32(*cursor)?;
                *cursor += 4;
                v
            }
            MODE_MEM8 | MODE_MEM16 | MODE_MEM32 => {
                let addr = self.read_pointer(mode - MODE_MEM8, cursor)?;
                self.read_mem_width(addr, width)?
            }
            MODE_STACK => self.pop_value()?,
            MODE_LOCAL8 | MODE_LOCAL16 | MODE_LOCAL32 => {
                let offset = self.read_pointer(mode - MODE_LOCAL8, cursor)?;
                self.read_local(offset, width)?
            }
            MODE_RAM8 | MODE_RAM16 | MODE_RAM32 => {
                let offset = self.read_pointer(mode - MODE_RAM8, cursor)?;
                self.read_mem_width(self.image.ram_start().wrapping_add(offset), width)?
            }
            _ => {
                return Err(TerpError::fault(format!(
                    "invalid load operand type {mode} at pc {:#010x}",
                    self.pc
                )))
            }
        };
        Ok(match width {
            1 => value & 0xFF,
            2 => value & 0xFFFF,
            _ => value,
        })
    }

    fn decode_store(&mut self, mode: u8, cursor: &mut u32) -> Result<DestKind> {
        use crate::instruction::*;
        match mode {
            MODE_ZERO => Ok(DestKind::Discard),
            MODE_MEM8 | MODE_MEM16 | MODE_MEM32 => {
                let addr = self.read_pointer(mode - MODE_MEM8, cursor)?;
                Ok(DestKind::Mem(addr))
            }
            MODE_STACK => Ok(DestKind::Push),
            MODE_LOCAL8 | MODE_LOCAL16 | MODE_LOCAL32 => {
                let offset = self.read_pointer(mode - MODE_LOCAL8, cursor)?;
                Ok(DestKind::Local(offset))
            }
            MODE_RAM8 | MODE_RAM16 | MODE_RAM32 => {
                let offset = self.read_pointer(mode - MODE_RAM8, cursor)?;
                Ok(DestKind::Mem(self.image.ram_start().wrapping_add(offset)))
            }
            _ => Err(TerpError::fault(format!(
                "invalid store operand type {mode} at pc {:#010x}",
                self.pc
            ))),
        }
    }

    /// Pointer-width operand data: 0 = one byte, 1 = two, 2 = four.
    fn read_pointer(&self, size_class: u8, cursor: &mut u32) -> Result<u32> {
        Ok(match size_class {
            0 => {
                let v = self.image.read_u8(*cursor)? as u32;
                *cursor += 1;
                v
            }
            1 => {
                let v = self.image.read_u16(*cursor)? as u32;
                *cursor += 2;
                v
            }
            _ => {
                let v = self.image.read_u32(*cursor)?;
                *cursor += 4;
                v
            }
        })
    }

    pub(crate) fn perform_store(&mut self, dest: DestKind, value: u32) -> Result<()> {
        self.perform_store_sized(dest, value, 4)
    }

    pub(crate) fn perform_store_sized(&mut self, dest: DestKind, value: u32, width: u32) -> Result<()> {
        let value = match width {
            1 => value & 0xFF,
            2 => value & 0xFFFF,
            _ => value,
        };
        match dest {
            DestKind::Discard => Ok(()),
            DestKind::Mem(addr) => self.write_mem_width(addr, value, width),
            DestKind::Local(offset) => self.write_local(offset, value, width),
            DestKind::Push => self.push_value(value),
        }
    }

    // ---- call machinery ----

    pub(crate) fn push_call_stub(&mut self, dest_type: u32, dest_addr: u32) -> Result<()> {
        self.push_u32(dest_type)?;
        self.push_u32(dest_addr)?;
        self.push_u32(self.pc)?;
        self.push_u32(self.fp as u32)
    }

    fn pop_call_stub(&mut self) -> Result<CallStub> {
        if self.sp < STUB_SIZE {
            return Err(TerpError::fault("stack underflow popping call stub".to_string()));
        }
        let fp = self.pop_u32()?;
        let pc = self.pop_u32()?;
        let dest_addr = self.pop_u32()?;
        let dest_type = self.pop_u32()?;
        Ok(CallStub {
            dest_type,
            dest_addr,
            pc,
            fp,
        })
    }

    /// Build a frame for the function at `addr` and transfer control.
    pub(crate) fn enter_function(&mut self, addr: u32, args: &[u32]) -> Result<()> {
        let ftype = self.image.read_u8(addr)?;
        if ftype != 0xC0 && ftype != 0xC1 {
            return Err(TerpError::fault(format!(
                "call target {addr:#010x} has invalid function type {ftype:#04x}"
            )));
        }

        // Locals-format pairs run until (0,0).
        let mut format = Vec::new();
        let mut cursor = addr + 1;
        loop {
            let size = self.image.read_u8(cursor)?;
            let count = self.image.read_u8(cursor + 1)?;
            cursor += 2;
            format.push((size, count));
            if size == 0 && count == 0 {
                break;
            }
            if !matches!(size, 1 | 2 | 4) {
                return Err(TerpError::fault(format!(
                    "function {addr:#010x} declares locals of size {size}"
                )));
            }
        }

        let format_bytes = format.len() * 2;
        let locals_pos = 8 + ((format_bytes + 3) & !3);

        // Each local is aligned to its own size; the whole section is
        // padded to a word boundary.
        let mut slots = Vec::new();
        let mut locals_len = 0usize;
        for &(size, count) in &format {
            let size = size as usize;
            for _ in 0..count {
                if size > 1 {
                    locals_len = (locals_len + size - 1) & !(size - 1);
                }
                slots.push((locals_len, size));
                locals_len += size;
            }
        }
        let frame_len = locals_pos + ((locals_len + 3) & !3);

        let fp = self.sp;
        if fp + frame_len > self.stack.len() {
            return Err(TerpError::fault("stack overflow entering function".to_string()));
        }
        self.stack[fp..fp + frame_len].fill(0);
        bytes::write_u32(&mut self.stack, fp, frame_len as u32);
        bytes::write_u32(&mut self.stack, fp + 4, locals_pos as u32);
        for (i, &(size, count)) in format.iter().enumerate() {
            self.stack[fp + 8 + 2 * i] = size;
            self.stack[fp + 8 + 2 * i + 1] = count;
        }

        self.fp = fp;
        self.frame_len = frame_len;
        self.locals_pos = locals_pos;
        self.sp = fp + frame_len;
        self.pc = cursor;
        self.exec_mode = ExecMode::Code;

        match ftype {
            0xC0 => {
                // Arguments go on the stack, last first, count on top.
                for &arg in args.iter().rev() {
                    self.push_value(arg)?;
                }
                self.push_value(args.len() as u32)?;
            }
            _ => {
                // 0xC1: arguments fill locals in declaration order;
                // surplus locals stay zero, surplus args are dropped.
                for (&arg, &(offset, size)) in args.iter().zip(slots.iter()) {
                    let at = fp + locals_pos + offset;
                    match size {
                        1 => self.stack[at] = arg as u8,
                        2 => bytes::write_u16(&mut self.stack, at, arg as u16),
                        _ => bytes::write_u32(&mut self.stack, at, arg),
                    }
                }
            }
        }
        Ok(())
    }

    /// Pop the stub below `sp` and send `value` wherever it says. This
    /// is the single resume point for function returns, string
    /// terminations and throw.
    pub(crate) fn pop_stub_and_store(&mut self, value: u32) -> Result<()> {
        let stub = self.pop_call_stub()?;
        self.pc = stub.pc;
        self.fp = stub.fp as usize;

        if self.sp == 0 {
            // Returned out of the start function: execution is over.
            debug!("top-level return, stopping");
            self.running = false;
            self.exec_mode = ExecMode::Code;
            return Ok(());
        }

        if self.fp + 8 > self.sp {
            return Err(TerpError::fault("call stub frame pointer is corrupt".to_string()));
        }
        self.frame_len = self.stack_read_u32(self.fp) as usize;
        self.locals_pos = self.stack_read_u32(self.fp + 4) as usize;

        match stub.dest_type {
            0..=3 => {
                self.exec_mode = ExecMode::Code;
                let dest = DestKind::from_stub_fields(stub.dest_type, stub.dest_addr)?;
                self.perform_store(dest, value)
            }
            STUB_RESUME_HUFFSTR => {
                self.exec_mode = ExecMode::CompressedString;
                self.printing_digit = stub.dest_addr;
                Ok(())
            }
            STUB_RESUME_CODE => {
                self.exec_mode = ExecMode::Code;
                Ok(())
            }
            STUB_RESUME_NUMBER => {
                self.exec_mode = ExecMode::Number;
                self.printing_digit = stub.dest_addr;
                Ok(())
            }
            STUB_RESUME_CSTR => {
                self.exec_mode = ExecMode::CString;
                Ok(())
            }
            STUB_RESUME_UNISTR => {
                self.exec_mode = ExecMode::UnicodeString;
                Ok(())
            }
            STUB_RESUME_NATIVE => {
                self.exec_mode = ExecMode::NativeReturn;
                self.native_result = value;
                Ok(())
            }
            other => Err(TerpError::fault(format!(
                "call stub has unknown destination type {other:#x}"
            ))),
        }
    }

    /// Tear down the current frame and return `value` through the stub
    /// beneath it.
    pub(crate) fn leave_function(&mut self, value: u32) -> Result<()> {
        self.sp = self.fp;
        self.pop_stub_and_store(value)
    }

    /// Start running the function at `addr`. The caller has already
    /// pushed (or reused) the call stub. Veneer-accelerated addresses
    /// run natively and return straight through the stub.
    pub(crate) fn initiate_call(&mut self, addr: u32, args: &[u32]) -> Result<()> {
        if let Some(slot) = self.veneer.func_for_address(addr) {
            debug!("veneer intercept of {addr:#010x} ({slot:?})");
            let result = self.veneer_call(slot, args)?;
            return self.pop_stub_and_store(result);
        }
        self.enter_function(addr, args)
    }

    /// Synchronously run a bytecode routine from native code (the
    /// veneer's error hook). Re-enters the dispatch loop until that
    /// frame returns.
    pub(crate) fn call_function_nested(&mut self, addr: u32, args: &[u32]) -> Result<u32> {
        self.nesting += 1;
        self.push_call_stub(STUB_RESUME_NATIVE, 0)
            .and_then(|_| self.enter_function(addr, args))
            .map_err(|e| {
                self.nesting -= 1;
                e
            })?;
        let result = loop {
            if !self.running {
                break Ok(0);
            }
            if self.exec_mode == ExecMode::NativeReturn {
                self.exec_mode = ExecMode::Code;
                break Ok(self.native_result);
            }
            if let Err(e) = self.tick() {
                break Err(e);
            }
        };
        self.nesting -= 1;
        result
    }

    /// Branch targets 0 and 1 return from the current function;
    /// anything else is relative to the end of the instruction.
    pub(crate) fn take_branch(&mut self, target: u32) -> Result<()> {
        if target == 0 || target == 1 {
            return self.leave_function(target);
        }
        self.pc = self.pc.wrapping_add(target).wrapping_sub(2);
        Ok(())
    }

    // ---- the dispatch loop ----

    fn step_instruction(&mut self) -> Result<()> {
        let start_pc = self.pc;
        let (num, operand_addr) = instruction::fetch_opcode(&self.image, self.pc)?;
        let meta = opcode_tables::lookup(num).ok_or_else(|| {
            TerpError::fault(format!("unrecognized opcode {num:#x} at {start_pc:#010x}"))
        })?;
        debug!("{start_pc:08x}: {}", meta.name);
        let (l, d) = self.read_operands(operand_addr, &meta)?;

        match num {
            0x00 => Ok(()), // nop

            0x10..=0x1E => self.exec_math(num, &l, &d),

            // jump
            0x20 => self.take_branch(l[0]),
            // jz / jnz
            0x22 => {
                if l[0] == 0 {
                    self.take_branch(l[1])
                } else {
                    Ok(())
                }
            }
            0x23 => {
                if l[0] != 0 {
                    self.take_branch(l[1])
                } else {
                    Ok(())
                }
            }
            // signed and unsigned compare-and-branch
            0x24..=0x2D => {
                let a = l[0];
                let b = l[1];
                let (sa, sb) = (a as i32, b as i32);
                let cond = match num {
                    0x24 => a == b,
                    0x25 => a != b,
                    0x26 => sa < sb,
                    0x27 => sa >= sb,
                    0x28 => sa > sb,
                    0x29 => sa <= sb,
                    0x2A => a < b,
                    0x2B => a >= b,
                    0x2C => a > b,
                    _ => a <= b,
                };
                if cond {
                    self.take_branch(l[2])
                } else {
                    Ok(())
                }
            }

            // call addr count dest
            0x30 => {
                let mut args = Vec::with_capacity(l[1] as usize);
                for _ in 0..l[1] {
                    args.push(self.pop_value()?);
                }
                let (dt, da) = d[0].stub_fields();
                self.push_call_stub(dt, da)?;
                self.initiate_call(l[0], &args)
            }
            // return
            0x31 => self.leave_function(l[0]),
            // catch
            0x32 => {
                let (dt, da) = d[0].stub_fields();
                self.push_call_stub(dt, da)?;
                let token = self.sp as u32;
                self.perform_store(d[0], token)?;
                self.take_branch(l[0])
            }
            // throw value token
            0x33 => {
                let token = l[1] as usize;
                if token < STUB_SIZE || token > self.sp || token % 4 != 0 {
                    return Err(TerpError::fault(format!(
                        "invalid catch token {token:#x}"
                    )));
                }
                self.sp = token;
                self.pop_stub_and_store(l[0])
            }
            // tailcall addr count
            0x34 => {
                let mut args = Vec::with_capacity(l[1] as usize);
                for _ in 0..l[1] {
                    args.push(self.pop_value()?);
                }
                self.sp = self.fp;
                self.initiate_call(l[0], &args)
            }

            0x40..=0x4F => self.exec_data(num, &meta, &l, &d),

            // stack opcodes
            0x50 => {
                let count = self.value_count() as u32;
                self.perform_store(d[0], count)
            }
            0x51 => {
                let n = l[0] as usize;
                if n >= self.value_count() {
                    return Err(TerpError::fault(format!("stkpeek {n} past stack bottom")));
                }
                let value = self.stack_read_u32(self.sp - 4 * (n + 1));
                self.perform_store(d[0], value)
            }
            0x52 => {
                if self.value_count() < 2 {
                    return Err(TerpError::fault("stkswap needs two values".to_string()));
                }
                let a = self.stack_read_u32(self.sp - 4);
                let b = self.stack_read_u32(self.sp - 8);
                self.stack_write_u32(self.sp - 4, b);
                self.stack_write_u32(self.sp - 8, a);
                Ok(())
            }
            0x53 => self.op_stkroll(l[0], l[1] as i32),
            0x54 => {
                let n = l[0] as usize;
                if n > self.value_count() {
                    return Err(TerpError::fault(format!("stkcopy {n} past stack bottom")));
                }
                let base = self.sp - 4 * n;
                for i in 0..n {
                    let value = self.stack_read_u32(base + 4 * i);
                    self.push_value(value)?;
                }
                Ok(())
            }

            0x70..=0x73 | 0x140 | 0x141 | 0x148 | 0x149 => self.exec_stream(num, &l, &d),

            // gestalt
            0x100 => {
                let value = self.do_gestalt(l[0], l[1])?;
                self.perform_store(d[0], value)
            }
            0x101 => Err(TerpError::fault(format!(
                "debugtrap executed with value {:#x}",
                l[0]
            ))),
            0x102 | 0x103 | 0x170 | 0x171 | 0x178 | 0x179 => self.exec_memctl(num, &l, &d),
            // jumpabs
            0x104 => {
                self.pc = l[0];
                Ok(())
            }

            // random / setrandom
            0x110 => {
                let n = l[0] as i32;
                let value = if n > 0 {
                    self.rng.in_range(n as u32)
                } else if n < 0 {
                    let bound = (-(n as i64)) as u32;
                    (-(self.rng.in_range(bound) as i64)) as i32 as u32
                } else {
                    self.rng.next_word()
                };
                self.perform_store(d[0], value)
            }
            0x111 => {
                self.rng = if l[0] == 0 {
                    TerpRand::new_uniform()
                } else {
                    TerpRand::new_seeded(l[0] as u64)
                };
                Ok(())
            }

            // quit
            0x120 => {
                info!("quit opcode");
                self.running = false;
                Ok(())
            }
            // verify
            0x121 => {
                let ok = self.image.verify();
                self.perform_store(d[0], if ok { 0 } else { 1 })
            }
            // restart
            0x122 => self.op_restart(),
            // save / restore / saveundo / restoreundo
            0x123 => self.op_save(d[0]),
            0x124 => self.op_restore(d[0]),
            0x125 => self.op_saveundo(d[0]),
            0x126 => self.op_restoreundo(d[0]),
            // protect
            0x127 => {
                self.protection_start = l[0];
                self.protection_length = l[1];
                Ok(())
            }

            0x130 => self.op_glk(l[0], l[1], d[0]),

            0x150..=0x152 => self.exec_search(num, &l, &d),

            // callf family
            0x160..=0x163 => {
                let args = &l[1..];
                let (dt, da) = d[0].stub_fields();
                self.push_call_stub(dt, da)?;
                self.initiate_call(l[0], args)
            }

            // accelfunc / accelparam
            0x180 => self.veneer.set_accel_func(l[0], l[1]),
            0x181 => self.veneer.set_accel_param(l[0], l[1]),

            0x190..=0x1C9 => self.exec_float(num, &l, &d),

            0x1000 => self.op_fyrecall(&l, d[0]),

            _ => Err(TerpError::fault(format!(
                "opcode {num:#x} has no handler"
            ))),
        }
    }

    fn op_stkroll(&mut self, count: u32, rotate: i32) -> Result<()> {
        let count = count as usize;
        if count > self.value_count() {
            return Err(TerpError::fault(format!("stkroll {count} past stack bottom")));
        }
        if count == 0 {
            return Ok(());
        }
        let r = (rotate.rem_euclid(count as i32)) as usize;
        if r == 0 {
            return Ok(());
        }
        let base = self.sp - 4 * count;
        let mut cells: Vec<u32> = (0..count)
            .map(|i| self.stack_read_u32(base + 4 * i))
            .collect();
        // Positive distances rotate toward the top of the stack.
        cells.rotate_right(r);
        for (i, value) in cells.into_iter().enumerate() {
            self.stack_write_u32(base + 4 * i, value);
        }
        Ok(())
    }

    fn do_gestalt(&mut self, selector: u32, arg: u32) -> Result<u32> {
        Ok(match selector {
            0 => GLULX_VERSION,
            1 => TERP_VERSION,
            2 => 1, // memory can be resized
            3 => 1, // undo is available
            4 => u32::from(IoSystem::from_number(arg).is_some()),
            5 => 1, // unicode
            6 => 1, // mzero/mcopy
            7 => 1, // malloc/mfree
            8 => self.heap.as_ref().map_or(0, |h| h.start()),
            9 => 1, // acceleration
            10 => u32::from(Veneer::accel_func_known(arg)),
            11 => 1, // float opcodes
            _ => {
                return Err(TerpError::fault(format!(
                    "unrecognized gestalt selector {selector}"
                )))
            }
        })
    }

    // ---- game-state opcodes ----

    /// Snapshot of the protected RAM window, as (offset, bytes).
    fn capture_protected(&self) -> Option<(u32, Vec<u8>)> {
        if self.protection_length == 0 {
            return None;
        }
        let ram_start = self.image.ram_start();
        let start = self.protection_start.max(ram_start);
        let end = self
            .protection_start
            .saturating_add(self.protection_length)
            .min(self.image.end_mem());
        if start >= end {
            return None;
        }
        let offset = start - ram_start;
        self.image.read_ram(offset, end - start).ok().map(|b| (offset, b))
    }

    fn restore_protected(&mut self, window: Option<(u32, Vec<u8>)>) {
        if let Some((offset, mut data)) = window {
            let available = self.image.ram_size().saturating_sub(offset) as usize;
            data.truncate(available);
            if let Err(e) = self.image.write_ram(offset, &data) {
                warn!("could not restore protected range: {e}");
            }
        }
    }

    fn op_restart(&mut self) -> Result<()> {
        info!("restart");
        let window = self.capture_protected();
        self.image.revert();
        self.restore_protected(window);
        self.heap = None;
        self.output_system = IoSystem::Null;
        self.filter_address = 0;
        self.glk = GlkState::new();
        self.string_table = StringTable::build(&self.image, self.image.header().decoding_table)?;
        self.bootstrap()
    }

    fn op_save(&mut self, dest: DestKind) -> Result<()> {
        if self.nesting > 0 {
            warn!("save refused inside a nested native call");
            return self.perform_store(dest, 1);
        }
        let (dt, da) = dest.stub_fields();
        self.push_call_stub(dt, da)?;
        let ok = match self.host.save_requested() {
            Some(mut w) => {
                let result = quetzal::write_save(
                    &mut w,
                    &self.image,
                    &self.stack[..self.sp],
                    self.heap.as_ref(),
                );
                if let Err(ref e) = result {
                    warn!("save failed: {e}");
                }
                result.is_ok()
            }
            None => false,
        };
        self.pop_call_stub()?;
        self.perform_store(dest, u32::from(!ok))
    }

    fn op_restore(&mut self, dest: DestKind) -> Result<()> {
        let payload = match self.host.load_requested() {
            Some(mut r) => quetzal::read_save(&mut r, &self.image),
            None => {
                return self.perform_store(dest, 1);
            }
        };
        match payload.and_then(|state| self.apply_save_state(state)) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("restore rejected: {e}");
                self.perform_store(dest, 1)
            }
        }
    }

    fn op_saveundo(&mut self, dest: DestKind) -> Result<()> {
        if self.nesting > 0 {
            warn!("saveundo refused inside a nested native call");
            return self.perform_store(dest, 1);
        }
        let (dt, da) = dest.stub_fields();
        self.push_call_stub(dt, da)?;
        let mut buffer = Vec::new();
        let result = quetzal::write_save(
            &mut buffer,
            &self.image,
            &self.stack[..self.sp],
            self.heap.as_ref(),
        );
        self.pop_call_stub()?;
        match result {
            Ok(()) => {
                self.undo.push_back(buffer);
                while self.undo.len() > UNDO_DEPTH {
                    self.undo.pop_front();
                }
                self.perform_store(dest, 0)
            }
            Err(e) => {
                warn!("saveundo failed: {e}");
                self.perform_store(dest, 1)
            }
        }
    }

    fn op_restoreundo(&mut self, dest: DestKind) -> Result<()> {
        match self.undo.pop_back() {
            Some(buffer) => {
                let state = quetzal::read_save(&mut &buffer[..], &self.image)?;
                self.apply_save_state(state)
            }
            None => self.perform_store(dest, 1),
        }
    }

    /// Swap in a fully parsed and verified save state, then deliver the
    /// "this is a restore" value through the stub saved on its stack.
    fn apply_save_state(&mut self, state: quetzal::SaveState) -> Result<()> {
        if state.stack.len() > self.stack.len() {
            return Err(TerpError::bad_save(format!(
                "saved stack of {} bytes exceeds the stack size",
                state.stack.len()
            )));
        }
        let heap = match &state.heap {
            Some(data) => HeapAllocator::restore(data, self.max_heap_size)?,
            None => None,
        };

        let window = self.capture_protected();
        self.image.set_ram(&state.ram)?;
        self.restore_protected(window);

        self.stack.fill(0);
        self.stack[..state.stack.len()].copy_from_slice(&state.stack);
        self.sp = state.stack.len();
        self.heap = heap;
        self.exec_mode = ExecMode::Code;

        self.pop_stub_and_store(0xFFFF_FFFF)
    }

    // ---- host surface ----

    pub(crate) fn flush_to_host(&mut self) {
        let channels = self.out.flush();
        self.host.output_ready(channels);
    }

    /// Flush, then ask the host for a line. Cancellation is an empty
    /// line.
    pub(crate) fn request_line(&mut self) -> String {
        self.flush_to_host();
        match self.host.line_wanted() {
            Some(line) => line,
            None => {
                debug!("line input cancelled");
                String::new()
            }
        }
    }

    /// Flush, then ask the host for a key. Cancellation is code 0.
    pub(crate) fn request_key(&mut self) -> u32 {
        self.flush_to_host();
        match self.host.key_wanted() {
            Some(ch) => ch as u32,
            None => {
                debug!("key input cancelled");
                0
            }
        }
    }

    pub(crate) fn notify_transition(&mut self) {
        self.host.transition_requested();
    }
}
