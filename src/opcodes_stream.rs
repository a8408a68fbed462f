//! Output opcodes and the printing state machine.
//!
//! Printing is resumable: starting a string pushes a call stub and
//! switches the execution mode, and each loop iteration emits one
//! character. That structure is what lets the filter I/O system call a
//! bytecode function per character and carry on afterwards, and lets
//! compressed strings nest substrings and function calls.

use crate::error::{Result, TerpError};
use crate::instruction::DestKind;
use crate::interpreter::{
    ExecMode, Interpreter, IoSystem, STUB_RESUME_CODE, STUB_RESUME_CSTR, STUB_RESUME_HUFFSTR,
    STUB_RESUME_NUMBER, STUB_RESUME_UNISTR,
};
use crate::output::ChannelId;
use crate::strings::{self, StrOp, StringTable, TYPE_COMPRESSED, TYPE_CSTRING, TYPE_UNICODE};

impl Interpreter {
    pub(crate) fn exec_stream(&mut self, num: u32, l: &[u32], d: &[DestKind]) -> Result<()> {
        match num {
            // streamchar
            0x70 => self.stream_char(l[0] & 0xFF),
            // streamnum: enter number-printing mode
            0x71 => {
                self.push_call_stub(STUB_RESUME_CODE, 0)?;
                self.exec_mode = ExecMode::Number;
                self.set_pc(l[0]);
                self.printing_digit = 0;
                Ok(())
            }
            // streamstr
            0x72 => {
                self.push_call_stub(STUB_RESUME_CODE, 0)?;
                self.begin_string(l[0])
            }
            // streamunichar
            0x73 => self.stream_char(l[0]),
            // getstringtbl / setstringtbl
            0x140 => {
                let addr = self.string_table.addr;
                self.perform_store(d[0], addr)
            }
            0x141 => {
                self.string_table = StringTable::build(&self.image, l[0])?;
                Ok(())
            }
            // getiosys / setiosys
            0x148 => {
                let mode = self.output_system.number();
                let rock = self.filter_address;
                self.perform_store(d[0], mode)?;
                self.perform_store(d[1], rock)
            }
            0x149 => {
                self.output_system = IoSystem::from_number(l[0]).ok_or_else(|| {
                    TerpError::fault(format!("unrecognized I/O system {}", l[0]))
                })?;
                self.filter_address = l[1];
                Ok(())
            }
            _ => Err(TerpError::fault(format!("opcode {num:#x} has no handler"))),
        }
    }

    /// Emit one character from code mode.
    fn stream_char(&mut self, ch: u32) -> Result<()> {
        match self.output_system {
            IoSystem::Null => Ok(()),
            IoSystem::Channels | IoSystem::Glk => {
                self.channel_char(ch);
                Ok(())
            }
            IoSystem::Filter => {
                // One function call per character; the result is
                // ignored and execution resumes after the opcode.
                self.push_call_stub(0, 0)?;
                let filter = self.filter_address;
                self.initiate_call(filter, &[ch])
            }
        }
    }

    /// Route a character to the channel layer.
    pub(crate) fn channel_char(&mut self, ch: u32) {
        let c = char::from_u32(ch).unwrap_or(char::REPLACEMENT_CHARACTER);
        match self.output_system {
            IoSystem::Channels => self.out.write_char(c),
            IoSystem::Glk => self.out.write_char_to(ChannelId::MAIN, c),
            _ => {}
        }
    }

    /// Start printing the string at `addr`. The caller has pushed the
    /// stub that says where to resume when the string finishes.
    pub(crate) fn begin_string(&mut self, addr: u32) -> Result<()> {
        let tag = self.image.read_u8(addr)?;
        match tag {
            TYPE_CSTRING => {
                self.exec_mode = ExecMode::CString;
                self.set_pc(addr + 1);
            }
            TYPE_UNICODE => {
                // Tag byte, then three bytes of padding.
                self.exec_mode = ExecMode::UnicodeString;
                self.set_pc(addr + 4);
            }
            TYPE_COMPRESSED => {
                if !self.string_table.is_set() {
                    return Err(TerpError::fault(
                        "compressed string printed with no decoding table set".to_string(),
                    ));
                }
                self.exec_mode = ExecMode::CompressedString;
                self.set_pc(addr + 1);
                self.printing_digit = 0;
            }
            _ => {
                return Err(TerpError::fault(format!(
                    "streamstr target {addr:#010x} has type {tag:#04x}, not a string"
                )))
            }
        }
        Ok(())
    }

    /// Emit one character while inside a string. In filter mode this
    /// pushes a resume stub for the current position and calls out.
    fn emit_string_char(&mut self, ch: u32, resume_type: u32, resume_addr: u32) -> Result<()> {
        match self.output_system {
            IoSystem::Null => Ok(()),
            IoSystem::Channels | IoSystem::Glk => {
                self.channel_char(ch);
                Ok(())
            }
            IoSystem::Filter => {
                self.push_call_stub(resume_type, resume_addr)?;
                let filter = self.filter_address;
                self.initiate_call(filter, &[ch])
            }
        }
    }

    pub(crate) fn step_cstring(&mut self) -> Result<()> {
        let ch = self.image.read_u8(self.pc())?;
        if ch == 0 {
            return self.pop_stub_and_store(0);
        }
        self.set_pc(self.pc() + 1);
        self.emit_string_char(ch as u32, STUB_RESUME_CSTR, 0)
    }

    pub(crate) fn step_unicode_string(&mut self) -> Result<()> {
        let ch = self.image.read_u32(self.pc())?;
        if ch == 0 {
            return self.pop_stub_and_store(0);
        }
        self.set_pc(self.pc() + 4);
        self.emit_string_char(ch, STUB_RESUME_UNISTR, 0)
    }

    /// While printing a number, pc holds the value itself and
    /// printing_digit the position within its decimal rendering.
    pub(crate) fn step_number(&mut self) -> Result<()> {
        let rendered = (self.pc() as i32).to_string();
        let digits = rendered.as_bytes();
        let pos = self.printing_digit as usize;
        if pos >= digits.len() {
            return self.pop_stub_and_store(0);
        }
        let ch = digits[pos] as u32;
        self.printing_digit = (pos + 1) as u32;
        let resume_addr = self.printing_digit;
        self.emit_string_char(ch, STUB_RESUME_NUMBER, resume_addr)
    }

    /// Decode one terminal node of the compressed string at pc; the bit
    /// position within the current byte rides in printing_digit.
    pub(crate) fn step_compressed(&mut self) -> Result<()> {
        let mut pc = self.pc();
        let mut bit = self.printing_digit;
        let op = strings::next_compressed_op(&self.image, &self.string_table, &mut pc, &mut bit)?;
        self.set_pc(pc);
        self.printing_digit = bit;

        match op {
            StrOp::Done => self.pop_stub_and_store(0),
            StrOp::Char(ch) => {
                let resume_addr = self.printing_digit;
                self.emit_string_char(ch, STUB_RESUME_HUFFSTR, resume_addr)
            }
            StrOp::CString(addr) => {
                let bit = self.printing_digit;
                self.push_call_stub(STUB_RESUME_HUFFSTR, bit)?;
                self.exec_mode = ExecMode::CString;
                self.set_pc(addr);
                Ok(())
            }
            StrOp::UniCString(addr) => {
                let bit = self.printing_digit;
                self.push_call_stub(STUB_RESUME_HUFFSTR, bit)?;
                self.exec_mode = ExecMode::UnicodeString;
                self.set_pc(addr);
                Ok(())
            }
            StrOp::Invoke { addr, args } => {
                let bit = self.printing_digit;
                self.push_call_stub(STUB_RESUME_HUFFSTR, bit)?;
                let tag = self.image.read_u8(addr)?;
                match tag {
                    0xC0 | 0xC1 => self.initiate_call(addr, &args),
                    TYPE_CSTRING | TYPE_UNICODE | TYPE_COMPRESSED => self.begin_string(addr),
                    _ => Err(TerpError::fault(format!(
                        "indirect string node points at {addr:#010x} with type {tag:#04x}"
                    ))),
                }
            }
        }
    }
}
